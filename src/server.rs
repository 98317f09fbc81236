use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::handshake::accept_async_with_config;
use crate::session::{
    generate_session_id, run_session_with_shutdown, wait_for_shutdown, SessionContext,
};
use crate::split::{WSReader, WSWriter};
use crate::Role;
use log::{error, info};
use std::future::Future;
use std::io;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Serves WebSocket sessions on `addr` until the process dies. Each accepted
/// connection is upgraded and handed to its own copy of the handler on a
/// dedicated task.
pub async fn serve<H, F>(
    addr: &str,
    config: Option<WebSocketConfig>,
    handler: H,
) -> Result<(), io::Error>
where
    H: Fn(WSReader, WSWriter, SessionContext) -> F + Clone + Send + 'static,
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    // No sender is kept, so the shutdown signal can never fire.
    let (_, rx) = watch::channel(false);
    serve_with_shutdown(addr, config, handler, rx).await
}

/// [`serve`] with a graceful-shutdown watch: when it flips to true the accept
/// loop stops, and every in-flight session closes with `GoingAway`.
pub async fn serve_with_shutdown<H, F>(
    addr: &str,
    config: Option<WebSocketConfig>,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), io::Error>
where
    H: Fn(WSReader, WSWriter, SessionContext) -> F + Clone + Send + 'static,
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("shutdown signal received, no longer accepting");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(accept_error) => {
                error!("failed to accept connection: {}", accept_error);
                continue;
            }
        };

        let config = config.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match accept_async_with_config(stream, config).await {
                Ok(connection) => {
                    let context = SessionContext {
                        id: generate_session_id(),
                        role: Role::Server,
                        protocol: connection.protocol().map(str::to_string),
                    };
                    info!("session {} connected from {}", context.id, peer);
                    run_session_with_shutdown(connection, context, handler, shutdown).await;
                }
                Err(handshake_error) => {
                    error!("handshake with {} failed: {}", peer, handshake_error);
                }
            }
        });
    }
}
