use crate::close::CloseCode;
use crate::connection::WSConnection;
use crate::error::Error;
use crate::split::{WSReader, WSWriter};
use crate::Role;
use log::{debug, error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use tokio::sync::watch;
use uuid::Uuid;

pub type ID = Uuid;

// Random v8 UUIDs, one per accepted connection, for log correlation
pub fn generate_session_id() -> Uuid {
    let mut rng = StdRng::from_rng(&mut rand::thread_rng());
    let buf = rng.random::<[u8; 16]>();

    Uuid::new_v8(buf)
}

/// What a handler learns about the connection it is serving.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: ID,
    pub role: Role,
    /// The subprotocol agreed during the handshake, if any.
    pub protocol: Option<String>,
}

/// Runs one connection to completion: the user handler gets the inbound
/// stream, the outbound writer and the context, and the session translates
/// however the handler ends into the right close handshake.
pub async fn run_session<H, F>(connection: WSConnection, context: SessionContext, handler: H)
where
    H: FnOnce(WSReader, WSWriter, SessionContext) -> F,
    F: Future<Output = Result<(), Error>>,
{
    let (_, rx) = watch::channel(false);
    run_session_with_shutdown(connection, context, handler, rx).await
}

/// [`run_session`] with a graceful-shutdown signal. When the watch flips, the
/// handler is cancelled first, then the connection closes with `GoingAway`
/// (server) or `NormalClosure` (client) and waits out the close handshake.
pub async fn run_session_with_shutdown<H, F>(
    connection: WSConnection,
    context: SessionContext,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) where
    H: FnOnce(WSReader, WSWriter, SessionContext) -> F,
    F: Future<Output = Result<(), Error>>,
{
    let session_id = context.id;
    let role = context.role;
    let (reader, writer) = connection.split();
    let mut close_writer = writer.clone();

    let handler_future = handler(reader, writer, context);
    tokio::pin!(handler_future);

    let outcome = tokio::select! {
        result = &mut handler_future => Some(result),
        _ = wait_for_shutdown(&mut shutdown) => None,
    };

    match outcome {
        Some(Ok(())) => {
            debug!("session {} finished, closing normally", session_id);
            if let Err(close_error) = close_writer
                .close(CloseCode::NormalClosure, String::new())
                .await
            {
                debug!("session {} close failed: {}", session_id, close_error);
            }
        }
        Some(Err(handler_error)) => {
            // Handler failures never propagate past the session; they turn
            // into a close code (server) or a torn-down input (client).
            error!("session {} handler failed: {}", session_id, handler_error);
            let result = match role {
                Role::Server => {
                    close_writer
                        .close(CloseCode::InternalServerError, String::new())
                        .await
                }
                Role::Client => close_writer.shutdown_transport().await,
            };
            if let Err(close_error) = result {
                debug!("session {} teardown failed: {}", session_id, close_error);
            }
        }
        None => {
            debug!("session {} interrupted by shutdown signal", session_id);
            let code = match role {
                Role::Server => CloseCode::GoingAway,
                Role::Client => CloseCode::NormalClosure,
            };
            if let Err(close_error) = close_writer.close(code, String::new()).await {
                debug!("session {} close failed: {}", session_id, close_error);
            }
        }
    }
}

/// Resolves once the shutdown flag flips to true. A sender that goes away
/// without ever signalling leaves the future pending forever.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
