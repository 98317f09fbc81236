use futures::StreamExt;
use log::*;
use socket_loom::error::Error;
use socket_loom::server::serve;
use socket_loom::session::SessionContext;
use socket_loom::split::{WSReader, WSWriter};

async fn handle_session(
    mut reader: WSReader,
    mut writer: WSWriter,
    context: SessionContext,
) -> Result<(), Error> {
    while let Some(result) = reader.next().await {
        match result {
            Ok(message) => writer.send_message(message).await?,
            Err(err) => {
                error!("session {} stream error: {}", context.id, err);
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let addr = "127.0.0.1:9002";
    info!("Listening on: {}", addr);
    if let Err(err) = serve(addr, None, handle_session).await {
        error!("server failed: {}", err);
    }
}
