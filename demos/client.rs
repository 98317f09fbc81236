use futures::StreamExt;
use socket_loom::handshake::connect_async;
use tokio::select;
use tokio::time::{interval, Duration};

async fn handle_connection(addr: &str) {
    match connect_async(addr).await {
        Ok(mut ws_connection) => {
            let mut ticker = interval(Duration::from_secs(5));
            // close the connection after a few echoes
            let mut counter = 0;

            loop {
                select! {
                    Some(result) = ws_connection.next() => {
                        match result {
                            Ok(message) => {
                                println!("Received message: {}", message.as_text().unwrap_or_default());
                                counter += 1;
                                if counter >= 3 {
                                    if ws_connection.close_connection().await.is_err() {
                                        eprintln!("Error occurred when closing connection");
                                    }
                                    break;
                                }
                            }
                            Err(err) => {
                                eprintln!("Received error from the stream: {}", err);
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if ws_connection.send_as_text("ping me back".to_string()).await.is_err() {
                            eprintln!("Failed to send message");
                            break;
                        }
                    }
                }
            }
        }
        Err(err) => eprintln!("Error when performing handshake: {}", err),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    handle_connection("ws://127.0.0.1:9002").await;
}
