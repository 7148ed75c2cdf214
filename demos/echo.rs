//! Streams the request body straight back, chunk by chunk.

use origin_web::{Request, Server, StatusCode};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(|req: &Request| {
            req.set_status(StatusCode::Ok);
            req.set_header("Content-Type", "application/octet-stream");
            if let Some(length) = req.content_length() {
                req.set_header("Content-Length", &length.to_string());
            }

            let reply = req.clone();
            req.read_body(move |chunk| {
                if chunk.is_empty() {
                    reply.finish();
                } else {
                    reply.write_buffer(chunk.to_vec());
                }
            });
            true
        })
        .build()
        .launch()
        .await;
}
