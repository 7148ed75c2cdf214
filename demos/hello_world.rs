use origin_web::{Request, Server, StatusCode};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(|req: &Request| {
            req.set_status(StatusCode::Ok);
            req.set_header("Content-Type", "text/plain");
            req.set_header("Content-Length", "13");
            req.write_buffer(&b"Hello, world\n"[..]);
            req.finish();
            true
        })
        .build()
        .launch()
        .await;
}
