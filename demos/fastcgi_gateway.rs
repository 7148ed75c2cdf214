//! Routes `/app` to a FastCGI backend (php-fpm, for example), serves a
//! plain page for everything else.
//!
//! Run a backend on 127.0.0.1:9000, then:
//!
//! ```sh
//! cargo run --example fastcgi_gateway
//! curl http://127.0.0.1:8080/app/index.php
//! ```

use origin_web::fastcgi::{FastCgiHandler, SocketSpec};
use origin_web::{Handler, Request, Server, StatusCode};
use tokio::net::TcpListener;

struct AppRouter {
    gateway: FastCgiHandler,
}

impl Handler for AppRouter {
    fn handle(&self, req: &Request) -> bool {
        if !req.path().starts_with(b"/app") {
            return false;
        }
        req.set_document_root("/var/www");
        self.gateway.handle(req)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let spec: SocketSpec = "127.0.0.1:9000".parse().unwrap();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(AppRouter {
            gateway: FastCgiHandler::new(spec),
        })
        .handler(|req: &Request| {
            req.set_status(StatusCode::Ok);
            req.set_header("Content-Type", "text/plain");
            req.set_header("Content-Length", "20");
            req.write_buffer(&b"not a FastCGI route\n"[..]);
            req.finish();
            true
        })
        .build()
        .launch()
        .await;
}
