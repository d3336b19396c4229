use micro_app::App;
use tracing::{error, info};

fn main() {
    let app = App::new()
        .get("/", |res, _req| {
            if let Err(e) = res.end(b"hello world", false) {
                error!(cause = %e, "can't respond");
            }
        })
        .get("/hello/:name", |res, req| {
            let body = format!("hello {}", req.parameter_by_name("name").unwrap_or("world"));
            if let Err(e) = res.write_header("Content-Type", "text/plain").and_then(|res| res.end(body.as_bytes(), false)) {
                error!(cause = %e, "can't respond");
            }
        })
        .listen(3000, |socket| match socket {
            Ok(socket) => info!(port = socket.port(), "start listening"),
            Err(e) => error!(cause = %e, "bind server error"),
        });

    if let Err(e) = app.run() {
        error!(cause = %e, "app stopped with error");
    }
}
