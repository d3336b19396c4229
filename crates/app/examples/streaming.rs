//! Backpressure aware responses.
//!
//! `/large` streams a big body with `try_end`, resuming from the write offset
//! whenever the socket drains. `/slow` is answered from a worker thread that
//! resolves the response token back on the loop.

use std::rc::Rc;
use std::time::Duration;

use micro_app::App;
use micro_engine::HttpResponse;
use tracing::{debug, error, info};

const LARGE_BODY: usize = 16 * 1024 * 1024;

fn stream(res: &HttpResponse, body: &[u8]) -> bool {
    let total = body.len() as u64;
    let offset = match res.write_offset() {
        Ok(offset) => usize::try_from(offset).unwrap_or(body.len()),
        Err(e) => {
            debug!(cause = %e, "response is gone");
            return false;
        }
    };
    match res.try_end(&body[offset..], total) {
        Ok((_, done)) => !done,
        Err(e) => {
            error!(cause = %e, "can't write body");
            false
        }
    }
}

fn main() {
    let body: Rc<[u8]> = Rc::from(vec![b'x'; LARGE_BODY]);
    let app = App::new();
    let handle = app.loop_handle();

    let app = app
        .get("/large", move |res, _req| {
            if !stream(&res, &body) {
                return;
            }
            let body = Rc::clone(&body);
            let subscribed = res
                .on_aborted(|| info!("client went away"))
                .and_then(|res| res.on_writable(move |res, _offset| stream(res, &body)));
            if let Err(e) = subscribed {
                error!(cause = %e, "can't wait for the socket to drain");
            }
        })
        .get("/slow", move |res, _req| {
            let token = match res.token() {
                Ok(token) => token,
                Err(e) => {
                    error!(cause = %e, "no token");
                    return;
                }
            };
            let handle = handle.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                let deferred = handle.defer(move |loop_ref| match loop_ref.response(token) {
                    Ok(res) => {
                        if let Err(e) = res.end(b"finally", false) {
                            error!(cause = %e, "can't respond");
                        }
                    }
                    Err(e) => debug!(cause = %e, "client went away meanwhile"),
                });
                if let Err(e) = deferred {
                    error!(cause = %e, "loop stopped");
                }
            });
        })
        .listen(3000, |socket| match socket {
            Ok(socket) => info!(port = socket.port(), "start listening"),
            Err(e) => error!(cause = %e, "bind server error"),
        });

    if let Err(e) = app.run() {
        error!(cause = %e, "app stopped with error");
    }
}
