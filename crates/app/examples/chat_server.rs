//! A pub/sub chat room: every websocket on `/chat` joins the `room` topic and
//! whatever one member sends is published to the others.

use micro_app::App;
use micro_engine::{BackpressurePolicy, CompressOptions, OpCode, WebSocketBehavior};
use tracing::{error, info};

#[derive(Debug, Default)]
struct Member {
    name: String,
}

fn main() {
    let behavior = WebSocketBehavior::<Member>::builder()
        .compression(CompressOptions::SHARED_COMPRESSOR | CompressOptions::SHARED_DECOMPRESSOR)
        .max_backpressure(256 * 1024)
        .backpressure_policy(BackpressurePolicy::DropOldest)
        .upgrade(|res, req, context| {
            let member = Member { name: req.query_value("name").unwrap_or("anonymous").to_string() };
            let key = req.header("sec-websocket-key").unwrap_or_default().to_string();
            let protocol = req.header("sec-websocket-protocol").unwrap_or_default().to_string();
            let extensions = req.header("sec-websocket-extensions").unwrap_or_default().to_string();
            if let Err(e) = res.upgrade(member, &key, &protocol, &extensions, context) {
                error!(cause = %e, "upgrade failed");
            }
        })
        .open(|ws| {
            ws.subscribe("room");
            let joined = format!("{} joined", ws.user_data().name);
            ws.publish("room", joined.as_bytes(), OpCode::Text, true);
        })
        .message(|ws, message, opcode| {
            ws.publish("room", message, opcode, true);
        })
        .subscription(|ws, topic, new_count, old_count| {
            info!(name = %ws.user_data().name, topic, new_count, old_count, "room size changed");
        })
        .close(|ws, code, _reason| {
            info!(name = %ws.user_data().name, code, "left");
        })
        .build();

    let app = App::new().ws("/chat", behavior).listen(9001, |socket| match socket {
        Ok(socket) => info!(port = socket.port(), "start listening"),
        Err(e) => error!(cause = %e, "bind server error"),
    });

    if let Err(e) = app.run() {
        error!(cause = %e, "app stopped with error");
    }
}
