use std::fmt;
use std::rc::Rc;

use http::Method;
use micro_engine::{
    EngineError, HttpHandler, HttpRequest, HttpResponse, Loop, LoopHandle, LoopRef, OpCode, UpgradeContext, WebSocketBehavior,
    make_handler,
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::listener::{ListenError, ListenSocket, PendingListener};
use crate::router::Router;
use crate::tls::{SecureContext, SslOptions, TlsError};

const DEFAULT_HOST: &str = "0.0.0.0";

/// Routes, listeners and the loop they run on.
///
/// An app is built on the thread that will run it: register routes, listen,
/// then [`run`](App::run). Other threads talk to a running app through its
/// [`LoopHandle`].
pub struct App {
    config: AppConfig,
    lp: Loop,
    router: Rc<Router>,
    listeners: Vec<PendingListener>,
    tls: Option<SecureContext>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("routes", &self.router.len())
            .field("listeners", &self.listeners)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! method_route {
    ($name:ident, $method:expr) => {
        pub fn $name<F>(self, pattern: &str, handler: F) -> Self
        where
            F: Fn(HttpResponse, &mut HttpRequest<'_>) + 'static,
        {
            self.handler(Some($method), pattern, make_handler(handler))
        }
    };
}

impl App {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let lp = Loop::new(config.engine().clone());
        Self { config, lp, router: Rc::new(Router::new()), listeners: Vec::new(), tls: None }
    }

    /// An app whose listeners all speak TLS.
    pub fn secure(options: &SslOptions) -> Result<Self, TlsError> {
        Self::secure_with_config(options, AppConfig::default())
    }

    pub fn secure_with_config(options: &SslOptions, config: AppConfig) -> Result<Self, TlsError> {
        let context = SecureContext::new(options)?;
        Ok(Self { tls: Some(context), ..Self::with_config(config) })
    }

    method_route!(get, Method::GET);
    method_route!(post, Method::POST);
    method_route!(put, Method::PUT);
    method_route!(options, Method::OPTIONS);
    method_route!(del, Method::DELETE);
    method_route!(patch, Method::PATCH);
    method_route!(head, Method::HEAD);
    method_route!(connect, Method::CONNECT);
    method_route!(trace, Method::TRACE);

    /// A route matching every method.
    pub fn any<F>(self, pattern: &str, handler: F) -> Self
    where
        F: Fn(HttpResponse, &mut HttpRequest<'_>) + 'static,
    {
        self.handler(None, pattern, make_handler(handler))
    }

    pub fn handler<H: HttpHandler + 'static>(self, method: Option<Method>, pattern: &str, handler: H) -> Self {
        self.router.register(method, pattern, handler);
        self
    }

    /// A websocket route: `GET` requests carrying a websocket key are upgraded with `behavior`.
    pub fn ws<U: Default + 'static>(self, pattern: &str, behavior: WebSocketBehavior<U>) -> Self {
        let context = UpgradeContext::new(behavior);
        self.get(pattern, move |res, req| context.handle(res, req))
    }

    /// Listens on all interfaces, see [`listen_on`](App::listen_on).
    pub fn listen<F>(self, port: u16, callback: F) -> Self
    where
        F: FnOnce(Result<ListenSocket, ListenError>),
    {
        self.listen_on(DEFAULT_HOST, port, callback)
    }

    /// Binds right away and reports the outcome to `callback`; accepting starts with [`run`](App::run).
    pub fn listen_on<F>(mut self, host: &str, port: u16, callback: F) -> Self
    where
        F: FnOnce(Result<ListenSocket, ListenError>),
    {
        match PendingListener::bind(host, port) {
            Ok(listener) => {
                let socket = listener.socket().clone();
                self.listeners.push(listener);
                callback(Ok(socket));
            }
            Err(e) => {
                error!(cause = %e, "bind server error");
                callback(Err(e));
            }
        }
        self
    }

    /// Stops every listener, open connections are served until they close.
    pub fn close(&self) {
        self.lp.loop_ref().close();
    }

    /// Publishes to every subscriber of `topic`, returns how many sends were attempted.
    pub fn publish(&self, topic: &str, message: &[u8], opcode: OpCode, compress: bool) -> usize {
        self.lp.loop_ref().publish(topic, message, opcode, compress)
    }

    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.lp.loop_ref().num_subscribers(topic)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.lp.handle()
    }

    pub fn loop_ref(&self) -> LoopRef {
        self.lp.loop_ref()
    }

    /// Runs the loop on the calling thread until no listener and no connection is left.
    pub fn run(self) -> Result<(), EngineError> {
        install_subscriber(self.config.log_level());

        let App { lp, router, listeners, tls, .. } = self;
        let loop_ref = lp.loop_ref();
        let handler: Rc<dyn HttpHandler> = router;

        lp.block_on(async move {
            let accepting: Vec<_> = listeners
                .into_iter()
                .map(|listener| tokio::task::spawn_local(listener.accept_loop(loop_ref.clone(), Rc::clone(&handler), tls.clone())))
                .collect();
            for task in accepting {
                if let Err(e) = task.await {
                    error!(cause = %e, "accept loop failed");
                }
            }

            loop_ref.wait_idle().await;
            info!("no listener and no connection left");
        })
    }
}

fn install_subscriber(level: Option<Level>) {
    let Some(level) = level else {
        return;
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("a global subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::TestCert;
    use indoc::indoc;
    use micro_engine::SendStatus;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread::JoinHandle;
    use tungstenite::protocol::Role;
    use tungstenite::{Message, WebSocket};

    struct Running {
        addr: SocketAddr,
        handle: LoopHandle,
        thread: JoinHandle<()>,
    }

    impl Running {
        fn start<F>(build: F) -> Self
        where
            F: FnOnce() -> App + Send + 'static,
        {
            let (tx, rx) = mpsc::channel();
            let thread = std::thread::spawn(move || {
                let app = build();
                let handle = app.loop_handle();
                app.listen_on("127.0.0.1", 0, move |socket| tx.send((socket.unwrap().local_addr(), handle)).unwrap())
                    .run()
                    .unwrap();
            });
            let (addr, handle) = rx.recv().unwrap();
            Self { addr, handle, thread }
        }

        fn stop(self) {
            self.handle.defer(|loop_ref| loop_ref.close()).unwrap();
            self.thread.join().unwrap();
        }
    }

    fn quiet() -> AppConfig {
        AppConfig::builder().log_level(None).build()
    }

    fn request(addr: SocketAddr, head: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(head.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        request(addr, &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"))
    }

    #[test]
    fn try_end_sends_the_declared_length() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&results);
        let running = Running::start(move || {
            App::with_config(quiet()).get("/hello", move |res, _req| {
                seen.lock().unwrap().push(res.try_end(b"hello", 5).unwrap());
            })
        });

        let response = get(running.addr, "/hello");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Length: 5\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nhello"), "{response}");
        assert_eq!(*results.lock().unwrap(), vec![(true, true)]);

        running.stop();
    }

    #[test]
    fn routes_yield_in_order_and_fall_back_to_404() {
        let running = Running::start(|| {
            App::with_config(quiet())
                .any("/*", |_res, req| req.set_yield(true))
                .get("/users/:id", |res, req| {
                    if req.parameter(0) == Some("me") {
                        req.set_yield(true);
                        return;
                    }
                    let body = format!("user {}", req.parameter_by_name("id").unwrap_or_default());
                    res.end(body.as_bytes(), false).unwrap();
                })
                .get("/users/me", |res, _req| res.end(b"myself", false).unwrap())
                .post("/users/:id", |res, _req| res.end(b"created", false).unwrap())
        });

        assert!(get(running.addr, "/users/42").ends_with("\r\n\r\nuser 42"));
        assert!(get(running.addr, "/users/me").ends_with("\r\n\r\nmyself"));

        let created = request(running.addr, indoc! {"
            POST /users/7 HTTP/1.1
            Content-Length: 0
            Connection: close

        "});
        assert!(created.ends_with("\r\n\r\ncreated"), "{created}");

        let missing = get(running.addr, "/nothing/here");
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"), "{missing}");
        assert!(missing.contains("Content-Length: 0\r\n"), "{missing}");

        running.stop();
    }

    #[test]
    fn websocket_echo() {
        let running = Running::start(|| {
            let behavior = WebSocketBehavior::<()>::builder()
                .message(|ws, message, _opcode| {
                    if message == b"ping" {
                        assert_eq!(ws.send(b"pong", OpCode::Text), SendStatus::Success);
                    }
                })
                .build();
            let context = UpgradeContext::new(behavior);
            App::with_config(quiet()).get("/echo", move |res, req| {
                let key = req.header("sec-websocket-key").unwrap_or_default().to_string();
                res.upgrade((), &key, "", "", &context).unwrap();
            })
        });

        let mut stream = TcpStream::connect(running.addr).unwrap();
        stream
            .write_all(b"GET /echo HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n")
            .unwrap();

        // read the 101 head byte by byte so no frame bytes are consumed
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
        assert!(head.contains(&format!("Sec-WebSocket-Accept: {}\r\n", micro_engine::websocket::accept_key("k"))), "{head}");

        let mut ws = WebSocket::from_raw_socket(stream, Role::Client, None);
        ws.send(Message::text("ping")).unwrap();
        assert_eq!(ws.read().unwrap(), Message::text("pong"));
        drop(ws);

        running.stop();
    }

    #[test]
    fn websocket_route_with_a_real_client() {
        let running = Running::start(|| {
            let behavior = WebSocketBehavior::<String>::builder()
                .upgrade(|res, req, context| {
                    let name = req.query_value("name").unwrap_or("anonymous").to_string();
                    let key = req.header("sec-websocket-key").unwrap_or_default().to_string();
                    res.upgrade(name, &key, "", "", context).unwrap();
                })
                .open(|ws| {
                    ws.subscribe("lobby");
                })
                .message(|ws, message, opcode| {
                    let greeting = format!("{}: {}", ws.user_data(), String::from_utf8_lossy(message));
                    ws.publish("lobby", greeting.as_bytes(), opcode, false);
                    ws.send(greeting.as_bytes(), opcode);
                })
                .build();
            App::with_config(quiet()).ws("/chat", behavior)
        });

        let stream = TcpStream::connect(running.addr).unwrap();
        let url = format!("ws://{}/chat?name=ada", running.addr);
        let (mut ws, response) = tungstenite::client::client(url.as_str(), stream).unwrap();
        assert_eq!(response.status(), 101);

        ws.send(Message::text("hi")).unwrap();
        assert_eq!(ws.read().unwrap(), Message::text("ada: hi"));
        drop(ws);

        // a plain GET on the websocket route has no key and is yielded to the 404 fallback
        assert!(get(running.addr, "/chat").starts_with("HTTP/1.1 404 Not Found\r\n"));

        running.stop();
    }

    #[test]
    fn publish_from_another_thread() {
        let running = Running::start(|| {
            let behavior = WebSocketBehavior::<()>::builder()
                .open(|ws| {
                    ws.subscribe("news");
                })
                .build();
            App::with_config(quiet()).ws("/news", behavior)
        });

        let stream = TcpStream::connect(running.addr).unwrap();
        let (mut ws, _) = tungstenite::client::client(format!("ws://{}/news", running.addr).as_str(), stream).unwrap();

        // the subscription happens on open, retry until the subscriber is registered
        let (tx, rx) = mpsc::channel();
        loop {
            let tx = tx.clone();
            running
                .handle
                .defer(move |loop_ref| {
                    tx.send(loop_ref.publish("news", b"extra", OpCode::Text, false)).unwrap();
                })
                .unwrap();
            if rx.recv().unwrap() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(ws.read().unwrap(), Message::text("extra"));
        drop(ws);

        running.stop();
    }

    #[test]
    fn serves_over_tls() {
        let cert = TestCert::generate();
        let options = cert.options();
        let running = Running::start(move || {
            App::secure_with_config(&options, quiet())
                .unwrap()
                .get("/secure", |res, _req| res.end(b"encrypted", false).unwrap())
        });

        let mut roots = rustls::RootCertStore::empty();
        for der in rustls_pemfile::certs(&mut cert.cert_pem.as_bytes()) {
            roots.add(der.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let connection = rustls::ClientConnection::new(Arc::new(config), server_name).unwrap();
        let mut stream = rustls::StreamOwned::new(connection, TcpStream::connect(running.addr).unwrap());

        stream.write_all(b"GET /secure HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nencrypted"), "{response}");
        drop(stream);

        running.stop();
    }

    #[test]
    fn listen_reports_a_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut outcome = None;
        let app = App::with_config(quiet()).listen_on("127.0.0.1", port, |result| outcome = Some(result.is_err()));
        assert_eq!(outcome, Some(true));
        assert_eq!(app.listeners.len(), 0);
    }
}
