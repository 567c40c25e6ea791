//! End-to-end tests for the server and both clients over loopback
//!
//! The clients are blocking, so HTTP requests run on a helper thread while
//! the test thread drives `Server::update()`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use gamewire::http::{WebsocketConnection, WebsocketHandler};
use gamewire::protocol::Message;
use gamewire::{HttpClient, Reply, Scheme, Server, ServerConfig, WebsocketClient};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        poll_interval_ms: 10,
        ..ServerConfig::default()
    }
}

/// Drive the server until `work` finishes, then return its result
fn pump_while<T>(server: &mut Server, work: JoinHandle<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    while !work.is_finished() && Instant::now() < deadline {
        server.update();
        thread::sleep(Duration::from_millis(2));
    }
    work.join().expect("client thread panicked")
}

/// Drive the server until `done` holds
fn pump_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        server.update();
        if done(server) {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached before timeout");
}

fn get(server: &mut Server, path: &'static str) -> gamewire::protocol::Response {
    let port = server.local_port();
    let work = thread::spawn(move || HttpClient::new("127.0.0.1", port, Scheme::Plain).get(path));
    pump_while(server, work)
}

fn ws_connect(server: &Server, path: &str) -> WebsocketClient {
    let mut client = WebsocketClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}{}", server.local_port(), path))
        .unwrap();
    assert!(client.wait_until_connected(TIMEOUT), "handshake failed");
    client
}

#[test]
fn test_ping_returns_pong() {
    let mut server = Server::with_config(test_config()).unwrap();
    server.add_url_handler("/ping", |_| "pong");

    let response = get(&mut server, "/ping");
    assert!(response.success);
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "pong");
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
}

#[test]
fn test_handler_sees_query_and_form_body() {
    let mut server = Server::with_config(test_config()).unwrap();
    server.add_url_handler("/form", |request| {
        Reply::from(format!(
            "{}|{}|{}",
            request.method,
            request.query.get("q").cloned().unwrap_or_default(),
            request.body_text()
        ))
        .with_mimetype("text/plain")
    });

    let port = server.local_port();
    let work = thread::spawn(move || {
        let mut client = HttpClient::new("127.0.0.1", port, Scheme::Plain);
        let first = client.post_form("/form?q=a%20b", &[("name", "x y"), ("n", "1")]);
        let second = client.get("/form");
        (first, second)
    });
    let (first, second) = pump_while(&mut server, work);

    assert!(first.success);
    assert_eq!(first.text(), "POST|a b|name=x+y&n=1");
    assert_eq!(first.header("content-type"), Some("text/plain"));
    // Second request reuses the same connection
    assert_eq!(second.text(), "GET||");
}

#[test]
fn test_unknown_path_is_404() {
    let mut server = Server::with_config(test_config()).unwrap();

    let response = get(&mut server, "/missing");
    assert!(response.success);
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "404 - File not found.");
}

#[test]
fn test_static_files() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "<p>home</p>").unwrap();
    std::fs::write(root.path().join("style.css"), "p {}").unwrap();

    let mut server = Server::with_config(test_config()).unwrap();
    server.set_static_file_path(root.path());

    let index = get(&mut server, "/");
    assert_eq!(index.status, 200);
    assert_eq!(index.text(), "<p>home</p>");
    assert_eq!(index.header("content-type"), Some("text/html"));

    let css = get(&mut server, "/style.css");
    assert_eq!(css.text(), "p {}");
    assert_eq!(css.header("content-type"), Some("text/css"));

    let escape = get(&mut server, "/../index.html");
    assert_eq!(escape.status, 404);
}

#[test]
fn test_oversized_content_length_drops_only_that_connection() {
    use std::io::{Read, Write};

    let mut server = Server::with_config(test_config()).unwrap();
    server.add_url_handler("/ping", |_| "pong");

    let mut hostile = std::net::TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
    hostile
        .write_all(b"POST /ping HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
        .unwrap();
    hostile.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(hostile.read(&mut buf).unwrap(), 0);

    let response = get(&mut server, "/ping");
    assert!(response.success);
    assert_eq!(response.text(), "pong");
}

#[test]
fn test_handler_kinds_are_exclusive() {
    let mut server = Server::with_config(test_config()).unwrap();
    server.add_url_handler("/x", |_| "http");
    server.add_simple_websocket_handler("/x", |_: &Message| {});

    let response = get(&mut server, "/x");
    assert_eq!(response.status, 404);
}

#[test]
fn test_idle_connection_removed_without_handler() {
    let config = ServerConfig {
        idle_timeout_ms: 200,
        ..test_config()
    };
    let mut server = Server::with_config(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    server.add_url_handler("/", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        ""
    });

    let _idle = std::net::TcpStream::connect(("127.0.0.1", server.local_port())).unwrap();
    pump_until(&mut server, |server| server.connection_count() == 1);
    pump_until(&mut server, |server| server.connection_count() == 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_broadcast_reaches_every_client() {
    let mut server = Server::with_config(test_config()).unwrap();
    server.add_simple_websocket_handler("/chat", |_: &Message| {});

    let mut a = ws_connect(&server, "/chat");
    let mut b = ws_connect(&server, "/chat");
    server.update();

    assert_eq!(server.broadcast_to_websockets("/chat", "x"), 2);
    assert_eq!(server.broadcast_to_websockets("/other", "x"), 0);

    assert_eq!(a.receive_timeout(TIMEOUT).unwrap().text(), "x");
    assert_eq!(b.receive_timeout(TIMEOUT).unwrap().text(), "x");
}

#[test]
fn test_simple_handler_receives_messages() {
    let mut server = Server::with_config(test_config()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server.add_simple_websocket_handler("/chat", move |message: &Message| {
        sink.lock().push(message.text());
    });

    let mut client = ws_connect(&server, "/chat");
    assert!(client.send_text("one"));
    assert!(client.send_text("two"));

    pump_until(&mut server, |_| seen.lock().len() == 2);
    assert_eq!(*seen.lock(), vec!["one".to_string(), "two".to_string()]);
}

struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl WebsocketHandler for Recorder {
    fn on_connect(&mut self, _connection: &WebsocketConnection) {
        self.log.lock().push("connect".into());
    }

    fn on_message(&mut self, connection: &WebsocketConnection, message: &Message) {
        self.log.lock().push(format!("message:{}", message.text()));
        connection.send(&message.text().to_uppercase());
    }

    fn on_disconnect(&mut self, _connection: &WebsocketConnection) {
        self.log.lock().push("disconnect".into());
    }
}

#[test]
fn test_advanced_handler_lifecycle() {
    let mut server = Server::with_config(test_config()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let shared = log.clone();
    server.add_advanced_websocket_handler("/echo", move || Recorder {
        log: shared.clone(),
    });

    let mut client = ws_connect(&server, "/echo");
    assert!(client.send_text("hello"));

    let mut reply = None;
    pump_until(&mut server, |_| {
        reply = client.receive();
        reply.is_some()
    });
    assert_eq!(reply.unwrap().text(), "HELLO");

    client.close();
    pump_until(&mut server, |_| log.lock().len() == 3);
    assert_eq!(
        *log.lock(),
        vec![
            "connect".to_string(),
            "message:hello".to_string(),
            "disconnect".to_string()
        ]
    );
}

#[test]
fn test_handler_can_close_connection() {
    let mut server = Server::with_config(test_config()).unwrap();

    struct Kicker;
    impl WebsocketHandler for Kicker {
        fn on_message(&mut self, connection: &WebsocketConnection, _message: &Message) {
            connection.close();
        }
    }
    server.add_advanced_websocket_handler("/kick", || Kicker);

    let mut client = ws_connect(&server, "/kick");
    assert!(client.send_text("bye"));
    pump_until(&mut server, |server| server.connection_count() == 0);

    let deadline = Instant::now() + TIMEOUT;
    while client.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!client.is_connected());
}

#[test]
fn test_upgrade_without_handler_fails() {
    let server = Server::with_config(test_config()).unwrap();

    let mut client = WebsocketClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/nothing", server.local_port()))
        .unwrap();
    assert!(!client.wait_until_connected(TIMEOUT));
}

#[test]
fn test_idle_websocket_is_pinged_and_kept() {
    let config = ServerConfig {
        idle_timeout_ms: 100,
        ..test_config()
    };
    let mut server = Server::with_config(config).unwrap();
    server.add_simple_websocket_handler("/chat", |_: &Message| {});

    let mut client = ws_connect(&server, "/chat");
    // Keep answering pings for several idle periods
    let deadline = Instant::now() + Duration::from_millis(600);
    while Instant::now() < deadline {
        server.update();
        client.receive();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);
}
