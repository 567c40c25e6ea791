//! Gamewire Server
//!
//! Stand-alone host for the embeddable server: a few demo routes plus static
//! files, driven at the configured update rate.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use gamewire::config::ServerConfig;
use gamewire::http::{WebsocketConnection, WebsocketHandler};
use gamewire::protocol::Message;
use gamewire::{Reply, Server, Updatable, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Gamewire Server v{}", VERSION);

    // Load configuration
    let config = ServerConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );
    let update_rate = config.update_rate();

    let mut server = Server::with_config(config).context("Failed to start server")?;
    register_routes(&server);
    info!("Server listening on port {}", server.local_port());

    let mut interval = tokio::time::interval(update_rate);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_update = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                Updatable::update(&mut server, now - last_update);
                last_update = now;
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    server.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize the logging system
///
/// `GAMEWIRE_LOG_FORMAT=json` switches to one JSON object per line.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gamewire=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let json = std::env::var("GAMEWIRE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn register_routes(server: &Server) {
    server.add_url_handler("/ping", |_| "pong");

    let handle = server.handle();
    server.add_url_handler("/status", move |_| {
        Reply::json(&serde_json::json!({
            "version": VERSION,
            "connections": handle.connection_count(),
            "websockets": handle.websocket_count(),
        }))
    });

    // Every chat message goes to everyone on /chat
    let handle = server.handle();
    server.add_simple_websocket_handler("/chat", move |message: &Message| {
        handle.broadcast_to_websockets("/chat", &message.text());
    });

    server.add_advanced_websocket_handler("/echo", EchoHandler::default);
}

/// Echoes messages back to the sender, numbered per connection
#[derive(Default)]
struct EchoHandler {
    received: u64,
}

impl WebsocketHandler for EchoHandler {
    fn on_connect(&mut self, connection: &WebsocketConnection) {
        info!(
            connection_id = connection.id(),
            peer = ?connection.peer_addr(),
            "Echo client connected"
        );
    }

    fn on_message(&mut self, connection: &WebsocketConnection, message: &Message) {
        self.received += 1;
        if message.is_text() {
            connection.send(&format!("{}: {}", self.received, message.text()));
        } else {
            connection.send_binary(&message.payload);
        }
    }

    fn on_disconnect(&mut self, connection: &WebsocketConnection) {
        debug!(
            connection_id = connection.id(),
            messages = self.received,
            "Echo client disconnected"
        );
    }
}
