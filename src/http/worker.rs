//! Server I/O thread
//!
//! One loop per server: wait on the selector (bounded by the poll interval),
//! service every connection, drop finished ones, accept new ones, and re-open
//! the listener if it died. Completed work leaves through the event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::connection::{Connection, Routing, ServerEvent};
use super::server::ServerShared;
use crate::config::ServerConfig;
use crate::net::{Pollable, RawHandle, Selector, TcpListener};
use crate::protocol::websocket::Frame;

pub(crate) struct IoWorker {
    listener: TcpListener,
    listener_handle: Option<RawHandle>,
    port: u16,
    selector: Selector,
    connections: Vec<Connection>,
    shared: Arc<ServerShared>,
    events: UnboundedSender<ServerEvent>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
}

impl IoWorker {
    pub fn new(
        listener: TcpListener,
        port: u16,
        shared: Arc<ServerShared>,
        events: UnboundedSender<ServerEvent>,
        config: ServerConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        let mut selector = Selector::new();
        let listener_handle = listener.poll_handle();
        selector.add(&listener);

        Self {
            listener,
            listener_handle,
            port,
            selector,
            connections: Vec::new(),
            shared,
            events,
            config,
            running,
        }
    }

    /// Run until the server clears the running flag
    pub fn run(mut self) {
        info!(port = self.port, "I/O thread started");

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.selector.wait(self.config.poll_interval()) {
                warn!(error = %e, "Selector wait failed");
            }

            let now = Instant::now();
            self.service_connections(now);
            self.reap();
            self.accept_pending();
            self.ensure_listening();
        }

        for connection in self.connections.drain(..) {
            self.shared.registry.remove(connection.id());
        }
        self.listener.close();
        info!(port = self.port, "I/O thread stopped");
    }

    fn service_connections(&mut self, now: Instant) {
        let routing = Routing {
            handlers: &self.shared.handlers,
            events: &self.events,
            max_request_size: self.config.max_request_size,
        };
        let idle_timeout = self.config.idle_timeout();

        for connection in &mut self.connections {
            if connection.is_finished() {
                continue;
            }
            connection.service(&routing, now);
            if !connection.is_finished() && !connection.check_idle(now, idle_timeout) {
                connection.link().with_socket(|socket| socket.close());
            }
        }
    }

    /// Remove finished connections and report closed WebSockets
    fn reap(&mut self) {
        let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(Connection::is_finished);
        self.connections = live;

        for connection in finished {
            let link = connection.link();
            let path = link.websocket_path();

            if path.is_some() && link.close_requested() {
                link.with_socket(|socket| {
                    socket.send(&Frame::close(None).encode(None));
                    socket.send_send_queue();
                });
            }

            // A closed handle may already have been reused by a live socket
            if let Some(handle) = connection.handle() {
                let reused = self
                    .connections
                    .iter()
                    .any(|live| live.handle() == Some(handle));
                if !reused {
                    self.selector.remove_handle(handle);
                }
            }

            self.shared.registry.remove(connection.id());

            if let Some(path) = path {
                debug!(connection_id = connection.id(), path = %path, "WebSocket closed");
                let _ = self.events.send(ServerEvent::WebsocketClosed {
                    id: connection.id(),
                    path,
                });
            }
        }
    }

    fn accept_pending(&mut self) {
        while let Some(mut socket) = self.listener.accept() {
            socket.set_blocking(false);
            socket.set_nodelay(true);

            let link = self.shared.registry.register(socket);
            let connection = Connection::new(link);
            if let Some(handle) = connection.handle() {
                self.selector.add(&handle);
            }
            self.connections.push(connection);
        }
    }

    fn ensure_listening(&mut self) {
        if self.listener.is_listening() {
            return;
        }

        if let Some(handle) = self.listener_handle.take() {
            self.selector.remove_handle(handle);
        }

        match self.listener.listen(self.port) {
            Ok(()) => {
                self.listener_handle = self.listener.poll_handle();
                self.selector.add(&self.listener);
                info!(port = self.port, "Listener re-opened");
            }
            Err(e) => debug!(port = self.port, error = %e, "Listener re-open failed"),
        }
    }
}
