//! WebSocket server
//!
//! Thread model: one accept thread polling a non-blocking listener against
//! the stopping flag, one worker thread per connection for the lifetime of
//! that connection, one message-processor thread draining the broadcast
//! queue, and one monitor thread driving `memory_update` notifications for
//! per-connection subscriptions.
//!
//! Each connection has a serialized send path (the writer mutex). Broadcasts
//! iterate the connection set under its mutex and dispatch into each peer's
//! send path; that ordering (set lock, then send lock) is the only one used.
//!
//! The listener binds to the loopback interface only: any connected client
//! has full in-process authority.

use crate::engine::Engine;
use crate::router::{ClientSession, CommandRouter, RequestContext};
use crate::ws::frame::{self, Opcode};
use crate::ws::handshake;
use parking_lot::Mutex;
use spyglass_common::wire::{bytes_to_string, format_address};
use spyglass_common::ValueType;
use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Compile-time port of the engine endpoint
pub const SERVER_PORT: u16 = 8765;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const BROADCAST_POLL: Duration = Duration::from_millis(100);
const WATCH_POLL: Duration = Duration::from_millis(100);

/// The mandatory loopback endpoint.
pub fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], SERVER_PORT))
}

struct WatchEntry {
    value_type: ValueType,
    last: Option<Vec<u8>>,
}

/// A live WebSocket peer with a serialized send path.
pub struct Connection {
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    open: AtomicBool,
    watches: Mutex<HashMap<usize, WatchEntry>>,
}

impl Connection {
    fn new(peer: SocketAddr, writer: TcpStream) -> Self {
        Self {
            peer,
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        self.send_raw(&frame::encode_frame(opcode, payload))
    }

    fn send_raw(&self, data: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut writer = self.writer.lock();
        let ok = writer.write_all(data).and_then(|_| writer.flush()).is_ok();
        if !ok {
            self.open.store(false, Ordering::SeqCst);
        }
        ok
    }

    /// Shut the socket down; unblocks the connection thread's read.
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
    }
}

impl ClientSession for Connection {
    fn watch(&self, address: usize, value_type: ValueType) {
        self.watches.lock().insert(
            address,
            WatchEntry {
                value_type,
                last: None,
            },
        );
    }

    fn unwatch(&self, address: usize) -> bool {
        self.watches.lock().remove(&address).is_some()
    }
}

struct ServerInner {
    engine: Arc<Engine>,
    router: Arc<CommandRouter>,
    connections: Mutex<Vec<Arc<Connection>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
    broadcast_tx: Mutex<Option<mpsc::Sender<String>>>,
    local_addr: SocketAddr,
}

pub struct WebSocketServer {
    inner: Arc<ServerInner>,
}

impl WebSocketServer {
    /// Bind and start all server threads.
    pub fn start(
        engine: Arc<Engine>,
        router: Arc<CommandRouter>,
        addr: SocketAddr,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (tx, rx) = mpsc::channel::<String>();

        let inner = Arc::new(ServerInner {
            engine,
            router,
            connections: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            broadcast_tx: Mutex::new(Some(tx)),
            local_addr,
        });

        info!(target: "spyglass_agent::server", address = %local_addr, "server listening");

        let accept_inner = Arc::clone(&inner);
        let accept = std::thread::spawn(move || accept_loop(accept_inner, listener));

        let processor_inner = Arc::clone(&inner);
        let processor = std::thread::spawn(move || broadcast_loop(processor_inner, rx));

        let monitor_inner = Arc::clone(&inner);
        let monitor = std::thread::spawn(move || watch_loop(monitor_inner));

        {
            let mut threads = inner.threads.lock();
            threads.push(accept);
            threads.push(processor);
            threads.push(monitor);
        }

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Push an unsolicited frame to every connected client.
    pub fn broadcast(&self, text: &str) {
        self.inner.broadcast(text);
    }

    /// Graceful shutdown: stop accepting, shut every peer socket down to
    /// unblock its reader, then join all threads.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "spyglass_agent::server", "server stopping");

        *self.inner.broadcast_tx.lock() = None;

        for connection in self.inner.connections.lock().iter() {
            connection.close();
        }

        let threads: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        self.inner.connections.lock().clear();
        info!(target: "spyglass_agent::server", "server stopped");
    }
}

impl ServerInner {
    fn broadcast(&self, text: &str) {
        let connections = self.connections.lock();
        for connection in connections.iter() {
            connection.send_text(text);
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.broadcast_tx.lock().clone()
    }

    fn remove_connection(&self, target: &Arc<Connection>) {
        self.connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, target));
    }
}

fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    while !inner.stopping.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(target: "spyglass_agent::server", peer = %peer, "incoming connection");
                stream.set_nodelay(true).ok();
                stream.set_nonblocking(false).ok();

                let conn_inner = Arc::clone(&inner);
                let handle = std::thread::spawn(move || run_connection(conn_inner, stream, peer));
                inner.threads.lock().push(handle);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(target: "spyglass_agent::server", error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn run_connection(inner: Arc<ServerInner>, mut stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = handshake::accept(&mut stream) {
        debug!(target: "spyglass_agent::server", peer = %peer, error = %e, "handshake rejected");
        return;
    }

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!(target: "spyglass_agent::server", peer = %peer, error = %e, "socket clone failed");
            return;
        }
    };

    let connection = Arc::new(Connection::new(peer, writer));
    inner.connections.lock().push(Arc::clone(&connection));
    info!(target: "spyglass_agent::server", peer = %peer, "client connected");

    while !inner.stopping.load(Ordering::SeqCst) && connection.is_open() {
        let frame = match frame::read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "spyglass_agent::server", peer = %peer, error = %e, "read failed");
                break;
            }
        };

        match frame.opcode {
            Opcode::Text => {
                if !frame.fin {
                    // Fragment reassembly is not implemented; refuse politely
                    connection.send_raw(&frame::encode_close(
                        frame::CLOSE_TOO_BIG,
                        "fragmented messages not supported",
                    ));
                    break;
                }
                let text = String::from_utf8_lossy(&frame.payload);
                let sender = inner.sender();
                let ctx = RequestContext {
                    session: Some(connection.as_ref()),
                    broadcast: sender.as_ref(),
                };
                let response = inner.router.execute(&text, &ctx);
                if !connection.send_text(&response) {
                    break;
                }
            }
            Opcode::Continuation => {
                connection.send_raw(&frame::encode_close(
                    frame::CLOSE_TOO_BIG,
                    "fragmented messages not supported",
                ));
                break;
            }
            Opcode::Binary => {
                // The text protocol is authoritative; binary frames are ignored
                debug!(target: "spyglass_agent::server", peer = %peer, "ignoring binary frame");
            }
            Opcode::Ping => {
                connection.send_frame(Opcode::Pong, &frame.payload);
            }
            Opcode::Pong => {}
            Opcode::Close => {
                connection.send_raw(&frame::encode_close(frame::CLOSE_NORMAL, ""));
                break;
            }
        }
    }

    connection.close();
    inner.remove_connection(&connection);
    info!(target: "spyglass_agent::server", peer = %connection.peer(), "client disconnected");
}

fn broadcast_loop(inner: Arc<ServerInner>, rx: mpsc::Receiver<String>) {
    loop {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(BROADCAST_POLL) {
            Ok(message) => inner.broadcast(&message),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Re-read every watched slot and push `memory_update` frames on change.
/// Updates are best-effort; per address each subscriber sees them in the
/// order they were generated here.
fn watch_loop(inner: Arc<ServerInner>) {
    while !inner.stopping.load(Ordering::SeqCst) {
        let connections: Vec<Arc<Connection>> = inner.connections.lock().clone();

        for connection in connections {
            if !connection.is_open() {
                continue;
            }
            let mut watches = connection.watches.lock();
            for (&address, entry) in watches.iter_mut() {
                let width = entry.value_type.width().unwrap_or(16);
                let Some(current) = inner.engine.memory.read_bytes(address, width) else {
                    continue;
                };

                match &entry.last {
                    None => entry.last = Some(current),
                    Some(last) if *last != current => {
                        let note = serde_json::json!({
                            "type": "memory_update",
                            "address": format_address(address),
                            "value": bytes_to_string(&current, entry.value_type),
                            "valueType": entry.value_type.as_str(),
                        });
                        entry.last = Some(current);
                        connection.send_text(&note.to_string());
                    }
                    _ => {}
                }
            }
        }

        std::thread::sleep(WATCH_POLL);
    }
}
