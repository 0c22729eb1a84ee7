//! WebSocket transport bridge.
//!
//! The transport library's I/O runs on background threads (one acceptor,
//! one per client socket). Those threads never touch session state; the
//! only crossing points are three thread-safe queues drained by the tick
//! loop through [`Transport::update`]. Outbound messages are routed to
//! per-client channels; client id 0 addresses every connected client.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tungstenite::{Message, WebSocket};

use crate::queue::ThreadSafeQueue;

pub type ClientId = u64;

/// Outbound client id that addresses all connected clients.
pub const BROADCAST: ClientId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub client_id: ClientId,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub client_id: ClientId,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TransportUpdate {
    pub connection_events: Vec<ConnectionEvent>,
    pub incoming_messages: Vec<IncomingMessage>,
}

/// The mediator's view of the transport. Implemented by [`WsTransport`]
/// in production and by an in-memory double in tests.
pub trait Transport {
    /// Drain inbound events and messages, flush queued outbound messages.
    fn update(&mut self) -> TransportUpdate;
    fn send(&mut self, client_id: ClientId, message: String);
    fn broadcast(&mut self, message: String);
}

struct OutgoingMessage {
    client_id: ClientId,
    text: String,
}

pub struct WsTransport {
    incoming: Arc<ThreadSafeQueue<IncomingMessage>>,
    connection_events: Arc<ThreadSafeQueue<ConnectionEvent>>,
    outgoing: ThreadSafeQueue<OutgoingMessage>,
    clients: Arc<Mutex<HashMap<ClientId, Sender<String>>>>,
    stop: Arc<AtomicBool>,
    accept_handle: Option<std::thread::JoinHandle<()>>,
    client_handles: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl WsTransport {
    pub fn bind(address: &str, port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((address, port))
            .with_context(|| format!("bind websocket listener on {}:{}", address, port))?;
        listener.set_nonblocking(true)?;

        let incoming = Arc::new(ThreadSafeQueue::new());
        let connection_events = Arc::new(ThreadSafeQueue::new());
        let clients: Arc<Mutex<HashMap<ClientId, Sender<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let client_handles = Arc::new(Mutex::new(Vec::new()));

        let accept_handle = {
            let incoming = Arc::clone(&incoming);
            let connection_events = Arc::clone(&connection_events);
            let clients = Arc::clone(&clients);
            let stop = Arc::clone(&stop);
            let client_handles = Arc::clone(&client_handles);
            let next_client_id = AtomicU64::new(1);

            std::thread::Builder::new()
                .name("ws-accept".to_string())
                .spawn(move || loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            let client_id = next_client_id.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(client_id, %peer, "websocket connection");
                            let handle = spawn_client_thread(
                                client_id,
                                stream,
                                Arc::clone(&incoming),
                                Arc::clone(&connection_events),
                                Arc::clone(&clients),
                                Arc::clone(&stop),
                            );
                            client_handles.lock().push(handle);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "websocket accept error");
                            std::thread::sleep(Duration::from_millis(200));
                        }
                    }
                })
                .expect("failed to spawn websocket accept thread")
        };

        tracing::info!(address, port, "websocket server started");

        Ok(Self {
            incoming,
            connection_events,
            outgoing: ThreadSafeQueue::new(),
            clients,
            stop,
            accept_handle: Some(accept_handle),
            client_handles,
        })
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        for handle in self.client_handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.incoming.clear();
        self.connection_events.clear();
        self.outgoing.clear();
        tracing::info!("websocket server stopped");
    }
}

impl Transport for WsTransport {
    fn update(&mut self) -> TransportUpdate {
        let update = TransportUpdate {
            connection_events: self.connection_events.take_all(),
            incoming_messages: self.incoming.take_all(),
        };

        let clients = self.clients.lock();
        for message in self.outgoing.take_all() {
            if message.client_id == BROADCAST {
                for sender in clients.values() {
                    let _ = sender.send(message.text.clone());
                }
            } else if let Some(sender) = clients.get(&message.client_id) {
                let _ = sender.send(message.text);
            } else {
                tracing::debug!(client_id = message.client_id, "dropping message for gone client");
            }
        }

        update
    }

    fn send(&mut self, client_id: ClientId, message: String) {
        self.outgoing.push(OutgoingMessage {
            client_id,
            text: message,
        });
    }

    fn broadcast(&mut self, message: String) {
        self.outgoing.push(OutgoingMessage {
            client_id: BROADCAST,
            text: message,
        });
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_client_thread(
    client_id: ClientId,
    stream: TcpStream,
    incoming: Arc<ThreadSafeQueue<IncomingMessage>>,
    connection_events: Arc<ThreadSafeQueue<ConnectionEvent>>,
    clients: Arc<Mutex<HashMap<ClientId, Sender<String>>>>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("ws-client-{}", client_id))
        .spawn(move || {
            // The read timeout keeps both the handshake and the message
            // loop from blocking: a stalled handshake stays interruptible
            // by the stop flag, and reads interleave with outbound drains.
            if stream.set_nonblocking(false).is_err()
                || stream
                    .set_read_timeout(Some(Duration::from_millis(20)))
                    .is_err()
            {
                return;
            }
            let mut pending = tungstenite::accept(stream);
            let mut socket = loop {
                match pending {
                    Ok(socket) => break socket,
                    Err(tungstenite::HandshakeError::Interrupted(mid)) => {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        pending = mid.handshake();
                    }
                    Err(tungstenite::HandshakeError::Failure(e)) => {
                        tracing::warn!(client_id, error = %e, "websocket handshake failed");
                        return;
                    }
                }
            };

            let (tx, rx) = unbounded::<String>();
            clients.lock().insert(client_id, tx);
            connection_events.push(ConnectionEvent {
                client_id,
                connected: true,
            });

            run_client_loop(client_id, &mut socket, &rx, &incoming, &stop);

            clients.lock().remove(&client_id);
            connection_events.push(ConnectionEvent {
                client_id,
                connected: false,
            });
            tracing::info!(client_id, "websocket disconnect");
        })
        .expect("failed to spawn websocket client thread")
}

fn run_client_loop(
    client_id: ClientId,
    socket: &mut WebSocket<TcpStream>,
    outbound: &Receiver<String>,
    incoming: &Arc<ThreadSafeQueue<IncomingMessage>>,
    stop: &Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            let _ = socket.close(None);
            let _ = socket.flush();
            break;
        }

        while let Ok(text) = outbound.try_recv() {
            if let Err(e) = socket.send(Message::Text(text)) {
                tracing::warn!(client_id, error = %e, "websocket send error");
                return;
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                incoming.push(IncomingMessage {
                    client_id,
                    text: text.to_string(),
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => {
                tracing::warn!(client_id, error = %e, "websocket read error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    fn free_port() -> u16 {
        StdListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn client_round_trip() {
        let port = free_port();
        let mut transport = WsTransport::bind("127.0.0.1", port).unwrap();

        let (mut client, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{}/", port)).unwrap();
        client
            .send(Message::Text("{\"type\":\"listSessions\"}".into()))
            .unwrap();

        // wait for the background threads to surface the connection+message
        let mut update = TransportUpdate::default();
        for _ in 0..100 {
            let step = transport.update();
            update.connection_events.extend(step.connection_events);
            update.incoming_messages.extend(step.incoming_messages);
            if !update.incoming_messages.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(update.connection_events.len(), 1);
        assert!(update.connection_events[0].connected);
        let client_id = update.connection_events[0].client_id;
        assert_eq!(update.incoming_messages[0].client_id, client_id);
        assert_eq!(
            update.incoming_messages[0].text,
            "{\"type\":\"listSessions\"}"
        );

        transport.send(client_id, "reply".to_string());
        transport.update();
        let reply = client.read().unwrap();
        assert_eq!(reply, Message::Text("reply".into()));

        transport.broadcast("to-all".to_string());
        transport.update();
        let broadcast = client.read().unwrap();
        assert_eq!(broadcast, Message::Text("to-all".into()));

        drop(client);
        transport.shutdown();
    }

    #[test]
    fn disconnect_surfaces_an_event() {
        let port = free_port();
        let mut transport = WsTransport::bind("127.0.0.1", port).unwrap();

        let (mut client, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{}/", port)).unwrap();
        let _ = client.close(None);
        let _ = client.flush();
        drop(client);

        let mut events = Vec::new();
        for _ in 0..100 {
            events.extend(transport.update().connection_events);
            if events.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(events.iter().any(|e| e.connected));
        assert!(events.iter().any(|e| !e.connected));
        transport.shutdown();
    }
}
