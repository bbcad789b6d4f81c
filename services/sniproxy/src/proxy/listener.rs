//! TCP listener and connection handling.
//!
//! This module is the reactor side of the proxy. It accepts connections,
//! turns socket activity into [`SessionEvent`]s for the session manager and
//! executes the [`Command`]s the manager answers with.
//!
//! Task layout:
//! - one accept loop, bounded by a connection semaphore
//! - one manager task owning the [`SessionManager`], fed through a bounded
//!   channel
//! - one task per connection, receiving its commands on an unbounded channel
//!
//! Once a backend is connected the connection task stops reading from the
//! client until the manager has flushed the buffered prefix, so bytes reach
//! the backend in the order the client sent them.
//!
//! After `BeginForwarding` the byte pump owns both sockets. It ends as soon
//! as either peer is gone (after a short half-close linger) and drops both
//! streams together; the task then reports `ForwardingFinished` and the
//! manager releases the session.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::manager::{Command, SessionConfig, SessionEvent, SessionManager};
use super::pump::proxy_bidirectional;
use super::router::RoutingTable;
use super::session::ConnectionId;
use super::stats::ListenerStats;
use super::target::BackendTarget;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time a client has to deliver a complete ClientHello.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default idle timeout (none for raw TCP).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Capacity of the manager inbox.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Client read size before the handoff.
const READ_CHUNK_SIZE: usize = 4096;

type DialFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for a complete ClientHello.
    pub handshake_timeout: Duration,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// Idle timeout for forwarded connections.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Messages into the manager task.
#[derive(Debug)]
enum ManagerMessage {
    Accepted {
        id: ConnectionId,
        peer: SocketAddr,
        commands: mpsc::UnboundedSender<Command>,
    },
    Event {
        id: ConnectionId,
        event: SessionEvent,
    },
}

/// A TCP listener for the SNI proxy.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Routing table, read-only for the listener's lifetime.
    routes: Arc<RoutingTable>,
    /// Per-session policy.
    session_config: SessionConfig,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        routes: Arc<RoutingTable>,
        session_config: SessionConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            allow_all = routes.is_allow_all(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            routes,
            session_config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Run the listener until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let (events, inbox) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let manager = SessionManager::new(
            Arc::clone(&self.routes),
            self.session_config.clone(),
            Arc::clone(&self.stats),
        );
        let manager_task = tokio::spawn(run_manager(manager, inbox, shutdown.clone()));

        let mut next_id = 0u64;
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            ListenerStats::incr(&self.stats.connections_rejected);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    next_id += 1;
                    let id = ConnectionId::new(next_id);
                    set_nodelay(&stream);

                    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                    let accepted = ManagerMessage::Accepted {
                        id,
                        peer: peer_addr,
                        commands: commands_tx,
                    };
                    if events.send(accepted).await.is_err() {
                        error!("Session manager stopped, no longer accepting");
                        break;
                    }

                    ListenerStats::incr(&self.stats.connections_accepted);
                    ListenerStats::incr(&self.stats.connections_active);

                    let connection = Connection {
                        id,
                        events: events.clone(),
                        commands: commands_rx,
                        config: self.config.clone(),
                    };
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            connection.serve(stream).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            ListenerStats::incr(&stats.connections_closed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", conn = %id, peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(bind_addr = %local_addr, "Listener stopping");
        drop(events);
        if let Err(e) = manager_task.await {
            error!(error = %e, "Session manager task failed");
        }
        Ok(())
    }
}

/// Owns the session manager and routes its commands to connection tasks.
async fn run_manager(
    mut manager: SessionManager,
    mut inbox: mpsc::Receiver<ManagerMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut outboxes: HashMap<ConnectionId, mpsc::UnboundedSender<Command>> = HashMap::new();

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(ManagerMessage::Accepted { id, peer, commands }) => {
                    manager.accept(id, peer);
                    outboxes.insert(id, commands);
                }
                Some(ManagerMessage::Event { id, event }) => {
                    let commands = manager.handle(id, event);
                    dispatch(&outboxes, id, commands);
                    if manager.phase(id).is_none() {
                        outboxes.remove(&id);
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                let closed = manager.close_all();
                info!(sessions = closed.len(), "Closing sessions for shutdown");
                for (id, commands) in closed {
                    dispatch(&outboxes, id, commands);
                }
                break;
            }
        }
    }
}

fn dispatch(
    outboxes: &HashMap<ConnectionId, mpsc::UnboundedSender<Command>>,
    id: ConnectionId,
    commands: Vec<Command>,
) {
    let Some(outbox) = outboxes.get(&id) else {
        return;
    };
    for command in commands {
        // The connection task may already be gone.
        if outbox.send(command).is_err() {
            debug!(conn = %id, "Connection task gone, dropping command");
            break;
        }
    }
}

/// The reactor half of one client connection.
struct Connection {
    id: ConnectionId,
    events: mpsc::Sender<ManagerMessage>,
    commands: mpsc::UnboundedReceiver<Command>,
    config: ListenerConfig,
}

impl Connection {
    async fn emit(&self, event: SessionEvent) -> bool {
        let message = ManagerMessage::Event { id: self.id, event };
        self.events.send(message).await.is_ok()
    }

    async fn serve(mut self, mut client: TcpStream) {
        let Some(backend) = self.handshake(&mut client).await else {
            return;
        };

        let pump = proxy_bidirectional(client, backend, self.config.idle_timeout);
        tokio::pin!(pump);

        let finished = loop {
            tokio::select! {
                result = &mut pump => {
                    break match result {
                        Ok(transfer) => SessionEvent::ForwardingFinished {
                            to_backend: transfer.to_backend,
                            from_backend: transfer.from_backend,
                            error: None,
                        },
                        Err(e) => SessionEvent::ForwardingFinished {
                            to_backend: e.transfer.to_backend,
                            from_backend: e.transfer.from_backend,
                            error: Some(e.source.to_string()),
                        },
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::CloseClient) | Some(Command::CloseBackend) | None => {
                        debug!("Forwarding aborted");
                        return;
                    }
                    Some(other) => debug!(command = ?other, "Ignoring command while forwarding"),
                },
            }
        };
        self.emit(finished).await;
    }

    /// Drive the connection until the manager hands it to the byte pump.
    ///
    /// Returns the connected backend, or `None` once the connection is
    /// closed.
    async fn handshake(&mut self, client: &mut TcpStream) -> Option<TcpStream> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut reading = true;
        let mut dial: Option<DialFuture> = None;
        let mut backend: Option<TcpStream> = None;

        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        let mut deadline_armed = true;

        loop {
            tokio::select! {
                read = client.read(&mut buf), if reading => {
                    let event = match read {
                        Ok(0) => SessionEvent::ClientClosed,
                        Ok(n) => SessionEvent::ClientData(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) => SessionEvent::ClientError(e.to_string()),
                    };
                    let client_gone = !matches!(event, SessionEvent::ClientData(_));
                    if !self.emit(event).await || client_gone {
                        return None;
                    }
                }
                connected = wait_dial(&mut dial), if dial.is_some() => {
                    dial = None;
                    let event = match connected {
                        Ok(stream) => {
                            // Hold client bytes back until the buffered prefix is flushed.
                            reading = false;
                            backend = Some(stream);
                            SessionEvent::BackendConnected
                        }
                        Err(e) => SessionEvent::BackendError(e.to_string()),
                    };
                    if !self.emit(event).await {
                        return None;
                    }
                }
                _ = &mut deadline, if deadline_armed => {
                    deadline_armed = false;
                    if !self.emit(SessionEvent::HandshakeTimeout).await {
                        return None;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return None;
                    };
                    match command {
                        Command::Dial(target) => {
                            dial = Some(Box::pin(connect(target, self.config.connect_timeout)));
                        }
                        Command::SendToBackend(bytes) => {
                            if let Some(stream) = backend.as_mut() {
                                if let Err(e) = stream.write_all(&bytes).await {
                                    // A queued BeginForwarding must not reach the pump.
                                    self.emit(SessionEvent::BackendError(e.to_string())).await;
                                    return None;
                                }
                            }
                        }
                        Command::SendToClient(bytes) => {
                            if let Err(e) = client.write_all(&bytes).await {
                                self.emit(SessionEvent::ClientError(e.to_string())).await;
                                return None;
                            }
                        }
                        Command::BeginForwarding => {
                            if let Some(stream) = backend.take() {
                                return Some(stream);
                            }
                        }
                        Command::CloseClient => return None,
                        Command::CloseBackend => {
                            dial = None;
                            backend = None;
                        }
                    }
                }
            }
        }
    }
}

async fn wait_dial(dial: &mut Option<DialFuture>) -> io::Result<TcpStream> {
    match dial {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

/// Connect to a backend within `timeout`.
async fn connect(target: BackendTarget, timeout: Duration) -> io::Result<TcpStream> {
    debug!(backend = %target, "Connecting to backend");
    let stream = tokio::time::timeout(timeout, TcpStream::connect((target.host(), target.port())))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", target, timeout),
            )
        })??;
    set_nodelay(&stream);
    Ok(stream)
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniproxy_testing::ClientHelloBuilder;
    use tokio::net::TcpListener;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:443".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(config.idle_timeout.is_none());
    }

    async fn spawn_listener(
        routes: RoutingTable,
        config: ListenerConfig,
    ) -> (SocketAddr, Arc<Listener>, watch::Sender<bool>) {
        let listener = Listener::bind(config, Arc::new(routes), SessionConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = Arc::new(listener);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&listener).run(shutdown_rx));
        (addr, listener, shutdown_tx)
    }

    #[tokio::test]
    async fn test_routes_to_backend_and_flushes_prefix() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        let target = format!("127.0.0.1:{}", backend_port);
        let routes = RoutingTable::new(vec![target.parse().unwrap()]);

        let (addr, listener, _shutdown) =
            spawn_listener(routes, ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await;

        let hello = ClientHelloBuilder::new().server_name("127.0.0.1").build();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&hello).await.unwrap();
        client.write_all(b"after-hello").await.unwrap();

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut received = vec![0u8; hello.len() + 11];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..hello.len()], &hello[..]);
        assert_eq!(&received[hello.len()..], b"after-hello");

        upstream.write_all(b"from-backend").await.unwrap();
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"from-backend");

        assert_eq!(listener.stats().snapshot().backend_connected, 1);
    }

    #[tokio::test]
    async fn test_rejected_host_closes_client() {
        let routes = RoutingTable::new(vec!["allowed.test:443".parse().unwrap()]);
        let (addr, listener, _shutdown) =
            spawn_listener(routes, ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let hello = ClientHelloBuilder::new().server_name("denied.test").build();
        client.write_all(&hello).await.unwrap();

        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        assert_eq!(listener.stats().snapshot().routes_rejected, 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_client() {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.handshake_timeout = Duration::from_millis(100);
        let (addr, _listener, _shutdown) = spawn_listener(RoutingTable::allow_all(), config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "connection was not closed by the deadline");
    }

    async fn next_event(events: &mut mpsc::Receiver<ManagerMessage>) -> Option<SessionEvent> {
        let message = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event from connection task");
        match message {
            Some(ManagerMessage::Event { event, .. }) => Some(event),
            Some(other) => panic!("unexpected message {:?}", other),
            None => None,
        }
    }

    #[tokio::test]
    async fn test_failed_flush_ends_connection() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let mut client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = front.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id: ConnectionId::new(1),
            events: events_tx,
            commands: commands_rx,
            config: ListenerConfig::new(backend_addr),
        };
        let task = tokio::spawn(connection.serve(accepted));

        commands_tx
            .send(Command::Dial(BackendTarget::new("127.0.0.1", backend_addr.port())))
            .unwrap();
        let (upstream, _) = backend.accept().await.unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            Some(SessionEvent::BackendConnected)
        );

        // Reset the backend before the prefix is flushed.
        #[allow(deprecated)]
        upstream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(upstream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        commands_tx
            .send(Command::SendToBackend(Bytes::from(vec![0u8; 8 << 20])))
            .unwrap();
        commands_tx.send(Command::BeginForwarding).unwrap();

        assert!(matches!(
            next_event(&mut events_rx).await,
            Some(SessionEvent::BackendError(_))
        ));
        // No ForwardingFinished: the pump never started.
        assert_eq!(next_event(&mut events_rx).await, None);
        task.await.unwrap();

        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_mid_forwarding_releases_pair() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", backend.local_addr().unwrap().port());
        let routes = RoutingTable::new(vec![target.parse().unwrap()]);
        let (addr, listener, _shutdown) =
            spawn_listener(routes, ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await;

        let hello = ClientHelloBuilder::new().server_name("127.0.0.1").build();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&hello).await.unwrap();

        // The backend reads the hello, then stays silent and open.
        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut received = vec![0u8; hello.len()];
        upstream.read_exact(&mut received).await.unwrap();

        drop(client);

        let mut rest = Vec::new();
        let closed =
            tokio::time::timeout(Duration::from_secs(2), upstream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "backend connection left open");

        let released = tokio::time::timeout(Duration::from_secs(2), async {
            while listener.stats().snapshot().connections_active != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "connection pair still held after client closed");
        assert_eq!(listener.stats().snapshot().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (addr, _listener, shutdown) = spawn_listener(
            RoutingTable::allow_all(),
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
        )
        .await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();

        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "buffering connection survived shutdown");
    }
}
