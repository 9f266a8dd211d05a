//! The socket context: one worker task owning a UDP socket and every
//! connection bound to it.
//!
//! The worker is the only code that touches connection state. It multiplexes
//! four wake sources: datagrams from the socket, commands from handles,
//! connection timers, and the wake signal the per-stream handles raise when
//! the application enqueues, reads or aborts. Application tasks never block
//! the worker; they talk to it over channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use quaver_quic::{packet, Connection, Event, StreamHandles, TlsSession};

use crate::config::EndpointConfig;
use crate::socket::create_udp_socket;

/// Produces a fresh TLS session for each accepted connection.
pub type TlsFactory = Box<dyn Fn() -> Box<dyn TlsSession> + Send>;

enum Command {
    Connect {
        peer: SocketAddr,
        tls: Box<dyn TlsSession>,
        reply: oneshot::Sender<Result<ConnectionHandle>>,
    },
    OpenStream {
        conn: u64,
        bidi: bool,
        reply: oneshot::Sender<quaver_quic::Result<StreamHandles>>,
    },
    Accept {
        conn: u64,
        reply: oneshot::Sender<Option<StreamHandles>>,
    },
    Close {
        conn: u64,
        error_code: u64,
        reason: Vec<u8>,
    },
    AcceptConnection {
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
}

struct Entry {
    conn: Connection,
    peer: SocketAddr,
    events_tx: mpsc::UnboundedSender<Event>,
    waker_task: JoinHandle<()>,
}

/// Application-side handle to one connection on the context.
pub struct ConnectionHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
}

impl ConnectionHandle {
    pub async fn open_stream(&self, bidi: bool) -> Result<StreamHandles> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::OpenStream {
                conn: self.id,
                bidi,
                reply,
            })
            .ok()
            .context("socket context is gone")?;
        rx.await.context("socket context is gone")?
            .map_err(|e| anyhow::anyhow!("open stream: {e}"))
    }

    /// Take the next peer-initiated stream, if one is waiting. Pair with
    /// [`next_event`](Self::next_event) to learn when to call it.
    pub async fn accept(&self) -> Result<Option<StreamHandles>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Accept {
                conn: self.id,
                reply,
            })
            .ok()
            .context("socket context is gone")?;
        rx.await.context("socket context is gone")
    }

    /// Wait for the next connection event.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn close(&self, error_code: u64, reason: &[u8]) {
        let _ = self.commands.send(Command::Close {
            conn: self.id,
            error_code,
            reason: reason.to_vec(),
        });
    }
}

/// Cloneable entry point for issuing commands to a running context.
#[derive(Clone)]
pub struct ContextHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ContextHandle {
    /// Dial `peer` with the given TLS session.
    pub async fn connect(
        &self,
        peer: SocketAddr,
        tls: Box<dyn TlsSession>,
    ) -> Result<ConnectionHandle> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { peer, tls, reply })
            .ok()
            .context("socket context is gone")?;
        rx.await.context("socket context is gone")?
    }

    /// Claim the next incoming connection on a listening context.
    pub async fn accept_connection(&self) -> Result<Option<ConnectionHandle>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AcceptConnection { reply })
            .ok()
            .context("socket context is gone")?;
        rx.await.context("socket context is gone")
    }
}

/// Binds connections to one UDP socket and drives them from a single
/// worker task.
pub struct SocketContext {
    socket: UdpSocket,
    config: EndpointConfig,
    connections: HashMap<u64, Entry>,
    next_id: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Sender cloned into every handle this context creates.
    handle_tx: mpsc::UnboundedSender<Command>,
    /// Aggregated wake signal; per-connection wakers forward into it.
    wake: Arc<Notify>,
    /// Present on endpoints that accept incoming connections.
    tls_factory: Option<TlsFactory>,
    /// Server-side handles not yet claimed via `accept_connection`.
    incoming: std::collections::VecDeque<ConnectionHandle>,
}

impl SocketContext {
    pub fn bind(addr: SocketAddr, config: EndpointConfig) -> Result<(Self, ContextHandle)> {
        config.validate()?;
        let socket = create_udp_socket(addr, &config.socket)?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(addr = %socket.local_addr()?, "socket context bound");
        Ok((
            Self {
                socket,
                config,
                connections: HashMap::new(),
                next_id: 0,
                commands: rx,
                handle_tx: tx.clone(),
                wake: Arc::new(Notify::new()),
                tls_factory: None,
                incoming: std::collections::VecDeque::new(),
            },
            ContextHandle { commands: tx },
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept incoming connections, building each one's TLS session from
    /// `factory`.
    pub fn listen(&mut self, factory: TlsFactory) {
        self.tls_factory = Some(factory);
    }

    /// Run the worker until the command channel closes.
    pub async fn run(mut self) -> Result<()> {
        let mut recv_buf = vec![0u8; 65535];
        let mut send_buf = vec![0u8; 65535];

        loop {
            self.pump(Instant::now(), &mut send_buf).await?;
            self.dispatch_events();
            self.reap();

            let deadline = self
                .connections
                .values()
                .filter_map(|e| e.conn.timeout())
                .min();

            tokio::select! {
                result = self.socket.recv_from(&mut recv_buf) => {
                    let (n, peer) = result.context("udp recv")?;
                    self.on_datagram(&mut recv_buf[..n], peer, Instant::now());
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd, Instant::now()),
                        None => {
                            debug!("all handles dropped, worker exiting");
                            return Ok(());
                        }
                    }
                }
                _ = self.wake.notified() => {}
                _ = maybe_sleep(deadline) => {
                    let now = Instant::now();
                    for entry in self.connections.values_mut() {
                        entry.conn.on_timeout(now);
                    }
                }
            }
        }
    }

    fn register(&mut self, conn: Connection, peer: SocketAddr) -> ConnectionHandle {
        let id = self.next_id;
        self.next_id += 1;

        // Forward the connection's wake signal into the worker's select.
        let waker = conn.waker();
        let aggregate = Arc::clone(&self.wake);
        let waker_task = tokio::spawn(async move {
            loop {
                waker.notified().await;
                aggregate.notify_one();
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let commands = self.command_sender();
        self.connections.insert(
            id,
            Entry {
                conn,
                peer,
                events_tx,
                waker_task,
            },
        );
        debug!(conn = id, peer = %peer, "connection registered");
        ConnectionHandle {
            id,
            commands,
            events: events_rx,
        }
    }

    fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.handle_tx.clone()
    }

    fn on_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::Connect { peer, tls, reply } => {
                let result = Connection::client(self.config.to_connection_config(), tls, now)
                    .map(|conn| self.register(conn, peer))
                    .map_err(|e| anyhow::anyhow!("client setup: {e}"));
                let _ = reply.send(result);
            }
            Command::OpenStream { conn, bidi, reply } => {
                if let Some(entry) = self.connections.get_mut(&conn) {
                    let _ = reply.send(entry.conn.open_stream(bidi));
                }
            }
            Command::Accept { conn, reply } => {
                let accepted = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|entry| entry.conn.accept_stream());
                let _ = reply.send(accepted);
            }
            Command::Close {
                conn,
                error_code,
                reason,
            } => {
                if let Some(entry) = self.connections.get_mut(&conn) {
                    entry.conn.close(true, error_code, &reason, now);
                }
            }
            Command::AcceptConnection { reply } => {
                let _ = reply.send(self.incoming.pop_front());
            }
        }
    }

    fn on_datagram(&mut self, buf: &mut [u8], peer: SocketAddr, now: Instant) {
        let hdr = match packet::parse_header(buf, self.config.transport.cid_len) {
            Ok(hdr) => hdr,
            Err(_) => {
                trace!(peer = %peer, len = buf.len(), "undecodable datagram dropped");
                return;
            }
        };

        let found = self
            .connections
            .iter()
            .find(|(_, e)| e.conn.owns_cid(hdr.dcid.as_bytes()))
            .map(|(&id, _)| id);

        let id = match found {
            Some(id) => id,
            None => {
                // A fresh Initial may create a server connection.
                if self.tls_factory.is_none() || hdr.ty != packet::PacketType::Initial {
                    trace!(peer = %peer, "datagram for unknown connection dropped");
                    return;
                }
                let Some(scid) = hdr.scid.clone() else {
                    return;
                };
                let tls = self.tls_factory.as_ref().expect("checked above")();
                match Connection::server(
                    self.config.to_connection_config(),
                    tls,
                    hdr.dcid.clone(),
                    scid,
                    now,
                ) {
                    Ok(conn) => {
                        let handle = self.register(conn, peer);
                        let id = handle.id;
                        self.incoming.push_back(handle);
                        id
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "server connection setup failed");
                        return;
                    }
                }
            }
        };

        let entry = self.connections.get_mut(&id).expect("routed id exists");
        entry.peer = peer;
        if let Err(e) = entry.conn.recv(buf, now) {
            // The connection queued its CONNECTION_CLOSE; just log.
            debug!(error = %e, "receive error, connection closing");
        }
    }

    async fn pump(&mut self, now: Instant, buf: &mut [u8]) -> Result<()> {
        for entry in self.connections.values_mut() {
            loop {
                match entry.conn.send(buf, now) {
                    Ok(n) => {
                        self.socket
                            .send_to(&buf[..n], entry.peer)
                            .await
                            .context("udp send")?;
                    }
                    Err(quaver_quic::Error::Done) => break,
                    Err(e) => {
                        warn!(error = %e, "send path error");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_events(&mut self) {
        for entry in self.connections.values_mut() {
            while let Some(event) = entry.conn.poll_event() {
                let _ = entry.events_tx.send(event);
            }
        }
    }

    fn reap(&mut self) {
        self.connections.retain(|id, entry| {
            if entry.conn.is_closed() {
                debug!(conn = *id, "connection reaped");
                entry.waker_task.abort();
                false
            } else {
                true
            }
        });
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
