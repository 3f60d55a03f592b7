//! Event loop -- owns the listener and every socket, drives the relay engine.
//!
//! Single task, single thread of control. Each iteration waits for one of:
//! cancellation, an incoming connection, a socket becoming readable (or
//! writable while it has queued bytes), or the poll interval elapsing. Ready
//! sockets are then serviced in connection order and the snapshot is
//! republished if the engine's revision moved. Idle ticks publish nothing.

use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Buf;
use crc_protocol::MessageCodec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::NodeConfig;
use crate::connection::{ConnId, Origin};
use crate::relay::RelayEngine;
use crate::snapshot::NodeSnapshot;

/// Bytes reserved ahead of each socket read.
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Readiness {
    conn: ConnId,
    readable: bool,
    writable: bool,
}

enum Event {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Ready(Vec<Readiness>),
    Tick,
}

pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    streams: HashMap<ConnId, TcpStream>,
    engine: RelayEngine,
    next_conn: u64,
    poll_interval: Duration,
    snapshot_tx: watch::Sender<NodeSnapshot>,
    /// Engine revision the last published snapshot was built from.
    published: u64,
    span: tracing::Span,
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

impl Server {
    /// Bind the listening socket and, when a bootstrap peer is configured,
    /// dial it. Both failures are fatal.
    pub async fn bind(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let span = tracing::info_span!("crc", node = config.node.id, name = %config.node.name);
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding listener on {addr}"))?;
        let local_addr = listener.local_addr().context("reading listener address")?;

        let engine = RelayEngine::new(config.node.id, &config.node.name, &config.node.info);
        let (snapshot_tx, _) = watch::channel(engine.snapshot());
        let published = engine.revision();

        let mut server = Self {
            listener: Some(listener),
            local_addr,
            streams: HashMap::new(),
            engine,
            next_conn: 1,
            poll_interval: config.poll_interval(),
            snapshot_tx,
            published,
            span,
        };

        if let Some(peer) = &config.network.connect_to {
            let span = server.span.clone();
            server
                .dial(peer, config.network.connect_to_name.as_deref(), config.connect_timeout())
                .instrument(span)
                .await?;
        }
        server.publish();
        Ok(server)
    }

    async fn dial(
        &mut self,
        peer: &str,
        peer_name: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<ConnId> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer))
            .await
            .with_context(|| format!("connecting to {peer}: timed out after {timeout:?}"))?
            .with_context(|| format!("connecting to {peer}"))?;
        let conn = self.register(stream, Origin::Dialed);
        tracing::info!(%conn, peer, peer_name = peer_name.unwrap_or("-"), "net: dialed bootstrap server");
        Ok(conn)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn id(&self) -> crc_protocol::HostId {
        self.engine.id()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.engine.snapshot()
    }

    /// Listener plus live sockets.
    pub fn registered_sockets(&self) -> usize {
        usize::from(self.listener.is_some()) + self.streams.len()
    }

    /// Run until `shutdown` fires, then close every socket and return the
    /// final snapshot.
    pub async fn run(&mut self, shutdown: CancellationToken) -> NodeSnapshot {
        let span = self.span.clone();
        async move {
            tracing::info!(addr = %self.local_addr, "net: listening");
            loop {
                match self.next_event(&shutdown).await {
                    Event::Shutdown => break,
                    Event::Accepted(result) => self.on_accept(result),
                    Event::Ready(ready) => {
                        for r in ready {
                            if r.readable {
                                self.on_readable(r.conn);
                            }
                            if r.writable {
                                self.on_writable(r.conn);
                            }
                        }
                    }
                    Event::Tick => continue,
                }
                self.publish();
            }

            self.shutdown();
            self.publish();
            tracing::info!("net: stopped");
            self.engine.snapshot()
        }
        .instrument(span)
        .await
    }

    /// Close the listener and every socket, discarding their records.
    /// Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!(parent: &self.span, "net: listener closed");
        }
        let conns: Vec<ConnId> = self.streams.keys().copied().collect();
        for conn in conns {
            self.streams.remove(&conn);
            self.engine.discard_connection(conn);
        }
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    async fn next_event(&self, shutdown: &CancellationToken) -> Event {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Event::Shutdown,
            result = accept(self.listener.as_ref()) => Event::Accepted(result),
            ready = poll_fn(|cx| self.poll_ready(cx)) => Event::Ready(ready),
            _ = tokio::time::sleep(self.poll_interval) => Event::Tick,
        }
    }

    /// Ready when at least one socket is readable, or writable with queued
    /// bytes. Write interest is only registered while bytes are queued.
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Vec<Readiness>> {
        let mut ready: Vec<Readiness> = self
            .streams
            .iter()
            .filter_map(|(&conn, stream)| {
                let readable = stream.poll_read_ready(cx).is_ready();
                let writable =
                    self.engine.has_outbound(conn) && stream.poll_write_ready(cx).is_ready();
                (readable || writable).then_some(Readiness {
                    conn,
                    readable,
                    writable,
                })
            })
            .collect();

        if ready.is_empty() {
            return Poll::Pending;
        }
        ready.sort_by_key(|r| r.conn);
        Poll::Ready(ready)
    }

    // ========================================================================
    // Socket handling
    // ========================================================================

    fn register(&mut self, stream: TcpStream, origin: Origin) -> ConnId {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "net: set_nodelay failed");
        }
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        self.streams.insert(conn, stream);
        self.engine.open_connection(conn, origin);
        conn
    }

    fn on_accept(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => {
                let conn = self.register(stream, Origin::Accepted);
                tracing::info!(%conn, %peer, "net: accepted");
            }
            Err(e) => tracing::warn!(error = %e, "net: accept failed"),
        }
    }

    fn on_readable(&mut self, conn: ConnId) {
        let (Some(stream), Some(record)) =
            (self.streams.get(&conn), self.engine.connection_mut(conn))
        else {
            return;
        };

        let before = record.inbound.len();
        record.inbound.reserve(READ_CHUNK);
        match stream.try_read_buf(&mut record.inbound) {
            Ok(0) => {
                tracing::debug!(%conn, "net: peer closed");
                self.close_connection(conn);
            }
            Ok(n) => {
                tracing::trace!(
                    %conn,
                    len = n,
                    bytes = %hex::encode(&record.inbound[before..]),
                    "net: received"
                );
                self.process_inbound(conn);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(%conn, error = %e, "net: read failed");
                self.close_connection(conn);
            }
        }
    }

    /// Parse every complete message buffered on `conn` and hand each to the
    /// relay engine. A framing error closes the connection.
    fn process_inbound(&mut self, conn: ConnId) {
        loop {
            let decoded = match self.engine.connection_mut(conn) {
                Some(record) => MessageCodec.decode(&mut record.inbound),
                None => return,
            };
            match decoded {
                Ok(Some(message)) => self.engine.handle_message(conn, message),
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(%conn, error = %e, "net: framing error, closing connection");
                    self.close_connection(conn);
                    return;
                }
            }
        }
    }

    fn on_writable(&mut self, conn: ConnId) {
        let (Some(stream), Some(record)) =
            (self.streams.get(&conn), self.engine.connection_mut(conn))
        else {
            return;
        };
        if record.outbound.is_empty() {
            return;
        }

        match stream.try_write(&record.outbound) {
            Ok(n) => {
                tracing::trace!(
                    %conn,
                    len = n,
                    bytes = %hex::encode(&record.outbound[..n]),
                    "net: sent"
                );
                record.outbound.advance(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(%conn, error = %e, "net: write failed");
                self.close_connection(conn);
            }
        }
    }

    fn close_connection(&mut self, conn: ConnId) {
        if self.streams.remove(&conn).is_none() {
            return;
        }
        let peer = self
            .engine
            .close_connection(conn)
            .and_then(|record| record.peer_id());
        tracing::info!(%conn, peer = peer.unwrap_or(0), "net: connection closed");
    }

    /// Republish only when the engine has moved since the last snapshot.
    fn publish(&mut self) {
        let revision = self.engine.revision();
        if revision == self.published {
            return;
        }
        self.published = revision;
        let snapshot = self.engine.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
