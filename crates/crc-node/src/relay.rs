//! Relay engine -- message handlers for registration, status, chat and quit.
//!
//! Owns the topology table and the per-connection records. Handlers never
//! touch sockets: replies and propagations are encoded onto the outbound
//! buffer of the connection that leads toward each recipient, and the event
//! loop flushes them when the socket is writable.

use std::collections::HashMap;

use crc_protocol::{
    ClientChat, ClientQuit, HostId, Message, MessageCodec, Registration, ServerQuit, StatusCode,
    StatusUpdate,
};
use tokio_util::codec::Encoder;

use crate::connection::{ConnId, ConnectionRecord, HostInfo, HostKind, Identity, Origin};
use crate::snapshot::{HostSummary, NodeSnapshot};
use crate::topology::{HostRecord, Topology};

/// Content of the quit notices sent for hosts whose link dropped.
const CONNECTION_CLOSED: &str = "Connection closed";

pub struct RelayEngine {
    id: HostId,
    name: String,
    info: String,
    topology: Topology,
    connections: HashMap<ConnId, ConnectionRecord>,
    status_log: Vec<String>,
    chat_log: Vec<String>,
    /// Bumped whenever anything a snapshot shows may have changed.
    revision: u64,
}

fn registration_for(host: &HostRecord, hop: HostId) -> Message {
    let reg = Registration::new(host.id, hop, &host.name, &host.info);
    match host.kind {
        HostKind::Server => Message::ServerRegistration(reg),
        HostKind::Client => Message::ClientRegistration(reg),
    }
}

impl RelayEngine {
    pub fn new(id: HostId, name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            info: info.into(),
            topology: Topology::new(),
            connections: HashMap::new(),
            status_log: Vec::new(),
            chat_log: Vec::new(),
            revision: 0,
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn status_log(&self) -> &[String] {
        &self.status_log
    }

    pub fn chat_log(&self) -> &[String] {
        &self.chat_log
    }

    pub fn connection(&self, conn: ConnId) -> Option<&ConnectionRecord> {
        self.connections.get(&conn)
    }

    pub fn connection_mut(&mut self, conn: ConnId) -> Option<&mut ConnectionRecord> {
        self.connections.get_mut(&conn)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn has_outbound(&self, conn: ConnId) -> bool {
        self.connections
            .get(&conn)
            .is_some_and(ConnectionRecord::has_outbound)
    }

    fn own_registration(&self) -> Message {
        Message::ServerRegistration(Registration::new(self.id, 0, &self.name, &self.info))
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Track a new socket. On a dialed socket we speak first: our own
    /// registration is queued straight away and the acceptor answers with
    /// theirs.
    pub fn open_connection(&mut self, conn: ConnId, origin: Origin) {
        let mut record = ConnectionRecord::new();
        if origin == Origin::Dialed {
            let own = self.own_registration();
            if let Err(e) = MessageCodec.encode(&own, &mut record.outbound) {
                tracing::warn!(%conn, "relay: cannot encode own registration: {e}");
            }
            record.announced = true;
        }
        self.connections.insert(conn, record);
        self.touch();
    }

    /// Drop a socket's record after the peer went away. An adjacent host
    /// leaves the topology, along with everything learned through it, and
    /// the rest of the mesh is told.
    pub fn close_connection(&mut self, conn: ConnId) -> Option<ConnectionRecord> {
        let record = self.connections.remove(&conn)?;
        self.touch();
        let Some(id) = record.peer_id() else {
            return Some(record);
        };

        // Already quit, or the entry is not ours
        if self.topology.get(id).and_then(|h| h.conn) != Some(conn) {
            return Some(record);
        }

        if let Some(host) = self.topology.remove(id) {
            tracing::info!(%conn, id, kind = host.kind.as_str(), "relay: adjacent host lost");
            self.announce_departure(&host);
            if host.kind == HostKind::Server {
                self.forget_hosts_via(id);
            }
        }
        Some(record)
    }

    /// Drop a socket's record without touching the topology. Used on
    /// shutdown, where nobody is left to tell.
    pub fn discard_connection(&mut self, conn: ConnId) -> Option<ConnectionRecord> {
        let record = self.connections.remove(&conn)?;
        self.touch();
        Some(record)
    }

    fn announce_departure(&mut self, host: &HostRecord) {
        match host.kind {
            HostKind::Client => {
                let notice = Message::ClientQuit(ClientQuit::new(host.id, CONNECTION_CLOSED));
                self.broadcast_to_servers(&notice, &[host.id]);
                self.broadcast_to_clients(&notice, &[host.id]);
            }
            HostKind::Server => {
                let notice = Message::ServerQuit(ServerQuit::new(host.id, 0, CONNECTION_CLOSED));
                self.broadcast_to_servers(&notice, &[host.id]);
            }
        }
    }

    fn forget_hosts_via(&mut self, link: HostId) {
        for id in self.topology.learned_via(link) {
            if let Some(host) = self.topology.remove(id) {
                self.announce_departure(&host);
            }
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn send_on(&mut self, conn: ConnId, message: &Message) {
        let Some(record) = self.connections.get_mut(&conn) else {
            tracing::warn!(%conn, kind = message.kind(), "relay: no such connection");
            return;
        };
        match MessageCodec.encode(message, &mut record.outbound) {
            Ok(()) => tracing::trace!(%conn, kind = message.kind(), "relay: queued"),
            Err(e) => tracing::warn!(%conn, kind = message.kind(), "relay: cannot encode: {e}"),
        }
    }

    /// Queue `message` on the connection leading toward `dest`. Returns
    /// false when no route exists.
    fn send_to_host(&mut self, dest: HostId, message: &Message) -> bool {
        match self.topology.route(dest) {
            Some(conn) => {
                self.send_on(conn, message);
                true
            }
            None => false,
        }
    }

    fn broadcast_to_servers(&mut self, message: &Message, ignore: &[HostId]) {
        let targets: Vec<HostId> = self
            .topology
            .adjacent_servers()
            .iter()
            .copied()
            .filter(|id| !ignore.contains(id))
            .collect();
        for id in targets {
            self.send_to_host(id, message);
        }
    }

    fn broadcast_to_clients(&mut self, message: &Message, ignore: &[HostId]) {
        let targets: Vec<HostId> = self
            .topology
            .adjacent_clients()
            .iter()
            .copied()
            .filter(|id| !ignore.contains(id))
            .collect();
        for id in targets {
            self.send_to_host(id, message);
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub fn handle_message(&mut self, conn: ConnId, message: Message) {
        tracing::debug!(
            %conn,
            kind = message.kind(),
            source = message.source_id(),
            "relay: received"
        );
        match message {
            Message::ServerRegistration(reg) => self.handle_registration(conn, HostKind::Server, reg),
            Message::ClientRegistration(reg) => self.handle_registration(conn, HostKind::Client, reg),
            Message::StatusUpdate(msg) => self.handle_status(msg),
            Message::ClientChat(msg) => self.handle_chat(conn, msg),
            Message::ClientQuit(msg) => self.handle_client_quit(conn, msg),
            Message::ServerQuit(msg) => self.handle_server_quit(conn, msg),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn handle_registration(&mut self, conn: ConnId, kind: HostKind, reg: Registration) {
        let Some(via) = self.connections.get(&conn).map(|r| r.identity().clone()) else {
            return;
        };

        let id = reg.source_id;
        if id == 0 || id == self.id || self.topology.contains(id) {
            tracing::warn!(%conn, id, kind = kind.as_str(), "relay: duplicate registration");
            let reply = Message::StatusUpdate(StatusUpdate::new(
                self.id,
                0,
                StatusCode::DUPLICATE_ID,
                format!("A machine has already registered with ID {id}"),
            ));
            self.send_on(conn, &reply);
            return;
        }

        match via {
            Identity::Unresolved => self.register_adjacent(conn, kind, reg),
            Identity::Server(link) => {
                // Only relay through a link still live on this socket
                if self.topology.get(link.id).and_then(|h| h.conn) != Some(conn) {
                    tracing::warn!(
                        %conn,
                        link = link.id,
                        id,
                        "relay: registration relayed by a departed server, ignoring"
                    );
                    return;
                }
                self.register_remote(link.id, kind, reg)
            }
            Identity::Client(client) => {
                tracing::warn!(
                    %conn,
                    client = client.id,
                    id,
                    "relay: client sent a registration for another host, ignoring"
                );
            }
        }
    }

    fn register_adjacent(&mut self, conn: ConnId, kind: HostKind, reg: Registration) {
        let id = reg.source_id;
        let host = HostInfo {
            id,
            name: reg.name.clone(),
            info: reg.info.clone(),
        };
        let identity = match kind {
            HostKind::Server => Identity::Server(host),
            HostKind::Client => Identity::Client(host),
        };
        let announced = match self.connections.get_mut(&conn) {
            Some(record) => {
                record.resolve(identity);
                record.announced
            }
            None => return,
        };

        let record = HostRecord::adjacent(id, kind, &reg.name, &reg.info, conn);
        if self.topology.insert(record).is_err() {
            return;
        }
        self.touch();
        tracing::info!(%conn, id, kind = kind.as_str(), name = %reg.name, "relay: adjacent host registered");

        match kind {
            HostKind::Server => {
                if !announced {
                    let own = self.own_registration();
                    self.send_on(conn, &own);
                    if let Some(record) = self.connections.get_mut(&conn) {
                        record.announced = true;
                    }
                }

                // Bring the new peer up to date with everyone we know
                let known: Vec<Message> = self
                    .topology
                    .sorted()
                    .into_iter()
                    .filter(|h| h.id != id)
                    .map(|h| registration_for(h, self.id))
                    .collect();
                for message in &known {
                    self.send_on(conn, message);
                }

                let flood = Message::ServerRegistration(reg.relayed_by(self.id));
                self.broadcast_to_servers(&flood, &[id]);
            }
            HostKind::Client => {
                let welcome = Message::StatusUpdate(StatusUpdate::new(
                    self.id,
                    id,
                    StatusCode::WELCOME,
                    format!("Welcome to the Clemson Relay Chat network {}", reg.name),
                ));
                self.send_on(conn, &welcome);

                let roster: Vec<Message> = self
                    .topology
                    .sorted()
                    .into_iter()
                    .filter(|h| h.kind == HostKind::Client && h.id != id)
                    .map(|h| registration_for(h, self.id))
                    .collect();
                for message in &roster {
                    self.send_on(conn, message);
                }

                let flood = Message::ClientRegistration(reg.relayed_by(self.id));
                self.broadcast_to_servers(&flood, &[id]);
            }
        }
    }

    fn register_remote(&mut self, link: HostId, kind: HostKind, reg: Registration) {
        let id = reg.source_id;
        let record = HostRecord::remote(id, kind, &reg.name, &reg.info, link);
        if self.topology.insert(record).is_err() {
            return;
        }
        self.touch();
        tracing::info!(id, kind = kind.as_str(), link, "relay: remote host learned");

        // Carry on outward; the link we heard it from already knows
        let relayed = reg.relayed_by(self.id);
        let relayed = match kind {
            HostKind::Server => Message::ServerRegistration(relayed),
            HostKind::Client => Message::ClientRegistration(relayed),
        };
        self.broadcast_to_servers(&relayed, &[link]);
    }

    // ========================================================================
    // Status and chat
    // ========================================================================

    fn handle_status(&mut self, msg: StatusUpdate) {
        let dest = msg.destination_id;
        if dest == 0 || dest == self.id {
            tracing::info!(source = msg.source_id, code = %msg.code, content = %msg.content, "relay: status received");
            self.status_log.push(msg.content);
            self.touch();
            return;
        }

        // Never answer a status with a status, or two confused nodes could
        // bounce errors forever
        let source = msg.source_id;
        if !self.send_to_host(dest, &Message::StatusUpdate(msg)) {
            tracing::debug!(source, dest, "relay: dropping status for unknown host");
        }
    }

    fn handle_chat(&mut self, conn: ConnId, msg: ClientChat) {
        let dest = msg.destination_id;
        let source = msg.source_id;

        if dest == self.id {
            tracing::info!(source, "relay: chat addressed to this node");
            self.chat_log.push(msg.content);
            self.touch();
            return;
        }

        if self.topology.contains(dest) {
            if !self.send_to_host(dest, &Message::ClientChat(msg)) {
                tracing::warn!(source, dest, "relay: no route toward chat destination");
            }
            return;
        }

        tracing::debug!(source, dest, "relay: chat for unknown host");
        let reply = Message::StatusUpdate(StatusUpdate::new(
            self.id,
            source,
            StatusCode::UNKNOWN_ID,
            format!("Unknown ID {dest}"),
        ));
        if !self.send_to_host(source, &reply) {
            self.send_on(conn, &reply);
        }
    }

    // ========================================================================
    // Quit
    // ========================================================================

    fn handle_client_quit(&mut self, conn: ConnId, msg: ClientQuit) {
        let id = msg.source_id;
        match self.topology.get(id).map(|h| h.kind) {
            Some(HostKind::Client) => {}
            Some(HostKind::Server) => {
                tracing::warn!(%conn, id, "relay: client quit names a server, ignoring");
                return;
            }
            None => {
                tracing::debug!(%conn, id, "relay: quit for unknown client, ignoring");
                return;
            }
        }

        let mut ignore = vec![id];
        ignore.extend(self.connections.get(&conn).and_then(ConnectionRecord::peer_id));

        let notice = Message::ClientQuit(msg);
        self.broadcast_to_servers(&notice, &ignore);
        self.broadcast_to_clients(&notice, &ignore);
        self.topology.remove(id);
        self.touch();
        tracing::info!(id, "relay: client quit");
    }

    fn handle_server_quit(&mut self, conn: ConnId, msg: ServerQuit) {
        let id = msg.source_id;
        let adjacent = match self.topology.get(id) {
            Some(host) if host.kind == HostKind::Server => host.is_adjacent(),
            _ => {
                tracing::debug!(%conn, id, "relay: quit for unknown server, ignoring");
                return;
            }
        };

        let mut ignore = vec![id];
        ignore.extend(self.connections.get(&conn).and_then(ConnectionRecord::peer_id));

        self.broadcast_to_servers(&Message::ServerQuit(msg), &ignore);
        self.topology.remove(id);
        self.touch();
        if adjacent {
            self.forget_hosts_via(id);
        }
        tracing::info!(id, adjacent, "relay: server quit");
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            name: self.name.clone(),
            hosts: self
                .topology
                .sorted()
                .into_iter()
                .map(|h| {
                    (
                        h.id,
                        HostSummary {
                            kind: h.kind,
                            name: h.name.clone(),
                            info: h.info.clone(),
                            first_link_id: h.first_link_id,
                        },
                    )
                })
                .collect(),
            adjacent_servers: self.topology.adjacent_servers().iter().copied().collect(),
            adjacent_clients: self.topology.adjacent_clients().iter().copied().collect(),
            status_log: self.status_log.clone(),
            chat_log: self.chat_log.clone(),
            connections: self.connections.len(),
        }
    }
}
