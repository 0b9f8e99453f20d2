//! Consensus engine: a raft node replicating SQL statement batches.
//!
//! A single worker task owns the `RawNode`, the log storage and the
//! in-memory SQLite state machine; everything else talks to it over
//! channels, so no raft or database state is ever shared across tasks.
//! The worker ticks the raft clock every 100ms, steps messages fed in
//! by connection reader tasks, and drains ready state after every
//! event.
//!
//! A log entry's payload is a JSON statement batch.  Committed batches
//! are applied to the local SQLite connection on every node; the node
//! that proposed a batch resolves the caller's oneshot with the
//! results.  A `query` batch is the linearizable-read barrier: it
//! executes its SELECTs at apply time, on the proposer only.

pub(crate) mod codec;
pub(crate) mod storage;

use std::collections::HashMap;
use std::time::Duration;

use raft::prelude::{
    ConfChange, ConfChangeType, Config as RaftConfig, Entry, EntryType, Message, MessageType,
    RawNode,
};
use raft::StateRole;
use serde::{Deserialize, Serialize};
use slog::o;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::cluster::peers::PeerStore;
use crate::cluster::store::{ExecResult, LeaderState, RaftRole, Rows, StoreEvent};
use crate::cluster::transport::RaftTransport;
use crate::errors::ClusterError;
use crate::metrics::{RAFT_FRAMES_IN_TOTAL, RAFT_FRAMES_OUT_TOTAL, RAFT_PROPOSALS_TOTAL};
use self::storage::LogStore;

/// Raft logical clock interval; election timeout is 10 ticks and
/// heartbeats go out every 3.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Per-peer outbound message buffer.  Raft tolerates dropped messages,
/// so overflow drops rather than blocking the worker.
const PEER_SEND_BUFFER: usize = 256;

/// Deterministic node id for a cluster address (FNV-1a), so a joining
/// follower derives its own id before it holds any replicated state.
pub fn node_id(addr: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in addr.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    // Raft reserves id 0 for "no node".
    if hash == 0 {
        u64::MAX
    } else {
        hash
    }
}

/// The tikv raft library requires a logger; raft internals are logged
/// at the application level instead.
fn silent_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

/// A replicated statement batch.
#[derive(Debug, Serialize, Deserialize)]
struct Command {
    proposer: u64,
    /// The proposer's address rides along so every replica can map the
    /// id back to a dialable endpoint while replaying the log.
    proposer_addr: String,
    seq: u64,
    stmts: Vec<String>,
    tx: bool,
    query: bool,
}

enum Request {
    Execute {
        stmts: Vec<String>,
        tx: bool,
        respond: oneshot::Sender<Result<Vec<ExecResult>, ClusterError>>,
    },
    Query {
        stmts: Vec<String>,
        strong: bool,
        respond: oneshot::Sender<Result<Vec<Rows>, ClusterError>>,
    },
    Join {
        addr: String,
        respond: oneshot::Sender<Result<(), ClusterError>>,
    },
    Remove {
        addr: String,
        respond: oneshot::Sender<Result<(), ClusterError>>,
    },
    Database {
        respond: oneshot::Sender<Result<String, ClusterError>>,
    },
    Shutdown,
}

/// Configuration for starting an engine.
pub(crate) struct EngineConfig {
    pub my_addr: String,
    /// Bootstrap as the cluster leader (single-voter configuration and
    /// an immediate campaign) instead of waiting to be joined.
    pub leader: bool,
    pub peers: Arc<PeerStore>,
    pub transport: Arc<RaftTransport>,
    pub request_timeout: Duration,
}

/// Handle to a running engine worker.
pub(crate) struct Engine {
    req_tx: mpsc::UnboundedSender<Request>,
    leader_rx: watch::Receiver<LeaderState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Engine {
    /// Start the worker and the inbound accept loop.
    pub fn start(config: EngineConfig) -> anyhow::Result<Self> {
        let my_id = node_id(&config.my_addr);

        let log = LogStore::new();
        let mut addrs = HashMap::new();
        addrs.insert(my_id, config.my_addr.clone());

        // On a cold start the peer file is the bootstrap oracle: it
        // names the voters this node knew before it went down.
        let known = config.peers.members();
        if config.leader {
            log.initialize(vec![my_id]);
        } else if !known.is_empty() {
            let mut voters: Vec<u64> = known.iter().map(|m| node_id(&m.addr)).collect();
            if !voters.contains(&my_id) {
                voters.push(my_id);
            }
            log.initialize(voters);
        }
        for m in &known {
            addrs.insert(node_id(&m.addr), m.addr.clone());
        }

        let raft_config = RaftConfig {
            id: my_id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let logger = silent_logger();
        let raw = RawNode::new(&raft_config, log.clone(), &logger)?;

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (leader_tx, leader_rx) = watch::channel(LeaderState::default());
        let (events, _) = broadcast::channel(64);

        let conn = rusqlite::Connection::open_in_memory()?;

        let worker = Worker {
            my_id,
            raw,
            log,
            conn,
            addrs,
            writers: HashMap::new(),
            pending: HashMap::new(),
            pending_conf: HashMap::new(),
            next_seq: 0,
            req_rx,
            msg_rx,
            leader_tx,
            events: events.clone(),
            transport: config.transport.clone(),
            peers: config.peers,
            request_timeout: config.request_timeout,
            last_role: StateRole::Follower,
            last_leader: 0,
            campaign: config.leader,
        };
        tokio::spawn(worker.run());
        tokio::spawn(accept_loop(config.transport, msg_tx));

        Ok(Self {
            req_tx,
            leader_rx,
            events,
        })
    }

    pub async fn execute(
        &self,
        stmts: Vec<String>,
        tx: bool,
    ) -> Result<Vec<ExecResult>, ClusterError> {
        let (respond, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Execute { stmts, tx, respond })
            .map_err(|_| ClusterError::RaftShutdown)?;
        rx.await.map_err(|_| ClusterError::RaftShutdown)?
    }

    pub async fn query(
        &self,
        stmts: Vec<String>,
        strong: bool,
    ) -> Result<Vec<Rows>, ClusterError> {
        let (respond, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Query {
                stmts,
                strong,
                respond,
            })
            .map_err(|_| ClusterError::RaftShutdown)?;
        rx.await.map_err(|_| ClusterError::RaftShutdown)?
    }

    pub async fn join(&self, addr: String) -> Result<(), ClusterError> {
        let (respond, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Join { addr, respond })
            .map_err(|_| ClusterError::RaftShutdown)?;
        rx.await.map_err(|_| ClusterError::RaftShutdown)?
    }

    pub async fn remove(&self, addr: String) -> Result<(), ClusterError> {
        let (respond, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Remove { addr, respond })
            .map_err(|_| ClusterError::RaftShutdown)?;
        rx.await.map_err(|_| ClusterError::RaftShutdown)?
    }

    pub async fn database(&self) -> Result<String, ClusterError> {
        let (respond, rx) = oneshot::channel();
        self.req_tx
            .send(Request::Database { respond })
            .map_err(|_| ClusterError::RaftShutdown)?;
        rx.await.map_err(|_| ClusterError::RaftShutdown)?
    }

    /// The last published raft state.
    pub fn leader_state(&self) -> LeaderState {
        self.leader_rx.borrow().clone()
    }

    /// Block until a leader is known, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, ClusterError> {
        let mut rx = self.leader_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                if let Some(addr) = rx.borrow().leader_addr.clone() {
                    return Ok(addr);
                }
                if rx.changed().await.is_err() {
                    return Err(ClusterError::RaftShutdown);
                }
            }
        })
        .await
        .map_err(|_| ClusterError::Internal(anyhow::anyhow!("timed out waiting for leader")))?
    }

    /// Subscribe to state, leader and vote observations.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Stop the worker.  Idempotent; pending requests fail with
    /// `RaftShutdown`.
    pub fn shutdown(&self) {
        let _ = self.req_tx.send(Request::Shutdown);
    }
}

/// Accept inbound transport connections and fan their frames into the
/// worker's message channel.
async fn accept_loop(transport: Arc<RaftTransport>, msg_tx: mpsc::UnboundedSender<Message>) {
    loop {
        match transport.accept().await {
            Ok(mut conn) => {
                let msg_tx = msg_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match codec::read_frame(&mut conn).await {
                            Ok(msg) => {
                                metrics::counter!(RAFT_FRAMES_IN_TOTAL).increment(1);
                                if msg_tx.send(msg).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                debug!("raft connection from {} done: {err}", conn.remote_addr());
                                return;
                            }
                        }
                    }
                });
            }
            Err(_) => return,
        }
    }
}

/// Dial a peer and drain its outbound queue, redialing on write
/// failure.  Messages that cannot be delivered are dropped; raft
/// retries on its own schedule.
async fn peer_writer(
    transport: Arc<RaftTransport>,
    addr: String,
    mut rx: mpsc::Receiver<Message>,
    timeout: Duration,
) {
    let mut conn = None;
    while let Some(msg) = rx.recv().await {
        if conn.is_none() {
            match transport.dial(&addr, timeout).await {
                Ok(c) => conn = Some(c),
                Err(err) => {
                    debug!("dropping raft message to {addr}: {err}");
                    continue;
                }
            }
        }
        if let Some(c) = conn.as_mut() {
            if let Err(err) = codec::write_frame(c, &msg).await {
                debug!("raft connection to {addr} broken: {err}");
                conn = None;
            } else {
                metrics::counter!(RAFT_FRAMES_OUT_TOTAL).increment(1);
            }
        }
    }
}

enum Pending {
    Execute(oneshot::Sender<Result<Vec<ExecResult>, ClusterError>>),
    Query(oneshot::Sender<Result<Vec<Rows>, ClusterError>>),
}

impl Pending {
    fn fail(self, err: ClusterError) {
        match self {
            Pending::Execute(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Query(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

enum Event {
    Tick,
    Req(Request),
    Msg(Message),
    Closed,
}

struct Worker {
    my_id: u64,
    raw: RawNode<LogStore>,
    log: LogStore,
    conn: rusqlite::Connection,
    /// id → dialable cluster address, learned from the peer file, from
    /// conf-change contexts and from replayed command proposers.
    addrs: HashMap<u64, String>,
    writers: HashMap<u64, mpsc::Sender<Message>>,
    pending: HashMap<u64, Pending>,
    pending_conf: HashMap<u64, oneshot::Sender<Result<(), ClusterError>>>,
    next_seq: u64,
    req_rx: mpsc::UnboundedReceiver<Request>,
    msg_rx: mpsc::UnboundedReceiver<Message>,
    leader_tx: watch::Sender<LeaderState>,
    events: broadcast::Sender<StoreEvent>,
    transport: Arc<RaftTransport>,
    peers: Arc<PeerStore>,
    request_timeout: Duration,
    last_role: StateRole,
    last_leader: u64,
    campaign: bool,
}

impl Worker {
    async fn run(mut self) {
        if self.campaign {
            if let Err(err) = self.raw.campaign() {
                error!("bootstrap campaign failed: {err}");
            }
        }
        self.process_ready();
        self.publish_state();

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            let event = tokio::select! {
                _ = tick.tick() => Event::Tick,
                req = self.req_rx.recv() => match req {
                    Some(Request::Shutdown) | None => Event::Closed,
                    Some(req) => Event::Req(req),
                },
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => Event::Msg(msg),
                    None => Event::Closed,
                },
            };

            match event {
                Event::Tick => {
                    self.raw.tick();
                }
                Event::Req(req) => self.handle_request(req),
                Event::Msg(msg) => self.step_message(msg),
                Event::Closed => break,
            }

            self.process_ready();
            self.publish_state();
        }

        info!("raft engine stopped");
        for (_, pending) in self.pending.drain() {
            pending.fail(ClusterError::RaftShutdown);
        }
        for (_, tx) in self.pending_conf.drain() {
            let _ = tx.send(Err(ClusterError::RaftShutdown));
        }
        let _ = self.events.send(StoreEvent::State(RaftRole::Shutdown));
        let _ = self.leader_tx.send(LeaderState {
            role: RaftRole::Shutdown,
            leader_addr: None,
        });
    }

    fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    fn step_message(&mut self, msg: Message) {
        if matches!(
            msg.msg_type,
            MessageType::MsgRequestVote | MessageType::MsgRequestPreVote
        ) {
            let _ = self.events.send(StoreEvent::Vote);
        }
        if let Err(err) = self.raw.step(msg) {
            debug!("raft step failed: {err}");
        }
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Execute { stmts, tx, respond } => {
                if !self.is_leader() {
                    let _ = respond.send(Err(ClusterError::NotLeader));
                    return;
                }
                self.propose_batch(stmts, tx, false, Pending::Execute(respond));
            }
            Request::Query {
                stmts,
                strong,
                respond,
            } => {
                if !self.is_leader() {
                    let _ = respond.send(Err(ClusterError::NotLeader));
                    return;
                }
                if strong {
                    // Linearizable: commit a read barrier through the log
                    // and run the SELECTs at apply time.
                    self.propose_batch(stmts, false, true, Pending::Query(respond));
                } else {
                    let _ = respond.send(self.query_local(&stmts));
                }
            }
            Request::Join { addr, respond } => {
                self.propose_membership(addr, ConfChangeType::AddNode, respond);
            }
            Request::Remove { addr, respond } => {
                self.propose_membership(addr, ConfChangeType::RemoveNode, respond);
            }
            Request::Database { respond } => {
                let _ = respond.send(self.dump_local());
            }
            Request::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    fn propose_batch(&mut self, stmts: Vec<String>, tx: bool, query: bool, pending: Pending) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let command = Command {
            proposer: self.my_id,
            proposer_addr: self.addrs[&self.my_id].clone(),
            seq,
            stmts,
            tx,
            query,
        };
        let data = match serde_json::to_vec(&command) {
            Ok(data) => data,
            Err(err) => {
                pending.fail(ClusterError::Internal(err.into()));
                return;
            }
        };

        match self.raw.propose(vec![], data) {
            Ok(()) => {
                metrics::counter!(RAFT_PROPOSALS_TOTAL).increment(1);
                self.pending.insert(seq, pending);
            }
            Err(raft::Error::ProposalDropped) => pending.fail(ClusterError::NotLeader),
            Err(err) => pending.fail(ClusterError::Internal(err.into())),
        }
    }

    fn propose_membership(
        &mut self,
        addr: String,
        change: ConfChangeType,
        respond: oneshot::Sender<Result<(), ClusterError>>,
    ) {
        if !self.is_leader() {
            let _ = respond.send(Err(ClusterError::NotLeader));
            return;
        }

        let id = node_id(&addr);
        let mut cc = ConfChange::default();
        cc.set_change_type(change);
        cc.node_id = id;
        cc.context = addr.clone().into_bytes().into();

        match self.raw.propose_conf_change(vec![], cc) {
            Ok(()) => {
                self.addrs.insert(id, addr);
                self.pending_conf.insert(id, respond);
            }
            Err(raft::Error::ProposalDropped) => {
                let _ = respond.send(Err(ClusterError::NotLeader));
            }
            Err(err) => {
                let _ = respond.send(Err(ClusterError::Internal(err.into())));
            }
        }
    }

    /// Drain all ready state: persist, apply, send.  Raft may produce
    /// several batches in quick succession, so loop until caught up.
    fn process_ready(&mut self) {
        while self.raw.has_ready() {
            let mut ready = self.raw.ready();

            if !ready.snapshot().is_empty() {
                // The log is never compacted, so no peer should ever
                // need a snapshot from us, nor we from a peer.
                warn!("ignoring unexpected raft snapshot");
            }
            if let Some(hs) = ready.hs() {
                self.log.set_hard_state(hs.clone());
            }
            if !ready.entries().is_empty() {
                self.log.append(ready.entries());
            }

            let committed = ready.take_committed_entries();
            let mut outbound = ready.take_messages();
            outbound.extend(ready.take_persisted_messages());
            self.apply_entries(committed);

            let mut light = self.raw.advance(ready);
            if let Some(commit) = light.commit_index() {
                self.log.set_commit(commit);
            }
            let committed = light.take_committed_entries();
            outbound.extend(light.take_messages());
            self.apply_entries(committed);
            self.raw.advance_apply();

            for msg in outbound {
                self.dispatch(msg);
            }
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.data.is_empty() {
                continue;
            }
            match entry.entry_type {
                EntryType::EntryNormal => self.apply_command(&entry),
                EntryType::EntryConfChange => self.apply_conf_change(&entry),
                EntryType::EntryConfChangeV2 => {
                    warn!("ignoring unsupported conf change entry");
                }
            }
        }
    }

    fn apply_command(&mut self, entry: &Entry) {
        let command: Command = match serde_json::from_slice(&entry.data) {
            Ok(command) => command,
            Err(err) => {
                error!("undecodable log entry {}: {err}", entry.index);
                return;
            }
        };

        self.addrs
            .entry(command.proposer)
            .or_insert_with(|| command.proposer_addr.clone());

        if command.query {
            if command.proposer == self.my_id {
                let result = self.query_local(&command.stmts);
                if let Some(Pending::Query(tx)) = self.pending.remove(&command.seq) {
                    let _ = tx.send(result);
                }
            }
            return;
        }

        let results = self.execute_local(&command.stmts, command.tx);
        if command.proposer == self.my_id {
            if let Some(Pending::Execute(tx)) = self.pending.remove(&command.seq) {
                let _ = tx.send(Ok(results));
            }
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry) {
        use protobuf::Message as _;

        let cc = match ConfChange::parse_from_bytes(entry.data.as_ref()) {
            Ok(cc) => cc,
            Err(err) => {
                error!("undecodable conf change {}: {err}", entry.index);
                return;
            }
        };
        let addr = String::from_utf8_lossy(cc.context.as_ref()).to_string();

        match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => {
                self.log.set_conf_state(conf_state);
                match cc.change_type {
                    ConfChangeType::AddNode => {
                        if !addr.is_empty() {
                            info!("raft voter added: {addr}");
                            self.addrs.insert(cc.node_id, addr);
                        }
                    }
                    ConfChangeType::RemoveNode => {
                        info!("raft voter removed: {addr}");
                        self.addrs.remove(&cc.node_id);
                        self.writers.remove(&cc.node_id);
                    }
                    _ => {}
                }
                if let Some(tx) = self.pending_conf.remove(&cc.node_id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(err) => {
                warn!("conf change for {addr} rejected: {err}");
                if let Some(tx) = self.pending_conf.remove(&cc.node_id) {
                    let _ = tx.send(Err(ClusterError::Internal(err.into())));
                }
            }
        }
    }

    /// Apply a statement batch to the local SQLite state.  Errors are
    /// recorded per statement; a transactional batch rolls back on the
    /// first failure.
    fn execute_local(&mut self, stmts: &[String], tx: bool) -> Vec<ExecResult> {
        let mut results = Vec::with_capacity(stmts.len());

        if tx {
            if let Err(err) = self.conn.execute_batch("BEGIN") {
                return vec![ExecResult::error(err.to_string())];
            }
        }

        let mut rollback = false;
        for stmt in stmts {
            match self.conn.execute(stmt, []) {
                Ok(changed) => results.push(ExecResult {
                    last_insert_id: self.conn.last_insert_rowid(),
                    rows_affected: changed as u64,
                    error: None,
                }),
                Err(err) => {
                    results.push(ExecResult::error(err.to_string()));
                    if tx {
                        rollback = true;
                        break;
                    }
                }
            }
        }

        if tx {
            let end = if rollback { "ROLLBACK" } else { "COMMIT" };
            if let Err(err) = self.conn.execute_batch(end) {
                results.push(ExecResult::error(err.to_string()));
            }
        }

        results
    }

    /// Run a SELECT batch against the local SQLite state.
    fn query_local(&self, stmts: &[String]) -> Result<Vec<Rows>, ClusterError> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            out.push(query_one(&self.conn, stmt)?);
        }
        Ok(out)
    }

    /// Render a SQL text dump of the replicated state: schema first,
    /// then an INSERT per row.
    fn dump_local(&self) -> Result<String, ClusterError> {
        let mut dump = String::new();

        let mut stmt = self
            .conn
            .prepare("SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY rowid")?;
        let schemas = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for schema in schemas {
            dump.push_str(&schema?);
            dump.push_str(";\n");
        }

        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
        )?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for table in tables {
            let mut stmt = self.conn.prepare(&format!("SELECT * FROM {table}"))?;
            let ncols = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut literals = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    literals.push(sql_literal(row.get_ref(i)?));
                }
                dump.push_str(&format!(
                    "INSERT INTO {table} VALUES ({});\n",
                    literals.join(", ")
                ));
            }
        }

        Ok(dump)
    }

    /// Route a raft message: local messages loop back, remote ones go
    /// to the peer's writer task.
    fn dispatch(&mut self, msg: Message) {
        if msg.to == self.my_id {
            self.step_message(msg);
            return;
        }

        let to = msg.to;
        let Some(addr) = self.addrs.get(&to).cloned() else {
            debug!("no address for raft peer {to}, dropping message");
            return;
        };

        let sender = self.writers.entry(to).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PEER_SEND_BUFFER);
            tokio::spawn(peer_writer(
                self.transport.clone(),
                addr,
                rx,
                self.request_timeout,
            ));
            tx
        });

        if sender.try_send(msg).is_err() {
            // Writer is gone or saturated; rebuild it on the next send.
            self.writers.remove(&to);
        }
    }

    /// Publish role and leader observations.  A leader change is held
    /// back until the leader's address is resolvable, so observers can
    /// always act on it.
    fn publish_state(&mut self) {
        let role = self.raw.raft.state;
        let leader = self.raw.raft.leader_id;

        if role != self.last_role {
            if self.last_role == StateRole::Leader {
                // Demoted with proposals in flight: they will never
                // resolve here, the new leader must re-execute them.
                for (_, pending) in self.pending.drain() {
                    pending.fail(ClusterError::NotLeader);
                }
            }
            self.last_role = role;
            let _ = self.events.send(StoreEvent::State(role.into()));
        }

        if leader != self.last_leader {
            let addr = self.addrs.get(&leader).cloned().or_else(|| {
                self.peers
                    .members()
                    .into_iter()
                    .find(|m| node_id(&m.addr) == leader)
                    .map(|m| m.addr)
            });
            if leader != 0 && addr.is_none() {
                // Not dialable yet; retry once log replay names it.
                return;
            }
            self.last_leader = leader;
            let _ = self.events.send(StoreEvent::Leader(addr.clone()));
            let _ = self.leader_tx.send(LeaderState {
                role: role.into(),
                leader_addr: addr,
            });
        } else if RaftRole::from(role) != self.leader_tx.borrow().role {
            let leader_addr = self.leader_tx.borrow().leader_addr.clone();
            let _ = self.leader_tx.send(LeaderState { role: role.into(), leader_addr });
        }
    }
}

/// Execute one SELECT and collect its rowset.
fn query_one(conn: &rusqlite::Connection, sql: &str) -> Result<Rows, ClusterError> {
    let mut stmt = conn.prepare(sql)?;

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let types: Vec<String> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().unwrap_or("").to_lowercase())
        .collect();

    let ncols = columns.len();
    let mut values = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut rendered = Vec::with_capacity(ncols);
        for i in 0..ncols {
            rendered.push(json_value(row.get_ref(i)?));
        }
        values.push(rendered);
    }

    Ok(Rows {
        columns,
        types,
        values,
    })
}

fn json_value(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine as _;
            serde_json::Value::from(STANDARD.encode(b))
        }
    }
}

/// Render a stored value as a SQL literal for the dump.
fn sql_literal(value: rusqlite::types::ValueRef<'_>) -> String {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => format!(
            "'{}'",
            String::from_utf8_lossy(t).replace('\'', "''")
        ),
        ValueRef::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

impl From<StateRole> for RaftRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Leader => RaftRole::Leader,
            StateRole::Follower => RaftRole::Follower,
            StateRole::Candidate => RaftRole::Candidate,
            StateRole::PreCandidate => RaftRole::PreCandidate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsIdentity;
    use tempfile::TempDir;

    #[test]
    fn test_node_id_deterministic_and_nonzero() {
        assert_eq!(node_id("10.0.0.1:8443"), node_id("10.0.0.1:8443"));
        assert_ne!(node_id("10.0.0.1:8443"), node_id("10.0.0.2:8443"));
        assert_ne!(node_id(""), 0);
    }

    fn bootstrap_leader(dir: &TempDir) -> Engine {
        let peers = Arc::new(PeerStore::open(dir.path()).unwrap());
        let identity = TlsIdentity {
            cert_pem: String::new(),
            key_pem: String::new(),
        };
        let transport = Arc::new(RaftTransport::new(
            "127.0.0.1:8443".into(),
            identity,
            peers.clone(),
        ));
        Engine::start(EngineConfig {
            my_addr: "127.0.0.1:8443".into(),
            leader: true,
            peers,
            transport,
            request_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_node_execute_and_query() {
        let dir = TempDir::new().unwrap();
        let engine = bootstrap_leader(&dir);

        let leader = engine
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(leader, "127.0.0.1:8443");

        let results = engine
            .execute(
                vec![
                    "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)".into(),
                    "INSERT INTO kv (k, v) VALUES ('x', '1')".into(),
                ],
                false,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.is_none()));
        assert_eq!(results[1].rows_affected, 1);

        // Weak read.
        let rows = engine
            .query(vec!["SELECT v FROM kv WHERE k = 'x'".into()], false)
            .await
            .unwrap();
        assert_eq!(rows[0].values, vec![vec![serde_json::json!("1")]]);
        assert_eq!(rows[0].columns, vec!["v"]);

        // Strong read goes through the log and sees the same value.
        let rows = engine
            .query(vec!["SELECT v FROM kv WHERE k = 'x'".into()], true)
            .await
            .unwrap();
        assert_eq!(rows[0].values, vec![vec![serde_json::json!("1")]]);

        let dump = engine.database().await.unwrap();
        assert!(dump.contains("CREATE TABLE kv"));
        assert!(dump.contains("INSERT INTO kv VALUES ('x', '1');"));
    }

    #[tokio::test]
    async fn test_statement_error_is_recorded() {
        let dir = TempDir::new().unwrap();
        let engine = bootstrap_leader(&dir);
        engine
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let results = engine
            .execute(vec!["INSERT INTO missing VALUES (1)".into()], false)
            .await
            .unwrap();
        assert!(results[0].error.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_emits_observation() {
        let dir = TempDir::new().unwrap();
        let engine = bootstrap_leader(&dir);
        engine
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let mut events = engine.subscribe();
        engine.shutdown();

        loop {
            match events.recv().await {
                Ok(StoreEvent::State(RaftRole::Shutdown)) => break,
                Ok(_) => continue,
                Err(err) => panic!("observer channel closed early: {err}"),
            }
        }

        assert!(matches!(
            engine.execute(vec!["SELECT 1".into()], false).await,
            Err(ClusterError::RaftShutdown)
        ));
    }
}
