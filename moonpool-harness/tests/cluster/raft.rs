//! A compact Raft used to drive the harness end to end.
//!
//! Election, replication, persistence and snapshot installation are all
//! here; the goal is a node that behaves correctly on the simulated
//! network, not a fast one.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moonpool_harness::{
    ApplyMsg, Command, ConsensusNode, LogIndex, NodeFactory, NodeId, PeerLink, Persister,
    Proposal, RpcService, Term,
};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(10);
const HEARTBEAT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    term: Term,
    command: Command,
}

#[derive(Serialize, Deserialize)]
struct Durable {
    current_term: Term,
    voted_for: Option<NodeId>,
    base: LogIndex,
    log: Vec<Entry>,
}

#[derive(Serialize, Deserialize)]
struct VoteArgs {
    term: Term,
    candidate: NodeId,
    last_log_index: LogIndex,
    last_log_term: Term,
}

#[derive(Serialize, Deserialize)]
struct VoteReply {
    term: Term,
    granted: bool,
}

#[derive(Serialize, Deserialize)]
struct AppendArgs {
    term: Term,
    prev_log_index: LogIndex,
    prev_log_term: Term,
    entries: Vec<Entry>,
    leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize)]
struct AppendReply {
    term: Term,
    success: bool,
    next_index: LogIndex,
}

#[derive(Serialize, Deserialize)]
struct SnapshotArgs {
    term: Term,
    last_included_index: LogIndex,
    last_included_term: Term,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotReply {
    term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct State {
    current_term: Term,
    voted_for: Option<NodeId>,
    /// `log[0]` stands for the entry at `base`, the last compacted index.
    log: Vec<Entry>,
    base: LogIndex,
    commit_index: LogIndex,
    last_applied: LogIndex,
    role: Role,
    votes: usize,
    last_heard: Instant,
    election_timeout: Duration,
    last_heartbeat: Option<Instant>,
    next_index: Vec<LogIndex>,
    match_index: Vec<LogIndex>,
    pending_snapshot: Option<ApplyMsg>,
}

fn election_timeout() -> Duration {
    Duration::from_millis(rand::rng().random_range(150..300))
}

impl State {
    fn new(servers: usize) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: vec![Entry {
                term: 0,
                command: Command::null(),
            }],
            base: 0,
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            votes: 0,
            last_heard: Instant::now(),
            election_timeout: election_timeout(),
            last_heartbeat: None,
            next_index: vec![1; servers],
            match_index: vec![0; servers],
            pending_snapshot: None,
        }
    }

    fn last_index(&self) -> LogIndex {
        self.base + self.log.len() as LogIndex - 1
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        let offset = index.checked_sub(self.base)?;
        self.log.get(offset as usize).map(|e| e.term)
    }

    fn observe_term(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
        }
    }

    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&Durable {
            current_term: self.current_term,
            voted_for: self.voted_for,
            base: self.base,
            log: self.log.clone(),
        })
        .expect("raft state serializes")
    }
}

enum Outbound {
    Append(AppendArgs),
    Snapshot(SnapshotArgs),
}

/// One Raft peer.
pub struct RaftNode {
    me: NodeId,
    peers: Vec<PeerLink>,
    persister: Persister,
    state: Mutex<State>,
    applied: Notify,
    dead: CancellationToken,
}

impl RaftNode {
    fn start(
        peers: Vec<PeerLink>,
        me: NodeId,
        persister: Persister,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<Self> {
        let mut state = State::new(peers.len());
        let raw = persister.read_raft_state();
        if !raw.is_empty() {
            let durable: Durable = serde_json::from_slice(&raw).expect("raft state decodes");
            state.current_term = durable.current_term;
            state.voted_for = durable.voted_for;
            state.base = durable.base;
            state.log = durable.log;
            state.commit_index = durable.base;
            state.last_applied = durable.base;
        }

        let node = Arc::new(Self {
            me,
            peers,
            persister,
            state: Mutex::new(state),
            applied: Notify::new(),
            dead: CancellationToken::new(),
        });
        tokio::spawn(ticker(node.clone()));
        tokio::spawn(applier(node.clone(), apply_tx));
        node
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &State) {
        self.persister.save_raft_state(state.encode());
    }

    fn majority(&self, count: usize) -> bool {
        count * 2 > self.peers.len()
    }

    fn become_leader(&self, state: &mut State) {
        state.role = Role::Leader;
        let next = state.last_index() + 1;
        state.next_index = vec![next; self.peers.len()];
        state.match_index = vec![0; self.peers.len()];
        state.match_index[self.me] = next - 1;
        state.last_heartbeat = None;
        tracing::debug!(node = self.me, term = state.current_term, "became leader");
    }

    fn advance_commit(&self, state: &mut State) {
        for index in (state.commit_index + 1..=state.last_index()).rev() {
            if state.term_at(index) != Some(state.current_term) {
                continue;
            }
            let replicas = state.match_index.iter().filter(|&&m| m >= index).count();
            if self.majority(replicas) {
                state.commit_index = index;
                self.applied.notify_one();
                break;
            }
        }
    }

    async fn call<R: DeserializeOwned>(&self, peer: NodeId, method: &str, args: Vec<u8>) -> Option<R> {
        let reply = self.peers[peer].call(method, args).await?;
        serde_json::from_slice(&reply).ok()
    }

    fn campaign(self: &Arc<Self>, args: VoteArgs) {
        let term = args.term;
        let bytes = serde_json::to_vec(&args).expect("vote args serialize");
        for peer in (0..self.peers.len()).filter(|&p| p != self.me) {
            let node = self.clone();
            let bytes = bytes.clone();
            tokio::spawn(async move {
                let Some(reply) = node.call::<VoteReply>(peer, "Raft.RequestVote", bytes).await
                else {
                    return;
                };
                let mut state = node.lock();
                if reply.term > state.current_term {
                    state.observe_term(reply.term);
                    node.persist(&state);
                    return;
                }
                if state.role == Role::Candidate && state.current_term == term && reply.granted {
                    state.votes += 1;
                    if node.majority(state.votes) {
                        node.become_leader(&mut state);
                    }
                }
            });
        }
    }

    fn replicate(self: &Arc<Self>) {
        for peer in (0..self.peers.len()).filter(|&p| p != self.me) {
            let node = self.clone();
            tokio::spawn(async move { node.sync_peer(peer).await });
        }
    }

    async fn sync_peer(&self, peer: NodeId) {
        let (term, outbound) = {
            let state = self.lock();
            if state.role != Role::Leader {
                return;
            }
            let next = state.next_index[peer].min(state.last_index() + 1);
            let outbound = if next <= state.base {
                Outbound::Snapshot(SnapshotArgs {
                    term: state.current_term,
                    last_included_index: state.base,
                    last_included_term: state.log[0].term,
                    data: self.persister.read_snapshot(),
                })
            } else {
                let prev = next - 1;
                Outbound::Append(AppendArgs {
                    term: state.current_term,
                    prev_log_index: prev,
                    prev_log_term: state.term_at(prev).unwrap_or(0),
                    entries: state.log[(next - state.base) as usize..].to_vec(),
                    leader_commit: state.commit_index,
                })
            };
            (state.current_term, outbound)
        };

        match outbound {
            Outbound::Append(args) => {
                let matched = args.prev_log_index + args.entries.len() as LogIndex;
                let bytes = serde_json::to_vec(&args).expect("append args serialize");
                let Some(reply) = self.call::<AppendReply>(peer, "Raft.AppendEntries", bytes).await
                else {
                    return;
                };
                let mut state = self.lock();
                if reply.term > state.current_term {
                    state.observe_term(reply.term);
                    self.persist(&state);
                    return;
                }
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
                if reply.success {
                    if matched > state.match_index[peer] {
                        state.match_index[peer] = matched;
                    }
                    state.next_index[peer] = state.match_index[peer] + 1;
                    self.advance_commit(&mut state);
                } else {
                    state.next_index[peer] = reply.next_index.max(1);
                }
            }
            Outbound::Snapshot(args) => {
                let included = args.last_included_index;
                let bytes = serde_json::to_vec(&args).expect("snapshot args serialize");
                let Some(reply) = self
                    .call::<SnapshotReply>(peer, "Raft.InstallSnapshot", bytes)
                    .await
                else {
                    return;
                };
                let mut state = self.lock();
                if reply.term > state.current_term {
                    state.observe_term(reply.term);
                    self.persist(&state);
                    return;
                }
                if state.role == Role::Leader && state.current_term == term {
                    if included > state.match_index[peer] {
                        state.match_index[peer] = included;
                    }
                    state.next_index[peer] = state.match_index[peer] + 1;
                }
            }
        }
    }

    fn request_vote(&self, args: VoteArgs) -> VoteReply {
        let mut state = self.lock();
        state.observe_term(args.term);
        let mut granted = false;
        let free = state.voted_for.is_none() || state.voted_for == Some(args.candidate);
        if args.term == state.current_term && free {
            let last = state.last_index();
            let last_term = state.term_at(last).unwrap_or(0);
            let up_to_date = args.last_log_term > last_term
                || (args.last_log_term == last_term && args.last_log_index >= last);
            if up_to_date {
                state.voted_for = Some(args.candidate);
                state.last_heard = Instant::now();
                granted = true;
            }
        }
        self.persist(&state);
        VoteReply {
            term: state.current_term,
            granted,
        }
    }

    fn append_entries(&self, args: AppendArgs) -> AppendReply {
        let mut state = self.lock();
        if args.term < state.current_term {
            return AppendReply {
                term: state.current_term,
                success: false,
                next_index: 0,
            };
        }
        state.observe_term(args.term);
        state.role = Role::Follower;
        state.last_heard = Instant::now();

        let prev = args.prev_log_index;
        let reject = |state: &State, next_index: LogIndex| AppendReply {
            term: state.current_term,
            success: false,
            next_index,
        };
        if prev < state.base {
            self.persist(&state);
            return reject(&*state, state.base + 1);
        }
        if prev > state.last_index() {
            self.persist(&state);
            return reject(&*state, state.last_index() + 1);
        }
        let local = state.term_at(prev);
        if local != Some(args.prev_log_term) {
            let mut first = prev;
            while first > state.base + 1 && state.term_at(first - 1) == local {
                first -= 1;
            }
            self.persist(&state);
            return reject(&*state, first.max(state.base + 1));
        }

        let appended = args.entries.len() as LogIndex;
        for (i, entry) in args.entries.into_iter().enumerate() {
            let index = prev + 1 + i as LogIndex;
            match state.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    let keep = (index - state.base) as usize;
                    state.log.truncate(keep);
                    state.log.push(entry);
                }
                None => state.log.push(entry),
            }
        }

        let commit = args.leader_commit.min(prev + appended);
        if commit > state.commit_index {
            state.commit_index = commit;
            self.applied.notify_one();
        }
        self.persist(&state);
        AppendReply {
            term: state.current_term,
            success: true,
            next_index: prev + appended + 1,
        }
    }

    fn install_snapshot(&self, args: SnapshotArgs) -> SnapshotReply {
        let mut state = self.lock();
        if args.term < state.current_term {
            return SnapshotReply {
                term: state.current_term,
            };
        }
        state.observe_term(args.term);
        state.role = Role::Follower;
        state.last_heard = Instant::now();

        let index = args.last_included_index;
        if index <= state.commit_index {
            self.persist(&state);
            return SnapshotReply {
                term: state.current_term,
            };
        }

        let suffix = if state.term_at(index) == Some(args.last_included_term) {
            state.log[(index - state.base) as usize + 1..].to_vec()
        } else {
            Vec::new()
        };
        state.log = vec![Entry {
            term: args.last_included_term,
            command: Command::null(),
        }];
        state.log.extend(suffix);
        state.base = index;
        state.commit_index = index;
        state.last_applied = index;
        state.pending_snapshot = Some(ApplyMsg::Snapshot {
            index,
            term: args.last_included_term,
            data: args.data.clone(),
        });
        self.persister.save(state.encode(), args.data);
        self.applied.notify_one();
        tracing::debug!(node = self.me, index, "installed snapshot");
        SnapshotReply {
            term: state.current_term,
        }
    }
}

async fn ticker(node: Arc<RaftNode>) {
    loop {
        tokio::select! {
            _ = node.dead.cancelled() => return,
            _ = tokio::time::sleep(TICK) => {}
        }

        let mut replicate = false;
        let mut election = None;
        {
            let mut state = node.lock();
            match state.role {
                Role::Leader => {
                    if state.last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT) {
                        state.last_heartbeat = Some(Instant::now());
                        replicate = true;
                    }
                }
                Role::Follower | Role::Candidate => {
                    if state.last_heard.elapsed() >= state.election_timeout {
                        state.current_term += 1;
                        state.voted_for = Some(node.me);
                        state.role = Role::Candidate;
                        state.votes = 1;
                        state.last_heard = Instant::now();
                        state.election_timeout = election_timeout();
                        node.persist(&state);
                        if node.majority(state.votes) {
                            node.become_leader(&mut state);
                        } else {
                            let last = state.last_index();
                            election = Some(VoteArgs {
                                term: state.current_term,
                                candidate: node.me,
                                last_log_index: last,
                                last_log_term: state.term_at(last).unwrap_or(0),
                            });
                        }
                    }
                }
            }
        }

        if replicate {
            node.replicate();
        }
        if let Some(args) = election {
            node.campaign(args);
        }
    }
}

async fn applier(node: Arc<RaftNode>, apply_tx: mpsc::Sender<ApplyMsg>) {
    loop {
        let next = {
            let mut state = node.lock();
            if let Some(msg) = state.pending_snapshot.take() {
                Some(msg)
            } else if state.last_applied < state.commit_index {
                let index = state.last_applied + 1;
                state.last_applied = index;
                index
                    .checked_sub(state.base)
                    .and_then(|offset| state.log.get(offset as usize))
                    .filter(|_| index > state.base)
                    .map(|entry| ApplyMsg::Command {
                        index,
                        command: entry.command.clone(),
                    })
            } else {
                None
            }
        };

        match next {
            Some(msg) => {
                tokio::select! {
                    _ = node.dead.cancelled() => return,
                    sent = apply_tx.send(msg) => if sent.is_err() { return },
                }
            }
            None => {
                tokio::select! {
                    _ = node.dead.cancelled() => return,
                    _ = node.applied.notified() => {}
                    _ = tokio::time::sleep(TICK) => {}
                }
            }
        }
    }
}

fn respond<A: DeserializeOwned, R: Serialize>(args: &[u8], handler: impl FnOnce(A) -> R) -> Option<Vec<u8>> {
    let args = serde_json::from_slice(args).ok()?;
    serde_json::to_vec(&handler(args)).ok()
}

#[async_trait]
impl RpcService for RaftNode {
    async fn handle(&self, method: &str, args: Vec<u8>) -> Option<Vec<u8>> {
        if self.dead.is_cancelled() {
            return None;
        }
        match method {
            "Raft.RequestVote" => respond(&args, |a: VoteArgs| self.request_vote(a)),
            "Raft.AppendEntries" => respond(&args, |a: AppendArgs| self.append_entries(a)),
            "Raft.InstallSnapshot" => respond(&args, |a: SnapshotArgs| self.install_snapshot(a)),
            _ => None,
        }
    }
}

impl ConsensusNode for RaftNode {
    fn propose(&self, command: Command) -> Proposal {
        let mut state = self.lock();
        if self.dead.is_cancelled() || state.role != Role::Leader {
            return Proposal::rejected(state.current_term);
        }
        let term = state.current_term;
        state.log.push(Entry { term, command });
        let index = state.last_index();
        state.match_index[self.me] = index;
        state.last_heartbeat = None;
        self.persist(&state);
        self.advance_commit(&mut state);
        Proposal {
            index,
            term,
            is_leader: true,
        }
    }

    fn state(&self) -> (Term, bool) {
        let state = self.lock();
        (state.current_term, state.role == Role::Leader)
    }

    fn snapshot(&self, index: LogIndex, snapshot: Vec<u8>) {
        let mut state = self.lock();
        if index <= state.base || index > state.last_index() {
            return;
        }
        let offset = (index - state.base) as usize;
        state.log.drain(..offset);
        state.log[0].command = Command::null();
        state.base = index;
        self.persister.save(state.encode(), snapshot);
    }

    fn kill(&self) {
        self.dead.cancel();
    }
}

/// Builds [`RaftNode`]s for the harness.
#[derive(Debug, Default, Clone, Copy)]
pub struct RaftFactory;

impl NodeFactory for RaftFactory {
    type Node = RaftNode;

    fn make(
        &self,
        peers: Vec<PeerLink>,
        me: NodeId,
        persister: Persister,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<RaftNode> {
        RaftNode::start(peers, me, persister, apply_tx)
    }
}
