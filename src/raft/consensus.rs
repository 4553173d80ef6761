use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{LedgerError, Result};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, Configuration, Entry, EntryType, Server,
    SimpleConfiguration, VoteRequest, VoteResponse,
};
use crate::raft::invariants::Invariants;
use crate::raft::log::{Log, LogSync};
use crate::raft::membership::{Membership, MembershipState};
use crate::raft::peer;
use crate::raft::timer;

/// This server's role in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Outcome of a completed SetConfiguration call. Leadership and transient
/// failures surface as errors instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetConfigurationOutcome {
    Ok,
    /// The supplied old id no longer identifies the current configuration.
    Changed,
    /// These servers failed to catch up; the change was aborted.
    Bad(Vec<Server>),
}

/// Point-in-time view of the consensus state, for services and tests.
#[derive(Debug, Clone)]
pub struct ConsensusStatus {
    pub role: Role,
    pub current_term: u64,
    pub committed_id: u64,
    pub last_log_id: u64,
    pub leader_id: Option<u64>,
}

/// All mutable consensus state, protected by the one lock in
/// [`RaftConsensus`]. Workers take the lock, read or mutate, and signal the
/// shared `state_changed` condition; RPCs and other slow I/O always happen
/// with the lock released.
pub(crate) struct ConsensusInner {
    pub(crate) role: Role,
    /// Monotonic. Persist with `update_metadata` after changing.
    pub(crate) current_term: u64,
    /// Set at most once per term. Persist with `update_metadata`.
    pub(crate) voted_for: Option<u64>,
    /// Best guess at this term's leader, for redirecting clients.
    pub(crate) leader_id: Option<u64>,
    /// Largest entry id known to be stored on a quorum. Monotonic.
    pub(crate) committed_id: u64,
    /// Logical clock used to confirm leadership and connectivity.
    pub(crate) current_epoch: u64,
    /// Elections participated in since last becoming a candidate.
    pub(crate) election_attempt: u64,
    /// When the election timer fires next. Pushed far out while leader.
    pub(crate) start_election_at: Instant,
    pub(crate) exiting: bool,
    pub(crate) num_peer_tasks: u32,
    pub(crate) log: Log,
    pub(crate) membership: Membership,
    invariants: Option<Invariants>,
}

/// The Raft consensus monitor: one lock over all of the state above, one
/// broadcast condition (`state_changed`), one replicator task per peer, an
/// election timer task, and a leader-lease monitor task.
///
/// Log mutations under the lock only touch memory and queue file
/// operations; the queue is flushed through `log_sync` with the lock
/// released, then the durable prefix is folded back in under the lock.
pub struct RaftConsensus {
    pub id: u64,
    pub(crate) config: NodeConfig,
    pub(crate) inner: Mutex<ConsensusInner>,
    pub(crate) state_changed: Notify,
    pub(crate) log_sync: Arc<LogSync>,
    commit_tx: watch::Sender<u64>,
}

/// Names the log state a caller mutated under the lock and must make
/// durable before acting on it externally. Captured while still holding the
/// lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncMarker {
    pub(crate) seq: u64,
    pub(crate) last_id: u64,
}

fn data_entry(term: u64, data: Vec<u8>) -> Entry {
    Entry {
        term,
        r#type: EntryType::Data as i32,
        configuration: None,
        data,
    }
}

fn config_entry(term: u64, configuration: Configuration) -> Entry {
    Entry {
        term,
        r#type: EntryType::Configuration as i32,
        configuration: Some(configuration),
        data: Vec::new(),
    }
}

pub(crate) fn entry_is_config(entry: &Entry) -> bool {
    entry.r#type == EntryType::Configuration as i32
}

/// Effectively "never" for the election timer while leader.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600 * 24 * 365)
}

impl RaftConsensus {
    /// Open storage and restore persisted state. Workers are not started
    /// until [`init`](Self::init).
    pub fn new(config: NodeConfig) -> io::Result<Arc<Self>> {
        let log = Log::open(config.storage_dir.clone())?;
        let now = Instant::now();
        let membership = Membership::new(config.node_id, config.advertise_addr.clone(), now);

        let mut inner = ConsensusInner {
            role: Role::Follower,
            current_term: log.metadata.current_term,
            voted_for: match log.metadata.voted_for {
                0 => None,
                id => Some(id),
            },
            leader_id: None,
            committed_id: 0,
            current_epoch: 0,
            election_attempt: 0,
            start_election_at: now + timer::follower_timeout(config.follower_timeout_ms),
            exiting: false,
            num_peer_tasks: 0,
            log,
            membership,
            invariants: Some(Invariants::new(config.heartbeat_period_ms)),
        };

        if config.bootstrap && inner.log.last_id() == 0 {
            let mut servers = vec![Server {
                server_id: config.node_id,
                address: config.advertise_addr.clone(),
            }];
            for peer in &config.peers {
                servers.push(Server {
                    server_id: peer.node_id,
                    address: peer.addr.clone(),
                });
            }
            servers.sort_by_key(|s| s.server_id);
            let description = Configuration {
                prev_configuration: Some(SimpleConfiguration { servers }),
                next_configuration: None,
            };
            let entry_id = inner.log.append(config_entry(1, description.clone()));
            inner.log.sync_blocking();
            inner.membership.set_configuration(entry_id, description, now);
            tracing::info!(
                node_id = config.node_id,
                entry_id,
                "Bootstrapped initial cluster configuration"
            );
        } else {
            inner.scan_for_configuration(now);
        }
        // Everything read back from (or just flushed to) disk is durable.
        inner.membership.local_mut().last_agree_id = inner.log.last_id();

        let log_sync = inner.log.sync_handle();
        Ok(Arc::new(Self {
            id: config.node_id,
            config,
            inner: Mutex::new(inner),
            state_changed: Notify::new(),
            log_sync,
            commit_tx: watch::channel(0).0,
        }))
    }

    /// Flush the log's queued writes past `marker`, then fold the durable
    /// prefix into the local server's agreement and re-run commitment. The
    /// flush happens with the consensus lock released; the loop picks up
    /// writes queued by commitment itself (a configuration change can append
    /// the next configuration entry).
    pub(crate) async fn sync_log(&self, marker: SyncMarker) {
        let mut marker = marker;
        loop {
            self.log_sync.sync(marker.seq).await;
            let mut inner = self.inner.lock().await;
            let durable = marker.last_id.min(inner.log.last_id());
            let local = inner.membership.local_mut();
            if durable > local.last_agree_id {
                local.last_agree_id = durable;
            }
            inner.advance_committed_id(&self.config);
            let next = inner.sync_marker();
            self.finish(&mut inner);
            if next.seq == marker.seq && next.last_id == marker.last_id {
                return;
            }
            marker = next;
        }
    }

    /// Start the election timer, the leader-lease monitor, and a replicator
    /// task per known peer. Returns the long-lived worker handles.
    pub async fn init(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        {
            let mut inner = self.inner.lock().await;
            inner.set_follower_timer(&self.config);
            self.spawn_peer_tasks(&mut inner);
            self.finish(&mut inner);
        }
        vec![
            tokio::spawn(timer_main(self.clone())),
            tokio::spawn(lease_main(self.clone())),
        ]
    }

    /// Ask every worker to exit and cancel all in-flight RPCs.
    pub async fn exit(&self) {
        let mut inner = self.inner.lock().await;
        inner.exiting = true;
        inner.interrupt_all();
        self.finish(&mut inner);
    }

    /// Wait until every replicator task has observed the exit.
    pub async fn join_peer_tasks(&self) {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.num_peer_tasks == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Re-check invariants, publish the commit index, and wake every
    /// waiter. Called at the end of every operation that may have mutated
    /// state, while still holding the lock.
    pub(crate) fn finish(&self, inner: &mut ConsensusInner) {
        inner.check_invariants();
        let committed = inner.committed_id;
        self.commit_tx.send_if_modified(|current| {
            if *current != committed {
                *current = committed;
                true
            } else {
                false
            }
        });
        self.state_changed.notify_waiters();
    }

    /// Watch the commit index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Process a RequestVote RPC from a candidate. The reply reveals our
    /// term and vote, so it leaves only after they are durable.
    pub async fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let (resp, marker) = {
            let mut inner = self.inner.lock().await;
            if req.term > inner.current_term {
                inner.step_down(&self.config, req.term);
            }

            let mut granted = false;
            if req.term == inner.current_term {
                let log_ok = (req.last_log_term, req.last_log_id)
                    >= (inner.log.last_term(), inner.log.last_id());
                let can_vote =
                    inner.voted_for.is_none() || inner.voted_for == Some(req.server_id);
                if log_ok && can_vote {
                    granted = true;
                    if inner.voted_for != Some(req.server_id) {
                        inner.voted_for = Some(req.server_id);
                        inner.update_metadata();
                    }
                    inner.set_follower_timer(&self.config);
                }
            }

            tracing::debug!(
                node_id = self.id,
                candidate = req.server_id,
                term = req.term,
                granted,
                "RequestVote handled"
            );
            let resp = VoteResponse {
                term: inner.current_term,
                granted,
                last_log_term: inner.log.last_term(),
                last_log_id: inner.log.last_id(),
                begin_last_term_id: inner.log.begin_last_term_id(),
            };
            let marker = inner.sync_marker();
            self.finish(&mut inner);
            (resp, marker)
        };
        self.sync_log(marker).await;
        resp
    }

    /// Process an AppendEntries RPC from a leader. The success reply is an
    /// acknowledgement the leader counts toward commitment, so it leaves
    /// only after the appended entries (and any term change) are durable.
    pub async fn handle_append_entries(
        self: &Arc<Self>,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let (resp, marker) = {
            let mut inner = self.inner.lock().await;
            let resp = self.append_entries_locked(&mut inner, req);
            (resp, inner.sync_marker())
        };
        self.sync_log(marker).await;
        resp
    }

    fn append_entries_locked(
        self: &Arc<Self>,
        inner: &mut ConsensusInner,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        if req.term < inner.current_term {
            return inner.append_entries_response(false);
        }
        if req.term > inner.current_term || inner.role == Role::Candidate {
            inner.step_down(&self.config, req.term);
        }
        debug_assert!(
            inner.role != Role::Leader,
            "two leaders in term {}",
            inner.current_term
        );
        inner.leader_id = Some(req.server_id);
        inner.set_follower_timer(&self.config);

        if req.prev_log_id != 0
            && (req.prev_log_id > inner.log.last_id()
                || inner.log.get_term(req.prev_log_id) != req.prev_log_term)
        {
            tracing::debug!(
                node_id = self.id,
                prev_log_id = req.prev_log_id,
                prev_log_term = req.prev_log_term,
                last_log_id = inner.log.last_id(),
                "Rejecting AppendEntries, log inconsistent at prev_log_id"
            );
            let resp = inner.append_entries_response(false);
            self.finish(inner);
            return resp;
        }

        let now = Instant::now();
        let mut entry_id = req.prev_log_id;
        for entry in &req.entries {
            entry_id += 1;
            if entry_id <= inner.log.last_id() {
                if inner.log.get_term(entry_id) == entry.term {
                    continue;
                }
                debug_assert!(
                    entry_id > inner.committed_id,
                    "refusing to truncate a committed entry"
                );
                tracing::debug!(
                    node_id = self.id,
                    from_id = entry_id,
                    "Truncating divergent log tail"
                );
                inner.log.truncate(entry_id - 1);
                // The durable prefix shrank with it.
                let local = inner.membership.local_mut();
                local.last_agree_id = local.last_agree_id.min(entry_id - 1);
            }
            let assigned = inner.log.append(entry.clone());
            debug_assert_eq!(assigned, entry_id);
            if entry_is_config(entry) {
                inner.membership.set_configuration(
                    assigned,
                    entry.configuration.clone().unwrap_or_default(),
                    now,
                );
            }
        }
        if inner.membership.id > inner.log.last_id() {
            inner.scan_for_configuration(now);
        }

        let new_committed = req.committed_id.min(inner.log.last_id());
        if new_committed > inner.committed_id {
            inner.committed_id = new_committed;
            tracing::trace!(
                node_id = self.id,
                committed_id = new_committed,
                "Commit index advanced by leader"
            );
        }

        self.spawn_peer_tasks(inner);
        let resp = inner.append_entries_response(true);
        self.finish(inner);
        resp
    }

    /// Submit an operation to the replicated log and wait for it to commit.
    /// Returns the assigned entry id.
    pub async fn replicate(&self, payload: Vec<u8>) -> Result<u64> {
        // Wait until this server is a leader that has committed an entry in
        // its own term; only then may client operations enter the log.
        let (entry_id, term, marker) = loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if inner.exiting {
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                match inner.role {
                    Role::Leader if inner.leader_ready() => {
                        let term = inner.current_term;
                        let entry_id = inner.append(data_entry(term, payload.clone()));
                        let marker = inner.sync_marker();
                        self.finish(&mut inner);
                        break (entry_id, term, marker);
                    }
                    Role::Leader => {}
                    _ => return Err(LedgerError::NotLeader(inner.leader_hint())),
                }
            }
            notified.await;
        };

        tracing::debug!(node_id = self.id, entry_id, term, "Appended client entry");
        // The entry counts toward its own quorum only once durable here.
        self.sync_log(marker).await;

        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.committed_id >= entry_id {
                    if inner.log.get_term(entry_id) == term {
                        return Ok(entry_id);
                    }
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
                if inner.exiting {
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                if inner.role != Role::Leader {
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
            }
            notified.await;
        }
    }

    /// Change the cluster membership to exactly `new_servers`.
    ///
    /// New servers first mirror the log without a vote (staging); once each
    /// has caught up, a transitional entry requiring both majorities goes
    /// through, followed by the stable entry for the new set. Returns once
    /// the stable configuration has committed.
    pub async fn set_configuration(
        self: &Arc<Self>,
        old_id: u64,
        new_servers: Vec<Server>,
    ) -> Result<SetConfigurationOutcome> {
        // Install the staging set once leadership is ready.
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if inner.exiting {
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                if inner.role != Role::Leader {
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
                if inner.membership.id != old_id
                    || inner.membership.state != MembershipState::Stable
                {
                    return Ok(SetConfigurationOutcome::Changed);
                }
                if inner.leader_ready() {
                    let now = Instant::now();
                    inner.membership.set_staging_servers(&new_servers, now);
                    let goal_id = inner.log.last_id();
                    for server_id in inner.membership.staging_ids() {
                        let voting = inner.membership.in_old_servers(server_id);
                        let server = inner.membership.get_mut(server_id).expect("staged");
                        server.caught_up = voting || server.is_local;
                        server.catch_up_failed = false;
                        server.catch_up_rounds = 0;
                        server.catch_up_iteration_start = now;
                        server.catch_up_goal_id = goal_id;
                        server.last_iteration_ms = 0;
                    }
                    self.spawn_peer_tasks(&mut inner);
                    tracing::info!(
                        node_id = self.id,
                        servers = ?new_servers.iter().map(|s| s.server_id).collect::<Vec<_>>(),
                        "Staging servers for configuration change"
                    );
                    self.finish(&mut inner);
                    break;
                }
            }
            notified.await;
        }

        // Wait for every staging server to catch up, then append the
        // transitional entry. Servers that exhaust their catch-up rounds or
        // never complete one by the deadline fail the change.
        let catch_up_deadline = Instant::now()
            + Duration::from_millis(
                self.config.follower_timeout_ms * self.config.max_catch_up_rounds,
            );
        let (transitional_id, marker) = loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if inner.exiting {
                    inner.membership.reset_staging_servers();
                    self.finish(&mut inner);
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                if inner.role != Role::Leader {
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
                if inner.membership.state != MembershipState::Staging
                    || inner.membership.id != old_id
                {
                    return Ok(SetConfigurationOutcome::Changed);
                }
                if Instant::now() >= catch_up_deadline {
                    for server_id in inner.membership.staging_ids() {
                        let server = inner.membership.get_mut(server_id).expect("staged");
                        if !server.caught_up {
                            server.catch_up_failed = true;
                        }
                    }
                }
                let bad: Vec<Server> = inner
                    .membership
                    .staging_ids()
                    .into_iter()
                    .filter_map(|id| {
                        let server = inner.membership.get(id)?;
                        if server.catch_up_failed {
                            Some(Server {
                                server_id: server.id,
                                address: server.address.clone(),
                            })
                        } else {
                            None
                        }
                    })
                    .collect();
                if !bad.is_empty() {
                    tracing::warn!(
                        node_id = self.id,
                        servers = ?bad.iter().map(|s| s.server_id).collect::<Vec<_>>(),
                        "Aborting configuration change, servers failed to catch up"
                    );
                    inner.membership.reset_staging_servers();
                    self.finish(&mut inner);
                    return Ok(SetConfigurationOutcome::Bad(bad));
                }
                if inner.membership.staging_all(|s| s.caught_up) {
                    let description = Configuration {
                        prev_configuration: Some(inner.membership.stable_servers()),
                        next_configuration: Some(SimpleConfiguration {
                            servers: new_servers.clone(),
                        }),
                    };
                    let term = inner.current_term;
                    let entry_id = inner.append(config_entry(term, description));
                    let marker = inner.sync_marker();
                    self.spawn_peer_tasks(&mut inner);
                    tracing::info!(
                        node_id = self.id,
                        entry_id,
                        "Appended transitional configuration"
                    );
                    self.finish(&mut inner);
                    break (entry_id, marker);
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = time::sleep_until(catch_up_deadline) => {}
            }
        };
        self.sync_log(marker).await;

        // The transitional entry commits under both majorities; the leader
        // then appends the stable entry automatically. Wait for that stable
        // configuration to commit.
        let expected: BTreeSet<u64> = new_servers.iter().map(|s| s.server_id).collect();
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                let stable: BTreeSet<u64> = inner
                    .membership
                    .stable_servers()
                    .servers
                    .iter()
                    .map(|s| s.server_id)
                    .collect();
                if inner.membership.state == MembershipState::Stable
                    && inner.membership.id > transitional_id
                    && stable == expected
                    && inner.committed_id >= inner.membership.id
                {
                    tracing::info!(
                        node_id = self.id,
                        configuration_id = inner.membership.id,
                        "Configuration change committed"
                    );
                    return Ok(SetConfigurationOutcome::Ok);
                }
                if inner.exiting {
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                if inner.role != Role::Leader {
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
            }
            notified.await;
        }
    }

    /// The current committed stable configuration. Leader-only.
    pub async fn get_configuration(&self) -> Result<(u64, Vec<Server>)> {
        let inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return Err(LedgerError::NotLeader(inner.leader_hint()));
        }
        if inner.membership.state != MembershipState::Stable
            || inner.committed_id < inner.membership.id
        {
            return Err(LedgerError::Retry("configuration in flux".into()));
        }
        Ok((inner.membership.id, inner.membership.stable_servers().servers))
    }

    /// Confirm leadership with a quorum, then return the commit index. Used
    /// to serve non-stale reads.
    pub async fn get_last_committed_id(&self) -> Result<u64> {
        self.up_to_date_leader().await?;
        let inner = self.inner.lock().await;
        Ok(inner.committed_id)
    }

    /// Return once a quorum has acknowledged an epoch taken during this
    /// call, proving this server was leader at some instant within it. Gives
    /// up after the follower timeout, since the lease monitor steps the
    /// leader down on that schedule anyway.
    pub(crate) async fn up_to_date_leader(&self) -> Result<()> {
        let epoch;
        let deadline;
        {
            let mut inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                return Err(LedgerError::NotLeader(inner.leader_hint()));
            }
            inner.current_epoch += 1;
            epoch = inner.current_epoch;
            inner.membership.local_mut().last_ack_epoch = epoch;
            // Prod the replicators so confirmation does not wait out a full
            // heartbeat period.
            let now = Instant::now();
            inner.membership.for_each(|s| {
                if !s.is_local {
                    s.next_heartbeat_at = now;
                }
            });
            deadline = now + Duration::from_millis(self.config.follower_timeout_ms);
            self.finish(&mut inner);
        }
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.exiting {
                    return Err(LedgerError::Retry("shutting down".into()));
                }
                if inner.role != Role::Leader {
                    return Err(LedgerError::NotLeader(inner.leader_hint()));
                }
                if inner.membership.quorum_min(|s| s.last_ack_epoch) >= epoch {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(LedgerError::Retry("timed out confirming leadership".into()));
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = time::sleep_until(deadline) => {}
            }
        }
    }

    /// Block until the entry after `last_id` is committed and return it.
    /// Returns None on shutdown. The state-machine applier drives this in a
    /// loop, so applied ids are strictly increasing and dense.
    pub async fn get_next_entry(&self, last_id: u64) -> Option<(u64, Entry)> {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.committed_id > last_id {
                    let entry_id = last_id + 1;
                    let entry = inner
                        .log
                        .get_entry(entry_id)
                        .cloned()
                        .expect("committed entry missing from log");
                    return Some((entry_id, entry));
                }
                if inner.exiting {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub async fn status(&self) -> ConsensusStatus {
        let inner = self.inner.lock().await;
        ConsensusStatus {
            role: inner.role,
            current_term: inner.current_term,
            committed_id: inner.committed_id,
            last_log_id: inner.log.last_id(),
            leader_id: inner.leader_id,
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.role == Role::Leader
    }

    /// Address clients should try instead, if this server knows the leader.
    pub async fn leader_hint(&self) -> Option<String> {
        self.inner.lock().await.leader_hint()
    }

    /// Copy of the whole log, for consistency checks in tests.
    pub async fn log_entries(&self) -> Vec<Entry> {
        self.inner.lock().await.log.entries().to_vec()
    }

    /// Spawn a replicator task for every peer record that lacks one.
    pub(crate) fn spawn_peer_tasks(self: &Arc<Self>, inner: &mut ConsensusInner) {
        if inner.exiting {
            return;
        }
        for server_id in inner.membership.known_ids() {
            let server = inner.membership.get_mut(server_id).expect("known id");
            if server.is_local || server.task_running || server.exiting {
                continue;
            }
            server.task_running = true;
            let generation = server.generation;
            inner.num_peer_tasks += 1;
            tokio::spawn(peer::peer_main(self.clone(), server_id, generation));
        }
    }
}

impl ConsensusInner {
    /// Marker for everything queued to disk so far. Sync past it before any
    /// externally visible step that depends on the current log, term, or
    /// vote.
    pub(crate) fn sync_marker(&self) -> SyncMarker {
        SyncMarker {
            seq: self.log.sync_marker(),
            last_id: self.log.last_id(),
        }
    }

    pub(crate) fn append_entries_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_id: self.log.last_id(),
            begin_last_term_id: self.log.begin_last_term_id(),
        }
    }

    /// True once this leader has committed an entry of its own term.
    pub(crate) fn leader_ready(&self) -> bool {
        self.committed_id > 0 && self.log.get_term(self.committed_id) == self.current_term
    }

    pub(crate) fn leader_hint(&self) -> Option<String> {
        let leader_id = self.leader_id?;
        self.membership.get(leader_id).map(|s| s.address.clone())
    }

    /// Persist `{current_term, voted_for}`. Must be called after changing
    /// either, before any RPC that depends on them goes out.
    pub(crate) fn update_metadata(&mut self) {
        self.log.metadata.current_term = self.current_term;
        self.log.metadata.voted_for = self.voted_for.unwrap_or(0);
        self.log.update_metadata();
    }

    pub(crate) fn set_follower_timer(&mut self, config: &NodeConfig) {
        self.start_election_at =
            Instant::now() + timer::follower_timeout(config.follower_timeout_ms);
    }

    pub(crate) fn set_candidate_timer(&mut self, config: &NodeConfig, attempt: u64) {
        self.start_election_at =
            Instant::now() + timer::candidate_timeout(config.candidate_timeout_ms, attempt);
    }

    /// Cancel every in-flight RPC. Callers signal `state_changed` separately.
    pub(crate) fn interrupt_all(&mut self) {
        self.membership.for_each(|s| {
            s.cancel.cancel();
            s.cancel = CancellationToken::new();
        });
    }

    /// Return to follower, advancing the term if `new_term` is newer.
    pub(crate) fn step_down(&mut self, config: &NodeConfig, new_term: u64) {
        debug_assert!(new_term >= self.current_term);
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            self.leader_id = None;
            self.update_metadata();
        }
        if self.role != Role::Follower {
            tracing::info!(
                node_id = self.membership.local_id(),
                term = self.current_term,
                from = %self.role,
                "Stepping down to follower"
            );
            self.role = Role::Follower;
        }
        self.election_attempt = 0;
        self.membership.reset_staging_servers();
        self.set_follower_timer(config);
        self.interrupt_all();
    }

    /// Become a candidate in the next term and solicit votes. Does nothing
    /// under a blank configuration or when this server has no vote.
    pub(crate) fn start_new_election(&mut self, config: &NodeConfig) {
        if self.membership.state == MembershipState::Blank {
            self.set_follower_timer(config);
            return;
        }
        let local_id = self.membership.local_id();
        if !self.membership.has_vote(local_id) {
            // A server removed from the cluster must not disturb it.
            self.set_follower_timer(config);
            return;
        }

        self.current_term += 1;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.voted_for = Some(local_id);
        self.election_attempt += 1;
        self.update_metadata();
        tracing::info!(
            node_id = local_id,
            term = self.current_term,
            attempt = self.election_attempt,
            "Starting election"
        );

        self.membership.for_each(|s| {
            s.vote_requested = false;
            s.have_vote = false;
        });
        let local = self.membership.local_mut();
        local.vote_requested = true;
        local.have_vote = true;
        self.interrupt_all();
        let attempt = self.election_attempt;
        self.set_candidate_timer(config, attempt);

        // A single-server configuration reaches quorum on its own vote.
        if self.membership.quorum_all(|s| s.have_vote) {
            self.become_leader(config);
        }
    }

    /// Called when a candidate has collected votes from a quorum.
    pub(crate) fn become_leader(&mut self, config: &NodeConfig) {
        debug_assert_eq!(self.role, Role::Candidate);
        tracing::info!(
            node_id = self.membership.local_id(),
            term = self.current_term,
            "Won election, becoming leader"
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.membership.local_id());
        self.start_election_at = far_future();

        let now = Instant::now();
        let last_id = self.log.last_id();
        let log = &self.log;
        self.membership.for_each(|s| {
            if s.is_local {
                return;
            }
            s.last_agree_id = 0;
            s.next_heartbeat_at = now;
            s.backoff_until = now;
            s.next_index = last_id + 1;
            if s.vote_requested {
                // Seed replication from the log position the server
                // reported alongside its vote.
                if s.hint_last_log_id < last_id {
                    s.next_index = s.hint_last_log_id + 1;
                }
                if log.get_term(s.hint_last_log_id) != s.hint_last_log_term
                    && s.hint_begin_last_term_id > 0
                {
                    s.next_index = s.next_index.min(s.hint_begin_last_term_id);
                }
            }
        });

        // Client operations stay blocked until an entry of this term
        // commits; append one immediately so that resolves.
        let term = self.current_term;
        self.append(data_entry(term, Vec::new()));
        self.advance_committed_id(config);
    }

    /// Append an entry in memory, activating it if it is a configuration.
    /// The entry counts as locally agreed only once a later
    /// [`RaftConsensus::sync_log`] makes it durable, which also re-runs
    /// commitment.
    pub(crate) fn append(&mut self, entry: Entry) -> u64 {
        let configuration = if entry_is_config(&entry) {
            Some(entry.configuration.clone().unwrap_or_default())
        } else {
            None
        };
        let entry_id = self.log.append(entry);
        if let Some(description) = configuration {
            self.membership
                .set_configuration(entry_id, description, Instant::now());
        }
        entry_id
    }

    /// Move the commit index forward if a quorum has stored a current-term
    /// entry. Drives configuration changes forward and steps down when a
    /// committed stable configuration excludes this server. Leader-only.
    pub(crate) fn advance_committed_id(&mut self, config: &NodeConfig) {
        if self.role != Role::Leader {
            return;
        }
        let quorum_id = self.membership.quorum_min(|s| s.last_agree_id);
        if quorum_id > self.committed_id && self.log.get_term(quorum_id) == self.current_term {
            self.committed_id = quorum_id;
            tracing::debug!(
                node_id = self.membership.local_id(),
                committed_id = quorum_id,
                "Advanced commit index"
            );
        }

        if self.membership.id > 0 && self.committed_id >= self.membership.id {
            match self.membership.state {
                MembershipState::Transitional => {
                    // Both majorities hold the transitional entry; move to
                    // the new servers alone.
                    let next = self
                        .membership
                        .description
                        .next_configuration
                        .clone()
                        .unwrap_or_default();
                    let description = Configuration {
                        prev_configuration: Some(next),
                        next_configuration: None,
                    };
                    let term = self.current_term;
                    let entry_id = self.append(config_entry(term, description));
                    tracing::info!(
                        node_id = self.membership.local_id(),
                        entry_id,
                        "Appended stable configuration"
                    );
                }
                MembershipState::Stable => {
                    let local_id = self.membership.local_id();
                    if !self.membership.in_old_servers(local_id) {
                        tracing::info!(
                            node_id = local_id,
                            "Not in the committed configuration, stepping down"
                        );
                        let term = self.current_term;
                        self.step_down(config, term);
                    }
                }
                _ => {}
            }
        }
    }

    /// Reinstall the latest configuration surviving in the log. Used after
    /// follower truncation and on startup.
    pub(crate) fn scan_for_configuration(&mut self, now: Instant) {
        for entry_id in (1..=self.log.last_id()).rev() {
            let entry = self.log.get_entry(entry_id).expect("id in range");
            if entry_is_config(entry) {
                if entry_id != self.membership.id {
                    let description = entry.configuration.clone().unwrap_or_default();
                    self.membership.set_configuration(entry_id, description, now);
                }
                return;
            }
        }
        if self.membership.id != 0 {
            self.membership.reset_to_blank();
        }
    }

    fn check_invariants(&mut self) {
        if !cfg!(debug_assertions) {
            return;
        }
        if let Some(mut invariants) = self.invariants.take() {
            invariants.check(self);
            self.invariants = Some(invariants);
        }
    }
}

/// Starts new elections after periods of inactivity.
async fn timer_main(consensus: Arc<RaftConsensus>) {
    loop {
        let notified = consensus.state_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let deadline;
        let mut marker = None;
        {
            let mut inner = consensus.inner.lock().await;
            if inner.exiting {
                return;
            }
            if Instant::now() >= inner.start_election_at {
                inner.start_new_election(&consensus.config);
                marker = Some(inner.sync_marker());
                consensus.finish(&mut inner);
            }
            deadline = inner.start_election_at;
        }
        // A single-server election appends its readiness entry right away;
        // make it durable so it can commit.
        if let Some(marker) = marker {
            consensus.sync_log(marker).await;
        }
        tokio::select! {
            _ = notified => {}
            _ = time::sleep_until(deadline) => {}
        }
    }
}

/// Steps a leader down when it cannot confirm a quorum within the follower
/// timeout, so clients stop waiting on a dead leadership.
async fn lease_main(consensus: Arc<RaftConsensus>) {
    let follower_timeout = Duration::from_millis(consensus.config.follower_timeout_ms);
    let heartbeat_period = Duration::from_millis(consensus.config.heartbeat_period_ms);
    loop {
        let epoch;
        let deadline;
        {
            let notified = consensus.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let mut inner = consensus.inner.lock().await;
            if inner.exiting {
                return;
            }
            if inner.role != Role::Leader {
                drop(inner);
                notified.await;
                continue;
            }
            inner.current_epoch += 1;
            epoch = inner.current_epoch;
            inner.membership.local_mut().last_ack_epoch = epoch;
            deadline = Instant::now() + follower_timeout;
            consensus.finish(&mut inner);
        }

        loop {
            let notified = consensus.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let confirmed;
            {
                let mut inner = consensus.inner.lock().await;
                if inner.exiting {
                    return;
                }
                if inner.role != Role::Leader {
                    confirmed = false;
                } else if inner.membership.quorum_min(|s| s.last_ack_epoch) >= epoch {
                    confirmed = true;
                } else if Instant::now() >= deadline {
                    tracing::warn!(
                        node_id = consensus.id,
                        term = inner.current_term,
                        "Cannot reach a quorum, stepping down"
                    );
                    let term = inner.current_term;
                    inner.step_down(&consensus.config, term);
                    consensus.finish(&mut inner);
                    confirmed = false;
                } else {
                    drop(inner);
                    tokio::select! {
                        _ = notified => {}
                        _ = time::sleep_until(deadline) => {}
                    }
                    continue;
                }
            }
            // Acknowledgements only arrive with heartbeat responses, so a
            // fresh epoch cannot confirm any sooner than the next round.
            if confirmed {
                time::sleep(heartbeat_period).await;
            }
            break;
        }
    }
}
