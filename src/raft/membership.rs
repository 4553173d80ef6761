use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{Configuration, Server, SimpleConfiguration};

/// Per-server bookkeeping, covering both the local server and remote peers.
/// No internal locking: records are only touched under the consensus lock.
#[derive(Debug)]
pub struct ServerState {
    pub id: u64,
    /// Distinguishes this record from earlier records for the same id, so a
    /// replicator task can tell when its record was removed and recreated.
    pub generation: u64,
    pub address: String,
    pub is_local: bool,

    /// True once the server has responded to our RequestVote this term.
    pub vote_requested: bool,
    pub have_vote: bool,

    /// Log position reported in the server's last vote response. Used to
    /// seed `next_index` when we become leader.
    pub hint_last_log_term: u64,
    pub hint_last_log_id: u64,
    pub hint_begin_last_term_id: u64,

    /// Largest entry id through which this server's log is known to match
    /// ours. Only meaningful while we are leader.
    pub last_agree_id: u64,
    /// Next entry id to send. Backed off on consistency failures.
    pub next_index: u64,
    /// Latest epoch this server acknowledged; drives the leader lease.
    pub last_ack_epoch: u64,
    /// Never more than one heartbeat period in the future while leader.
    pub next_heartbeat_at: Instant,
    /// Earliest time to retry after an RPC transport failure.
    pub backoff_until: Instant,

    /// Catch-up tracking for staging servers.
    pub caught_up: bool,
    pub catch_up_failed: bool,
    pub catch_up_rounds: u64,
    pub catch_up_iteration_start: Instant,
    pub catch_up_goal_id: u64,
    pub last_iteration_ms: u64,

    /// Tells the replicator task for this record to exit.
    pub exiting: bool,
    /// Set once a replicator task has been spawned for this record.
    pub task_running: bool,
    /// Cancels the in-flight RPC; replaced on each interrupt.
    pub cancel: CancellationToken,
    /// Cached RPC channel, replaced under the consensus lock.
    pub client: Option<RaftServiceClient<Channel>>,

    gc_flag: bool,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

impl ServerState {
    pub fn new(id: u64, address: String, is_local: bool, now: Instant) -> Self {
        Self {
            id,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            address,
            is_local,
            vote_requested: false,
            have_vote: false,
            hint_last_log_term: 0,
            hint_last_log_id: 0,
            hint_begin_last_term_id: 0,
            last_agree_id: 0,
            next_index: 1,
            last_ack_epoch: 0,
            next_heartbeat_at: now,
            backoff_until: now,
            caught_up: false,
            catch_up_failed: false,
            catch_up_rounds: 0,
            catch_up_iteration_start: now,
            catch_up_goal_id: 0,
            last_iteration_ms: 0,
            exiting: false,
            task_running: false,
            cancel: CancellationToken::new(),
            client: None,
            gc_flag: false,
        }
    }
}

/// Meaning of the server sets in a [`Membership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    /// No servers known. Servers new to the cluster with empty logs start
    /// here; a blank configuration can never reach quorum.
    Blank,
    /// One list of servers; a quorum is any majority of it.
    Stable,
    /// Like Stable, but the staging servers also receive log entries. They
    /// do not vote.
    Staging,
    /// Two lists; a quorum requires a majority of each.
    Transitional,
}

/// The set of servers in the cluster and the quorum rules over them.
/// Accessed only under the consensus lock.
pub struct Membership {
    local_id: u64,
    pub state: MembershipState,
    /// Entry id of the configuration entry this was taken from.
    pub id: u64,
    pub description: Configuration,
    old_servers: Vec<u64>,
    /// Next servers under Transitional; staging servers under Staging.
    new_servers: Vec<u64>,
    known: HashMap<u64, ServerState>,
}

impl Membership {
    pub fn new(local_id: u64, local_address: String, now: Instant) -> Self {
        let mut known = HashMap::new();
        known.insert(
            local_id,
            ServerState::new(local_id, local_address, true, now),
        );
        Self {
            local_id,
            state: MembershipState::Blank,
            id: 0,
            description: Configuration::default(),
            old_servers: Vec::new(),
            new_servers: Vec::new(),
            known,
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn get(&self, id: u64) -> Option<&ServerState> {
        self.known.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ServerState> {
        self.known.get_mut(&id)
    }

    pub fn local(&self) -> &ServerState {
        &self.known[&self.local_id]
    }

    pub fn local_mut(&mut self) -> &mut ServerState {
        self.known.get_mut(&self.local_id).expect("local server record")
    }

    /// All known server ids: local, old, new, and staging.
    pub fn known_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.known.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply `f` exactly once per known server.
    pub fn for_each(&mut self, mut f: impl FnMut(&mut ServerState)) {
        for server in self.known.values_mut() {
            f(server);
        }
    }

    /// True if the server participates in the quorum (staging-only servers
    /// do not).
    pub fn has_vote(&self, id: u64) -> bool {
        self.old_servers.contains(&id)
            || (self.state == MembershipState::Transitional && self.new_servers.contains(&id))
    }

    /// True if the server is named by the old (voting) set.
    pub fn in_old_servers(&self, id: u64) -> bool {
        self.old_servers.contains(&id)
    }

    /// True iff there exists a quorum in which every server satisfies the
    /// predicate.
    pub fn quorum_all(&self, predicate: impl Fn(&ServerState) -> bool) -> bool {
        match self.state {
            MembershipState::Blank => false,
            MembershipState::Stable | MembershipState::Staging => {
                self.simple_quorum_all(&self.old_servers, &predicate)
            }
            MembershipState::Transitional => {
                self.simple_quorum_all(&self.old_servers, &predicate)
                    && self.simple_quorum_all(&self.new_servers, &predicate)
            }
        }
    }

    /// The largest value v such that every set in the active quorum has a
    /// majority with `value(server) >= v`. 0 under a blank configuration.
    pub fn quorum_min(&self, value: impl Fn(&ServerState) -> u64) -> u64 {
        match self.state {
            MembershipState::Blank => 0,
            MembershipState::Stable | MembershipState::Staging => {
                self.simple_quorum_min(&self.old_servers, &value)
            }
            MembershipState::Transitional => std::cmp::min(
                self.simple_quorum_min(&self.old_servers, &value),
                self.simple_quorum_min(&self.new_servers, &value),
            ),
        }
    }

    fn simple_quorum_all(&self, ids: &[u64], predicate: &impl Fn(&ServerState) -> bool) -> bool {
        if ids.is_empty() {
            return true;
        }
        let satisfied = ids
            .iter()
            .filter(|id| predicate(&self.known[*id]))
            .count();
        satisfied >= ids.len() / 2 + 1
    }

    fn simple_quorum_min(&self, ids: &[u64], value: &impl Fn(&ServerState) -> u64) -> u64 {
        if ids.is_empty() {
            return 0;
        }
        let mut values: Vec<u64> = ids.iter().map(|id| value(&self.known[id])).collect();
        values.sort_unstable_by(|a, b| b.cmp(a));
        values[values.len() / 2]
    }

    /// True if every staging server satisfies the predicate.
    pub fn staging_all(&self, predicate: impl Fn(&ServerState) -> bool) -> bool {
        if self.state != MembershipState::Staging {
            return true;
        }
        self.new_servers.iter().all(|id| predicate(&self.known[id]))
    }

    pub fn staging_ids(&self) -> Vec<u64> {
        if self.state != MembershipState::Staging {
            return Vec::new();
        }
        self.new_servers.clone()
    }

    /// Replace the configuration with the one stored at log entry `new_id`.
    /// Any staging servers are dropped. Server records present in both the
    /// old and new membership keep their replication progress. Records no
    /// longer referenced anywhere are garbage collected; their in-flight
    /// RPCs are cancelled and their replicator tasks observe the removal and
    /// exit.
    pub fn set_configuration(&mut self, new_id: u64, description: Configuration, now: Instant) {
        self.state = if description.next_configuration.is_some() {
            MembershipState::Transitional
        } else {
            MembershipState::Stable
        };
        self.id = new_id;

        for server in self.known.values_mut() {
            server.gc_flag = false;
        }
        self.known
            .get_mut(&self.local_id)
            .expect("local server record")
            .gc_flag = true;

        self.old_servers.clear();
        self.new_servers.clear();
        let prev = description.prev_configuration.clone().unwrap_or_default();
        for server in &prev.servers {
            self.old_servers.push(server.server_id);
            self.track(server, now);
        }
        if let Some(next) = &description.next_configuration {
            for server in &next.servers {
                self.new_servers.push(server.server_id);
                self.track(server, now);
            }
        }
        self.description = description;

        self.gc();
    }

    /// Add servers that mirror the log but have no vote. Only valid on a
    /// Stable configuration; makes it Staging.
    pub fn set_staging_servers(&mut self, staging: &[Server], now: Instant) {
        assert_eq!(self.state, MembershipState::Stable);
        self.state = MembershipState::Staging;
        for server in staging {
            self.new_servers.push(server.server_id);
            self.track(server, now);
        }
    }

    /// Drop the staging servers and return to the prior Stable state.
    pub fn reset_staging_servers(&mut self) {
        if self.state != MembershipState::Staging {
            return;
        }
        self.state = MembershipState::Stable;
        self.new_servers.clear();

        for server in self.known.values_mut() {
            server.gc_flag = false;
        }
        self.known
            .get_mut(&self.local_id)
            .expect("local server record")
            .gc_flag = true;
        for id in self.old_servers.clone() {
            if let Some(server) = self.known.get_mut(&id) {
                server.gc_flag = true;
            }
        }
        self.gc();
    }

    /// Mark `server` as referenced, creating its record if it is new.
    fn track(&mut self, server: &Server, now: Instant) {
        if let Some(existing) = self.known.get_mut(&server.server_id) {
            if !existing.is_local && existing.address != server.address {
                existing.address = server.address.clone();
                existing.client = None;
            }
            existing.gc_flag = true;
            return;
        }
        let mut state = ServerState::new(server.server_id, server.address.clone(), false, now);
        state.gc_flag = true;
        self.known.insert(server.server_id, state);
    }

    fn gc(&mut self) {
        for server in self.known.values_mut() {
            if !server.gc_flag {
                server.exiting = true;
                server.cancel.cancel();
            }
        }
        self.known.retain(|_, server| server.gc_flag);
    }

    /// The current stable server list, for GetConfiguration.
    pub fn stable_servers(&self) -> SimpleConfiguration {
        self.description.prev_configuration.clone().unwrap_or_default()
    }

    /// Forget the configuration entirely. Used when truncation removed the
    /// last configuration entry from the log.
    pub fn reset_to_blank(&mut self) {
        self.state = MembershipState::Blank;
        self.id = 0;
        self.description = Configuration::default();
        self.old_servers.clear();
        self.new_servers.clear();
        for server in self.known.values_mut() {
            server.gc_flag = server.is_local;
        }
        self.gc();
    }
}
