use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::raft::consensus::{ConsensusInner, Role};
use crate::raft::membership::MembershipState;

/// Debug-build verifier for cross-component consistency. Runs after every
/// state transition while the consensus lock is held; a violation is an
/// implementation bug and panics.
pub(crate) struct Invariants {
    heartbeat_period: Duration,
    previous: Option<Snapshot>,
}

struct ServerSnapshot {
    last_agree_id: u64,
    last_ack_epoch: u64,
}

struct Snapshot {
    role: Role,
    current_term: u64,
    voted_for: Option<u64>,
    committed_id: u64,
    last_log_id: u64,
    current_epoch: u64,
    servers: HashMap<u64, ServerSnapshot>,
}

impl Invariants {
    pub(crate) fn new(heartbeat_period_ms: u64) -> Self {
        Self {
            heartbeat_period: Duration::from_millis(heartbeat_period_ms),
            previous: None,
        }
    }

    pub(crate) fn check(&mut self, inner: &ConsensusInner) {
        self.check_basic(inner);
        self.check_servers(inner);
        self.check_delta(inner);
        self.previous = Some(Self::snapshot(inner));
    }

    fn check_basic(&self, inner: &ConsensusInner) {
        let local_id = inner.membership.local_id();
        assert!(
            inner.committed_id <= inner.log.last_id(),
            "commit index {} past end of log {}",
            inner.committed_id,
            inner.log.last_id()
        );
        match inner.role {
            Role::Leader => {
                assert_eq!(inner.leader_id, Some(local_id), "leader without own hint");
                assert_eq!(inner.voted_for, Some(local_id), "leader without own vote");
            }
            Role::Candidate => {
                assert_eq!(inner.voted_for, Some(local_id), "candidate without own vote");
            }
            Role::Follower => {}
        }
        match inner.membership.state {
            MembershipState::Blank => {
                assert_eq!(inner.membership.id, 0, "blank configuration with an id")
            }
            MembershipState::Staging => {
                assert_eq!(inner.role, Role::Leader, "staging servers without a leader")
            }
            _ => assert!(inner.membership.id >= 1, "configuration without an id"),
        }
        // Persisted metadata is never behind the in-memory values.
        assert_eq!(
            inner.log.metadata.current_term, inner.current_term,
            "current_term not persisted"
        );
        assert_eq!(
            inner.log.metadata.voted_for,
            inner.voted_for.unwrap_or(0),
            "voted_for not persisted"
        );
    }

    fn check_servers(&self, inner: &ConsensusInner) {
        let now = Instant::now();
        // Local agreement tracks the durably synced prefix, which may trail
        // the in-memory log until the next sync completes.
        assert!(
            inner.membership.local().last_agree_id <= inner.log.last_id(),
            "local agreement past end of log"
        );
        for server_id in inner.membership.known_ids() {
            let server = inner.membership.get(server_id).expect("known id");
            assert!(
                server.last_ack_epoch <= inner.current_epoch,
                "server {} acknowledged a future epoch",
                server_id
            );
            if inner.role == Role::Leader {
                assert!(
                    server.last_agree_id <= inner.log.last_id(),
                    "server {} agreement past end of log",
                    server_id
                );
                if !server.is_local {
                    assert!(
                        server.next_heartbeat_at <= now + self.heartbeat_period,
                        "server {} heartbeat scheduled too far out",
                        server_id
                    );
                }
            }
        }
    }

    fn check_delta(&self, inner: &ConsensusInner) {
        let Some(previous) = &self.previous else {
            return;
        };
        assert!(
            inner.current_term >= previous.current_term,
            "term went backwards"
        );
        assert!(
            inner.committed_id >= previous.committed_id,
            "commit index went backwards"
        );
        assert!(
            inner.current_epoch >= previous.current_epoch,
            "epoch went backwards"
        );
        if inner.current_term == previous.current_term {
            if previous.voted_for.is_some() {
                assert_eq!(
                    inner.voted_for, previous.voted_for,
                    "vote changed within a term"
                );
            }
            if previous.role == Role::Leader && inner.role == Role::Leader {
                assert!(
                    inner.log.last_id() >= previous.last_log_id,
                    "leader shrank its own log"
                );
            }
        }
        for (server_id, prev_server) in &previous.servers {
            if let Some(server) = inner.membership.get(*server_id) {
                assert!(
                    server.last_ack_epoch >= prev_server.last_ack_epoch,
                    "server {} acknowledgement went backwards",
                    server_id
                );
                if inner.current_term == previous.current_term
                    && previous.role == Role::Leader
                    && inner.role == Role::Leader
                {
                    assert!(
                        server.last_agree_id >= prev_server.last_agree_id,
                        "server {} agreement went backwards",
                        server_id
                    );
                }
            }
        }
    }

    fn snapshot(inner: &ConsensusInner) -> Snapshot {
        let mut servers = HashMap::new();
        for server_id in inner.membership.known_ids() {
            let server = inner.membership.get(server_id).expect("known id");
            servers.insert(
                server_id,
                ServerSnapshot {
                    last_agree_id: server.last_agree_id,
                    last_ack_epoch: server.last_ack_epoch,
                },
            );
        }
        Snapshot {
            role: inner.role,
            current_term: inner.current_term,
            voted_for: inner.voted_for,
            committed_id: inner.committed_id,
            last_log_id: inner.log.last_id(),
            current_epoch: inner.current_epoch,
            servers,
        }
    }
}
