use std::sync::Arc;

use prost::Message;
use tokio::time::{self, Duration, Instant};
use tonic::transport::Endpoint;

use crate::config::NodeConfig;
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::consensus::{ConsensusInner, RaftConsensus, Role};
use crate::raft::membership::MembershipState;

/// What the replicator decided to do on this iteration, while holding the
/// consensus lock.
enum Step {
    /// Nothing to send; sleep until the deadline or a state change.
    Wait(Option<Instant>),
    Vote(VoteRequest),
    Append {
        request: AppendEntriesRequest,
        /// Epoch captured before sending; acknowledged on success.
        epoch: u64,
        prev_log_id: u64,
        num_entries: u64,
    },
    Exit,
}

/// Drive one remote server: RequestVote while we are a candidate,
/// AppendEntries (heartbeat or data) while we are leader. One task per peer
/// record, for the record's lifetime.
///
/// Each iteration snapshots the request under the lock, performs the RPC
/// with the lock released, then reacquires the lock to integrate the
/// response; the term or role may have changed in between.
pub(crate) async fn peer_main(consensus: Arc<RaftConsensus>, peer_id: u64, generation: u64) {
    tracing::debug!(node_id = consensus.id, peer_id, "Replicator task started");
    let rpc_timeout = Duration::from_millis(consensus.config.rpc_timeout_ms);

    loop {
        let notified = consensus.state_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let step;
        let mut client = None;
        let mut cancel = None;
        let term_at_send;
        let mut sync_seq = 0;
        {
            let mut guard = consensus.inner.lock().await;
            let inner = &mut *guard;
            term_at_send = inner.current_term;
            step = decide(&consensus, inner, peer_id, generation);
            if matches!(step, Step::Vote(_) | Step::Append { .. }) {
                let peer = inner.membership.get_mut(peer_id).expect("decided to send");
                if peer.client.is_none() {
                    match Endpoint::from_shared(format!("http://{}", peer.address)) {
                        Ok(endpoint) => {
                            let channel = endpoint.connect_timeout(rpc_timeout).connect_lazy();
                            peer.client = Some(RaftServiceClient::new(channel));
                        }
                        Err(e) => {
                            tracing::warn!(peer_id, error = %e, "Invalid peer address");
                            peer.backoff_until = Instant::now()
                                + Duration::from_millis(consensus.config.rpc_failure_backoff_ms);
                            continue;
                        }
                    }
                }
                client = peer.client.clone();
                cancel = Some(peer.cancel.clone());
                sync_seq = inner.log.sync_marker();
            }
            if let Step::Exit = step {
                if let Some(peer) = inner.membership.get_mut(peer_id) {
                    if peer.generation == generation {
                        peer.task_running = false;
                    }
                }
                inner.num_peer_tasks -= 1;
                consensus.finish(inner);
            }
        }

        // The request snapshot depends on the term, vote, and entries taken
        // above; they must be durable before anything leaves this server.
        if matches!(step, Step::Vote(_) | Step::Append { .. }) {
            consensus.log_sync.sync(sync_seq).await;
        }

        match step {
            Step::Exit => {
                tracing::debug!(node_id = consensus.id, peer_id, "Replicator task exiting");
                return;
            }
            Step::Wait(deadline) => match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            },
            Step::Vote(request) => {
                let mut client = client.expect("client cached before send");
                let cancel = cancel.expect("cancel token cloned before send");
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = time::timeout(rpc_timeout, client.request_vote(request)) => Some(result),
                };
                let marker;
                {
                    let mut guard = consensus.inner.lock().await;
                    let inner = &mut *guard;
                    match outcome {
                        // Interrupted: the state changed, re-evaluate from
                        // the top.
                        None => {}
                        Some(Ok(Ok(response))) => integrate_vote_response(
                            &consensus.config,
                            inner,
                            peer_id,
                            term_at_send,
                            response.into_inner(),
                        ),
                        Some(_) => {
                            record_rpc_failure(&consensus.config, inner, peer_id, "RequestVote")
                        }
                    }
                    marker = inner.sync_marker();
                    consensus.finish(inner);
                }
                // Winning the election appends the readiness entry.
                consensus.sync_log(marker).await;
            }
            Step::Append {
                request,
                epoch,
                prev_log_id,
                num_entries,
            } => {
                let mut client = client.expect("client cached before send");
                let cancel = cancel.expect("cancel token cloned before send");
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = time::timeout(rpc_timeout, client.append_entries(request)) => Some(result),
                };
                let marker;
                {
                    let mut guard = consensus.inner.lock().await;
                    let inner = &mut *guard;
                    match outcome {
                        None => {}
                        Some(Ok(Ok(response))) => integrate_append_response(
                            &consensus.config,
                            inner,
                            peer_id,
                            term_at_send,
                            epoch,
                            prev_log_id,
                            num_entries,
                            response.into_inner(),
                        ),
                        Some(_) => {
                            record_rpc_failure(&consensus.config, inner, peer_id, "AppendEntries")
                        }
                    }
                    marker = inner.sync_marker();
                    consensus.finish(inner);
                }
                // Commitment can append the next configuration entry.
                consensus.sync_log(marker).await;
            }
        }
    }
}

/// Pick the next action for this peer. Holds the lock.
fn decide(
    consensus: &RaftConsensus,
    inner: &mut ConsensusInner,
    peer_id: u64,
    generation: u64,
) -> Step {
    let exiting = inner.exiting;
    let role = inner.role;
    let term = inner.current_term;
    let committed_id = inner.committed_id;
    let epoch = inner.current_epoch;
    let has_vote = inner.membership.has_vote(peer_id);

    let log = &inner.log;
    let last_log_id = log.last_id();
    let last_log_term = log.last_term();

    let peer = match inner.membership.get_mut(peer_id) {
        Some(peer) if peer.generation == generation => peer,
        _ => return Step::Exit,
    };
    if exiting || peer.exiting {
        return Step::Exit;
    }

    let now = Instant::now();
    if now < peer.backoff_until {
        return Step::Wait(Some(peer.backoff_until));
    }

    match role {
        Role::Candidate if !peer.vote_requested && has_vote => Step::Vote(VoteRequest {
            server_id: consensus.id,
            term,
            last_log_term,
            last_log_id,
        }),
        Role::Leader => {
            if now >= peer.next_heartbeat_at || peer.last_agree_id < last_log_id {
                let prev_log_id = peer.next_index.saturating_sub(1);
                let prev_log_term = log.get_term(prev_log_id);
                // Batch entries up to the soft byte limit, but always send
                // at least one so an oversized entry still makes progress.
                let mut entries = Vec::new();
                let mut bytes = 0u64;
                let mut next = peer.next_index;
                while next <= last_log_id {
                    let entry = log.get_entry(next).expect("id in range");
                    let size = entry.encoded_len() as u64;
                    if !entries.is_empty() && bytes + size > consensus.config.soft_rpc_size_limit {
                        break;
                    }
                    bytes += size;
                    entries.push(entry.clone());
                    next += 1;
                }
                let num_entries = entries.len() as u64;
                Step::Append {
                    request: AppendEntriesRequest {
                        server_id: consensus.id,
                        term,
                        prev_log_term,
                        prev_log_id,
                        entries,
                        committed_id,
                    },
                    epoch,
                    prev_log_id,
                    num_entries,
                }
            } else {
                Step::Wait(Some(peer.next_heartbeat_at))
            }
        }
        _ => Step::Wait(None),
    }
}

fn record_rpc_failure(config: &NodeConfig, inner: &mut ConsensusInner, peer_id: u64, rpc: &str) {
    if let Some(peer) = inner.membership.get_mut(peer_id) {
        peer.backoff_until =
            Instant::now() + Duration::from_millis(config.rpc_failure_backoff_ms);
        tracing::debug!(peer_id, rpc, "RPC failed, backing off");
    }
}

fn integrate_vote_response(
    config: &NodeConfig,
    inner: &mut ConsensusInner,
    peer_id: u64,
    term_at_send: u64,
    resp: VoteResponse,
) {
    if resp.term > inner.current_term {
        inner.step_down(config, resp.term);
        return;
    }
    if inner.role != Role::Candidate
        || inner.current_term != term_at_send
        || resp.term != term_at_send
    {
        // A stale response from an election we already left behind.
        return;
    }
    let Some(peer) = inner.membership.get_mut(peer_id) else {
        return;
    };
    peer.vote_requested = true;
    peer.have_vote = resp.granted;
    peer.hint_last_log_term = resp.last_log_term;
    peer.hint_last_log_id = resp.last_log_id;
    peer.hint_begin_last_term_id = resp.begin_last_term_id;
    tracing::debug!(
        peer_id,
        term = term_at_send,
        granted = resp.granted,
        "Vote response"
    );
    if resp.granted && inner.membership.quorum_all(|s| s.have_vote) {
        inner.become_leader(config);
    }
}

#[allow(clippy::too_many_arguments)]
fn integrate_append_response(
    config: &NodeConfig,
    inner: &mut ConsensusInner,
    peer_id: u64,
    term_at_send: u64,
    epoch: u64,
    prev_log_id: u64,
    num_entries: u64,
    resp: AppendEntriesResponse,
) {
    if resp.term > inner.current_term {
        inner.step_down(config, resp.term);
        return;
    }
    if inner.role != Role::Leader || inner.current_term != term_at_send {
        return;
    }

    let now = Instant::now();
    let staging_member = inner.membership.state == MembershipState::Staging
        && inner.membership.staging_ids().contains(&peer_id);
    let last_log_id = inner.log.last_id();
    let Some(peer) = inner.membership.get_mut(peer_id) else {
        return;
    };

    if resp.success {
        peer.last_agree_id = prev_log_id + num_entries;
        peer.next_index = peer.last_agree_id + 1;
        peer.last_ack_epoch = peer.last_ack_epoch.max(epoch);
        peer.next_heartbeat_at = now + Duration::from_millis(config.heartbeat_period_ms);

        if staging_member && !peer.caught_up && peer.last_agree_id >= peer.catch_up_goal_id {
            // One catch-up iteration finished: from its start time to the
            // goal captured back then. The server qualifies once an
            // iteration takes no longer than the previous one plus a
            // candidate timeout of slack, so promoting it cannot stall the
            // cluster longer than an election retry would.
            let duration_ms = now
                .saturating_duration_since(peer.catch_up_iteration_start)
                .as_millis() as u64;
            if peer.catch_up_rounds > 0
                && duration_ms <= peer.last_iteration_ms + config.candidate_timeout_ms
            {
                peer.caught_up = true;
                tracing::info!(peer_id, "Staging server caught up");
            } else if peer.catch_up_rounds >= config.max_catch_up_rounds {
                peer.catch_up_failed = true;
                tracing::warn!(
                    peer_id,
                    rounds = peer.catch_up_rounds,
                    "Staging server failed to catch up"
                );
            } else {
                peer.catch_up_rounds += 1;
                peer.last_iteration_ms = duration_ms;
                peer.catch_up_iteration_start = now;
                peer.catch_up_goal_id = last_log_id;
            }
        }

        inner.advance_committed_id(config);
    } else {
        // The follower's log does not match at prev_log_id. Back off: jump
        // to the start of its last term when the hint helps, else one step.
        let mut next = peer.next_index.saturating_sub(1).max(1);
        if resp.last_log_id < prev_log_id {
            next = next.min(resp.last_log_id + 1);
        } else if resp.begin_last_term_id > 0 {
            next = next.min(resp.begin_last_term_id);
        }
        peer.next_index = next.max(peer.last_agree_id + 1);
        tracing::debug!(
            peer_id,
            next_index = peer.next_index,
            "AppendEntries rejected, backing off"
        );
    }
}
