use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;
use tokio::sync::{watch, RwLock};

use crate::proto::{command::Op, Command, Entry};
use crate::raft::consensus::RaftConsensus;

/// Result of applying one client command, kept until the submitting service
/// handler picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    OpenLog { log_id: u64 },
    DeleteLog,
    /// None if the target log was deleted before the command applied.
    Append { entry_id: Option<u64> },
}

/// One named replicated log.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    pub name: String,
    pub entries: Vec<Vec<u8>>,
}

/// The replicated state machine: a set of named logs, fed committed entries
/// in order by [`apply_loop`]. Every node applies the same entries at the
/// same ids, so reads served from here (after a leadership check) are
/// consistent across the cluster.
pub struct StateMachine {
    last_applied: u64,
    next_log_id: u64,
    ids_by_name: HashMap<String, u64>,
    logs: HashMap<u64, ReplicatedLog>,
    results: HashMap<u64, CommandOutcome>,
    applied_tx: watch::Sender<u64>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            last_applied: 0,
            next_log_id: 1,
            ids_by_name: HashMap::new(),
            logs: HashMap::new(),
            results: HashMap::new(),
            applied_tx: watch::channel(0).0,
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Watch the highest applied entry id.
    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    /// Apply the committed entry at `entry_id`. Ids must arrive strictly
    /// increasing and dense; configuration entries and no-ops only advance
    /// the applied index.
    pub fn apply(&mut self, entry_id: u64, entry: &Entry) {
        debug_assert_eq!(entry_id, self.last_applied + 1, "applier skipped an entry");
        if let Some(op) = decode_command(entry) {
            let outcome = self.apply_op(op);
            tracing::debug!(entry_id, outcome = ?outcome, "Applied command");
            self.results.insert(entry_id, outcome);
            if self.results.len() > 8192 {
                self.results.retain(|&id, _| id + 4096 > entry_id);
            }
        }
        self.last_applied = entry_id;
        let _ = self.applied_tx.send(entry_id);
    }

    fn apply_op(&mut self, op: Op) -> CommandOutcome {
        match op {
            Op::OpenLog(open) => {
                if let Some(&log_id) = self.ids_by_name.get(&open.name) {
                    return CommandOutcome::OpenLog { log_id };
                }
                let log_id = self.next_log_id;
                self.next_log_id += 1;
                self.ids_by_name.insert(open.name.clone(), log_id);
                self.logs.insert(
                    log_id,
                    ReplicatedLog {
                        name: open.name,
                        entries: Vec::new(),
                    },
                );
                CommandOutcome::OpenLog { log_id }
            }
            Op::DeleteLog(delete) => {
                if let Some(log_id) = self.ids_by_name.remove(&delete.name) {
                    self.logs.remove(&log_id);
                }
                CommandOutcome::DeleteLog
            }
            Op::Append(append) => match self.logs.get_mut(&append.log_id) {
                Some(log) => {
                    log.entries.push(append.data);
                    CommandOutcome::Append {
                        entry_id: Some(log.entries.len() as u64),
                    }
                }
                None => CommandOutcome::Append { entry_id: None },
            },
        }
    }

    /// Collect the outcome recorded for `entry_id`, if any. Consumed once.
    pub fn take_result(&mut self, entry_id: u64) -> Option<CommandOutcome> {
        self.results.remove(&entry_id)
    }

    pub fn list_logs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ids_by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_log(&self, log_id: u64) -> Option<&ReplicatedLog> {
        self.logs.get(&log_id)
    }

    /// Entries of the log from per-log id `from` (1-based) through the head.
    pub fn read(&self, log_id: u64, from: u64) -> Option<Vec<Vec<u8>>> {
        let log = self.logs.get(&log_id)?;
        let start = (from.max(1) - 1) as usize;
        if start >= log.entries.len() {
            return Some(Vec::new());
        }
        Some(log.entries[start..].to_vec())
    }

    /// Id of the head of the log, or 0 if the log is empty.
    pub fn get_last_id(&self, log_id: u64) -> Option<u64> {
        self.logs.get(&log_id).map(|log| log.entries.len() as u64)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// The payload of a DATA entry, if it carries a command. Configuration
/// entries, empty payloads, and undecodable payloads apply as no-ops.
fn decode_command(entry: &Entry) -> Option<Op> {
    if crate::raft::consensus::entry_is_config(entry) || entry.data.is_empty() {
        return None;
    }
    match Command::decode(entry.data.as_slice()) {
        Ok(command) => command.op,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping undecodable command payload");
            None
        }
    }
}

pub fn encode_command(op: Op) -> Vec<u8> {
    Command { op: Some(op) }.encode_to_vec()
}

/// Pull committed entries from consensus in order and apply them. Runs on
/// every node until shutdown.
pub async fn apply_loop(consensus: Arc<RaftConsensus>, state_machine: Arc<RwLock<StateMachine>>) {
    let mut last_applied = 0;
    while let Some((entry_id, entry)) = consensus.get_next_entry(last_applied).await {
        last_applied = entry_id;
        state_machine.write().await.apply(entry_id, &entry);
    }
    tracing::debug!(node_id = consensus.id, "Applier exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{AppendCommand, DeleteLogCommand, EntryType, OpenLogCommand};

    fn data_entry(op: Op) -> Entry {
        Entry {
            term: 1,
            r#type: EntryType::Data as i32,
            configuration: None,
            data: encode_command(op),
        }
    }

    fn open(name: &str) -> Op {
        Op::OpenLog(OpenLogCommand {
            name: name.to_string(),
        })
    }

    #[test]
    fn test_open_log_assigns_ids() {
        let mut sm = StateMachine::new();
        sm.apply(1, &data_entry(open("alpha")));
        sm.apply(2, &data_entry(open("beta")));
        assert_eq!(
            sm.take_result(1),
            Some(CommandOutcome::OpenLog { log_id: 1 })
        );
        assert_eq!(
            sm.take_result(2),
            Some(CommandOutcome::OpenLog { log_id: 2 })
        );
        assert_eq!(sm.list_logs(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_open_log_is_idempotent() {
        let mut sm = StateMachine::new();
        sm.apply(1, &data_entry(open("alpha")));
        sm.apply(2, &data_entry(open("alpha")));
        assert_eq!(
            sm.take_result(2),
            Some(CommandOutcome::OpenLog { log_id: 1 })
        );
        assert_eq!(sm.list_logs(), vec!["alpha"]);
    }

    #[test]
    fn test_append_and_read() {
        let mut sm = StateMachine::new();
        sm.apply(1, &data_entry(open("alpha")));
        sm.apply(
            2,
            &data_entry(Op::Append(AppendCommand {
                log_id: 1,
                data: b"one".to_vec(),
            })),
        );
        sm.apply(
            3,
            &data_entry(Op::Append(AppendCommand {
                log_id: 1,
                data: b"two".to_vec(),
            })),
        );
        assert_eq!(
            sm.take_result(3),
            Some(CommandOutcome::Append { entry_id: Some(2) })
        );
        assert_eq!(sm.get_last_id(1), Some(2));
        assert_eq!(
            sm.read(1, 1).unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(sm.read(1, 2).unwrap(), vec![b"two".to_vec()]);
        assert!(sm.read(1, 3).unwrap().is_empty());
    }

    #[test]
    fn test_append_to_deleted_log() {
        let mut sm = StateMachine::new();
        sm.apply(1, &data_entry(open("alpha")));
        sm.apply(
            2,
            &data_entry(Op::DeleteLog(DeleteLogCommand {
                name: "alpha".to_string(),
            })),
        );
        sm.apply(
            3,
            &data_entry(Op::Append(AppendCommand {
                log_id: 1,
                data: b"one".to_vec(),
            })),
        );
        assert_eq!(
            sm.take_result(3),
            Some(CommandOutcome::Append { entry_id: None })
        );
        assert!(sm.read(1, 1).is_none());
    }

    #[test]
    fn test_delete_log_is_idempotent() {
        let mut sm = StateMachine::new();
        sm.apply(
            1,
            &data_entry(Op::DeleteLog(DeleteLogCommand {
                name: "missing".to_string(),
            })),
        );
        assert_eq!(sm.take_result(1), Some(CommandOutcome::DeleteLog));
    }

    #[test]
    fn test_noop_entries_advance_applied_index() {
        let mut sm = StateMachine::new();
        let noop = Entry {
            term: 1,
            r#type: EntryType::Data as i32,
            configuration: None,
            data: Vec::new(),
        };
        sm.apply(1, &noop);
        assert_eq!(sm.last_applied(), 1);
        assert!(sm.take_result(1).is_none());
    }
}
