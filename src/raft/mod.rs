pub mod consensus;
mod invariants;
pub mod log;
pub mod membership;
pub mod peer;
pub mod timer;

pub use consensus::{ConsensusStatus, RaftConsensus, Role, SetConfigurationOutcome};
pub use log::Log;
pub use membership::{Membership, MembershipState};
