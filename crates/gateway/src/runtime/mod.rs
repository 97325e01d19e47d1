//! Run orchestration: the per-turn state machine and the process-wide
//! active-run registry that decouples SSE subscribers from producers.

pub mod runs;
pub mod turn;

pub use runs::{ActiveRun, RunMap, SubscriberQueue};
pub use turn::{TurnEngine, TurnInput};
