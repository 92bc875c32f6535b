mod condition;
mod graph;
mod state;

pub use condition::Condition;
pub use graph::{Directives, OperationGraph, PairRecord, RunObserver, RunReport};
pub use state::{PairOutcome, PairState};
