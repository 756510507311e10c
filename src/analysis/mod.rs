//! Data-flow analyses over the program model.

mod liveness;
mod merge;

pub use liveness::generate_data_flow;
pub use merge::merge_trees;
