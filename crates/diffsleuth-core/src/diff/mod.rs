//! Differencers for content indices and registry snapshots.
//!
//! Both are pure functions over immutable inputs and return records already
//! sorted by path, so their output does not depend on the order in which the
//! pool finished building the inputs.
pub mod hive;
pub mod tree;

pub use hive::{diff_hives, HiveChange, HiveDiff, ValueChange};
pub use tree::{diff_trees, ChangeRecord, TreeDiff};
