//! Data model for DiffSleuth.
//!
//! Re-exports filesystem entries, the path-keyed content index and the
//! registry snapshot types.
pub mod entry;
pub mod index;
pub mod registry;

pub use entry::{path_depth, Diagnostic, Entry, EntryKind, Side, Stage};
pub use index::{ContentIndex, DuplicatePath};
pub use registry::{HiveSnapshot, RegistryKey, RegistryValue, ValueType};
