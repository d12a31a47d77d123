/// This module contains the segment-by-segment conflict scanner.
pub mod detection;
/// Completion barrier used by the resolution pipeline.
pub mod join_counter;
/// Merge policies deciding the surviving entry of a conflicting key.
pub mod merge_policy;
/// This module contains the merge-and-apply pipeline.
pub mod resolution;
/// Per-key collection of every owner's value.
pub mod versions;
