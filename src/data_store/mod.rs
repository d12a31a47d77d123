/// Values, entries and the per-owner maps built from them.
pub mod versioned_value;
