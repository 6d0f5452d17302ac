pub mod safety;
pub mod structuring;
pub mod merge;
pub mod stability;
pub mod processor; // Per-message pipeline: crisis gate, extraction, audit
