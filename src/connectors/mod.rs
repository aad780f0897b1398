//! Reference connectors: in-memory replay and capture, and a JSON-lines sink.

mod jsonl;
mod memory;

pub use jsonl::JsonLinesOutput;
pub use memory::{MemoryInput, MemoryOutput, Sample};
