pub mod checkpoint;
pub mod dedup;
pub mod hash;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use dedup::{ContentHash, DedupStore};
pub use hash::canonical_hash;
