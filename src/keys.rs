//! Shared key and channel names on the coordination store.
//!
//! Every name here is part of the cross-node protocol: two nodes running the
//! same version must agree on them to interoperate. Per-round keys are
//! deleted at round cleanup, per-increment keys at engine shutdown.

/// Ordered set of not-yet-claimed work items for the current round.
pub const CHUNK_QUEUE: &str = "chunkQueue";

/// Remaining-chunk counter decremented by each atomic chunk claim.
pub const CHUNK_COUNT: &str = "chunkCount";

/// Total chunks published for the current round.
pub const TOTAL_CHUNKS: &str = "totalChunks";

/// Scored set of items marked "updated" by the previous round's computation.
pub const KEYS_UPDATED: &str = "keysUpdated";

/// Scored set of items newly available from an upstream source.
pub const CURRENT_KEYS: &str = "currentKeys";

/// Scored set of every item this node is responsible for.
pub const LOCAL_KEYS: &str = "localKeys";

/// Marker a stealer sets on the stealee's store before claiming its chunks.
pub const STEALER_MARKER: &str = "stealerActive";

/// Count of stealers currently working a stealee's queue.
pub const ACTIVE_STEALERS: &str = "activeStealers";

/// Per-stealer outcome flags (`<stealer addr>:<0|1>`), read by the stealee.
pub const STEALER_OUTCOMES: &str = "stealerOutcomes";

/// List the last departing stealer pushes to release the blocked stealee.
pub const STEALERS_DONE: &str = "stealersDone";

/// Increment counter surviving across whole engine runs.
pub const CURRENT_INCREMENT: &str = "currentIncrement";

/// Per-increment job counter, cleared at the end of each engine run.
pub const JOB_COUNT: &str = "numJobs";

/// Pub/sub channel carrying readiness acks and round-status messages.
pub const STATUS_CHANNEL: &str = "fleet:status";

/// Pub/sub channel carrying per-round progress fractions.
pub const PROGRESS_CHANNEL: &str = "fleet:progress";

/// Score every item is inserted into the chunk queue with.
pub const INIT_SCORE: f64 = 0.0;
