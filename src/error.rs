/// Error kinds for the simulator core.
///
/// Only `NoCapacity` is recoverable: the allocator surfaces it and the
/// request stays pending for the next scheduling pass. The remaining kinds
/// are programmer errors: the scheduler panics with the formatted error to
/// halt the simulation at the point of corruption.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// The tile allocator cannot fit a request's KV cache on any channel.
    #[error("no PIM tile capacity for seq_len {seq_len} (need {need} tiles, {available} available)")]
    NoCapacity {
        seq_len: u32,
        need: u32,
        available: u32,
    },

    /// A platform/stage combination outside the schedule tables.
    #[error("platform {platform} has no binding in stage {stage}")]
    InvalidStage { platform: String, stage: String },

    /// An operation that can never become executable was detected.
    #[error("dataflow deadlock: {program} has unfinished operations but none executable")]
    DagDeadlock { program: String },

    /// Tile counters went out of range for an operation.
    #[error("tile accounting corrupt for operation {op_id}: launched {launched} + remain {remain} vs total {total}")]
    TileAccounting {
        op_id: u32,
        launched: u32,
        remain: u32,
        total: u32,
    },

    /// Rejected at configuration validation.
    #[error("invalid config: {0}")]
    Config(String),
}
