/// Operations and the tiles they decompose into.
///
/// An operation is one node of a stage program's dataflow graph. Once all of
/// its inputs are produced it exposes a finite tile stream; tiles are the
/// unit the platform cores actually consume. Dense and PIM streams end in a
/// `Barrier` sentinel that retires only after every earlier tile of the
/// operation has finished (the accumulate/drain synchronization point).
use serde::{Deserialize, Serialize};

use crate::config::DerivedParams;
use crate::stage::StagePlatform;
use crate::tensor::TensorId;

/// Edge length of the modeled systolic tile.
pub const SA_TILE_EDGE: u32 = 128;

/// Which weight matrix a dense matmul applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatMulKind {
    QkvGen,
    Proj,
    Fc1,
    Fc2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    MatMul(MatMulKind),
    LayerNorm,
    Gelu,
    Add,
    LogitSoftmax,
    Attend,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpType::MatMul(MatMulKind::QkvGen) => write!(f, "MatMul(QKVGen)"),
            OpType::MatMul(MatMulKind::Proj) => write!(f, "MatMul(Proj)"),
            OpType::MatMul(MatMulKind::Fc1) => write!(f, "MatMul(FC1)"),
            OpType::MatMul(MatMulKind::Fc2) => write!(f, "MatMul(FC2)"),
            OpType::LayerNorm => write!(f, "LayerNorm"),
            OpType::Gelu => write!(f, "Gelu"),
            OpType::Add => write!(f, "Add"),
            OpType::LogitSoftmax => write!(f, "LogitSoftmax"),
            OpType::Attend => write!(f, "Attend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileStatus {
    Ready,
    Barrier,
    Empty,
}

/// Smallest schedulable unit. Handed to cores by copy; cores hand it back via
/// `finish_tile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub operation_id: u32,
    pub status: TileStatus,
    pub op_type: OpType,
    pub stage_platform: StagePlatform,
}

impl Tile {
    /// Sentinel returned when a queue has nothing dispatchable.
    pub fn empty(platform: StagePlatform) -> Self {
        Tile {
            operation_id: u32::MAX,
            status: TileStatus::Empty,
            op_type: OpType::Add,
            stage_platform: platform,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status == TileStatus::Empty
    }
}

/// How an operation's tile stream is derived from its shapes.
#[derive(Debug, Clone)]
pub enum TileSpec {
    /// Systolic matmul over an [rows, cols] output; barrier-terminated.
    Dense { rows: u32, cols: u32 },
    /// Row-parallel vector op (LayerNorm / Gelu / Add); no barrier.
    Vector { rows: u32 },
    /// Per-request Q x K^T GEMV sweep; barrier-terminated.
    PimLogit { seq_lens: Vec<u32> },
    /// Per-request logit x V GEMV sweep; barrier-terminated.
    PimAttend { seq_lens: Vec<u32> },
}

impl TileSpec {
    fn ready_tiles(&self, d: &DerivedParams) -> u32 {
        match self {
            TileSpec::Dense { rows, cols } => {
                rows.div_ceil(SA_TILE_EDGE).max(1) * cols.div_ceil(SA_TILE_EDGE).max(1)
            }
            TileSpec::Vector { rows } => rows.div_ceil(SA_TILE_EDGE).max(1),
            TileSpec::PimLogit { seq_lens } => seq_lens
                .iter()
                .map(|&seq| {
                    d.effective_e.div_ceil(d.page_size_elems)
                        * seq.div_ceil(d.key_period).max(1)
                })
                .sum::<u32>()
                .max(1),
            TileSpec::PimAttend { seq_lens } => seq_lens
                .iter()
                .map(|&seq| {
                    seq.div_ceil(d.page_size_elems).max(1) * d.nh * d.dk.div_ceil(d.key_period)
                })
                .sum::<u32>()
                .max(1),
        }
    }

    fn has_barrier(&self) -> bool {
        !matches!(self, TileSpec::Vector { .. })
    }
}

/// One dataflow node of a stage program.
#[derive(Debug)]
pub struct Operation {
    /// Globally unique across all programs of a run
    pub id: u32,
    pub name: String,
    pub op_type: OpType,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Inputs whose producer has not finished yet; 0 means executable
    pub unmet_inputs: u32,
    pub finished: bool,
    spec: TileSpec,
    platform: StagePlatform,
    tiles: Vec<Tile>,
}

impl Operation {
    pub fn new(
        id: u32,
        name: String,
        op_type: OpType,
        spec: TileSpec,
        platform: StagePlatform,
    ) -> Self {
        Operation {
            id,
            name,
            op_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            unmet_inputs: 0,
            finished: false,
            spec,
            platform,
            tiles: Vec::new(),
        }
    }

    pub fn check_executable(&self) -> bool {
        self.unmet_inputs == 0 && !self.finished
    }

    pub fn check_finish(&self) -> bool {
        self.finished
    }

    /// The tile stream, generated on first use. Never empty.
    pub fn get_tiles(&mut self, d: &DerivedParams) -> &[Tile] {
        if self.tiles.is_empty() {
            let ready = self.spec.ready_tiles(d);
            let mut tiles = Vec::with_capacity(ready as usize + 1);
            for _ in 0..ready {
                tiles.push(Tile {
                    operation_id: self.id,
                    status: TileStatus::Ready,
                    op_type: self.op_type,
                    stage_platform: self.platform,
                });
            }
            if self.spec.has_barrier() {
                tiles.push(Tile {
                    operation_id: self.id,
                    status: TileStatus::Barrier,
                    op_type: self.op_type,
                    stage_platform: self.platform,
                });
            }
            self.tiles = tiles;
        }
        &self.tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::stage::SubBatchMode;

    fn derived() -> DerivedParams {
        SimConfig {
            dram_channels: 1,
            dram_page_size_b: 512,
            dram_banks_per_ch: 16,
            precision_bytes: 2,
            model_n_head: 32,
            model_n_embd: 4096,
            n_tp: 1,
            model_params_b_total: 0,
            sub_batch_mode: SubBatchMode::TwoWay,
            ch_load_balancing: false,
            max_active_reqs: 1024,
            max_batch_size: 1024,
            log_dir: None,
        }
        .derived()
    }

    #[test]
    fn dense_stream_is_barrier_terminated() {
        let d = derived();
        let mut op = Operation::new(
            0,
            "mm".into(),
            OpType::MatMul(MatMulKind::Proj),
            TileSpec::Dense { rows: 200, cols: 4096 },
            StagePlatform::Sa,
        );
        let tiles = op.get_tiles(&d);
        // ceil(200/128) * ceil(4096/128) = 2 * 32, plus the barrier.
        assert_eq!(tiles.len(), 65);
        assert_eq!(tiles.last().unwrap().status, TileStatus::Barrier);
        assert!(tiles[..64].iter().all(|t| t.status == TileStatus::Ready));
    }

    #[test]
    fn vector_stream_has_no_barrier() {
        let d = derived();
        let mut op = Operation::new(
            1,
            "add".into(),
            OpType::Add,
            TileSpec::Vector { rows: 4 },
            StagePlatform::Sa,
        );
        let tiles = op.get_tiles(&d);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].status, TileStatus::Ready);
    }

    #[test]
    fn pim_streams_scale_with_sequence_length() {
        let d = derived();
        let mut logit = Operation::new(
            2,
            "ls".into(),
            OpType::LogitSoftmax,
            TileSpec::PimLogit { seq_lens: vec![16] },
            StagePlatform::Pim,
        );
        // ceil(4096/256) * ceil(16/16) = 16 GEMV tiles + barrier.
        assert_eq!(logit.get_tiles(&d).len(), 17);

        let mut attend = Operation::new(
            3,
            "att".into(),
            OpType::Attend,
            TileSpec::PimAttend { seq_lens: vec![16] },
            StagePlatform::Pim,
        );
        // ceil(16/256) * 32 heads * ceil(128/16) = 256 tiles + barrier.
        assert_eq!(attend.get_tiles(&d).len(), 257);
    }

    #[test]
    fn zero_length_streams_still_emit_one_tile() {
        let d = derived();
        let mut logit = Operation::new(
            4,
            "ls".into(),
            OpType::LogitSoftmax,
            TileSpec::PimLogit { seq_lens: vec![] },
            StagePlatform::Pim,
        );
        assert_eq!(logit.get_tiles(&d).len(), 2); // 1 ready + barrier
    }
}
