/// Simulation driver.
///
/// The scheduler itself never advances time; it only books one cycle per
/// `cycle()` call. The driver owns the scheduler plus one core per platform
/// and runs the outer loop: tick the scheduler, let every core finish an
/// expired tile and poll for a new one, collect completed requests. Cores
/// model compute with a flat per-optype latency; the micro-architecture
/// behind a tile is out of scope here.
use tracing::info;

use crate::metrics::write_metrics;
use crate::operation::{OpType, Tile, TileStatus};
use crate::request::InferRequest;
use crate::scheduler::Scheduler;
use crate::stage::StagePlatform;

/// Cycles a core holds one tile of each operation type.
#[derive(Debug, Clone)]
pub struct TileLatency {
    pub matmul: u64,
    pub layernorm: u64,
    pub gelu: u64,
    pub add: u64,
    /// PIM GEMV command (logit-softmax and attend tiles)
    pub gemv: u64,
}

impl Default for TileLatency {
    fn default() -> Self {
        TileLatency {
            matmul: 128,
            layernorm: 32,
            gelu: 16,
            add: 8,
            gemv: 184,
        }
    }
}

impl TileLatency {
    pub fn cycles(&self, op: OpType) -> u64 {
        match op {
            OpType::MatMul(_) => self.matmul,
            OpType::LayerNorm => self.layernorm,
            OpType::Gelu => self.gelu,
            OpType::Add => self.add,
            OpType::LogitSoftmax | OpType::Attend => self.gemv,
        }
    }
}

/// One compute core bound to a platform. Holds at most one tile; polls the
/// scheduler at most once per cycle, as the contract requires.
pub struct PlatformCore {
    pub platform: StagePlatform,
    pub core_id: u32,
    current: Option<Tile>,
    busy_until: u64,
}

impl PlatformCore {
    pub fn new(platform: StagePlatform, core_id: u32) -> Self {
        PlatformCore {
            platform,
            core_id,
            current: None,
            busy_until: 0,
        }
    }

    /// One cycle: retire an expired tile, then try to take a new one.
    pub fn step(&mut self, scheduler: &mut Scheduler, now: u64, latency: &TileLatency) {
        if let Some(tile) = self.current {
            if now >= self.busy_until {
                scheduler.finish_tile(self.core_id, tile);
                self.current = None;
            }
        }

        if self.current.is_none() {
            let peek = scheduler.top_tile(self.platform, self.core_id);
            if !peek.is_empty() {
                let tile = scheduler.get_tile(self.platform, self.core_id);
                match tile.status {
                    TileStatus::Ready => {
                        self.current = Some(tile);
                        self.busy_until = now + latency.cycles(tile.op_type);
                    }
                    // Barriers retire inside get_tile; nothing to hold.
                    TileStatus::Barrier | TileStatus::Empty => {}
                }
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }
}

/// Result of a simulation run.
#[derive(Debug)]
pub struct SimReport {
    pub completed: Vec<InferRequest>,
    pub cycles: u64,
    pub stage_cycles: Vec<(String, u64)>,
}

/// Owns the scheduler and its cores and drives them to completion.
pub struct Simulator {
    pub scheduler: Scheduler,
    cores: Vec<PlatformCore>,
    latency: TileLatency,
    /// Publish a LiveMetrics snapshot every this many cycles (0 = off)
    pub snapshot_interval: u64,
}

impl Simulator {
    pub fn new(scheduler: Scheduler, mode_platforms: &[StagePlatform]) -> Self {
        let cores = mode_platforms
            .iter()
            .enumerate()
            .map(|(i, &p)| PlatformCore::new(p, i as u32))
            .collect();
        Simulator {
            scheduler,
            cores,
            latency: TileLatency::default(),
            snapshot_interval: 0,
        }
    }

    pub fn with_latency(mut self, latency: TileLatency) -> Self {
        self.latency = latency;
        self
    }

    /// Run until all requests complete or `max_cycles` elapse.
    pub fn run(&mut self, max_cycles: u64) -> SimReport {
        let mut completed = Vec::new();

        while self.scheduler.running() {
            self.scheduler.cycle();
            let now = self.scheduler.cycles();

            for core in &mut self.cores {
                core.step(&mut self.scheduler, now, &self.latency);
            }

            while let Some(req) = self.scheduler.pop_completed_request() {
                info!(req = req.id, generated = req.generated, "request served");
                completed.push(req);
            }

            if self.snapshot_interval > 0 && now % self.snapshot_interval == 0 {
                write_metrics(&self.scheduler.live_metrics());
            }

            if now >= max_cycles {
                info!(max_cycles, "cycle budget exhausted");
                break;
            }
        }

        if self.snapshot_interval > 0 {
            let mut m = self.scheduler.live_metrics();
            m.status = "complete".to_string();
            write_metrics(&m);
        }

        SimReport {
            completed,
            cycles: self.scheduler.cycles(),
            stage_cycles: self.scheduler.stage_stats().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_covers_every_op_type() {
        use crate::operation::MatMulKind;
        let l = TileLatency::default();
        assert_eq!(l.cycles(OpType::MatMul(MatMulKind::QkvGen)), 128);
        assert_eq!(l.cycles(OpType::LogitSoftmax), 184);
        assert_eq!(l.cycles(OpType::Attend), 184);
        assert!(l.cycles(OpType::Add) < l.cycles(OpType::LayerNorm));
    }
}
