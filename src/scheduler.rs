/// The scheduler: sub-batch interleaving across SA and PIM.
///
/// One `cycle()` call is one simulated time step of bookkeeping. The
/// scheduler owns the requests, the channel state, the per-stage programs and
/// the per-platform tile queues; compute cores are external agents that poll
/// `top_tile`/`get_tile` and hand completed tiles back through `finish_tile`.
/// Nothing here blocks: every transition is synchronous inside one call.
///
/// Lifecycle of a decode step: at the initial stage, pending requests are
/// admitted through the tile allocator and the active set is partitioned
/// into sub-batches; each stage then builds one program per platform, tiles
/// drain through the queues, and when every platform's program has finished
/// the stage advances. At `Finish` the sub-batches are drained (one token
/// decoded per request), completed requests are emitted, and the next
/// `cycle()` re-enters the initial stage.
use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use crate::allocator::TileAllocator;
use crate::config::{DerivedParams, SimConfig};
use crate::error::SimError;
use crate::metrics::{
    ChannelSnapshot, LiveMetrics, OperationStat, PlatformSnapshot, now_ms, write_operation_stats,
};
use crate::model::Model;
use crate::operation::{OpType, Tile, TileStatus};
use crate::partition::{partitioner_for, SubBatchPartitioner};
use crate::program::StageProgram;
use crate::request::{BatchedRequest, InferRequest, KvKind, KvTensor};
use crate::stage::{binding, Stage, StagePlatform, SubBatchMode};

/// Tile accounting for one operation currently feeding a queue.
/// `launched` counts dispatched tiles, `remain` counts unfinished ones, so
/// `launched + remain == total` exactly when no dispatched tile is in flight.
#[derive(Debug, Clone)]
pub struct RunningStat {
    pub op_id: u32,
    pub name: String,
    pub op_type: OpType,
    pub start_cycle: u64,
    pub finish_cycle: u64,
    pub total_tiles: u32,
    pub remain_tiles: u32,
    pub launched_tiles: u32,
}

pub struct Scheduler {
    cfg: SimConfig,
    d: DerivedParams,
    mode: SubBatchMode,
    model: Option<Model>,

    /// All live requests, keyed by id
    requests: HashMap<u32, InferRequest>,
    /// Requests not yet completed, in arrival order
    pending: Vec<u32>,
    completed: VecDeque<InferRequest>,
    active_reqs: u32,

    allocator: TileAllocator,
    partitioner: Box<dyn SubBatchPartitioner>,
    /// Current decode step's sub-batches (request ids)
    sub_batches: Vec<Vec<u32>>,

    stage: Stage,
    init_stage: Stage,
    /// Debug: force the next stage after any completion to be Finish
    just_one_stage: bool,

    /// One program slot per platform, `mode.platforms()` order
    programs: Vec<Option<StageProgram>>,
    exec_queues: Vec<VecDeque<Tile>>,
    /// Operation currently feeding each slot's queue
    slot_op: Vec<Option<u32>>,

    active_ops: HashMap<u32, RunningStat>,
    finished_ops: HashMap<u32, RunningStat>,

    cycles: u64,
    /// (stage name, cumulative cycles at completion)
    stage_stats: Vec<(String, u64)>,
    next_op_id: u32,
}

impl Scheduler {
    pub fn new(cfg: SimConfig) -> Result<Self, SimError> {
        cfg.validate()?;
        let d = cfg.derived();
        let mode = cfg.sub_batch_mode;
        let slots = mode.platforms().len();
        let allocator = TileAllocator::new(&cfg, &d);

        Ok(Scheduler {
            d,
            mode,
            model: None,
            requests: HashMap::new(),
            pending: Vec::new(),
            completed: VecDeque::new(),
            active_reqs: 0,
            allocator,
            partitioner: partitioner_for(mode),
            sub_batches: vec![Vec::new(); mode.sub_batches()],
            stage: Stage::A,
            init_stage: Stage::A,
            just_one_stage: false,
            programs: (0..slots).map(|_| None).collect(),
            exec_queues: (0..slots).map(|_| VecDeque::new()).collect(),
            slot_op: vec![None; slots],
            active_ops: HashMap::new(),
            finished_ops: HashMap::new(),
            cycles: 0,
            stage_stats: Vec::new(),
            next_op_id: 0,
            cfg,
        })
    }

    /// Bind the model parameter provider.
    pub fn launch(&mut self, model: Model) {
        info!("model {} launched in scheduler", model.name);
        self.model = Some(model);
    }

    pub fn add_request(&mut self, req: InferRequest) {
        self.pending.push(req.id);
        self.requests.insert(req.id, req);
    }

    /// Advance one simulated cycle of scheduler bookkeeping.
    pub fn cycle(&mut self) {
        let all_none = self.programs.iter().all(Option::is_none);
        if all_none && self.stage == self.init_stage && !self.pending.is_empty() {
            self.init_batches();
        }

        self.cycles += 1;

        let any_batched = self.sub_batches.iter().any(|b| !b.is_empty());
        if self.programs.iter().all(Option::is_none) && any_batched {
            if self.stage == Stage::Finish {
                let batches = std::mem::replace(
                    &mut self.sub_batches,
                    vec![Vec::new(); self.mode.sub_batches()],
                );
                for batch in &batches {
                    self.cleanup_sub_batch(batch);
                }
                self.stage = self.init_stage;
                return;
            }
            info!("---------- Stage {} ----------", self.stage);
            self.make_program();
        }
    }

    // -----------------------------------------------------------------------
    // Admission & partitioning
    // -----------------------------------------------------------------------

    fn init_batches(&mut self) {
        self.allocate_requests();
        self.group_sub_batches();
    }

    /// Admit pending requests onto channels. `NoCapacity` defers a request
    /// to the next pass; it keeps `channel = None` and stays uninitiated.
    fn allocate_requests(&mut self) {
        let mut batch_size = 0u32;
        let pending: Vec<u32> = self.pending.clone();

        for id in pending {
            if batch_size == self.cfg.max_batch_size {
                break;
            }
            let req = &self.requests[&id];
            debug_assert!(req.output_size > req.generated);

            if !req.is_initiated {
                if self.active_reqs >= self.cfg.max_active_reqs {
                    continue;
                }
                let seq_len = req.input_size;
                match self.allocator.allocate(id, seq_len) {
                    Ok((ch, tiles)) => {
                        let req = self.requests.get_mut(&id).unwrap();
                        req.channel = Some(ch);
                        req.kv_tiles = tiles;
                        req.k_cache.push(KvTensor::new(
                            format!("{id}_KEY_0"),
                            KvKind::Key,
                            vec![self.d.nh, self.d.dk, seq_len],
                            ch,
                        ));
                        req.v_cache.push(KvTensor::new(
                            format!("{id}_VALUE_0"),
                            KvKind::Value,
                            vec![self.d.nh, seq_len, self.d.dk],
                            ch,
                        ));
                        req.is_initiated = true;
                        self.active_reqs += 1;
                        info!(req = id, seq_len, ch, "request admitted");
                    }
                    Err(err) => {
                        info!(req = id, %err, "request deferred");
                        continue;
                    }
                }
            }
            batch_size += 1;
        }
    }

    fn group_sub_batches(&mut self) {
        self.sub_batches = self.partitioner.partition(self.allocator.request_queues());
        info!(
            total = self.sub_batches.iter().map(|b| b.len()).sum::<usize>(),
            sizes = ?self.sub_batches.iter().map(|b| b.len()).collect::<Vec<_>>(),
            "sub-batches formed"
        );
    }

    // -----------------------------------------------------------------------
    // Program construction & stage turnover
    // -----------------------------------------------------------------------

    fn make_program(&mut self) {
        let model = self
            .model
            .clone()
            .expect("Scheduler::launch must run before the first cycle");
        let bind = binding(self.mode, self.stage);
        let platforms = self.mode.platforms();

        for slot in 0..platforms.len() {
            let breq = BatchedRequest::new(self.sub_batches[bind[slot]].clone());
            info!(
                "new program for {} (sub-batch size: {})",
                platforms[slot],
                breq.len()
            );
            let program = StageProgram::new(
                &model,
                breq,
                platforms[slot],
                self.stage,
                self.mode,
                &self.cfg,
                &mut self.requests,
                &mut self.next_op_id,
            );
            self.programs[slot] = Some(program);
        }
        for slot in 0..platforms.len() {
            self.refresh_status(slot);
        }
    }

    /// Drop a finished program, or (re)fill the slot's tile queue from its
    /// front executable operation.
    fn refresh_status(&mut self, slot: usize) {
        let finished = self.programs[slot]
            .as_ref()
            .map(|p| p.check_finish())
            .unwrap_or(false);
        if finished {
            self.finish_program(slot);
        }

        let Some(program) = self.programs[slot].as_mut() else {
            return;
        };
        if !self.exec_queues[slot].is_empty() {
            return;
        }

        match program.front_executable() {
            Some(op_id) => {
                if self.active_ops.contains_key(&op_id) {
                    // Queue drained but tiles of this operation are still in
                    // flight; nothing new to seed yet.
                    return;
                }
                let tiles = program.op_tiles(op_id, &self.d);
                assert!(!tiles.is_empty());
                let name = program.op_name(op_id).to_string();
                let op_type = tiles[0].op_type;
                info!("start operation {name}");
                self.exec_queues[slot] = tiles.into_iter().collect();
                let total = self.exec_queues[slot].len() as u32;
                self.active_ops.insert(
                    op_id,
                    RunningStat {
                        op_id,
                        name,
                        op_type,
                        start_cycle: self.cycles,
                        finish_cycle: 0,
                        total_tiles: total,
                        remain_tiles: total,
                        launched_tiles: 0,
                    },
                );
                self.slot_op[slot] = Some(op_id);
            }
            None => {
                if self.slot_op[slot].is_none() {
                    // Unfinished operations with nothing executable and
                    // nothing in flight cannot make progress.
                    panic!(
                        "{}",
                        SimError::DagDeadlock {
                            program: program.name.clone(),
                        }
                    );
                }
            }
        }
    }

    fn finish_program(&mut self, slot: usize) {
        let program = self.programs[slot].take().unwrap();
        info!("program {} finished at {}", program.name, self.cycles);

        if let Some(dir) = self.cfg.log_dir.clone() {
            let stats: Vec<OperationStat> = program
                .op_ids()
                .iter()
                .filter_map(|id| self.finished_ops.get(id))
                .map(|s| OperationStat {
                    op_id: s.op_id,
                    name: s.name.clone(),
                    op_type: s.op_type.to_string(),
                    start_cycle: s.start_cycle,
                    finish_cycle: s.finish_cycle,
                    total_tiles: s.total_tiles,
                })
                .collect();
            if let Err(err) = write_operation_stats(&dir, &program.name, &stats) {
                info!(%err, "failed to persist operation stats");
            }
        }

        self.refresh_stage();
    }

    fn refresh_stage(&mut self) {
        if self.programs.iter().all(Option::is_none) {
            info!("------- Stage {} Done -------", self.stage);
            self.stage_stats.push((self.stage.to_string(), self.cycles));

            self.stage = if self.just_one_stage {
                Stage::Finish
            } else {
                self.stage.next(self.mode)
            };
        }
    }

    /// End-of-step drain: every request in the batch decoded one token; KV
    /// consumer links are severed; completed requests leave the system and
    /// give their tiles back.
    fn cleanup_sub_batch(&mut self, batch: &[u32]) {
        for &id in batch {
            let req = self.requests.get_mut(&id).unwrap();
            req.is_initiated = true;
            req.generated += 1;
            req.k_cache[0].clear_children();
            req.v_cache[0].clear_children();

            let done = req.is_done();
            let channel = req.channel;
            let tiles = req.kv_tiles;
            let seq_len = req.input_size;

            if done {
                let ch = channel.expect("completed request was never placed on a channel");
                self.allocator.release(id, ch, tiles, seq_len);
                self.pending.retain(|&p| p != id);
                self.active_reqs -= 1;
                let req = self.requests.remove(&id).unwrap();
                info!(req = id, generated = req.generated, "request completed");
                self.completed.push_back(req);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tile interface (called by platform cores)
    // -----------------------------------------------------------------------

    fn slot_of(&self, platform: StagePlatform) -> usize {
        self.mode
            .platforms()
            .iter()
            .position(|&p| p == platform)
            .unwrap_or_else(|| {
                panic!(
                    "{}",
                    SimError::InvalidStage {
                        platform: platform.to_string(),
                        stage: self.stage.to_string(),
                    }
                )
            })
    }

    /// True when no dispatched tile of `op_id` is still in flight.
    fn barrier_ready(&self, op_id: u32) -> bool {
        let stat = self.active_ops.get(&op_id).unwrap_or_else(|| {
            panic!(
                "{}",
                SimError::TileAccounting {
                    op_id,
                    launched: 0,
                    remain: 0,
                    total: 0,
                }
            )
        });
        stat.launched_tiles + stat.remain_tiles == stat.total_tiles
    }

    /// Peek the head of a platform's queue. Returns an Empty tile when the
    /// queue is empty or the head is a barrier whose operation still has
    /// tiles in flight; a ready barrier is returned so the caller can retire
    /// it with `get_tile`.
    pub fn top_tile(&self, platform: StagePlatform, _core_id: u32) -> Tile {
        let slot = self.slot_of(platform);
        match self.exec_queues[slot].front() {
            None => Tile::empty(platform),
            Some(&tile) => {
                if tile.status == TileStatus::Barrier && !self.barrier_ready(tile.operation_id) {
                    Tile::empty(platform)
                } else {
                    tile
                }
            }
        }
    }

    /// Consume the head of a platform's queue. A barrier head pops only once
    /// its operation has exhausted all other tiles; retiring it finalizes
    /// the operation.
    pub fn get_tile(&mut self, platform: StagePlatform, core_id: u32) -> Tile {
        let slot = self.slot_of(platform);
        let Some(&tile) = self.exec_queues[slot].front() else {
            return Tile::empty(platform);
        };

        if tile.status == TileStatus::Barrier {
            if !self.barrier_ready(tile.operation_id) {
                return Tile::empty(platform);
            }
            self.exec_queues[slot].pop_front();
            let stat = self.active_ops.get_mut(&tile.operation_id).unwrap();
            stat.launched_tiles += 1;
            stat.remain_tiles -= 1;
            let done = stat.remain_tiles == 0;
            debug!(op = tile.operation_id, core_id, "barrier retired");
            if done {
                self.finalize_operation(tile);
            }
            tile
        } else {
            self.exec_queues[slot].pop_front();
            let stat = self.active_ops.get_mut(&tile.operation_id).unwrap_or_else(|| {
                panic!(
                    "{}",
                    SimError::TileAccounting {
                        op_id: tile.operation_id,
                        launched: 0,
                        remain: 0,
                        total: 0,
                    }
                )
            });
            stat.launched_tiles += 1;
            debug!(
                op = %tile.op_type,
                core_id,
                cycle = self.cycles,
                "tile dispatched"
            );
            tile
        }
    }

    /// A core hands back a completed tile. Returns true when this finished
    /// the whole operation.
    pub fn finish_tile(&mut self, core_id: u32, tile: Tile) -> bool {
        let op_id = tile.operation_id;
        debug!(op = op_id, core_id, cycle = self.cycles, "tile finished");

        let stat = self.active_ops.get_mut(&op_id).unwrap_or_else(|| {
            panic!(
                "{}",
                SimError::TileAccounting {
                    op_id,
                    launched: 0,
                    remain: 0,
                    total: 0,
                }
            )
        });
        if stat.remain_tiles == 0 {
            panic!(
                "{}",
                SimError::TileAccounting {
                    op_id,
                    launched: stat.launched_tiles,
                    remain: 0,
                    total: stat.total_tiles,
                }
            );
        }
        stat.remain_tiles -= 1;
        let done = stat.remain_tiles == 0;

        if done {
            self.finalize_operation(tile);
            true
        } else {
            let slot = self.slot_of(tile.stage_platform);
            self.refresh_status(slot);
            false
        }
    }

    /// Move an exhausted operation to the finished set, wake its children,
    /// and refresh the owning slot.
    fn finalize_operation(&mut self, tile: Tile) {
        let op_id = tile.operation_id;
        let mut stat = self.active_ops.remove(&op_id).unwrap();
        stat.finish_cycle = self.cycles;
        info!(
            "operation {} finished at {} ({} cycles)",
            stat.name,
            self.cycles,
            self.cycles - stat.start_cycle
        );
        self.finished_ops.insert(op_id, stat);

        let slot = self.slot_of(tile.stage_platform);
        if let Some(program) = self.programs[slot].as_mut() {
            program.finish_operation(op_id);
        }
        self.slot_op[slot] = None;
        self.refresh_status(slot);
    }

    // -----------------------------------------------------------------------
    // Client interface
    // -----------------------------------------------------------------------

    pub fn has_completed_request(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn pop_completed_request(&mut self) -> Option<InferRequest> {
        self.completed.pop_front()
    }

    /// True while requests are in flight or completions await pickup.
    pub fn running(&self) -> bool {
        !self.pending.is_empty() || !self.completed.is_empty()
    }

    pub fn set_just_one_stage(&mut self, v: bool) {
        self.just_one_stage = v;
    }

    // -----------------------------------------------------------------------
    // Introspection & stats
    // -----------------------------------------------------------------------

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn active_reqs(&self) -> u32 {
        self.active_reqs
    }

    pub fn stage_stats(&self) -> &[(String, u64)] {
        &self.stage_stats
    }

    pub fn allocator(&self) -> &TileAllocator {
        &self.allocator
    }

    pub fn request(&self, id: u32) -> Option<&InferRequest> {
        self.requests.get(&id)
    }

    pub fn active_op(&self, op_id: u32) -> Option<&RunningStat> {
        self.active_ops.get(&op_id)
    }

    pub fn active_ops(&self) -> impl Iterator<Item = &RunningStat> {
        self.active_ops.values()
    }

    /// KV tiles currently reserved by live initiated requests.
    pub fn in_use_tiles(&self) -> u64 {
        self.requests
            .values()
            .filter(|r| r.is_initiated)
            .map(|r| r.kv_tiles as u64)
            .sum()
    }

    /// Per-stage execution cycles, from the cumulative records.
    pub fn print_stat(&self) {
        let mut prev = 0;
        for (name, cum) in &self.stage_stats {
            info!("stage {} : {} cycles", name, cum - prev);
            prev = *cum;
        }
    }

    pub fn live_metrics(&self) -> LiveMetrics {
        let platforms = self
            .mode
            .platforms()
            .iter()
            .enumerate()
            .map(|(slot, p)| {
                let stat = self.slot_op[slot].and_then(|id| self.active_ops.get(&id));
                PlatformSnapshot {
                    name: p.to_string(),
                    current_op: stat.map(|s| s.name.clone()),
                    queue_depth: self.exec_queues[slot].len(),
                    launched: stat.map(|s| s.launched_tiles).unwrap_or(0),
                    remain: stat.map(|s| s.remain_tiles).unwrap_or(0),
                    total: stat.map(|s| s.total_tiles).unwrap_or(0),
                }
            })
            .collect();

        let channels = (0..self.allocator.num_channels())
            .map(|ch| ChannelSnapshot {
                available_tiles: self.allocator.available_tiles(ch),
                active_requests: self.allocator.request_queues()[ch as usize].len(),
                accum_latency: self.allocator.accum_latency(ch),
            })
            .collect();

        LiveMetrics {
            status: if self.running() { "running" } else { "idle" }.to_string(),
            mode: match self.mode {
                SubBatchMode::TwoWay => "two-way",
                SubBatchMode::ThreeWay => "three-way",
            }
            .to_string(),
            stage: self.stage.to_string(),
            cycles: self.cycles,
            pending_requests: self.pending.len(),
            active_requests: self.active_reqs,
            completed_requests: self.completed.len(),
            platforms,
            channels,
            stage_cycles: self.stage_stats.clone(),
            timestamp_ms: now_ms(),
        }
    }
}
