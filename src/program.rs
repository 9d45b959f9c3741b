/// Stage programs: the per-(platform, stage) operation DAG.
///
/// A program instantiates exactly the slice of one transformer layer that its
/// platform owns in its stage, wired over the bound sub-batch. Construction
/// chains block builders the way the layer computes: each builder consumes
/// the running `inputs` tensor list and returns the next one, recording
/// producer/consumer edges as it goes. Readiness is counter-based: an
/// operation tracks how many of its input tensors are still unproduced and
/// joins the executable list when that count hits zero.
use std::collections::HashMap;

use tracing::debug;

use crate::config::SimConfig;
use crate::model::Model;
use crate::operation::{MatMulKind, OpType, Operation, TileSpec};
use crate::request::{BatchedRequest, InferRequest};
use crate::stage::{role, Role, Stage, StagePlatform, SubBatchMode};
use crate::tensor::{TensorId, TensorTable};

pub struct StageProgram {
    pub name: String,
    pub platform: StagePlatform,
    pub stage: Stage,
    ops: Vec<Operation>,
    /// Global operation id -> index into `ops`
    op_index: HashMap<u32, usize>,
    tensors: TensorTable,
    /// Executable operations (local indices), dispatch order
    executable: Vec<usize>,
}

impl StageProgram {
    /// Build the program for `platform` in `stage` over `breq`. An empty
    /// sub-batch, or a stage the platform sits out, yields an empty program
    /// that reports finished immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &Model,
        breq: BatchedRequest,
        platform: StagePlatform,
        stage: Stage,
        mode: SubBatchMode,
        cfg: &SimConfig,
        requests: &mut HashMap<u32, InferRequest>,
        id_gen: &mut u32,
    ) -> Self {
        assert!(stage != Stage::Finish, "no programs are built at Finish");

        let mut program = StageProgram {
            name: format!("{platform}_stage_{stage}"),
            platform,
            stage,
            ops: Vec::new(),
            op_index: HashMap::new(),
            tensors: TensorTable::new(),
            executable: Vec::new(),
        };

        let Some(role) = role(mode, stage, platform) else {
            debug!(program = %program.name, "platform sits this stage out");
            return program;
        };
        if breq.is_empty() {
            debug!(program = %program.name, "no requests in sub-batch, skip");
            return program;
        }

        program.build(role, model, &breq, cfg, requests, id_gen);
        program.seed_executable();
        program
    }

    fn build(
        &mut self,
        role: Role,
        model: &Model,
        breq: &BatchedRequest,
        cfg: &SimConfig,
        requests: &mut HashMap<u32, InferRequest>,
        id_gen: &mut u32,
    ) {
        let n = breq.num_rows(requests);
        let e = cfg.model_n_embd;
        let e_tp = e / cfg.n_tp;

        match role {
            Role::QkvGen => {
                let input = self.tensors.leaf("input", vec![n, e]);
                self.qkv_gen_block(model, n, e_tp, vec![input], id_gen);
            }
            Role::Proj => {
                let input = self.tensors.leaf("input", vec![n, e_tp]);
                self.projection_block(model, n, e, vec![input], id_gen);
            }
            Role::Ffn1 => {
                let input = self.tensors.leaf("input", vec![n, e_tp]);
                self.ffn1_block(model, n, e_tp, vec![input], id_gen);
            }
            Role::Ffn2 => {
                let input = self.tensors.leaf("input", vec![n, 4 * e_tp]);
                self.ffn2_block(model, n, e, vec![input], id_gen);
            }
            Role::FullSa | Role::PjFfn => {
                // Projection + fused FFN, optionally chained into QKV-gen.
                let input = self.tensors.leaf("input", vec![n, e_tp]);
                let mut inputs = self.projection_block(model, n, e, vec![input], id_gen);
                inputs = self.ffn1_block(model, n, e_tp, inputs, id_gen);
                inputs = self.ffn2_block(model, n, e, inputs, id_gen);
                if role == Role::FullSa {
                    self.qkv_gen_block(model, n, e_tp, inputs, id_gen);
                }
            }
            Role::Mha => {
                let logits = self.logit_softmax_block(breq, requests, id_gen);
                self.attend_block(breq, requests, logits, id_gen);
            }
            Role::LogitSoftmax => {
                self.logit_softmax_block(breq, requests, id_gen);
            }
            Role::Attend => {
                // The logits were produced by the previous PIM stage's
                // program; they enter this one as ready leaves.
                let logits = breq
                    .reqs
                    .iter()
                    .map(|&id| {
                        let req = &requests[&id];
                        let seq = req.input_size;
                        let dims = vec![req.k_cache[0].dims[0], 1, seq];
                        self.tensors.leaf(format!("logits_{id}"), dims)
                    })
                    .collect();
                self.attend_block(breq, requests, logits, id_gen);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Computation blocks
    // -----------------------------------------------------------------------

    /// LayerNorm -> MatMul(QKVGen): (N,E) -> (N,3E/tp)
    fn qkv_gen_block(
        &mut self,
        model: &Model,
        n: u32,
        e_tp: u32,
        inputs: Vec<TensorId>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let ln = self.add_op(
            "l0.attn.LayerNorm",
            OpType::LayerNorm,
            TileSpec::Vector { rows: n },
            id_gen,
        );
        let gamma = self.tensors.leaf("attn.ln.weight", model.norm_dims(0));
        let mut inputs = inputs;
        inputs.push(gamma);
        let dims = self.tensors.get(inputs[0]).dims.clone();
        let inputs = self.get_outputs(ln, inputs, vec![("ln_out", dims)]);

        let qkv = self.add_op(
            "l0.attn.QKVGen",
            OpType::MatMul(MatMulKind::QkvGen),
            TileSpec::Dense { rows: n, cols: 3 * e_tp },
            id_gen,
        );
        let w = self
            .tensors
            .leaf("attn.qkv.weight", model.weight_dims(0, MatMulKind::QkvGen));
        let mut in2 = inputs;
        in2.push(w);
        self.get_outputs(qkv, in2, vec![("qkv_out", vec![n, 3 * e_tp])])
    }

    /// MatMul(Proj) -> Add(residual): (N,E/tp) -> (N,E)
    fn projection_block(
        &mut self,
        model: &Model,
        n: u32,
        e: u32,
        inputs: Vec<TensorId>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let proj = self.add_op(
            "l0.attn.Projection",
            OpType::MatMul(MatMulKind::Proj),
            TileSpec::Dense { rows: n, cols: e },
            id_gen,
        );
        let w = self
            .tensors
            .leaf("attn.proj.weight", model.weight_dims(0, MatMulKind::Proj));
        let mut in1 = inputs;
        in1.push(w);
        let mut inputs = self.get_outputs(proj, in1, vec![("proj_out", vec![n, e])]);

        let res_buf = self.tensors.leaf("residual_buffer", vec![n, e]);
        let add = self.add_op(
            "l0.attn.Residual",
            OpType::Add,
            TileSpec::Vector { rows: n },
            id_gen,
        );
        inputs.push(res_buf);
        self.get_outputs(add, inputs, vec![("attn_out", vec![n, e])])
    }

    /// LayerNorm -> MatMul(FC1) -> Gelu: (N,E) -> (N,4E/tp)
    fn ffn1_block(
        &mut self,
        model: &Model,
        n: u32,
        e_tp: u32,
        inputs: Vec<TensorId>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let ln = self.add_op(
            "l0.ffn.LayerNorm",
            OpType::LayerNorm,
            TileSpec::Vector { rows: n },
            id_gen,
        );
        let gamma = self.tensors.leaf("ffn.ln.weight", model.norm_dims(0));
        let mut in1 = inputs;
        in1.push(gamma);
        let dims = self.tensors.get(in1[0]).dims.clone();
        let inputs = self.get_outputs(ln, in1, vec![("ffn_ln_out", dims)]);

        let fc1 = self.add_op(
            "l0.ffn.FullyConnected1",
            OpType::MatMul(MatMulKind::Fc1),
            TileSpec::Dense { rows: n, cols: 4 * e_tp },
            id_gen,
        );
        let w = self
            .tensors
            .leaf("ffn.fc1.weight", model.weight_dims(0, MatMulKind::Fc1));
        let mut in2 = inputs;
        in2.push(w);
        let inputs = self.get_outputs(fc1, in2, vec![("fc1_out", vec![n, 4 * e_tp])]);

        let gelu = self.add_op(
            "l0.ffn.Gelu",
            OpType::Gelu,
            TileSpec::Vector { rows: n },
            id_gen,
        );
        self.get_outputs(gelu, inputs, vec![("gelu_out", vec![n, 4 * e_tp])])
    }

    /// MatMul(FC2) -> Add(residual): (N,4E/tp) -> (N,E)
    fn ffn2_block(
        &mut self,
        model: &Model,
        n: u32,
        e: u32,
        inputs: Vec<TensorId>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let fc2 = self.add_op(
            "l0.ffn.FullyConnected2",
            OpType::MatMul(MatMulKind::Fc2),
            TileSpec::Dense { rows: n, cols: e },
            id_gen,
        );
        let w = self
            .tensors
            .leaf("ffn.fc2.weight", model.weight_dims(0, MatMulKind::Fc2));
        let mut in1 = inputs;
        in1.push(w);
        let mut inputs = self.get_outputs(fc2, in1, vec![("fc2_out", vec![n, e])]);

        let res_buf = self.tensors.leaf("residual_buffer", vec![n, e]);
        let add = self.add_op(
            "l0.ffn.Residual",
            OpType::Add,
            TileSpec::Vector { rows: n },
            id_gen,
        );
        inputs.push(res_buf);
        self.get_outputs(add, inputs, vec![("ffn_out", vec![n, e])])
    }

    /// LogitSoftmax(Q.., K..): per-request logits (nh, 1, seq).
    /// Registers itself on every key tensor's child list.
    fn logit_softmax_block(
        &mut self,
        breq: &BatchedRequest,
        requests: &mut HashMap<u32, InferRequest>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let seq_lens: Vec<u32> = breq.reqs.iter().map(|id| requests[id].input_size).collect();
        let ls = self.add_op(
            "l0.attn.LogitSoftmax",
            OpType::LogitSoftmax,
            TileSpec::PimLogit { seq_lens },
            id_gen,
        );
        let ls_id = self.ops[ls].id;

        let mut inputs = Vec::new();
        let mut out_specs = Vec::new();
        for &id in &breq.reqs {
            let req = requests.get_mut(&id).unwrap();
            debug_assert_eq!(req.q_len(), 1);
            let k = &req.k_cache[0];
            let (nh, dk, seq) = (k.dims[0], k.dims[1], k.dims[2]);
            inputs.push(self.tensors.leaf(format!("query_{id}"), vec![nh, 1, dk]));
            inputs.push(self.tensors.leaf(k.name.clone(), k.dims.clone()));
            out_specs.push((format!("logits_{id}"), vec![nh, 1, seq]));
            req.k_cache[0].children.push(ls_id);
        }
        self.get_outputs(ls, inputs, out_specs)
    }

    /// Attend(logits.., V..): per-request (nh, 1, dk).
    /// Registers itself on every value tensor's child list.
    fn attend_block(
        &mut self,
        breq: &BatchedRequest,
        requests: &mut HashMap<u32, InferRequest>,
        logits: Vec<TensorId>,
        id_gen: &mut u32,
    ) -> Vec<TensorId> {
        let seq_lens: Vec<u32> = breq.reqs.iter().map(|id| requests[id].input_size).collect();
        let attend = self.add_op(
            "l0.attn.Attend",
            OpType::Attend,
            TileSpec::PimAttend { seq_lens },
            id_gen,
        );
        let attend_id = self.ops[attend].id;

        let mut inputs = logits;
        let mut out_specs = Vec::new();
        for &id in &breq.reqs {
            let req = requests.get_mut(&id).unwrap();
            let v = &req.v_cache[0];
            let (nh, dk) = (v.dims[0], v.dims[2]);
            inputs.push(self.tensors.leaf(v.name.clone(), v.dims.clone()));
            out_specs.push((format!("attn_ctx_{id}"), vec![nh, 1, dk]));
            req.v_cache[0].children.push(attend_id);
        }
        self.get_outputs(attend, inputs, out_specs)
    }

    // -----------------------------------------------------------------------
    // Graph management
    // -----------------------------------------------------------------------

    fn add_op(
        &mut self,
        name: &str,
        op_type: OpType,
        spec: TileSpec,
        id_gen: &mut u32,
    ) -> usize {
        let id = *id_gen;
        *id_gen += 1;
        let op = Operation::new(id, name.to_string(), op_type, spec, self.platform);
        self.op_index.insert(id, self.ops.len());
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Wire `inputs` into `op_idx` and mint its output tensors. Consumer
    /// edges and the unmet-input counter are recorded here; the returned
    /// outputs become the next block's inputs.
    fn get_outputs<S: Into<String>>(
        &mut self,
        op_idx: usize,
        inputs: Vec<TensorId>,
        outputs: Vec<(S, Vec<u32>)>,
    ) -> Vec<TensorId> {
        for &tid in &inputs {
            let t = self.tensors.get_mut(tid);
            t.consumers.push(op_idx);
            if !t.produced {
                self.ops[op_idx].unmet_inputs += 1;
            }
        }
        self.ops[op_idx].inputs = inputs;

        let out_ids: Vec<TensorId> = outputs
            .into_iter()
            .map(|(name, dims)| self.tensors.output(name, dims, op_idx))
            .collect();
        self.ops[op_idx].outputs = out_ids.clone();
        out_ids
    }

    fn seed_executable(&mut self) {
        for idx in 0..self.ops.len() {
            if self.ops[idx].check_executable() {
                self.executable.push(idx);
            }
        }
    }

    /// Mark an operation finished: produce its outputs, wake any consumers
    /// whose last input this was, and drop it from the executable list.
    pub fn finish_operation(&mut self, op_id: u32) {
        let idx = self.op_index[&op_id];
        self.ops[idx].finished = true;
        self.executable.retain(|&i| i != idx);

        let outputs = self.ops[idx].outputs.clone();
        for tid in outputs {
            self.tensors.get_mut(tid).produced = true;
            let consumers = self.tensors.get(tid).consumers.clone();
            for c in consumers {
                let op = &mut self.ops[c];
                debug_assert!(op.unmet_inputs > 0);
                op.unmet_inputs -= 1;
                if op.check_executable() && !self.executable.contains(&c) {
                    self.executable.push(c);
                }
            }
        }
    }

    /// Global id of the next operation to dispatch, if any is ready.
    pub fn front_executable(&self) -> Option<u32> {
        self.executable.first().map(|&idx| self.ops[idx].id)
    }

    /// Generate (if needed) and return the tile stream of `op_id`.
    pub fn op_tiles(
        &mut self,
        op_id: u32,
        d: &crate::config::DerivedParams,
    ) -> Vec<crate::operation::Tile> {
        let idx = self.op_index[&op_id];
        self.ops[idx].get_tiles(d).to_vec()
    }

    /// True once every operation has finished (vacuously true when empty).
    pub fn check_finish(&self) -> bool {
        self.ops.iter().all(|op| op.check_finish())
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op_ids(&self) -> Vec<u32> {
        self.ops.iter().map(|op| op.id).collect()
    }

    pub fn op_name(&self, op_id: u32) -> &str {
        &self.ops[self.op_index[&op_id]].name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::KvKind;
    use crate::request::KvTensor;

    fn cfg(mode: SubBatchMode) -> SimConfig {
        SimConfig {
            dram_channels: 1,
            dram_page_size_b: 512,
            dram_banks_per_ch: 16,
            precision_bytes: 2,
            model_n_head: 32,
            model_n_embd: 4096,
            n_tp: 1,
            model_params_b_total: 0,
            sub_batch_mode: mode,
            ch_load_balancing: false,
            max_active_reqs: 1024,
            max_batch_size: 1024,
            log_dir: None,
        }
    }

    fn requests_with_kv(n: u32) -> HashMap<u32, InferRequest> {
        let mut m = HashMap::new();
        for id in 0..n {
            let mut r = InferRequest::new(id, 16, 1);
            r.is_initiated = true;
            r.channel = Some(0);
            r.k_cache.push(KvTensor::new(
                format!("{id}_KEY_0"),
                KvKind::Key,
                vec![32, 128, 16],
                0,
            ));
            r.v_cache.push(KvTensor::new(
                format!("{id}_VALUE_0"),
                KvKind::Value,
                vec![32, 16, 128],
                0,
            ));
            m.insert(id, r);
        }
        m
    }

    #[test]
    fn qkv_program_is_a_two_op_chain() {
        let c = cfg(SubBatchMode::TwoWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(2);
        let mut id_gen = 0;
        let prog = StageProgram::new(
            &model,
            BatchedRequest::new(vec![0, 1]),
            StagePlatform::Sa,
            Stage::A,
            SubBatchMode::TwoWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        assert_eq!(prog.num_ops(), 2);
        // Only the LayerNorm is executable; QKVGen waits on its output.
        assert_eq!(prog.front_executable(), Some(0));
        assert!(!prog.check_finish());
    }

    #[test]
    fn full_sa_program_chains_nine_ops() {
        let c = cfg(SubBatchMode::TwoWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(2);
        let mut id_gen = 0;
        let mut prog = StageProgram::new(
            &model,
            BatchedRequest::new(vec![0, 1]),
            StagePlatform::Sa,
            Stage::C,
            SubBatchMode::TwoWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        // Proj, Add, LN, FC1, Gelu, FC2, Add, LN, QKVGen
        assert_eq!(prog.num_ops(), 9);

        // Finishing ops in order walks the chain to completion.
        let mut guard = 0;
        while let Some(id) = prog.front_executable() {
            prog.finish_operation(id);
            guard += 1;
            assert!(guard <= 9, "finish loop ran away");
        }
        assert!(prog.check_finish());
    }

    #[test]
    fn empty_sub_batch_finishes_immediately() {
        let c = cfg(SubBatchMode::TwoWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(0);
        let mut id_gen = 0;
        let prog = StageProgram::new(
            &model,
            BatchedRequest::default(),
            StagePlatform::Sa,
            Stage::A,
            SubBatchMode::TwoWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        assert_eq!(prog.num_ops(), 0);
        assert!(prog.check_finish());
        assert_eq!(prog.front_executable(), None);
    }

    #[test]
    fn skipped_stage_yields_empty_program() {
        let c = cfg(SubBatchMode::TwoWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(2);
        let mut id_gen = 0;
        // PIM sits out stage A in two-way mode.
        let prog = StageProgram::new(
            &model,
            BatchedRequest::new(vec![0, 1]),
            StagePlatform::Pim,
            Stage::A,
            SubBatchMode::TwoWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        assert!(prog.check_finish());
    }

    #[test]
    fn mha_program_registers_kv_children() {
        let c = cfg(SubBatchMode::TwoWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(2);
        let mut id_gen = 0;
        let mut prog = StageProgram::new(
            &model,
            BatchedRequest::new(vec![0, 1]),
            StagePlatform::Pim,
            Stage::B,
            SubBatchMode::TwoWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        assert_eq!(prog.num_ops(), 2); // LogitSoftmax, Attend
        assert_eq!(reqs[&0].k_cache[0].children.len(), 1);
        assert_eq!(reqs[&1].v_cache[0].children.len(), 1);

        // Attend only becomes executable once LogitSoftmax finishes.
        let ls = prog.front_executable().unwrap();
        prog.finish_operation(ls);
        let attend = prog.front_executable().unwrap();
        assert_ne!(ls, attend);
        prog.finish_operation(attend);
        assert!(prog.check_finish());
    }

    #[test]
    fn attend_stage_starts_executable_from_logit_leaves() {
        let c = cfg(SubBatchMode::ThreeWay);
        let model = Model::new("m", &c);
        let mut reqs = requests_with_kv(1);
        let mut id_gen = 0;
        let prog = StageProgram::new(
            &model,
            BatchedRequest::new(vec![0]),
            StagePlatform::Pim,
            Stage::C,
            SubBatchMode::ThreeWay,
            &c,
            &mut reqs,
            &mut id_gen,
        );
        assert_eq!(prog.num_ops(), 1);
        assert!(prog.front_executable().is_some());
    }
}
