/// Shape-only model parameter provider.
///
/// The simulator never touches weight values; programs only need the shapes
/// of the matrices a block multiplies against so tile streams come out the
/// right size. Weights are sharded Megatron-style across `n_tp` workers:
/// QKV and FC1 split their output column, Proj and FC2 their input row.
use crate::config::SimConfig;
use crate::operation::MatMulKind;

#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    n_embd: u32,
    n_tp: u32,
}

impl Model {
    pub fn new(name: impl Into<String>, cfg: &SimConfig) -> Self {
        Model {
            name: name.into(),
            n_embd: cfg.model_n_embd,
            n_tp: cfg.n_tp,
        }
    }

    /// Weight shape for a dense matmul of layer `_layer` (all layers share
    /// dimensions; only layer 0 is ever materialized).
    pub fn weight_dims(&self, _layer: u32, kind: MatMulKind) -> Vec<u32> {
        let e = self.n_embd;
        let tp = self.n_tp;
        match kind {
            MatMulKind::QkvGen => vec![e, 3 * e / tp],
            MatMulKind::Proj => vec![e / tp, e],
            MatMulKind::Fc1 => vec![e, 4 * e / tp],
            MatMulKind::Fc2 => vec![4 * e / tp, e],
        }
    }

    /// LayerNorm gain/bias vectors.
    pub fn norm_dims(&self, _layer: u32) -> Vec<u32> {
        vec![self.n_embd]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::SubBatchMode;

    #[test]
    fn weights_shard_across_workers() {
        let cfg = SimConfig {
            n_tp: 2,
            sub_batch_mode: SubBatchMode::ThreeWay,
            ..SimConfig::gpt3_7b()
        };
        let model = Model::new("gpt3-7b", &cfg);
        assert_eq!(model.weight_dims(0, MatMulKind::QkvGen), vec![4096, 6144]);
        assert_eq!(model.weight_dims(0, MatMulKind::Proj), vec![2048, 4096]);
        assert_eq!(model.weight_dims(0, MatMulKind::Fc1), vec![4096, 8192]);
        assert_eq!(model.weight_dims(0, MatMulKind::Fc2), vec![8192, 4096]);
    }
}
