/// Simulation configuration (memory geometry, model dimensions, scheduling
/// mode) plus the constants derived from it. A `SimConfig` is validated
/// once, turned into `DerivedParams` once, and then threaded by value through
/// the constructors that need it; nothing reads mutable global state.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::stage::SubBatchMode;

const GB: u64 = 1024 * 1024 * 1024;

/// Immutable simulation parameters. Loadable from JSON (`serde`) or built
/// from a preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of DRAM channels; each channel contributes 1 GB of capacity
    pub dram_channels: u32,
    /// DRAM page (row buffer) size in bytes
    pub dram_page_size_b: u32,
    /// Banks per DRAM channel
    pub dram_banks_per_ch: u32,
    /// Element width in bytes (2 = fp16)
    pub precision_bytes: u32,
    /// Attention heads of the served model
    pub model_n_head: u32,
    /// Embedding dimension of the served model
    pub model_n_embd: u32,
    /// Tensor-parallel degree; weights and heads are sharded across workers
    pub n_tp: u32,
    /// Total model parameters in billions (weight footprint on DRAM)
    pub model_params_b_total: u32,
    /// 2-way or 3-way sub-batch interleaving
    pub sub_batch_mode: SubBatchMode,
    /// Channel placement: load-balanced (greedy min-latency) vs round-robin
    pub ch_load_balancing: bool,
    /// Cap on concurrently active requests
    #[serde(default = "default_max_reqs")]
    pub max_active_reqs: u32,
    /// Cap on requests examined per admission pass
    #[serde(default = "default_max_reqs")]
    pub max_batch_size: u32,
    /// Where per-stage and per-operation stat files are written
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_max_reqs() -> u32 {
    1024
}

impl SimConfig {
    /// A GPT3-6.7B-class model on a 32-channel PIM-enabled HBM stack.
    pub fn gpt3_7b() -> Self {
        SimConfig {
            dram_channels: 32,
            dram_page_size_b: 512,
            dram_banks_per_ch: 16,
            precision_bytes: 2,
            model_n_head: 32,
            model_n_embd: 4096,
            n_tp: 1,
            model_params_b_total: 7,
            sub_batch_mode: SubBatchMode::TwoWay,
            ch_load_balancing: true,
            max_active_reqs: default_max_reqs(),
            max_batch_size: default_max_reqs(),
            log_dir: None,
        }
    }

    /// GPT3-13B-class model, tensor-parallel over 2 workers.
    pub fn gpt3_13b() -> Self {
        SimConfig {
            model_n_head: 40,
            model_n_embd: 5120,
            n_tp: 2,
            model_params_b_total: 13,
            ..Self::gpt3_7b()
        }
    }

    /// Check divisibility and capacity constraints before the simulation
    /// starts. All violations are rejected here so the core can assume a
    /// well-formed geometry.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.dram_channels == 0 {
            return Err(SimError::Config("dram_channels must be > 0".into()));
        }
        if self.dram_page_size_b == 0 || self.dram_banks_per_ch == 0 {
            return Err(SimError::Config("DRAM geometry must be non-zero".into()));
        }
        if self.precision_bytes == 0 || self.dram_page_size_b % self.precision_bytes != 0 {
            return Err(SimError::Config(
                "dram_page_size_b must be a multiple of precision_bytes".into(),
            ));
        }
        if self.n_tp == 0 || self.model_n_head % self.n_tp != 0 {
            return Err(SimError::Config(
                "model_n_head must be divisible by n_tp".into(),
            ));
        }
        if self.model_n_embd % self.model_n_head != 0 {
            return Err(SimError::Config(
                "model_n_embd must be divisible by model_n_head".into(),
            ));
        }
        let weight_gb = self.model_params_b_total as u64 * self.precision_bytes as u64
            / self.n_tp as u64;
        if weight_gb >= self.dram_channels as u64 {
            return Err(SimError::Config(format!(
                "model weights ({weight_gb} GB) leave no KV capacity on {} channels",
                self.dram_channels
            )));
        }
        Ok(())
    }

    /// Compute the derived constants once.
    pub fn derived(&self) -> DerivedParams {
        let nh = self.model_n_head / self.n_tp;
        let dk = self.model_n_embd / self.model_n_head;
        let effective_e = nh * dk;
        let page_size_elems = self.dram_page_size_b / self.precision_bytes;

        // KV capacity: whatever the model weights leave of the stacked DRAM,
        // carved into PIM tiles of one page per bank.
        let weight_gb = self.model_params_b_total as u64 * self.precision_bytes as u64
            / self.n_tp as u64;
        let kv_bytes = (self.dram_channels as u64 - weight_gb) * GB;
        let tile_bytes = self.dram_page_size_b as u64 * self.dram_banks_per_ch as u64;
        let total_tiles = kv_bytes / tile_bytes;
        let tiles_per_channel = (total_tiles / self.dram_channels as u64) as u32;

        DerivedParams {
            nh,
            dk,
            effective_e,
            page_size_elems,
            key_period: self.dram_banks_per_ch,
            value_period: page_size_elems,
            key_page_size: effective_e.div_ceil(page_size_elems),
            value_page_size: effective_e.div_ceil(self.dram_banks_per_ch),
            total_tiles,
            tiles_per_channel,
            gwrite_latency: 100,
            gemv_latency: 184,
        }
    }
}

/// Constants derived from `SimConfig`, computed once at startup.
#[derive(Debug, Clone)]
pub struct DerivedParams {
    /// Heads per tensor-parallel worker
    pub nh: u32,
    /// Per-head dimension
    pub dk: u32,
    /// nh * dk, the embedding slice one worker sees
    pub effective_e: u32,
    /// DRAM page size in elements
    pub page_size_elems: u32,
    /// Tokens per key page
    pub key_period: u32,
    /// Tokens per value page
    pub value_period: u32,
    /// PIM tiles composing one key page
    pub key_page_size: u32,
    /// PIM tiles composing one value page
    pub value_page_size: u32,
    /// KV-cache tiles across all channels
    pub total_tiles: u64,
    /// Tiles initially available on each channel (floor division; the
    /// remainder is never distributed)
    pub tiles_per_channel: u32,
    /// PIM GWRITE latency in cycles
    pub gwrite_latency: u32,
    /// PIM GEMV latency in cycles
    pub gemv_latency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> SimConfig {
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
    }

    #[test]
    fn derived_geometry() {
        let d = small_cfg().derived();
        assert_eq!(d.nh, 32);
        assert_eq!(d.dk, 128);
        assert_eq!(d.effective_e, 4096);
        assert_eq!(d.page_size_elems, 256);
        assert_eq!(d.key_period, 16);
        assert_eq!(d.value_period, 256);
        assert_eq!(d.key_page_size, 16);
        assert_eq!(d.value_page_size, 256);
        // 1 GB / (512 B * 16 banks)
        assert_eq!(d.total_tiles, (1 << 30) / (512 * 16));
        assert_eq!(d.tiles_per_channel as u64, d.total_tiles);
    }

    #[test]
    fn validate_rejects_bad_dims() {
        let mut cfg = small_cfg();
        cfg.n_tp = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = small_cfg();
        cfg.model_n_embd = 4095;
        assert!(cfg.validate().is_err());

        let mut cfg = small_cfg();
        cfg.dram_channels = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_model() {
        let mut cfg = small_cfg();
        cfg.model_params_b_total = 1; // 2 GB of weights on a 1 GB stack
        assert!(cfg.validate().is_err());
        assert!(small_cfg().validate().is_ok());
    }
}
