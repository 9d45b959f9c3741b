/// KV-cache tile allocation onto PIM channels.
///
/// Each DRAM channel owns a fixed budget of PIM tiles (page x banks). A
/// request's K and V caches are paged onto one channel; the allocator either
/// balances channels by their estimated attention latency or walks them
/// round-robin. Channel-resident request lists and accumulated latency live
/// here too, since the partitioner and the balancer both read them.
use tracing::{debug, info};

use crate::config::{DerivedParams, SimConfig};
use crate::error::SimError;

pub struct TileAllocator {
    channels: u32,
    load_balancing: bool,
    next_ch: u32,
    d: DerivedParams,
    /// Tiles distributed per channel at startup (floor division; the
    /// remainder of total_tiles stays unassigned)
    distributed: u64,
    total_available: u64,
    available_tiles: Vec<u64>,
    /// Request ids resident on each channel, in admission order
    active_requests: Vec<Vec<u32>>,
    /// Estimated attention latency summed over each channel's residents
    accum_latency: Vec<u64>,
}

impl TileAllocator {
    pub fn new(cfg: &SimConfig, d: &DerivedParams) -> Self {
        let channels = cfg.dram_channels;
        let distributed = channels as u64 * d.tiles_per_channel as u64;
        info!(
            total_tiles = d.total_tiles,
            tiles_per_channel = d.tiles_per_channel,
            "PIM tile pool initialized"
        );
        TileAllocator {
            channels,
            load_balancing: cfg.ch_load_balancing,
            next_ch: 0,
            d: d.clone(),
            distributed,
            total_available: distributed,
            available_tiles: vec![d.tiles_per_channel as u64; channels as usize],
            active_requests: vec![Vec::new(); channels as usize],
            accum_latency: vec![0; channels as usize],
        }
    }

    /// Tiles needed to cache `seq_len` tokens of K and V.
    pub fn kv_tile_need(&self, seq_len: u32) -> u32 {
        let key_pages = seq_len.div_ceil(self.d.key_period);
        let value_pages = seq_len.div_ceil(self.d.value_period);
        key_pages * self.d.key_page_size + value_pages * self.d.value_page_size
    }

    /// Place a request on a channel and reserve its KV tiles. Returns the
    /// channel and the tile count reserved. `Err(NoCapacity)` leaves all
    /// state untouched; the caller retries the request on a later pass.
    pub fn allocate(&mut self, req_id: u32, seq_len: u32) -> Result<(u32, u32), SimError> {
        let need = self.kv_tile_need(seq_len);

        let ch = if self.load_balancing {
            // Greedy: the laziest channel (min accumulated latency) that fits.
            let mut pick: Option<u32> = None;
            let mut min_latency = u64::MAX;
            for ch in 0..self.channels {
                if self.available_tiles[ch as usize] < need as u64 {
                    continue;
                }
                if self.accum_latency[ch as usize] < min_latency {
                    min_latency = self.accum_latency[ch as usize];
                    pick = Some(ch);
                }
            }
            pick
        } else {
            // Round-robin probe, at most one full lap.
            let mut pick = None;
            for _ in 0..self.channels {
                let ch = self.next_ch % self.channels;
                self.next_ch += 1;
                if self.available_tiles[ch as usize] >= need as u64 {
                    pick = Some(ch);
                    break;
                }
            }
            pick
        };

        let Some(ch) = ch else {
            info!(req_id, seq_len, need, "no available tiles for request");
            return Err(SimError::NoCapacity {
                seq_len,
                need,
                available: self.total_available.min(u32::MAX as u64) as u32,
            });
        };

        self.available_tiles[ch as usize] -= need as u64;
        self.total_available -= need as u64;
        self.active_requests[ch as usize].push(req_id);
        let latency = self.estimate_mha_latency(seq_len);
        self.accum_latency[ch as usize] += latency;
        debug!(req_id, seq_len, ch, need, latency, "request placed");
        Ok((ch, need))
    }

    /// Return a completed request's tiles and latency share to its channel.
    pub fn release(&mut self, req_id: u32, ch: u32, tiles: u32, seq_len: u32) {
        self.available_tiles[ch as usize] += tiles as u64;
        self.total_available += tiles as u64;
        self.accum_latency[ch as usize] = self.accum_latency[ch as usize]
            .saturating_sub(self.estimate_mha_latency(seq_len));
        self.active_requests[ch as usize].retain(|&id| id != req_id);
    }

    /// Estimated PIM attention latency for one request, in cycle units. Two
    /// GEMV sweeps: key x query, then logit x value.
    pub fn estimate_mha_latency(&self, seq_len: u32) -> u64 {
        let d = &self.d;
        let gwrite = d.gwrite_latency as u64;
        let gemv = d.gemv_latency as u64;

        let chunks_k = d.effective_e.div_ceil(d.page_size_elems) as u64;
        let tiles_k = seq_len.div_ceil(self.d.key_period) as u64;
        let chunks_v = (seq_len.div_ceil(d.page_size_elems) * d.nh) as u64;
        let tiles_v = d.dk.div_ceil(self.d.key_period) as u64;

        (chunks_k + chunks_v) * gwrite + (chunks_k * tiles_k + chunks_v * tiles_v) * gemv
    }

    pub fn request_queues(&self) -> &[Vec<u32>] {
        &self.active_requests
    }

    pub fn available_tiles(&self, ch: u32) -> u64 {
        self.available_tiles[ch as usize]
    }

    pub fn accum_latency(&self, ch: u32) -> u64 {
        self.accum_latency[ch as usize]
    }

    pub fn total_available(&self) -> u64 {
        self.total_available
    }

    /// Tiles handed out to channels at startup; the conserved quantity of
    /// the pool invariant.
    pub fn distributed_tiles(&self) -> u64 {
        self.distributed
    }

    pub fn num_channels(&self) -> u32 {
        self.channels
    }
}
