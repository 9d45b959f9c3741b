/// Inference requests and their cached K/V tensors.
///
/// A request decodes one token per traversal of the stage schedule until
/// `generated` reaches `output_size`. Its K/V tensors live on one DRAM
/// channel for the request's whole lifetime; operations that consume them
/// register on a per-step child list that is severed again at the end of
/// every decode step.
use std::collections::HashMap;

/// Whether a cached tensor holds keys or values (the two use different page
/// layouts on PIM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvKind {
    Key,
    Value,
}

/// Shape-only KV-cache tensor pinned to a DRAM channel.
#[derive(Debug, Clone)]
pub struct KvTensor {
    pub name: String,
    pub kind: KvKind,
    /// K: [nh, dk, seq] / V: [nh, seq, dk]
    pub dims: Vec<u32>,
    pub channel: u32,
    /// Operation ids consuming this tensor in the current decode step.
    /// Cleared when the step's sub-batches are drained.
    pub children: Vec<u32>,
}

impl KvTensor {
    pub fn new(name: String, kind: KvKind, dims: Vec<u32>, channel: u32) -> Self {
        KvTensor {
            name,
            kind,
            dims,
            channel,
            children: Vec::new(),
        }
    }

    pub fn clear_children(&mut self) {
        self.children.clear();
    }
}

/// One inference request.
#[derive(Debug, Clone)]
pub struct InferRequest {
    pub id: u32,
    /// Prompt length, the sequence length the KV cache is sized for
    pub input_size: u32,
    /// Tokens to decode before the request completes
    pub output_size: u32,
    /// Tokens decoded so far
    pub generated: u32,
    /// Sticky: set when the request is admitted onto a channel
    pub is_initiated: bool,
    /// Channel the KV cache lives on; `None` until admission succeeds
    pub channel: Option<u32>,
    /// PIM tiles consumed at admission, returned on completion
    pub kv_tiles: u32,
    /// Cached key tensors, one per layer (layer 0 only in this model)
    pub k_cache: Vec<KvTensor>,
    pub v_cache: Vec<KvTensor>,
}

impl InferRequest {
    pub fn new(id: u32, input_size: u32, output_size: u32) -> Self {
        InferRequest {
            id,
            input_size,
            output_size,
            generated: 0,
            is_initiated: false,
            channel: None,
            kv_tiles: 0,
            k_cache: Vec::new(),
            v_cache: Vec::new(),
        }
    }

    /// Query length for the next stage program. Decode serves one token at a
    /// time once the request is on a channel.
    pub fn q_len(&self) -> u32 {
        if self.is_initiated {
            1
        } else {
            self.input_size
        }
    }

    pub fn is_done(&self) -> bool {
        self.generated == self.output_size
    }
}

/// An ordered slice of the active request set: what one platform works on
/// during one stage.
#[derive(Debug, Clone, Default)]
pub struct BatchedRequest {
    pub reqs: Vec<u32>,
}

impl BatchedRequest {
    pub fn new(reqs: Vec<u32>) -> Self {
        BatchedRequest { reqs }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    /// Total activation rows this sub-batch contributes to a dense block.
    pub fn num_rows(&self, requests: &HashMap<u32, InferRequest>) -> u32 {
        self.reqs.iter().map(|id| requests[id].q_len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q_len_collapses_after_initiation() {
        let mut req = InferRequest::new(0, 128, 4);
        assert_eq!(req.q_len(), 128);
        req.is_initiated = true;
        assert_eq!(req.q_len(), 1);
    }

    #[test]
    fn num_rows_sums_query_lengths() {
        let mut reqs = HashMap::new();
        for id in 0..3 {
            let mut r = InferRequest::new(id, 16, 1);
            r.is_initiated = true;
            reqs.insert(id, r);
        }
        let breq = BatchedRequest::new(vec![0, 1, 2]);
        assert_eq!(breq.num_rows(&reqs), 3);
    }
}
