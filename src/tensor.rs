/// Shape-only tensors of one stage program.
///
/// Tensors carry no data, only dims and graph links. They live in a flat
/// table owned by their program and are addressed by index, so producer and
/// consumer operations share them without reference counting.

/// Index into a program's tensor table.
pub type TensorId = usize;

#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub name: String,
    pub dims: Vec<u32>,
    /// Leaves (activations entering the stage, weights, KV caches) start
    /// produced; operation outputs become produced when the producer
    /// finishes.
    pub produced: bool,
    /// Producing operation (index into the program's op list), if internal
    pub producer: Option<usize>,
    /// Consuming operations (indices into the program's op list)
    pub consumers: Vec<usize>,
}

/// Flat tensor storage for one stage program.
#[derive(Debug, Default)]
pub struct TensorTable {
    tensors: Vec<TensorMeta>,
}

impl TensorTable {
    pub fn new() -> Self {
        TensorTable::default()
    }

    /// Register an externally-produced leaf (input activation, weight, KV).
    pub fn leaf(&mut self, name: impl Into<String>, dims: Vec<u32>) -> TensorId {
        self.push(name, dims, true, None)
    }

    /// Register the output of operation `producer`; unproduced until the
    /// operation finishes.
    pub fn output(&mut self, name: impl Into<String>, dims: Vec<u32>, producer: usize) -> TensorId {
        self.push(name, dims, false, Some(producer))
    }

    fn push(
        &mut self,
        name: impl Into<String>,
        dims: Vec<u32>,
        produced: bool,
        producer: Option<usize>,
    ) -> TensorId {
        self.tensors.push(TensorMeta {
            name: name.into(),
            dims,
            produced,
            producer,
            consumers: Vec::new(),
        });
        self.tensors.len() - 1
    }

    pub fn get(&self, id: TensorId) -> &TensorMeta {
        &self.tensors[id]
    }

    pub fn get_mut(&mut self, id: TensorId) -> &mut TensorMeta {
        &mut self.tensors[id]
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_start_produced_outputs_do_not() {
        let mut t = TensorTable::new();
        let leaf = t.leaf("input", vec![4, 4096]);
        let out = t.output("proj_out", vec![4, 4096], 0);
        assert!(t.get(leaf).produced);
        assert!(!t.get(out).produced);
        assert_eq!(t.get(out).producer, Some(0));
    }
}
