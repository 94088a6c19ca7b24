use crate::store::NodeId;
use ndarray::ArrayD;

/// Values live for one chunk of one pass.
///
/// Each slot carries the number of outstanding uses; the value is dropped
/// as soon as its last consumer has read it, so at most the working set of
/// the current step frontier is resident.
#[derive(Debug, Clone, Default)]
pub struct ChunkLedger {
    values: Vec<Option<ArrayD<f64>>>,
    remaining: Vec<usize>,
    live: usize,
    peak: usize,
}

impl ChunkLedger {
    /// `uses[i]` is how many times node `i` will be read (or taken) in this chunk.
    pub fn new(uses: &[usize]) -> Self {
        Self { values: vec![None; uses.len()], remaining: uses.to_vec(), live: 0, peak: 0 }
    }

    pub fn get(&self, node_id: NodeId) -> Option<&ArrayD<f64>> {
        self.values.get(node_id.index())?.as_ref()
    }

    pub fn insert(&mut self, node_id: NodeId, value: ArrayD<f64>) {
        let idx = node_id.index();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, None);
            self.remaining.resize(idx + 1, 0);
        }
        if self.remaining[idx] == 0 {
            return;
        }
        if self.values[idx].replace(value).is_none() {
            self.live += 1;
            self.peak = self.peak.max(self.live);
        }
    }

    /// Marks one use of `node_id` as done; frees the value after the last one.
    pub fn release(&mut self, node_id: NodeId) {
        let idx = node_id.index();
        let Some(left) = self.remaining.get_mut(idx) else { return };
        *left = left.saturating_sub(1);
        if *left == 0 && self.values[idx].take().is_some() {
            self.live -= 1;
        }
    }

    /// Removes the value regardless of outstanding uses.
    pub fn take(&mut self, node_id: NodeId) -> Option<ArrayD<f64>> {
        let idx = node_id.index();
        let value = self.values.get_mut(idx)?.take();
        if value.is_some() {
            self.live -= 1;
            self.remaining[idx] = 0;
        }
        value
    }

    pub fn live(&self) -> usize { self.live }

    /// Largest number of simultaneously held values.
    pub fn peak(&self) -> usize { self.peak }
}
