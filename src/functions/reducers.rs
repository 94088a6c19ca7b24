//! Chunk-fed reductions and scans.
//!
//! Every reducer folds lanes strictly in axis order, one lane at a time, so
//! feeding the same data in one piece or in any number of chunks produces
//! bit-identical results.
use super::registry::{Accumulator, ScanState};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};

fn fold_lanes(acc: &mut Option<ArrayD<f64>>, chunk: ArrayViewD<f64>, axis: usize, f: impl Fn(f64, f64) -> f64) -> usize {
    let mut n = 0;
    for lane in chunk.axis_iter(Axis(axis)) {
        match acc {
            Some(a) => a.zip_mut_with(&lane, |x, &y| *x = f(*x, y)),
            None => *acc = Some(lane.to_owned()),
        }
        n += 1;
    }
    n
}

fn empty() -> String {
    "reduction over an empty dimension".to_string()
}

#[derive(Default)]
pub struct SumAccumulator {
    acc: Option<ArrayD<f64>>,
}

impl Accumulator for SumAccumulator {
    fn update(&mut self, chunk: ArrayViewD<f64>, axis: usize) {
        fold_lanes(&mut self.acc, chunk, axis, |a, b| a + b);
    }

    fn finish(self: Box<Self>) -> Result<ArrayD<f64>, String> {
        self.acc.ok_or_else(empty)
    }
}

#[derive(Default)]
pub struct MeanAccumulator {
    sum: Option<ArrayD<f64>>,
    count: usize,
}

impl Accumulator for MeanAccumulator {
    fn update(&mut self, chunk: ArrayViewD<f64>, axis: usize) {
        self.count += fold_lanes(&mut self.sum, chunk, axis, |a, b| a + b);
    }

    fn finish(self: Box<Self>) -> Result<ArrayD<f64>, String> {
        let n = self.count as f64;
        self.sum.map(|s| s.mapv_into(|v| v / n)).ok_or_else(empty)
    }
}

pub struct ExtremumAccumulator {
    acc: Option<ArrayD<f64>>,
    pick: fn(f64, f64) -> f64,
}

// NaN wins, matching sum and mean.
fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
}

impl ExtremumAccumulator {
    pub fn min() -> Self { Self { acc: None, pick: nan_min } }
    pub fn max() -> Self { Self { acc: None, pick: nan_max } }
}

impl Accumulator for ExtremumAccumulator {
    fn update(&mut self, chunk: ArrayViewD<f64>, axis: usize) {
        fold_lanes(&mut self.acc, chunk, axis, self.pick);
    }

    fn finish(self: Box<Self>) -> Result<ArrayD<f64>, String> {
        self.acc.ok_or_else(empty)
    }
}

/// Needs every value along the axis at once, so it is not chunk-associative.
#[derive(Default)]
pub struct MedianAccumulator {
    shape: Option<Vec<usize>>,
    lanes: Vec<Vec<f64>>,
}

impl Accumulator for MedianAccumulator {
    fn update(&mut self, chunk: ArrayViewD<f64>, axis: usize) {
        for lane in chunk.axis_iter(Axis(axis)) {
            self.shape.get_or_insert_with(|| lane.shape().to_vec());
            self.lanes.push(lane.iter().copied().collect());
        }
    }

    fn finish(self: Box<Self>) -> Result<ArrayD<f64>, String> {
        let shape = self.shape.ok_or_else(empty)?;
        let mut out = ArrayD::zeros(IxDyn(&shape));
        let mut column = Vec::with_capacity(self.lanes.len());
        for (flat, slot) in out.iter_mut().enumerate() {
            column.clear();
            column.extend(self.lanes.iter().map(|l| l[flat]));
            column.sort_by(f64::total_cmp);
            let mid = column.len() / 2;
            *slot = if column.len() % 2 == 1 {
                column[mid]
            } else {
                (column[mid - 1] + column[mid]) / 2.0
            };
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct CumulativeSum {
    running: Option<ArrayD<f64>>,
}

impl ScanState for CumulativeSum {
    fn step(&mut self, chunk: ArrayViewD<f64>, axis: usize) -> ArrayD<f64> {
        let mut out = chunk.to_owned();
        for mut lane in out.axis_iter_mut(Axis(axis)) {
            match &mut self.running {
                Some(r) => {
                    Zip::from(&mut *r).and(&lane).for_each(|acc, &v| *acc += v);
                    lane.assign(&*r);
                }
                None => self.running = Some(lane.to_owned()),
            }
        }
        out
    }
}

pub fn sum() -> Box<dyn Accumulator> { Box::<SumAccumulator>::default() }
pub fn mean() -> Box<dyn Accumulator> { Box::<MeanAccumulator>::default() }
pub fn min() -> Box<dyn Accumulator> { Box::new(ExtremumAccumulator::min()) }
pub fn max() -> Box<dyn Accumulator> { Box::new(ExtremumAccumulator::max()) }
pub fn median() -> Box<dyn Accumulator> { Box::<MedianAccumulator>::default() }
pub fn cumsum() -> Box<dyn ScanState> { Box::<CumulativeSum>::default() }
