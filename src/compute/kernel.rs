use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};
use wide::f64x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline(always)]
    fn scalar(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    #[inline(always)]
    fn lanes(self, a: f64x4, b: f64x4) -> f64x4 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// Elementwise binary op over two arrays of identical shape.
///
/// Contiguous operands take the `f64x4` path; anything else (broadcast or
/// transposed views) goes through `Zip`. Both produce identical bits since
/// each lane is the same IEEE operation.
pub fn binary(op: BinaryOp, a: &ArrayViewD<f64>, b: &ArrayViewD<f64>) -> Result<ArrayD<f64>, String> {
    if a.shape() != b.shape() {
        return Err(format!("shape mismatch {:?} vs {:?}", a.shape(), b.shape()));
    }
    if let (Some(sa), Some(sb)) = (a.as_slice(), b.as_slice()) {
        let data = simd_binary(op, sa, sb);
        return ArrayD::from_shape_vec(IxDyn(a.shape()), data).map_err(|e| e.to_string());
    }
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| op.scalar(x, y)))
}

fn simd_binary(op: BinaryOp, a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(a.len());
    let mut ca = a.chunks_exact(4);
    let mut cb = b.chunks_exact(4);
    for (x, y) in (&mut ca).zip(&mut cb) {
        let vx = f64x4::from([x[0], x[1], x[2], x[3]]);
        let vy = f64x4::from([y[0], y[1], y[2], y[3]]);
        out.extend_from_slice(&op.lanes(vx, vy).to_array());
    }
    for (&x, &y) in ca.remainder().iter().zip(cb.remainder()) {
        out.push(op.scalar(x, y));
    }
    out
}

pub fn unary(a: &ArrayViewD<f64>, f: impl Fn(f64) -> f64) -> ArrayD<f64> {
    a.mapv(f)
}
