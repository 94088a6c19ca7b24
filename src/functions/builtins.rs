use super::reducers;
use super::registry::*;
use crate::compute::kernel::{self, BinaryOp};
use crate::store::{option_number, CallOptions};
use ndarray::ArrayViewD;
use std::sync::Arc;

fn binary_map(op: BinaryOp) -> Kernel {
    Kernel::Map(Arc::new(move |xs: &[ArrayViewD<f64>], _: &CallOptions| kernel::binary(op, &xs[0], &xs[1])))
}

fn unary_map(f: fn(f64) -> f64) -> Kernel {
    Kernel::Map(Arc::new(move |xs: &[ArrayViewD<f64>], _: &CallOptions| Ok(kernel::unary(&xs[0], f))))
}

fn reduction(name: &str, factory: AccumulatorFactory) -> FunctionSpec {
    FunctionSpec::new(
        name,
        vec![Param::array("x"), Param::text("dim")],
        ShapeRule::Reduce,
        UnitRule::Preserve,
        Kernel::Reduce(factory),
    )
}

impl FunctionRegistry {
    /// Registry preloaded with the arithmetic operators and the standard
    /// math, conversion, reduction and scan functions.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        let x = || vec![Param::array("x")];
        let xy = || vec![Param::array("x"), Param::array("y")];

        reg.register(FunctionSpec::new("+", xy(), ShapeRule::Broadcast, UnitRule::Same, binary_map(BinaryOp::Add)));
        reg.register(FunctionSpec::new("-", xy(), ShapeRule::Broadcast, UnitRule::Same, binary_map(BinaryOp::Sub)));
        reg.register(FunctionSpec::new("*", xy(), ShapeRule::Broadcast, UnitRule::Product, binary_map(BinaryOp::Mul)));
        reg.register(FunctionSpec::new("/", xy(), ShapeRule::Broadcast, UnitRule::Quotient, binary_map(BinaryOp::Div)));
        reg.register(FunctionSpec::new("+", x(), ShapeRule::PassThrough, UnitRule::Preserve, unary_map(|v| v)));
        reg.register(FunctionSpec::new("-", x(), ShapeRule::PassThrough, UnitRule::Preserve, unary_map(|v| -v)));

        let power: MapFn = Arc::new(|xs: &[ArrayViewD<f64>], opts: &CallOptions| {
            let e = option_number(opts, "exponent").ok_or("missing exponent")?;
            Ok(kernel::unary(&xs[0], |v| v.powf(e)))
        });
        reg.register(FunctionSpec::new(
            "^",
            vec![Param::array("x"), Param::number("exponent")],
            ShapeRule::PassThrough,
            UnitRule::Power,
            Kernel::Map(power),
        ));

        reg.register(FunctionSpec::new("sqrt", x(), ShapeRule::PassThrough, UnitRule::Root(2), unary_map(f64::sqrt)));
        reg.register(FunctionSpec::new("abs", x(), ShapeRule::PassThrough, UnitRule::Preserve, unary_map(f64::abs)));
        reg.register(FunctionSpec::new("exp", x(), ShapeRule::PassThrough, UnitRule::Dimensionless, unary_map(f64::exp)));
        reg.register(FunctionSpec::new("log", x(), ShapeRule::PassThrough, UnitRule::Dimensionless, unary_map(f64::ln)));

        reg.register(FunctionSpec::new(
            "convert",
            vec![Param::array("x"), Param::text("units")],
            ShapeRule::PassThrough,
            UnitRule::Convert,
            Kernel::Convert,
        ));

        reg.register(reduction("mean", reducers::mean));
        reg.register(reduction("average", reducers::mean));
        reg.register(reduction("sum", reducers::sum));
        reg.register(reduction("min", reducers::min));
        reg.register(reduction("max", reducers::max));
        reg.register(reduction("median", reducers::median).non_associative());

        reg.register(FunctionSpec::new(
            "cumsum",
            vec![Param::array("x"), Param::text("dim")],
            ShapeRule::Scan,
            UnitRule::Preserve,
            Kernel::Scan(reducers::cumsum),
        ));

        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, ArrayD};

    fn map(reg: &FunctionRegistry, name: &str, arity: usize) -> MapFn {
        match &reg.get(name, arity).unwrap().kernel {
            Kernel::Map(f) => f.clone(),
            other => panic!("{} is {:?}", name, other),
        }
    }

    #[test]
    fn test_operator_kernels() {
        let reg = FunctionRegistry::with_builtins();
        let a: ArrayD<f64> = arr1(&[1.0, 4.0, 9.0]).into_dyn();
        let b: ArrayD<f64> = arr1(&[2.0, 2.0, 3.0]).into_dyn();

        let sub = map(&reg, "-", 2)(&[a.view(), b.view()], &vec![]).unwrap();
        assert_eq!(sub.as_slice().unwrap(), &[-1.0, 2.0, 6.0]);
        let neg = map(&reg, "-", 1)(&[a.view()], &vec![]).unwrap();
        assert_eq!(neg.as_slice().unwrap(), &[-1.0, -4.0, -9.0]);
        let root = map(&reg, "sqrt", 1)(&[a.view()], &vec![]).unwrap();
        assert_eq!(root.as_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_power_reads_exponent_option() {
        use crate::store::{Literal, OptionValue};
        let reg = FunctionRegistry::with_builtins();
        let a: ArrayD<f64> = arr1(&[2.0, 3.0]).into_dyn();
        let opts = vec![("exponent".to_string(), OptionValue::Number(Literal(2.0)))];
        let sq = map(&reg, "^", 1)(&[a.view()], &opts).unwrap();
        assert_eq!(sq.as_slice().unwrap(), &[4.0, 9.0]);
    }

    #[test]
    fn test_only_median_is_non_associative() {
        let reg = FunctionRegistry::with_builtins();
        for name in ["mean", "average", "sum", "min", "max"] {
            assert!(reg.get(name, 1).unwrap().chunk_associative, "{}", name);
        }
        assert!(!reg.get("median", 1).unwrap().chunk_associative);
    }
}
