use crate::error::ConformError;
use crate::parse::Expr;
use crate::store::{CallOptions, Literal, OptionValue};
use ndarray::{ArrayD, ArrayViewD};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// An array-valued subexpression (numeric literals are allowed).
    Array,
    /// A static string option such as `dim='time'`.
    Text,
    /// A static numeric option such as an exponent.
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl Param {
    pub const fn array(name: &'static str) -> Self { Self { name, kind: ParamKind::Array, required: true } }
    pub const fn text(name: &'static str) -> Self { Self { name, kind: ParamKind::Text, required: true } }
    pub const fn number(name: &'static str) -> Self { Self { name, kind: ParamKind::Number, required: true } }
    pub const fn optional(self) -> Self { Self { required: false, ..self } }
}

/// How the output dimensions follow from the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    /// Output has the dimensions of the single array operand.
    PassThrough,
    /// Operands are aligned by dimension name; output is their union.
    Broadcast,
    /// Removes the dimension named by the `dim` option.
    Reduce,
    /// Keeps the shape but carries state along the `dim` option.
    Scan,
}

/// How the output unit follows from the operand units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRule {
    /// All operands must share (or be converted to) the first operand's unit.
    Same,
    Product,
    Quotient,
    /// Unit raised to the `exponent` option.
    Power,
    Root(i32),
    /// Operand must be dimensionless; output is dimensionless.
    Dimensionless,
    /// Output unit is the operand unit; no constraint.
    Preserve,
    /// Output unit is the `units` option.
    Convert,
}

pub type MapFn = Arc<dyn Fn(&[ArrayViewD<f64>], &CallOptions) -> Result<ArrayD<f64>, String> + Send + Sync>;

/// Running state of a reduction along one axis, fed chunk by chunk.
pub trait Accumulator: Send {
    fn update(&mut self, chunk: ArrayViewD<f64>, axis: usize);
    fn finish(self: Box<Self>) -> Result<ArrayD<f64>, String>;
}

/// Running state of a cumulative scan along one axis.
pub trait ScanState: Send {
    fn step(&mut self, chunk: ArrayViewD<f64>, axis: usize) -> ArrayD<f64>;
}

pub type AccumulatorFactory = fn() -> Box<dyn Accumulator>;
pub type ScanFactory = fn() -> Box<dyn ScanState>;

#[derive(Clone)]
pub enum Kernel {
    /// Elementwise over operands already broadcast to the output shape.
    Map(MapFn),
    Reduce(AccumulatorFactory),
    Scan(ScanFactory),
    /// Replaced by an explicit unit conversion node during resolution.
    Convert,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Map(_) => write!(f, "Map"),
            Kernel::Reduce(_) => write!(f, "Reduce"),
            Kernel::Scan(_) => write!(f, "Scan"),
            Kernel::Convert => write!(f, "Convert"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub params: Vec<Param>,
    pub shape: ShapeRule,
    pub unit: UnitRule,
    pub kernel: Kernel,
    /// Whether partial results over chunks of the reduced dimension can be
    /// combined without seeing the whole dimension at once.
    pub chunk_associative: bool,
}

impl FunctionSpec {
    pub fn new(name: &str, params: Vec<Param>, shape: ShapeRule, unit: UnitRule, kernel: Kernel) -> Self {
        Self { name: name.to_string(), params, shape, unit, kernel, chunk_associative: true }
    }

    pub fn non_associative(mut self) -> Self {
        self.chunk_associative = false;
        self
    }

    pub fn array_arity(&self) -> usize {
        self.params.iter().filter(|p| p.kind == ParamKind::Array).count()
    }
}

/// A call matched against one overload: array operands in parameter order
/// plus the static options.
#[derive(Debug)]
pub struct BoundCall<'r, 'e> {
    pub spec: &'r FunctionSpec,
    pub arrays: Vec<&'e Expr>,
    pub options: CallOptions,
}

enum BindFailure {
    Arity,
    Kind(String),
}

/// Named functions and operators, possibly overloaded by arity.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Vec<FunctionSpec>>,
}

impl FunctionRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, spec: FunctionSpec) {
        self.functions.entry(spec.name.clone()).or_default().push(spec);
    }

    pub fn contains(&self, name: &str) -> bool { self.functions.contains_key(name) }

    pub fn overloads(&self, name: &str) -> &[FunctionSpec] {
        self.functions.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The overload of `name` taking `arity` array operands.
    pub fn get(&self, name: &str, arity: usize) -> Option<&FunctionSpec> {
        self.overloads(name).iter().find(|s| s.array_arity() == arity)
    }

    /// Picks the first overload the arguments bind to.
    pub fn bind<'r, 'e>(
        &'r self,
        name: &str,
        args: &'e [Expr],
        kwargs: &'e [(String, Expr)],
    ) -> Result<BoundCall<'r, 'e>, ConformError> {
        let mut kind_error = None;
        for spec in self.overloads(name) {
            match bind_one(spec, args, kwargs) {
                Ok(bound) => return Ok(bound),
                Err(BindFailure::Kind(reason)) => {
                    kind_error.get_or_insert(reason);
                }
                Err(BindFailure::Arity) => {}
            }
        }
        Err(match kind_error {
            Some(reason) => ConformError::incompatible(name, reason),
            None => ConformError::UnknownFunction { name: name.to_string(), arity: args.len() + kwargs.len() },
        })
    }
}

fn bind_one<'r, 'e>(
    spec: &'r FunctionSpec,
    args: &'e [Expr],
    kwargs: &'e [(String, Expr)],
) -> Result<BoundCall<'r, 'e>, BindFailure> {
    if args.len() > spec.params.len() {
        return Err(BindFailure::Arity);
    }
    let mut slots: Vec<Option<&'e Expr>> = vec![None; spec.params.len()];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Some(arg);
    }
    for (key, value) in kwargs {
        let idx = spec.params.iter().position(|p| p.name == key).ok_or(BindFailure::Arity)?;
        if slots[idx].replace(value).is_some() {
            return Err(BindFailure::Arity);
        }
    }

    let mut arrays = Vec::new();
    let mut options = CallOptions::new();
    for (param, slot) in spec.params.iter().zip(slots) {
        let Some(expr) = slot else {
            if param.required {
                return Err(BindFailure::Arity);
            }
            continue;
        };
        match (param.kind, expr) {
            (ParamKind::Array, Expr::Text(_)) => {
                return Err(BindFailure::Kind(format!("argument '{}' must be an array expression", param.name)))
            }
            (ParamKind::Array, e) => arrays.push(e),
            (ParamKind::Text, Expr::Text(s)) => options.push((param.name.to_string(), OptionValue::Text(s.clone()))),
            (ParamKind::Number, Expr::Number(n)) => {
                options.push((param.name.to_string(), OptionValue::Number(Literal(*n))))
            }
            (ParamKind::Text, _) => {
                return Err(BindFailure::Kind(format!("argument '{}' must be a string literal", param.name)))
            }
            (ParamKind::Number, _) => {
                return Err(BindFailure::Kind(format!("argument '{}' must be a numeric literal", param.name)))
            }
        }
    }

    Ok(BoundCall { spec, arrays, options })
}
