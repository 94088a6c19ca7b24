pub mod builtins;
pub mod reducers;
pub mod registry;

pub use registry::{
    Accumulator, AccumulatorFactory, BoundCall, FunctionRegistry, FunctionSpec, Kernel, MapFn, Param, ParamKind,
    ScanFactory, ScanState, ShapeRule, UnitRule,
};
