//! Shape and unit inference for a single function call.
use crate::analysis::units::{units_equal, ParsedUnit};
use crate::error::ConformError;
use crate::functions::{ShapeRule, UnitRule};
use crate::store::{option_number, option_text, CallOptions, Dimension, DimensionSignature, Unit};
use smallvec::SmallVec;

/// What the checker knows about one array operand.
pub struct OperandInfo<'a> {
    pub dims: &'a DimensionSignature,
    pub unit: &'a Unit,
    /// Literal constants are unitless and adapt to their siblings.
    pub is_literal: bool,
}

pub fn infer_dims(
    rule: ShapeRule,
    function: &str,
    operands: &[OperandInfo],
    options: &CallOptions,
) -> Result<DimensionSignature, ConformError> {
    match rule {
        ShapeRule::PassThrough => Ok(operands.first().map(|o| o.dims.clone()).unwrap_or_default()),
        ShapeRule::Broadcast => {
            let mut out: SmallVec<[Dimension; 4]> = SmallVec::new();
            for op in operands {
                for dim in op.dims.iter() {
                    match out.iter_mut().find(|d| d.name == dim.name) {
                        Some(existing) => match (existing.len, dim.len) {
                            (Some(a), Some(b)) if a != b => {
                                return Err(ConformError::incompatible(
                                    function,
                                    format!("dimension '{}' has lengths {} and {}", dim.name, a, b),
                                ))
                            }
                            (None, Some(b)) => existing.len = Some(b),
                            _ => {}
                        },
                        None => out.push(dim.clone()),
                    }
                }
            }
            Ok(DimensionSignature(out))
        }
        ShapeRule::Reduce | ShapeRule::Scan => {
            let dim = option_text(options, "dim")
                .ok_or_else(|| ConformError::incompatible(function, "missing 'dim' option"))?;
            let input = operands.first().map(|o| o.dims.clone()).unwrap_or_default();
            if !input.contains(dim) {
                return Err(ConformError::incompatible(
                    function,
                    format!("operand has no dimension '{}' (dimensions {})", dim, input),
                ));
            }
            Ok(if rule == ShapeRule::Reduce { input.without(dim) } else { input })
        }
    }
}

/// Output unit of a call plus, for unit-preserving operations, the operands
/// that must first be converted (by position) to that unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit: Unit,
    pub conversions: Vec<(usize, Unit)>,
}

impl UnitOutcome {
    fn plain(unit: Unit) -> Self { Self { unit, conversions: Vec::new() } }
}

fn parse(function: &str, unit: &Unit) -> Result<ParsedUnit, ConformError> {
    ParsedUnit::from_str(unit.as_str())
        .map_err(|e| ConformError::incompatible(function, format!("unit '{}': {}", unit, e)))
}

fn parsed_or_one(function: &str, op: &OperandInfo) -> Result<ParsedUnit, ConformError> {
    if op.is_literal { Ok(ParsedUnit::default()) } else { parse(function, op.unit) }
}

pub fn infer_unit(
    rule: UnitRule,
    function: &str,
    operands: &[OperandInfo],
    options: &CallOptions,
    convertible: impl Fn(&Unit, &Unit) -> bool,
) -> Result<UnitOutcome, ConformError> {
    match rule {
        UnitRule::Preserve => Ok(UnitOutcome::plain(
            operands.first().map(|o| o.unit.clone()).unwrap_or_else(Unit::dimensionless),
        )),
        UnitRule::Same => {
            let Some(reference) = operands.iter().find(|o| !o.is_literal).map(|o| o.unit.clone()) else {
                return Ok(UnitOutcome::plain(Unit::dimensionless()));
            };
            let mut conversions = Vec::new();
            for (i, op) in operands.iter().enumerate() {
                if op.is_literal || units_equal(op.unit, &reference) {
                    continue;
                }
                if !convertible(op.unit, &reference) {
                    return Err(ConformError::incompatible(
                        function,
                        format!("units '{}' and '{}' are not convertible", reference, op.unit),
                    ));
                }
                conversions.push((i, reference.clone()));
            }
            Ok(UnitOutcome { unit: reference, conversions })
        }
        UnitRule::Product | UnitRule::Quotient => {
            let mut acc = ParsedUnit::default();
            for (i, op) in operands.iter().enumerate() {
                let u = parsed_or_one(function, op)?;
                if i > 0 && rule == UnitRule::Quotient { acc.divide(&u) } else { acc.multiply(&u) }
            }
            Ok(UnitOutcome::plain(acc.to_unit()))
        }
        UnitRule::Power => {
            let exponent = option_number(options, "exponent")
                .ok_or_else(|| ConformError::incompatible(function, "missing exponent"))?;
            let base = match operands.first() {
                Some(op) => parsed_or_one(function, op)?,
                None => ParsedUnit::default(),
            };
            if base.is_dimensionless() {
                return Ok(UnitOutcome::plain(Unit::dimensionless()));
            }
            if exponent.fract() == 0.0 {
                return Ok(UnitOutcome::plain(base.pow(exponent as i32).to_unit()));
            }
            let inverse = 1.0 / exponent;
            if inverse.fract() == 0.0 {
                if let Some(root) = base.root(inverse as i32) {
                    return Ok(UnitOutcome::plain(root.to_unit()));
                }
            }
            Err(ConformError::incompatible(
                function,
                format!("cannot raise unit '{}' to non-integer power {}", base, exponent),
            ))
        }
        UnitRule::Root(n) => {
            let base = match operands.first() {
                Some(op) => parsed_or_one(function, op)?,
                None => ParsedUnit::default(),
            };
            base.root(n).map(|r| UnitOutcome::plain(r.to_unit())).ok_or_else(|| {
                ConformError::incompatible(function, format!("unit '{}' has no integer root of order {}", base, n))
            })
        }
        UnitRule::Dimensionless => {
            for op in operands {
                if !parsed_or_one(function, op)?.is_dimensionless() {
                    return Err(ConformError::incompatible(
                        function,
                        format!("operand must be dimensionless, found '{}'", op.unit),
                    ));
                }
            }
            Ok(UnitOutcome::plain(Unit::dimensionless()))
        }
        UnitRule::Convert => {
            let target = option_text(options, "units")
                .ok_or_else(|| ConformError::incompatible(function, "missing 'units' option"))?;
            Ok(UnitOutcome::plain(Unit::new(target)))
        }
    }
}
