use crate::error::ConformError;
use crate::store::Unit;
use ndarray::{ArrayD, ArrayViewD};
use std::collections::BTreeMap;

/// A unit string broken into a numeric scale, base symbols and integer exponents.
///
/// Accepts UDUNITS/CF style ("kg m-2 s-1", "m s^-1", "m**2", "W.m-2",
/// "0.001 kg") and a single '/' for the denominator ("m/s", "kg/m^2/s" is
/// rejected).
#[derive(Debug, Clone)]
pub struct ParsedUnit {
    terms: BTreeMap<String, i32>,
    scale: f64,
}

impl Default for ParsedUnit {
    fn default() -> Self { Self { terms: BTreeMap::new(), scale: 1.0 } }
}

impl PartialEq for ParsedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.terms == other.terms && self.scale.to_bits() == other.scale.to_bits()
    }
}
impl Eq for ParsedUnit {}

impl ParsedUnit {
    pub fn from_str(s: &str) -> Result<Self, String> {
        if s.trim().is_empty() {
            return Err("empty unit".to_string());
        }

        let mut unit = Self::default();
        let mut parts = s.split('/');

        if let Some(num) = parts.next() { unit.parse_product(num, 1)?; }
        if let Some(den) = parts.next() { unit.parse_product(den, -1)?; }
        if parts.next().is_some() {
            return Err(format!("more than one '/' in '{}'", s));
        }

        unit.terms.retain(|_, v| *v != 0);
        Ok(unit)
    }

    fn parse_product(&mut self, s: &str, sign: i32) -> Result<(), String> {
        let normalized = s.replace("**", "^");
        for factor in factors(&normalized) {
            if factor.is_empty() || factor == "1" {
                continue;
            }
            if factor.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
                let value: f64 = factor.parse().map_err(|_| format!("invalid unit factor '{}'", factor))?;
                if value == 0.0 || !value.is_finite() {
                    return Err(format!("invalid scale factor '{}'", factor));
                }
                self.scale *= value.powi(sign);
                continue;
            }
            let (base, exp) = split_factor(factor)?;
            *self.terms.entry(base.to_string()).or_insert(0) += exp * sign;
        }
        Ok(())
    }

    pub fn is_dimensionless(&self) -> bool { self.terms.is_empty() }

    pub fn multiply(&mut self, other: &Self) {
        self.scale *= other.scale;
        for (k, v) in &other.terms { *self.terms.entry(k.clone()).or_insert(0) += v; }
        self.terms.retain(|_, v| *v != 0);
    }

    pub fn divide(&mut self, other: &Self) {
        self.scale /= other.scale;
        for (k, v) in &other.terms { *self.terms.entry(k.clone()).or_insert(0) -= v; }
        self.terms.retain(|_, v| *v != 0);
    }

    pub fn pow(&self, exp: i32) -> Self {
        let mut terms: BTreeMap<String, i32> = self.terms.iter().map(|(k, v)| (k.clone(), v * exp)).collect();
        terms.retain(|_, v| *v != 0);
        Self { terms, scale: self.scale.powi(exp) }
    }

    /// The `n`-th root, defined only when every exponent is divisible by `n`.
    pub fn root(&self, n: i32) -> Option<Self> {
        if n == 0 || self.terms.values().any(|v| v % n != 0) {
            return None;
        }
        Some(Self {
            terms: self.terms.iter().map(|(k, v)| (k.clone(), v / n)).collect(),
            scale: self.scale.powf(1.0 / f64::from(n)),
        })
    }

    pub fn to_unit(&self) -> Unit { Unit(self.to_string()) }

    fn single_symbol(&self) -> Option<&str> {
        match self.terms.iter().next() {
            Some((k, 1)) if self.terms.len() == 1 && self.scale == 1.0 => Some(k.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParsedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rendered: Vec<String> = Vec::new();
        if self.scale != 1.0 {
            rendered.push(self.scale.to_string());
        }
        rendered.extend(self.terms.iter().map(|(k, &v)| if v == 1 { k.clone() } else { format!("{}{}", k, v) }));
        if rendered.is_empty() {
            return write!(f, "1");
        }
        write!(f, "{}", rendered.join(" "))
    }
}

// Splits on whitespace, '*' and '.', except a '.' between digits ("0.001").
fn factors(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in s.char_indices() {
        let decimal_point = c == '.'
            && i > 0
            && bytes[i - 1].is_ascii_digit()
            && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit());
        if c.is_whitespace() || c == '*' || (c == '.' && !decimal_point) {
            out.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    out.push(&s[start..]);
    out
}

// "m-2", "s^-1", "m2" -> (base, exponent)
fn split_factor(factor: &str) -> Result<(&str, i32), String> {
    let (base, exp) = match factor.split_once('^') {
        Some((b, e)) => (b, e),
        None => {
            let cut = factor
                .char_indices()
                .find(|&(i, c)| i > 0 && (c.is_ascii_digit() || c == '-' || c == '+'))
                .map(|(i, _)| i)
                .unwrap_or(factor.len());
            (&factor[..cut], if cut == factor.len() { "1" } else { &factor[cut..] })
        }
    };
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("invalid unit factor '{}'", factor));
    }
    let exp = exp.parse::<i32>().map_err(|_| format!("invalid exponent in '{}'", factor))?;
    Ok((base, exp))
}

/// Canonical comparison: "m s-1" equals "m/s". Unparseable strings compare verbatim.
pub fn units_equal(a: &Unit, b: &Unit) -> bool {
    match (ParsedUnit::from_str(a.as_str()), ParsedUnit::from_str(b.as_str())) {
        (Ok(pa), Ok(pb)) => pa == pb,
        _ => a == b,
    }
}

/// External unit conversion routine.
pub trait UnitConverter: Send + Sync {
    fn is_convertible(&self, from: &Unit, to: &Unit) -> bool;

    /// Converts `values` from `from` to `to`; fails when no path exists.
    fn convert(&self, values: ArrayViewD<f64>, from: &Unit, to: &Unit) -> Result<ArrayD<f64>, ConformError>;
}

// symbol -> (base expansion, scale, offset); value_in_base = scale * value + offset
const SYMBOLS: &[(&str, &str, f64, f64)] = &[
    ("K", "K", 1.0, 0.0),
    ("degK", "K", 1.0, 0.0),
    ("degC", "K", 1.0, 273.15),
    ("celsius", "K", 1.0, 273.15),
    ("degF", "K", 5.0 / 9.0, 459.67 * 5.0 / 9.0),
    ("m", "m", 1.0, 0.0),
    ("km", "m", 1e3, 0.0),
    ("cm", "m", 1e-2, 0.0),
    ("mm", "m", 1e-3, 0.0),
    ("s", "s", 1.0, 0.0),
    ("min", "s", 60.0, 0.0),
    ("h", "s", 3600.0, 0.0),
    ("hr", "s", 3600.0, 0.0),
    ("day", "s", 86400.0, 0.0),
    ("d", "s", 86400.0, 0.0),
    ("kg", "kg", 1.0, 0.0),
    ("g", "kg", 1e-3, 0.0),
    ("Pa", "kg m-1 s-2", 1.0, 0.0),
    ("hPa", "kg m-1 s-2", 1e2, 0.0),
    ("kPa", "kg m-1 s-2", 1e3, 0.0),
    ("mbar", "kg m-1 s-2", 1e2, 0.0),
    ("bar", "kg m-1 s-2", 1e5, 0.0),
    ("N", "kg m s-2", 1.0, 0.0),
    ("J", "kg m2 s-2", 1.0, 0.0),
    ("W", "kg m2 s-3", 1.0, 0.0),
    ("percent", "1", 1e-2, 0.0),
    ("%", "1", 1e-2, 0.0),
];

/// Affine map into SI base units.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine {
    scale: f64,
    offset: f64,
}

/// Table-driven converter for linear and affine (temperature) units.
///
/// Unknown symbols are treated as their own base unit, so "USD" converts only
/// to "USD". Offsets apply only to a bare temperature symbol; in compound units
/// ("degC s-1") they are differences and only the scale is used.
#[derive(Debug, Default, Clone)]
pub struct LinearUnitConverter;

impl LinearUnitConverter {
    pub fn new() -> Self { Self }

    fn to_base(unit: &Unit) -> Option<(ParsedUnit, Affine)> {
        let parsed = ParsedUnit::from_str(unit.as_str()).ok()?;
        let mut base = ParsedUnit::default();
        let mut scale = parsed.scale;
        for (symbol, &exp) in &parsed.terms {
            match SYMBOLS.iter().find(|(s, ..)| s == symbol) {
                Some((_, expansion, s, _)) => {
                    let expanded = ParsedUnit::from_str(expansion).ok()?;
                    base.multiply(&expanded.pow(exp));
                    scale *= s.powi(exp);
                }
                None => {
                    base.multiply(&ParsedUnit { terms: BTreeMap::from([(symbol.clone(), exp)]), scale: 1.0 });
                }
            }
        }
        let offset = parsed
            .single_symbol()
            .and_then(|sym| SYMBOLS.iter().find(|(s, ..)| *s == sym))
            .map(|(.., off)| *off)
            .unwrap_or(0.0);
        Some((base, Affine { scale, offset }))
    }

    fn affine_between(from: &Unit, to: &Unit) -> Option<Affine> {
        let (base_from, a) = Self::to_base(from)?;
        let (base_to, b) = Self::to_base(to)?;
        if base_from != base_to {
            return None;
        }
        // y = ((a.scale * x + a.offset) - b.offset) / b.scale
        Some(Affine { scale: a.scale / b.scale, offset: (a.offset - b.offset) / b.scale })
    }
}

impl UnitConverter for LinearUnitConverter {
    fn is_convertible(&self, from: &Unit, to: &Unit) -> bool {
        units_equal(from, to) || Self::affine_between(from, to).is_some()
    }

    fn convert(&self, values: ArrayViewD<f64>, from: &Unit, to: &Unit) -> Result<ArrayD<f64>, ConformError> {
        if units_equal(from, to) {
            return Ok(values.to_owned());
        }
        let Affine { scale, offset } = Self::affine_between(from, to).ok_or_else(|| ConformError::UnconvertibleUnit {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        Ok(values.mapv(|v| v * scale + offset))
    }
}
