use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

/// A physical unit as written in the catalog or input metadata (e.g. "K", "kg m-2 s-1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit(pub String);

impl Unit {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn dimensionless() -> Self { Self("1".to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A numeric constant. Compared and hashed by bit pattern so literal nodes
/// can take part in structural deduplication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Literal(pub f64);

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool { self.0.to_bits() == other.0.to_bits() }
}
impl Eq for Literal {}
impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) { self.0.to_bits().hash(state) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub len: Option<usize>,
}

impl Dimension {
    pub fn new(name: impl Into<String>, len: Option<usize>) -> Self {
        Self { name: name.into(), len }
    }
}

/// Ordered named axes of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DimensionSignature(pub SmallVec<[Dimension; 4]>);

impl DimensionSignature {
    pub fn scalar() -> Self { Self::default() }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self(names.iter().map(|n| Dimension::new(n.as_ref(), None)).collect())
    }

    pub fn from_sized<S: AsRef<str>>(dims: &[(S, usize)]) -> Self {
        Self(dims.iter().map(|(n, l)| Dimension::new(n.as_ref(), Some(*l))).collect())
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Dimension> { self.0.iter() }

    pub fn names(&self) -> Vec<&str> { self.0.iter().map(|d| d.name.as_str()).collect() }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool { self.position(name).is_some() }

    pub fn get(&self, name: &str) -> Option<&Dimension> { self.0.iter().find(|d| d.name == name) }

    /// Known lengths, or `None` if any axis length is unknown.
    pub fn shape(&self) -> Option<Vec<usize>> { self.0.iter().map(|d| d.len).collect() }

    /// Number of elements per unit length of `along`, i.e. the product of
    /// every other axis. Unknown lengths count as 1.
    pub fn elements_excluding(&self, along: Option<&str>) -> usize {
        self.0
            .iter()
            .filter(|d| Some(d.name.as_str()) != along)
            .map(|d| d.len.unwrap_or(1))
            .product()
    }

    pub fn without(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|d| d.name != name).cloned().collect())
    }

    /// Two signatures are compatible when one is a permutation of the other.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.permutation_to(&other.names()).is_some()
    }

    /// The permutation taking this signature into `target` order, if the names
    /// are the same set.
    pub fn permutation_to<S: AsRef<str>>(&self, target: &[S]) -> Option<Permutation> {
        if target.len() != self.len() {
            return None;
        }
        let mut axes = Vec::with_capacity(target.len());
        for name in target {
            let pos = self.position(name.as_ref())?;
            if axes.contains(&pos) {
                return None;
            }
            axes.push(pos);
        }
        Some(Permutation(axes))
    }

    /// Renames axes through `map`; names missing from the map are kept.
    pub fn renamed(&self, map: &std::collections::BTreeMap<String, String>) -> Self {
        Self(
            self.0
                .iter()
                .map(|d| Dimension { name: map.get(&d.name).cloned().unwrap_or_else(|| d.name.clone()), len: d.len })
                .collect(),
        )
    }
}

impl fmt::Display for DimensionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 { write!(f, ", ")?; }
            match d.len {
                Some(n) => write!(f, "{}={}", d.name, n)?,
                None => write!(f, "{}", d.name)?,
            }
        }
        write!(f, ")")
    }
}

/// Axis reordering: output axis `i` is input axis `self.0[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permutation(pub Vec<usize>);

impl Permutation {
    pub fn inverse(&self) -> Self {
        let mut inv = vec![0; self.0.len()];
        for (i, &a) in self.0.iter().enumerate() {
            inv[a] = i;
        }
        Self(inv)
    }

    pub fn apply(&self, sig: &DimensionSignature) -> DimensionSignature {
        DimensionSignature(self.0.iter().map(|&a| sig.0[a].clone()).collect())
    }

    pub fn axes(&self) -> &[usize] { &self.0 }
}

/// Static (non-array) argument bound to a function call, e.g. `dim='time'`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionValue {
    Text(String),
    Number(Literal),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(s) => write!(f, "'{}'", s),
            OptionValue::Number(n) => write!(f, "{}", n.0),
        }
    }
}

pub type CallOptions = Vec<(String, OptionValue)>;

pub fn option_text<'a>(options: &'a CallOptions, key: &str) -> Option<&'a str> {
    options.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
        OptionValue::Text(s) => Some(s.as_str()),
        OptionValue::Number(_) => None,
    })
}

pub fn option_number(options: &CallOptions, key: &str) -> Option<f64> {
    options.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
        OptionValue::Number(n) => Some(n.0),
        OptionValue::Text(_) => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// A registered function or operator; array arguments are the node's parents.
    Call { function: String, options: CallOptions },
    UnitConvert { from: Unit, to: Unit },
    Transpose { permutation: Permutation },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Literal(Literal),
    /// Reference to a raw input variable.
    Operand(String),
    Formula(Operation),
}

/// Resolved shape semantics and unit of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub dims: DimensionSignature,
    pub unit: Unit,
}
