//! Values sampled into bins and drawn from random-variable domains, plus the
//! named-argument bundle a sampling function delivers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A hashable value usable as a coverage bin, a sampled argument, or a member
/// of a random variable's domain. Sequences nest, so tuple-shaped bins such as
/// range pairs or cross combinations are ordinary values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A signed integer.
    Int(i64),
    /// A string.
    Str(String),
    /// An ordered sequence of values.
    Seq(Vec<Value>),
}

impl Value {
    /// Builds a two-element sequence, the conventional shape for range bins.
    pub fn pair(a: impl Into<Value>, b: impl Into<Value>) -> Value {
        Value::Seq(vec![a.into(), b.into()])
    }

    /// Returns the integer payload, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the string payload, if this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the sequence payload, if this value is a sequence.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
            Value::Seq(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Value::pair(a, b)
    }
}

/// The named arguments of a single sampling-function invocation. Argument
/// order is the order in which they were attached.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    args: Vec<(String, Value)>,
}

impl Sample {
    /// Creates an empty sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a named argument and returns the sample for chaining.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.push((name.to_string(), value.into()));
        self
    }

    /// Looks an argument up by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// The number of arguments carried by this sample.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether this sample carries no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Iterates over `(name, value)` pairs in attachment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.args.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// The sole argument of a single-argument sample.
    pub fn single(&self) -> Option<&Value> {
        match self.args.as_slice() {
            [(_, v)] => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_natural_forms() {
        assert_eq!(Value::from(5).to_string(), "5");
        assert_eq!(Value::from("rw").to_string(), "rw");
        assert_eq!(Value::pair(0, 50).to_string(), "(0, 50)");
        assert_eq!(
            Value::Seq(vec![Value::pair(0, 1), Value::from(2)]).to_string(),
            "((0, 1), 2)"
        );
    }

    #[test]
    fn test_sample_lookup_by_name() {
        let s = Sample::new().with("addr", 25).with("rw", 1);
        assert_eq!(s.get("addr"), Some(&Value::Int(25)));
        assert_eq!(s.get("rw"), Some(&Value::Int(1)));
        assert_eq!(s.get("par"), None);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_sample_single_requires_one_argument() {
        assert_eq!(
            Sample::new().with("x", 3).single(),
            Some(&Value::Int(3))
        );
        assert_eq!(Sample::new().with("x", 3).with("y", 4).single(), None);
        assert_eq!(Sample::new().single(), None);
    }

    #[test]
    fn test_value_ordering_within_variant() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::from("a") < Value::from("b"));
    }
}
