//! Declarative constraints over random variables.
//!
//! Rust has no runtime view of a closure's parameter names, so every
//! predicate declares its variable list explicitly; values arrive in that
//! declared order. The return type classifies the predicate: a boolean makes
//! a hard constraint, a non-negative number a distribution weight.

use std::collections::BTreeSet;

use crate::value::Value;

/// Predicate of a hard constraint: every successful randomization satisfies
/// it.
pub type HardFn = Box<dyn FnMut(&[Value]) -> bool>;

/// Weight function of a distribution: non-negative relative weight for one
/// candidate assignment. Zero forbids the assignment.
pub type DistFn = Box<dyn FnMut(&[Value]) -> f64>;

pub(crate) enum PredicateFn {
    Hard(HardFn),
    Dist(DistFn),
}

/// A classified predicate bound to an explicit variable list.
pub struct Constraint {
    vars: Vec<String>,
    f: PredicateFn,
}

impl Constraint {
    /// A hard constraint over the named variables.
    pub fn hard<S: Into<String>>(
        vars: impl IntoIterator<Item = S>,
        f: impl FnMut(&[Value]) -> bool + 'static,
    ) -> Constraint {
        Constraint {
            vars: vars.into_iter().map(Into::into).collect(),
            f: PredicateFn::Hard(Box::new(f)),
        }
    }

    /// A distribution over the named variables.
    pub fn dist<S: Into<String>>(
        vars: impl IntoIterator<Item = S>,
        f: impl FnMut(&[Value]) -> f64 + 'static,
    ) -> Constraint {
        Constraint {
            vars: vars.into_iter().map(Into::into).collect(),
            f: PredicateFn::Dist(Box::new(f)),
        }
    }

    /// The declared variable names, in predicate-argument order.
    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    /// Whether this predicate is a distribution rather than a hard
    /// constraint.
    pub fn is_dist(&self) -> bool {
        matches!(self.f, PredicateFn::Dist(_))
    }

    pub(crate) fn f_mut(&mut self) -> &mut PredicateFn {
        &mut self.f
    }
}

/// The classification key of a predicate: the exact set of its variables
/// that are random. Hard constraints and distributions key separately.
pub(crate) fn random_key(vars: &[String], is_random: impl Fn(&str) -> bool) -> BTreeSet<String> {
    vars.iter()
        .filter(|v| is_random(v))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_by_constructor() {
        let h = Constraint::hard(["x", "y"], |v: &[Value]| v[0] < v[1]);
        let d = Constraint::dist(["x"], |_| 1.0);
        assert!(!h.is_dist());
        assert!(d.is_dist());
        assert_eq!(h.vars(), ["x", "y"]);
    }

    #[test]
    fn test_random_key_filters_non_random_vars() {
        let vars = vec!["x".to_string(), "limit".to_string(), "y".to_string()];
        let key = random_key(&vars, |v| v == "x" || v == "y");
        assert_eq!(
            key.into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
    }
}
