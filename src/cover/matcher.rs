//! Bin matching: deciding which bins a sampled value falls into, under a
//! user transformation and binary relation.

use crate::{
    error::{Error, Result},
    value::{Sample, Value},
};

/// Transformation from the sampled arguments to the value tested against
/// bins. Stateful closures are allowed (transition-bin idioms keep a running
/// window); failures surface as contract errors at the offending sample.
pub type TransformFn = Box<dyn FnMut(&Sample) -> Result<Value>>;

/// Relation deciding whether a transformed value matches one bin. May mutate
/// captured state, which is only well-defined under single-argument samplers.
pub type RelationFn = Box<dyn FnMut(&Value, &Value) -> bool>;

/// The matching primitive shared by coverage leaves: applies the
/// transformation, then tests the result against every bin in declared order.
pub(crate) struct BinMatcher {
    item: String,
    xf: Option<TransformFn>,
    rel: Option<RelationFn>,
    vname: Option<String>,
    injective: bool,
}

impl BinMatcher {
    pub fn new(
        item: String,
        xf: Option<TransformFn>,
        rel: Option<RelationFn>,
        vname: Option<String>,
        injective: bool,
    ) -> BinMatcher {
        BinMatcher {
            item,
            xf,
            rel,
            vname,
            injective,
        }
    }

    /// Indices of the bins matched by this sample, in declared bin order.
    /// Under injective matching at most the first match is returned.
    pub fn matches<'a>(
        &mut self,
        sample: &Sample,
        bins: impl Iterator<Item = &'a Value>,
    ) -> Result<Vec<usize>> {
        let value = self.transformed(sample)?;

        let mut matched = Vec::new();
        for (idx, bin) in bins.enumerate() {
            let hit = match &mut self.rel {
                Some(rel) => rel(&value, bin),
                None => value == *bin,
            };
            if hit {
                matched.push(idx);
                if self.injective {
                    break;
                }
            }
        }
        Ok(matched)
    }

    /// The value tested against bins: the transformation's output, the
    /// argument named by `vname`, or the sole argument of a one-argument
    /// sample, in that order of preference.
    fn transformed(&mut self, sample: &Sample) -> Result<Value> {
        if let Some(xf) = &mut self.xf {
            return xf(sample);
        }
        if let Some(vname) = &self.vname {
            return sample.get(vname).cloned().ok_or_else(|| {
                Error::Contract(format!(
                    "sample for `{}` carries no argument named `{}`",
                    self.item, vname
                ))
            });
        }
        sample.single().cloned().ok_or_else(|| {
            Error::Contract(format!(
                "`{}` declares neither a transformation nor `vname`; \
                 samples must then carry exactly one argument, got {}",
                self.item,
                sample.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bins(vals: &[i64]) -> Vec<Value> {
        vals.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn test_default_relation_is_equality() {
        let mut m = BinMatcher::new("t".into(), None, None, None, true);
        let b = bins(&[0, 1, 2]);
        let got = m.matches(&Sample::new().with("x", 1), b.iter()).unwrap();
        assert_eq!(got, vec![1]);
    }

    #[test]
    fn test_vname_selects_argument() {
        let mut m = BinMatcher::new("t".into(), None, None, Some("par".into()), true);
        let b = bins(&[0, 1]);
        let sample = Sample::new().with("addr", 25).with("par", 0);
        assert_eq!(m.matches(&sample, b.iter()).unwrap(), vec![0]);
    }

    #[test]
    fn test_missing_vname_argument_is_contract_error() {
        let mut m = BinMatcher::new("t".into(), None, None, Some("par".into()), true);
        let b = bins(&[0, 1]);
        let err = m
            .matches(&Sample::new().with("addr", 25), b.iter())
            .unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
    }

    #[test]
    fn test_multi_argument_sample_needs_vname_or_xf() {
        let mut m = BinMatcher::new("t".into(), None, None, None, true);
        let b = bins(&[0]);
        let sample = Sample::new().with("a", 0).with("b", 0);
        assert!(matches!(
            m.matches(&sample, b.iter()),
            Err(Error::Contract(_))
        ));
    }

    #[test]
    fn test_injective_returns_first_match_only() {
        // A relation every bin satisfies.
        let mut m = BinMatcher::new(
            "t".into(),
            None,
            Some(Box::new(|_, _| true)),
            None,
            true,
        );
        let b = bins(&[5, 6, 7]);
        assert_eq!(m.matches(&Sample::new().with("x", 0), b.iter()).unwrap(), vec![0]);
    }

    #[test]
    fn test_non_injective_returns_all_matches() {
        let range = |v: &Value, b: &Value| {
            let (v, b) = (v.as_int().unwrap(), b.as_seq().unwrap());
            b[0].as_int().unwrap() <= v && v <= b[1].as_int().unwrap()
        };
        let mut m = BinMatcher::new("t".into(), None, Some(Box::new(range)), None, false);
        let b = vec![Value::pair(0, 10), Value::pair(5, 20), Value::pair(30, 40)];
        let got = m.matches(&Sample::new().with("x", 7), b.iter()).unwrap();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn test_transform_failure_propagates() {
        let xf: TransformFn = Box::new(|s: &Sample| {
            s.get("missing")
                .cloned()
                .ok_or_else(|| Error::Contract("missing argument".into()))
        });
        let mut m = BinMatcher::new("t".into(), Some(xf), None, None, true);
        let b = bins(&[0]);
        assert!(m.matches(&Sample::new().with("x", 0), b.iter()).is_err());
    }
}
