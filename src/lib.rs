//! Functional coverage and constrained randomization for digital-hardware
//! test benches.
//!
//! The crate has two tightly coupled halves:
//!
//! - [`cover`]: a hierarchical coverage database. Test authors register
//!   [`CoverPoint`]s, [`CoverCross`]es and [`CoverCheck`]s under dotted
//!   names; sampling updates bin hit counts, aggregates percentages up the
//!   implicit container tree, fires callbacks, and serializes to XML, YAML
//!   or JSON for later merging.
//! - [`crv`]: constrained randomization. A [`Randomized`] host holds
//!   random variables with finite domains, hard constraints and
//!   distribution weights; [`Randomize::randomize`] picks a satisfying
//!   assignment through a pluggable finite-domain solver.
//!
//! Coverage-driven generation loops the two together: sampled coverage
//! state feeds back into constraints, steering future draws away from
//! already covered regions.
//!
//! The core is single-threaded and cooperative; it is meant to be driven
//! from a simulator's event loop and performs no locking.

pub mod cover;
pub mod crv;
pub mod error;
pub mod value;

pub use cover::{
    check::CoverCheck,
    cross::CoverCross,
    db::{coverage_db, reset_coverage_db, CoverageDb},
    export::ExportFormat,
    point::CoverPoint,
    section::{BoundSampler, CoverageSection},
    CoverItem,
};
pub use crv::{
    constraint::Constraint,
    solver::{BacktrackSolver, Problem, Solver, SolverConstraint},
    Randomize, Randomized,
};
pub use error::{Error, Result};
pub use value::{Sample, Value};

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    /// Coverage-driven exclusion: the constraint consults the bins already
    /// covered, so ten draws cover the whole domain and the eleventh has
    /// nowhere left to go.
    #[test]
    fn test_coverage_driven_generation_exhausts_the_domain() {
        let db = CoverageDb::new();
        let cdtg = CoverPoint::new("top.cdtg")
            .bins(0..10)
            .vname("x")
            .register(&db)
            .unwrap();

        let covered: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&covered);
        let mut rv = Randomized::with_seed(101);
        rv.add_rand("x", 0..10);
        rv.add_constraint(Constraint::hard(["x"], move |v: &[Value]| {
            !seen.borrow().contains(&v[0].as_int().unwrap())
        }));

        for draw in 0..10 {
            rv.randomize().unwrap();
            let x = rv.int("x").unwrap();
            db.sample(&["top.cdtg"], &Sample::new().with("x", x)).unwrap();
            covered.borrow_mut().push(x);
            assert_eq!(cdtg.coverage(), draw + 1);
        }

        assert_eq!(cdtg.cover_percentage(), 100.0);
        assert!(matches!(rv.randomize(), Err(Error::Solver { .. })));
    }

    /// A randomized transaction driven through a bound sampler, the way a
    /// test bench stacks primitives over its send function.
    #[test]
    fn test_randomize_then_sample_through_a_section() {
        let db = CoverageDb::new();
        CoverPoint::new("bus.addr")
            .bins([Value::pair(0, 127), Value::pair(128, 255)])
            .vname("addr")
            .rel(|v, bin| {
                let r = bin.as_seq().unwrap();
                r[0].as_int().unwrap() <= v.as_int().unwrap()
                    && v.as_int().unwrap() <= r[1].as_int().unwrap()
            })
            .register(&db)
            .unwrap();
        CoverPoint::new("bus.rw").bins([0, 1]).vname("rw").register(&db).unwrap();

        let mut rv = Randomized::with_seed(7);
        rv.add_rand("addr", 0..256);
        rv.add_rand("rw", 0..2);

        let mut sent = Vec::new();
        let mut send = CoverageSection::new(&db)
            .items(["bus.addr", "bus.rw"])
            .bind(|s: &Sample| {
                (
                    s.get("addr").and_then(Value::as_int).unwrap(),
                    s.get("rw").and_then(Value::as_int).unwrap(),
                )
            });

        for _ in 0..40 {
            rv.randomize().unwrap();
            let sample = Sample::new()
                .with("addr", rv.int("addr").unwrap())
                .with("rw", rv.int("rw").unwrap());
            sent.push(send.call(&sample).unwrap());
        }

        assert_eq!(sent.len(), 40);
        let bus = db.get("bus").unwrap();
        // 40 unconstrained draws land in every half and on both rw values.
        assert_eq!(bus.coverage(), bus.size());
    }
}
