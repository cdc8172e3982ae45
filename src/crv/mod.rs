//! Constrained randomization: random variables with finite domains, hard
//! constraints, distribution weights, and a solver-backed `randomize`.
//!
//! A [`Randomized`] hosts the variables and predicates. Test-bench types
//! embed one and implement [`Randomize`] for the pre/post hooks; calling
//! [`Randomize::randomize`] solves the current constraints and commits a
//! satisfying assignment, or fails without touching any variable.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, WeightedAliasIndex};
use tracing::debug;

use crate::{
    error::{Error, Result},
    value::Value,
};

pub mod constraint;
pub mod order;
pub mod solver;

use constraint::{random_key, Constraint, DistFn, HardFn, PredicateFn};
use solver::{BacktrackSolver, Problem, Solver, SolverConstraint};

struct VarState {
    /// Present for random variables; the ordered finite domain.
    domain: Option<Vec<Value>>,
    value: Option<Value>,
}

/// The stateful host for random variables, constraints and distributions.
pub struct Randomized {
    vars: IndexMap<String, VarState>,
    constraints: Vec<Constraint>,
    order: Vec<Vec<String>>,
    rng: StdRng,
    solver: Box<dyn Solver>,
}

impl Default for Randomized {
    fn default() -> Self {
        Self::new()
    }
}

impl Randomized {
    /// A host with an entropy-seeded random source.
    pub fn new() -> Randomized {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A host with a fixed seed, for reproducible draws.
    pub fn with_seed(seed: u64) -> Randomized {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Randomized {
        Randomized {
            vars: IndexMap::new(),
            constraints: Vec::new(),
            order: Vec::new(),
            rng,
            solver: Box::new(BacktrackSolver),
        }
    }

    /// Replaces the random source with a freshly seeded one.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Substitutes the constraint-solving backend.
    pub fn set_solver(&mut self, solver: Box<dyn Solver>) {
        self.solver = solver;
    }

    /// Declares `name` random over an ordered finite domain. Re-declaration
    /// replaces the previous domain.
    pub fn add_rand<V: Into<Value>>(&mut self, name: &str, domain: impl IntoIterator<Item = V>) {
        let domain: Vec<Value> = domain.into_iter().map(Into::into).collect();
        let state = self
            .vars
            .entry(name.to_string())
            .or_insert(VarState { domain: None, value: None });
        state.domain = Some(domain);
    }

    /// Sets the current value of a variable, declaring a non-random variable
    /// if the name is new. Constraint parameters bind these values by name.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let state = self
            .vars
            .entry(name.to_string())
            .or_insert(VarState { domain: None, value: None });
        state.value = Some(value.into());
    }

    /// The current value of a variable, if any.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).and_then(|s| s.value.as_ref())
    }

    /// The current value of a variable as an integer.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_int)
    }

    /// Whether `name` is declared random.
    pub fn is_random(&self, name: &str) -> bool {
        self.vars.get(name).map_or(false, |s| s.domain.is_some())
    }

    /// Registers a predicate. At most one hard constraint and one
    /// distribution exist per exact random-variable set; a newcomer with an
    /// existing key replaces the earlier predicate.
    pub fn add_constraint(&mut self, constraint: Constraint) {
        let key = self.key_of(&constraint);
        let existing = self.constraints.iter().position(|c| {
            c.is_dist() == constraint.is_dist() && self.key_of(c) == key
        });
        match existing {
            Some(pos) => self.constraints[pos] = constraint,
            None => self.constraints.push(constraint),
        }
    }

    /// Removes every predicate keyed by the exact random-variable set of
    /// `vars`. Returns how many were removed.
    pub fn del_constraint<S: AsRef<str>>(&mut self, vars: impl IntoIterator<Item = S>) -> usize {
        let named: Vec<String> = vars.into_iter().map(|s| s.as_ref().to_string()).collect();
        let key = random_key(&named, |v| self.is_random(v));
        let before = self.constraints.len();
        let keys: Vec<BTreeSet<String>> =
            self.constraints.iter().map(|c| self.key_of(c)).collect();
        let mut idx = 0;
        self.constraints.retain(|_| {
            let keep = keys[idx] != key;
            idx += 1;
            keep
        });
        before - self.constraints.len()
    }

    /// Declares the solve order: each group of variables is resolved
    /// jointly, groups in declared order, unmentioned random variables in an
    /// implicit final group.
    pub fn solve_order<S: Into<String>, G: IntoIterator<Item = S>>(
        &mut self,
        groups: impl IntoIterator<Item = G>,
    ) {
        self.order = groups
            .into_iter()
            .map(|g| g.into_iter().map(Into::into).collect())
            .collect();
    }

    fn key_of(&self, constraint: &Constraint) -> BTreeSet<String> {
        random_key(constraint.vars(), |v| self.is_random(v))
    }

    /// Solves with the current predicates plus `extras`, which replace
    /// same-keyed predicates for this call only.
    pub(crate) fn solve_with(&mut self, extras: Vec<Constraint>) -> Result<()> {
        let mut saved: Vec<(usize, Constraint)> = Vec::new();
        let mut appended = 0usize;
        for extra in extras {
            let key = self.key_of(&extra);
            let existing = self.constraints.iter().position(|c| {
                c.is_dist() == extra.is_dist() && self.key_of(c) == key
            });
            match existing {
                Some(pos) => {
                    let old = std::mem::replace(&mut self.constraints[pos], extra);
                    saved.push((pos, old));
                }
                None => {
                    self.constraints.push(extra);
                    appended += 1;
                }
            }
        }

        let outcome = self.solve_current();

        let keep = self.constraints.len() - appended;
        self.constraints.truncate(keep);
        for (pos, old) in saved.into_iter().rev() {
            self.constraints[pos] = old;
        }
        outcome
    }

    fn solve_current(&mut self) -> Result<()> {
        for c in &self.constraints {
            for v in c.vars() {
                if !self.vars.contains_key(v) {
                    return Err(Error::Contract(format!(
                        "constraint references unknown variable `{}`",
                        v
                    )));
                }
            }
        }

        let random: Vec<String> = self
            .vars
            .iter()
            .filter(|(_, s)| s.domain.is_some())
            .map(|(n, _)| n.clone())
            .collect();
        let keys: Vec<BTreeSet<String>> =
            self.constraints.iter().map(|c| self.key_of(c)).collect();

        // Predicates with no random variable at all act as gates on the
        // current values.
        for (ci, c) in self.constraints.iter_mut().enumerate() {
            if !keys[ci].is_empty() {
                continue;
            }
            let mut args = Vec::with_capacity(c.vars().len());
            for v in c.vars() {
                match self.vars.get(v).and_then(|s| s.value.clone()) {
                    Some(value) => args.push(value),
                    None => {
                        return Err(Error::Contract(format!(
                            "variable `{}` has no value when a constraint needs it",
                            v
                        )))
                    }
                }
            }
            if let PredicateFn::Hard(f) = c.f_mut() {
                if !f(&args) {
                    return Err(Error::Solver {
                        group: c.vars().join(", "),
                        detail: "constraint over non-random variables is not satisfied"
                            .to_string(),
                    });
                }
            }
        }

        let plan = order::plan(&random, &self.order, &keys)?;

        let Randomized {
            vars,
            constraints,
            rng,
            solver,
            ..
        } = self;

        let mut staged: IndexMap<String, Value> = IndexMap::new();
        for (gi, group) in plan.groups.iter().enumerate() {
            let domains: Vec<Vec<Value>> = group
                .iter()
                .map(|v| vars[v.as_str()].domain.clone().unwrap_or_default())
                .collect();

            let mut hard: Vec<SolverConstraint<'_>> = Vec::new();
            let mut dists: Vec<(Vec<Slot>, &mut DistFn)> = Vec::new();
            for (ci, c) in constraints.iter_mut().enumerate() {
                if plan.assignment[ci] != Some(gi) {
                    continue;
                }
                let (slots, var_indices) = build_slots(c.vars(), group, &staged, vars)?;
                match c.f_mut() {
                    PredicateFn::Hard(f) => hard.push(compile_hard(slots, var_indices, f)),
                    PredicateFn::Dist(f) => dists.push((slots, f)),
                }
            }
            let hard_count = hard.len();

            let mut problem = Problem {
                vars: group.clone(),
                domains,
                constraints: hard,
            };
            let solutions = solver.solve(&mut problem)?;
            if solutions.is_empty() {
                return Err(Error::Solver {
                    group: group.join(", "),
                    detail: format!(
                        "no satisfying assignment under {} hard constraint(s)",
                        hard_count
                    ),
                });
            }

            let choice = if dists.is_empty() {
                rng.gen_range(0..solutions.len())
            } else {
                let mut weights = Vec::with_capacity(solutions.len());
                for solution in &solutions {
                    let mut weight = 1.0f64;
                    for (slots, f) in dists.iter_mut() {
                        let args = realize_positional(slots, solution);
                        let w = f(&args);
                        if w < 0.0 {
                            return Err(Error::Solver {
                                group: group.join(", "),
                                detail: "distribution returned a negative weight".to_string(),
                            });
                        }
                        weight *= w;
                    }
                    weights.push(weight);
                }
                if weights.iter().sum::<f64>() <= 0.0 {
                    return Err(Error::Solver {
                        group: group.join(", "),
                        detail: "every candidate assignment has zero weight".to_string(),
                    });
                }
                let index = WeightedAliasIndex::new(weights).map_err(|e| Error::Solver {
                    group: group.join(", "),
                    detail: format!("invalid distribution weights: {}", e),
                })?;
                index.sample(rng)
            };

            let chosen = &solutions[choice];
            debug!("group [{}] solved: {} candidate(s)", group.join(", "), solutions.len());
            for (var, value) in group.iter().zip(chosen) {
                staged.insert(var.clone(), value.clone());
            }
        }

        // Nothing failed: commit the whole assignment at once.
        for (name, value) in staged {
            if let Some(state) = self.vars.get_mut(&name) {
                state.value = Some(value);
            }
        }
        Ok(())
    }
}

/// How one declared predicate argument is produced at solve time.
enum Slot {
    /// Bound to a concrete value (non-random, or solved in an earlier
    /// group).
    Fixed(Value),
    /// Bound to the group variable at this position.
    Group(usize),
}

fn build_slots(
    declared: &[String],
    group: &[String],
    staged: &IndexMap<String, Value>,
    vars: &IndexMap<String, VarState>,
) -> Result<(Vec<Slot>, Vec<usize>)> {
    let mut slots = Vec::with_capacity(declared.len());
    let mut var_indices = Vec::new();
    for name in declared {
        if let Some(pos) = group.iter().position(|g| g == name) {
            slots.push(Slot::Group(pos));
            var_indices.push(pos);
        } else if let Some(value) = staged.get(name) {
            slots.push(Slot::Fixed(value.clone()));
        } else if let Some(value) = vars.get(name).and_then(|s| s.value.clone()) {
            slots.push(Slot::Fixed(value));
        } else {
            return Err(Error::Contract(format!(
                "variable `{}` has no value when a constraint needs it",
                name
            )));
        }
    }
    Ok((slots, var_indices))
}

fn compile_hard<'a>(
    slots: Vec<Slot>,
    var_indices: Vec<usize>,
    f: &'a mut HardFn,
) -> SolverConstraint<'a> {
    SolverConstraint {
        var_indices,
        f: Box::new(move |group_vals: &[Value]| {
            let args = realize_sequential(&slots, group_vals);
            f(&args)
        }),
    }
}

/// Group values arrive in slot order (the solver hands over exactly the
/// constrained variables).
fn realize_sequential(slots: &[Slot], group_vals: &[Value]) -> Vec<Value> {
    let mut args = Vec::with_capacity(slots.len());
    let mut next = 0;
    for slot in slots {
        match slot {
            Slot::Fixed(v) => args.push(v.clone()),
            Slot::Group(_) => {
                args.push(group_vals[next].clone());
                next += 1;
            }
        }
    }
    args
}

/// Group values arrive as a full assignment parallel to the group's
/// variable list.
fn realize_positional(slots: &[Slot], solution: &[Value]) -> Vec<Value> {
    slots
        .iter()
        .map(|slot| match slot {
            Slot::Fixed(v) => v.clone(),
            Slot::Group(pos) => solution[*pos].clone(),
        })
        .collect()
}

/// Hooks and entry points for randomizable test-bench objects. Types embed a
/// [`Randomized`] and return it from [`randomized`](Randomize::randomized);
/// `Randomized` itself implements the trait for standalone use.
pub trait Randomize {
    /// The embedded variable host.
    fn randomized(&mut self) -> &mut Randomized;

    /// Runs immediately before solving.
    fn pre_randomize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs after a successful solve, with the chosen values committed.
    fn post_randomize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Solves the current constraints and commits one satisfying assignment.
    fn randomize(&mut self) -> Result<()> {
        self.pre_randomize()?;
        self.randomized().solve_with(Vec::new())?;
        self.post_randomize()
    }

    /// Like [`randomize`](Randomize::randomize), with extra predicates that
    /// replace same-keyed ones for this call only.
    fn randomize_with(&mut self, extras: Vec<Constraint>) -> Result<()> {
        self.pre_randomize()?;
        self.randomized().solve_with(extras)?;
        self.post_randomize()
    }
}

impl Randomize for Randomized {
    fn randomized(&mut self) -> &mut Randomized {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_range(lo: i64, hi: i64) -> Vec<i64> {
        (lo..=hi).collect()
    }

    struct Point {
        rv: Randomized,
        x: i64,
        y: i64,
    }

    impl Point {
        fn new(seed: u64) -> Point {
            let mut rv = Randomized::with_seed(seed);
            rv.add_rand("x", int_range(-10, 9));
            rv.add_rand("y", int_range(-10, 9));
            rv.add_constraint(Constraint::hard(["x", "y"], |v: &[Value]| v[0] < v[1]));
            Point { rv, x: 0, y: 0 }
        }
    }

    impl Randomize for Point {
        fn randomized(&mut self) -> &mut Randomized {
            &mut self.rv
        }

        fn post_randomize(&mut self) -> Result<()> {
            self.x = self.rv.int("x").expect("x solved");
            self.y = self.rv.int("y").expect("y solved");
            Ok(())
        }
    }

    #[test]
    fn test_every_draw_satisfies_the_constraint() {
        let mut p = Point::new(11);
        let mut seen_min = i64::MAX;
        let mut seen_max = i64::MIN;
        for _ in 0..1000 {
            p.randomize().unwrap();
            assert!(p.x < p.y);
            assert!((-10..=9).contains(&p.x));
            assert!((-10..=9).contains(&p.y));
            seen_min = seen_min.min(p.x);
            seen_max = seen_max.max(p.x);
        }
        // x is supported on [-10, 8]; the bulk of that range shows up over
        // 1000 draws.
        assert_eq!(seen_min, -10);
        assert!(seen_max >= 7);
    }

    #[test]
    fn test_fixed_seed_reproduces_the_sequence() {
        let draw = |seed: u64| {
            let mut p = Point::new(seed);
            (0..10)
                .map(|_| {
                    p.randomize().unwrap();
                    (p.x, p.y)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_non_random_parameters_bind_current_values() {
        let mut rv = Randomized::with_seed(3);
        rv.add_rand("x", int_range(0, 9));
        rv.set("limit", 4);
        rv.add_constraint(Constraint::hard(["x", "limit"], |v: &[Value]| v[0] < v[1]));
        for _ in 0..20 {
            rv.randomize().unwrap();
            assert!(rv.int("x").unwrap() < 4);
        }
        rv.set("limit", 1);
        for _ in 0..20 {
            rv.randomize().unwrap();
            assert_eq!(rv.int("x").unwrap(), 0);
        }
    }

    #[test]
    fn test_replacement_is_keyed_by_exact_variable_set() {
        let mut rv = Randomized::with_seed(5);
        rv.add_rand("x", int_range(0, 9));
        rv.add_constraint(Constraint::hard(["x"], |v: &[Value]| {
            v[0].as_int().unwrap() < 3
        }));
        // Same key: replaces the first predicate.
        rv.add_constraint(Constraint::hard(["x"], |v: &[Value]| {
            v[0].as_int().unwrap() >= 7
        }));
        for _ in 0..20 {
            rv.randomize().unwrap();
            assert!(rv.int("x").unwrap() >= 7);
        }
    }

    #[test]
    fn test_del_constraint_removes_by_key() {
        let mut rv = Randomized::with_seed(5);
        rv.add_rand("x", int_range(0, 3));
        rv.add_constraint(Constraint::hard(["x"], |_| false));
        assert!(rv.randomize().is_err());
        assert_eq!(rv.del_constraint(["x"]), 1);
        rv.randomize().unwrap();
    }

    #[test]
    fn test_randomize_with_replaces_for_one_call_only() {
        let mut rv = Randomized::with_seed(9);
        rv.add_rand("x", int_range(0, 9));
        rv.add_constraint(Constraint::hard(["x"], |v: &[Value]| {
            v[0].as_int().unwrap() < 5
        }));

        rv.randomize_with(vec![Constraint::hard(["x"], |v: &[Value]| {
            v[0].as_int().unwrap() > 7
        })])
        .unwrap();
        assert!(rv.int("x").unwrap() > 7);

        for _ in 0..10 {
            rv.randomize().unwrap();
            assert!(rv.int("x").unwrap() < 5);
        }
    }

    #[test]
    fn test_restore_after_failing_randomize_with() {
        let mut rv = Randomized::with_seed(9);
        rv.add_rand("x", int_range(0, 9));
        rv.add_constraint(Constraint::hard(["x"], |v: &[Value]| {
            v[0].as_int().unwrap() < 5
        }));
        assert!(rv
            .randomize_with(vec![Constraint::hard(["x"], |_| false)])
            .is_err());
        // The original predicate is back.
        rv.randomize().unwrap();
        assert!(rv.int("x").unwrap() < 5);
    }

    #[test]
    fn test_zero_weight_forbids_an_assignment() {
        let mut rv = Randomized::with_seed(21);
        rv.add_rand("x", int_range(0, 3));
        rv.add_constraint(Constraint::dist(["x"], |v: &[Value]| {
            if v[0].as_int().unwrap() == 0 {
                0.0
            } else {
                1.0
            }
        }));
        for _ in 0..50 {
            rv.randomize().unwrap();
            assert_ne!(rv.int("x").unwrap(), 0);
        }
    }

    #[test]
    fn test_all_zero_weights_is_a_solver_error() {
        let mut rv = Randomized::with_seed(21);
        rv.add_rand("x", int_range(0, 3));
        rv.add_constraint(Constraint::dist(["x"], |_| 0.0));
        assert!(matches!(rv.randomize(), Err(Error::Solver { .. })));
    }

    #[test]
    fn test_negative_weight_is_a_solver_error() {
        let mut rv = Randomized::with_seed(21);
        rv.add_rand("x", int_range(0, 3));
        rv.add_constraint(Constraint::dist(["x"], |_| -1.0));
        assert!(matches!(rv.randomize(), Err(Error::Solver { .. })));
    }

    #[test]
    fn test_weighted_choice_biases_draws() {
        let mut rv = Randomized::with_seed(33);
        rv.add_rand("x", int_range(0, 1));
        rv.add_constraint(Constraint::dist(["x"], |v: &[Value]| {
            if v[0].as_int().unwrap() == 1 {
                9.0
            } else {
                1.0
            }
        }));
        let mut ones = 0;
        for _ in 0..500 {
            rv.randomize().unwrap();
            if rv.int("x").unwrap() == 1 {
                ones += 1;
            }
        }
        // Expected around 450; far from the uniform 250.
        assert!(ones > 350, "biased draw count was {}", ones);
    }

    #[test]
    fn test_solve_order_resolves_groups_in_sequence() {
        let mut rv = Randomized::with_seed(17);
        rv.add_rand("x", int_range(0, 9));
        rv.add_rand("y", int_range(0, 9));
        rv.solve_order([["x"], ["y"]]);
        rv.add_constraint(Constraint::hard(["x", "y"], |v: &[Value]| v[0] < v[1]));
        for _ in 0..50 {
            rv.randomize().unwrap();
            assert!(rv.int("x").unwrap() < rv.int("y").unwrap());
        }
    }

    #[test]
    fn test_failed_group_commits_nothing() {
        let mut rv = Randomized::with_seed(2);
        rv.add_rand("x", int_range(0, 3));
        rv.add_rand("y", int_range(0, 3));
        rv.solve_order([["x"], ["y"]]);
        rv.add_constraint(Constraint::hard(["y"], |_| false));
        let err = rv.randomize().unwrap_err();
        match err {
            Error::Solver { group, .. } => assert_eq!(group, "y"),
            other => panic!("expected solver error, got {:?}", other),
        }
        assert_eq!(rv.value("x"), None);
        assert_eq!(rv.value("y"), None);
    }

    #[test]
    fn test_unknown_constraint_variable_is_a_contract_error() {
        let mut rv = Randomized::with_seed(2);
        rv.add_rand("x", int_range(0, 3));
        rv.add_constraint(Constraint::hard(["x", "ghost"], |_| true));
        assert!(matches!(rv.randomize(), Err(Error::Contract(_))));
    }

    #[test]
    fn test_stateful_predicate_narrows_over_calls() {
        use std::{cell::RefCell, rc::Rc};

        let covered: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&covered);
        let mut rv = Randomized::with_seed(8);
        rv.add_rand("x", int_range(0, 9));
        rv.add_constraint(Constraint::hard(["x"], move |v: &[Value]| {
            !seen.borrow().contains(&v[0].as_int().unwrap())
        }));

        for _ in 0..10 {
            rv.randomize().unwrap();
            covered.borrow_mut().push(rv.int("x").unwrap());
        }
        let mut drawn = covered.borrow().clone();
        drawn.sort();
        assert_eq!(drawn, int_range(0, 9));
        assert!(matches!(rv.randomize(), Err(Error::Solver { .. })));
    }
}
