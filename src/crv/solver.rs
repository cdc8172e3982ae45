//! Finite-domain constraint solving.
//!
//! The backend is pluggable; the default enumerates every satisfying
//! assignment by backtracking with forward checking, treating predicates as
//! opaque black boxes. Enumeration follows variable and domain declaration
//! order, so results are reproducible.

use crate::{error::Result, value::Value};

/// One constraint as seen by the backend: a predicate over a subset of the
/// problem's variables, identified by index.
pub struct SolverConstraint<'a> {
    /// Indices into the problem's variable list, in predicate-argument
    /// order.
    pub var_indices: Vec<usize>,
    /// The predicate, fed the values of `var_indices` in order.
    pub f: Box<dyn FnMut(&[Value]) -> bool + 'a>,
}

/// A finite-domain subproblem: variables, their ordered domains, and the
/// predicates over them.
pub struct Problem<'a> {
    pub vars: Vec<String>,
    pub domains: Vec<Vec<Value>>,
    pub constraints: Vec<SolverConstraint<'a>>,
}

/// A constraint-solving strategy. Implementations must enumerate
/// deterministically for a fixed input.
pub trait Solver {
    /// Every assignment (values parallel to `problem.vars`) satisfying all
    /// constraints.
    fn solve(&mut self, problem: &mut Problem<'_>) -> Result<Vec<Vec<Value>>>;
}

/// The default backend: depth-first enumeration with forward checking.
#[derive(Default)]
pub struct BacktrackSolver;

impl Solver for BacktrackSolver {
    fn solve(&mut self, problem: &mut Problem<'_>) -> Result<Vec<Vec<Value>>> {
        let n = problem.vars.len();
        let mut live: Vec<Vec<bool>> = problem.domains.iter().map(|d| vec![true; d.len()]).collect();
        let mut assignment: Vec<Option<usize>> = vec![None; n];
        let mut solutions = Vec::new();
        search(problem, &mut live, &mut assignment, 0, &mut solutions);
        Ok(solutions)
    }
}

fn search(
    problem: &mut Problem<'_>,
    live: &mut Vec<Vec<bool>>,
    assignment: &mut Vec<Option<usize>>,
    var: usize,
    solutions: &mut Vec<Vec<Value>>,
) {
    if var == problem.vars.len() {
        let solution = assignment
            .iter()
            .enumerate()
            .map(|(i, idx)| problem.domains[i][idx.expect("complete assignment")].clone())
            .collect();
        solutions.push(solution);
        return;
    }

    for value_idx in 0..problem.domains[var].len() {
        if !live[var][value_idx] {
            continue;
        }
        assignment[var] = Some(value_idx);

        if !check_assigned(problem, assignment, var) {
            assignment[var] = None;
            continue;
        }

        // Forward checking: narrow the domain of every constraint's single
        // unassigned variable; an emptied domain prunes this branch.
        let mut pruned: Vec<(usize, usize)> = Vec::new();
        let viable = forward_check(problem, live, assignment, var, &mut pruned);
        if viable {
            search(problem, live, assignment, var + 1, solutions);
        }
        for (v, idx) in pruned {
            live[v][idx] = true;
        }
        assignment[var] = None;
    }
}

/// Evaluates every fully assigned constraint involving the just-assigned
/// variable.
fn check_assigned(problem: &mut Problem<'_>, assignment: &[Option<usize>], var: usize) -> bool {
    let domains = &problem.domains;
    for constraint in &mut problem.constraints {
        if !constraint.var_indices.contains(&var) {
            continue;
        }
        let mut args = Vec::with_capacity(constraint.var_indices.len());
        let mut complete = true;
        for &vi in &constraint.var_indices {
            match assignment[vi] {
                Some(idx) => args.push(domains[vi][idx].clone()),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete && !(constraint.f)(&args) {
            return false;
        }
    }
    true
}

fn forward_check(
    problem: &mut Problem<'_>,
    live: &mut [Vec<bool>],
    assignment: &[Option<usize>],
    var: usize,
    pruned: &mut Vec<(usize, usize)>,
) -> bool {
    let domains = &problem.domains;
    for constraint in &mut problem.constraints {
        if !constraint.var_indices.contains(&var) {
            continue;
        }
        let unassigned: Vec<usize> = constraint
            .var_indices
            .iter()
            .copied()
            .filter(|&vi| assignment[vi].is_none())
            .collect();
        let target = match unassigned.as_slice() {
            [single] => *single,
            _ => continue,
        };

        for candidate in 0..domains[target].len() {
            if !live[target][candidate] {
                continue;
            }
            let args: Vec<Value> = constraint
                .var_indices
                .iter()
                .map(|&vi| {
                    if vi == target {
                        domains[vi][candidate].clone()
                    } else {
                        domains[vi][assignment[vi].expect("only target unassigned")].clone()
                    }
                })
                .collect();
            if !(constraint.f)(&args) {
                live[target][candidate] = false;
                pruned.push((target, candidate));
            }
        }
        if live[target].iter().all(|alive| !alive) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_domain(lo: i64, hi: i64) -> Vec<Value> {
        (lo..=hi).map(Value::Int).collect()
    }

    fn problem_less_than<'a>() -> Problem<'a> {
        Problem {
            vars: vec!["x".to_string(), "y".to_string()],
            domains: vec![int_domain(0, 2), int_domain(0, 2)],
            constraints: vec![SolverConstraint {
                var_indices: vec![0, 1],
                f: Box::new(|v: &[Value]| v[0] < v[1]),
            }],
        }
    }

    #[test]
    fn test_enumerates_all_satisfying_assignments() {
        let mut problem = problem_less_than();
        let solutions = BacktrackSolver.solve(&mut problem).unwrap();
        // (0,1) (0,2) (1,2)
        assert_eq!(solutions.len(), 3);
        for s in &solutions {
            assert!(s[0] < s[1]);
        }
    }

    #[test]
    fn test_enumeration_order_is_deterministic() {
        let first = BacktrackSolver.solve(&mut problem_less_than()).unwrap();
        let second = BacktrackSolver.solve(&mut problem_less_than()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], vec![Value::Int(0), Value::Int(1)]);
    }

    #[test]
    fn test_unsatisfiable_problem_yields_no_solutions() {
        let mut problem = Problem {
            vars: vec!["x".to_string()],
            domains: vec![int_domain(0, 5)],
            constraints: vec![SolverConstraint {
                var_indices: vec![0],
                f: Box::new(|_| false),
            }],
        };
        assert!(BacktrackSolver.solve(&mut problem).unwrap().is_empty());
    }

    #[test]
    fn test_unconstrained_problem_is_the_full_product() {
        let mut problem = Problem {
            vars: vec!["a".to_string(), "b".to_string()],
            domains: vec![int_domain(0, 1), int_domain(0, 2)],
            constraints: Vec::new(),
        };
        assert_eq!(BacktrackSolver.solve(&mut problem).unwrap().len(), 6);
    }

    #[test]
    fn test_three_variable_chain() {
        let mut problem = Problem {
            vars: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            domains: vec![int_domain(0, 3), int_domain(0, 3), int_domain(0, 3)],
            constraints: vec![
                SolverConstraint {
                    var_indices: vec![0, 1],
                    f: Box::new(|v: &[Value]| v[0] < v[1]),
                },
                SolverConstraint {
                    var_indices: vec![1, 2],
                    f: Box::new(|v: &[Value]| v[1] < v[2]),
                },
            ],
        };
        let solutions = BacktrackSolver.solve(&mut problem).unwrap();
        // Strictly increasing triples over 0..=3: C(4,3) = 4.
        assert_eq!(solutions.len(), 4);
    }

    #[test]
    fn test_empty_domain_means_no_solutions() {
        let mut problem = Problem {
            vars: vec!["x".to_string()],
            domains: vec![Vec::new()],
            constraints: Vec::new(),
        };
        assert!(BacktrackSolver.solve(&mut problem).unwrap().is_empty());
    }
}
