//! Partitioning random variables into ordered solve groups.
//!
//! The declared solve order gives the macro groups; variables left out form
//! an implicit final group. Each constraint lands in the earliest group by
//! which all of its random variables are decided. Within a macro group,
//! variables split into connected components of the predicate co-occurrence
//! graph, solved separately with identical semantics at far smaller
//! enumeration cost.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// The ordered solve plan: component groups plus the group index every
/// non-constant predicate was assigned to.
pub(crate) struct GroupPlan {
    /// Variable groups in solve order.
    pub groups: Vec<Vec<String>>,
    /// For each predicate, the index into `groups` it is solved with.
    /// `None` marks predicates without random variables.
    pub assignment: Vec<Option<usize>>,
}

/// Builds the solve plan from declaration-ordered random variables, the
/// declared solve order, and each predicate's random-variable key.
pub(crate) fn plan(
    random_vars: &[String],
    solve_order: &[Vec<String>],
    keys: &[BTreeSet<String>],
) -> Result<GroupPlan> {
    for group in solve_order {
        for var in group {
            if !random_vars.contains(var) {
                return Err(Error::Contract(format!(
                    "solve_order names `{}`, which is not a random variable",
                    var
                )));
            }
        }
    }
    let mut mentioned: BTreeSet<&String> = BTreeSet::new();
    for group in solve_order {
        for var in group {
            if !mentioned.insert(var) {
                return Err(Error::Contract(format!(
                    "solve_order names `{}` twice",
                    var
                )));
            }
        }
    }

    // Macro groups: the declared ones, then everything else.
    let mut macro_groups: Vec<Vec<String>> = solve_order.to_vec();
    let implicit: Vec<String> = random_vars
        .iter()
        .filter(|v| !mentioned.contains(v))
        .cloned()
        .collect();
    if !implicit.is_empty() {
        macro_groups.push(implicit);
    }
    macro_groups.retain(|g| !g.is_empty());

    // Earliest macro group whose prefix union covers the key.
    let mut macro_of_key = |key: &BTreeSet<String>| -> Option<usize> {
        if key.is_empty() {
            return None;
        }
        let mut union: BTreeSet<&String> = BTreeSet::new();
        for (idx, group) in macro_groups.iter().enumerate() {
            union.extend(group.iter());
            if key.iter().all(|k| union.contains(k)) {
                return Some(idx);
            }
        }
        None
    };
    let macro_assignment: Vec<Option<usize>> = keys.iter().map(&mut macro_of_key).collect();

    // Split each macro group into connected components, joined by the keys
    // assigned to it.
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut assignment: Vec<Option<usize>> = vec![None; keys.len()];
    for (mi, macro_group) in macro_groups.iter().enumerate() {
        let mut component_of: Vec<usize> = (0..macro_group.len()).collect();
        for (ki, key) in keys.iter().enumerate() {
            if macro_assignment[ki] != Some(mi) {
                continue;
            }
            let members: Vec<usize> = macro_group
                .iter()
                .enumerate()
                .filter(|(_, v)| key.contains(*v))
                .map(|(i, _)| i)
                .collect();
            if let Some(first) = members.first() {
                let root = find(&mut component_of, *first);
                for m in &members[1..] {
                    union(&mut component_of, root, *m);
                }
            }
        }

        // Components ordered by their first variable's declared position.
        let mut component_groups: Vec<(usize, usize)> = Vec::new(); // (root, group idx)
        for (vi, var) in macro_group.iter().enumerate() {
            let root = find(&mut component_of, vi);
            let gi = match component_groups.iter().find(|(r, _)| *r == root) {
                Some((_, gi)) => *gi,
                None => {
                    groups.push(Vec::new());
                    let gi = groups.len() - 1;
                    component_groups.push((root, gi));
                    gi
                }
            };
            groups[gi].push(var.clone());
        }

        for (ki, key) in keys.iter().enumerate() {
            if macro_assignment[ki] != Some(mi) {
                continue;
            }
            let anchor = macro_group
                .iter()
                .position(|v| key.contains(v))
                .map(|vi| find(&mut component_of, vi));
            if let Some(root) = anchor {
                if let Some((_, gi)) = component_groups.iter().find(|(r, _)| *r == root) {
                    assignment[ki] = Some(*gi);
                }
            }
        }
    }

    Ok(GroupPlan { groups, assignment })
}

fn find(parent: &mut Vec<usize>, i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut walk = i;
    while parent[walk] != root {
        let next = parent[walk];
        parent[walk] = root;
        walk = next;
    }
    root
}

fn union(parent: &mut Vec<usize>, a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        // Anchor on the smaller index so component order tracks declaration
        // order.
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi] = lo;
    }
}
