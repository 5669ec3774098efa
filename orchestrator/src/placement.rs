use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Result};
use itertools::Itertools;

/// A node's standing in the placement order for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePriority {
    pub node: String,
    pub count: usize,
}

/// Compute scheduling constraints for a new container and add them to
/// `constraints`.
///
/// - An already-present node constraint wins; nothing is added twice.
/// - An explicit target node always wins over load balancing.
/// - With no per-node counts the decision is left to the scheduler.
/// - Otherwise the least-loaded node gets a soft preference and every full
///   node a hard exclusion. Fails when every node is at capacity.
///
/// `max_per_node <= 0` means unlimited.
pub fn calculate_constraints(
    existing_nodes: &[String],
    explicit_node: Option<&str>,
    per_node_count: &HashMap<String, usize>,
    max_per_node: i64,
    constraints: &mut BTreeSet<String>,
) -> Result<()> {
    if constraints
        .iter()
        .any(|c| c.starts_with("node==") || c.starts_with("node!="))
    {
        return Ok(());
    }
    if let Some(node) = explicit_node {
        constraints.insert(format!("node=={}", node));
        return Ok(());
    }
    if per_node_count.is_empty() || existing_nodes.is_empty() {
        return Ok(());
    }

    let mut priorities: Vec<NodePriority> = existing_nodes
        .iter()
        .map(|node| NodePriority {
            node: node.clone(),
            count: per_node_count.get(node).copied().unwrap_or(0),
        })
        .collect();
    // Stable: ties keep input order.
    priorities.sort_by_key(|p| p.count);

    let preferred = &priorities[0];
    if max_per_node > 0 && preferred.count >= max_per_node as usize {
        bail!(
            "cannot place container: all {} nodes are at capacity ({} per node)",
            priorities.len(),
            max_per_node
        );
    }
    constraints.insert(format!("node==~{}", preferred.node));

    if max_per_node > 0 {
        let full = priorities
            .iter()
            .filter(|p| p.count >= max_per_node as usize)
            .map(|p| regex::escape(&p.node))
            .join("|");
        if !full.is_empty() {
            constraints.insert(format!("node!=/^({})$/", full));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs
            .iter()
            .map(|(n, c)| (n.to_string(), *c))
            .collect()
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_preferred_node_is_least_loaded() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(
            &nodes(&["n1", "n2", "n3"]),
            None,
            &counts(&[("n1", 3), ("n2", 1), ("n3", 2)]),
            0,
            &mut constraints,
        )?;
        assert!(constraints.contains("node==~n2"));
        assert_eq!(constraints.len(), 1);
        Ok(())
    }

    #[test]
    fn test_ties_resolve_to_earliest_input() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(
            &nodes(&["n1", "n2", "n3"]),
            None,
            &counts(&[("n1", 1), ("n2", 1), ("n3", 1)]),
            5,
            &mut constraints,
        )?;
        assert!(constraints.contains("node==~n1"));
        Ok(())
    }

    #[test]
    fn test_full_nodes_are_excluded() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(
            &nodes(&["n1", "n2", "n3"]),
            None,
            &counts(&[("n1", 2), ("n2", 0), ("n3", 2)]),
            2,
            &mut constraints,
        )?;
        assert!(constraints.contains("node==~n2"));
        assert!(constraints.contains("node!=/^(n1|n3)$/"));
        Ok(())
    }

    #[test]
    fn test_all_nodes_full_fails() {
        let mut constraints = BTreeSet::new();
        let result = calculate_constraints(
            &nodes(&["n1", "n2"]),
            None,
            &counts(&[("n1", 2), ("n2", 3)]),
            2,
            &mut constraints,
        );
        assert!(result.is_err());
        assert!(constraints.is_empty());
    }

    #[test]
    fn test_explicit_node_wins() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(
            &nodes(&["n1", "n2"]),
            Some("n2"),
            &counts(&[("n1", 0), ("n2", 100)]),
            1,
            &mut constraints,
        )?;
        assert_eq!(constraints.len(), 1);
        assert!(constraints.contains("node==n2"));
        Ok(())
    }

    #[test]
    fn test_existing_constraint_is_not_duplicated() -> Result<()> {
        let mut constraints = BTreeSet::from(["node==pinned".to_string()]);
        calculate_constraints(
            &nodes(&["n1"]),
            Some("n1"),
            &counts(&[("n1", 0)]),
            0,
            &mut constraints,
        )?;
        assert_eq!(constraints.len(), 1);
        assert!(constraints.contains("node==pinned"));
        Ok(())
    }

    #[test]
    fn test_no_counts_defers_to_scheduler() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(&nodes(&["n1"]), None, &HashMap::new(), 2, &mut constraints)?;
        assert!(constraints.is_empty());
        Ok(())
    }

    #[test]
    fn test_regex_metacharacters_in_node_names_are_escaped() -> Result<()> {
        let mut constraints = BTreeSet::new();
        calculate_constraints(
            &nodes(&["node.a", "n2"]),
            None,
            &counts(&[("node.a", 2), ("n2", 0)]),
            2,
            &mut constraints,
        )?;
        assert!(constraints.contains("node!=/^(node\\.a)$/"));
        Ok(())
    }
}
