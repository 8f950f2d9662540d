//! C6 — Dependency Resolver.
//!
//! Produces a deterministic execution order from candidate migrations, the
//! applied set, and declared dependencies via Kahn's algorithm, with ties
//! broken by ascending migration id. Anything a cycle or missing dependency
//! leaves stranded is left out of the order entirely rather than forced into
//! a fallback position (spec §4.6, §8).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::warn;

use crate::config::DependenciesDocument;
use crate::model::{Migration, MigrationId};

/// The result of resolving one plan.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    /// Unapplied candidates in the order they should be executed.
    pub order: Vec<MigrationId>,
    /// Non-empty only when a cycle or missing dependency prevented the
    /// topological sort from consuming every candidate.
    pub warning: Option<String>,
}

/// Resolve an execution order for `candidates`.
///
/// `applied` is the set of already-applied migration versions (numeric).
/// `dependencies` declares `depends_on` edges within the service; when empty
/// or not provided for a given id, that id has no unresolved in-edges beyond
/// what its own `depends_on` list says (an id absent from the document has an
/// empty dependency list, which degrades the whole resolution to
/// ascending-ID order when true of every candidate).
pub fn resolve(
    candidates: &[Migration],
    applied: &BTreeSet<u32>,
    dependencies: &DependenciesDocument,
) -> ResolvedPlan {
    let unapplied: Vec<&Migration> = candidates
        .iter()
        .filter(|m| !applied.contains(&m.version()))
        .collect();

    if unapplied.is_empty() {
        return ResolvedPlan::default();
    }

    let candidate_ids: BTreeSet<MigrationId> = unapplied.iter().map(|m| m.id).collect();

    // in_degree counts only edges to other *unapplied candidates*; an edge
    // to an already-applied migration or to something outside the candidate
    // set is satisfied trivially and does not block the sort.
    let mut in_degree: BTreeMap<MigrationId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<MigrationId, Vec<MigrationId>> = BTreeMap::new();

    for &id in &candidate_ids {
        in_degree.entry(id).or_insert(0);
    }

    for migration in &unapplied {
        let depends_on = dependencies
            .get(&migration.id.to_string())
            .map(|meta| meta.depends_on.as_slice())
            .unwrap_or(&[]);

        for dep in depends_on {
            let Some(dep_id) = MigrationId::parse(dep) else {
                continue;
            };

            if candidate_ids.contains(&dep_id) {
                *in_degree.entry(migration.id).or_insert(0) += 1;
                dependents.entry(dep_id).or_default().push(migration.id);
            }
            // A dependency that is already applied, or that refers to a
            // migration outside the candidate set entirely, is satisfied and
            // contributes no in-degree.
        }
    }

    // Ready queue seeded with zero-in-degree nodes, ties broken by ascending
    // numeric id for a stable, deterministic order.
    let mut ready: VecDeque<MigrationId> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut ready_sorted: Vec<MigrationId> = ready.drain(..).collect();
    ready_sorted.sort();
    let mut ready: VecDeque<MigrationId> = ready_sorted.into();

    let mut order = Vec::with_capacity(unapplied.len());
    let mut remaining_degree = in_degree.clone();

    while let Some(id) = ready.pop_front() {
        order.push(id);

        if let Some(children) = dependents.get(&id) {
            let mut newly_ready = Vec::new();

            for &child in children {
                if let Some(deg) = remaining_degree.get_mut(&child) {
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(child);
                    }
                }
            }

            newly_ready.sort();
            for child in newly_ready {
                // Maintain overall ascending-id tie-breaking by inserting in
                // sorted position relative to what's already queued.
                let pos = ready.iter().position(|&r| r > child).unwrap_or(ready.len());
                ready.insert(pos, child);
            }
        }
    }

    if order.len() == candidate_ids.len() {
        return ResolvedPlan {
            order,
            warning: None,
        };
    }

    // Cycle or missing dependency: whatever Kahn's algorithm could not
    // consume is left out of the plan entirely rather than forced into some
    // fallback order, matching spec §8's "C6 returns the acyclic prefix"
    // (which degenerates to an empty plan when every candidate is involved
    // in the cycle, per S5).
    let resolved: BTreeSet<MigrationId> = order.iter().copied().collect();
    let mut stranded: Vec<MigrationId> = candidate_ids
        .iter()
        .copied()
        .filter(|id| !resolved.contains(id))
        .collect();
    stranded.sort();

    let names = stranded
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let warning = format!("cycle or missing dependency in: {names}");
    warn!("{warning}");

    ResolvedPlan {
        order,
        warning: Some(warning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationMetadata;
    use crate::model::MigrationKind;
    use std::path::PathBuf;

    fn migration(version: u32) -> Migration {
        Migration {
            id: MigrationId::from_version(version),
            kind: MigrationKind::Base,
            slug: "m".to_string(),
            up_path: PathBuf::from(format!("{version:06}_m.up.sql")),
            down_path: None,
        }
    }

    fn deps(pairs: &[(u32, &[u32])]) -> DependenciesDocument {
        let mut doc = DependenciesDocument::default();
        for &(id, depends_on) in pairs {
            doc.migrations.insert(
                MigrationId::from_version(id).to_string(),
                MigrationMetadata {
                    depends_on: depends_on
                        .iter()
                        .map(|v| MigrationId::from_version(*v).to_string())
                        .collect(),
                    ..Default::default()
                },
            );
        }
        doc
    }

    #[test]
    fn s1_fresh_install_orders_by_declared_dependencies() {
        let candidates = vec![migration(1), migration(2), migration(3)];
        let dependencies = deps(&[(2, &[1]), (3, &[2])]);

        let plan = resolve(&candidates, &BTreeSet::new(), &dependencies);

        assert_eq!(plan.order, vec![1, 2, 3].into_iter().map(MigrationId::from_version).collect::<Vec<_>>());
        assert!(plan.warning.is_none());
    }

    #[test]
    fn missing_dependencies_document_degrades_to_ascending_id_order() {
        let candidates = vec![migration(5), migration(3), migration(1)];
        let dependencies = DependenciesDocument::default();

        let plan = resolve(&candidates, &BTreeSet::new(), &dependencies);

        assert_eq!(
            plan.order,
            vec![1, 3, 5]
                .into_iter()
                .map(MigrationId::from_version)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn already_applied_dependency_is_satisfied() {
        let candidates = vec![migration(2)];
        let dependencies = deps(&[(2, &[1])]);
        let applied = BTreeSet::from([1]);

        let plan = resolve(&candidates, &applied, &dependencies);

        assert_eq!(plan.order, vec![MigrationId::from_version(2)]);
        assert!(plan.warning.is_none());
    }

    #[test]
    fn s5_full_cycle_resolves_to_an_empty_plan_with_warning() {
        let candidates = vec![migration(5), migration(6)];
        let dependencies = deps(&[(5, &[6]), (6, &[5])]);

        let plan = resolve(&candidates, &BTreeSet::new(), &dependencies);

        assert!(plan.order.is_empty());
        let warning = plan.warning.unwrap();
        assert!(warning.contains("000005"));
        assert!(warning.contains("000006"));
    }

    #[test]
    fn partial_cycle_still_resolves_the_acyclic_prefix() {
        // 000001 has no dependency and resolves normally; 000005/000006 form
        // a cycle between themselves and are left out of the plan.
        let candidates = vec![migration(1), migration(5), migration(6)];
        let dependencies = deps(&[(5, &[6]), (6, &[5])]);

        let plan = resolve(&candidates, &BTreeSet::new(), &dependencies);

        assert_eq!(plan.order, vec![MigrationId::from_version(1)]);
        assert!(plan.warning.is_some());
    }

    #[test]
    fn empty_candidate_set_resolves_to_empty_plan() {
        let plan = resolve(&[], &BTreeSet::new(), &DependenciesDocument::default());
        assert!(plan.order.is_empty());
        assert!(plan.warning.is_none());
    }

    #[test]
    fn already_applied_candidates_are_excluded_from_the_plan() {
        let candidates = vec![migration(1), migration(2)];
        let applied = BTreeSet::from([1, 2]);

        let plan = resolve(&candidates, &applied, &DependenciesDocument::default());
        assert!(plan.order.is_empty());
    }

    #[test]
    fn dependency_outside_candidate_set_does_not_block_ordering() {
        // 000002 depends on 000099, which is neither applied nor a
        // candidate. It should not block 000002 from being ready.
        let candidates = vec![migration(2)];
        let dependencies = deps(&[(2, &[99])]);

        let plan = resolve(&candidates, &BTreeSet::new(), &dependencies);
        assert_eq!(plan.order, vec![MigrationId::from_version(2)]);
        assert!(plan.warning.is_none());
    }
}
