// ================================================================================================
// Universe Map Service
// ================================================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ordered_float::OrderedFloat;
use tracing::{info, warn};

use crate::{
    engine::{SimulationOutcomes, world::ScenarioPatch},
    error::{SystemError, UniverseError, WorldlineResult},
    types::{EdgeId, NodeId, PatchId, ProjectId, RunId, TenantId},
    universe::node::{
        AggregatedOutcome, ConfidenceTier, Edge, EdgeExplanation, Intervention, Node, NodePatch,
        OutcomeStat,
    },
};

/// External collaborator translating natural-language interventions into concrete
/// forms before a fork commits. Implementations must not return another NL query.
pub trait NlPatchTranslator: Send + Sync {
    fn translate(&self, query: &str) -> WorldlineResult<Intervention>;
}

/// Subgraph view returned to callers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UniverseMapData {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Side-by-side comparison entry for one node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeComparisonEntry {
    pub node_id: NodeId,
    pub label: String,
    pub depth: u32,
    pub probability: f64,
    pub cumulative_probability: f64,
    pub confidence: Option<ConfidenceTier>,
    pub run_count: usize,
    pub statistics: BTreeMap<String, OutcomeStat>,
}

/// A root→leaf path ranked by cumulative probability.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PathInfo {
    pub node_ids: Vec<NodeId>,
    pub cumulative_probability: f64,
}

const AGGREGATE_CAS_RETRIES: usize = 8;

/// The Universe Map: an append-only DAG of nodes under optimistic concurrency.
pub struct UniverseMap {
    nodes: DashMap<NodeId, Node>,
    edges: DashMap<EdgeId, Edge>,
    patches: DashMap<PatchId, NodePatch>,
    children: DashMap<NodeId, Vec<NodeId>>,
    translator: Option<Arc<dyn NlPatchTranslator>>,
}

impl Default for UniverseMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UniverseMap {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            patches: DashMap::new(),
            children: DashMap::new(),
            translator: None,
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn NlPatchTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    // ============================================================================
    // Node Creation
    // ============================================================================

    /// Create a baseline node at depth 0 with probability 1.
    pub fn create_root_node(
        &self,
        project_id: ProjectId,
        tenant_id: TenantId,
        scenario_patch: Option<ScenarioPatch>,
    ) -> Node {
        let node = Node {
            id: NodeId::new(),
            project_id,
            tenant_id,
            parent_id: None,
            depth: 0,
            label: "Baseline".to_string(),
            is_baseline: true,
            scenario_patch: Some(scenario_patch.unwrap_or_default()),
            run_refs: Vec::new(),
            aggregated_outcome: None,
            probability: 1.0,
            cumulative_probability: 1.0,
            confidence: None,
            is_stale: false,
            stale_reason: None,
            min_ensemble_size: 1,
            version: 0,
            created_at: Utc::now(),
        };
        self.nodes.insert(node.id, node.clone());
        info!(node_id = %node.id, project_id = %project_id, "root node created");
        node
    }

    /// Fork a child node from `parent_id`. The intervention is stored on the edge; a
    /// NodePatch is derived and applied to the parent's resolved scenario to produce
    /// the child's. The parent is never modified. A NL intervention that fails
    /// translation rejects the fork; no node is created.
    pub fn fork_node(
        &self,
        parent_id: NodeId,
        intervention: Intervention,
        explanation: Option<String>,
    ) -> WorldlineResult<(Node, Edge, NodePatch)> {
        let parent = self
            .get_node(parent_id)
            .ok_or_else(|| UniverseError::ParentNotFound(parent_id.to_string()))?;

        // Resolve NL interventions before committing anything.
        let resolved = match intervention {
            Intervention::NlQuery { ref query } => {
                let translator = self.translator.as_ref().ok_or_else(|| {
                    UniverseError::TranslationFailed(
                        "no natural-language translator configured".to_string(),
                    )
                })?;
                let translated = translator.translate(query)?;
                if translated.is_nl() {
                    return Err(UniverseError::TranslationFailed(
                        "translator returned another natural-language query".to_string(),
                    )
                    .into());
                }
                translated
            }
            other => other,
        };

        let (changes, event_scripts) = match &resolved {
            Intervention::VariableDelta { changes } => {
                if changes.is_empty() {
                    return Err(UniverseError::EmptyIntervention(
                        "variable delta with no changes".to_string(),
                    )
                    .into());
                }
                (changes.clone(), Vec::new())
            }
            Intervention::EventScript { scripts } => {
                if scripts.is_empty() {
                    return Err(UniverseError::EmptyIntervention(
                        "event script with no events".to_string(),
                    )
                    .into());
                }
                (BTreeMap::new(), scripts.clone())
            }
            Intervention::NlQuery { .. } => unreachable!("resolved above"),
        };

        let edge_id = EdgeId::new();
        let patch = NodePatch {
            id: PatchId::new(),
            edge_id,
            changes,
            event_scripts,
        };

        // Child scenario starts from the parent's aggregated final environment when
        // one exists, otherwise the parent's resolved scenario.
        let mut base_scenario = parent.scenario_patch.clone().unwrap_or_default();
        if let Some(aggregate) = &parent.aggregated_outcome {
            for (variable, value) in &aggregate.environment_state {
                base_scenario.variables.insert(variable.clone(), *value);
            }
        }
        let child_scenario = patch.apply(&base_scenario);

        let child = Node {
            id: NodeId::new(),
            project_id: parent.project_id,
            tenant_id: parent.tenant_id,
            parent_id: Some(parent.id),
            depth: parent.depth + 1,
            label: explanation.clone().unwrap_or_else(|| "Fork".to_string()),
            is_baseline: false,
            scenario_patch: Some(child_scenario),
            run_refs: Vec::new(),
            aggregated_outcome: None,
            probability: 0.0,
            cumulative_probability: 0.0,
            confidence: None,
            is_stale: false,
            stale_reason: None,
            min_ensemble_size: parent.min_ensemble_size,
            version: 0,
            created_at: Utc::now(),
        };

        let edge = Edge {
            id: edge_id,
            parent_id: parent.id,
            child_id: child.id,
            intervention: resolved,
            explanation: explanation.as_deref().map(EdgeExplanation::from_text),
            created_at: Utc::now(),
        };

        self.nodes.insert(child.id, child.clone());
        self.edges.insert(edge.id, edge.clone());
        self.patches.insert(patch.id, patch.clone());
        self.children.entry(parent.id).or_default().push(child.id);

        info!(parent = %parent.id, child = %child.id, depth = child.depth, "node forked");
        Ok((child, edge, patch))
    }

    // ============================================================================
    // Queries
    // ============================================================================

    pub fn get_node(&self, node_id: NodeId) -> Option<Node> {
        self.nodes.get(&node_id).map(|entry| entry.clone())
    }

    pub fn get_edge(&self, edge_id: EdgeId) -> Option<Edge> {
        self.edges.get(&edge_id).map(|entry| entry.clone())
    }

    pub fn child_ids(&self, node_id: NodeId) -> Vec<NodeId> {
        self.children
            .get(&node_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Subgraph for a project, optionally bounded by depth and filtered to nodes with
    /// at least one run.
    pub fn get_universe_map_data(
        &self,
        project_id: ProjectId,
        max_depth: Option<u32>,
        explored_only: bool,
    ) -> UniverseMapData {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .filter(|entry| max_depth.is_none_or(|d| entry.depth <= d))
            .filter(|entry| !explored_only || !entry.run_refs.is_empty())
            .map(|entry| entry.clone())
            .collect();
        nodes.sort_by_key(|n| (n.depth, n.id));

        let node_ids: std::collections::BTreeSet<NodeId> =
            nodes.iter().map(|n| n.id).collect();
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|entry| {
                node_ids.contains(&entry.parent_id) && node_ids.contains(&entry.child_id)
            })
            .map(|entry| entry.clone())
            .collect();
        edges.sort_by_key(|e| e.id);

        UniverseMapData { nodes, edges }
    }

    /// Side-by-side statistics for the requested nodes.
    pub fn compare_nodes(&self, node_ids: &[NodeId]) -> WorldlineResult<Vec<NodeComparisonEntry>> {
        node_ids
            .iter()
            .map(|&id| {
                let node = self
                    .get_node(id)
                    .ok_or_else(|| UniverseError::NodeNotFound(id.to_string()))?;
                Ok(NodeComparisonEntry {
                    node_id: node.id,
                    label: node.label.clone(),
                    depth: node.depth,
                    probability: node.probability,
                    cumulative_probability: node.cumulative_probability,
                    confidence: node.confidence,
                    run_count: node.run_refs.len(),
                    statistics: node
                        .aggregated_outcome
                        .map(|a| a.statistics)
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Root→leaf paths for a project ranked by cumulative probability, best first.
    pub fn most_likely_paths(&self, project_id: ProjectId, k: usize) -> Vec<PathInfo> {
        let roots: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|entry| entry.project_id == project_id && entry.parent_id.is_none())
            .map(|entry| entry.id)
            .collect();

        let mut paths = Vec::new();
        for root in roots {
            let mut stack = vec![vec![root]];
            while let Some(path) = stack.pop() {
                let last = *path.last().expect("non-empty path");
                let children = self.child_ids(last);
                if children.is_empty() {
                    let cumulative = self
                        .get_node(last)
                        .map(|n| n.cumulative_probability)
                        .unwrap_or(0.0);
                    paths.push(PathInfo {
                        node_ids: path,
                        cumulative_probability: cumulative,
                    });
                } else {
                    for child in children {
                        let mut extended = path.clone();
                        extended.push(child);
                        stack.push(extended);
                    }
                }
            }
        }

        paths.sort_by_key(|p| std::cmp::Reverse(OrderedFloat(p.cumulative_probability)));
        paths.truncate(k);
        paths
    }

    // ============================================================================
    // Run Binding & Aggregation
    // ============================================================================

    /// Attach a run reference to a node. References are append-only.
    pub fn add_run_ref(&self, node_id: NodeId, run_id: RunId) -> WorldlineResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        if !node.run_refs.contains(&run_id) {
            node.run_refs.push(run_id);
        }
        Ok(())
    }

    /// Recompute a node's aggregated outcome from its completed runs' outcomes.
    ///
    /// The fold is deterministic and associative (mean/variance/min/max per outcome
    /// key), applied under compare-and-set on the node's version counter. A new
    /// completed run only refines the aggregate; prior run references are preserved.
    pub fn aggregate_runs(
        &self,
        node_id: NodeId,
        completed: &[(RunId, SimulationOutcomes)],
        reliability_adjustment: Option<f64>,
    ) -> WorldlineResult<Node> {
        if completed.is_empty() {
            return self
                .get_node(node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()).into());
        }

        for _attempt in 0..AGGREGATE_CAS_RETRIES {
            let snapshot = self
                .get_node(node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
            let expected_version = snapshot.version;

            let aggregate = fold_outcomes(completed);
            let probability = mean(
                &completed
                    .iter()
                    .map(|(_, o)| o.primary_outcome_probability)
                    .collect::<Vec<_>>(),
            );
            let adjusted = probability * reliability_adjustment.unwrap_or(1.0);
            let confidence = ConfidenceTier::from_score(adjusted);
            let is_stale = completed.len() < snapshot.min_ensemble_size;

            let mut entry = self
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
            if entry.version != expected_version {
                warn!(node_id = %node_id, "aggregate version conflict; retrying");
                continue;
            }
            let min_ensemble = entry.min_ensemble_size;
            entry.aggregated_outcome = Some(aggregate);
            entry.probability = probability;
            entry.confidence = Some(confidence);
            entry.is_stale = is_stale;
            entry.stale_reason = is_stale.then(|| {
                format!("ensemble below minimum: {} of {}", completed.len(), min_ensemble)
            });
            entry.version += 1;
            let updated = entry.clone();
            drop(entry);

            self.recompute_cumulative(node_id)?;
            return self
                .get_node(node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()).into())
                .map(|node| {
                    info!(node_id = %node_id, runs = completed.len(), probability = updated.probability, "node aggregate updated");
                    node
                });
        }

        Err(UniverseError::ConcurrentUpdate(node_id.to_string()).into())
    }

    /// Recompute cumulative probability for a node and its descendants:
    /// `cumulative(node) = product of probability along its root path`.
    fn recompute_cumulative(&self, node_id: NodeId) -> WorldlineResult<()> {
        let node = self
            .get_node(node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        let parent_cumulative = match node.parent_id {
            Some(parent_id) => {
                self.get_node(parent_id)
                    .ok_or_else(|| {
                        SystemError::InvariantViolation(format!(
                            "dangling parent {parent_id} on node {node_id}"
                        ))
                    })?
                    .cumulative_probability
            }
            None => 1.0,
        };

        {
            let mut entry = self
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
            entry.cumulative_probability = if entry.parent_id.is_none() {
                1.0
            } else {
                parent_cumulative * entry.probability
            };
        }

        for child in self.child_ids(node_id) {
            self.recompute_cumulative(child)?;
        }
        Ok(())
    }

    // ============================================================================
    // Staleness & Ensembles
    // ============================================================================

    pub fn mark_stale(&self, node_id: NodeId, reason: &str) -> WorldlineResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        node.is_stale = true;
        node.stale_reason = Some(reason.to_string());
        Ok(())
    }

    /// Clear the staleness flag after a refresh run is queued.
    pub fn mark_refreshed(&self, node_id: NodeId) -> WorldlineResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        node.is_stale = false;
        node.stale_reason = None;
        Ok(())
    }

    /// Raise a node's minimum ensemble size to at least `n`.
    pub fn raise_min_ensemble(&self, node_id: NodeId, n: usize) -> WorldlineResult<usize> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| UniverseError::NodeNotFound(node_id.to_string()))?;
        node.min_ensemble_size = node.min_ensemble_size.max(n);
        Ok(node.min_ensemble_size)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Fold outcome distributions into per-key statistics. Keys missing from a run count
/// as 0 for that run, matching the multi-seed aggregation contract.
fn fold_outcomes(completed: &[(RunId, SimulationOutcomes)]) -> AggregatedOutcome {
    let mut keys: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
    for (_, outcome) in completed {
        keys.extend(outcome.outcome_distribution.keys());
    }

    let mut statistics = BTreeMap::new();
    for key in keys {
        let values: Vec<f64> = completed
            .iter()
            .map(|(_, o)| o.outcome_distribution.get(key).copied().unwrap_or(0.0))
            .collect();
        let m = mean(&values);
        let variance =
            values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
        statistics.insert(
            key.clone(),
            OutcomeStat {
                mean: m,
                variance,
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                sample_count: values.len(),
            },
        );
    }

    // Primary outcome: the key with the highest mean share.
    let primary_outcome = statistics
        .iter()
        .max_by_key(|(_, stat)| OrderedFloat(stat.mean))
        .map(|(key, _)| key.clone());

    // Mean final environment across runs.
    let mut environment_state = BTreeMap::new();
    let mut env_keys: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
    for (_, outcome) in completed {
        env_keys.extend(outcome.environment_state.keys());
    }
    for key in env_keys {
        let values: Vec<f64> = completed
            .iter()
            .map(|(_, o)| o.environment_state.get(key).copied().unwrap_or(0.0))
            .collect();
        environment_state.insert(key.clone(), mean(&values));
    }

    AggregatedOutcome {
        run_count: completed.len(),
        statistics,
        primary_outcome,
        environment_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::node::VariableChange;

    fn outcomes(primary: &str, p: f64) -> SimulationOutcomes {
        SimulationOutcomes {
            primary_outcome: primary.to_string(),
            primary_outcome_probability: p,
            outcome_distribution: [(primary.to_string(), p), ("other".to_string(), 1.0 - p)]
                .into_iter()
                .collect(),
            key_metrics: Vec::new(),
            environment_state: [("volatility".to_string(), 0.2)].into_iter().collect(),
        }
    }

    fn map_with_root() -> (UniverseMap, Node) {
        let map = UniverseMap::new();
        let root = map.create_root_node(ProjectId::new(), TenantId::new(), None);
        (map, root)
    }

    #[test]
    fn root_node_is_baseline_at_depth_zero() {
        let (_, root) = map_with_root();
        assert!(root.is_baseline);
        assert_eq!(root.depth, 0);
        assert_eq!(root.cumulative_probability, 1.0);
    }

    #[test]
    fn fork_creates_child_without_touching_parent() {
        let (map, root) = map_with_root();
        let before = serde_json::to_string(&map.get_node(root.id).unwrap()).unwrap();

        let (child, edge, patch) = map
            .fork_node(
                root.id,
                Intervention::variable_deltas(
                    [("engagement".to_string(), VariableChange::add(0.2))]
                        .into_iter()
                        .collect(),
                ),
                Some("boost engagement".to_string()),
            )
            .unwrap();

        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(edge.parent_id, root.id);
        assert_eq!(edge.child_id, child.id);
        assert!(
            (child.scenario_patch.as_ref().unwrap().variables["engagement"] - 0.2).abs() < 1e-12
        );
        assert_eq!(patch.edge_id, edge.id);

        let after = serde_json::to_string(&map.get_node(root.id).unwrap()).unwrap();
        assert_eq!(before, after, "parent must be byte-identical after fork");
    }

    #[test]
    fn empty_interventions_are_rejected() {
        let (map, root) = map_with_root();
        let result = map.fork_node(
            root.id,
            Intervention::VariableDelta {
                changes: BTreeMap::new(),
            },
            None,
        );
        assert!(result.is_err());
        assert!(map.child_ids(root.id).is_empty());
    }

    #[test]
    fn nl_fork_without_translator_creates_no_node() {
        let (map, root) = map_with_root();
        let result = map.fork_node(
            root.id,
            Intervention::NlQuery {
                query: "raise engagement a bit".to_string(),
            },
            None,
        );
        assert!(result.is_err());
        assert!(map.child_ids(root.id).is_empty());
    }

    #[test]
    fn nl_fork_with_translator_commits_translated_form() {
        struct FixedTranslator;
        impl NlPatchTranslator for FixedTranslator {
            fn translate(&self, _query: &str) -> WorldlineResult<Intervention> {
                Ok(Intervention::variable_deltas(
                    [("engagement".to_string(), VariableChange::add(0.1))]
                        .into_iter()
                        .collect(),
                ))
            }
        }

        let map = UniverseMap::new().with_translator(Arc::new(FixedTranslator));
        let root = map.create_root_node(ProjectId::new(), TenantId::new(), None);
        let (child, edge, _) = map
            .fork_node(
                root.id,
                Intervention::NlQuery {
                    query: "raise engagement a bit".to_string(),
                },
                None,
            )
            .unwrap();
        assert!(matches!(edge.intervention, Intervention::VariableDelta { .. }));
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn aggregation_folds_statistics_and_sets_confidence() {
        let (map, root) = map_with_root();
        let runs = vec![
            (RunId::new(), outcomes("choice_0", 0.9)),
            (RunId::new(), outcomes("choice_0", 0.7)),
        ];
        for (run_id, _) in &runs {
            map.add_run_ref(root.id, *run_id).unwrap();
        }

        let node = map.aggregate_runs(root.id, &runs, None).unwrap();
        let aggregate = node.aggregated_outcome.as_ref().unwrap();
        assert_eq!(aggregate.run_count, 2);
        let stat = &aggregate.statistics["choice_0"];
        assert!((stat.mean - 0.8).abs() < 1e-12);
        assert!((stat.min - 0.7).abs() < 1e-12);
        assert!((stat.max - 0.9).abs() < 1e-12);
        assert_eq!(stat.sample_count, 2);
        assert!((node.probability - 0.8).abs() < 1e-12);
        assert_eq!(node.confidence, Some(ConfidenceTier::High));
        assert_eq!(node.version, 1);
    }

    #[test]
    fn aggregation_marks_stale_below_min_ensemble() {
        let (map, root) = map_with_root();
        map.raise_min_ensemble(root.id, 5).unwrap();
        let runs = vec![(RunId::new(), outcomes("choice_0", 0.5))];
        let node = map.aggregate_runs(root.id, &runs, None).unwrap();
        assert!(node.is_stale);
        assert!(node.stale_reason.as_ref().unwrap().contains("1 of 5"));

        map.mark_refreshed(root.id).unwrap();
        assert!(!map.get_node(root.id).unwrap().is_stale);
    }

    #[test]
    fn cumulative_probability_multiplies_along_path() {
        let (map, root) = map_with_root();
        let (child, _, _) = map
            .fork_node(
                root.id,
                Intervention::variable_deltas(
                    [("x".to_string(), VariableChange::add(1.0))].into_iter().collect(),
                ),
                None,
            )
            .unwrap();
        let (grandchild, _, _) = map
            .fork_node(
                child.id,
                Intervention::variable_deltas(
                    [("y".to_string(), VariableChange::add(1.0))].into_iter().collect(),
                ),
                None,
            )
            .unwrap();

        map.aggregate_runs(child.id, &[(RunId::new(), outcomes("a", 0.5))], None)
            .unwrap();
        map.aggregate_runs(grandchild.id, &[(RunId::new(), outcomes("a", 0.4))], None)
            .unwrap();

        let grandchild = map.get_node(grandchild.id).unwrap();
        assert!((grandchild.cumulative_probability - 0.2).abs() < 1e-12);

        let paths = map.most_likely_paths(root.project_id, 3);
        assert_eq!(paths[0].node_ids.len(), 3);
        assert!((paths[0].cumulative_probability - 0.2).abs() < 1e-12);
    }

    #[test]
    fn compare_nodes_reports_side_by_side_statistics() {
        let (map, root) = map_with_root();
        let (child, _, _) = map
            .fork_node(
                root.id,
                Intervention::variable_deltas(
                    [("x".to_string(), VariableChange::add(1.0))].into_iter().collect(),
                ),
                Some("shift x".to_string()),
            )
            .unwrap();
        map.aggregate_runs(root.id, &[(RunId::new(), outcomes("a", 0.9))], None)
            .unwrap();

        let comparison = map.compare_nodes(&[root.id, child.id]).unwrap();
        assert_eq!(comparison.len(), 2);
        assert_eq!(comparison[0].run_count, 0);
        assert!((comparison[0].probability - 0.9).abs() < 1e-12);
        assert!(comparison[0].statistics.contains_key("a"));
        assert_eq!(comparison[1].depth, 1);
        assert!(comparison[1].statistics.is_empty());

        assert!(map.compare_nodes(&[NodeId::new()]).is_err());
    }

    #[test]
    fn subgraph_query_filters_depth_and_exploration() {
        let (map, root) = map_with_root();
        let (child, _, _) = map
            .fork_node(
                root.id,
                Intervention::variable_deltas(
                    [("x".to_string(), VariableChange::add(1.0))].into_iter().collect(),
                ),
                None,
            )
            .unwrap();
        map.add_run_ref(root.id, RunId::new()).unwrap();

        let all = map.get_universe_map_data(root.project_id, None, false);
        assert_eq!(all.nodes.len(), 2);
        assert_eq!(all.edges.len(), 1);

        let shallow = map.get_universe_map_data(root.project_id, Some(0), false);
        assert_eq!(shallow.nodes.len(), 1);

        let explored = map.get_universe_map_data(root.project_id, None, true);
        assert_eq!(explored.nodes.len(), 1);
        assert_eq!(explored.nodes[0].id, root.id);
        assert_ne!(explored.nodes[0].id, child.id);
    }
}
