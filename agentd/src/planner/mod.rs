//! Produces an ordered subtask list from an instruction (spec §4.6).
//! Grounded on the teacher's `loop/manager.rs` dependency-graph validation
//! shape (`validate_dependency_graph`/`has_cycle_dfs`) for cycle detection,
//! but the topological sort itself uses Kahn's algorithm rather than the
//! teacher's DFS-postorder — the spec calls for Kahn's explicitly, with
//! ties broken by the node's position in the original textual plan.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Subtask;
use crate::tools::{ToolInvoker, ToolName, invoke_with_retry};

#[derive(Debug, Clone)]
pub struct PlanResult {
    pub subtasks: Vec<Subtask>,
    /// Set when the DAG translation was malformed or cyclic and the planner
    /// degraded to linear plan order.
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DagGraph {
    #[serde(default)]
    nodes: Vec<String>,
    #[serde(default)]
    edges: Vec<DagEdge>,
}

#[derive(Debug, Deserialize)]
struct DagEdge {
    from: String,
    to: String,
}

pub struct Planner {
    tool_invoker: Arc<dyn ToolInvoker>,
}

impl Planner {
    pub fn new(tool_invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { tool_invoker }
    }

    pub async fn initial_plan(
        &self,
        instruction: &str,
        observation: Option<Vec<u8>>,
        retrieved_knowledge: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PlanResult, crate::error::ServiceError> {
        let prompt = match retrieved_knowledge {
            Some(knowledge) => format!("{instruction}\n\nRelevant knowledge:\n{knowledge}"),
            None => instruction.to_string(),
        };
        self.plan_from_prompt(&prompt, observation, cancel).await
    }

    pub async fn replan(
        &self,
        instruction: &str,
        observation: Option<Vec<u8>>,
        completed: &[Subtask],
        failed: &[Subtask],
        remaining: &[Subtask],
        cancel: &CancellationToken,
    ) -> Result<PlanResult, crate::error::ServiceError> {
        let completed_names: Vec<&str> = completed.iter().map(|s| s.name.as_str()).collect();
        let failed_names: Vec<&str> = failed.iter().map(|s| s.name.as_str()).collect();
        let remaining_names: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
        let prompt = format!(
            "{instruction}\n\nProgress so far:\ncompleted: {}\nfailed: {}\nabandoned remaining: {}",
            completed_names.join(", "),
            failed_names.join(", "),
            remaining_names.join(", "),
        );
        self.plan_from_prompt(&prompt, observation, cancel).await
    }

    async fn plan_from_prompt(
        &self,
        prompt: &str,
        observation: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<PlanResult, crate::error::ServiceError> {
        let plan_invocation = invoke_with_retry(|| {
            self.tool_invoker
                .invoke(ToolName::SubtaskPlanner, prompt, observation.clone(), cancel)
        })
        .await?;
        let linear = parse_textual_plan(&plan_invocation.text);
        if linear.is_empty() {
            return Ok(PlanResult {
                subtasks: Vec::new(),
                warning: Some("planner tool returned no subtasks".to_string()),
            });
        }

        let dag_prompt = linear
            .iter()
            .map(|s| format!("{}: {}", s.name, s.info))
            .collect::<Vec<_>>()
            .join("\n");
        let dag_invocation = invoke_with_retry(|| {
            self.tool_invoker.invoke(ToolName::DagTranslator, &dag_prompt, None, cancel)
        })
        .await?;

        match topo_sort_from_json(&dag_invocation.text, &linear) {
            Ok(ordered) => Ok(PlanResult {
                subtasks: ordered,
                warning: None,
            }),
            Err(reason) => {
                warn!(reason = %reason, "Planner: DAG translation degraded to linear order");
                Ok(PlanResult {
                    subtasks: linear,
                    warning: Some(reason),
                })
            }
        }
    }
}

/// Parses a newline-delimited ordered plan into [`Subtask`]s. Each line is
/// `name` or `name: info` or `name - info`; blank lines and leading
/// enumeration markers (`1.`, `-`, `*`) are stripped.
fn parse_textual_plan(text: &str) -> Vec<Subtask> {
    text.lines()
        .map(str::trim)
        .map(strip_enumeration_marker)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if let Some((name, info)) = line.split_once(':').or_else(|| line.split_once(" - ")) {
                Subtask::new(name.trim(), info.trim())
            } else {
                Subtask::new(line, line)
            }
        })
        .collect()
}

fn strip_enumeration_marker(line: &str) -> &str {
    let trimmed = line.trim_start_matches(['-', '*']).trim_start();
    match trimmed.split_once('.') {
        Some((prefix, rest)) if prefix.chars().all(|c| c.is_ascii_digit()) && !prefix.is_empty() => rest.trim_start(),
        _ => trimmed,
    }
}

/// Parses `{nodes, edges}` JSON and returns a Kahn's-algorithm topological
/// order over `linear`, falling back with `Err(reason)` on malformed JSON,
/// an unknown node reference, or a cycle.
fn topo_sort_from_json(json_text: &str, linear: &[Subtask]) -> Result<Vec<Subtask>, String> {
    let graph: DagGraph = serde_json::from_str(json_text).map_err(|e| format!("malformed DAG JSON: {e}"))?;
    if graph.nodes.is_empty() {
        return Err("DAG translator returned no nodes".to_string());
    }

    let original_index: HashMap<&str, usize> =
        linear.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect();
    let node_set: HashSet<&str> = graph.nodes.iter().map(String::as_str).collect();

    let mut in_degree: HashMap<&str, u32> = graph.nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        if !node_set.contains(edge.from.as_str()) || !node_set.contains(edge.to.as_str()) {
            return Err(format!("edge references unknown node ({} -> {})", edge.from, edge.to));
        }
        *in_degree.get_mut(edge.to.as_str()).unwrap() += 1;
        successors.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    let tie_break = |name: &str| original_index.get(name).copied().unwrap_or(usize::MAX);

    let mut ready: BinaryHeap<Reverse<(usize, String)>> = graph
        .nodes
        .iter()
        .filter(|n| in_degree[n.as_str()] == 0)
        .map(|n| Reverse((tie_break(n), n.clone())))
        .collect();

    let mut ordered_names = Vec::with_capacity(graph.nodes.len());
    while let Some(Reverse((_, name))) = ready.pop() {
        ordered_names.push(name.clone());
        if let Some(succs) = successors.get(name.as_str()) {
            for succ in succs {
                let degree = in_degree.get_mut(succ).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((tie_break(succ), (*succ).to_string())));
                }
            }
        }
    }

    if ordered_names.len() != graph.nodes.len() {
        return Err("dependency graph contains a cycle".to_string());
    }

    let by_name: HashMap<&str, &Subtask> = linear.iter().map(|s| (s.name.as_str(), s)).collect();
    debug!(order = ?ordered_names, "Planner: Kahn's algorithm topological order");
    Ok(ordered_names
        .into_iter()
        .filter_map(|name| by_name.get(name.as_str()).map(|s| (*s).clone()))
        .collect())
}
