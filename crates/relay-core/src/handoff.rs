//! Handoff graph
//!
//! A directed graph of allowed agent-to-agent transfers. Each edge carries a
//! human-readable condition that becomes the description of the
//! `Handoff-transfer_to_<Agent>` function offered to the source agent.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::AgentRegistry;
use crate::error::{OrchestrationError, Result};
use crate::providers::ToolDefinition;
use crate::tools::json_schema;

/// Prefix of the function an agent calls to hand the conversation over
pub const TRANSFER_PREFIX: &str = "Handoff-transfer_to_";

/// Function an agent calls to end the orchestration
pub const COMPLETE_TASK: &str = "Handoff-complete_task";

/// Argument of [`COMPLETE_TASK`] carrying the summary returned to the caller
pub const TASK_SUMMARY_ARG: &str = "task_summary";

/// One allowed transfer out of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffEdge {
    pub target: String,
    pub description: String,
}

/// What a reserved function call asks the orchestrator to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffAction {
    Transfer(String),
    Complete,
}

impl HandoffAction {
    /// Recognize a reserved handoff function name
    pub fn parse(function_name: &str) -> Option<Self> {
        if function_name == COMPLETE_TASK {
            return Some(Self::Complete);
        }
        function_name
            .strip_prefix(TRANSFER_PREFIX)
            .filter(|target| !target.is_empty())
            .map(|target| Self::Transfer(target.to_string()))
    }
}

/// Extract the summary argument of a completion call. `None` when it is
/// missing or not a string.
pub fn task_summary(arguments: &Value) -> Option<String> {
    arguments
        .get(TASK_SUMMARY_ARG)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Directed graph of allowed transfers, keyed by source agent
#[derive(Debug, Clone, Default)]
pub struct HandoffGraph {
    /// Agents edges may reference; `None` defers the check to `validate`
    known: Option<HashSet<String>>,
    edges: BTreeMap<String, Vec<HandoffEdge>>,
}

impl HandoffGraph {
    /// Graph whose edges are checked against `registry` as they are added
    pub fn new(registry: &AgentRegistry) -> Self {
        Self {
            known: Some(registry.names().into_iter().map(String::from).collect()),
            edges: BTreeMap::new(),
        }
    }

    /// Graph with no registry attached. Call [`HandoffGraph::validate`]
    /// before use.
    pub fn unchecked() -> Self {
        Self::default()
    }

    fn check(&self, agent: &str) -> Result<()> {
        match &self.known {
            Some(known) if !known.contains(agent) => Err(OrchestrationError::InvalidReference {
                agent: agent.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Allow `source` to transfer to `target`. Adding an existing edge
    /// replaces its description.
    pub fn add(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        self.insert(source.into(), target.into(), description.into())?;
        Ok(self)
    }

    /// Allow `source` to transfer to each of `targets`
    pub fn add_many<I, T, D>(mut self, source: impl Into<String>, targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (T, D)>,
        T: Into<String>,
        D: Into<String>,
    {
        let source = source.into();
        for (target, description) in targets {
            self.insert(source.clone(), target.into(), description.into())?;
        }
        Ok(self)
    }

    fn insert(&mut self, source: String, target: String, description: String) -> Result<()> {
        self.check(&source)?;
        self.check(&target)?;
        debug!("Handoff edge: {} -> {}", source, target);

        let edges = self.edges.entry(source).or_default();
        match edges.iter_mut().find(|e| e.target == target) {
            Some(edge) => edge.description = description,
            None => edges.push(HandoffEdge {
                target,
                description,
            }),
        }
        Ok(())
    }

    /// Outgoing edges of `source`, in insertion order
    pub fn targets(&self, source: &str) -> &[HandoffEdge] {
        self.edges.get(source).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn allows(&self, source: &str, target: &str) -> bool {
        self.targets(source).iter().any(|e| e.target == target)
    }

    /// All edges as `(source, edge)` pairs
    pub fn edges(&self) -> impl Iterator<Item = (&str, &HandoffEdge)> {
        self.edges
            .iter()
            .flat_map(|(source, edges)| edges.iter().map(move |e| (source.as_str(), e)))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Check every edge and the entry agent against `registry`. Agents that
    /// cannot be reached from `entry` are reported as warnings.
    pub fn validate(&mut self, registry: &AgentRegistry, entry: &str) -> Result<()> {
        self.known = Some(registry.names().into_iter().map(String::from).collect());
        self.check(entry)?;
        for (source, edge) in self.edges() {
            self.check(source)?;
            self.check(&edge.target)?;
        }

        let reachable = self.reachable_from(entry);
        for name in registry.names() {
            if !reachable.contains(name) {
                warn!("Agent '{}' is not reachable from entry agent '{}'", name, entry);
            }
        }
        Ok(())
    }

    fn reachable_from<'a>(&'a self, entry: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([entry]);
        let mut queue = VecDeque::from([entry]);
        while let Some(agent) = queue.pop_front() {
            for edge in self.targets(agent) {
                if seen.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        seen
    }

    /// Reserved functions offered to `agent`: one transfer per outgoing
    /// edge, plus task completion
    pub fn tool_definitions(&self, agent: &str) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .targets(agent)
            .iter()
            .map(|edge| ToolDefinition {
                name: format!("{}{}", TRANSFER_PREFIX, edge.target),
                description: edge.description.clone(),
                input_schema: json_schema(serde_json::json!({}), vec![]),
            })
            .collect();

        tools.push(ToolDefinition {
            name: COMPLETE_TASK.to_string(),
            description: "Complete the task with a summary when the customer's request has been fully handled.".to_string(),
            input_schema: json_schema(
                serde_json::json!({
                    "task_summary": {
                        "type": "string",
                        "description": "A short summary of how the task was resolved"
                    }
                }),
                vec![TASK_SUMMARY_ARG],
            ),
        });
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDefinition;

    fn registry() -> AgentRegistry {
        AgentRegistry::from_agents([
            AgentDefinition::new("SupportAgent"),
            AgentDefinition::new("OrderStatusAgent"),
            AgentDefinition::new("RefundAgent"),
            AgentDefinition::new("OrderReturnAgent"),
        ])
        .unwrap()
    }

    fn support_graph(registry: &AgentRegistry) -> HandoffGraph {
        HandoffGraph::new(registry)
            .add_many(
                "SupportAgent",
                [
                    ("OrderStatusAgent", "Transfer to this agent if the issue is order status related"),
                    ("RefundAgent", "Transfer to this agent if the issue is refund related"),
                    ("OrderReturnAgent", "Transfer to this agent if the issue is return related"),
                ],
            )
            .unwrap()
            .add("OrderStatusAgent", "SupportAgent", "Transfer to this agent if the issue is not order status related")
            .unwrap()
            .add("RefundAgent", "SupportAgent", "Transfer to this agent if the issue is not refund related")
            .unwrap()
            .add("OrderReturnAgent", "SupportAgent", "Transfer to this agent if the issue is not return related")
            .unwrap()
    }

    #[test]
    fn test_targets_and_allows() {
        let registry = registry();
        let graph = support_graph(&registry);

        assert_eq!(graph.edge_count(), 6);
        let targets: Vec<&str> = graph
            .targets("SupportAgent")
            .iter()
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(targets, vec!["OrderStatusAgent", "RefundAgent", "OrderReturnAgent"]);

        assert!(graph.allows("OrderStatusAgent", "SupportAgent"));
        assert!(!graph.allows("RefundAgent", "OrderReturnAgent"));
        assert!(graph.targets("Nobody").is_empty());
    }

    #[test]
    fn test_unknown_agent_is_invalid_reference() {
        let registry = registry();
        let err = HandoffGraph::new(&registry)
            .add("SupportAgent", "TriageAgent", "nope")
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidReference { agent } if agent == "TriageAgent"));

        let err = HandoffGraph::new(&registry)
            .add_many("Ghost", [("SupportAgent", "x")])
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidReference { agent } if agent == "Ghost"));
    }

    #[test]
    fn test_re_adding_edge_replaces_description() {
        let registry = registry();
        let graph = HandoffGraph::new(&registry)
            .add("SupportAgent", "RefundAgent", "old")
            .unwrap()
            .add("SupportAgent", "RefundAgent", "new")
            .unwrap();
        assert_eq!(graph.targets("SupportAgent").len(), 1);
        assert_eq!(graph.targets("SupportAgent")[0].description, "new");
    }

    #[test]
    fn test_validate_unchecked_graph() {
        let registry = registry();
        let mut graph = HandoffGraph::unchecked()
            .add("SupportAgent", "RefundAgent", "refunds")
            .unwrap();
        assert!(graph.validate(&registry, "SupportAgent").is_ok());

        let mut bad = HandoffGraph::unchecked()
            .add("SupportAgent", "BillingAgent", "billing")
            .unwrap();
        assert!(matches!(
            bad.validate(&registry, "SupportAgent"),
            Err(OrchestrationError::InvalidReference { .. })
        ));

        let mut graph = support_graph(&registry);
        assert!(matches!(
            graph.validate(&registry, "Ghost"),
            Err(OrchestrationError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_reachability() {
        let registry = registry();
        let graph = HandoffGraph::new(&registry)
            .add("SupportAgent", "RefundAgent", "refunds")
            .unwrap();
        let reachable = graph.reachable_from("SupportAgent");
        assert!(reachable.contains("RefundAgent"));
        assert!(!reachable.contains("OrderReturnAgent"));
    }

    #[test]
    fn test_tool_definitions() {
        let registry = registry();
        let graph = support_graph(&registry);

        let tools = graph.tool_definitions("OrderStatusAgent");
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Handoff-transfer_to_SupportAgent", "Handoff-complete_task"]);
        assert_eq!(
            tools[0].description,
            "Transfer to this agent if the issue is not order status related"
        );
        assert_eq!(tools[1].input_schema["required"][0], "task_summary");
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(
            HandoffAction::parse("Handoff-transfer_to_RefundAgent"),
            Some(HandoffAction::Transfer("RefundAgent".to_string()))
        );
        assert_eq!(HandoffAction::parse("Handoff-complete_task"), Some(HandoffAction::Complete));
        assert_eq!(HandoffAction::parse("Handoff-transfer_to_"), None);
        assert_eq!(HandoffAction::parse("OrderStatusPlugin-check_order_status"), None);
    }

    #[test]
    fn test_task_summary_argument() {
        let args = serde_json::json!({"task_summary": "Order 123 returned."});
        assert_eq!(task_summary(&args).as_deref(), Some("Order 123 returned."));
        assert_eq!(task_summary(&serde_json::json!({})), None);
        assert_eq!(task_summary(&serde_json::json!({"task_summary": 42})), None);
    }
}
