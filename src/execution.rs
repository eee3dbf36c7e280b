//! Execution context: hierarchical agent identity for a single run.
//!
//! An [`ExecutionContext`] is created once per [`Agent::run`](crate::Agent::run)
//! and attached to every event that run emits. Sub-agents derive a child
//! context from their parent via [`ExecutionContext::child`], extending the
//! agent chain and incrementing the depth, so an observer at the root can
//! tell which agent in the hierarchy produced any given event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the agent that produced an event, within one run hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Display name of the agent.
    pub agent_name: String,
    /// Hierarchical id: `parent_id-name-rand8hex` (root omits the parent part).
    pub agent_id: String,
    /// Id of the parent agent, when this is a sub-agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    /// Agent names from the root to this agent, inclusive.
    pub agent_chain: Vec<String>,
    /// Nesting depth; 0 at the root.
    pub depth: u32,
}

impl ExecutionContext {
    /// Creates a root context for a new run.
    pub fn root(agent_name: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        let agent_id = format!("{}-{}", agent_name, rand_suffix());
        Self {
            agent_chain: vec![agent_name.clone()],
            agent_name,
            agent_id,
            parent_agent_id: None,
            depth: 0,
        }
    }

    /// Derives a child context for a sub-agent of this agent.
    ///
    /// The child id embeds the full parent id, so ids remain unique and
    /// self-describing across arbitrarily deep hierarchies.
    pub fn child(&self, agent_name: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        let agent_id = format!("{}-{}-{}", self.agent_id, agent_name, rand_suffix());
        let mut agent_chain = self.agent_chain.clone();
        agent_chain.push(agent_name.clone());
        Self {
            agent_name,
            agent_id,
            parent_agent_id: Some(self.agent_id.clone()),
            agent_chain,
            depth: self.depth + 1,
        }
    }

    /// True when this context belongs to a sub-agent rather than the root.
    pub fn is_sub_agent(&self) -> bool {
        self.depth > 0
    }
}

/// Eight hex characters of randomness, enough to disambiguate repeated runs
/// of the same agent without making ids unreadable.
fn rand_suffix() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_context() {
        let ctx = ExecutionContext::root("Root");
        assert_eq!(ctx.agent_name, "Root");
        assert_eq!(ctx.depth, 0);
        assert!(!ctx.is_sub_agent());
        assert_eq!(ctx.agent_chain, vec!["Root".to_string()]);
        assert!(ctx.parent_agent_id.is_none());
        assert!(ctx.agent_id.starts_with("Root-"));
        // name + dash + 8 hex chars
        assert_eq!(ctx.agent_id.len(), "Root-".len() + 8);
    }

    #[test]
    fn test_child_context_extends_chain() {
        let root = ExecutionContext::root("Root");
        let child = root.child("Child");

        assert_eq!(child.depth, 1);
        assert!(child.is_sub_agent());
        assert_eq!(
            child.agent_chain,
            vec!["Root".to_string(), "Child".to_string()]
        );
        assert_eq!(child.parent_agent_id.as_deref(), Some(root.agent_id.as_str()));
        assert!(child.agent_id.starts_with(&format!("{}-Child-", root.agent_id)));
    }

    #[test]
    fn test_grandchild_depth() {
        let root = ExecutionContext::root("A");
        let grandchild = root.child("B").child("C");
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.agent_chain, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_ids_are_unique_per_run() {
        let a = ExecutionContext::root("Root");
        let b = ExecutionContext::root("Root");
        assert_ne!(a.agent_id, b.agent_id);
    }
}
