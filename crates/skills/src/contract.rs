//! Skill contract shapes.
//!
//! A contract is the declarative allow/deny/budget document for a named
//! mode of operation. Contracts are loaded from the catalog directory at
//! startup and immutable for the process lifetime.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillTools {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
}

impl SkillTools {
    pub fn allows(&self, tool: &str) -> bool {
        self.required.iter().any(|t| t == tool) || self.optional.iter().any(|t| t == tool)
    }

    pub fn denies(&self, tool: &str) -> bool {
        self.denied.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillBudget {
    #[serde(default)]
    pub max_tool_calls: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillContract {
    pub name: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub anti_tags: Vec<String>,
    #[serde(default)]
    pub tools: SkillTools,
    #[serde(default)]
    pub budget: SkillBudget,
    /// Output names that must be satisfied before the skill completes.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Skills this one may run alongside.
    #[serde(default)]
    pub composable_with: Vec<String>,
    /// Skills whose outputs this one consumes.
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub stability: String,
    #[serde(default)]
    pub cost_hint: String,
}

impl SkillContract {
    /// Composition check: either side declaring the other is enough.
    pub fn composable_with(&self, other: &SkillContract) -> bool {
        self.composable_with.iter().any(|n| n == &other.name)
            || other.composable_with.iter().any(|n| n == &self.name)
    }
}

/// An output value satisfies its slot when it is non-empty in its kind:
/// trimmed non-empty string, non-empty array, finite number, non-empty
/// object, or any boolean.
pub fn output_satisfied(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().is_some_and(f64::is_finite),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Bool(_) => true,
        serde_json::Value::Null => false,
    }
}
