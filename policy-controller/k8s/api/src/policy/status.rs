use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Statistics about a policy's executions, maintained by the controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Average time spent evaluating the policy against a resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub average_execution_time: String,

    #[serde(default)]
    pub violation_count: u64,

    #[serde(default)]
    pub rules_failed_count: u64,

    #[serde(default)]
    pub rules_applied_count: u64,

    #[serde(default)]
    pub resources_blocked_count: u64,

    #[serde(default)]
    pub resources_mutated_count: u64,

    #[serde(default)]
    pub resources_generated_count: u64,

    #[serde(default, rename = "ruleStatus", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleStats>,
}

/// Per-rule statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    #[serde(rename = "ruleName")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub average_execution_time: String,

    #[serde(default)]
    pub violation_count: u64,

    #[serde(default)]
    pub failed_count: u64,

    #[serde(default)]
    pub applied_count: u64,

    #[serde(default)]
    pub resources_blocked_count: u64,

    #[serde(default)]
    pub resources_mutated_count: u64,

    #[serde(default)]
    pub resources_generated_count: u64,
}
