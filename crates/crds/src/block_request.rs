//! BlockRequest CRD
//!
//! A node asks the pool manager for a new AddressBlock by creating a
//! BlockRequest. The pool manager answers through the status conditions.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "BlockRequest",
    status = "BlockRequestStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestSpec {
    /// Node that will own the block
    pub node_name: String,

    /// Pool to carve the block from
    pub pool_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestStatus {
    /// Name of the AddressBlock handed out for this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_block_name: Option<String>,

    /// Observed conditions
    #[serde(default)]
    pub conditions: Vec<BlockRequestCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequestCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: BlockRequestConditionType,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the condition changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum BlockRequestConditionType {
    /// A block has been allocated
    Complete,

    /// The request cannot be satisfied
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Decision carried by a BlockRequest status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// No controller has answered yet
    Pending,

    /// The named block was allocated
    Complete(String),

    /// The request failed; carries the controller's message
    Failed(String),
}

impl RequestOutcome {
    /// Whether the controller has answered
    pub fn is_decided(&self) -> bool {
        !matches!(self, RequestOutcome::Pending)
    }
}

impl BlockRequestStatus {
    /// Returns the condition of the given type, if present
    pub fn condition(&self, condition_type: BlockRequestConditionType) -> Option<&BlockRequestCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    fn is_true(&self, condition_type: BlockRequestConditionType) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Reads the outcome of the request.
    ///
    /// `Failed=True` takes priority over `Complete=True`; both may be present
    /// at the same time.
    pub fn outcome(&self) -> RequestOutcome {
        if self.is_true(BlockRequestConditionType::Failed) {
            let message = self
                .condition(BlockRequestConditionType::Failed)
                .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
                .unwrap_or_default();
            return RequestOutcome::Failed(message);
        }

        if self.is_true(BlockRequestConditionType::Complete) {
            if let Some(name) = &self.address_block_name {
                return RequestOutcome::Complete(name.clone());
            }
        }

        RequestOutcome::Pending
    }

    /// Sets a condition, bumping the transition time only when the status changes.
    pub fn set_condition(
        &mut self,
        condition_type: BlockRequestConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        let reason = (!reason.is_empty()).then(|| reason.to_string());
        let message = (!message.is_empty()).then(|| message.to_string());

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            existing.last_probe_time = Some(now);
            return;
        }

        self.conditions.push(BlockRequestCondition {
            condition_type,
            status,
            reason,
            message,
            last_probe_time: Some(now),
            last_transition_time: Some(now),
        });
    }
}

impl BlockRequest {
    /// Outcome of the request; pending when no status was written yet
    pub fn outcome(&self) -> RequestOutcome {
        self.status
            .as_ref()
            .map_or(RequestOutcome::Pending, BlockRequestStatus::outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(conditions: &[(BlockRequestConditionType, ConditionStatus)]) -> BlockRequestStatus {
        let mut status = BlockRequestStatus {
            address_block_name: Some("default-0".to_string()),
            conditions: Vec::new(),
        };
        for (t, s) in conditions {
            status.set_condition(*t, *s, "", "");
        }
        status
    }

    #[test]
    fn test_outcome_pending_without_conditions() {
        let status = BlockRequestStatus::default();
        assert_eq!(status.outcome(), RequestOutcome::Pending);
        assert!(!status.outcome().is_decided());
    }

    #[test]
    fn test_outcome_complete() {
        let status = status_with(&[(BlockRequestConditionType::Complete, ConditionStatus::True)]);
        assert_eq!(status.outcome(), RequestOutcome::Complete("default-0".to_string()));
    }

    #[test]
    fn test_failed_takes_priority_over_complete() {
        let mut status = status_with(&[
            (BlockRequestConditionType::Complete, ConditionStatus::True),
            (BlockRequestConditionType::Failed, ConditionStatus::True),
        ]);
        status.set_condition(
            BlockRequestConditionType::Failed,
            ConditionStatus::True,
            "ExhaustedPool",
            "no free block in pool default",
        );

        assert_eq!(
            status.outcome(),
            RequestOutcome::Failed("no free block in pool default".to_string())
        );
    }

    #[test]
    fn test_false_conditions_are_undecided() {
        let status = status_with(&[
            (BlockRequestConditionType::Complete, ConditionStatus::False),
            (BlockRequestConditionType::Failed, ConditionStatus::Unknown),
        ]);
        assert_eq!(status.outcome(), RequestOutcome::Pending);
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut status = BlockRequestStatus::default();
        status.set_condition(BlockRequestConditionType::Complete, ConditionStatus::False, "", "");
        let first = status.conditions[0].last_transition_time;

        status.set_condition(BlockRequestConditionType::Complete, ConditionStatus::False, "Waiting", "");
        assert_eq!(status.conditions[0].last_transition_time, first);
        assert_eq!(status.conditions[0].reason.as_deref(), Some("Waiting"));

        status.set_condition(BlockRequestConditionType::Complete, ConditionStatus::True, "", "");
        assert!(status.conditions[0].last_transition_time >= first);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_condition_type_serializes_as_type() {
        let status = status_with(&[(BlockRequestConditionType::Complete, ConditionStatus::True)]);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["conditions"][0]["type"], "Complete");
        assert_eq!(value["conditions"][0]["status"], "True");
        assert_eq!(value["addressBlockName"], "default-0");
    }
}
