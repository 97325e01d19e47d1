//! Tool permission policy.
//!
//! Per-trigger ceilings: chat→L3, heartbeat→L0, cron→L0. Autonomous
//! triggers may exceed their ceiling only for tools named in their
//! explicit-enable list; a non-empty list on chat restricts instead.

use warren_domain::tool::{PermissionLevel, TriggerType};

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ToolPolicyEngine;

impl ToolPolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn is_allowed(
        &self,
        tool_name: &str,
        permission_level: PermissionLevel,
        trigger: TriggerType,
        explicit_enabled_tools: &[String],
    ) -> PolicyDecision {
        if trigger.is_autonomous() {
            if explicit_enabled_tools.iter().any(|t| t == tool_name) {
                return PolicyDecision::allow("allowed_via_explicit_enable");
            }
        } else if !explicit_enabled_tools.is_empty()
            && !explicit_enabled_tools.iter().any(|t| t == tool_name)
        {
            return PolicyDecision::deny(format!(
                "tool '{tool_name}' is not in the explicit enabled set"
            ));
        }

        let max_level = trigger.max_permission_level();
        if permission_level > max_level {
            return PolicyDecision::deny(format!(
                "permission level {} exceeds max {} for trigger '{trigger}'",
                permission_level.name(),
                max_level.name(),
            ));
        }

        PolicyDecision::allow("allowed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_EXPLICIT: &[String] = &[];

    #[test]
    fn chat_allows_up_to_system() {
        let policy = ToolPolicyEngine::new();
        for level in [
            PermissionLevel::L0Read,
            PermissionLevel::L1Write,
            PermissionLevel::L2Network,
            PermissionLevel::L3System,
        ] {
            assert!(
                policy
                    .is_allowed("x", level, TriggerType::Chat, NO_EXPLICIT)
                    .allowed
            );
        }
    }

    #[test]
    fn autonomous_triggers_cap_at_read() {
        let policy = ToolPolicyEngine::new();
        for trigger in [TriggerType::Heartbeat, TriggerType::Cron] {
            assert!(
                policy
                    .is_allowed("read_file", PermissionLevel::L0Read, trigger, NO_EXPLICIT)
                    .allowed
            );
            for level in [
                PermissionLevel::L1Write,
                PermissionLevel::L2Network,
                PermissionLevel::L3System,
            ] {
                let decision = policy.is_allowed("x", level, trigger, NO_EXPLICIT);
                assert!(!decision.allowed, "{trigger} must deny {}", level.name());
            }
        }
    }

    #[test]
    fn explicit_enable_bypasses_the_ceiling_for_autonomous() {
        let policy = ToolPolicyEngine::new();
        let enabled = vec!["terminal".to_string()];
        let decision = policy.is_allowed(
            "terminal",
            PermissionLevel::L3System,
            TriggerType::Cron,
            &enabled,
        );
        assert!(decision.allowed);
        assert_eq!(decision.reason, "allowed_via_explicit_enable");
    }

    #[test]
    fn chat_explicit_list_restricts_rather_than_grants() {
        let policy = ToolPolicyEngine::new();
        let enabled = vec!["read_file".to_string()];
        assert!(
            policy
                .is_allowed("read_file", PermissionLevel::L0Read, TriggerType::Chat, &enabled)
                .allowed
        );
        assert!(
            !policy
                .is_allowed("terminal", PermissionLevel::L3System, TriggerType::Chat, &enabled)
                .allowed
        );
    }
}
