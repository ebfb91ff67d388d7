use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SYNCED_INSTRUCTION_BUDGET: u64 = 5_000_000;
pub const DEFAULT_UNSYNCED_BUDGET_MS: u64 = 16;
pub const DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
pub const DEFAULT_BRIDGE_CAPACITY: usize = 4_096;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Instructions a single deterministic call-in may execute. Counted, never timed, so every
    /// peer aborts at the same point.
    pub synced_instruction_budget: u64,
    pub unsynced_budget_ms: u64,
    pub instruction_interval: u32,
    pub bridge_capacity: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            synced_instruction_budget: env_u64(
                "LOCKSTEP_SYNCED_INSTRUCTION_BUDGET",
                DEFAULT_SYNCED_INSTRUCTION_BUDGET,
            )
            .max(1_000),
            unsynced_budget_ms: env_u64("LOCKSTEP_UNSYNCED_BUDGET_MS", DEFAULT_UNSYNCED_BUDGET_MS)
                .max(1),
            instruction_interval: env_u64(
                "LOCKSTEP_SCRIPT_HOOK_INSTRUCTION_INTERVAL",
                DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL as u64,
            )
            .clamp(100, 1_000_000) as u32,
            bridge_capacity: env_u64("LOCKSTEP_BRIDGE_CAPACITY", DEFAULT_BRIDGE_CAPACITY as u64)
                .clamp(16, 1 << 20) as usize,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn script_limits() -> &'static ScriptLimits {
    static LIMITS: OnceLock<ScriptLimits> = OnceLock::new();
    LIMITS.get_or_init(ScriptLimits::default)
}

/// How a message that both contexts may claim is routed after the deterministic context has
/// seen it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageRouting {
    /// The presentation context is skipped once the deterministic context claims the message.
    ShortCircuit,
    /// The presentation context always receives the message.
    #[default]
    Broadcast,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleConfig {
    #[serde(default = "default_limits")]
    pub limits: ScriptLimits,
    #[serde(default = "default_chat_routing")]
    pub chat_routing: MessageRouting,
    #[serde(default)]
    pub lua_msg_routing: MessageRouting,
}

fn default_limits() -> ScriptLimits {
    *script_limits()
}

fn default_chat_routing() -> MessageRouting {
    MessageRouting::ShortCircuit
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            limits: default_limits(),
            chat_routing: default_chat_routing(),
            lua_msg_routing: MessageRouting::Broadcast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_config_fills_missing_fields_with_defaults() {
        let config: HandleConfig =
            serde_json::from_str(r#"{ "lua_msg_routing": "short_circuit" }"#).expect("parse");
        assert_eq!(config.chat_routing, MessageRouting::ShortCircuit);
        assert_eq!(config.lua_msg_routing, MessageRouting::ShortCircuit);
        assert_eq!(config.limits, *script_limits());
    }

    #[test]
    fn env_u64_ignores_garbage() {
        assert_eq!(env_u64("LOCKSTEP_TEST_UNSET_VARIABLE", 7), 7);
    }
}
