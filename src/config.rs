//! `gateway.toml` configuration for can-gw.

use anyhow::{Context, Result};
use can_gw_core::{Action, ByteOp, ByteOpKind, Direction, RuleDirection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayFileConfig {
    pub iface0: String,
    pub iface1: String,

    #[serde(default)]
    pub delay_ms: f32,
    #[serde(default)]
    pub jitter_ms: f32,
    #[serde(default)]
    pub loss_pct: f32,

    #[serde(default = "GatewayFileConfig::default_enable")]
    pub enable_0to1: bool,
    #[serde(default = "GatewayFileConfig::default_enable")]
    pub enable_1to0: bool,

    /// Directory to write the `.blf`/`.csv` capture pair into. Omit to
    /// disable capture.
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub log_name: Option<String>,

    /// Path the daemon writes its periodic JSON status snapshot to.
    #[serde(default = "GatewayFileConfig::default_status_log")]
    pub status_log: String,
    #[serde(default = "GatewayFileConfig::default_status_interval")]
    pub status_interval_secs: u64,

    /// Rules seeded at startup. Persisting the *running* rule set back
    /// to disk is out of scope — this list only ever flows one way, in.
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleEntry {
    pub name: String,
    /// Arbitration id to match; omit to match any id.
    #[serde(default)]
    pub can_id: Option<u32>,
    #[serde(default = "RuleEntry::default_mask")]
    pub id_mask: u32,
    /// "0to1", "1to0", or "both".
    #[serde(default = "RuleEntry::default_direction")]
    pub direction: String,
    /// "forward", "drop", or "delay".
    pub action: String,
    #[serde(default)]
    pub extra_delay_ms: f32,
    #[serde(default)]
    pub byte_ops: Vec<ByteOpEntry>,
    #[serde(default = "RuleEntry::default_enabled")]
    pub enabled: bool,
}

impl RuleEntry {
    fn default_mask() -> u32 {
        0x7FF
    }
    fn default_direction() -> String {
        "both".into()
    }
    fn default_enabled() -> bool {
        true
    }

    pub fn into_rule(self) -> Result<can_gw_core::ManipulationRule> {
        let direction = Direction::parse(&self.direction)
            .with_context(|| format!("rule {:?}: unknown direction {:?}", self.name, self.direction))?;
        let action = match self.action.as_str() {
            "forward" => Action::Forward,
            "drop" => Action::Drop,
            "delay" => Action::Delay,
            other => anyhow::bail!("rule {:?}: unknown action {:?}", self.name, other),
        };
        Ok(can_gw_core::ManipulationRule {
            name: self.name,
            can_id: self.can_id,
            id_mask: self.id_mask,
            direction,
            action,
            byte_ops: self.byte_ops.into_iter().map(ByteOpEntry::into_op).collect::<Result<_>>()?,
            enabled: self.enabled,
            extra_delay_ms: self.extra_delay_ms,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ByteOpEntry {
    pub index: u8,
    /// "set", "and", "or", "xor", "add", or "sub".
    pub op: String,
    pub value: u8,
}

impl ByteOpEntry {
    fn into_op(self) -> Result<ByteOp> {
        let op = match self.op.as_str() {
            "set" => ByteOpKind::Set,
            "and" => ByteOpKind::And,
            "or" => ByteOpKind::Or,
            "xor" => ByteOpKind::Xor,
            "add" => ByteOpKind::Add,
            "sub" => ByteOpKind::Sub,
            other => anyhow::bail!("unknown byte op {:?}", other),
        };
        Ok(ByteOp { index: self.index, op, value: self.value })
    }
}

impl GatewayFileConfig {
    fn default_enable() -> bool {
        true
    }
    fn default_status_log() -> String {
        "/var/log/can-gw.jsonl".into()
    }
    fn default_status_interval() -> u64 {
        5
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A runnable vcan0<->vcan1 example, good for `can-gw init`.
    pub fn default_example() -> Self {
        Self {
            iface0: "vcan0".into(),
            iface1: "vcan1".into(),
            delay_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            enable_0to1: true,
            enable_1to0: true,
            log_path: None,
            log_name: None,
            status_log: Self::default_status_log(),
            status_interval_secs: Self::default_status_interval(),
            rules: vec![RuleEntry {
                name: "example-drop".into(),
                can_id: Some(0x123),
                id_mask: RuleEntry::default_mask(),
                direction: "0to1".into(),
                action: "drop".into(),
                extra_delay_ms: 0.0,
                byte_ops: vec![],
                enabled: false,
            }],
        }
    }
}
