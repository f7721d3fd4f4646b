//! C3 — Manipulation Engine.
//!
//! Ordered match-and-rewrite rules evaluated per frame, producing an
//! `(Action, payload, extra_delay_ms)` triple. Grounded directly on the
//! original `ManipulationEngine`/`ManipulationRule`/`ByteManipulation`
//! design: first-match-wins, DROP short-circuits before byte ops, DELAY
//! composes with byte ops.

use std::sync::RwLock;

use crate::direction::{Direction, RuleDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOpKind {
    Set,
    And,
    Or,
    Xor,
    Add,
    Sub,
}

/// One byte-level mutation. Out-of-range `index` is a silent no-op;
/// arithmetic wraps modulo 256.
#[derive(Debug, Clone, Copy)]
pub struct ByteOp {
    pub index: u8,
    pub op: ByteOpKind,
    pub value: u8,
}

impl ByteOp {
    pub fn apply(&self, data: &mut [u8]) {
        let i = self.index as usize;
        if i >= data.len() {
            return;
        }
        data[i] = match self.op {
            ByteOpKind::Set => self.value,
            ByteOpKind::And => data[i] & self.value,
            ByteOpKind::Or => data[i] | self.value,
            ByteOpKind::Xor => data[i] ^ self.value,
            ByteOpKind::Add => data[i].wrapping_add(self.value),
            ByteOpKind::Sub => data[i].wrapping_sub(self.value),
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Drop,
    Delay,
}

/// An ordered match-and-rewrite rule.
///
/// `can_id < 0` (modeled here as `None`) matches any arbitration id.
#[derive(Debug, Clone)]
pub struct ManipulationRule {
    pub name: String,
    pub can_id: Option<u32>,
    pub id_mask: u32,
    pub direction: RuleDirection,
    pub action: Action,
    pub byte_ops: Vec<ByteOp>,
    pub enabled: bool,
    pub extra_delay_ms: f32,
}

impl ManipulationRule {
    pub fn default_mask() -> u32 {
        0x7FF
    }

    fn matches(&self, arb_id: u32, msg_direction: Direction) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.direction.matches(msg_direction) {
            return false;
        }
        match self.can_id {
            None => true,
            Some(id) => (arb_id & self.id_mask) == (id & self.id_mask),
        }
    }

    /// DROP short-circuits without touching the payload; otherwise every
    /// byte_op is applied in list order to a mutable copy.
    fn apply(&self, data: &[u8]) -> (Action, Vec<u8>, f32) {
        if self.action == Action::Drop {
            return (Action::Drop, data.to_vec(), 0.0);
        }
        let mut out = data.to_vec();
        for op in &self.byte_ops {
            op.apply(&mut out);
        }
        let extra_delay = if self.action == Action::Delay {
            self.extra_delay_ms
        } else {
            0.0
        };
        (Action::Forward, out, extra_delay)
    }
}

/// Ordered, first-match-wins rule list with an engine-wide enable flag.
///
/// The rule list itself is stored behind an `RwLock` so mutation
/// (add/remove/clear/replace) is safely concurrent with the hot-path
/// evaluation: readers take a short read lock and clone the `Arc` (the
/// snapshot-swap discipline the source's "mutable while iterated" note
/// calls for), writers take the write lock only for the swap itself.
pub struct ManipulationEngine {
    enabled: std::sync::atomic::AtomicBool,
    rules: RwLock<Vec<ManipulationRule>>,
}

impl Default for ManipulationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ManipulationEngine {
    pub fn new() -> Self {
        Self {
            enabled: std::sync::atomic::AtomicBool::new(true),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn add_rule(&self, rule: ManipulationRule) {
        self.rules.write().unwrap().push(rule);
    }

    /// Returns `true` if a rule with that name was found and removed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().unwrap();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    pub fn clear_rules(&self) {
        self.rules.write().unwrap().clear();
    }

    pub fn get_rules(&self) -> Vec<ManipulationRule> {
        self.rules.read().unwrap().clone()
    }

    pub fn set_rules(&self, new_rules: Vec<ManipulationRule>) {
        *self.rules.write().unwrap() = new_rules;
    }

    /// `(arb_id, direction, payload) -> (action, payload, extra_delay_ms)`.
    ///
    /// Engine-disabled or no-match both forward the payload unchanged.
    pub fn process(&self, arb_id: u32, direction: Direction, payload: &[u8]) -> (Action, Vec<u8>, f32) {
        if !self.is_enabled() {
            return (Action::Forward, payload.to_vec(), 0.0);
        }
        let rules = self.rules.read().unwrap();
        for rule in rules.iter() {
            if rule.matches(arb_id, direction) {
                return rule.apply(payload);
            }
        }
        (Action::Forward, payload.to_vec(), 0.0)
    }

    /// Name of the first rule that would match, or `None`.
    pub fn get_matching_rule(&self, arb_id: u32, direction: Direction) -> Option<String> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|r| r.matches(arb_id, direction))
            .map(|r| r.name.clone())
    }
}

impl Clone for ManipulationRule {
    fn clone(&self) -> Self {
        ManipulationRule {
            name: self.name.clone(),
            can_id: self.can_id,
            id_mask: self.id_mask,
            direction: self.direction,
            action: self.action,
            byte_ops: self.byte_ops.clone(),
            enabled: self.enabled,
            extra_delay_ms: self.extra_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, can_id: Option<u32>, action: Action, ops: Vec<ByteOp>) -> ManipulationRule {
        ManipulationRule {
            name: name.to_string(),
            can_id,
            id_mask: ManipulationRule::default_mask(),
            direction: RuleDirection::Both,
            action,
            byte_ops: ops,
            enabled: true,
            extra_delay_ms: 0.0,
        }
    }

    #[test]
    fn no_rules_forwards_unchanged() {
        let engine = ManipulationEngine::new();
        let (action, data, delay) = engine.process(0x123, Direction::ZeroToOne, &[1, 2, 3]);
        assert_eq!(action, Action::Forward);
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn drop_rule_short_circuits_before_byte_ops() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule(
            "block",
            Some(0x123),
            Action::Drop,
            vec![ByteOp { index: 0, op: ByteOpKind::Set, value: 0xFF }],
        ));
        let (action, data, _) = engine.process(0x123, Direction::ZeroToOne, &[0x01]);
        assert_eq!(action, Action::Drop);
        assert_eq!(data, vec![0x01]); // untouched — DROP never applies byte_ops
    }

    #[test]
    fn first_match_wins() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule("first", Some(0x100), Action::Forward, vec![
            ByteOp { index: 0, op: ByteOpKind::Set, value: 0xAA },
        ]));
        engine.add_rule(rule("second", Some(0x100), Action::Forward, vec![
            ByteOp { index: 0, op: ByteOpKind::Set, value: 0xBB },
        ]));
        let (_, data, _) = engine.process(0x100, Direction::ZeroToOne, &[0x00]);
        assert_eq!(data, vec![0xAA]);
    }

    #[test]
    fn byte_rewrite_matches_scenario_5() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule("rewrite", Some(0x100), Action::Forward, vec![
            ByteOp { index: 0, op: ByteOpKind::Set, value: 0xFF },
            ByteOp { index: 1, op: ByteOpKind::Set, value: 0xAA },
        ]));
        let (action, data, _) = engine.process(0x100, Direction::ZeroToOne, &[0x01, 0x02]);
        assert_eq!(action, Action::Forward);
        assert_eq!(data, vec![0xFF, 0xAA]);
    }

    #[test]
    fn out_of_range_index_is_silent_noop() {
        let op = ByteOp { index: 10, op: ByteOpKind::Set, value: 0xFF };
        let mut data = vec![1, 2, 3];
        op.apply(&mut data);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn add_wraps_modulo_256() {
        let op = ByteOp { index: 0, op: ByteOpKind::Add, value: 10 };
        let mut data = vec![250];
        op.apply(&mut data);
        assert_eq!(data[0], 4);
    }

    #[test]
    fn sub_wraps_modulo_256() {
        let op = ByteOp { index: 0, op: ByteOpKind::Sub, value: 10 };
        let mut data = vec![5];
        op.apply(&mut data);
        assert_eq!(data[0], 251);
    }

    #[test]
    fn set_is_idempotent() {
        let op = ByteOp { index: 0, op: ByteOpKind::Set, value: 0x42 };
        let mut once = vec![0x00];
        let mut twice = vec![0x00];
        op.apply(&mut once);
        op.apply(&mut twice);
        op.apply(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn xor_applied_twice_is_identity() {
        let op = ByteOp { index: 0, op: ByteOpKind::Xor, value: 0x5A };
        let mut data = vec![0x37];
        let original = data.clone();
        op.apply(&mut data);
        op.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn delay_action_still_applies_byte_ops() {
        let mut r = rule("delay-rule", Some(0x200), Action::Delay, vec![
            ByteOp { index: 0, op: ByteOpKind::Set, value: 0x99 },
        ]);
        r.extra_delay_ms = 25.0;
        let engine = ManipulationEngine::new();
        engine.add_rule(r);
        let (action, data, delay) = engine.process(0x200, Direction::ZeroToOne, &[0x00]);
        assert_eq!(action, Action::Forward);
        assert_eq!(data, vec![0x99]);
        assert_eq!(delay, 25.0);
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut r = rule("off", Some(0x300), Action::Drop, vec![]);
        r.enabled = false;
        let engine = ManipulationEngine::new();
        engine.add_rule(r);
        let (action, _, _) = engine.process(0x300, Direction::ZeroToOne, &[]);
        assert_eq!(action, Action::Forward);
    }

    #[test]
    fn engine_disabled_forwards_everything() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule("block-all", None, Action::Drop, vec![]));
        engine.set_enabled(false);
        let (action, _, _) = engine.process(0x1, Direction::ZeroToOne, &[]);
        assert_eq!(action, Action::Forward);
    }

    #[test]
    fn remove_rule_reports_whether_found() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule("r1", None, Action::Forward, vec![]));
        assert!(engine.remove_rule("r1"));
        assert!(!engine.remove_rule("r1"));
    }

    #[test]
    fn negative_can_id_matches_any() {
        let engine = ManipulationEngine::new();
        engine.add_rule(rule("catch-all", None, Action::Drop, vec![]));
        let (action, _, _) = engine.process(0xDEAD, Direction::OneToZero, &[]);
        assert_eq!(action, Action::Drop);
    }
}
