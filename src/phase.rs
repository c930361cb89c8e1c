//! Phase controller
//!
//! Watches completed AI responses for `<signals>…</signals>` blocks, turns
//! their JSON payloads into Signals, and evaluates the phase profile's
//! transition rules. The controller never touches conversation State: it
//! emits Signals on the bus and reports the transition target so the caller
//! can enqueue a `PhaseTransition` Event for the reducer.
//!
//! Block parsing is lenient by contract: malformed JSON is ignored without
//! failing the turn, and multiple blocks in one response merge with
//! last-write-wins per top-level key.

use crate::profile::PhaseProfile;
use crate::signals::{names, Signal, SignalContext};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

const OPEN_TAG: &str = "<signals>";
const CLOSE_TAG: &str = "</signals>";

/// Extract and merge every well-formed signal block in `text`
///
/// Returns top-level keys exactly as written; namespacing is applied at
/// emission time. Blocks whose extracted substring fails JSON validation are
/// dropped silently.
pub fn parse_signal_blocks(text: &str) -> serde_json::Map<String, Value> {
    let mut merged = serde_json::Map::new();
    let mut rest = text;
    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        let Some(close) = after_open.find(CLOSE_TAG) else {
            break;
        };
        let block = &after_open[..close];
        if let Some(object) = extract_object(block) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(object) {
                for (key, value) in map {
                    merged.insert(key, value);
                }
            } else {
                trace!("Dropping non-object signal block");
            }
        }
        rest = &after_open[close + CLOSE_TAG.len()..];
    }
    merged
}

/// Brace-match a JSON object starting at the first `{`
///
/// Regex-greedy matching is insufficient here: payloads nest objects, so the
/// scan tracks depth and skips string literals and escapes.
fn extract_object(block: &str) -> Option<&str> {
    let start = block.find('{')?;
    let bytes = block.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&block[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Qualify an extracted key for emission
fn qualified(name: &str) -> String {
    if name.starts_with(names::CUSTOM_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", names::CUSTOM_PREFIX, name)
    }
}

/// Result of inspecting one AI response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseOutcome {
    /// Signals to emit, in extraction order
    pub signals: Vec<Signal>,
    /// Target phase if a transition rule fired
    pub transition: Option<String>,
}

/// Evaluates signal blocks against a phase profile's transition rules
///
/// Owns the per-phase set of emitted signal names; the set accumulates across
/// responses within a phase and clears when a transition fires.
pub struct PhaseController {
    profile: Arc<PhaseProfile>,
    current_phase: Mutex<String>,
    emitted: Mutex<HashSet<String>>,
}

impl PhaseController {
    pub fn new(profile: Arc<PhaseProfile>) -> Self {
        let initial = profile.initial_phase.clone();
        Self {
            profile,
            current_phase: Mutex::new(initial),
            emitted: Mutex::new(HashSet::new()),
        }
    }

    /// Phase the controller currently evaluates rules against
    pub fn current_phase(&self) -> String {
        self.current_phase.lock().expect("phase lock poisoned").clone()
    }

    /// Signal names observed so far in the current phase
    pub fn emitted_signals(&self) -> HashSet<String> {
        self.emitted.lock().expect("phase lock poisoned").clone()
    }

    /// Return to the profile's initial phase with an empty signal set
    pub fn reset(&self) {
        *self.current_phase.lock().expect("phase lock poisoned") =
            self.profile.initial_phase.clone();
        self.emitted.lock().expect("phase lock poisoned").clear();
    }

    /// Inspect one completed AI response (signals block intact)
    pub fn handle_response(&self, raw_text: &str, turn_id: u64, at_ms: u64) -> ResponseOutcome {
        let extracted = parse_signal_blocks(raw_text);
        if extracted.is_empty() {
            return ResponseOutcome::default();
        }

        let phase_id = self.current_phase();
        let mut outcome = ResponseOutcome::default();
        {
            let mut emitted = self.emitted.lock().expect("phase lock poisoned");
            for (key, payload) in extracted {
                let name = qualified(&key);
                emitted.insert(name.clone());
                outcome.signals.push(
                    Signal::new(name, payload).with_context(SignalContext {
                        turn_id,
                        phase_id: Some(phase_id.clone()),
                        at_ms,
                    }),
                );
            }

            for rule in self.profile.transitions_from(&phase_id) {
                let fired = if rule.require_all {
                    rule.trigger_signals.iter().all(|s| emitted.contains(s))
                } else {
                    rule.trigger_signals.iter().any(|s| emitted.contains(s))
                };
                if fired {
                    debug!(from = %rule.from, to = %rule.to, "Phase transition rule fired");
                    outcome.transition = Some(rule.to.clone());
                    emitted.clear();
                    break;
                }
            }
        }
        if let Some(target) = &outcome.transition {
            *self.current_phase.lock().expect("phase lock poisoned") = target.clone();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Phase, PhaseTransitionRule, Profile};
    use serde_json::json;

    fn exam_profile() -> Arc<PhaseProfile> {
        let phase = |id: &str| Phase {
            id: id.to_string(),
            profile: Profile {
                id: id.to_string(),
                ..Default::default()
            },
            context: None,
        };
        Arc::new(PhaseProfile {
            phases: vec![phase("greeting"), phase("part1"), phase("part2")],
            transitions: vec![
                PhaseTransitionRule {
                    from: "greeting".to_string(),
                    to: "part1".to_string(),
                    trigger_signals: vec!["custom.exam.greeting_complete".to_string()],
                    require_all: false,
                },
                PhaseTransitionRule {
                    from: "part1".to_string(),
                    to: "part2".to_string(),
                    trigger_signals: vec![
                        "custom.exam.topic_covered".to_string(),
                        "custom.exam.followups_done".to_string(),
                    ],
                    require_all: true,
                },
            ],
            initial_phase: "greeting".to_string(),
            global_context: None,
        })
    }

    #[test]
    fn test_parse_single_block() {
        let map =
            parse_signal_blocks("Welcome. <signals>{\"exam.greeting_complete\": {}}</signals>");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("exam.greeting_complete"));
    }

    #[test]
    fn test_parse_merges_blocks_last_write_wins() {
        let text = "<signals>{\"a.b\":{}}</signals> mid <signals>{\"a.b\":{\"c\":1}}</signals>";
        let map = parse_signal_blocks(text);
        assert_eq!(map.len(), 1);
        assert_eq!(map["a.b"], json!({"c": 1}));
    }

    #[test]
    fn test_parse_nested_payload_needs_brace_matching() {
        let text = "<signals>{\"a.b\": {\"inner\": {\"deep\": [1, 2]}}}</signals>";
        let map = parse_signal_blocks(text);
        assert_eq!(map["a.b"]["inner"]["deep"], json!([1, 2]));
    }

    #[test]
    fn test_parse_braces_inside_strings() {
        let text = "<signals>{\"a.b\": {\"note\": \"a } in a string {\"}}</signals>";
        let map = parse_signal_blocks(text);
        assert_eq!(map["a.b"]["note"], json!("a } in a string {"));
    }

    #[test]
    fn test_malformed_block_is_ignored() {
        let text = "ok <signals>{\"a.b\": </signals> then <signals>{\"c.d\":{}}</signals>";
        let map = parse_signal_blocks(text);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("c.d"));
    }

    #[test]
    fn test_block_without_object_is_ignored() {
        assert!(parse_signal_blocks("<signals>nothing here</signals>").is_empty());
        assert!(parse_signal_blocks("no blocks at all").is_empty());
    }

    #[test]
    fn test_unprefixed_keys_gain_custom_namespace() {
        let controller = PhaseController::new(exam_profile());
        let outcome = controller.handle_response(
            "Welcome. <signals>{\"exam.greeting_complete\": {}}</signals>",
            1,
            100,
        );
        assert_eq!(outcome.signals.len(), 1);
        assert_eq!(outcome.signals[0].name, "custom.exam.greeting_complete");
        assert_eq!(outcome.transition.as_deref(), Some("part1"));
        assert_eq!(controller.current_phase(), "part1");
        assert!(controller.emitted_signals().is_empty());
    }

    #[test]
    fn test_require_all_accumulates_across_responses() {
        let controller = PhaseController::new(exam_profile());
        controller.handle_response(
            "<signals>{\"exam.greeting_complete\": {}}</signals>",
            1,
            0,
        );
        assert_eq!(controller.current_phase(), "part1");

        let first = controller.handle_response(
            "<signals>{\"exam.topic_covered\": {\"confidence\": 0.9}}</signals>",
            2,
            0,
        );
        assert!(first.transition.is_none());
        assert_eq!(controller.emitted_signals().len(), 1);

        let second = controller.handle_response(
            "<signals>{\"exam.followups_done\": {}}</signals>",
            3,
            0,
        );
        assert_eq!(second.transition.as_deref(), Some("part2"));
    }

    #[test]
    fn test_already_prefixed_keys_untouched() {
        let controller = PhaseController::new(exam_profile());
        let outcome = controller.handle_response(
            "<signals>{\"custom.exam.greeting_complete\": {}}</signals>",
            1,
            0,
        );
        assert_eq!(outcome.signals[0].name, "custom.exam.greeting_complete");
        assert_eq!(outcome.transition.as_deref(), Some("part1"));
    }

    #[test]
    fn test_reset_returns_to_initial_phase() {
        let controller = PhaseController::new(exam_profile());
        controller.handle_response(
            "<signals>{\"exam.greeting_complete\": {}}</signals>",
            1,
            0,
        );
        assert_eq!(controller.current_phase(), "part1");
        controller.reset();
        assert_eq!(controller.current_phase(), "greeting");
        assert!(controller.emitted_signals().is_empty());
    }

    #[test]
    fn test_response_without_blocks_is_inert() {
        let controller = PhaseController::new(exam_profile());
        let outcome = controller.handle_response("Just words.", 1, 0);
        assert_eq!(outcome, ResponseOutcome::default());
    }
}
