//! Per-turn loop detection.
//!
//! The executor tracks `(tool, canonical-args)` fingerprints. A call past
//! the threshold is rejected back to the model with a message instructing it
//! to stop retrying; the turn itself keeps running, and only the tool budget
//! ever ends it.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Outcome of checking one prospective tool call.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopCheck {
    /// Fine to dispatch.
    Ok,
    /// Reject this call with an instructive error, keep the turn alive.
    RejectCall { count: u32 },
}

pub struct LoopDetector {
    counts: HashMap<String, u32>,
    threshold: u32,
}

impl LoopDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    /// Record one prospective call and classify it.
    pub fn check(&mut self, tool: &str, args: &serde_json::Value) -> LoopCheck {
        let fingerprint = fingerprint(tool, args);
        let count = self.counts.entry(fingerprint).or_insert(0);
        *count += 1;
        if *count > self.threshold {
            LoopCheck::RejectCall { count: *count }
        } else {
            LoopCheck::Ok
        }
    }
}

/// SHA-256 over the tool name and canonicalized (key-sorted) arguments, so
/// `{"a":1,"b":2}` and `{"b":2,"a":1}` collide as intended.
fn fingerprint(tool: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(args).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_args_never_trip() {
        let mut det = LoopDetector::new(3);
        for i in 0..10 {
            assert_eq!(det.check("echo", &serde_json::json!({"i": i})), LoopCheck::Ok);
        }
    }

    #[test]
    fn identical_calls_trip_past_threshold() {
        let mut det = LoopDetector::new(3);
        let args = serde_json::json!({"q": "same"});
        for _ in 0..3 {
            assert_eq!(det.check("search", &args), LoopCheck::Ok);
        }
        assert_eq!(det.check("search", &args), LoopCheck::RejectCall { count: 4 });
    }

    #[test]
    fn rejections_continue_without_escalating() {
        let mut det = LoopDetector::new(2);
        let args = serde_json::json!({});
        det.check("noop", &args);
        det.check("noop", &args);
        // every further identical call is rejected, never anything worse
        for expected in 3..=8u32 {
            assert_eq!(
                det.check("noop", &args),
                LoopCheck::RejectCall { count: expected }
            );
        }
    }

    #[test]
    fn key_order_does_not_matter() {
        let mut det = LoopDetector::new(1);
        assert_eq!(det.check("t", &serde_json::json!({"a": 1, "b": 2})), LoopCheck::Ok);
        assert_eq!(
            det.check("t", &serde_json::json!({"b": 2, "a": 1})),
            LoopCheck::RejectCall { count: 2 }
        );
    }

    #[test]
    fn tool_name_is_part_of_the_fingerprint() {
        let mut det = LoopDetector::new(1);
        let args = serde_json::json!({"x": 1});
        assert_eq!(det.check("a", &args), LoopCheck::Ok);
        assert_eq!(det.check("b", &args), LoopCheck::Ok);
    }
}
