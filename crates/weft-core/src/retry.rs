// Retry policy resolution and retry directives
//
// Policy comes from `config.retryPolicy`, with legacy flat config keys
// still honored. Directives are metadata-carried signals from a node asking
// the runner to re-execute it; the modern form is an object under
// `metadata.retry`, the legacy form a boolean `retry`/`shouldRetry` on the
// output itself.

use serde_json::{json, Map, Value};

/// Attempt ceiling bounds
const MIN_ATTEMPTS: u32 = 1;
const MAX_ATTEMPTS: u32 = 10;
/// Delay bounds in milliseconds
const MAX_DELAY_MS: u64 = 10_000;

/// Resolved per-node retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub retry_on_error: bool,
    pub retry_on_directive: bool,
    pub fail_on_max_attempts: bool,
    pub increment_loop_on_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: false,
            max_attempts: 1,
            delay_ms: 0,
            retry_on_error: false,
            retry_on_directive: true,
            fail_on_max_attempts: true,
            increment_loop_on_retry: false,
        }
    }
}

impl RetryPolicy {
    /// Resolve from node config: `retryPolicy` object first, legacy flat
    /// keys (`retryEnabled`, `retryOnError`, `maxAttempts`, `retryDelayMs`)
    /// as fallback. Attempts clamp to 1–10 (default 3 when enabled),
    /// delay clamps to 0–10000ms.
    pub fn from_config(config: &Map<String, Value>) -> Self {
        let policy_obj = config.get("retryPolicy").and_then(Value::as_object);

        let get_bool = |key: &str| -> Option<bool> {
            policy_obj
                .and_then(|p| p.get(key))
                .or_else(|| config.get(key))
                .and_then(Value::as_bool)
        };
        let get_u64 = |key: &str| -> Option<u64> {
            policy_obj
                .and_then(|p| p.get(key))
                .or_else(|| config.get(key))
                .and_then(Value::as_u64)
        };

        let retry_on_error = get_bool("retryOnError").unwrap_or(false);
        let enabled = get_bool("enabled")
            .or_else(|| get_bool("retryEnabled"))
            .unwrap_or(retry_on_error || policy_obj.is_some());

        let max_attempts = if enabled {
            get_u64("maxAttempts")
                .map(|v| (v as u32).clamp(MIN_ATTEMPTS, MAX_ATTEMPTS))
                .unwrap_or(3)
        } else {
            1
        };

        let delay_ms = get_u64("delayMs")
            .or_else(|| get_u64("retryDelayMs"))
            .map(|v| v.min(MAX_DELAY_MS))
            .unwrap_or(0);

        RetryPolicy {
            enabled,
            max_attempts,
            delay_ms,
            retry_on_error,
            retry_on_directive: get_bool("retryOnDirective").unwrap_or(true),
            fail_on_max_attempts: get_bool("failOnMaxAttempts").unwrap_or(true),
            increment_loop_on_retry: get_bool("incrementLoopOnRetry").unwrap_or(false),
        }
    }
}

/// Metadata-carried signal from a node asking to be re-executed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDirective {
    pub requested: bool,
    pub reason: Option<String>,
    pub delay_ms: Option<u64>,
}

impl RetryDirective {
    /// Extract a directive from a node's output, if any. Checks
    /// `metadata.retry` (object or boolean) then the legacy flat
    /// `retry` / `shouldRetry` booleans.
    pub fn from_output(output: &Value) -> Option<RetryDirective> {
        if let Some(meta_retry) = output.pointer("/metadata/retry") {
            match meta_retry {
                Value::Object(obj) => {
                    return Some(RetryDirective {
                        requested: obj
                            .get("requested")
                            .and_then(Value::as_bool)
                            .unwrap_or(true),
                        reason: obj
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        delay_ms: obj.get("delayMs").and_then(Value::as_u64),
                    });
                }
                Value::Bool(requested) => {
                    return Some(RetryDirective {
                        requested: *requested,
                        reason: None,
                        delay_ms: None,
                    });
                }
                _ => {}
            }
        }

        for key in ["retry", "shouldRetry"] {
            if let Some(requested) = output.get(key).and_then(Value::as_bool) {
                return Some(RetryDirective {
                    requested,
                    reason: None,
                    delay_ms: None,
                });
            }
        }

        None
    }
}

/// Summary of how a completed step's attempts went; attached to the step
/// output as `_retryOutcome` and mirrored into memory.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub attempts: u32,
    pub retries: u32,
}

impl RetryOutcome {
    pub fn status(&self) -> &'static str {
        if self.retries == 0 {
            "completed_first_try"
        } else {
            "retry_succeeded_after_n"
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status(),
            "attempts": self.attempts,
            "retries": self.retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn default_policy_is_single_attempt() {
        let policy = RetryPolicy::from_config(&config(json!({})));
        assert!(!policy.enabled);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn enabled_policy_defaults_to_three_attempts() {
        let policy = RetryPolicy::from_config(&config(json!({
            "retryPolicy": {"enabled": true}
        })));
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.retry_on_directive);
        assert!(policy.fail_on_max_attempts);
    }

    #[test]
    fn attempts_and_delay_are_clamped() {
        let policy = RetryPolicy::from_config(&config(json!({
            "retryPolicy": {"enabled": true, "maxAttempts": 99, "delayMs": 60000}
        })));
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay_ms, 10_000);
    }

    #[test]
    fn legacy_flat_keys_are_honored() {
        let policy = RetryPolicy::from_config(&config(json!({
            "retryOnError": true,
            "maxAttempts": 5,
            "retryDelayMs": 250
        })));
        assert!(policy.enabled);
        assert!(policy.retry_on_error);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_ms, 250);
    }

    #[test]
    fn policy_object_overrides_flat_keys() {
        let policy = RetryPolicy::from_config(&config(json!({
            "maxAttempts": 9,
            "retryPolicy": {"enabled": true, "maxAttempts": 2}
        })));
        assert_eq!(policy.max_attempts, 2);
    }

    #[test]
    fn directive_from_metadata_object() {
        let output = json!({
            "metadata": {"retry": {"requested": true, "reason": "too short", "delayMs": 100}}
        });
        let directive = RetryDirective::from_output(&output).unwrap();
        assert!(directive.requested);
        assert_eq!(directive.reason.as_deref(), Some("too short"));
        assert_eq!(directive.delay_ms, Some(100));
    }

    #[test]
    fn directive_from_legacy_boolean() {
        let directive = RetryDirective::from_output(&json!({"shouldRetry": true})).unwrap();
        assert!(directive.requested);
        assert!(RetryDirective::from_output(&json!({"retry": false}))
            .map(|d| !d.requested)
            .unwrap_or(false));
    }

    #[test]
    fn no_directive_when_absent() {
        assert!(RetryDirective::from_output(&json!({"x": 1})).is_none());
    }

    #[test]
    fn outcome_status_names() {
        assert_eq!(
            RetryOutcome {
                attempts: 1,
                retries: 0
            }
            .status(),
            "completed_first_try"
        );
        assert_eq!(
            RetryOutcome {
                attempts: 3,
                retries: 2
            }
            .status(),
            "retry_succeeded_after_n"
        );
    }
}
