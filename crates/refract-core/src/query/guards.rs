//! Shared guardrails for traversal limits and caller-supplied bounds.

// Traversal guards
pub const MAX_IMPACT_DEPTH: usize = 6;
pub const DEFAULT_IMPACT_DEPTH: usize = 4;

// Text pattern guards, in bytes
pub const MAX_PATTERN_LENGTH: usize = 512;

// Rule threshold guards
pub const MAX_RULE_THRESHOLD: usize = 10_000;

// Plan lifetime guards, in seconds
pub const MIN_PLAN_TTL_SECS: u64 = 1;
pub const MAX_PLAN_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PLAN_TTL_SECS: u64 = 15 * 60;

pub fn clamp_int<T: Ord>(value: T, minimum: T, maximum: T) -> T {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: usize, maximum: usize) -> usize {
    clamp_int(value, 1, maximum)
}

/// Thresholds below 1 would flag everything.
pub fn clamp_threshold(value: usize) -> usize {
    clamp_int(value, 1, MAX_RULE_THRESHOLD)
}

/// Boolean env toggle: unset yields `default`; otherwise `0/false/no/off`
/// are false and `1/true/yes/on` are true.
pub fn env_flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(val) => {
            let v = val.trim().to_lowercase();
            if matches!(v.as_str(), "0" | "false" | "no" | "off") {
                false
            } else if matches!(v.as_str(), "1" | "true" | "yes" | "on") {
                true
            } else {
                default
            }
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps() {
        assert_eq!(clamp_depth(0, MAX_IMPACT_DEPTH), 1);
        assert_eq!(clamp_depth(99, MAX_IMPACT_DEPTH), MAX_IMPACT_DEPTH);
        assert_eq!(clamp_threshold(0), 1);
        assert_eq!(clamp_int(5u64, MIN_PLAN_TTL_SECS, MAX_PLAN_TTL_SECS), 5);
    }

    #[test]
    fn test_env_flag() {
        assert!(env_flag(None, true));
        assert!(!env_flag(Some(" Off "), true));
        assert!(env_flag(Some("YES"), false));
        assert!(env_flag(Some("maybe"), true));
    }
}
