//! Intake validation. A pure function from a raw policy to accepted-or-error;
//! nothing invalid may reach the store, the compiler, or a subscriber.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ValidationError;
use crate::types::{DelayFault, Fault, FaultInjectionPolicy, HeaderMatch, Rule, StringMatch};

/// Policies may not outlive 30 days; longer lifetimes are operator error.
pub const MAX_DURATION_SECONDS: u64 = 30 * 24 * 3600;

const MAX_NAME_LENGTH: usize = 253;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static pattern"))
}

/// Validates a policy against the intake rules. Returns the first violation
/// found, carrying the offending field path.
pub fn validate_policy(policy: &FaultInjectionPolicy) -> Result<(), ValidationError> {
    let name = &policy.metadata.name;
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || !name_pattern().is_match(name) {
        return Err(ValidationError::InvalidName("metadata.name".to_string()));
    }

    if policy.spec.duration_seconds > MAX_DURATION_SECONDS {
        return Err(ValidationError::DurationTooLong(
            "spec.duration_seconds".to_string(),
            MAX_DURATION_SECONDS,
        ));
    }

    if policy.spec.rules.is_empty() {
        return Err(ValidationError::EmptyRules("spec.rules".to_string()));
    }

    for (index, rule) in policy.spec.rules.iter().enumerate() {
        validate_rule(rule, &format!("spec.rules[{index}]"))?;
    }

    Ok(())
}

fn validate_rule(rule: &Rule, field: &str) -> Result<(), ValidationError> {
    if rule.matcher.is_empty() {
        return Err(ValidationError::EmptyMatch(format!("{field}.match")));
    }

    validate_string_match(&rule.matcher.method, &format!("{field}.match.method"))?;
    validate_string_match(&rule.matcher.path, &format!("{field}.match.path"))?;

    for (index, header) in rule.matcher.headers.iter().enumerate() {
        validate_header_match(header, &format!("{field}.match.headers[{index}]"))?;
    }

    validate_fault(&rule.fault, &format!("{field}.fault"))
}

fn validate_string_match(
    matcher: &Option<StringMatch>,
    field: &str,
) -> Result<(), ValidationError> {
    if let Some(pattern) = matcher.as_ref().and_then(StringMatch::regex_pattern) {
        compile_pattern(pattern, field)?;
    }
    Ok(())
}

fn validate_header_match(header: &HeaderMatch, field: &str) -> Result<(), ValidationError> {
    if header.name.is_empty() {
        return Err(ValidationError::EmptyHeaderName(format!("{field}.name")));
    }

    let matcher_count = [
        header.exact.is_some(),
        header.prefix.is_some(),
        header.regex.is_some(),
        header.present,
    ]
    .iter()
    .filter(|set| **set)
    .count();

    if matcher_count > 1 {
        return Err(ValidationError::ConflictingHeaderMatchers(field.to_string()));
    }
    // Inversion negates a matcher; with nothing to negate it would match
    // everything, which the intake rules forbid.
    if matcher_count == 0 {
        if header.invert {
            return Err(ValidationError::InvertWithoutMatcher(format!(
                "{field}.invert"
            )));
        }
        return Err(ValidationError::EmptyMatch(field.to_string()));
    }

    if let Some(pattern) = header.regex.as_deref() {
        compile_pattern(pattern, &format!("{field}.regex"))?;
    }

    Ok(())
}

fn validate_fault(fault: &Fault, field: &str) -> Result<(), ValidationError> {
    if !(0..=100).contains(&fault.percentage) {
        return Err(ValidationError::PercentageOutOfRange(
            format!("{field}.percentage"),
            fault.percentage,
        ));
    }

    match (&fault.abort, &fault.delay) {
        (None, None) => return Err(ValidationError::MissingAction(field.to_string())),
        (Some(_), Some(_)) => return Err(ValidationError::ConflictingActions(field.to_string())),
        _ => {}
    }

    if let Some(abort) = &fault.abort {
        if !(400..=599).contains(&abort.http_status) {
            return Err(ValidationError::AbortStatusOutOfRange(
                format!("{field}.abort.httpStatus"),
                abort.http_status,
            ));
        }
    }

    if let Some(delay) = &fault.delay {
        validate_delay(delay, &format!("{field}.delay"))?;
    }

    Ok(())
}

fn validate_delay(delay: &DelayFault, field: &str) -> Result<(), ValidationError> {
    let shape_count = [
        delay.fixed_delay_ms.is_some(),
        delay.range.is_some(),
        delay.normal.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();

    if shape_count != 1 {
        return Err(ValidationError::AmbiguousDelay(field.to_string()));
    }

    if let Some(range) = &delay.range {
        if range.min_ms > range.max_ms {
            return Err(ValidationError::InvertedDelayRange(format!("{field}.range")));
        }
    }

    if let Some(normal) = &delay.normal {
        let well_formed = normal.mean_ms.is_finite()
            && normal.stddev_ms.is_finite()
            && normal.mean_ms >= 0.0
            && normal.stddev_ms >= 0.0;
        if !well_formed {
            return Err(ValidationError::InvalidDelayParameters(format!(
                "{field}.normal"
            )));
        }
    }

    Ok(())
}

fn compile_pattern(pattern: &str, field: &str) -> Result<(), ValidationError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidRegex(field.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AbortFault, DelayRange, Metadata, NormalDelay, PolicySpec, RuleMatch,
    };

    fn abort_rule(status: u16, percentage: i32) -> Rule {
        Rule {
            matcher: RuleMatch {
                method: None,
                path: Some(StringMatch::Exact("/x".to_string())),
                headers: Vec::new(),
            },
            fault: Fault {
                percentage,
                abort: Some(AbortFault {
                    http_status: status,
                    body: None,
                    headers: None,
                }),
                delay: None,
            },
        }
    }

    fn policy_with(rules: Vec<Rule>) -> FaultInjectionPolicy {
        FaultInjectionPolicy {
            metadata: Metadata {
                name: "p1".to_string(),
                version: None,
            },
            spec: PolicySpec {
                rules,
                start_delay_ms: 0,
                duration_seconds: 0,
            },
        }
    }

    #[test]
    fn test_accepts_valid_policy() {
        assert!(validate_policy(&policy_with(vec![abort_rule(503, 50)])).is_ok());
    }

    #[test]
    fn test_name_pattern() {
        let mut policy = policy_with(vec![abort_rule(503, 50)]);

        for good in ["p1", "checkout-aborts", "a", "x-1-y"] {
            policy.metadata.name = good.to_string();
            assert!(validate_policy(&policy).is_ok(), "{good} should pass");
        }

        for bad in ["", "UPPER", "has_underscore", "-leading", "trailing-", "dot.ted"] {
            policy.metadata.name = bad.to_string();
            assert!(
                matches!(validate_policy(&policy), Err(ValidationError::InvalidName(_))),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn test_percentage_boundaries() {
        assert!(validate_policy(&policy_with(vec![abort_rule(503, 0)])).is_ok());
        assert!(validate_policy(&policy_with(vec![abort_rule(503, 100)])).is_ok());

        for bad in [-1, 101] {
            let err = validate_policy(&policy_with(vec![abort_rule(503, bad)])).unwrap_err();
            assert!(matches!(err, ValidationError::PercentageOutOfRange(_, got) if got == bad));
        }
    }

    #[test]
    fn test_abort_status_boundaries() {
        assert!(validate_policy(&policy_with(vec![abort_rule(400, 10)])).is_ok());
        assert!(validate_policy(&policy_with(vec![abort_rule(599, 10)])).is_ok());

        for bad in [399, 600] {
            let err = validate_policy(&policy_with(vec![abort_rule(bad, 10)])).unwrap_err();
            assert!(matches!(err, ValidationError::AbortStatusOutOfRange(_, got) if got == bad));
        }
    }

    #[test]
    fn test_empty_rules_rejected() {
        let err = validate_policy(&policy_with(Vec::new())).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyRules(_)));
    }

    #[test]
    fn test_empty_match_rejected() {
        let mut rule = abort_rule(503, 50);
        rule.matcher = RuleMatch::default();
        let err = validate_policy(&policy_with(vec![rule])).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyMatch(_)));
    }

    #[test]
    fn test_rule_without_action_rejected() {
        let mut rule = abort_rule(503, 50);
        rule.fault.abort = None;
        let err = validate_policy(&policy_with(vec![rule])).unwrap_err();
        assert!(matches!(err, ValidationError::MissingAction(_)));
    }

    #[test]
    fn test_abort_and_delay_conflict() {
        let mut rule = abort_rule(503, 50);
        rule.fault.delay = Some(DelayFault {
            fixed_delay_ms: Some(100),
            ..Default::default()
        });
        let err = validate_policy(&policy_with(vec![rule])).unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingActions(_)));
    }

    #[test]
    fn test_delay_shapes() {
        let delay_rule = |delay: DelayFault| Rule {
            matcher: RuleMatch {
                path: Some(StringMatch::Prefix("/".to_string())),
                ..Default::default()
            },
            fault: Fault {
                percentage: 100,
                abort: None,
                delay: Some(delay),
            },
        };

        let fixed = delay_rule(DelayFault {
            fixed_delay_ms: Some(250),
            ..Default::default()
        });
        assert!(validate_policy(&policy_with(vec![fixed])).is_ok());

        let range = delay_rule(DelayFault {
            range: Some(DelayRange { min_ms: 10, max_ms: 20 }),
            ..Default::default()
        });
        assert!(validate_policy(&policy_with(vec![range])).is_ok());

        let inverted = delay_rule(DelayFault {
            range: Some(DelayRange { min_ms: 20, max_ms: 10 }),
            ..Default::default()
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![inverted])),
            Err(ValidationError::InvertedDelayRange(_))
        ));

        let empty = delay_rule(DelayFault::default());
        assert!(matches!(
            validate_policy(&policy_with(vec![empty])),
            Err(ValidationError::AmbiguousDelay(_))
        ));

        let two_shapes = delay_rule(DelayFault {
            fixed_delay_ms: Some(100),
            range: Some(DelayRange { min_ms: 10, max_ms: 20 }),
            normal: None,
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![two_shapes])),
            Err(ValidationError::AmbiguousDelay(_))
        ));

        let negative_normal = delay_rule(DelayFault {
            normal: Some(NormalDelay { mean_ms: -1.0, stddev_ms: 5.0 }),
            ..Default::default()
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![negative_normal])),
            Err(ValidationError::InvalidDelayParameters(_))
        ));
    }

    #[test]
    fn test_regex_patterns_must_compile() {
        let mut rule = abort_rule(503, 50);
        rule.matcher.path = Some(StringMatch::Regex("([invalid".to_string()));
        let err = validate_policy(&policy_with(vec![rule])).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRegex(_, _)));
        assert_eq!(err.field(), "spec.rules[0].match.path");
    }

    #[test]
    fn test_header_matchers() {
        let header_rule = |header: HeaderMatch| Rule {
            matcher: RuleMatch {
                headers: vec![header],
                ..Default::default()
            },
            fault: Fault {
                percentage: 50,
                abort: Some(AbortFault {
                    http_status: 500,
                    body: None,
                    headers: None,
                }),
                delay: None,
            },
        };

        let present = header_rule(HeaderMatch {
            name: "x-debug".to_string(),
            exact: None,
            prefix: None,
            regex: None,
            present: true,
            invert: false,
        });
        assert!(validate_policy(&policy_with(vec![present])).is_ok());

        let inverted_exact = header_rule(HeaderMatch {
            name: "x-env".to_string(),
            exact: Some("prod".to_string()),
            prefix: None,
            regex: None,
            present: false,
            invert: true,
        });
        assert!(validate_policy(&policy_with(vec![inverted_exact])).is_ok());

        let invert_without_matcher = header_rule(HeaderMatch {
            name: "x-env".to_string(),
            exact: None,
            prefix: None,
            regex: None,
            present: false,
            invert: true,
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![invert_without_matcher])),
            Err(ValidationError::InvertWithoutMatcher(_))
        ));

        let conflicting = header_rule(HeaderMatch {
            name: "x-env".to_string(),
            exact: Some("prod".to_string()),
            prefix: Some("pr".to_string()),
            regex: None,
            present: false,
            invert: false,
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![conflicting])),
            Err(ValidationError::ConflictingHeaderMatchers(_))
        ));

        let unnamed = header_rule(HeaderMatch {
            name: String::new(),
            exact: Some("x".to_string()),
            prefix: None,
            regex: None,
            present: false,
            invert: false,
        });
        assert!(matches!(
            validate_policy(&policy_with(vec![unnamed])),
            Err(ValidationError::EmptyHeaderName(_))
        ));
    }

    #[test]
    fn test_duration_cap() {
        let mut policy = policy_with(vec![abort_rule(503, 50)]);
        policy.spec.duration_seconds = MAX_DURATION_SECONDS;
        assert!(validate_policy(&policy).is_ok());

        policy.spec.duration_seconds = MAX_DURATION_SECONDS + 1;
        assert!(matches!(
            validate_policy(&policy),
            Err(ValidationError::DurationTooLong(_, _))
        ));
    }

    #[test]
    fn test_large_policies_accepted() {
        let rules: Vec<Rule> = (0..100).map(|_| abort_rule(503, 50)).collect();
        assert!(validate_policy(&policy_with(rules)).is_ok());
    }

    #[test]
    fn test_no_length_cap_inside_rules() {
        let mut rule = abort_rule(503, 50);
        rule.matcher.headers.push(HeaderMatch {
            name: "x".repeat(1000),
            exact: Some("y".repeat(1000)),
            prefix: None,
            regex: None,
            present: false,
            invert: false,
        });
        assert!(validate_policy(&policy_with(vec![rule])).is_ok());
    }
}
