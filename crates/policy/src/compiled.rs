//! Compilation of the stored policy set into the wire-format snapshot
//! broadcast to data-plane subscribers.
//!
//! Compilation is deterministic: policies are ordered by name, rules keep
//! their intra-policy order, and the version token is a content hash of the
//! flattened rule sequence, so equal inputs always produce equal versions.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Fault, FaultInjectionPolicy, RuleMatch};

/// Length of the hex-encoded version token.
const VERSION_TOKEN_LENGTH: usize = 16;

/// A single flattened rule, tagged with the policy it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    /// Name of the source policy.
    pub policy: String,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub fault: Fault,
}

/// The versioned snapshot pushed to subscribers. Regex matchers travel as
/// source text; the data plane compiles them on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRuleSet {
    /// Opaque content-derived token; subscribers compare it against the last
    /// one seen instead of diffing rule by rule.
    pub version: String,
    pub compiled_at: DateTime<Utc>,
    pub rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// An empty snapshot, used as the baseline before any policy exists.
    pub fn empty() -> Self {
        compile(&[])
    }
}

/// Failures detected when checking a compiled snapshot before it may
/// replace the cached one.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compiled rule set carries an empty version token")]
    EmptyVersion,

    #[error("compiled rule {0} carries an unparseable regex: {1}")]
    UnparseableRegex(usize, String),

    #[error("compiled rule set does not serialize: {0}")]
    Unserializable(String),
}

/// Flattens the given policies into a versioned snapshot.
///
/// Outer order is by policy name; intra-policy rule order is preserved. The
/// caller is expected to pass one consistent read of the store.
pub fn compile(policies: &[FaultInjectionPolicy]) -> CompiledRuleSet {
    let mut sorted: Vec<&FaultInjectionPolicy> = policies.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));

    let rules: Vec<CompiledRule> = sorted
        .iter()
        .flat_map(|policy| {
            policy.spec.rules.iter().map(|rule| CompiledRule {
                policy: policy.name().to_string(),
                matcher: rule.matcher.clone(),
                fault: rule.fault.clone(),
            })
        })
        .collect();

    CompiledRuleSet {
        version: version_token(&rules),
        compiled_at: Utc::now(),
        rules,
    }
}

/// Content hash over the flattened rule sequence. The timestamp is excluded
/// so recompiling an unchanged store yields the same token.
fn version_token(rules: &[CompiledRule]) -> String {
    let serialized = serde_json::to_vec(rules).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut token = hex::encode(digest);
    token.truncate(VERSION_TOKEN_LENGTH);
    token
}

/// Checks a freshly compiled snapshot. A failure here means the cached
/// last-good snapshot must be retained.
pub fn validate_compiled(set: &CompiledRuleSet) -> Result<(), CompileError> {
    if set.version.is_empty() {
        return Err(CompileError::EmptyVersion);
    }

    for (index, rule) in set.rules.iter().enumerate() {
        for pattern in rule_patterns(rule) {
            Regex::new(pattern)
                .map_err(|e| CompileError::UnparseableRegex(index, e.to_string()))?;
        }
    }

    serde_json::to_vec(set)
        .map(|_| ())
        .map_err(|e| CompileError::Unserializable(e.to_string()))
}

fn rule_patterns(rule: &CompiledRule) -> Vec<&str> {
    let mut patterns = Vec::new();
    if let Some(pattern) = rule.matcher.method.as_ref().and_then(|m| m.regex_pattern()) {
        patterns.push(pattern);
    }
    if let Some(pattern) = rule.matcher.path.as_ref().and_then(|m| m.regex_pattern()) {
        patterns.push(pattern);
    }
    for header in &rule.matcher.headers {
        if let Some(pattern) = header.regex.as_deref() {
            patterns.push(pattern);
        }
    }
    patterns
}
