//! Policy data model shared between the REST surface, the store, and the
//! compiler. The JSON shape mirrors the operator-facing wire format:
//! a `metadata`/`spec` envelope, externally-tagged string matchers
//! (`{"exact": "/x"}`), and camelCase fault fields (`httpStatus`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The unit of intake and storage: a named bundle of match→fault rules
/// with optional timing controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionPolicy {
    pub metadata: Metadata,
    pub spec: PolicySpec,
}

impl FaultInjectionPolicy {
    /// Unique, URL-safe policy identifier (the primary key).
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Lifetime of the policy, if it carries one. Zero means "no expiration".
    pub fn lifetime(&self) -> Option<Duration> {
        match self.spec.duration_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Policy identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Opaque operator-supplied version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The rule list plus global timing controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub rules: Vec<Rule>,
    /// Delay before the rules take effect on the data plane, in milliseconds.
    #[serde(default)]
    pub start_delay_ms: u64,
    /// Automatic removal after this many seconds; 0 disables expiration.
    #[serde(default)]
    pub duration_seconds: u64,
}

/// One match-condition → fault-action pairing inside a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub fault: Fault,
}

/// Conjunction of optional sub-matchers. An empty match matches nothing;
/// the validator rejects rules without at least one condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<StringMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

impl RuleMatch {
    /// True when no sub-matcher is present at all.
    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.path.is_none() && self.headers.is_empty()
    }
}

/// A single string matcher, tagged by kind: `{"exact": "GET"}`,
/// `{"prefix": "/api"}`, or `{"regex": "^/v[0-9]+/"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl StringMatch {
    /// The regex source text, when this matcher is a regex.
    pub fn regex_pattern(&self) -> Option<&str> {
        match self {
            StringMatch::Regex(pattern) => Some(pattern),
            _ => None,
        }
    }
}

/// Per-header match condition. At most one of `exact`/`prefix`/`regex`/
/// `present` applies; `invert` negates whichever matcher is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub invert: bool,
}

impl HeaderMatch {
    /// True when some matcher (exact/prefix/regex/present) is set.
    pub fn has_matcher(&self) -> bool {
        self.exact.is_some() || self.prefix.is_some() || self.regex.is_some() || self.present
    }
}

/// The fault action applied to matched requests: a sampling percentage and
/// at most one of abort/delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Share of matched requests the fault applies to, 0–100.
    pub percentage: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayFault>,
}

/// Reply with a canned error response instead of proxying upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortFault {
    /// Response status, 400–599.
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Headers added to the aborted response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Hold the request before proxying. Exactly one of the three shapes must
/// be set; the data plane samples ranges and normal distributions itself,
/// the control plane only validates and ships the parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayFault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<DelayRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<NormalDelay>,
}

/// Uniformly random delay in `[min_ms, max_ms]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Normally distributed delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalDelay {
    pub mean_ms: f64,
    pub stddev_ms: f64,
}
