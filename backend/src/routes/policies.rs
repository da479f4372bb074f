// Policy CRUD and diagnostics route handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use faultline_policy::FaultInjectionPolicy;
use faultline_store::Applied;
use serde::Serialize;

use crate::{error::ApiError, AppState};

/// List response wrapper
#[derive(Debug, Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<FaultInjectionPolicy>,
}

/// Aggregate counters for the status endpoint
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub policies: usize,
    pub rules: usize,
    /// Version of the currently distributed rule set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled_version: Option<String>,
    pub subscribers: usize,
}

/// Per-policy diagnostics
#[derive(Debug, Serialize)]
pub struct PolicyDiagnostics {
    pub name: String,
    pub rules: usize,
    pub abort_rules: usize,
    pub delay_rules: usize,
    /// Whether the policy's rules are part of the distributed rule set
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Status endpoint response
#[derive(Debug, Serialize)]
pub struct PolicyStatusResponse {
    pub summary: StatusSummary,
    pub policies: Vec<PolicyDiagnostics>,
}

/// Creates policy management routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(upsert_policy).get(list_policies))
        .route("/status", get(policy_status))
        .route(
            "/:name",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
}

/// POST /v1/policies - CreateOrUpdate a policy
///
/// 201 on first create, 200 on overwrite. The body is the stored policy.
#[tracing::instrument(skip(state, policy), fields(policy = %policy.name()))]
async fn upsert_policy(
    State(state): State<AppState>,
    Json(policy): Json<FaultInjectionPolicy>,
) -> Result<impl IntoResponse, ApiError> {
    let applied = state.store.create_or_update(policy.clone()).await?;

    let status = match applied {
        Applied::Created => {
            tracing::info!(policy = %policy.name(), "policy created");
            StatusCode::CREATED
        }
        Applied::Updated => {
            tracing::info!(policy = %policy.name(), "policy updated");
            StatusCode::OK
        }
    };
    Ok((status, Json(policy)))
}

/// GET /v1/policies - List all policies
#[tracing::instrument(skip(state))]
async fn list_policies(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut policies = state.store.list().await?;
    policies.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(Json(PolicyListResponse { policies }))
}

/// GET /v1/policies/{name} - Get one policy
#[tracing::instrument(skip(state), fields(policy = %name))]
async fn get_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let policy = state.store.get(&name).await?;
    Ok(Json(policy))
}

/// PUT /v1/policies/{name} - Strict update (404 if absent)
#[tracing::instrument(skip(state, policy), fields(policy = %name))]
async fn update_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(policy): Json<FaultInjectionPolicy>,
) -> Result<impl IntoResponse, ApiError> {
    if policy.name() != name {
        return Err(ApiError::Validation(format!(
            "metadata.name: '{}' does not match request path '{}'",
            policy.name(),
            name
        )));
    }

    state.store.update(policy.clone()).await?;
    tracing::info!(policy = %name, "policy updated");
    Ok((StatusCode::OK, Json(policy)))
}

/// DELETE /v1/policies/{name} - Remove one policy
#[tracing::instrument(skip(state), fields(policy = %name))]
async fn delete_policy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete(&name).await?;
    tracing::info!(policy = %name, "policy deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/policies/status - Summary plus per-policy diagnostics
#[tracing::instrument(skip(state))]
async fn policy_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut policies = state.store.list().await?;
    policies.sort_by(|a, b| a.name().cmp(b.name()));

    let current = state.distributor.current();
    let compiled_version = current.as_ref().map(|snapshot| snapshot.version.clone());
    let distributed: std::collections::HashSet<&str> = current
        .as_deref()
        .map(|snapshot| snapshot.rules.iter().map(|r| r.policy.as_str()).collect())
        .unwrap_or_default();

    let diagnostics: Vec<PolicyDiagnostics> = policies
        .iter()
        .map(|policy| PolicyDiagnostics {
            name: policy.name().to_string(),
            rules: policy.spec.rules.len(),
            abort_rules: count_rules(policy, |r| r.fault.abort.is_some()),
            delay_rules: count_rules(policy, |r| r.fault.delay.is_some()),
            active: distributed.contains(policy.name()),
            expires_at: state.expiry.deadline(policy.name()),
        })
        .collect();

    let response = PolicyStatusResponse {
        summary: StatusSummary {
            policies: policies.len(),
            rules: policies.iter().map(|p| p.spec.rules.len()).sum(),
            compiled_version,
            subscribers: state.distributor.subscriber_count().await,
        },
        policies: diagnostics,
    };
    Ok(Json(response))
}

fn count_rules(
    policy: &FaultInjectionPolicy,
    predicate: impl Fn(&faultline_policy::Rule) -> bool,
) -> usize {
    policy.spec.rules.iter().filter(|r| predicate(r)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_policy::{
        AbortFault, DelayFault, Fault, Metadata, PolicySpec, Rule, RuleMatch, StringMatch,
    };

    fn mixed_policy() -> FaultInjectionPolicy {
        let matcher = RuleMatch {
            method: None,
            path: Some(StringMatch::Prefix("/".to_string())),
            headers: Vec::new(),
        };
        FaultInjectionPolicy {
            metadata: Metadata {
                name: "mixed".to_string(),
                version: None,
            },
            spec: PolicySpec {
                rules: vec![
                    Rule {
                        matcher: matcher.clone(),
                        fault: Fault {
                            percentage: 10,
                            abort: Some(AbortFault {
                                http_status: 500,
                                body: None,
                                headers: None,
                            }),
                            delay: None,
                        },
                    },
                    Rule {
                        matcher,
                        fault: Fault {
                            percentage: 20,
                            abort: None,
                            delay: Some(DelayFault {
                                fixed_delay_ms: Some(50),
                                ..Default::default()
                            }),
                        },
                    },
                ],
                start_delay_ms: 0,
                duration_seconds: 0,
            },
        }
    }

    #[test]
    fn test_rule_counting() {
        let policy = mixed_policy();
        assert_eq!(count_rules(&policy, |r| r.fault.abort.is_some()), 1);
        assert_eq!(count_rules(&policy, |r| r.fault.delay.is_some()), 1);
    }
}
