//! Change events emitted on watch streams, one per committed mutation.

use faultline_policy::FaultInjectionPolicy;

/// A committed store mutation, as seen by watchers.
///
/// Consumers rebuild derived state from the full store rather than applying
/// deltas, so an event only needs to say *that* something changed and to
/// which policy. `Rebuilt` is synthesized after a backend reconnect to force
/// a full resync.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created(FaultInjectionPolicy),
    Updated(FaultInjectionPolicy),
    Deleted(String),
    Rebuilt,
}

impl ChangeEvent {
    /// Name of the affected policy, if the event concerns a single one.
    pub fn policy_name(&self) -> Option<&str> {
        match self {
            ChangeEvent::Created(policy) | ChangeEvent::Updated(policy) => Some(policy.name()),
            ChangeEvent::Deleted(name) => Some(name),
            ChangeEvent::Rebuilt => None,
        }
    }
}
