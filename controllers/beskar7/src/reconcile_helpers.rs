//! Helper functions for common reconciliation patterns
//!
//! Status patches, finalizer handling, event emission and the translation
//! from typed errors to requeue actions, shared by all three reconcilers.

use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use kube_runtime::controller::Action;
use kube_runtime::events::{Event, EventType, Recorder};
use kube_runtime::reflector::ObjectRef;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ControllerError;

/// Default requeue for transient failures.
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue used for periodic refresh (host heartbeats, machine watch).
pub const PERIODIC_REQUEUE: Duration = Duration::from_secs(120);

/// Merge-patch the status subresource of a resource with a typed status.
pub async fn patch_status<K, S>(
    api: &Api<K>,
    name: &str,
    status: &S,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Add `finalizer` to the resource if absent.
pub async fn ensure_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
{
    let meta = obj.meta();
    if meta
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
    {
        return Ok(());
    }
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Validation("resource has no name".to_string()))?;

    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("Added finalizer {} to {}", finalizer, name);
    Ok(())
}

/// Remove `finalizer` from the resource if present.
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
{
    let meta = obj.meta();
    let Some(current) = meta.finalizers.as_ref() else {
        return Ok(());
    };
    if !current.iter().any(|x| x == finalizer) {
        return Ok(());
    }
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::Validation("resource has no name".to_string()))?;

    let remaining: Vec<String> = current.iter().filter(|x| *x != finalizer).cloned().collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!("Removed finalizer {} from {}", finalizer, name);
    Ok(())
}

/// Publish a Kubernetes event for a resource; failures are logged, never
/// propagated - events are advisory.
pub async fn publish_event<K>(
    recorder: &Recorder,
    obj: &K,
    event_type: EventType,
    reason: &str,
    action: &str,
    note: String,
) where
    K: Resource<DynamicType = ()>,
{
    let reference = ObjectRef::from_obj(obj).into();
    let event = Event {
        type_: event_type,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &reference).await {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}

/// Translate a reconcile error into the action the controller takes.
///
/// Retryable errors requeue soon; terminal ones wait for a spec change
/// (their status is expected to carry the failure already).
pub fn action_for_error(err: &ControllerError) -> Action {
    if err.is_retryable() {
        Action::requeue(TRANSIENT_REQUEUE)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_requeue_terminal_ones_wait() {
        assert_eq!(
            action_for_error(&ControllerError::QueueFull),
            Action::requeue(TRANSIENT_REQUEUE)
        );
        assert_eq!(
            action_for_error(&ControllerError::Validation("bad".into())),
            Action::await_change()
        );
    }
}
