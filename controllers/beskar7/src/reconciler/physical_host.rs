//! PhysicalHost reconciler
//!
//! Enrollment, hardware heartbeats, stuck-state recovery and
//! deprovisioning on delete. Every state mutation goes through the
//! transition guard; BMC traffic goes through the provisioning queue so
//! per-BMC serialization and cooldown hold across reconcilers.

use chrono::Utc;
use crds::*;
use kube_runtime::controller::Action;
use kube_runtime::events::EventType;
use redfish_client::{RedfishError, SystemInfo};
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::error::{is_conflict, ControllerError};
use crate::queue::{OpError, OpKind, OpOutcome, Operation, QueueEntry, SubmitError, Submitted};
use crate::reconcile_helpers::{
    ensure_finalizer, publish_event, remove_finalizer, PERIODIC_REQUEUE, TRANSIENT_REQUEUE,
};
use crate::state_machine::{self, StuckRecovery};

impl Reconciler {
    pub async fn reconcile_physical_host(
        &self,
        host: &PhysicalHost,
    ) -> Result<Action, ControllerError> {
        let name = host
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("PhysicalHost missing name".to_string()))?
            .to_string();
        let namespace = host.metadata.namespace.as_deref().unwrap_or("default").to_string();

        info!(
            "Reconciling PhysicalHost {}/{} (state {})",
            namespace,
            name,
            host.state()
        );

        if host.metadata.deletion_timestamp.is_some() {
            return self.reconcile_host_deletion(host, &namespace, &name).await;
        }

        ensure_finalizer(&self.host_api(&namespace), host, PHYSICAL_HOST_FINALIZER).await?;

        match host.state() {
            HostState::None => {
                self.transition_host(&namespace, &name, HostState::Enrolling, |_| {})
                    .await?;
                publish_event(
                    &self.recorder,
                    host,
                    EventType::Normal,
                    "EnrollmentStarted",
                    "Enroll",
                    format!("Enrolling host via {}", host.spec.redfish_connection.address),
                )
                .await;
                Ok(Action::requeue(std::time::Duration::from_secs(1)))
            }
            HostState::Enrolling => self.reconcile_enrollment(host, &namespace, &name).await,
            HostState::Available | HostState::Claimed | HostState::Provisioned => {
                self.reconcile_heartbeat(host, &namespace, &name).await
            }
            HostState::Provisioning => self.reconcile_provisioning_watch(host, &namespace, &name).await,
            HostState::Error => {
                // Connection info is still present: retry through enrollment.
                debug!("Host {}/{} in Error, retrying enrollment", namespace, name);
                self.transition_host(&namespace, &name, HostState::Enrolling, |_| {})
                    .await?;
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
            HostState::Deprovisioning | HostState::Unknown => Ok(Action::requeue(PERIODIC_REQUEUE)),
        }
    }

    /// Probe the BMC and move Enrolling -> Available once hardware details
    /// are in hand.
    async fn reconcile_enrollment(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        match self.probe_host(host).await {
            Ok(info) => {
                self.transition_host(namespace, name, HostState::Available, |status| {
                    apply_system_info(status, &info);
                })
                .await?;
                publish_event(
                    &self.recorder,
                    host,
                    EventType::Normal,
                    "Enrolled",
                    "Enroll",
                    format!("{} {} is available", info.manufacturer, info.model),
                )
                .await;
                Ok(Action::requeue(PERIODIC_REQUEUE))
            }
            Err(ProbeFailure::Credential(message)) => {
                self.host_to_error(host, namespace, name, REASON_CREDENTIAL_ERROR, message)
                    .await?;
                Ok(Action::requeue(PERIODIC_REQUEUE))
            }
            Err(ProbeFailure::Transient(message)) => {
                self.handle_stuck_enrollment(host, namespace, name, message).await
            }
            Err(ProbeFailure::Busy) => Ok(Action::requeue(TRANSIENT_REQUEUE)),
        }
    }

    /// Transient enrollment failure: requeue, and once the host has been
    /// Enrolling past the stuck timeout, burn recovery attempts until the
    /// budget is gone.
    async fn handle_stuck_enrollment(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
        message: String,
    ) -> Result<Action, ControllerError> {
        let status = host.status.clone().unwrap_or_default();
        let stuck = state_machine::detect_stuck(&status, Utc::now(), self.config.stuck_state_timeout);

        if stuck == Some(StuckRecovery::ReprobeConnection) {
            if state_machine::recoveries_exhausted(&status) {
                self.host_to_error(host, namespace, name, REASON_REDFISH_CONNECTION_FAILED, message)
                    .await?;
                return Ok(Action::requeue(PERIODIC_REQUEUE));
            }
            self.bump_recovery_attempts(namespace, name).await?;
            warn!(
                "Host {}/{} stuck in Enrolling (attempt {}), re-probing",
                namespace,
                name,
                status.recovery_attempts + 1
            );
        } else {
            debug!("Enrollment probe of {}/{} failed transiently: {}", namespace, name, message);
        }
        Ok(Action::requeue(TRANSIENT_REQUEUE))
    }

    /// Refresh hardware details and observed power state on an interval.
    async fn reconcile_heartbeat(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        match self.probe_host(host).await {
            Ok(info) => {
                self.refresh_host_status(namespace, name, &info).await?;
                Ok(Action::requeue(PERIODIC_REQUEUE))
            }
            Err(ProbeFailure::Credential(message)) => {
                // Claimed hosts keep their consumer; only unclaimed hosts
                // may move to Error (the state pair must stay legal).
                if host.state() == HostState::Available {
                    self.host_to_error(host, namespace, name, REASON_CREDENTIAL_ERROR, message)
                        .await?;
                } else {
                    warn!(
                        "Heartbeat of claimed host {}/{} hit a credential error: {}",
                        namespace, name, message
                    );
                }
                Ok(Action::requeue(PERIODIC_REQUEUE))
            }
            Err(ProbeFailure::Transient(message)) => {
                debug!("Heartbeat of {}/{} failed: {}", namespace, name, message);
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
            Err(ProbeFailure::Busy) => Ok(Action::requeue(TRANSIENT_REQUEUE)),
        }
    }

    /// Watch a Provisioning host for stuckness; the machine reconciler
    /// owns the forward path.
    async fn reconcile_provisioning_watch(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let status = host.status.clone().unwrap_or_default();
        let Some(StuckRecovery::EjectAndRetryBoot) =
            state_machine::detect_stuck(&status, Utc::now(), self.config.stuck_state_timeout)
        else {
            return Ok(Action::requeue(TRANSIENT_REQUEUE));
        };

        if state_machine::recoveries_exhausted(&status) {
            warn!(
                "Host {}/{} exhausted provisioning recoveries, marking Error",
                namespace, name
            );
            self.host_to_error(
                host,
                namespace,
                name,
                REASON_PROVISIONING_TIMEOUT,
                format!(
                    "provisioning exceeded {} and {} recoveries failed",
                    humantime::format_duration(self.config.stuck_state_timeout),
                    state_machine::MAX_RECOVERY_ATTEMPTS
                ),
            )
            .await?;
            return Ok(Action::requeue(PERIODIC_REQUEUE));
        }

        info!(
            "Host {}/{} stuck in Provisioning, recovery attempt {}",
            namespace,
            name,
            status.recovery_attempts + 1
        );
        publish_event(
            &self.recorder,
            host,
            EventType::Warning,
            "ProvisioningStuck",
            "Recover",
            format!("ejecting media and retrying (attempt {})", status.recovery_attempts + 1),
        )
        .await;

        let client = self.redfish_client_for(host).await?;
        let entry = QueueEntry {
            host_id: host.host_id(),
            kind: OpKind::Health,
            bmc_address: host.spec.redfish_connection.address.clone(),
            host_deleting: false,
            client,
            operation: Operation::Recover,
        };
        match self.queue.submit(entry) {
            Ok(Submitted::Accepted(handle)) => {
                self.bump_recovery_attempts(namespace, name).await?;
                // Recovery outcome shows up on the next pass; don't hold
                // the reconcile open for it.
                drop(handle);
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
            Ok(Submitted::Duplicate) => Ok(Action::requeue(TRANSIENT_REQUEUE)),
            Err(SubmitError::QueueFull) => Ok(Action::requeue(PERIODIC_REQUEUE)),
            Err(SubmitError::ShutDown) => Err(ControllerError::Reconciliation(
                "provisioning queue is shut down".to_string(),
            )),
        }
    }

    /// Deprovision on delete: refuse while claimed, otherwise eject and
    /// power off best-effort, then drop the finalizer. Deletion completes
    /// even when the BMC never answers.
    async fn reconcile_host_deletion(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let host_api = self.host_api(namespace);
        let has_finalizer = host
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == PHYSICAL_HOST_FINALIZER));
        if !has_finalizer {
            return Ok(Action::await_change());
        }

        if host.spec.consumer_ref.is_some() {
            warn!(
                "Refusing to deprovision {}/{}: still claimed by {:?}",
                namespace,
                name,
                host.spec.consumer_ref.as_ref().map(|c| &c.name)
            );
            let mut fresh = host_api.get(name).await?;
            let mut status = fresh.status.clone().unwrap_or_default();
            set_condition(
                &mut status.conditions,
                Condition::false_with_reason(
                    CONDITION_DEPROVISION_BLOCKED,
                    REASON_HOST_STILL_CLAIMED,
                    "host must be released before it can be deleted",
                    ConditionSeverity::Warning,
                ),
            );
            fresh.status = Some(status);
            self.replace_host_status(&fresh, namespace, name).await?;
            publish_event(
                &self.recorder,
                host,
                EventType::Warning,
                REASON_HOST_STILL_CLAIMED,
                "Deprovision",
                "deletion waits for the consumer to release this host".to_string(),
            )
            .await;
            return Ok(Action::requeue(TRANSIENT_REQUEUE));
        }

        match host.state() {
            HostState::Deprovisioning => {}
            HostState::Available | HostState::Provisioned | HostState::Error => {
                self.transition_host(namespace, name, HostState::Deprovisioning, |_| {})
                    .await?;
            }
            // No legal direct path (None, Enrolling, Unknown): fail the
            // state first, Deprovisioning follows on the next pass.
            _ => {
                self.transition_host(namespace, name, HostState::Error, |status| {
                    status.error_message = Some("deleted before enrollment finished".to_string());
                })
                .await?;
                return Ok(Action::requeue(std::time::Duration::from_secs(1)));
            }
        }

        match self.redfish_client_for(host).await {
            Ok(client) => {
                let entry = QueueEntry {
                    host_id: host.host_id(),
                    kind: OpKind::Deprovision,
                    bmc_address: host.spec.redfish_connection.address.clone(),
                    host_deleting: true,
                    client,
                    operation: Operation::Deprovision,
                };
                match self.queue.submit(entry) {
                    Ok(Submitted::Accepted(handle)) => {
                        match tokio::time::timeout(self.queue_wait_budget(), handle.wait()).await {
                            Ok(Ok(_)) => {
                                debug!("Deprovisioned {}/{}", namespace, name);
                            }
                            Ok(Err(e)) => {
                                publish_event(
                                    &self.recorder,
                                    host,
                                    EventType::Warning,
                                    "DeprovisionIncomplete",
                                    "Deprovision",
                                    format!("best-effort deprovision failed: {e}"),
                                )
                                .await;
                            }
                            Err(_) => return Ok(Action::requeue(TRANSIENT_REQUEUE)),
                        }
                    }
                    Ok(Submitted::Duplicate) => return Ok(Action::requeue(TRANSIENT_REQUEUE)),
                    Err(SubmitError::QueueFull) => return Ok(Action::requeue(TRANSIENT_REQUEUE)),
                    Err(SubmitError::ShutDown) => {
                        warn!("Queue shut down, deleting {}/{} without deprovision", namespace, name);
                    }
                }
            }
            Err(e) => {
                // Unreachable credentials must not wedge deletion.
                publish_event(
                    &self.recorder,
                    host,
                    EventType::Warning,
                    "DeprovisionIncomplete",
                    "Deprovision",
                    format!("skipping BMC cleanup: {e}"),
                )
                .await;
            }
        }

        remove_finalizer(&host_api, host, PHYSICAL_HOST_FINALIZER).await?;
        info!("PhysicalHost {}/{} deprovisioned and released for deletion", namespace, name);
        Ok(Action::await_change())
    }

    /// Submit a Probe through the queue and classify the outcome.
    async fn probe_host(&self, host: &PhysicalHost) -> Result<SystemInfo, ProbeFailure> {
        let client = match self.redfish_client_for(host).await {
            Ok(client) => client,
            Err(ControllerError::Credential(message)) => {
                return Err(ProbeFailure::Credential(message))
            }
            Err(e) => return Err(ProbeFailure::Transient(e.to_string())),
        };

        let entry = QueueEntry {
            host_id: host.host_id(),
            kind: OpKind::Health,
            bmc_address: host.spec.redfish_connection.address.clone(),
            host_deleting: false,
            client,
            operation: Operation::Probe,
        };
        let handle = match self.queue.submit(entry) {
            Ok(Submitted::Accepted(handle)) => handle,
            Ok(Submitted::Duplicate) | Err(SubmitError::QueueFull) => return Err(ProbeFailure::Busy),
            Err(SubmitError::ShutDown) => {
                return Err(ProbeFailure::Transient("queue shut down".to_string()))
            }
        };

        match tokio::time::timeout(self.queue_wait_budget(), handle.wait()).await {
            Ok(Ok(OpOutcome::Probed(info))) => Ok(info),
            Ok(Ok(OpOutcome::Done)) => Err(ProbeFailure::Transient(
                "probe returned no system info".to_string(),
            )),
            Ok(Err(OpError::Redfish(RedfishError::Authentication(message)))) => {
                Err(ProbeFailure::Credential(message))
            }
            Ok(Err(e)) => Err(ProbeFailure::Transient(e.to_string())),
            Err(_) => Err(ProbeFailure::Busy),
        }
    }

    /// Guarded state transition on a fresh read of the host.
    async fn transition_host(
        &self,
        namespace: &str,
        name: &str,
        to: HostState,
        mutate: impl FnOnce(&mut PhysicalHostStatus),
    ) -> Result<(), ControllerError> {
        let host_api = self.host_api(namespace);
        let mut host = host_api.get(name).await?;
        let mut status = host.status.clone().unwrap_or_default();
        mutate(&mut status);
        state_machine::apply_transition(&mut status, &host.spec, to, Utc::now())?;
        host.status = Some(status);
        self.replace_host_status(&host, namespace, name).await
    }

    /// Record a failure and move the host to Error with a condition and
    /// an event.
    ///
    /// A consumer cannot ride along into Error: the host is released
    /// first, and the owning machine re-claims elsewhere.
    async fn host_to_error(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
        reason: &str,
        message: String,
    ) -> Result<(), ControllerError> {
        warn!("Host {}/{} entering Error: {}: {}", namespace, name, reason, message);
        if let Some(consumer) = host.spec.consumer_ref.clone() {
            self.coordinator
                .release(namespace, name, &consumer.name)
                .await
                .map_err(|e| ControllerError::Reconciliation(e.to_string()))?;
        }
        let reason_owned = reason.to_string();
        let message_clone = message.clone();
        self.transition_host(namespace, name, HostState::Error, move |status| {
            status.error_message = Some(message_clone.clone());
            set_condition(
                &mut status.conditions,
                Condition::false_with_reason(
                    CONDITION_INFRASTRUCTURE_READY,
                    &reason_owned,
                    &message_clone,
                    ConditionSeverity::Error,
                ),
            );
        })
        .await?;
        publish_event(&self.recorder, host, EventType::Warning, reason, "Reconcile", message).await;
        Ok(())
    }

    async fn bump_recovery_attempts(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let host_api = self.host_api(namespace);
        let mut host = host_api.get(name).await?;
        let mut status = host.status.clone().unwrap_or_default();
        status.recovery_attempts += 1;
        host.status = Some(status);
        self.replace_host_status(&host, namespace, name).await
    }

    /// Write refreshed inventory into the host status without a state
    /// change.
    async fn refresh_host_status(
        &self,
        namespace: &str,
        name: &str,
        info: &SystemInfo,
    ) -> Result<(), ControllerError> {
        let host_api = self.host_api(namespace);
        let mut host = host_api.get(name).await?;
        let mut status = host.status.clone().unwrap_or_default();
        apply_system_info(&mut status, info);
        status.ready = status.state.is_ready_state() && status.hardware_details.is_some();
        host.status = Some(status);
        self.replace_host_status(&host, namespace, name).await
    }

    async fn replace_host_status(
        &self,
        host: &PhysicalHost,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let data = serde_json::to_vec(host)
            .map_err(|e| ControllerError::Reconciliation(format!("serialize host status: {e}")))?;
        match self
            .host_api(namespace)
            .replace_status(name, &kube::api::PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!("Status write on {}/{} lost a race, next pass converges", namespace, name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy probed inventory into the status.
pub fn apply_system_info(status: &mut crds::PhysicalHostStatus, info: &SystemInfo) {
    status.observed_power_state = Some(info.power_state.to_string());
    status.hardware_details = Some(HardwareDetails {
        manufacturer: info.manufacturer.clone(),
        model: info.model.clone(),
        serial_number: info.serial_number.clone(),
        health: info.health.clone(),
        cpu_cores: info.cpu_cores,
        memory_gib: info.memory_gib,
        disk_gib: info.disk_gib,
    });
}

/// Probe outcomes as the reconciler cares about them.
enum ProbeFailure {
    /// Bad or missing credentials; deterministic, not retried hot
    Credential(String),
    /// Connection trouble or timeout; retried with backoff
    Transient(String),
    /// Queue busy or probe still in flight; come back shortly
    Busy,
}
