//! Beskar7Machine reconciler
//!
//! Drives a machine from Pending to Provisioned: claim a host through the
//! coordinator, resolve the boot artifact, hand the BMC work to the
//! provisioning queue and translate host state into machine readiness.
//! The finalizer releases the owned host before the machine goes away.

use boot_policy::{determine_strategy, kernel_args_for};
use chrono::Utc;
use crds::*;
use kube::api::{Patch, PatchParams};
use kube_runtime::controller::Action;
use kube_runtime::events::EventType;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::coordinator::{ClaimError, ClaimRequest};
use crate::error::{is_conflict, ControllerError};
use crate::queue::{
    BootParamPlan, OpError, OpKind, Operation, QueueEntry, SubmitError, Submitted,
};
use crate::reconcile_helpers::{
    ensure_finalizer, patch_status, publish_event, remove_finalizer, PERIODIC_REQUEUE,
    TRANSIENT_REQUEUE,
};
use crate::state_machine;

/// How the boot artifact resolves for a machine/host pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootResolution {
    /// Submit this to the provisioning queue
    Ready {
        iso_url: String,
        plan: BootParamPlan,
    },
    /// Terminal: record the failure and stop until the spec changes
    Terminal {
        reason: &'static str,
        message: String,
    },
}

/// Resolve the ISO and kernel-argument plan for a machine on its host.
///
/// Pure: consults only the machine spec, the host's reported hardware and
/// the host's annotations.
pub fn resolve_boot_artifact(spec: &Beskar7MachineSpec, host: &PhysicalHost) -> BootResolution {
    match spec.provisioning_mode {
        ProvisioningMode::PreBakedIso => BootResolution::Ready {
            iso_url: spec.image_url.clone(),
            plan: BootParamPlan::None,
        },
        ProvisioningMode::Pxe | ProvisioningMode::IPxe => BootResolution::Terminal {
            reason: REASON_MODE_NOT_IMPLEMENTED,
            message: format!(
                "provisioning mode {:?} is accepted by the API but not implemented",
                spec.provisioning_mode
            ),
        },
        ProvisioningMode::RemoteConfig => {
            let Some(config_url) = spec.config_url.as_deref() else {
                return BootResolution::Terminal {
                    reason: REASON_BOOT_CONFIG_FAILED,
                    message: "RemoteConfig provisioning requires configURL".to_string(),
                };
            };

            let empty = Default::default();
            let details = host.status.as_ref().and_then(|s| s.hardware_details.as_ref());
            let annotations = host.metadata.annotations.as_ref().unwrap_or(&empty);
            let strategy = determine_strategy(
                details.map(|d| d.manufacturer.as_str()).unwrap_or_default(),
                details.map(|d| d.model.as_str()).unwrap_or_default(),
                annotations,
            );
            if !strategy.supports_injection() {
                return BootResolution::Terminal {
                    reason: REASON_BOOT_PARAM_UNSUPPORTED,
                    message: format!(
                        "host {} does not support kernel-argument injection; use PreBakedISO",
                        host.host_id()
                    ),
                };
            }

            let Some(kernel_args) = kernel_args_for(&spec.os_family, config_url) else {
                return BootResolution::Terminal {
                    reason: REASON_BOOT_PARAM_UNSUPPORTED,
                    message: format!(
                        "no kernel-argument convention known for OS family {:?}",
                        spec.os_family
                    ),
                };
            };

            BootResolution::Ready {
                iso_url: spec.image_url.clone(),
                plan: BootParamPlan::Inject {
                    kernel_args,
                    chain: strategy
                        .chain()
                        .filter(|m| **m != boot_policy::BootParamMechanism::Unsupported)
                        .cloned()
                        .collect(),
                },
            }
        }
    }
}

impl Reconciler {
    pub async fn reconcile_machine(
        &self,
        machine: &Beskar7Machine,
    ) -> Result<Action, ControllerError> {
        let name = machine
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("Beskar7Machine missing name".to_string()))?
            .to_string();
        let namespace = machine.metadata.namespace.as_deref().unwrap_or("default").to_string();

        info!("Reconciling Beskar7Machine {}/{}", namespace, name);

        if machine.metadata.deletion_timestamp.is_some() {
            return self.reconcile_machine_deletion(machine, &namespace, &name).await;
        }

        // A terminally failed machine stays failed until its spec changes;
        // the controller triggers on generation change.
        if machine.has_failed() {
            debug!("Machine {}/{} already failed terminally, waiting for spec change", namespace, name);
            return Ok(Action::await_change());
        }

        let machine_api = self.machine_api(&namespace);
        ensure_finalizer(&machine_api, machine, BESKAR7_MACHINE_FINALIZER).await?;

        if !self.config.accepts_os_family(&machine.spec.os_family) {
            return self
                .fail_machine(
                    machine,
                    &namespace,
                    &name,
                    REASON_BOOT_CONFIG_FAILED,
                    format!(
                        "OS family {:?} is not in the accepted set {:?}",
                        machine.spec.os_family, self.config.os_families
                    ),
                )
                .await;
        }

        // Associate a host, or keep the one already claimed.
        let host = match self.find_owned_host(&namespace, &name).await? {
            Some(host) => host,
            None => {
                self.surface_lost_host(machine, &namespace, &name).await?;
                match self.claim_for_machine(machine, &namespace, &name).await? {
                    Some(host) => host,
                    None => return Ok(Action::requeue(TRANSIENT_REQUEUE)),
                }
            }
        };

        self.drive_provisioning(machine, &namespace, &name, host).await
    }

    /// A machine that was associated but no longer owns a host lost it to
    /// a failure or an out-of-band release; say so before re-claiming.
    async fn surface_lost_host(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        let was_associated = machine
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_PHYSICAL_HOST_ASSOCIATED));
        if !was_associated {
            return Ok(());
        }

        warn!("Machine {}/{} lost its backing host, re-claiming", namespace, name);
        let mut status = machine.status.clone().unwrap_or_default();
        status.ready = false;
        status.phase = MachinePhase::Pending;
        set_condition(
            &mut status.conditions,
            Condition::false_with_reason(
                CONDITION_PHYSICAL_HOST_ASSOCIATED,
                REASON_PHYSICAL_HOST_ERROR,
                "backing host failed or was released",
                ConditionSeverity::Warning,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::false_with_reason(
                CONDITION_INFRASTRUCTURE_READY,
                REASON_PHYSICAL_HOST_ERROR,
                "backing host failed or was released",
                ConditionSeverity::Error,
            ),
        );
        patch_status(&self.machine_api(namespace), name, &status).await?;
        publish_event(
            &self.recorder,
            machine,
            EventType::Warning,
            REASON_PHYSICAL_HOST_ERROR,
            "Claim",
            "backing host failed or was released, claiming a new one".to_string(),
        )
        .await;
        Ok(())
    }

    /// Find the host this machine already owns, if any.
    async fn find_owned_host(
        &self,
        namespace: &str,
        machine_name: &str,
    ) -> Result<Option<PhysicalHost>, ControllerError> {
        let hosts = self
            .host_api(namespace)
            .list(&kube::api::ListParams::default())
            .await?;
        Ok(hosts.items.into_iter().find(|h| {
            h.spec
                .consumer_ref
                .as_ref()
                .is_some_and(|c| c.matches(namespace, machine_name))
        }))
    }

    /// Invoke the coordinator. `Ok(None)` means no host yet; the machine
    /// status already says why.
    async fn claim_for_machine(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PhysicalHost>, ControllerError> {
        let mut request = ClaimRequest::new(namespace, name);
        request.hardware = machine.spec.hardware_requirements.clone();

        match self.claim_host(&request).await {
            Ok(host) => {
                publish_event(
                    &self.recorder,
                    machine,
                    EventType::Normal,
                    REASON_HOST_CLAIMED,
                    "Claim",
                    format!("Claimed PhysicalHost {}", host.host_id()),
                )
                .await;
                let mut status = machine.status.clone().unwrap_or_default();
                status.phase = MachinePhase::Provisioning;
                set_condition(
                    &mut status.conditions,
                    Condition::true_with_reason(CONDITION_PHYSICAL_HOST_ASSOCIATED, REASON_HOST_CLAIMED),
                );
                patch_status(&self.machine_api(namespace), name, &status).await?;
                Ok(Some(host))
            }
            Err(ClaimError::NoAvailableHost(_)) => {
                debug!("No available host for machine {}/{}", namespace, name);
                let mut status = machine.status.clone().unwrap_or_default();
                status.phase = MachinePhase::Pending;
                set_condition(
                    &mut status.conditions,
                    Condition::false_with_reason(
                        CONDITION_PHYSICAL_HOST_ASSOCIATED,
                        REASON_WAITING_FOR_PHYSICAL_HOST,
                        "no Available PhysicalHost satisfies the request",
                        ConditionSeverity::Info,
                    ),
                );
                patch_status(&self.machine_api(namespace), name, &status).await?;
                Ok(None)
            }
            Err(ClaimError::OptimisticLockConflict(_)) | Err(ClaimError::LeadershipLost) => {
                warn!("Claim conflict for machine {}/{}, requeueing", namespace, name);
                let mut status = machine.status.clone().unwrap_or_default();
                set_condition(
                    &mut status.conditions,
                    Condition::false_with_reason(
                        CONDITION_PHYSICAL_HOST_ASSOCIATED,
                        REASON_CLAIM_CONFLICT,
                        "lost the claim race, will retry",
                        ConditionSeverity::Warning,
                    ),
                );
                patch_status(&self.machine_api(namespace), name, &status).await?;
                Ok(None)
            }
            Err(ClaimError::Store(e)) => Err(ControllerError::Reconciliation(e.to_string())),
        }
    }

    /// Take the machine from Claimed host to Provisioned host.
    async fn drive_provisioning(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
        host: PhysicalHost,
    ) -> Result<Action, ControllerError> {
        match host.state() {
            HostState::Provisioned => self.finish_provisioning(machine, namespace, name, &host).await,
            HostState::Error => {
                let host_error = host
                    .status
                    .as_ref()
                    .and_then(|s| s.error_message.clone())
                    .unwrap_or_else(|| "host is in Error state".to_string());
                let mut status = machine.status.clone().unwrap_or_default();
                status.ready = false;
                set_condition(
                    &mut status.conditions,
                    Condition::false_with_reason(
                        CONDITION_INFRASTRUCTURE_READY,
                        REASON_PHYSICAL_HOST_ERROR,
                        &host_error,
                        ConditionSeverity::Error,
                    ),
                );
                patch_status(&self.machine_api(namespace), name, &status).await?;
                // The host reconciler retries enrollment; check back.
                Ok(Action::requeue(PERIODIC_REQUEUE))
            }
            HostState::Claimed | HostState::Provisioning => {
                match resolve_boot_artifact(&machine.spec, &host) {
                    BootResolution::Terminal { reason, message } => {
                        self.fail_machine(machine, namespace, name, reason, message).await
                    }
                    BootResolution::Ready { iso_url, plan } => {
                        self.submit_provision(machine, namespace, name, host, iso_url, plan)
                            .await
                    }
                }
            }
            other => {
                // Deprovisioning or a mid-release state; wait it out.
                debug!(
                    "Machine {}/{} owns host {} in state {}, waiting",
                    namespace,
                    name,
                    host.host_id(),
                    other
                );
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
        }
    }

    /// Set the boot ISO on the host (Claimed -> Provisioning) and run the
    /// provision operation through the queue.
    async fn submit_provision(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
        host: PhysicalHost,
        iso_url: String,
        plan: BootParamPlan,
    ) -> Result<Action, ControllerError> {
        let host_api = self.host_api(namespace);
        let host_name = host
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Validation("host missing name".to_string()))?
            .to_string();

        // Stamp the boot ISO first; it gates the Provisioning transition.
        if host.spec.boot_iso_source.as_deref() != Some(iso_url.as_str()) {
            let mut updated = host.clone();
            updated.spec.boot_iso_source = Some(iso_url.clone());
            match host_api
                .replace(&host_name, &kube::api::PostParams::default(), &updated)
                .await
            {
                Ok(mut written) => {
                    let mut status = written.status.clone().unwrap_or_default();
                    state_machine::apply_transition(
                        &mut status,
                        &written.spec,
                        HostState::Provisioning,
                        Utc::now(),
                    )?;
                    written.status = Some(status);
                    let data = serde_json::to_vec(&written).map_err(|e| {
                        ControllerError::Reconciliation(format!("serialize host status: {e}"))
                    })?;
                    host_api
                        .replace_status(&host_name, &kube::api::PostParams::default(), data)
                        .await?;
                }
                Err(e) if is_conflict(&e) => {
                    debug!("Host {} changed under us while setting boot ISO", host_name);
                    return Ok(Action::requeue(TRANSIENT_REQUEUE));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let client = self.redfish_client_for(&host).await?;
        let entry = QueueEntry {
            host_id: host.host_id(),
            kind: OpKind::Provision,
            bmc_address: host.spec.redfish_connection.address.clone(),
            host_deleting: false,
            client,
            operation: Operation::Provision {
                iso_url,
                boot: plan,
            },
        };

        let handle = match self.queue.submit(entry) {
            Ok(Submitted::Accepted(handle)) => handle,
            Ok(Submitted::Duplicate) => {
                debug!("Provision for {} already in flight", host.host_id());
                return Ok(Action::requeue(TRANSIENT_REQUEUE));
            }
            Err(SubmitError::QueueFull) => {
                // Backpressure, not an error: try again later.
                debug!("Provisioning queue full, delaying machine {}/{}", namespace, name);
                return Ok(Action::requeue(PERIODIC_REQUEUE));
            }
            Err(SubmitError::ShutDown) => {
                return Err(ControllerError::Reconciliation(
                    "provisioning queue is shut down".to_string(),
                ))
            }
        };

        match tokio::time::timeout(self.queue_wait_budget(), handle.wait()).await {
            Err(_) => {
                // Still running; the queue keeps at it, we come back.
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
            Ok(Ok(_)) => {
                self.mark_host_provisioned(namespace, &host_name).await?;
                publish_event(
                    &self.recorder,
                    machine,
                    EventType::Normal,
                    REASON_PROVISIONED,
                    "Provision",
                    format!("Boot configured and power on succeeded for {}", host.host_id()),
                )
                .await;
                Ok(Action::requeue(std::time::Duration::from_secs(5)))
            }
            Ok(Err(OpError::Redfish(e))) if !e.is_retryable() => {
                self.fail_machine(
                    machine,
                    namespace,
                    name,
                    REASON_BOOT_PARAM_UNSUPPORTED,
                    format!("boot configuration failed terminally: {e}"),
                )
                .await
            }
            Ok(Err(e)) => {
                warn!(
                    "Provision attempt for machine {}/{} failed: {}, requeueing",
                    namespace, name, e
                );
                publish_event(
                    &self.recorder,
                    machine,
                    EventType::Warning,
                    REASON_BOOT_CONFIG_FAILED,
                    "Provision",
                    e.to_string(),
                )
                .await;
                Ok(Action::requeue(TRANSIENT_REQUEUE))
            }
        }
    }

    /// Record Provisioning -> Provisioned on the host after the BMC
    /// sequence succeeded.
    async fn mark_host_provisioned(
        &self,
        namespace: &str,
        host_name: &str,
    ) -> Result<(), ControllerError> {
        let host_api = self.host_api(namespace);
        let mut host = host_api.get(host_name).await?;
        let mut status = host.status.clone().unwrap_or_default();
        if status.state == HostState::Provisioned {
            return Ok(());
        }
        state_machine::apply_transition(&mut status, &host.spec, HostState::Provisioned, Utc::now())?;
        status.observed_power_state = Some("On".to_string());
        host.status = Some(status);
        let data = serde_json::to_vec(&host)
            .map_err(|e| ControllerError::Reconciliation(format!("serialize host status: {e}")))?;
        match host_api
            .replace_status(host_name, &kube::api::PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            // Lost a status race; the next reconcile converges.
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Final step: providerID, addresses, readiness.
    async fn finish_provisioning(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
        host: &PhysicalHost,
    ) -> Result<Action, ControllerError> {
        let machine_api = self.machine_api(namespace);

        if machine.spec.provider_id.is_none() {
            let host_namespace = host.metadata.namespace.as_deref().unwrap_or(namespace);
            let host_name = host.metadata.name.as_deref().unwrap_or_default();
            let provider_id = crds::provider_id(host_namespace, host_name);
            let patch = serde_json::json!({ "spec": { "providerID": provider_id } });
            machine_api
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!("Machine {}/{} providerID set to {}", namespace, name, provider_id);
        }

        let mut status = machine.status.clone().unwrap_or_default();
        let newly_ready = !status.ready;
        status.phase = MachinePhase::Provisioned;
        status.ready = true;
        status.addresses = host
            .status
            .as_ref()
            .map(|s| s.addresses.clone())
            .unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::true_with_reason(CONDITION_INFRASTRUCTURE_READY, REASON_PROVISIONED),
        );
        patch_status(&machine_api, name, &status).await?;

        if newly_ready {
            publish_event(
                &self.recorder,
                machine,
                EventType::Normal,
                REASON_PROVISIONED,
                "Provision",
                format!("Machine is ready on {}", host.host_id()),
            )
            .await;
        }
        Ok(Action::await_change())
    }

    /// Terminal failure: one status transition, one event, then silence
    /// until the spec changes.
    async fn fail_machine(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
        reason: &str,
        message: String,
    ) -> Result<Action, ControllerError> {
        warn!("Machine {}/{} failed terminally: {}: {}", namespace, name, reason, message);
        let mut status = machine.status.clone().unwrap_or_default();
        status.phase = MachinePhase::Failed;
        status.ready = false;
        status.failure_reason = Some(reason.to_string());
        status.failure_message = Some(message.clone());
        set_condition(
            &mut status.conditions,
            Condition::false_with_reason(
                CONDITION_INFRASTRUCTURE_READY,
                reason,
                &message,
                ConditionSeverity::Error,
            ),
        );
        patch_status(&self.machine_api(namespace), name, &status).await?;
        publish_event(
            &self.recorder,
            machine,
            EventType::Warning,
            reason,
            "Provision",
            message,
        )
        .await;
        Ok(Action::await_change())
    }

    /// Finalizer path: release the owned host, then let the machine go
    /// once the host is observed unowned.
    async fn reconcile_machine_deletion(
        &self,
        machine: &Beskar7Machine,
        namespace: &str,
        name: &str,
    ) -> Result<Action, ControllerError> {
        let machine_api = self.machine_api(namespace);

        let has_finalizer = machine
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == BESKAR7_MACHINE_FINALIZER));
        if !has_finalizer {
            return Ok(Action::await_change());
        }

        let mut status = machine.status.clone().unwrap_or_default();
        if status.phase != MachinePhase::Deleting {
            status.phase = MachinePhase::Deleting;
            status.ready = false;
            patch_status(&machine_api, name, &status).await?;
        }

        if let Some(host) = self.find_owned_host(namespace, name).await? {
            let host_name = host.metadata.name.as_deref().unwrap_or_default().to_string();
            info!(
                "Machine {}/{} deleting, releasing host {}",
                namespace, name, host.host_id()
            );
            if let Err(e) = self.coordinator.release(namespace, &host_name, name).await {
                warn!("Release of {} failed: {}, requeueing", host.host_id(), e);
                let mut status = machine.status.clone().unwrap_or_default();
                set_condition(
                    &mut status.conditions,
                    Condition::false_with_reason(
                        CONDITION_PHYSICAL_HOST_ASSOCIATED,
                        REASON_RELEASE_PHYSICAL_HOST_FAILED,
                        &e.to_string(),
                        ConditionSeverity::Warning,
                    ),
                );
                patch_status(&machine_api, name, &status).await?;
                return Ok(Action::requeue(TRANSIENT_REQUEUE));
            }
            // Observe the release before dropping the finalizer.
            return Ok(Action::requeue(std::time::Duration::from_secs(5)));
        }

        remove_finalizer(&machine_api, machine, BESKAR7_MACHINE_FINALIZER).await?;
        info!("Machine {}/{} released its host and is done", namespace, name);
        Ok(Action::await_change())
    }
}
