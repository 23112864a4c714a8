//! Queue operation execution
//!
//! The concrete BMC call sequences behind each queue entry. Boot-parameter
//! injection walks the vendor strategy chain, falling back on
//! AttributeUnsupported/BootSourceUnavailable, and gives up only when the
//! chain is exhausted.

use std::sync::Arc;

use boot_policy::BootParamMechanism;
use redfish_client::{PowerAction, PowerState, RedfishClientTrait, RedfishError, SystemInfo};
use tracing::{debug, warn};

/// How kernel arguments reach the installer for one provision operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootParamPlan {
    /// PreBakedISO: the image carries its own configuration
    None,
    /// RemoteConfig: inject `kernel_args` via the first mechanism in
    /// `chain` that the BMC accepts
    Inject {
        kernel_args: Vec<String>,
        chain: Vec<BootParamMechanism>,
    },
}

/// Work carried by a queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert media, configure boot, power on
    Provision {
        iso_url: String,
        boot: BootParamPlan,
    },
    /// Eject media, power off
    Deprovision,
    /// Read system info (enrollment probe and heartbeat)
    Probe,
    /// Stuck-provisioning recovery: eject media and verify the BMC still
    /// answers, so the next provision attempt starts clean
    Recover,
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Done,
    Probed(SystemInfo),
}

pub(super) async fn run(
    client: &Arc<dyn RedfishClientTrait>,
    operation: &Operation,
) -> Result<OpOutcome, RedfishError> {
    match operation {
        Operation::Provision { iso_url, boot } => {
            provision(client.as_ref(), iso_url, boot).await?;
            Ok(OpOutcome::Done)
        }
        Operation::Deprovision => {
            deprovision(client.as_ref()).await?;
            Ok(OpOutcome::Done)
        }
        Operation::Probe => Ok(OpOutcome::Probed(client.get_system_info().await?)),
        Operation::Recover => {
            client.eject_virtual_media().await?;
            client.get_power_state().await?;
            Ok(OpOutcome::Done)
        }
    }
}

async fn provision(
    client: &dyn RedfishClientTrait,
    iso_url: &str,
    boot: &BootParamPlan,
) -> Result<(), RedfishError> {
    client.insert_virtual_media(iso_url).await?;

    if let BootParamPlan::Inject { kernel_args, chain } = boot {
        apply_kernel_args(client, kernel_args, chain).await?;
    }

    client.set_boot_source_iso().await?;
    client.set_power_state(PowerAction::On).await?;

    // The BMC accepted the power action; tolerate the transition window
    // but flag an outright refusal.
    let observed = client.get_power_state().await?;
    if !matches!(observed, PowerState::On | PowerState::PoweringOn) {
        return Err(RedfishError::PowerStateMismatch {
            wanted: PowerState::On.to_string(),
            observed: observed.to_string(),
        });
    }
    Ok(())
}

/// Try each mechanism in the strategy chain until one sticks.
async fn apply_kernel_args(
    client: &dyn RedfishClientTrait,
    kernel_args: &[String],
    chain: &[BootParamMechanism],
) -> Result<(), RedfishError> {
    for mechanism in chain {
        let result = match mechanism {
            BootParamMechanism::UefiTarget => client.set_uefi_boot_target(kernel_args).await,
            BootParamMechanism::BiosAttribute { attribute } => {
                client
                    .set_bios_attribute(
                        attribute,
                        serde_json::Value::String(kernel_args.join(" ")),
                    )
                    .await
            }
            BootParamMechanism::Unsupported => {
                return Err(RedfishError::AttributeUnsupported(
                    "kernel-argument injection disabled for this host".to_string(),
                ))
            }
        };

        match result {
            Ok(()) => {
                debug!("Kernel arguments applied via {:?}", mechanism);
                return Ok(());
            }
            Err(RedfishError::AttributeUnsupported(reason)) => {
                warn!("Boot-parameter mechanism {:?} unsupported ({}), trying next", mechanism, reason);
            }
            Err(RedfishError::BootSourceUnavailable(reason)) => {
                warn!("Boot-parameter mechanism {:?} unavailable ({}), trying next", mechanism, reason);
            }
            Err(e) => return Err(e),
        }
    }

    Err(RedfishError::AttributeUnsupported(
        "all boot-parameter mechanisms exhausted".to_string(),
    ))
}

async fn deprovision(client: &dyn RedfishClientTrait) -> Result<(), RedfishError> {
    client.eject_virtual_media().await?;
    client.set_power_state(PowerAction::Off).await
}
