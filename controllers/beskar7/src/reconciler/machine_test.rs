//! Unit tests for the Beskar7Machine reconciler
//!
//! Boot-artifact resolution is pure and fully covered here. The
//! kube-facing reconcile flow is exercised end to end against a cluster;
//! see the coordinator and queue tests for the concurrency pieces.

mod tests {
    use boot_policy::BootParamMechanism;
    use crds::*;

    use crate::queue::BootParamPlan;
    use crate::reconciler::machine::{resolve_boot_artifact, BootResolution};
    use crate::test_utils::*;

    fn dell_host() -> PhysicalHost {
        claimed_host("metal", "h-a", "m-1")
    }

    fn hpe_host_with_annotation(mechanism: &str) -> PhysicalHost {
        let mut host = claimed_host("metal", "h-b", "m-1");
        if let Some(details) = host
            .status
            .as_mut()
            .and_then(|s| s.hardware_details.as_mut())
        {
            details.manufacturer = "HPE".to_string();
            details.model = "ProLiant DL380".to_string();
        }
        host.metadata
            .annotations
            .get_or_insert_default()
            .insert(ANNOTATION_BOOT_PARAM_MECHANISM.to_string(), mechanism.to_string());
        host
    }

    #[test]
    fn dell_kairos_remote_config_uses_kernel_args_attribute() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "kairos");
        let host = dell_host();

        let resolution = resolve_boot_artifact(&machine.spec, &host);
        let BootResolution::Ready { iso_url, plan } = resolution else {
            panic!("expected a ready resolution, got {resolution:?}");
        };
        assert_eq!(iso_url, "https://images.example/installer.iso");
        let BootParamPlan::Inject { kernel_args, chain } = plan else {
            panic!("RemoteConfig must inject kernel args");
        };
        assert_eq!(
            kernel_args,
            vec!["config_url=https://config.example/node.yaml".to_string()]
        );
        assert_eq!(chain[0], BootParamMechanism::bios_attribute("KernelArgs"));
    }

    #[test]
    fn flatcar_uses_ignition_url_argument() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "flatcar");
        let BootResolution::Ready { plan, .. } = resolve_boot_artifact(&machine.spec, &dell_host())
        else {
            panic!("expected ready");
        };
        let BootParamPlan::Inject { kernel_args, .. } = plan else {
            panic!("expected injection");
        };
        assert_eq!(
            kernel_args,
            vec!["flatcar.ignition.config.url=https://config.example/node.yaml".to_string()]
        );
    }

    #[test]
    fn unsupported_annotation_fails_remote_config_terminally() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "kairos");
        let host = hpe_host_with_annotation("unsupported");

        let resolution = resolve_boot_artifact(&machine.spec, &host);
        let BootResolution::Terminal { reason, .. } = resolution else {
            panic!("expected terminal failure, got {resolution:?}");
        };
        assert_eq!(reason, REASON_BOOT_PARAM_UNSUPPORTED);
    }

    #[test]
    fn prebaked_iso_ignores_vendor_policy() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::PreBakedIso, "kairos");
        // Even a host that cannot inject kernel args provisions PreBakedISO.
        let host = hpe_host_with_annotation("unsupported");

        let resolution = resolve_boot_artifact(&machine.spec, &host);
        assert_eq!(
            resolution,
            BootResolution::Ready {
                iso_url: "https://images.example/installer.iso".to_string(),
                plan: BootParamPlan::None,
            }
        );
    }

    #[test]
    fn remote_config_without_config_url_is_terminal() {
        let mut machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "kairos");
        machine.spec.config_url = None;

        let BootResolution::Terminal { reason, .. } =
            resolve_boot_artifact(&machine.spec, &dell_host())
        else {
            panic!("expected terminal failure");
        };
        assert_eq!(reason, REASON_BOOT_CONFIG_FAILED);
    }

    #[test]
    fn unknown_os_family_is_terminal() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "talos");
        let BootResolution::Terminal { reason, .. } =
            resolve_boot_artifact(&machine.spec, &dell_host())
        else {
            panic!("expected terminal failure");
        };
        assert_eq!(reason, REASON_BOOT_PARAM_UNSUPPORTED);
    }

    #[test]
    fn network_boot_modes_are_not_implemented() {
        for mode in [ProvisioningMode::Pxe, ProvisioningMode::IPxe] {
            let machine = test_machine("metal", "m-1", mode, "kairos");
            let BootResolution::Terminal { reason, .. } =
                resolve_boot_artifact(&machine.spec, &dell_host())
            else {
                panic!("expected terminal failure for {mode:?}");
            };
            assert_eq!(reason, REASON_MODE_NOT_IMPLEMENTED);
        }
    }

    #[test]
    fn fallback_chain_never_contains_unsupported() {
        let machine = test_machine("metal", "m-1", ProvisioningMode::RemoteConfig, "kairos");
        let mut host = dell_host();
        if let Some(details) = host
            .status
            .as_mut()
            .and_then(|s| s.hardware_details.as_mut())
        {
            details.manufacturer = "Lenovo".to_string();
        }

        let BootResolution::Ready { plan, .. } = resolve_boot_artifact(&machine.spec, &host) else {
            panic!("expected ready");
        };
        let BootParamPlan::Inject { chain, .. } = plan else {
            panic!("expected injection");
        };
        assert!(!chain.is_empty());
        assert!(chain.iter().all(|m| *m != BootParamMechanism::Unsupported));
    }

    #[tokio::test]
    #[ignore] // Needs a kube API fixture; covered by the e2e suite today
    async fn reconcile_claims_then_provisions() {
        // Setup: one Available host, a RemoteConfig machine, a mock BMC.
        // Expected: PhysicalHostAssociated=True, host bootIsoSource set,
        // one provision entry submitted, providerID
        // beskar7://metal/h-a once the host reaches Provisioned.
    }
}
