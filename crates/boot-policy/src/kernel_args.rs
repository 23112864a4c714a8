//! Kernel-argument construction per OS family
//!
//! RemoteConfig provisioning boots a generic installer ISO and points it at
//! a config URL through a kernel argument whose name differs per OS family.

/// Build the kernel arguments for a RemoteConfig boot.
///
/// Returns `None` for OS families without a known config-URL argument;
/// callers surface that as a boot-configuration failure rather than
/// guessing.
pub fn kernel_args_for(os_family: &str, config_url: &str) -> Option<Vec<String>> {
    match os_family.to_lowercase().as_str() {
        "kairos" => Some(vec![format!("config_url={config_url}")]),
        "flatcar" => Some(vec![format!("flatcar.ignition.config.url={config_url}")]),
        "leapmicro" => Some(vec![format!("combustion.path={config_url}")]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kairos_config_url() {
        assert_eq!(
            kernel_args_for("kairos", "https://x/y.yaml"),
            Some(vec!["config_url=https://x/y.yaml".to_string()])
        );
    }

    #[test]
    fn flatcar_ignition_url() {
        assert_eq!(
            kernel_args_for("flatcar", "https://cfg/ign.json"),
            Some(vec![
                "flatcar.ignition.config.url=https://cfg/ign.json".to_string()
            ])
        );
    }

    #[test]
    fn leap_micro_combustion_path_case_insensitive() {
        assert_eq!(
            kernel_args_for("LeapMicro", "https://cfg/combustion"),
            Some(vec!["combustion.path=https://cfg/combustion".to_string()])
        );
    }

    #[test]
    fn unknown_family_yields_none() {
        assert_eq!(kernel_args_for("talos", "https://cfg"), None);
    }
}
