//! Boot-parameter strategy selection
//!
//! Pure decision logic: given the manufacturer/model a BMC reports and the
//! host's annotations, pick the mechanism used to hand kernel arguments to
//! the installer. No I/O and no process-wide state; same inputs always
//! produce the same strategy.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod kernel_args;

pub use kernel_args::kernel_args_for;

/// BIOS attribute used for kernel arguments unless overridden.
pub const DEFAULT_KERNEL_ARG_ATTRIBUTE: &str = "KernelArgs";

/// Server vendors with known boot-parameter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Vendor {
    Dell,
    Hpe,
    Lenovo,
    Supermicro,
    #[default]
    Unknown,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = format!("{self:?}").to_lowercase();
        write!(f, "{s}")
    }
}

impl Vendor {
    /// Detect the vendor from a Redfish `Manufacturer` string.
    ///
    /// Substring match on the normalized lowercase value, so
    /// "Dell Inc.", "DELL" and "dell" all resolve to [`Vendor::Dell`].
    pub fn from_manufacturer(manufacturer: &str) -> Vendor {
        let m = manufacturer.to_lowercase();
        if m.contains("dell") {
            Vendor::Dell
        } else if m.contains("hpe") || m.contains("hewlett packard") {
            Vendor::Hpe
        } else if m.contains("lenovo") {
            Vendor::Lenovo
        } else if m.contains("supermicro") {
            Vendor::Supermicro
        } else {
            Vendor::Unknown
        }
    }
}

/// One mechanism for passing kernel arguments to the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mechanism")]
pub enum BootParamMechanism {
    /// One-time kernel parameters via the EFI boot-variable override
    UefiTarget,

    /// Kernel args written into a named BIOS setting
    BiosAttribute {
        /// Name of the BIOS attribute, e.g. Dell's "KernelArgs"
        attribute: String,
    },

    /// No kernel-arg injection possible; only PreBakedISO provisioning works
    Unsupported,
}

impl BootParamMechanism {
    /// Bios-attribute mechanism with the given attribute name.
    pub fn bios_attribute(name: &str) -> Self {
        BootParamMechanism::BiosAttribute {
            attribute: name.to_string(),
        }
    }
}

/// The ordered strategy chain for a host: try `primary`, then each
/// fallback in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootParamStrategy {
    pub primary: BootParamMechanism,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<BootParamMechanism>,
}

impl BootParamStrategy {
    pub fn unsupported() -> Self {
        Self {
            primary: BootParamMechanism::Unsupported,
            fallbacks: Vec::new(),
        }
    }

    /// Whether kernel-arg injection is possible at all.
    pub fn supports_injection(&self) -> bool {
        self.primary != BootParamMechanism::Unsupported
    }

    /// The full chain: primary followed by fallbacks.
    pub fn chain(&self) -> impl Iterator<Item = &BootParamMechanism> {
        std::iter::once(&self.primary).chain(self.fallbacks.iter())
    }
}

/// Pick the boot-parameter strategy for a host.
///
/// Annotations take precedence over vendor detection:
/// `boot-parameter-mechanism` forces a mechanism outright (`unsupported`
/// disables injection and with it RemoteConfig provisioning), and
/// `bios-kernel-arg-attribute` renames the BIOS attribute wherever one is
/// used.
pub fn determine_strategy(
    manufacturer: &str,
    _model: &str,
    annotations: &BTreeMap<String, String>,
) -> BootParamStrategy {
    let attribute = annotations
        .get(crds::ANNOTATION_BIOS_KERNEL_ARG_ATTRIBUTE)
        .map(String::as_str)
        .unwrap_or(DEFAULT_KERNEL_ARG_ATTRIBUTE);

    if let Some(mechanism) = annotations.get(crds::ANNOTATION_BOOT_PARAM_MECHANISM) {
        return match mechanism.as_str() {
            "bios-attribute" => BootParamStrategy {
                primary: BootParamMechanism::bios_attribute(attribute),
                fallbacks: Vec::new(),
            },
            "uefi-target" => BootParamStrategy {
                primary: BootParamMechanism::UefiTarget,
                fallbacks: Vec::new(),
            },
            // "unsupported", or any value we do not recognize: refuse to
            // inject rather than guess.
            _ => BootParamStrategy::unsupported(),
        };
    }

    match Vendor::from_manufacturer(manufacturer) {
        Vendor::Dell => BootParamStrategy {
            primary: BootParamMechanism::bios_attribute(attribute),
            fallbacks: Vec::new(),
        },
        Vendor::Hpe => BootParamStrategy {
            primary: BootParamMechanism::UefiTarget,
            fallbacks: Vec::new(),
        },
        Vendor::Lenovo => BootParamStrategy {
            primary: BootParamMechanism::UefiTarget,
            fallbacks: vec![BootParamMechanism::bios_attribute(attribute)],
        },
        Vendor::Supermicro | Vendor::Unknown => BootParamStrategy {
            primary: BootParamMechanism::UefiTarget,
            fallbacks: vec![BootParamMechanism::bios_attribute(attribute)],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn vendor_detection_is_substring_based() {
        assert_eq!(Vendor::from_manufacturer("Dell Inc."), Vendor::Dell);
        assert_eq!(Vendor::from_manufacturer("HPE"), Vendor::Hpe);
        assert_eq!(
            Vendor::from_manufacturer("Hewlett Packard Enterprise"),
            Vendor::Hpe
        );
        assert_eq!(Vendor::from_manufacturer("LENOVO"), Vendor::Lenovo);
        assert_eq!(Vendor::from_manufacturer("Supermicro"), Vendor::Supermicro);
        assert_eq!(Vendor::from_manufacturer("QuantaGrid"), Vendor::Unknown);
    }

    #[test]
    fn dell_defaults_to_kernel_args_attribute() {
        let strategy = determine_strategy("Dell Inc.", "PowerEdge R650", &BTreeMap::new());
        assert_eq!(
            strategy.primary,
            BootParamMechanism::bios_attribute("KernelArgs")
        );
        assert!(strategy.fallbacks.is_empty());
    }

    #[test]
    fn hpe_defaults_to_uefi_target() {
        let strategy = determine_strategy("HPE", "ProLiant DL380", &BTreeMap::new());
        assert_eq!(strategy.primary, BootParamMechanism::UefiTarget);
    }

    #[test]
    fn lenovo_and_unknown_get_bios_fallback() {
        for manufacturer in ["Lenovo", "Supermicro", "No Name Corp"] {
            let strategy = determine_strategy(manufacturer, "x", &BTreeMap::new());
            assert_eq!(strategy.primary, BootParamMechanism::UefiTarget);
            assert_eq!(
                strategy.fallbacks,
                vec![BootParamMechanism::bios_attribute("KernelArgs")]
            );
        }
    }

    #[test]
    fn mechanism_annotation_overrides_vendor() {
        let strategy = determine_strategy(
            "HPE",
            "ProLiant",
            &annotations(&[(crds::ANNOTATION_BOOT_PARAM_MECHANISM, "unsupported")]),
        );
        assert_eq!(strategy, BootParamStrategy::unsupported());
        assert!(!strategy.supports_injection());

        let strategy = determine_strategy(
            "Dell Inc.",
            "PowerEdge",
            &annotations(&[(crds::ANNOTATION_BOOT_PARAM_MECHANISM, "uefi-target")]),
        );
        assert_eq!(strategy.primary, BootParamMechanism::UefiTarget);
    }

    #[test]
    fn attribute_annotation_renames_bios_setting() {
        let strategy = determine_strategy(
            "Dell Inc.",
            "PowerEdge",
            &annotations(&[(crds::ANNOTATION_BIOS_KERNEL_ARG_ATTRIBUTE, "BootArgs")]),
        );
        assert_eq!(strategy.primary, BootParamMechanism::bios_attribute("BootArgs"));

        // The rename also applies inside fallback chains.
        let strategy = determine_strategy(
            "Lenovo",
            "SR650",
            &annotations(&[(crds::ANNOTATION_BIOS_KERNEL_ARG_ATTRIBUTE, "BootArgs")]),
        );
        assert_eq!(
            strategy.fallbacks,
            vec![BootParamMechanism::bios_attribute("BootArgs")]
        );
    }

    #[test]
    fn strategy_is_pure() {
        let a = determine_strategy("Dell Inc.", "R650", &BTreeMap::new());
        let b = determine_strategy("Dell Inc.", "R650", &BTreeMap::new());
        assert_eq!(a, b);
    }
}
