//! Prints the CRD manifests for all Beskar7 kinds to stdout.
//!
//! Usage: `cargo run --bin crdgen > config/crd/beskar7.yaml`

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let docs = [
        serde_yaml::to_string(&crds::PhysicalHost::crd())?,
        serde_yaml::to_string(&crds::Beskar7Machine::crd())?,
        serde_yaml::to_string(&crds::Beskar7MachineTemplate::crd())?,
        serde_yaml::to_string(&crds::Beskar7Cluster::crd())?,
    ];
    println!("{}", docs.join("---\n"));
    Ok(())
}
