//! Prints the CustomResourceDefinition manifests for all IPAM kinds.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds.yaml`

use anyhow::Result;
use crds::{AddressBlock, AddressPool, BlockRequest};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds = [AddressPool::crd(), AddressBlock::crd(), BlockRequest::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
