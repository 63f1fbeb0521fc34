//! # kvmpilot
//!
//! Drives a KVM/libvirt host, local or over ssh, through `virsh`,
//! `virt-install` and sysfs.
//!
//! ## Usage
//! ```bash
//! kvmpilot --host 10.10.10.10 --user root run-vm --network-data network_data.conf --os-variant rhel8.1
//! kvmpilot --config /etc/kvmpilot/kvmpilot.yaml attach-pci-controllers vm_name --count 64
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use kvmpilot_cli::{run, Args, Config, OutputFormat};
use kvmpilot_hypervisor::KvmHypervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let config = Config::resolve(&args)?;

    if config.log_json {
        kvmpilot_common::init_logging_json(&config.log_level)?;
    } else {
        kvmpilot_common::init_logging(&config.log_level)?;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kvmpilot");
    config.log_summary();

    let hv = KvmHypervisor::with_config(config.connection.connect(), config.hypervisor.clone());

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = run(&args.command, &hv, OutputFormat::from_flag(args.json), &mut stdout).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}
