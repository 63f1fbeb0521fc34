//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use kvmpilot_hypervisor::{ControllerLayout, Firmware, PciAddress};

/// kvmpilot - KVM/libvirt host automation
#[derive(Parser, Debug)]
#[command(name = "kvmpilot")]
#[command(about = "kvmpilot - VM lifecycle, SR-IOV and device automation for KVM hosts")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "KVMPILOT_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Manage a remote host over ssh instead of the local machine
    #[arg(long)]
    pub host: Option<String>,

    /// ssh user for --host
    #[arg(long)]
    pub user: Option<String>,

    /// ssh port for --host
    #[arg(long)]
    pub port: Option<u16>,

    /// Print results as JSON instead of YAML
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List VMs
    List {
        /// Include inactive VMs
        #[arg(long)]
        all: bool,
    },

    /// Show the dominfo record of a VM
    Status { name: String },

    /// Stop every running VM
    StopAll {
        /// Power off instead of requesting an ACPI shutdown
        #[arg(long)]
        force: bool,
    },

    /// Start every VM that is not running
    StartAll,

    /// Set the number of SR-IOV VFs of a PF
    SetVfs {
        /// PF network interface
        #[arg(long, conflicts_with = "pf", required_unless_present = "pf")]
        interface: Option<String>,

        /// PF PCI address, e.g. 0000:5e:00.0
        #[arg(long)]
        pf: Option<PciAddress>,

        count: u32,

        /// Skip counting the VFs afterwards
        #[arg(long)]
        no_check: bool,
    },

    /// Print network data entries whose address is unused
    FreeNetworkData {
        /// Network-data file with a [kvm] section
        network_data: PathBuf,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Create a VM on free network data
    RunVm(RunVmArgs),

    /// Create a mediated device and a VM that uses it
    RunSiovVm {
        #[command(flatten)]
        vm: RunVmArgs,

        /// PCI address of the mdev capable PF
        #[arg(long)]
        parent: PciAddress,

        /// Where to write the mdev hostdev XML on the host
        #[arg(long, default_value = "/tmp/mdev.xml")]
        mdev_xml: String,
    },

    /// Add pcie-root-port controllers to a VM
    AttachPciControllers(AttachPciControllersArgs),
}

/// VM shape shared by the VM creating subcommands.
#[derive(ClapArgs, Debug, Clone)]
pub struct RunVmArgs {
    /// Network-data file with a [kvm] section
    #[arg(long)]
    pub network_data: PathBuf,

    /// Prefix of the generated VM name
    #[arg(long, default_value = "vm")]
    pub prefix: String,

    #[arg(long, default_value_t = 2)]
    pub cpu: u32,

    /// Memory in MiB
    #[arg(long, default_value_t = 2048)]
    pub memory: u64,

    #[arg(long)]
    pub os_variant: Option<String>,

    /// Boot with legacy BIOS instead of UEFI
    #[arg(long)]
    pub legacy: bool,

    #[arg(long)]
    pub bridge: Option<String>,

    /// Disk image to boot from
    #[arg(long)]
    pub disk: Option<String>,

    /// Clone the disk into this directory first
    #[arg(long, requires = "disk")]
    pub clone_to: Option<String>,

    /// Define the VM from this domain XML instead of virt-install
    #[arg(long, conflicts_with = "disk")]
    pub xml_template: Option<String>,

    /// Wait until the VM is running
    #[arg(long)]
    pub wait: bool,
}

impl RunVmArgs {
    pub fn firmware(&self) -> Firmware {
        if self.legacy {
            Firmware::Legacy
        } else {
            Firmware::Uefi
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AttachPciControllersArgs {
    pub name: String,

    #[arg(long, default_value_t = 64)]
    pub count: usize,

    #[arg(long, default_value = "0x0000", value_parser = parse_u32)]
    pub domain: u32,

    #[arg(long, default_value = "0x00", value_parser = parse_u8)]
    pub first_bus: u8,

    #[arg(long, default_value = "0x01", value_parser = parse_u8)]
    pub first_func: u8,

    #[arg(long, default_value = "0x01", value_parser = parse_u32)]
    pub first_port: u32,

    #[arg(long, default_value = "0x00", value_parser = parse_u8)]
    pub first_slot: u8,

    #[arg(long, default_value = "1", value_parser = parse_u32)]
    pub first_chassis: u32,

    #[arg(long, default_value = "12", value_parser = parse_u32)]
    pub first_index: u32,
}

impl AttachPciControllersArgs {
    pub fn layout(&self) -> ControllerLayout {
        ControllerLayout {
            domain: self.domain,
            first_bus: self.first_bus,
            first_func: self.first_func,
            first_port: self.first_port,
            first_slot: self.first_slot,
            first_chassis: self.first_chassis,
            first_index: self.first_index,
        }
    }
}

/// Decimal or `0x` prefixed hex.
fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    u8::try_from(parse_number(s)?).map_err(|_| format!("'{s}' does not fit in 8 bits"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    u32::try_from(parse_number(s)?).map_err(|_| format!("'{s}' does not fit in 32 bits"))
}
