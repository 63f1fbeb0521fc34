//! Type definitions for VM parameters, status records and device details.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::HypervisorError;
use crate::pci::PciAddress;

// =============================================================================
// VM PARAMETERS
// =============================================================================

/// Firmware mode of a new VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Uefi,
    Legacy,
}

/// Parameters of one VM to create.
///
/// When both `disk` and `clone_dest_dir` are set the disk is cloned to
/// `clone_dest_dir/name` first and the VM boots from the copy. With only
/// `disk` set the image is used in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmParams {
    pub name: String,
    pub cpu_count: u32,
    /// Threads per core, rendered as `--vcpus=N,threads=T`
    pub threads: Option<u32>,
    /// Memory in MiB
    pub memory_mib: u64,
    pub machine: String,
    pub firmware: Firmware,
    pub os_variant: Option<String>,
    pub arch: Option<String>,
    pub mac_address: Option<String>,
    pub bridge: String,
    pub disk: Option<String>,
    pub disk_bus: Option<String>,
    /// Explicit boot devices, e.g. `["hd", "network"]`
    pub boot_order: Vec<String>,
    pub graphics: String,
    /// Raw `--cpu` value, e.g. `core2duo,+x2apic,disable=vmx`
    pub cpu: Option<String>,
    /// Pre-built domain XML; when set the VM is defined from it instead of
    /// being installed with virt-install.
    pub xml_template: Option<String>,
    pub clone_dest_dir: Option<String>,
    /// Clone timeout in seconds
    pub clone_timeout: Option<u64>,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            name: "vm".to_string(),
            cpu_count: 2,
            threads: None,
            memory_mib: 1024,
            machine: "pc".to_string(),
            firmware: Firmware::Uefi,
            os_variant: None,
            arch: None,
            mac_address: None,
            bridge: "br0".to_string(),
            disk: None,
            disk_bus: None,
            boot_order: Vec::new(),
            graphics: "none".to_string(),
            cpu: None,
            xml_template: None,
            clone_dest_dir: None,
            clone_timeout: None,
        }
    }
}

impl VmParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_cpu(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_firmware(mut self, firmware: Firmware) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn with_os_variant(mut self, os_variant: impl Into<String>) -> Self {
        self.os_variant = Some(os_variant.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    pub fn with_disk(mut self, path: impl Into<String>) -> Self {
        self.disk = Some(path.into());
        self
    }

    pub fn with_disk_bus(mut self, bus: impl Into<String>) -> Self {
        self.disk_bus = Some(bus.into());
        self
    }

    pub fn with_boot_order<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.boot_order = devices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_graphics(mut self, graphics: impl Into<String>) -> Self {
        self.graphics = graphics.into();
        self
    }

    pub fn with_cpu_features(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = Some(cpu.into());
        self
    }

    pub fn with_xml_template(mut self, path: impl Into<String>) -> Self {
        self.xml_template = Some(path.into());
        self
    }

    /// Clone `disk` into `dir` before creating the VM.
    pub fn with_clone_to(mut self, dir: impl Into<String>) -> Self {
        self.clone_dest_dir = Some(dir.into());
        self
    }

    pub fn with_clone_timeout(mut self, secs: u64) -> Self {
        self.clone_timeout = Some(secs);
        self
    }
}

// =============================================================================
// VM STATE
// =============================================================================

/// Domain state as printed by `virsh list` and `virsh dominfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    PmSuspended,
    /// Anything virsh prints that is not covered above.
    Other(String),
}

impl VmState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Idle,
            "paused" => Self::Paused,
            "in shutdown" => Self::InShutdown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::PmSuspended,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Paused => "paused",
            Self::InShutdown => "in shutdown",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `field: value` record from `virsh dominfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub fields: Vec<(String, String)>,
}

impl VmStatus {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `State` field, if present.
    pub fn state(&self) -> Option<VmState> {
        self.get("State").map(VmState::parse)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One row of `virsh list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmListEntry {
    /// Domain id, `-` for inactive domains
    pub id: String,
    pub name: String,
    pub state: VmState,
}

// =============================================================================
// DEVICES
// =============================================================================

/// SR-IOV virtual function as reported by `ip link show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfDetail {
    pub id: u32,
    pub mac_address: String,
    pub spoofchk: bool,
    pub trust: bool,
}

/// Host-side VF address paired with the address it has inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevPair {
    pub host: PciAddress,
    pub guest: PciAddress,
}

/// Mediated device attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdevDetail {
    pub uuid: String,
    pub guest: PciAddress,
}

/// Mediated device created on a parent PF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdevHandle {
    pub uuid: String,
    pub parent: PciAddress,
}

/// One (IP, MAC) candidate from a network-data file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkDataEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
}

impl NetworkDataEntry {
    pub fn new(ip: Ipv4Addr, mac: impl Into<String>) -> Self {
        Self { ip, mac: mac.into() }
    }
}

/// VLAN trunk modification on a VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkAction {
    Add,
    Rem,
}

impl TrunkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Rem => "rem",
        }
    }
}

impl FromStr for TrunkAction {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "rem" => Ok(Self::Rem),
            other => Err(HypervisorError::UnsupportedAction(other.to_string())),
        }
    }
}
