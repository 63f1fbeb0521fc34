//! Virtualization tool abstraction.

use async_trait::async_trait;
use std::net::Ipv4Addr;

use crate::error::Result;
use crate::types::{VmListEntry, VmState, VmStatus};
use crate::xml::XmlNode;

/// Capability set of a command line virtualization tool.
///
/// The facade only talks to the tool through this trait, so a driver for a
/// different tool can be swapped in without touching the facade. Operations
/// documented as soft log failures and report an empty result instead of an
/// error.
#[async_trait]
pub trait VirtTool: Send + Sync {
    // =========================================================================
    // Inventory
    // =========================================================================

    /// List domains; `all` includes inactive ones. Soft.
    async fn list_vms(&self, all: bool) -> Vec<VmListEntry>;

    /// Parsed `dominfo` record.
    async fn get_vm_status(&self, name: &str) -> Result<VmStatus>;

    /// Parsed domain XML.
    async fn dump_xml(&self, name: &str) -> Result<XmlNode>;

    /// Raw domain XML, `None` when it cannot be fetched. Soft.
    async fn dump_xml_from_vm(&self, name: &str) -> Option<String>;

    /// Define a domain from an XML file; returns the tool output.
    async fn define(&self, xml_path: &str) -> Result<String>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn start_vm(&self, name: &str) -> Result<()>;

    /// Hard power off.
    async fn shutdown_vm(&self, name: &str) -> Result<()>;

    /// ACPI shutdown request.
    async fn shutdown_gracefully_vm(&self, name: &str) -> Result<()>;

    async fn reboot_vm(&self, name: &str) -> Result<()>;

    async fn reset_vm(&self, name: &str) -> Result<()>;

    /// Undefine the domain together with its NVRAM.
    async fn delete_vm(&self, name: &str) -> Result<()>;

    async fn set_vcpus(&self, name: &str, count: u32) -> Result<()>;

    async fn set_vcpus_max_limit(&self, name: &str, count: u32) -> Result<()>;

    // =========================================================================
    // Devices
    // =========================================================================

    /// Attach a device file. Unless the domain is running the change is
    /// written to the persistent configuration.
    async fn attach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()>;

    async fn detach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()>;

    /// Detach a hostdev interface by MAC.
    async fn detach_interface(&self, name: &str, mac: &str, state: &VmState) -> Result<()>;

    /// Attach a virtio tap interface on a libvirt network. Soft.
    async fn attach_tap_interface_to_vm(&self, name: &str, network: &str) -> bool;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Soft.
    async fn create_vm_network(&self, xml_path: &str) -> bool;

    /// Soft.
    async fn destroy_vm_network(&self, network: &str) -> bool;

    /// Soft.
    async fn get_vm_networks(&self) -> Vec<String>;

    /// Raw lease table of a libvirt network.
    async fn get_net_dhcp_leases(&self, network: &str) -> Result<String>;

    // =========================================================================
    // Management address
    // =========================================================================

    /// MAC of the first interface of the domain.
    async fn get_mac_for_mng_vm_interface(&self, name: &str) -> Result<String>;

    /// IPv4 address of `mac` reported by the guest agent, retried `tries` times.
    async fn get_mng_ip_for_vm(&self, mac: &str, name: &str, tries: u32) -> Result<Ipv4Addr>;

    /// IPv4 address of `mac` from the DHCP leases of `network`.
    async fn get_mng_ip_for_vm_using_dhcp(&self, mac: &str, network: &str) -> Result<Ipv4Addr>;
}
