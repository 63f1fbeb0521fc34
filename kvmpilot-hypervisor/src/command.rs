//! Command line and device XML construction.
//!
//! Everything here is pure: functions take parameters and return the exact
//! string to execute or write. The facade and the virsh adapter own the I/O.

use serde::{Deserialize, Serialize};

use crate::pci::PciAddress;
use crate::types::{Firmware, TrunkAction, VmParams};

/// Built-in hostdev template for an SR-IOV VF.
pub const VF_TEMPLATE: &str = include_str!("../templates/vf.xml");

/// Built-in template for a `pcie-root-port` controller.
pub const PCI_CONTROLLER_TEMPLATE: &str = include_str!("../templates/pci_controller.xml");

/// Built-in hostdev template for a mediated device.
pub const MDEV_TEMPLATE: &str = include_str!("../templates/mdev.xml");

// =============================================================================
// VIRT-INSTALL
// =============================================================================

/// Extra flags for VMs with more vCPUs than the default IOAPIC handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LargeVcpuPolicy {
    /// Flags are added when the vCPU count is strictly above this.
    pub threshold: u32,
    pub flags: Vec<String>,
}

impl Default for LargeVcpuPolicy {
    fn default() -> Self {
        Self {
            threshold: 128,
            flags: vec![
                "--iommu model=intel,driver.intremap=on,driver.eim=on,driver.caching_mode=on".to_string(),
                "--features apic=on,ioapic.driver=qemu".to_string(),
            ],
        }
    }
}

impl LargeVcpuPolicy {
    pub fn applies_to(&self, vcpus: u32) -> bool {
        vcpus > self.threshold
    }
}

/// Install method appended after virt-install rejected the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallSuffix {
    /// No OS variant could be detected
    OsInfo,
    /// No install medium was given
    Import,
}

impl InstallSuffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OsInfo => "--osinfo detect=on,require=off",
            Self::Import => "--import",
        }
    }

    /// Pick the suffix that fixes a virt-install rejection, if known.
    pub fn from_stderr(stderr: &str) -> Option<Self> {
        if stderr.contains("OS name is required") {
            Some(Self::OsInfo)
        } else if stderr.contains("An install method must be specified") {
            Some(Self::Import)
        } else {
            None
        }
    }
}

fn boot_order(params: &VmParams, has_disk: bool) -> String {
    let mut order = if !params.boot_order.is_empty() {
        params.boot_order.join(",")
    } else if has_disk {
        "hd".to_string()
    } else {
        "network,hd".to_string()
    };
    if params.firmware == Firmware::Uefi {
        order.push_str(",uefi");
    }
    order
}

/// Render the virt-install command for `params`.
///
/// `disk` is the image the VM boots from, which is the clone destination
/// when the source image was cloned first.
pub fn virt_install(
    params: &VmParams,
    disk: Option<&str>,
    policy: &LargeVcpuPolicy,
    suffix: Option<InstallSuffix>,
) -> String {
    let mut vcpus = params.cpu_count.to_string();
    if let Some(threads) = params.threads {
        vcpus.push_str(&format!(",threads={threads}"));
    }

    let mut parts = vec![
        "virt-install".to_string(),
        format!("--name={}", params.name),
        format!("--memory={}", params.memory_mib),
        format!("--vcpus={vcpus}"),
        format!("--machine={}", params.machine),
        "--noautoconsole".to_string(),
    ];

    if policy.applies_to(params.cpu_count) {
        parts.extend(policy.flags.iter().cloned());
    }

    let mut network = format!("--network=bridge:{}", params.bridge);
    if let Some(mac) = &params.mac_address {
        network.push_str(&format!(",mac={}", mac.to_lowercase()));
    }
    network.push_str(",model=virtio");
    parts.push(network);

    if let Some(os) = &params.os_variant {
        parts.push(format!("--os-variant={os}"));
    }

    match disk {
        Some(path) => {
            let mut flag = format!("--disk path={path}");
            if let Some(bus) = &params.disk_bus {
                flag.push_str(&format!(",bus={bus}"));
            }
            parts.push(flag);
        }
        None => parts.push("--disk=none".to_string()),
    }

    if let Some(arch) = &params.arch {
        parts.push(format!("--arch {arch}"));
    }

    parts.push(format!("--boot={}", boot_order(params, disk.is_some())));
    parts.push(format!("--graphics {}", params.graphics));

    if let Some(cpu) = &params.cpu {
        parts.push(format!("--cpu={cpu}"));
    }

    if let Some(suffix) = suffix {
        parts.push(suffix.as_str().to_string());
    }

    parts.join(" ")
}

// =============================================================================
// DEVICE TEMPLATES
// =============================================================================

/// Substitute `{{key}}` placeholders.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{key}}}}}"), value)
    })
}

/// PCI placeholder values: `0x`-prefixed lowercase hex, no padding.
pub fn pci_values(pci: &PciAddress) -> Vec<(&'static str, String)> {
    vec![
        ("domain", format!("{:#x}", pci.domain)),
        ("bus", format!("{:#x}", pci.bus)),
        ("slot", format!("{:#x}", pci.slot)),
        ("func", format!("{:#x}", pci.func)),
    ]
}

pub fn vf_xml(template: &str, pci: &PciAddress) -> String {
    render_template(template, &pci_values(pci))
}

/// Controller XML; index and chassis are decimal, port is hex.
pub fn pci_controller_xml(template: &str, pci: &PciAddress, index: u32, chassis: u32, port: u32) -> String {
    let mut values = pci_values(pci);
    values.push(("index", index.to_string()));
    values.push(("chassis", chassis.to_string()));
    values.push(("port", format!("{port:#x}")));
    render_template(template, &values)
}

pub fn mdev_xml(template: &str, uuid: &str) -> String {
    render_template(template, &[("uuid", uuid.to_string())])
}

// =============================================================================
// HOST COMMANDS
// =============================================================================

pub fn ping_probe(ip: &str) -> String {
    format!("ping -c 1 -W 1 {ip}")
}

pub fn copy_file(source: &str, destination: &str) -> String {
    format!("cp {source} {destination}")
}

pub fn file_size(path: &str) -> String {
    format!("stat -c %s {path}")
}

pub fn replace_uuid_placeholder(path: &str, uuid: &str) -> String {
    format!("sed -i 's/<VM_UUID>/{uuid}/g' {path}")
}

/// Available host memory in MB.
pub const FREE_MEMORY: &str = "free -m | awk '/^Mem:/ {print $7}'";

pub const LSPCI_KERNEL: &str = "lspci -k";

pub fn ip_link_show(interface: &str) -> String {
    format!("ip link show dev {interface}")
}

pub fn interface_exists(interface: &str) -> String {
    format!("ls /sys/class/net/{interface}")
}

// -----------------------------------------------------------------------------
// SR-IOV
// -----------------------------------------------------------------------------

pub fn list_vfs(interface: &str) -> String {
    format!("ls -l /sys/class/net/{interface}/device/virtfn*")
}

pub fn list_vfs_by_pci(pf: &PciAddress) -> String {
    format!("ls -l /sys/bus/pci/devices/{pf}/virtfn*")
}

pub fn list_vf(interface: &str, vf_id: u32) -> String {
    format!("ls -l /sys/class/net/{interface}/device/virtfn{vf_id}")
}

pub fn list_vf_by_pci(pf: &PciAddress, vf_id: u32) -> String {
    format!("ls -l /sys/bus/pci/devices/{pf}/virtfn{vf_id}")
}

pub fn set_numvfs(interface: &str, count: u32) -> String {
    format!("echo {count} > /sys/class/net/{interface}/device/sriov_numvfs")
}

pub fn set_numvfs_by_pci(pf: &PciAddress, count: u32) -> String {
    format!("echo {count} > /sys/bus/pci/devices/{pf}/sriov_numvfs")
}

fn sriov_dir(interface: &str) -> String {
    format!("/sys/class/net/{interface}/device/sriov")
}

pub fn set_trunk(interface: &str, action: TrunkAction, vlan: u32, vf_id: u32) -> String {
    format!(
        "echo {} {vlan} > {}/{vf_id}/trunk",
        action.as_str(),
        sriov_dir(interface)
    )
}

pub fn get_trunk(interface: &str, vf_id: u32) -> String {
    format!("cat {}/{vf_id}/trunk", sriov_dir(interface))
}

pub fn set_tpid(interface: &str, tpid: &str) -> String {
    format!("echo {tpid} > {}/tpid", sriov_dir(interface))
}

pub fn get_tpid(interface: &str) -> String {
    format!("cat {}/tpid", sriov_dir(interface))
}

// -----------------------------------------------------------------------------
// Mediated devices
// -----------------------------------------------------------------------------

pub fn create_mdev(uuid: &str, parent: &PciAddress, mdev_type: &str) -> String {
    format!(
        "echo \"{uuid}\" | tee /sys/class/mdev_bus/{}/mdev_supported_types/{mdev_type}/create",
        parent.shell_escaped()
    )
}

pub fn destroy_mdev(uuid: &str) -> String {
    format!("echo 1 > /sys/bus/mdev/devices/{uuid}/remove")
}

/// Prints the parent PF address of a mediated device.
pub fn mdev_parent(uuid: &str) -> String {
    format!("basename $(dirname $(readlink -f /sys/bus/mdev/devices/{uuid}))")
}

pub const LIST_MDEVS: &str = "ls /sys/bus/mdev/devices/";

// -----------------------------------------------------------------------------
// Bridges
// -----------------------------------------------------------------------------

pub fn add_bridge(bridge: &str) -> String {
    format!("brctl addbr {bridge}")
}

pub fn delete_bridge(bridge: &str) -> String {
    format!("brctl delbr {bridge}")
}

pub fn add_bridge_interface(bridge: &str, interface: &str) -> String {
    format!("brctl addif {bridge} {interface}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> VmParams {
        VmParams::new("foo")
            .with_os_variant("rhel8.1")
            .with_mac("AA:BB:CC:DD:EE:62")
    }

    const NET: &str = "--network=bridge:br0,mac=aa:bb:cc:dd:ee:62,model=virtio";

    #[test]
    fn test_virt_install_no_disk() {
        let cmd = virt_install(&base(), None, &LargeVcpuPolicy::default(), None);
        assert_eq!(
            cmd,
            format!(
                "virt-install --name=foo --memory=1024 --vcpus=2 --machine=pc --noautoconsole \
                 {NET} --os-variant=rhel8.1 --disk=none --boot=network,hd,uefi --graphics none"
            )
        );
    }

    #[test]
    fn test_virt_install_disk_with_bus_and_arch() {
        let params = base().with_disk_bus("scsi").with_arch("aarch64");
        let cmd = virt_install(&params, Some("/away/image.img"), &LargeVcpuPolicy::default(), None);
        assert_eq!(
            cmd,
            format!(
                "virt-install --name=foo --memory=1024 --vcpus=2 --machine=pc --noautoconsole \
                 {NET} --os-variant=rhel8.1 --disk path=/away/image.img,bus=scsi --arch aarch64 \
                 --boot=hd,uefi --graphics none"
            )
        );
    }

    #[test]
    fn test_virt_install_boot_order_and_threads() {
        let params = base().with_boot_order(["hd", "network"]).with_threads(2);
        let cmd = virt_install(&params, None, &LargeVcpuPolicy::default(), None);
        assert!(cmd.contains("--vcpus=2,threads=2 "));
        assert!(cmd.contains("--boot=hd,network,uefi "));
    }

    #[test]
    fn test_virt_install_legacy_graphics_cpu() {
        let params = base()
            .with_firmware(Firmware::Legacy)
            .with_graphics("vnc")
            .with_cpu_features("core2duo,+x2apic,disable=vmx")
            .with_bridge("virbr0");
        let cmd = virt_install(&params, None, &LargeVcpuPolicy::default(), None);
        assert!(cmd.contains("--network=bridge:virbr0,mac=aa:bb:cc:dd:ee:62,model=virtio"));
        assert!(cmd.ends_with("--boot=network,hd --graphics vnc --cpu=core2duo,+x2apic,disable=vmx"));
    }

    #[test]
    fn test_virt_install_large_vcpu() {
        let params = base().with_cpu(256);
        let cmd = virt_install(&params, None, &LargeVcpuPolicy::default(), None);
        assert_eq!(
            cmd,
            format!(
                "virt-install --name=foo --memory=1024 --vcpus=256 --machine=pc --noautoconsole \
                 --iommu model=intel,driver.intremap=on,driver.eim=on,driver.caching_mode=on \
                 --features apic=on,ioapic.driver=qemu \
                 {NET} --os-variant=rhel8.1 --disk=none --boot=network,hd,uefi --graphics none"
            )
        );

        let at_threshold = virt_install(&base().with_cpu(128), None, &LargeVcpuPolicy::default(), None);
        assert!(!at_threshold.contains("--iommu"));

        let custom = LargeVcpuPolicy {
            threshold: 64,
            flags: vec!["--features apic=on".to_string()],
        };
        let cmd = virt_install(&base().with_cpu(96), None, &custom, None);
        assert!(cmd.contains("--noautoconsole --features apic=on --network"));
    }

    #[test]
    fn test_virt_install_suffix() {
        let cmd = virt_install(&base(), Some("/a.img"), &LargeVcpuPolicy::default(), Some(InstallSuffix::Import));
        assert!(cmd.ends_with("--boot=hd,uefi --graphics none --import"));
    }

    #[test]
    fn test_virt_install_is_stable() {
        let params = base().with_disk_bus("virtio").with_cpu_features("host");
        let policy = LargeVcpuPolicy::default();
        assert_eq!(
            virt_install(&params, Some("/x.img"), &policy, None),
            virt_install(&params, Some("/x.img"), &policy, None)
        );
    }

    #[test]
    fn test_install_suffix_from_stderr() {
        assert_eq!(
            InstallSuffix::from_stderr("--os-variant/--osinfo OS name is required, but no value was set"),
            Some(InstallSuffix::OsInfo)
        );
        assert_eq!(
            InstallSuffix::from_stderr("ERROR\n An install method must be specified\n"),
            Some(InstallSuffix::Import)
        );
        assert_eq!(InstallSuffix::from_stderr("permission denied"), None);
    }

    #[test]
    fn test_pci_controller_xml() {
        let pci = PciAddress::new(0, 0, 0x1f, 7);
        let xml = pci_controller_xml(PCI_CONTROLLER_TEMPLATE, &pci, 10, 10, 0x1f);
        assert!(xml.contains("index='10'"));
        assert!(xml.contains("chassis='10' port='0x1f'"));
        assert!(xml.contains("domain='0x0' bus='0x0' slot='0x1f' function='0x7'"));
        assert!(!xml.contains("{{"));
    }

    #[test]
    fn test_vf_and_mdev_xml() {
        let xml = vf_xml(VF_TEMPLATE, &PciAddress::new(0, 24, 16, 1));
        assert!(xml.contains("domain='0x0' bus='0x18' slot='0x10' function='0x1'"));

        let xml = mdev_xml(MDEV_TEMPLATE, "a1234");
        assert!(xml.contains("uuid='a1234'"));
    }

    #[test]
    fn test_host_commands() {
        assert_eq!(
            create_mdev("a1234", &PciAddress::new(0, 185, 0, 0), "ice-vdcm"),
            r#"echo "a1234" | tee /sys/class/mdev_bus/0000\:b9\:00.0/mdev_supported_types/ice-vdcm/create"#
        );
        assert_eq!(
            set_trunk("eth1", TrunkAction::Add, 200, 5),
            "echo add 200 > /sys/class/net/eth1/device/sriov/5/trunk"
        );
        assert_eq!(set_tpid("eth3", "88a8"), "echo 88a8 > /sys/class/net/eth3/device/sriov/tpid");
        assert_eq!(
            set_numvfs_by_pci(&PciAddress::new(0, 24, 16, 1), 7),
            "echo 7 > /sys/bus/pci/devices/0000:18:10.1/sriov_numvfs"
        );
    }
}
