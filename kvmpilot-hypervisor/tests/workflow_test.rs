//! Integration tests for the hypervisor facade.
//!
//! These tests drive whole workflows through the public API against a
//! scripted host.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kvmpilot_hypervisor::xml::XmlNode;
use kvmpilot_hypervisor::{
    HypervisorConfig, HypervisorError, KvmHypervisor, MockConnection, PciAddress, Result, VirtTool,
    VmListEntry, VmParams, VmState, VmStatus,
};

const DOMINFO_RUNNING: &str = "Id:             1\nName:           vm\nState:          running\n";

fn setup() -> (MockConnection, KvmHypervisor) {
    let conn = MockConnection::new();
    let hv = KvmHypervisor::new(Arc::new(conn.clone()));
    (conn, hv)
}

/// Test VF provisioning followed by passthrough of one VF.
#[tokio::test]
async fn test_vf_passthrough_workflow() {
    let (conn, hv) = setup();
    conn.on(
        "ls -l /sys/class/net/eth1/device/virtfn",
        0,
        "\
lrwxrwxrwx 1 root root 0 Jan 27 13:53 /sys/class/net/eth1/device/virtfn0 -> ../0000:18:02.0
lrwxrwxrwx 1 root root 0 Jan 27 13:53 /sys/class/net/eth1/device/virtfn1 -> ../0000:18:02.1",
        "",
    )
    .on("virsh dominfo", 0, DOMINFO_RUNNING, "");

    hv.set_number_of_vfs_for_pf("eth1", 2, true).await.unwrap();
    assert_eq!(hv.get_vfs_id_for_pf("eth1").await.unwrap(), vec![0, 1]);

    let pci = hv.get_pci_addresses_of_vfs("eth1").await.unwrap()[0];
    hv.attach_interface("vm", &pci).await.unwrap();

    let attach = conn.commands_starting_with("virsh attach-device");
    assert_eq!(attach, vec!["virsh attach-device vm --file /tmp/vf_0000_18_02_0.xml"]);
    let xml = conn.file("/tmp/vf_0000_18_02_0.xml").unwrap();
    assert!(xml.contains("bus='0x18' slot='0x2' function='0x0'"));
}

/// Test that a busy PF is reset before the new VF count is written.
#[tokio::test]
async fn test_busy_pf_is_reset() {
    let (conn, hv) = setup();
    conn.once("echo 8", 1, "", "write error: Device or resource busy");

    let pf: PciAddress = "0000:5e:00.0".parse().unwrap();
    hv.set_number_of_vfs_for_pf_by_pci(&pf, 8, false).await.unwrap();

    assert_eq!(
        conn.commands(),
        vec![
            "echo 8 > /sys/bus/pci/devices/0000:5e:00.0/sriov_numvfs",
            "echo 0 > /sys/bus/pci/devices/0000:5e:00.0/sriov_numvfs",
            "echo 8 > /sys/bus/pci/devices/0000:5e:00.0/sriov_numvfs",
        ]
    );
}

/// Test VM creation on network data that is partly in use.
#[tokio::test]
async fn test_create_vm_on_free_network_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network_data.conf");
    std::fs::write(
        &path,
        "# lab pool\n[kvm]\n10.10.10.10 AA:BB:CC:DD:EE:01\n10.10.10.11 AA:BB:CC:DD:EE:02\n",
    )
    .unwrap();

    let (conn, hv) = setup();
    conn.once("ping -c 1 -W 1 10.10.10.10", 0, "", "")
        .on("ping", 1, "", "");

    let free = hv.get_free_network_data(&path, 1).await.unwrap();
    assert_eq!(free[0].ip, Ipv4Addr::new(10, 10, 10, 11));

    let name = KvmHypervisor::get_name_from_ip(free[0].ip, "vm");
    let params = VmParams::new(name)
        .with_cpu(4)
        .with_memory(4096)
        .with_os_variant("rhel8.1")
        .with_mac(free[0].mac.clone());
    assert_eq!(hv.create_vm(&params).await.unwrap(), "vm-010-011");

    let install = &conn.commands_starting_with("virt-install")[0];
    assert!(install.contains("--vcpus=4"));
    assert!(install.contains("mac=aa:bb:cc:dd:ee:02"));
}

/// Test the virt-install retry on an unknown OS.
#[tokio::test]
async fn test_create_vm_retries_with_osinfo() {
    let (conn, hv) = setup();
    conn.once(
        "virt-install",
        1,
        "",
        "ERROR    --os-variant/--osinfo OS name is required, but no value was set or detected.",
    );

    hv.create_vm(&VmParams::new("vm")).await.unwrap();

    let installs = conn.commands_starting_with("virt-install");
    assert_eq!(installs.len(), 2);
    assert!(installs[1].ends_with("--osinfo detect=on,require=off"));
}

/// Test disk cloning feeding the install command.
#[tokio::test(start_paused = true)]
async fn test_create_vm_from_cloned_disk() {
    let (conn, hv) = setup();
    conn.add_file("/images/base.img", "")
        .on("stat -c %s /images/base.img", 0, "1000", "")
        .on("stat -c %s /vms/vm", 0, "1000", "");

    let params = VmParams::new("vm")
        .with_disk("/images/base.img")
        .with_clone_to("/vms/")
        .with_clone_timeout(120);
    hv.create_vm(&params).await.unwrap();

    let commands = conn.commands();
    assert!(commands.contains(&"cp /images/base.img /vms/vm".to_string()));
    let install = &conn.commands_starting_with("virt-install")[0];
    assert!(install.contains("/vms/vm"));
}

/// Test that a configured facade carries its settings into commands.
#[tokio::test]
async fn test_configured_timeouts() {
    let conn = MockConnection::new();
    let config = HypervisorConfig {
        virsh_timeout_secs: 15,
        sysfs_timeout_secs: 5,
        ..HypervisorConfig::default()
    };
    let hv = KvmHypervisor::with_config(Arc::new(conn.clone()), config);

    hv.start_vm("vm").await.unwrap();
    hv.set_number_of_vfs_for_pf("eth1", 1, false).await.unwrap();

    let calls = conn.calls();
    assert_eq!(calls[0].options.timeout, Some(Duration::from_secs(15)));
    assert_eq!(calls[2].options.timeout, Some(Duration::from_secs(5)));
}

/// Records what the facade asks of the virtualization tool.
#[derive(Default)]
struct RecordingTool {
    calls: Mutex<Vec<String>>,
    state: Mutex<Option<VmState>>,
}

impl RecordingTool {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl VirtTool for RecordingTool {
    async fn list_vms(&self, _all: bool) -> Vec<VmListEntry> {
        vec![VmListEntry {
            id: "1".to_string(),
            name: "vm".to_string(),
            state: VmState::Running,
        }]
    }

    async fn get_vm_status(&self, _name: &str) -> Result<VmStatus> {
        let state = self.state.lock().unwrap().clone().unwrap_or(VmState::Running);
        Ok(VmStatus {
            fields: vec![("State".to_string(), state.as_str().to_string())],
        })
    }

    async fn dump_xml(&self, name: &str) -> Result<XmlNode> {
        Err(HypervisorError::NotFound(name.to_string()))
    }

    async fn dump_xml_from_vm(&self, _name: &str) -> Option<String> {
        None
    }

    async fn define(&self, xml_path: &str) -> Result<String> {
        self.record(format!("define {xml_path}"));
        Ok(String::new())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        self.record(format!("start {name}"));
        *self.state.lock().unwrap() = Some(VmState::Running);
        Ok(())
    }

    async fn shutdown_vm(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {name}"));
        *self.state.lock().unwrap() = Some(VmState::ShutOff);
        Ok(())
    }

    async fn shutdown_gracefully_vm(&self, name: &str) -> Result<()> {
        self.record(format!("shutdown {name}"));
        *self.state.lock().unwrap() = Some(VmState::ShutOff);
        Ok(())
    }

    async fn reboot_vm(&self, name: &str) -> Result<()> {
        self.record(format!("reboot {name}"));
        Ok(())
    }

    async fn reset_vm(&self, name: &str) -> Result<()> {
        self.record(format!("reset {name}"));
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        self.record(format!("delete {name}"));
        Ok(())
    }

    async fn set_vcpus(&self, _name: &str, _count: u32) -> Result<()> {
        Ok(())
    }

    async fn set_vcpus_max_limit(&self, _name: &str, _count: u32) -> Result<()> {
        Ok(())
    }

    async fn attach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()> {
        self.record(format!("attach {name} {device_config} {state}"));
        Ok(())
    }

    async fn detach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()> {
        self.record(format!("detach {name} {device_config} {state}"));
        Ok(())
    }

    async fn detach_interface(&self, name: &str, mac: &str, state: &VmState) -> Result<()> {
        self.record(format!("detach-interface {name} {mac} {state}"));
        Ok(())
    }

    async fn attach_tap_interface_to_vm(&self, _name: &str, _network: &str) -> bool {
        true
    }

    async fn create_vm_network(&self, _xml_path: &str) -> bool {
        true
    }

    async fn destroy_vm_network(&self, _network: &str) -> bool {
        true
    }

    async fn get_vm_networks(&self) -> Vec<String> {
        Vec::new()
    }

    async fn get_net_dhcp_leases(&self, _network: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn get_mac_for_mng_vm_interface(&self, _name: &str) -> Result<String> {
        Ok("52:54:00:00:00:01".to_string())
    }

    async fn get_mng_ip_for_vm(&self, _mac: &str, _name: &str, _tries: u32) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::new(192, 168, 122, 10))
    }

    async fn get_mng_ip_for_vm_using_dhcp(&self, _mac: &str, _network: &str) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::new(192, 168, 122, 11))
    }
}

/// Test that the facade works with a different virtualization tool.
#[tokio::test(start_paused = true)]
async fn test_custom_virt_tool() {
    let conn = MockConnection::new();
    let tool = Arc::new(RecordingTool::default());
    let hv = KvmHypervisor::new(Arc::new(conn.clone())).with_virt_tool(tool.clone());

    hv.attach_vf("vm", "/tmp/vf.xml").await.unwrap();
    assert!(hv.stop_all_vms(false).await);
    hv.attach_vf("vm", "/tmp/vf.xml").await.unwrap();
    assert_eq!(
        hv.get_guest_mng_ip("vm").await.unwrap(),
        Ipv4Addr::new(192, 168, 122, 10)
    );

    assert_eq!(
        tool.calls(),
        vec![
            "attach vm /tmp/vf.xml running",
            "shutdown vm",
            "attach vm /tmp/vf.xml shut off",
        ]
    );
    // No virsh went through the connection
    assert!(conn.commands_starting_with("virsh").is_empty());
}
