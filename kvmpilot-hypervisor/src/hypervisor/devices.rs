//! Device attachment, PCI controllers and mediated devices.

use tracing::{debug, info, instrument, warn};

use super::KvmHypervisor;
use crate::command;
use crate::config::TemplateKind;
use crate::connection::ExecOptions;
use crate::error::{HypervisorError, Result};
use crate::parser;
use crate::pci::PciAddress;
use crate::types::{HostdevPair, MdevDetail, MdevHandle, VmState};
use crate::xml;

const DOUBLE_USE: &str = "Attempted double use of PCI Address";

/// Highest PCI slot number.
const MAX_SLOT: u8 = 0x1f;
/// Highest PCI function number.
const MAX_FUNC: u8 = 7;

/// Candidate `(slot, function)` pairs, starting at `first_slot`/`first_func`
/// and walking functions before slots.
fn controller_slots(first_slot: u8, first_func: u8) -> impl Iterator<Item = (u8, u8)> {
    (first_slot..=MAX_SLOT).flat_map(move |slot| {
        let start = if slot == first_slot { first_func } else { 0 };
        (start..=MAX_FUNC).map(move |func| (slot, func))
    })
}

/// Where the first PCI controller goes and how it is numbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerLayout {
    /// PCI domain shared by every controller
    pub domain: u32,
    pub first_bus: u8,
    pub first_func: u8,
    pub first_port: u32,
    pub first_slot: u8,
    pub first_chassis: u32,
    pub first_index: u32,
}

impl Default for ControllerLayout {
    fn default() -> Self {
        Self {
            domain: 0,
            first_bus: 0,
            first_func: 1,
            first_port: 1,
            first_slot: 0,
            first_chassis: 1,
            first_index: 12,
        }
    }
}

impl KvmHypervisor {
    // =========================================================================
    // Device XML
    // =========================================================================

    /// Render the VF hostdev template for `pci` into `file` on the host.
    #[instrument(skip(self), fields(pci = %pci))]
    pub async fn prepare_vf_xml(&self, file: &str, pci: &PciAddress) -> Result<String> {
        let template = self.config.templates.load(TemplateKind::Vf).await?;
        self.connection.write_file(file, &command::vf_xml(&template, pci)).await?;
        debug!("VF XML written to {}", file);
        Ok(file.to_string())
    }

    #[instrument(skip(self), fields(pci = %pci))]
    pub async fn prepare_pci_controller_xml(
        &self,
        file: &str,
        pci: &PciAddress,
        index: u32,
        chassis: u32,
        port: u32,
    ) -> Result<String> {
        let template = self.config.templates.load(TemplateKind::PciController).await?;
        self.connection
            .write_file(file, &command::pci_controller_xml(&template, pci, index, chassis, port))
            .await?;
        Ok(file.to_string())
    }

    #[instrument(skip(self))]
    pub async fn prepare_mdev_xml(&self, file: &str, uuid: &str) -> Result<String> {
        let template = self.config.templates.load(TemplateKind::Mdev).await?;
        self.connection.write_file(file, &command::mdev_xml(&template, uuid)).await?;
        Ok(file.to_string())
    }

    fn device_file(&self, kind: &str, pci: &PciAddress) -> String {
        let name = format!(
            "{kind}_{:04x}_{:02x}_{:02x}_{:x}.xml",
            pci.domain, pci.bus, pci.slot, pci.func
        );
        self.connection.join_path(&self.config.work_dir, &name)
    }

    // =========================================================================
    // Attach / detach
    // =========================================================================

    async fn current_state(&self, name: &str) -> Result<VmState> {
        let status = self.virt_tool.get_vm_status(name).await?;
        Ok(status
            .state()
            .unwrap_or_else(|| VmState::Other("unknown".to_string())))
    }

    /// Attach a device file. The change persists unless the VM is running.
    #[instrument(skip(self))]
    pub async fn attach_device(&self, name: &str, device_config: &str) -> Result<()> {
        let state = self.current_state(name).await?;
        self.virt_tool.attach_device(name, device_config, &state).await
    }

    #[instrument(skip(self))]
    pub async fn detach_device(&self, name: &str, device_config: &str) -> Result<()> {
        let state = self.current_state(name).await?;
        self.virt_tool.detach_device(name, device_config, &state).await
    }

    pub async fn attach_vf(&self, name: &str, device_config: &str) -> Result<()> {
        self.attach_device(name, device_config).await
    }

    pub async fn detach_vf(&self, name: &str, device_config: &str) -> Result<()> {
        self.detach_device(name, device_config).await
    }

    /// Attach a guest agent channel described by `device_config`.
    pub async fn attach_agent(&self, name: &str, device_config: &str) -> Result<()> {
        self.attach_device(name, device_config).await
    }

    /// Pass the VF at `pci` through to the VM.
    #[instrument(skip(self), fields(pci = %pci))]
    pub async fn attach_interface(&self, name: &str, pci: &PciAddress) -> Result<()> {
        let file = self.prepare_vf_xml(&self.device_file("vf", pci), pci).await?;
        self.attach_device(name, &file).await
    }

    #[instrument(skip(self), fields(pci = %pci))]
    pub async fn detach_interface(&self, name: &str, pci: &PciAddress) -> Result<()> {
        let file = self.prepare_vf_xml(&self.device_file("vf", pci), pci).await?;
        self.detach_device(name, &file).await
    }

    /// Detach the hostdev interface with `mac`.
    #[instrument(skip(self))]
    pub async fn detach_interface_from_vm(&self, name: &str, mac: &str) -> Result<()> {
        let state = self.current_state(name).await?;
        self.virt_tool.detach_interface(name, mac, &state).await
    }

    /// Detach every passed-through VF from each VM. Failures are logged and
    /// the sweep moves on; returns whether everything was detached.
    #[instrument(skip(self, vms), fields(count = vms.len()))]
    pub async fn detach_interfaces(&self, vms: &[String]) -> bool {
        let mut all_detached = true;
        for vm in vms {
            let pairs = match self.get_pci_for_host_vf_and_vm_vf(vm).await {
                Ok(pairs) => pairs,
                Err(e) => {
                    warn!("Cannot read VFs of {}: {}", vm, e);
                    all_detached = false;
                    continue;
                }
            };
            for pair in pairs {
                if let Err(e) = self.detach_interface(vm, &pair.host).await {
                    warn!("Cannot detach VF {} from {}: {}", pair.host, vm, e);
                    all_detached = false;
                }
            }
        }
        all_detached
    }

    // =========================================================================
    // PCI controllers
    // =========================================================================

    /// Add `count` `pcie-root-port` controllers to a VM.
    ///
    /// Controllers can only be added while the VM is off, so it is shut down
    /// first and started again once at least one controller is in place.
    /// Addresses already in use are skipped.
    #[instrument(skip(self, layout))]
    pub async fn attach_pci_controllers(&self, name: &str, count: usize, layout: ControllerLayout) -> Result<()> {
        self.virt_tool.shutdown_gracefully_vm(name).await?;
        if !self.wait_for_vm_down(name).await? {
            warn!("{} did not shut down in time, attaching anyway", name);
        }

        let file = self
            .connection
            .join_path(&self.config.work_dir, "pci_controller.xml");
        let mut index = layout.first_index;
        let mut chassis = layout.first_chassis;
        let mut port = layout.first_port;
        let mut attached = 0;

        for (slot, func) in controller_slots(layout.first_slot, layout.first_func) {
            if attached == count {
                break;
            }
            let pci = PciAddress::new(layout.domain, layout.first_bus, slot, func);
            self.prepare_pci_controller_xml(&file, &pci, index, chassis, port)
                .await?;
            index += 1;
            chassis += 1;
            port += 1;

            match self.attach_device(name, &file).await {
                Ok(()) => {
                    debug!("PCI controller attached at {}", pci);
                    attached += 1;
                }
                Err(e) if e.stderr_contains(DOUBLE_USE) => {
                    debug!("PCI address {} already in use", pci);
                }
                Err(e) => return Err(e),
            }
        }

        if attached > 0 {
            self.virt_tool.start_vm(name).await?;
        }
        if attached < count {
            return Err(HypervisorError::NotEnoughPciAddresses {
                expected: count,
                created: attached,
            });
        }
        info!("Attached {} PCI controllers to {}", attached, name);
        Ok(())
    }

    // =========================================================================
    // Mediated devices
    // =========================================================================

    /// Create a mediated device on `parent` and render its hostdev XML into `file`.
    #[instrument(skip(self), fields(parent = %parent))]
    pub async fn create_mdev(&self, uuid: &str, parent: &PciAddress, file: &str) -> Result<MdevHandle> {
        let output = self
            .connection
            .execute_command(
                &command::create_mdev(uuid, parent, &self.config.mdev_type),
                ExecOptions::new().shell(),
            )
            .await?;
        if !output.stdout.contains(uuid) {
            return Err(HypervisorError::NotFound(format!(
                "{uuid} not found in cmd output: {}",
                output.stdout
            )));
        }

        self.prepare_mdev_xml(file, uuid).await?;
        info!("MDEV {} created on {}", uuid, parent);
        Ok(MdevHandle {
            uuid: uuid.to_string(),
            parent: *parent,
        })
    }

    #[instrument(skip(self))]
    pub async fn destroy_mdev(&self, uuid: &str) -> Result<()> {
        self.connection
            .execute_command(&command::destroy_mdev(uuid), ExecOptions::new().shell())
            .await?;
        Ok(())
    }

    /// PCI address of the PF a mediated device was created on.
    #[instrument(skip(self))]
    pub async fn get_pci_address_of_mdev_pf(&self, uuid: &str) -> Result<PciAddress> {
        let output = self
            .connection
            .execute_command(&command::mdev_parent(uuid), ExecOptions::new().shell())
            .await?;
        let parent = output.stdout.trim();
        if parent.is_empty() {
            return Err(HypervisorError::Vf(format!(
                "Not matched PF PCI for MDEV with UUID: {uuid}"
            )));
        }
        parent.parse()
    }

    pub async fn get_all_mdev_uuids(&self) -> Result<Vec<String>> {
        let output = self
            .connection
            .execute_command(command::LIST_MDEVS, ExecOptions::new())
            .await?;
        let uuids = parser::parse_uuids(&output.stdout)?;
        if uuids.is_empty() {
            return Err(HypervisorError::NotFound(format!(
                "MDEV UUIDs not found!: {}",
                output.stdout
            )));
        }
        Ok(uuids)
    }

    // =========================================================================
    // Domain XML queries
    // =========================================================================

    /// Host VF and guest-visible PCI address of every passed-through device.
    #[instrument(skip(self))]
    pub async fn get_pci_for_host_vf_and_vm_vf(&self, name: &str) -> Result<Vec<HostdevPair>> {
        let domain = self.virt_tool.dump_xml(name).await?;
        let pairs = xml::pci_hostdev_pairs(&domain)?;
        for pair in &pairs {
            info!("VM: {}, Host VF PCI: {}, VM VF PCI: {}", name, pair.host, pair.guest);
        }
        Ok(pairs)
    }

    pub async fn get_mdev_details(&self, name: &str) -> Result<Vec<MdevDetail>> {
        let domain = self.virt_tool.dump_xml(name).await?;
        xml::mdev_hostdevs(&domain)
    }

    pub async fn get_hdd_path(&self, name: &str) -> Result<String> {
        let domain = self.virt_tool.dump_xml(name).await?;
        xml::disk_source_file(&domain).ok_or_else(|| {
            HypervisorError::NotFound(format!("HDD path for {name} not found in dumped xml!"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::hypervisor;
    use super::*;

    const UUID: &str = "f4a8a0a2-8a3c-4bfc-9c54-6a6c5b3c6c1e";

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>vm</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/vm.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <hostdev mode='subsystem' type='pci' managed='yes'>
      <source>
        <address domain='0x0000' bus='0x18' slot='0x02' function='0x1'/>
      </source>
      <address type='pci' domain='0x0000' bus='0x05' slot='0x00' function='0x0'/>
    </hostdev>
    <hostdev mode='subsystem' type='mdev' managed='no' model='vfio-pci'>
      <source>
        <address uuid='f4a8a0a2-8a3c-4bfc-9c54-6a6c5b3c6c1e'/>
      </source>
      <address type='pci' domain='0x0000' bus='0x06' slot='0x00' function='0x0'/>
    </hostdev>
  </devices>
</domain>"#;

    const DOMINFO_RUNNING: &str = "Id:             1\nName:           vm\nState:          running\n";
    const DOMINFO_SHUT_OFF: &str = "Id:             -\nName:           vm\nState:          shut off\n";

    fn vf() -> PciAddress {
        PciAddress::new(0, 0x18, 0x02, 1)
    }

    #[test]
    fn test_controller_slots() {
        let slots: Vec<(u8, u8)> = controller_slots(0x1e, 6).collect();
        assert_eq!(
            slots,
            vec![
                (0x1e, 6),
                (0x1e, 7),
                (0x1f, 0),
                (0x1f, 1),
                (0x1f, 2),
                (0x1f, 3),
                (0x1f, 4),
                (0x1f, 5),
                (0x1f, 6),
                (0x1f, 7),
            ]
        );
    }

    #[tokio::test]
    async fn test_prepare_vf_xml() {
        let (conn, hv) = hypervisor();
        let file = hv.prepare_vf_xml("/tmp/vf.xml", &vf()).await.unwrap();

        assert_eq!(file, "/tmp/vf.xml");
        let content = conn.file("/tmp/vf.xml").unwrap();
        assert!(content.contains("<address domain='0x0' bus='0x18' slot='0x2' function='0x1'/>"));
    }

    #[tokio::test]
    async fn test_prepare_pci_controller_xml() {
        let (conn, hv) = hypervisor();
        hv.prepare_pci_controller_xml("/tmp/ctrl.xml", &PciAddress::new(0, 0, 0x10, 2), 3, 4, 0x12)
            .await
            .unwrap();

        let content = conn.file("/tmp/ctrl.xml").unwrap();
        assert!(content.contains("index='3'"));
        assert!(content.contains("<target chassis='4' port='0x12'/>"));
        assert!(content.contains("slot='0x10' function='0x2'"));
    }

    #[tokio::test]
    async fn test_attach_device_persists_when_not_running() {
        let (conn, hv) = hypervisor();
        conn.once("virsh dominfo", 0, DOMINFO_SHUT_OFF, "")
            .once("virsh dominfo", 0, DOMINFO_RUNNING, "");

        hv.attach_vf("vm", "/tmp/vf.xml").await.unwrap();
        hv.detach_vf("vm", "/tmp/vf.xml").await.unwrap();

        assert_eq!(
            conn.commands(),
            vec![
                "virsh dominfo vm",
                "virsh attach-device vm --file /tmp/vf.xml --config",
                "virsh dominfo vm",
                "virsh detach-device vm --file /tmp/vf.xml",
            ]
        );
    }

    #[tokio::test]
    async fn test_attach_interface() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_RUNNING, "");

        hv.attach_interface("vm", &vf()).await.unwrap();

        assert!(conn.file("/tmp/vf_0000_18_02_1.xml").is_some());
        assert_eq!(
            conn.commands_starting_with("virsh attach-device"),
            vec!["virsh attach-device vm --file /tmp/vf_0000_18_02_1.xml"]
        );
    }

    #[tokio::test]
    async fn test_detach_interface_from_vm() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_RUNNING, "");

        hv.detach_interface_from_vm("vm", "aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(
            conn.commands_starting_with("virsh detach-interface"),
            vec!["virsh detach-interface vm hostdev --mac aa:bb:cc:dd:ee:ff"]
        );
    }

    #[tokio::test]
    async fn test_detach_interfaces_continues_past_failures() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dumpxml broken", 1, "", "error: failed to get domain 'broken'")
            .on("virsh dumpxml", 0, DOMAIN_XML, "")
            .on("virsh dominfo", 0, DOMINFO_RUNNING, "");

        let vms = vec!["broken".to_string(), "vm".to_string()];
        assert!(!hv.detach_interfaces(&vms).await);
        assert_eq!(
            conn.commands_starting_with("virsh detach-device"),
            vec!["virsh detach-device vm --file /tmp/vf_0000_18_02_1.xml"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_pci_controllers() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_SHUT_OFF, "")
            .once("virsh attach-device", 1, "", "error: Attempted double use of PCI Address 0000:00:00.1");

        hv.attach_pci_controllers("vm", 2, ControllerLayout::default())
            .await
            .unwrap();

        let commands = conn.commands();
        assert_eq!(commands[0], "virsh shutdown vm");
        assert_eq!(conn.commands_starting_with("virsh attach-device").len(), 3);
        assert_eq!(conn.commands_starting_with("virsh start"), vec!["virsh start vm"]);
        assert_eq!(commands.last().unwrap(), "virsh start vm");

        // Third attempt, after one collision and one success
        let content = conn.file("/tmp/pci_controller.xml").unwrap();
        assert!(content.contains("index='14'"));
        assert!(content.contains("<target chassis='3' port='0x3'/>"));
        assert!(content.contains("slot='0x0' function='0x3'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_pci_controllers_not_enough_addresses() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_SHUT_OFF, "");

        let layout = ControllerLayout {
            first_slot: 0x1f,
            first_func: 5,
            ..ControllerLayout::default()
        };
        let err = hv.attach_pci_controllers("vm", 9, layout).await.unwrap_err();

        assert!(matches!(
            err,
            HypervisorError::NotEnoughPciAddresses { expected: 9, created: 3 }
        ));
        assert_eq!(conn.commands_starting_with("virsh start").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_pci_controllers_in_domain() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_SHUT_OFF, "");

        let layout = ControllerLayout {
            domain: 1,
            first_bus: 0x80,
            ..ControllerLayout::default()
        };
        hv.attach_pci_controllers("vm", 1, layout).await.unwrap();

        let content = conn.file("/tmp/pci_controller.xml").unwrap();
        assert!(content.contains("domain='0x1' bus='0x80' slot='0x0' function='0x1'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_pci_controllers_other_error() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dominfo", 0, DOMINFO_SHUT_OFF, "")
            .on("virsh attach-device", 1, "", "error: internal error");

        let err = hv
            .attach_pci_controllers("vm", 1, ControllerLayout::default())
            .await
            .unwrap_err();
        assert!(err.stderr_contains("internal error"));
        assert!(conn.commands_starting_with("virsh start").is_empty());
    }

    #[tokio::test]
    async fn test_create_mdev() {
        let (conn, hv) = hypervisor();
        conn.on("echo", 0, &format!("{UUID}\n"), "");
        let parent: PciAddress = "0000:b1:00.0".parse().unwrap();

        let handle = hv.create_mdev(UUID, &parent, "/tmp/mdev.xml").await.unwrap();

        assert_eq!(handle.parent, parent);
        assert!(conn.calls()[0].options.shell);
        assert!(conn.commands()[0].contains("/mdev_supported_types/ice-vdcm/create"));
        assert!(conn.file("/tmp/mdev.xml").unwrap().contains(UUID));
    }

    #[tokio::test]
    async fn test_create_mdev_not_echoed() {
        let (conn, hv) = hypervisor();
        conn.on("echo", 0, "", "");
        let parent: PciAddress = "0000:b1:00.0".parse().unwrap();

        let err = hv.create_mdev(UUID, &parent, "/tmp/mdev.xml").await.unwrap_err();
        assert_eq!(err.to_string(), format!("{UUID} not found in cmd output: "));
        assert!(conn.file("/tmp/mdev.xml").is_none());
    }

    #[tokio::test]
    async fn test_destroy_mdev() {
        let (conn, hv) = hypervisor();
        hv.destroy_mdev(UUID).await.unwrap();
        assert_eq!(
            conn.commands(),
            vec![format!("echo 1 > /sys/bus/mdev/devices/{UUID}/remove")]
        );
    }

    #[tokio::test]
    async fn test_get_pci_address_of_mdev_pf() {
        let (conn, hv) = hypervisor();
        conn.once("basename", 0, "0000:b1:00.0\n", "")
            .once("basename", 0, "\n", "");

        assert_eq!(
            hv.get_pci_address_of_mdev_pf(UUID).await.unwrap(),
            PciAddress::new(0, 0xb1, 0, 0)
        );
        let err = hv.get_pci_address_of_mdev_pf(UUID).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Not matched PF PCI for MDEV with UUID: {UUID}"));
    }

    #[tokio::test]
    async fn test_get_all_mdev_uuids() {
        let (conn, hv) = hypervisor();
        conn.once("ls /sys/bus/mdev/devices/", 0, &format!("{UUID}\n"), "")
            .once("ls /sys/bus/mdev/devices/", 0, "", "");

        assert_eq!(hv.get_all_mdev_uuids().await.unwrap(), vec![UUID.to_string()]);
        assert!(matches!(
            hv.get_all_mdev_uuids().await,
            Err(HypervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_domain_xml_queries() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dumpxml", 0, DOMAIN_XML, "");

        assert_eq!(
            hv.get_pci_for_host_vf_and_vm_vf("vm").await.unwrap(),
            vec![HostdevPair {
                host: vf(),
                guest: PciAddress::new(0, 5, 0, 0),
            }]
        );
        assert_eq!(
            hv.get_mdev_details("vm").await.unwrap(),
            vec![MdevDetail {
                uuid: UUID.to_string(),
                guest: PciAddress::new(0, 6, 0, 0),
            }]
        );
        assert_eq!(
            hv.get_hdd_path("vm").await.unwrap(),
            "/var/lib/libvirt/images/vm.qcow2"
        );
    }

    #[tokio::test]
    async fn test_get_hdd_path_missing() {
        let (conn, hv) = hypervisor();
        conn.on("virsh dumpxml", 0, "<domain><devices/></domain>", "");

        let err = hv.get_hdd_path("vm").await.unwrap_err();
        assert_eq!(err.to_string(), "HDD path for vm not found in dumped xml!");
    }
}
