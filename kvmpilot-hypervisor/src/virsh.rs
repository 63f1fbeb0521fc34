//! virsh implementation of [`VirtTool`].

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::connection::{CommandOutput, Connection, ExecOptions};
use crate::error::{HypervisorError, Result};
use crate::parser;
use crate::traits::VirtTool;
use crate::types::{VmListEntry, VmState, VmStatus};
use crate::xml::{self, XmlNode};

/// Timeout applied to every virsh invocation.
pub const DEFAULT_VIRSH_TIMEOUT: Duration = Duration::from_secs(120);

/// Drives libvirt through the `virsh` command line.
#[derive(Clone)]
pub struct VirshTool {
    connection: Arc<dyn Connection>,
    timeout: Duration,
    mng_ip_interval: Duration,
    dhcp_tries: u32,
}

impl VirshTool {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            timeout: DEFAULT_VIRSH_TIMEOUT,
            mng_ip_interval: Duration::from_secs(5),
            dhcp_tries: 60,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause between management address queries.
    pub fn with_mng_ip_interval(mut self, interval: Duration) -> Self {
        self.mng_ip_interval = interval;
        self
    }

    /// Number of DHCP lease queries before giving up.
    pub fn with_dhcp_tries(mut self, tries: u32) -> Self {
        self.dhcp_tries = tries;
        self
    }

    fn options(&self) -> ExecOptions {
        ExecOptions::new().timeout(self.timeout)
    }

    /// Run a virsh subcommand; a non-zero return code is an error.
    async fn virsh(&self, args: &str) -> Result<CommandOutput> {
        self.connection
            .execute_command(&format!("virsh {args}"), self.options())
            .await
    }

    /// Run a virsh subcommand whose failure is logged and reported as `None`.
    async fn virsh_soft(&self, subcommand: &str, args: &str) -> Option<CommandOutput> {
        let result = self
            .connection
            .execute_command(&format!("virsh {args}"), self.options().any_code())
            .await;
        match result {
            Ok(output) if output.return_code == 0 => Some(output),
            Ok(output) => {
                warn!(
                    "Command {} ended with code error: {}{}",
                    subcommand, output.stdout, output.stderr
                );
                None
            }
            Err(e) => {
                warn!("Command {} ended with code error: {}", subcommand, e);
                None
            }
        }
    }

    fn config_flag(state: &VmState) -> &'static str {
        if state.is_running() {
            ""
        } else {
            " --config"
        }
    }
}

fn is_local(ip: &Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_link_local()
}

#[async_trait]
impl VirtTool for VirshTool {
    // =========================================================================
    // Inventory
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_vms(&self, all: bool) -> Vec<VmListEntry> {
        let args = if all { "list --all" } else { "list" };
        match self.virsh_soft("list", args).await {
            Some(output) => {
                let vms = parser::parse_vm_list(&output.stdout);
                debug!(count = vms.len(), "Listed VMs");
                vms
            }
            None => Vec::new(),
        }
    }

    #[instrument(skip(self))]
    async fn get_vm_status(&self, name: &str) -> Result<VmStatus> {
        let output = self.virsh(&format!("dominfo {name}")).await?;
        Ok(parser::parse_key_value_block(&output.stdout))
    }

    #[instrument(skip(self))]
    async fn dump_xml(&self, name: &str) -> Result<XmlNode> {
        info!("Dumping xml of {}.", name);
        let output = self.virsh(&format!("dumpxml {name}")).await?;
        xml::parse(&output.stdout)
    }

    #[instrument(skip(self))]
    async fn dump_xml_from_vm(&self, name: &str) -> Option<String> {
        match self.virsh_soft("dumpxml", &format!("dumpxml {name}")).await {
            Some(output) => {
                debug!("XML dumped properly.");
                Some(output.stdout)
            }
            None => {
                warn!("Unable to fetch xml.");
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn define(&self, xml_path: &str) -> Result<String> {
        let output = self.virsh(&format!("define {xml_path}")).await?;
        Ok(output.stdout)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        info!("Starting {}", name);
        self.virsh(&format!("start {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn shutdown_vm(&self, name: &str) -> Result<()> {
        info!("Hard shutting down {}", name);
        self.virsh(&format!("destroy {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn shutdown_gracefully_vm(&self, name: &str) -> Result<()> {
        info!("Shutting down {}", name);
        self.virsh(&format!("shutdown {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn reboot_vm(&self, name: &str) -> Result<()> {
        info!("Rebooting {}", name);
        self.virsh(&format!("reboot {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn reset_vm(&self, name: &str) -> Result<()> {
        info!("Resetting {}", name);
        self.virsh(&format!("reset {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete_vm(&self, name: &str) -> Result<()> {
        info!("Deleting {}", name);
        self.virsh(&format!("undefine --nvram {name}")).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn set_vcpus(&self, name: &str, count: u32) -> Result<()> {
        self.virsh(&format!("setvcpus {name} {count} --config"))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn set_vcpus_max_limit(&self, name: &str, count: u32) -> Result<()> {
        self.virsh(&format!("setvcpus {name} {count} --maximum --config"))
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    #[instrument(skip(self, state), fields(state = %state))]
    async fn attach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()> {
        self.virsh(&format!(
            "attach-device {name} --file {device_config}{}",
            Self::config_flag(state)
        ))
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, state), fields(state = %state))]
    async fn detach_device(&self, name: &str, device_config: &str, state: &VmState) -> Result<()> {
        self.virsh(&format!(
            "detach-device {name} --file {device_config}{}",
            Self::config_flag(state)
        ))
        .await
        .map(|_| ())
    }

    #[instrument(skip(self, state), fields(state = %state))]
    async fn detach_interface(&self, name: &str, mac: &str, state: &VmState) -> Result<()> {
        self.virsh(&format!(
            "detach-interface {name} hostdev --mac {mac}{}",
            Self::config_flag(state)
        ))
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn attach_tap_interface_to_vm(&self, name: &str, network: &str) -> bool {
        info!("Attach tap interface to VM {}", name);
        self.virsh_soft(
            "attach-interface",
            &format!("attach-interface {name} network {network} --model virtio --config --live"),
        )
        .await
        .is_some()
    }

    // =========================================================================
    // Networks
    // =========================================================================

    #[instrument(skip(self))]
    async fn create_vm_network(&self, xml_path: &str) -> bool {
        info!("Create network from {}", xml_path);
        self.virsh_soft("net-create", &format!("net-create {xml_path}"))
            .await
            .is_some()
    }

    #[instrument(skip(self))]
    async fn destroy_vm_network(&self, network: &str) -> bool {
        info!("Destroy network {}", network);
        self.virsh_soft("net-destroy", &format!("net-destroy {network}"))
            .await
            .is_some()
    }

    #[instrument(skip(self))]
    async fn get_vm_networks(&self) -> Vec<String> {
        self.virsh_soft("net-list", "net-list --all")
            .await
            .map(|output| parser::parse_network_list(&output.stdout))
            .unwrap_or_default()
    }

    #[instrument(skip(self))]
    async fn get_net_dhcp_leases(&self, network: &str) -> Result<String> {
        let output = self.virsh(&format!("net-dhcp-leases {network}")).await?;
        Ok(output.stdout)
    }

    // =========================================================================
    // Management address
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_mac_for_mng_vm_interface(&self, name: &str) -> Result<String> {
        info!("Read MAC address of management interface for VM: {}", name);
        let output = self.virsh(&format!("domiflist {name}")).await?;
        parser::parse_first_interface_mac(&output.stdout).ok_or_else(|| {
            HypervisorError::NotFound(format!("Cannot find MAC address for VM: {name}"))
        })
    }

    #[instrument(skip(self))]
    async fn get_mng_ip_for_vm(&self, mac: &str, name: &str, tries: u32) -> Result<Ipv4Addr> {
        info!("Get management IP from QEMU agent which running on VM");
        let mac_lower = mac.to_lowercase();
        let command = format!("virsh domifaddr {name} --source agent");
        let mut agent_answered = false;

        for attempt in 1..=tries {
            let output = self
                .connection
                .execute_command(&command, self.options().any_code())
                .await?;

            if output.return_code != 0 {
                warn!(
                    "{}/{} Getting management IP from QEMU agent failed, VM may be still booting, \
                     QEMU agent may be not installed or the reason is choosing the wrong VM boot \
                     option (uefi, legacy).",
                    attempt, tries
                );
            } else {
                agent_answered = true;
                let candidates: Vec<Ipv4Addr> = parser::parse_agent_addresses(&output.stdout)?
                    .into_iter()
                    .filter(|a| a.mac == mac_lower && a.protocol == "ipv4")
                    .filter_map(|a| a.address.parse().ok())
                    .collect();

                if let Some(ip) = candidates.iter().find(|ip| !is_local(ip)) {
                    info!("Mng IP: {} for MAC: {} found", ip, mac_lower);
                    return Ok(*ip);
                }
                match candidates.first() {
                    Some(local) => warn!(
                        "{}/{} Found MNG IP: {} is local/loopback, waiting for a routable address.",
                        attempt, tries, local
                    ),
                    None => debug!("{}/{} No IPv4 address reported for MAC: {}", attempt, tries, mac_lower),
                }
            }

            if attempt < tries {
                tokio::time::sleep(self.mng_ip_interval).await;
            }
        }

        if agent_answered {
            Err(HypervisorError::MngIpUnavailable { mac: mac.to_string() })
        } else {
            Err(HypervisorError::VmNotBooted { tries })
        }
    }

    #[instrument(skip(self))]
    async fn get_mng_ip_for_vm_using_dhcp(&self, mac: &str, network: &str) -> Result<Ipv4Addr> {
        let mac_lower = mac.to_lowercase();
        for attempt in 1..=self.dhcp_tries {
            let leases = self.get_net_dhcp_leases(network).await?;
            if let Some(lease) = parser::parse_dhcp_leases(&leases)
                .into_iter()
                .find(|l| l.mac == mac_lower)
            {
                info!("Mng IP: {} for MAC: {} found", lease.ip, mac_lower);
                return Ok(lease.ip);
            }
            debug!("{}/{} No DHCP lease for MAC: {}", attempt, self.dhcp_tries, mac_lower);
            if attempt < self.dhcp_tries {
                tokio::time::sleep(self.mng_ip_interval).await;
            }
        }
        Err(HypervisorError::MngIpUnavailable { mac: mac.to_string() })
    }
}
