//! KVM host facade.
//!
//! [`KvmHypervisor`] composes the command builder, the output parsers, the
//! poll engine and a [`VirtTool`] into the operations callers use. This
//! module holds VM lifecycle, disk cloning and RAM sizing; SR-IOV, device
//! attachment and host networking live in the sibling modules.

mod devices;
mod network;
mod sriov;

pub use devices::ControllerLayout;

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::command::{self, InstallSuffix};
use crate::config::HypervisorConfig;
use crate::connection::{Connection, ExecOptions};
use crate::error::{HypervisorError, Result};
use crate::parser;
use crate::poll::Poller;
use crate::traits::VirtTool;
use crate::types::{VmListEntry, VmParams, VmState, VmStatus};
use crate::virsh::VirshTool;
use crate::xml::XmlNode;

/// Automation facade for one KVM host.
#[derive(Clone)]
pub struct KvmHypervisor {
    connection: Arc<dyn Connection>,
    virt_tool: Arc<dyn VirtTool>,
    config: HypervisorConfig,
}

impl KvmHypervisor {
    /// Create a facade with the default configuration and the virsh adapter.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self::with_config(connection, HypervisorConfig::default())
    }

    pub fn with_config(connection: Arc<dyn Connection>, config: HypervisorConfig) -> Self {
        let virt_tool = VirshTool::new(connection.clone())
            .with_timeout(config.virsh_timeout())
            .with_mng_ip_interval(config.mng_ip_interval())
            .with_dhcp_tries(config.mng_ip_tries);
        Self {
            connection,
            virt_tool: Arc::new(virt_tool),
            config,
        }
    }

    /// Replace the virtualization tool driver.
    pub fn with_virt_tool(mut self, virt_tool: Arc<dyn VirtTool>) -> Self {
        self.virt_tool = virt_tool;
        self
    }

    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn virt_tool(&self) -> &Arc<dyn VirtTool> {
        &self.virt_tool
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    pub async fn list_vms(&self, all: bool) -> Vec<VmListEntry> {
        self.virt_tool.list_vms(all).await
    }

    /// Names of the running VMs.
    pub async fn get_list_of_vms(&self) -> Vec<String> {
        self.virt_tool
            .list_vms(false)
            .await
            .into_iter()
            .map(|vm| vm.name)
            .collect()
    }

    pub async fn get_vm_status(&self, name: &str) -> Result<VmStatus> {
        self.virt_tool.get_vm_status(name).await
    }

    pub async fn dump_xml(&self, name: &str) -> Result<XmlNode> {
        self.virt_tool.dump_xml(name).await
    }

    pub async fn dump_xml_from_vm(&self, name: &str) -> Option<String> {
        self.virt_tool.dump_xml_from_vm(name).await
    }

    // =========================================================================
    // VM creation
    // =========================================================================

    /// Create a VM and return its name.
    ///
    /// VMs with an XML template are defined from it. Otherwise virt-install
    /// is used, cloning the disk first when a clone directory is set. A
    /// rejection for a missing OS name or install method is retried once with
    /// the matching flag appended.
    #[instrument(skip(self, params), fields(vm = %params.name))]
    pub async fn create_vm(&self, params: &VmParams) -> Result<String> {
        if params.xml_template.is_some() {
            return self.create_vm_from_xml(params).await;
        }

        let disk = match (&params.disk, &params.clone_dest_dir) {
            (Some(source), Some(dir)) => {
                let destination = self.connection.join_path(dir, &params.name);
                let timeout = params.clone_timeout.unwrap_or(self.config.clone_timeout_secs);
                Some(self.clone_vm_hdd_image(source, &destination, timeout).await?)
            }
            (Some(source), None) => Some(source.clone()),
            (None, _) => None,
        };

        let install = command::virt_install(params, disk.as_deref(), &self.config.large_vcpu, None);
        info!("Creating VM {}", params.name);

        if let Err(e) = self.connection.execute_command(&install, ExecOptions::new()).await {
            let suffix = match &e {
                HypervisorError::Execution { stderr, .. } => InstallSuffix::from_stderr(stderr),
                _ => None,
            };
            let Some(suffix) = suffix else {
                return Err(e);
            };

            warn!("virt-install rejected the command, retrying with {}", suffix.as_str());
            let retry = command::virt_install(params, disk.as_deref(), &self.config.large_vcpu, Some(suffix));
            self.connection.execute_command(&retry, ExecOptions::new()).await?;
        }

        info!("VM {} created", params.name);
        Ok(params.name.clone())
    }

    /// Copy the XML template to the work directory, give it a fresh UUID,
    /// then define and start the domain.
    #[instrument(skip(self, params), fields(vm = %params.name))]
    pub async fn create_vm_from_xml(&self, params: &VmParams) -> Result<String> {
        let template = params.xml_template.as_deref().ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("VM {} has no XML template", params.name))
        })?;

        let target = self
            .connection
            .join_path(&self.config.work_dir, &format!("{}.xml", params.name));
        self.connection
            .execute_command(&command::copy_file(template, &target), ExecOptions::new())
            .await?;

        let uuid = Uuid::new_v4().to_string();
        self.connection
            .execute_command(&command::replace_uuid_placeholder(&target, &uuid), ExecOptions::new())
            .await?;
        debug!(uuid = %uuid, "Domain XML prepared at {}", target);

        self.virt_tool.define(&target).await?;
        self.virt_tool.start_vm(&params.name).await?;

        info!("VM {} defined from {}", params.name, template);
        Ok(params.name.clone())
    }

    /// Create `count` VMs on free network data from `network_data_file`.
    ///
    /// Each VM gets the MAC of its entry and a name derived from the IP.
    /// Returns `(name, ip)` pairs in allocation order.
    #[instrument(skip(self, params, network_data_file))]
    pub async fn create_multiple_vms(
        &self,
        count: usize,
        params: &VmParams,
        network_data_file: &Path,
        prefix: &str,
    ) -> Result<Vec<(String, Ipv4Addr)>> {
        let free = self.get_free_network_data(network_data_file, count).await?;

        let mut created = Vec::with_capacity(free.len());
        for entry in free {
            let name = Self::get_name_from_ip(entry.ip, prefix);
            let vm = VmParams {
                name,
                mac_address: Some(entry.mac.clone()),
                ..params.clone()
            };
            let name = self.create_vm(&vm).await?;
            created.push((name, entry.ip));
        }
        Ok(created)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn start_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.start_vm(name).await
    }

    pub async fn shutdown_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.shutdown_vm(name).await
    }

    pub async fn shutdown_gracefully_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.shutdown_gracefully_vm(name).await
    }

    pub async fn reboot_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.reboot_vm(name).await
    }

    pub async fn reset_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.reset_vm(name).await
    }

    pub async fn delete_vm(&self, name: &str) -> Result<()> {
        self.virt_tool.delete_vm(name).await
    }

    pub async fn set_vcpus(&self, name: &str, count: u32) -> Result<()> {
        self.virt_tool.set_vcpus(name, count).await
    }

    pub async fn set_vcpus_max_limit(&self, name: &str, count: u32) -> Result<()> {
        self.virt_tool.set_vcpus_max_limit(name, count).await
    }

    /// Poll `dominfo` until the VM reports `state`. Returns `false` on timeout.
    #[instrument(skip(self, state), fields(state = %state))]
    pub async fn wait_for_vm_state(&self, name: &str, state: &VmState, timeout: Duration) -> Result<bool> {
        let poller = Poller::new(timeout, self.config.vm_state_interval());
        let tool = &self.virt_tool;

        let reached = poller
            .until(|| async move {
                let current = tool.get_vm_status(name).await?.state();
                debug!("VM {} state: {:?}", name, current);
                Ok(current.as_ref() == Some(state))
            })
            .await?;

        if reached {
            info!("VM {} is {}", name, state);
        } else {
            warn!("VM {} did not reach state {} in {:?}", name, state, timeout);
        }
        Ok(reached)
    }

    pub async fn wait_for_vm_up(&self, name: &str) -> Result<bool> {
        self.wait_for_vm_state(name, &VmState::Running, self.config.vm_state_timeout())
            .await
    }

    pub async fn wait_for_vm_down(&self, name: &str) -> Result<bool> {
        self.wait_for_vm_state(name, &VmState::ShutOff, self.config.vm_state_timeout())
            .await
    }

    /// Stop every running VM and wait for each to shut off.
    ///
    /// Every VM is attempted; returns `true` only if all of them stopped.
    #[instrument(skip(self))]
    pub async fn stop_all_vms(&self, force: bool) -> bool {
        let mut all_stopped = true;
        for vm in self.virt_tool.list_vms(false).await {
            let result = async {
                if force {
                    self.shutdown_vm(&vm.name).await?;
                } else {
                    self.shutdown_gracefully_vm(&vm.name).await?;
                }
                self.wait_for_vm_down(&vm.name).await
            }
            .await;

            match result {
                Ok(true) => {}
                Ok(false) => all_stopped = false,
                Err(e) => {
                    warn!("Unable to stop VM {}: {}", vm.name, e);
                    all_stopped = false;
                }
            }
        }
        all_stopped
    }

    /// Start every defined VM that is not running and wait for each to come up.
    ///
    /// Every VM is attempted; returns `true` only if all of them are running.
    #[instrument(skip(self))]
    pub async fn start_all_vms(&self) -> bool {
        let mut all_started = true;
        for vm in self.virt_tool.list_vms(true).await {
            if vm.state.is_running() {
                debug!("VM {} already running", vm.name);
                continue;
            }
            let result = async {
                self.start_vm(&vm.name).await?;
                self.wait_for_vm_up(&vm.name).await
            }
            .await;

            match result {
                Ok(true) => {}
                Ok(false) => all_started = false,
                Err(e) => {
                    warn!("Unable to start VM {}: {}", vm.name, e);
                    all_started = false;
                }
            }
        }
        all_started
    }

    // =========================================================================
    // Management address
    // =========================================================================

    pub async fn get_mac_for_mng_vm_interface(&self, name: &str) -> Result<String> {
        self.virt_tool.get_mac_for_mng_vm_interface(name).await
    }

    pub async fn get_mng_ip_for_vm(&self, mac: &str, name: &str) -> Result<Ipv4Addr> {
        self.virt_tool
            .get_mng_ip_for_vm(mac, name, self.config.mng_ip_tries)
            .await
    }

    pub async fn get_mng_ip_for_vm_using_dhcp(&self, mac: &str) -> Result<Ipv4Addr> {
        self.virt_tool
            .get_mng_ip_for_vm_using_dhcp(mac, &self.config.dhcp_network)
            .await
    }

    /// Management IP of a guest, looked up through its first interface.
    #[instrument(skip(self))]
    pub async fn get_guest_mng_ip(&self, name: &str) -> Result<Ipv4Addr> {
        let mac = self
            .get_mac_for_mng_vm_interface(name)
            .await
            .map_err(|e| {
                debug!("MAC lookup failed: {}", e);
                HypervisorError::NotFound(format!("Cannot find MAC address for VM: {name}"))
            })?;
        self.get_mng_ip_for_vm(&mac, name).await
    }

    // =========================================================================
    // Disk cloning
    // =========================================================================

    async fn file_size(&self, path: &str) -> Option<u64> {
        let output = self
            .connection
            .execute_command(&command::file_size(path), ExecOptions::new().any_code())
            .await
            .ok()?;
        if output.return_code != 0 {
            return None;
        }
        parser::parse_first_number(&output.stdout)
    }

    /// Copy a disk image on the host and wait for the copy to finish.
    ///
    /// The copy runs in the background; progress is logged at every check.
    /// On timeout the copy is left running. Returns the destination path.
    #[instrument(skip(self))]
    pub async fn clone_vm_hdd_image(&self, source: &str, destination: &str, timeout: u64) -> Result<String> {
        if !self.connection.path_exists(source).await? {
            return Err(HypervisorError::FileNotFound(source.to_string()));
        }

        let source_size = self.file_size(source).await;
        info!("Cloning {} to {}", source, destination);
        let process = Mutex::new(
            self.connection
                .start_process(&command::copy_file(source, destination), false)
                .await?,
        );

        let interval = self.config.clone_interval();
        let poller = Poller::new(Duration::from_secs(timeout), interval);
        let process = &process;
        let this = self;

        let finished = poller
            .until(|| async move {
                let running = {
                    let mut guard = process.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard.running()?
                };
                if !running {
                    return Ok(true);
                }

                match (source_size, this.file_size(destination).await) {
                    (Some(total), Some(copied)) if total > 0 => info!(
                        "{} still cloning... {} %, next check in {}secs.",
                        destination,
                        copied * 100 / total,
                        interval.as_secs()
                    ),
                    _ => info!(
                        "{} still cloning..., next check in {}secs.",
                        destination,
                        interval.as_secs()
                    ),
                }
                Ok(false)
            })
            .await?;

        if !finished {
            return Err(HypervisorError::CloneTimeout {
                image: source.to_string(),
                timeout,
            });
        }

        info!("Image {} cloned to {}", source, destination);
        Ok(destination.to_string())
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Memory in MB to give each of `vm_number` VMs.
    #[instrument(skip(self))]
    pub async fn get_dynamic_ram(&self, vm_number: u64) -> Result<u64> {
        let output = self
            .connection
            .execute_command(command::FREE_MEMORY, ExecOptions::new().shell().any_code())
            .await?;

        let policy = &self.config.ram;
        let Some(free) = parser::parse_first_number(&output.stdout) else {
            warn!(
                "There's not output from awk, proceeding with default {} MB",
                policy.min_mb
            );
            return Ok(policy.min_mb);
        };

        let ram = policy.per_vm(free, vm_number).ok_or(HypervisorError::NotEnoughRam)?;
        debug!(free_mb = free, ram_mb = ram, "Dynamic RAM computed");
        Ok(ram)
    }
}
