//! Network data allocation, bridges, VLAN trunking and libvirt networks.

use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::KvmHypervisor;
use crate::command;
use crate::connection::ExecOptions;
use crate::error::{HypervisorError, Result};
use crate::parser;
use crate::types::{NetworkDataEntry, TrunkAction};

impl KvmHypervisor {
    // =========================================================================
    // Network data
    // =========================================================================

    /// VM name derived from the last two octets of its address,
    /// e.g. `10.10.10.1` with prefix `vm` gives `vm-010-001`.
    pub fn get_name_from_ip(ip: Ipv4Addr, prefix: &str) -> String {
        let [_, _, third, fourth] = ip.octets();
        format!("{prefix}-{third:03}-{fourth:03}")
    }

    /// Read the `[kvm]` section of a local network-data file.
    pub async fn parse_network_data_conf(path: &Path) -> Result<Vec<NetworkDataEntry>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HypervisorError::FileNotFound(path.display().to_string()),
            _ => HypervisorError::Io(e),
        })?;
        parser::parse_network_data(&content)
    }

    /// First `count` entries of the network-data file nobody answers on.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn get_free_network_data(&self, path: &Path, count: usize) -> Result<Vec<NetworkDataEntry>> {
        let entries = Self::parse_network_data_conf(path).await?;
        self.select_free_network_data(&entries, count).await
    }

    /// Probe `entries` in order and keep those whose address does not answer.
    pub async fn select_free_network_data(
        &self,
        entries: &[NetworkDataEntry],
        count: usize,
    ) -> Result<Vec<NetworkDataEntry>> {
        let mut free = Vec::with_capacity(count);
        for entry in entries {
            if free.len() == count {
                break;
            }
            let output = self
                .connection
                .execute_command(
                    &command::ping_probe(&entry.ip.to_string()),
                    ExecOptions::new().any_code(),
                )
                .await?;
            if self.config.probe_free_codes.contains(&output.return_code) {
                debug!(ip = %entry.ip, "Address is free");
                free.push(entry.clone());
            } else {
                debug!(ip = %entry.ip, code = output.return_code, "Address is taken");
            }
        }

        if free.len() < count {
            return Err(HypervisorError::NetworkDataExhausted {
                expected: count,
                found: free.len(),
            });
        }
        info!("Found {} free network data entries", free.len());
        Ok(free)
    }

    // =========================================================================
    // Bridges
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn create_bridge(&self, bridge: &str) -> Result<()> {
        self.connection
            .execute_command(&command::add_bridge(bridge), ExecOptions::new().shell())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_bridge(&self, bridge: &str) -> Result<()> {
        self.connection
            .execute_command(&command::delete_bridge(bridge), ExecOptions::new().shell())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn add_interface_to_bridge(&self, bridge: &str, interface: &str) -> Result<()> {
        self.connection
            .execute_command(
                &command::add_bridge_interface(bridge, interface),
                ExecOptions::new().shell(),
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // VLAN trunking
    // =========================================================================

    /// Add or remove `vlan` on the trunk of a VF. `action` is `add` or `rem`.
    #[instrument(skip(self))]
    pub async fn set_trunk(&self, interface: &str, action: &str, vlan: u32, vf_id: u32) -> Result<()> {
        let action: TrunkAction = action.parse()?;
        self.connection
            .execute_command(
                &command::set_trunk(interface, action, vlan, vf_id),
                ExecOptions::new().shell(),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_trunk(&self, interface: &str, vf_id: u32) -> Result<String> {
        let output = self
            .connection
            .execute_command(&command::get_trunk(interface, vf_id), ExecOptions::new())
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    #[instrument(skip(self))]
    pub async fn set_tpid(&self, interface: &str, tpid: &str) -> Result<()> {
        self.connection
            .execute_command(&command::set_tpid(interface, tpid), ExecOptions::new().shell())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_tpid(&self, interface: &str) -> Result<String> {
        let output = self
            .connection
            .execute_command(&command::get_tpid(interface), ExecOptions::new())
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    // =========================================================================
    // libvirt networks
    // =========================================================================

    pub async fn create_vm_network(&self, xml_path: &str) -> bool {
        self.virt_tool.create_vm_network(xml_path).await
    }

    pub async fn destroy_vm_network(&self, network: &str) -> bool {
        self.virt_tool.destroy_vm_network(network).await
    }

    pub async fn get_vm_networks(&self) -> Vec<String> {
        self.virt_tool.get_vm_networks().await
    }

    pub async fn attach_tap_interface_to_vm(&self, name: &str, network: &str) -> bool {
        self.virt_tool.attach_tap_interface_to_vm(name, network).await
    }
}
