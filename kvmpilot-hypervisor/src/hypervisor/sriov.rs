//! SR-IOV virtual function management.

use tracing::{debug, info, instrument, warn};

use super::KvmHypervisor;
use crate::command;
use crate::connection::{CommandOutput, ExecOptions};
use crate::error::{HypervisorError, Result};
use crate::parser::{self, VfLink};
use crate::pci::PciAddress;
use crate::types::VfDetail;

const DEVICE_BUSY: &str = "Device or resource busy";
const NO_SUCH_FILE: &str = "No such file or directory";

fn execution_error(output: CommandOutput) -> HypervisorError {
    HypervisorError::Execution {
        command: output.command,
        code: output.return_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

impl KvmHypervisor {
    /// VF symlinks listed by `command`. Listings use globs, so they run in a shell.
    async fn vf_links(&self, command: &str) -> Result<Vec<VfLink>> {
        let output = self
            .connection
            .execute_command(command, ExecOptions::new().shell())
            .await?;
        parser::parse_vf_links(&output.stdout)
    }

    // =========================================================================
    // VF enumeration
    // =========================================================================

    /// Ids of the VFs of `interface`, ascending.
    #[instrument(skip(self))]
    pub async fn get_vfs_id_for_pf(&self, interface: &str) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .vf_links(&command::list_vfs(interface))
            .await?
            .into_iter()
            .map(|link| link.id)
            .collect();
        if ids.is_empty() {
            return Err(HypervisorError::Vf(format!(
                "Not found VFs for interface {interface}."
            )));
        }
        ids.sort_unstable();
        Ok(ids)
    }

    #[instrument(skip(self))]
    pub async fn get_pci_address_for_vf(&self, interface: &str, vf_id: u32) -> Result<PciAddress> {
        self.vf_links(&command::list_vf(interface, vf_id))
            .await?
            .first()
            .map(|link| link.target)
            .ok_or_else(|| {
                HypervisorError::Vf(format!("Not found VF {vf_id} for interface {interface}."))
            })
    }

    #[instrument(skip(self), fields(pf = %pf))]
    pub async fn get_pci_address_for_vf_by_pci(&self, pf: &PciAddress, vf_id: u32) -> Result<PciAddress> {
        self.vf_links(&command::list_vf_by_pci(pf, vf_id))
            .await?
            .first()
            .map(|link| link.target)
            .ok_or_else(|| {
                HypervisorError::Vf(format!("Not found VF {vf_id} for PF PCI Address {pf}."))
            })
    }

    /// PCI addresses of every VF of `interface`, in listing order.
    #[instrument(skip(self))]
    pub async fn get_pci_addresses_of_vfs(&self, interface: &str) -> Result<Vec<PciAddress>> {
        Ok(self
            .vf_links(&command::list_vfs(interface))
            .await?
            .into_iter()
            .map(|link| link.target)
            .collect())
    }

    /// PCI addresses of every VF of the PF at `pf`. VFs sit on the PF's
    /// domain and bus, only slot and function come from the symlink.
    #[instrument(skip(self), fields(pf = %pf))]
    pub async fn get_pci_addresses_of_vfs_by_pci(&self, pf: &PciAddress) -> Result<Vec<PciAddress>> {
        Ok(self
            .vf_links(&command::list_vfs_by_pci(pf))
            .await?
            .into_iter()
            .map(|link| PciAddress::new(pf.domain, pf.bus, link.target.slot, link.target.func))
            .collect())
    }

    /// Id of the VF of `interface` at `pci`.
    #[instrument(skip(self), fields(pci = %pci))]
    pub async fn get_vf_id_from_pci(&self, interface: &str, pci: &PciAddress) -> Result<u32> {
        self.vf_links(&command::list_vfs(interface))
            .await?
            .into_iter()
            .find(|link| link.target.slot == pci.slot && link.target.func == pci.func)
            .map(|link| link.id)
            .ok_or_else(|| HypervisorError::Vf(format!("Not matched VFs for interface {interface}.")))
    }

    /// Id of the VF at `vf` under the PF at `pf`.
    #[instrument(skip(self), fields(pf = %pf, vf = %vf))]
    pub async fn get_vf_id_by_pci(&self, pf: &PciAddress, vf: &PciAddress) -> Result<u32> {
        self.vf_links(&command::list_vfs_by_pci(pf))
            .await?
            .into_iter()
            .find(|link| link.target.slot == vf.slot && link.target.func == vf.func)
            .map(|link| link.id)
            .ok_or_else(|| HypervisorError::Vf(format!("Not matched VFs for PF PCI Address {pf}")))
    }

    // =========================================================================
    // VF count
    // =========================================================================

    /// Write `sriov_numvfs`. A busy PF has VFs already, which the kernel only
    /// lets go of through a write of 0.
    async fn write_numvfs(&self, write: &str, reset: &str) -> Result<()> {
        let timeout = self.config.sysfs_timeout();
        let output = self
            .connection
            .execute_command(
                write,
                ExecOptions::new().shell().expect_codes(&[0, 1]).timeout(timeout),
            )
            .await?;

        if output.return_code == 0 {
            return Ok(());
        }
        if !output.stderr.contains(DEVICE_BUSY) {
            return Err(execution_error(output));
        }

        warn!("VFs already configured, resetting VF count before writing it again");
        let options = ExecOptions::new().shell().timeout(timeout);
        self.connection.execute_command(reset, options.clone()).await?;
        self.connection.execute_command(write, options).await?;
        Ok(())
    }

    /// Set the number of VFs of `interface`, optionally verifying the result.
    #[instrument(skip(self))]
    pub async fn set_number_of_vfs_for_pf(&self, interface: &str, count: u32, check: bool) -> Result<()> {
        self.connection
            .execute_command(&command::interface_exists(interface), ExecOptions::new())
            .await
            .map_err(|e| match e {
                HypervisorError::Execution { .. } => HypervisorError::InterfaceNotFound(interface.to_string()),
                other => other,
            })?;

        info!("Setting {} VFs on {}", count, interface);
        self.write_numvfs(
            &command::set_numvfs(interface, count),
            &command::set_numvfs(interface, 0),
        )
        .await?;

        if check {
            self.check_number_of_vfs(interface, count).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(pf = %pf))]
    pub async fn set_number_of_vfs_for_pf_by_pci(&self, pf: &PciAddress, count: u32, check: bool) -> Result<()> {
        info!("Setting {} VFs on {}", count, pf);
        self.write_numvfs(
            &command::set_numvfs_by_pci(pf, count),
            &command::set_numvfs_by_pci(pf, 0),
        )
        .await?;

        if check {
            self.check_number_of_vfs_by_pci(pf, count).await?;
        }
        Ok(())
    }

    /// Count VF symlinks; a listing that finds none counts as zero.
    async fn count_vfs(&self, command: &str) -> Result<usize> {
        let output = self
            .connection
            .execute_command(command, ExecOptions::new().shell().any_code())
            .await?;
        if output.return_code == 0 {
            return Ok(parser::parse_vf_links(&output.stdout)?.len());
        }
        if output.stderr.contains(NO_SUCH_FILE) {
            return Ok(0);
        }
        Err(execution_error(output))
    }

    fn expect_vf_count(expected: u32, actual: usize) -> Result<()> {
        let expected = expected as usize;
        if actual != expected {
            return Err(HypervisorError::VfCountMismatch { expected, actual });
        }
        debug!("Found expected {} VFs", actual);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn check_number_of_vfs(&self, interface: &str, count: u32) -> Result<()> {
        let actual = self.count_vfs(&command::list_vfs(interface)).await?;
        Self::expect_vf_count(count, actual)
    }

    #[instrument(skip(self), fields(pf = %pf))]
    pub async fn check_number_of_vfs_by_pci(&self, pf: &PciAddress, count: u32) -> Result<()> {
        let actual = self.count_vfs(&command::list_vfs_by_pci(pf)).await?;
        Self::expect_vf_count(count, actual)
    }

    // =========================================================================
    // VF details
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn get_vfs_details_from_interface(&self, interface: &str) -> Result<Vec<VfDetail>> {
        let output = self
            .connection
            .execute_command(&command::ip_link_show(interface), ExecOptions::new())
            .await?;
        parser::parse_vf_details(&output.stdout)
    }

    #[instrument(skip(self))]
    pub async fn get_vf_id_from_mac_address(&self, interface: &str, mac: &str) -> Result<u32> {
        let mac = mac.to_lowercase();
        self.get_vfs_details_from_interface(interface)
            .await?
            .into_iter()
            .find(|vf| vf.mac_address == mac)
            .map(|vf| vf.id)
            .ok_or_else(|| HypervisorError::Vf(format!("Not found VF with MAC {mac} on interface {interface}.")))
    }

    /// Whether the VF is bound to `vfio-pci`, i.e. ready for passthrough.
    #[instrument(skip(self))]
    pub async fn is_vf_attached(&self, interface: &str, vf_id: u32) -> Result<bool> {
        let pci = self.get_pci_address_for_vf(interface, vf_id).await?;
        let output = self
            .connection
            .execute_command(command::LSPCI_KERNEL, ExecOptions::new())
            .await?;

        let short = pci.lspci();
        let device = parser::parse_lspci_kernel(&output.stdout)
            .into_iter()
            .find(|device| device.address == short)
            .ok_or_else(|| {
                HypervisorError::NotFound(format!(
                    "VF PCI: {short} is missing in `lspci -k` output. Cannot check VF attaching state."
                ))
            })?;

        debug!(driver = ?device.driver, "VF {} driver", short);
        Ok(device.driver.as_deref() == Some("vfio-pci"))
    }
}
