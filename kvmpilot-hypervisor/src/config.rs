//! Tunables of the hypervisor facade.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::command::{LargeVcpuPolicy, MDEV_TEMPLATE, PCI_CONTROLLER_TEMPLATE, VF_TEMPLATE};
use crate::error::{HypervisorError, Result};

/// Facade configuration. Every field has a default, so a partial YAML
/// section is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Timeout of every virsh command
    pub virsh_timeout_secs: u64,
    /// Timeout of `sriov_numvfs` writes
    pub sysfs_timeout_secs: u64,
    /// How long to wait for a VM to reach a state
    pub vm_state_timeout_secs: u64,
    pub vm_state_interval_secs: u64,
    /// Progress check interval while cloning a disk image
    pub clone_interval_secs: u64,
    /// Clone timeout used when the VM parameters do not set one
    pub clone_timeout_secs: u64,
    /// Guest agent queries before giving up on the management address
    pub mng_ip_tries: u32,
    pub mng_ip_interval_secs: u64,
    /// libvirt network queried for DHCP leases
    pub dhcp_network: String,
    /// Host directory for rendered device XML and domain definitions
    pub work_dir: String,
    pub templates: TemplateConfig,
    /// Mediated device type created on mdev capable PFs
    pub mdev_type: String,
    pub large_vcpu: LargeVcpuPolicy,
    pub ram: RamPolicy,
    /// Return codes of the ping probe that mark an address as unused
    pub probe_free_codes: Vec<i32>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            virsh_timeout_secs: 120,
            sysfs_timeout_secs: 60,
            vm_state_timeout_secs: 60,
            vm_state_interval_secs: 5,
            clone_interval_secs: 30,
            clone_timeout_secs: 1000,
            mng_ip_tries: 60,
            mng_ip_interval_secs: 5,
            dhcp_network: "default".to_string(),
            work_dir: "/tmp".to_string(),
            templates: TemplateConfig::default(),
            mdev_type: "ice-vdcm".to_string(),
            large_vcpu: LargeVcpuPolicy::default(),
            ram: RamPolicy::default(),
            probe_free_codes: vec![1, 2],
        }
    }
}

impl HypervisorConfig {
    pub fn virsh_timeout(&self) -> Duration {
        Duration::from_secs(self.virsh_timeout_secs)
    }

    pub fn sysfs_timeout(&self) -> Duration {
        Duration::from_secs(self.sysfs_timeout_secs)
    }

    pub fn vm_state_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_state_timeout_secs)
    }

    pub fn vm_state_interval(&self) -> Duration {
        Duration::from_secs(self.vm_state_interval_secs)
    }

    pub fn clone_interval(&self) -> Duration {
        Duration::from_secs(self.clone_interval_secs)
    }

    pub fn mng_ip_interval(&self) -> Duration {
        Duration::from_secs(self.mng_ip_interval_secs)
    }

    /// Reject settings the facade cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.virsh_timeout_secs == 0 || self.sysfs_timeout_secs == 0 {
            return Err(HypervisorError::InvalidConfig(
                "command timeouts must be greater than zero".to_string(),
            ));
        }
        if self.mng_ip_tries == 0 {
            return Err(HypervisorError::InvalidConfig(
                "mng_ip_tries must be at least 1".to_string(),
            ));
        }
        if self.ram.min_mb > self.ram.max_mb {
            return Err(HypervisorError::InvalidConfig(format!(
                "ram.min_mb ({}) is greater than ram.max_mb ({})",
                self.ram.min_mb, self.ram.max_mb
            )));
        }
        if self.probe_free_codes.is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "probe_free_codes must not be empty".to_string(),
            ));
        }
        if self.work_dir.is_empty() {
            return Err(HypervisorError::InvalidConfig("work_dir is empty".to_string()));
        }
        Ok(())
    }
}

/// Optional template overrides, read from the local filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub vf: Option<PathBuf>,
    pub pci_controller: Option<PathBuf>,
    pub mdev: Option<PathBuf>,
}

/// Device template kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Vf,
    PciController,
    Mdev,
}

impl TemplateConfig {
    fn path(&self, kind: TemplateKind) -> Option<&PathBuf> {
        match kind {
            TemplateKind::Vf => self.vf.as_ref(),
            TemplateKind::PciController => self.pci_controller.as_ref(),
            TemplateKind::Mdev => self.mdev.as_ref(),
        }
    }

    /// The override when configured, the built-in template otherwise.
    pub async fn load(&self, kind: TemplateKind) -> Result<String> {
        match self.path(kind) {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HypervisorError::FileNotFound(path.display().to_string()),
                _ => HypervisorError::Io(e),
            }),
            None => Ok(match kind {
                TemplateKind::Vf => VF_TEMPLATE,
                TemplateKind::PciController => PCI_CONTROLLER_TEMPLATE,
                TemplateKind::Mdev => MDEV_TEMPLATE,
            }
            .to_string()),
        }
    }
}

/// Per-VM memory sizing when many VMs share a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RamPolicy {
    /// Memory kept free for the host, in MB
    pub reserve_mb: u64,
    pub min_mb: u64,
    pub max_mb: u64,
}

impl Default for RamPolicy {
    fn default() -> Self {
        Self {
            reserve_mb: 10000,
            min_mb: 2000,
            max_mb: 10000,
        }
    }
}

impl RamPolicy {
    /// Memory per VM for `free_mb` of available memory, clamped to
    /// `[min_mb, max_mb]`. `None` when even that does not fit.
    pub fn per_vm(&self, free_mb: u64, vm_number: u64) -> Option<u64> {
        let vm_number = vm_number.max(1);
        let share = free_mb.saturating_sub(self.reserve_mb) / vm_number;
        let ram = share.clamp(self.min_mb, self.max_mb);
        (ram * vm_number <= free_mb).then_some(ram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HypervisorConfig::default();
        assert_eq!(config.virsh_timeout(), Duration::from_secs(120));
        assert_eq!(config.sysfs_timeout(), Duration::from_secs(60));
        assert_eq!(config.clone_timeout_secs, 1000);
        assert_eq!(config.mdev_type, "ice-vdcm");
        assert_eq!(config.probe_free_codes, vec![1, 2]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config = HypervisorConfig::default();
        config.ram.min_mb = 20000;
        assert!(matches!(config.validate(), Err(HypervisorError::InvalidConfig(_))));

        let config = HypervisorConfig {
            mng_ip_tries: 0,
            ..HypervisorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HypervisorConfig {
            probe_free_codes: Vec::new(),
            ..HypervisorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ram_policy() {
        let policy = RamPolicy::default();
        assert_eq!(policy.per_vm(18000, 2), Some(4000));
        assert_eq!(policy.per_vm(40000, 2), Some(10000));
        assert_eq!(policy.per_vm(13000, 2), Some(2000));
        assert_eq!(policy.per_vm(3000, 2), None);
    }

    #[tokio::test]
    async fn test_template_load() {
        let templates = TemplateConfig::default();
        let vf = templates.load(TemplateKind::Vf).await.unwrap();
        assert!(vf.contains("{{domain}}"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.xml");
        std::fs::write(&path, "<hostdev bus='{{bus}}'/>").unwrap();
        let templates = TemplateConfig {
            vf: Some(path),
            ..TemplateConfig::default()
        };
        assert_eq!(
            templates.load(TemplateKind::Vf).await.unwrap(),
            "<hostdev bus='{{bus}}'/>"
        );

        let templates = TemplateConfig {
            mdev: Some(PathBuf::from("/nonexistent/mdev.xml")),
            ..TemplateConfig::default()
        };
        assert!(matches!(
            templates.load(TemplateKind::Mdev).await,
            Err(HypervisorError::FileNotFound(_))
        ));
    }
}
