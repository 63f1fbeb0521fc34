//! # kvmpilot Hypervisor
//!
//! Automation layer for KVM/libvirt hosts driven over a command connection.
//!
//! Every host interaction is a shell command (`virsh`, `virt-install`, sysfs
//! reads and writes, `lspci`, `ip`, `brctl`). The crate renders those
//! commands, runs them through a [`Connection`], parses what comes back and
//! polls for state changes:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                KvmHypervisor                 │
//! │  (VM lifecycle, SR-IOV, devices, networks)   │
//! └───────┬──────────────┬───────────────┬───────┘
//!         │              │               │
//!         ▼              ▼               ▼
//! ┌──────────────┐ ┌───────────┐ ┌───────────────┐
//! │   VirtTool   │ │  command  │ │ parser / xml  │
//! │ (VirshTool)  │ │ builders  │ │   / poll      │
//! └──────┬───────┘ └───────────┘ └───────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────┐
//! │  Connection (local, ssh, mock)               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kvmpilot_hypervisor::{KvmHypervisor, SshConnection, VmParams};
//!
//! #[tokio::main]
//! async fn main() {
//!     let connection = Arc::new(SshConnection::new("10.10.10.10").with_user("root"));
//!     let hv = KvmHypervisor::new(connection);
//!
//!     let params = VmParams::new("vm-010-010")
//!         .with_cpu(4)
//!         .with_memory(4096)
//!         .with_mac("aa:bb:cc:dd:ee:01");
//!
//!     let name = hv.create_vm(&params).await.unwrap();
//!     hv.wait_for_vm_up(&name).await.unwrap();
//! }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod hypervisor;
pub mod mock;
pub mod parser;
pub mod pci;
pub mod poll;
pub mod traits;
pub mod types;
pub mod virsh;
pub mod xml;

pub use config::{HypervisorConfig, RamPolicy, TemplateConfig};
pub use connection::{CommandOutput, Connection, ExecOptions, LocalConnection, SshConnection};
pub use error::{HypervisorError, Result};
pub use hypervisor::{ControllerLayout, KvmHypervisor};
pub use mock::MockConnection;
pub use pci::PciAddress;
pub use traits::VirtTool;
pub use types::*;
pub use virsh::VirshTool;
