//! Subcommand execution against a [`KvmHypervisor`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Write;
use std::net::Ipv4Addr;
use tracing::{info, warn};
use uuid::Uuid;

use kvmpilot_hypervisor::{KvmHypervisor, NetworkDataEntry, VmParams};

use crate::cli::{Command, RunVmArgs};

/// Rendering of command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

impl OutputFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Yaml
        }
    }

    fn write<T: Serialize, W: Write>(self, out: &mut W, value: &T) -> Result<()> {
        match self {
            Self::Json => {
                serde_json::to_writer_pretty(&mut *out, value)?;
                writeln!(out)?;
            }
            Self::Yaml => serde_yaml::to_writer(&mut *out, value)?,
        }
        Ok(())
    }
}

/// A VM created by `run-vm` or `run-siov-vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedVm {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mdev_uuid: Option<String>,
}

/// Execute one subcommand and write its result to `out`.
pub async fn run<W: Write>(command: &Command, hv: &KvmHypervisor, format: OutputFormat, out: &mut W) -> Result<()> {
    match command {
        Command::List { all } => {
            let vms = hv.list_vms(*all).await;
            format.write(out, &vms)
        }

        Command::Status { name } => {
            let status = hv
                .get_vm_status(name)
                .await
                .with_context(|| format!("Failed to get status of {name}"))?;
            let fields: serde_json::Map<String, serde_json::Value> = status
                .fields
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            format.write(out, &fields)
        }

        Command::StopAll { force } => {
            if !hv.stop_all_vms(*force).await {
                bail!("Not every VM stopped");
            }
            Ok(())
        }

        Command::StartAll => {
            if !hv.start_all_vms().await {
                bail!("Not every VM started");
            }
            Ok(())
        }

        Command::SetVfs {
            interface,
            pf,
            count,
            no_check,
        } => {
            match (interface, pf) {
                (Some(interface), _) => hv
                    .set_number_of_vfs_for_pf(interface, *count, !no_check)
                    .await
                    .with_context(|| format!("Failed to set {count} VFs on {interface}"))?,
                (None, Some(pf)) => hv
                    .set_number_of_vfs_for_pf_by_pci(pf, *count, !no_check)
                    .await
                    .with_context(|| format!("Failed to set {count} VFs on {pf}"))?,
                (None, None) => bail!("Either --interface or --pf is required"),
            }
            info!("{} VFs configured", count);
            Ok(())
        }

        Command::FreeNetworkData { network_data, count } => {
            let free = hv.get_free_network_data(network_data, *count).await?;
            format.write(out, &free)
        }

        Command::RunVm(args) => {
            let vm = run_vm(hv, args, None).await?;
            format.write(out, &vm)
        }

        Command::RunSiovVm { vm, parent, mdev_xml } => {
            let uuid = Uuid::new_v4().to_string();
            hv.create_mdev(&uuid, parent, mdev_xml)
                .await
                .with_context(|| format!("Failed to create mdev on {parent}"))?;

            let created = match run_vm(hv, vm, Some(uuid.clone())).await {
                Ok(created) => created,
                Err(e) => {
                    if let Err(cleanup) = hv.destroy_mdev(&uuid).await {
                        warn!("Cannot remove mdev {}: {}", uuid, cleanup);
                    }
                    return Err(e);
                }
            };
            hv.attach_device(&created.name, mdev_xml)
                .await
                .with_context(|| format!("Failed to attach mdev {uuid} to {}", created.name))?;
            format.write(out, &created)
        }

        Command::AttachPciControllers(args) => {
            hv.attach_pci_controllers(&args.name, args.count, args.layout())
                .await
                .with_context(|| format!("Failed to attach PCI controllers to {}", args.name))?;
            Ok(())
        }
    }
}

/// VM parameters for one network-data entry.
pub fn vm_params(args: &RunVmArgs, entry: &NetworkDataEntry) -> VmParams {
    let mut params = VmParams::new(KvmHypervisor::get_name_from_ip(entry.ip, &args.prefix))
        .with_cpu(args.cpu)
        .with_memory(args.memory)
        .with_firmware(args.firmware())
        .with_mac(entry.mac.clone());

    if let Some(ref os_variant) = args.os_variant {
        params = params.with_os_variant(os_variant.clone());
    }
    if let Some(ref bridge) = args.bridge {
        params = params.with_bridge(bridge.clone());
    }
    if let Some(ref disk) = args.disk {
        params = params.with_disk(disk.clone());
    }
    if let Some(ref dir) = args.clone_to {
        params = params.with_clone_to(dir.clone());
    }
    if let Some(ref template) = args.xml_template {
        params = params.with_xml_template(template.clone());
    }
    params
}

async fn run_vm(hv: &KvmHypervisor, args: &RunVmArgs, mdev_uuid: Option<String>) -> Result<CreatedVm> {
    let entry = hv
        .get_free_network_data(&args.network_data, 1)
        .await?
        .into_iter()
        .next()
        .context("No free network data")?;

    let params = vm_params(args, &entry);
    let name = hv
        .create_vm(&params)
        .await
        .with_context(|| format!("Failed to create VM {}", params.name))?;
    info!(ip = %entry.ip, "VM {} created", name);

    if args.wait && !hv.wait_for_vm_up(&name).await? {
        bail!("VM {name} did not start in time");
    }

    Ok(CreatedVm {
        name,
        ip: entry.ip,
        mac: entry.mac,
        mdev_uuid,
    })
}
