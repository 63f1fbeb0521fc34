//! Parsers for virsh, sysfs, iproute2 and lspci text output.
//!
//! All functions are pure. Tables are expected in the virsh layout: a
//! header line, a separator made of dashes, then one record per line.

use regex::Regex;
use std::net::Ipv4Addr;

use crate::error::{HypervisorError, Result};
use crate::pci::PciAddress;
use crate::types::{NetworkDataEntry, VfDetail, VmListEntry, VmState, VmStatus};

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| HypervisorError::Parse(format!("invalid pattern {pattern}: {e}")))
}

const MAC_PATTERN: &str = r"^[0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5}$";

/// Lines after the dashed separator, trimmed, blank lines dropped.
pub fn table_rows(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .skip_while(|line| !is_separator(line))
        .skip(1)
        .filter(|line| !line.is_empty())
        .collect()
}

fn is_separator(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| c == '-')
}

fn strip_prefix_len(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

// =============================================================================
// VIRSH
// =============================================================================

/// `Key:   value` lines into an ordered record.
pub fn parse_key_value_block(output: &str) -> VmStatus {
    let fields = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    VmStatus { fields }
}

/// `virsh list` rows: id, name and a possibly multi-word state.
pub fn parse_vm_list(output: &str) -> Vec<VmListEntry> {
    table_rows(output)
        .into_iter()
        .filter_map(|row| {
            let tokens: Vec<&str> = row.split_whitespace().collect();
            if tokens.len() < 3 {
                return None;
            }
            Some(VmListEntry {
                id: tokens[0].to_string(),
                name: tokens[1].to_string(),
                state: VmState::parse(&tokens[2..].join(" ")),
            })
        })
        .collect()
}

/// Network names from `virsh net-list`.
pub fn parse_network_list(output: &str) -> Vec<String> {
    table_rows(output)
        .into_iter()
        .filter_map(|row| {
            let tokens: Vec<&str> = row.split_whitespace().collect();
            (tokens.len() >= 4).then(|| tokens[0].to_string())
        })
        .collect()
}

/// MAC of the first interface in `virsh domiflist`.
pub fn parse_first_interface_mac(output: &str) -> Option<String> {
    table_rows(output).into_iter().find_map(|row| {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        (tokens.len() >= 5).then(|| tokens[tokens.len() - 1].to_lowercase())
    })
}

/// One address reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Lowercase MAC of the interface owning the address
    pub mac: String,
    pub protocol: String,
    /// Address with the prefix length stripped
    pub address: String,
}

/// `virsh domifaddr --source agent` table.
///
/// Rows starting with `-` continue the previous interface. Windows guests
/// report interface names with spaces, so the MAC is located by pattern and
/// protocol and address are always the last two columns. Interfaces without
/// a MAC (loopback) reset the current interface.
pub fn parse_agent_addresses(output: &str) -> Result<Vec<InterfaceAddress>> {
    let mac_re = regex(MAC_PATTERN)?;
    let mut current: Option<String> = None;
    let mut addresses = Vec::new();

    for row in table_rows(output) {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let (head, tail) = tokens.split_at(tokens.len() - 2);

        if head[0] != "-" {
            current = head
                .iter()
                .find(|t| mac_re.is_match(t))
                .map(|mac| mac.to_lowercase());
        }

        if let Some(mac) = &current {
            addresses.push(InterfaceAddress {
                mac: mac.clone(),
                protocol: tail[0].to_string(),
                address: strip_prefix_len(tail[1]).to_string(),
            });
        }
    }
    Ok(addresses)
}

/// One lease from `virsh net-dhcp-leases`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
}

/// IPv4 leases; rows are `date time mac protocol ip/prefix [hostname] [client id]`.
pub fn parse_dhcp_leases(output: &str) -> Vec<DhcpLease> {
    table_rows(output)
        .into_iter()
        .filter_map(|row| {
            let tokens: Vec<&str> = row.split_whitespace().collect();
            if tokens.len() < 5 || tokens[3] != "ipv4" {
                return None;
            }
            let ip = strip_prefix_len(tokens[4]).parse().ok()?;
            Some(DhcpLease {
                mac: tokens[2].to_lowercase(),
                ip,
                hostname: tokens.get(5).map(|h| h.to_string()),
            })
        })
        .collect()
}

// =============================================================================
// SR-IOV
// =============================================================================

/// A `virtfnN -> ../<pci>` symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfLink {
    pub id: u32,
    pub target: PciAddress,
}

/// Every VF symlink in `ls -l .../virtfn*` output, in listing order.
pub fn parse_vf_links(output: &str) -> Result<Vec<VfLink>> {
    let re = regex(
        r"virtfn(\d+)\s+->\s+\S*?([0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-9a-fA-F]{1,2})\b",
    )?;

    re.captures_iter(output)
        .map(|caps| {
            let id = caps[1]
                .parse()
                .map_err(|_| HypervisorError::Parse(format!("invalid VF id: {}", &caps[1])))?;
            let target = caps[2].parse()?;
            Ok(VfLink { id, target })
        })
        .collect()
}

/// `vf N link/ether MAC ..., spoof checking on, ..., trust off` lines of
/// `ip link show`.
pub fn parse_vf_details(output: &str) -> Result<Vec<VfDetail>> {
    let vf_re = regex(r"^\s*vf\s+(\d+)\s+(?:link/ether|MAC)\s+([0-9a-fA-F:]{17})")?;
    let spoof_re = regex(r"spoof checking (on|off)")?;
    let trust_re = regex(r"trust (on|off)")?;

    let mut details = Vec::new();
    for line in output.lines() {
        let Some(caps) = vf_re.captures(line) else {
            continue;
        };
        let id = caps[1]
            .parse()
            .map_err(|_| HypervisorError::Parse(format!("invalid VF id in: {line}")))?;
        let flag = |re: &Regex| re.captures(line).is_some_and(|c| &c[1] == "on");
        details.push(VfDetail {
            id,
            mac_address: caps[2].to_lowercase(),
            spoofchk: flag(&spoof_re),
            trust: flag(&trust_re),
        });
    }
    Ok(details)
}

/// A device block from `lspci -k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LspciDevice {
    /// Address as printed, usually the short `bb:ss.f` form
    pub address: String,
    pub driver: Option<String>,
}

pub fn parse_lspci_kernel(output: &str) -> Vec<LspciDevice> {
    let mut devices: Vec<LspciDevice> = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some(address) = line.split_whitespace().next() {
                devices.push(LspciDevice {
                    address: address.to_string(),
                    driver: None,
                });
            }
        } else if let Some(driver) = line.trim().strip_prefix("Kernel driver in use:") {
            if let Some(device) = devices.last_mut() {
                device.driver = Some(driver.trim().to_string());
            }
        }
    }
    devices
}

// =============================================================================
// MISC
// =============================================================================

/// Every UUID token in `output`.
pub fn parse_uuids(output: &str) -> Result<Vec<String>> {
    let re = regex(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")?;
    Ok(re.find_iter(output).map(|m| m.as_str().to_string()).collect())
}

/// `<ip> <mac>` lines of the `[kvm]` section of a network-data file.
pub fn parse_network_data(content: &str) -> Result<Vec<NetworkDataEntry>> {
    let mut in_section = false;
    let mut entries = Vec::new();

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            in_section = line == "[kvm]";
            continue;
        }
        if !in_section {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(ip), Some(mac)) = (tokens.next(), tokens.next()) else {
            return Err(HypervisorError::Parse(format!("invalid network data line: {line}")));
        };
        let ip = ip
            .parse()
            .map_err(|_| HypervisorError::Parse(format!("invalid IP address in network data: {ip}")))?;
        entries.push(NetworkDataEntry::new(ip, mac));
    }

    if entries.is_empty() {
        return Err(HypervisorError::NotFound(
            "No network data found in [kvm] section".to_string(),
        ));
    }
    Ok(entries)
}

/// First integer in `output`, used for size and memory queries.
pub fn parse_first_number(output: &str) -> Option<u64> {
    output
        .split_whitespace()
        .find_map(|token| token.parse().ok())
}
