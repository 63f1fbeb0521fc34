//! PCI addresses in the `dddd:bb:ss.f` form used by sysfs, lspci and libvirt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HypervisorError;

/// A PCI device address.
///
/// The function number is normally 0-7, but VF symlink targets of PFs with
/// many VFs use alternative routing IDs that go up to 0xff, so it is kept as
/// a full byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
}

impl PciAddress {
    pub fn new(domain: u32, bus: u8, slot: u8, func: u8) -> Self {
        Self { domain, bus, slot, func }
    }

    /// Short `bb:ss.f` form printed by `lspci`.
    pub fn lspci(&self) -> String {
        format!("{:02x}:{:02x}.{:x}", self.bus, self.slot, self.func)
    }

    /// Sysfs form with the colons escaped for use inside a shell command.
    pub fn shell_escaped(&self) -> String {
        self.to_string().replace(':', "\\:")
    }

    /// Build an address from the hex attribute values of a libvirt
    /// `<address domain='0x0000' bus='0x18' slot='0x10' function='0x1'/>`.
    pub fn from_hex_fields(domain: &str, bus: &str, slot: &str, func: &str) -> Result<Self, HypervisorError> {
        let whole = format!("{domain}:{bus}:{slot}.{func}");
        let invalid = || HypervisorError::InvalidPciAddress(whole.clone());
        Ok(Self {
            domain: parse_hex(domain).ok_or_else(invalid)?,
            bus: parse_hex(bus).and_then(|v| u8::try_from(v).ok()).ok_or_else(invalid)?,
            slot: parse_hex(slot).and_then(|v| u8::try_from(v).ok()).ok_or_else(invalid)?,
            func: parse_hex(func).and_then(|v| u8::try_from(v).ok()).ok_or_else(invalid)?,
        })
    }
}

fn parse_hex(value: &str) -> Option<u32> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).ok()
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.func
        )
    }
}

impl FromStr for PciAddress {
    type Err = HypervisorError;

    /// Accepts `dddd:bb:ss.f` and the short `bb:ss.f` form (domain 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || HypervisorError::InvalidPciAddress(s.to_string());

        let (head, func) = s.rsplit_once('.').ok_or_else(invalid)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, slot) = match parts.as_slice() {
            [domain, bus, slot] => (*domain, *bus, *slot),
            [bus, slot] => ("0", *bus, *slot),
            _ => return Err(invalid()),
        };

        let byte = |v: &str| u8::from_str_radix(v, 16).map_err(|_| invalid());
        Ok(Self {
            domain: u32::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: byte(bus)?,
            slot: byte(slot)?,
            func: byte(func)?,
        })
    }
}
