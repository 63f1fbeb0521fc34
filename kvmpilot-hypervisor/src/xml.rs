//! Libvirt domain XML.
//!
//! `virsh dumpxml` output is read into a small element tree with quick-xml;
//! lookups walk the tree. Only elements and attributes are kept, text nodes
//! are not needed by any lookup.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};
use crate::pci::PciAddress;
use crate::types::{HostdevPair, MdevDetail};

/// An XML element with its attributes and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given tag.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// This element and all its descendants, depth first in document order.
    pub fn descendants(&self) -> Vec<&XmlNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.descendants());
        }
        out
    }

    /// All descendants (self included) with the given tag.
    pub fn find_all(&self, name: &str) -> Vec<&XmlNode> {
        self.descendants()
            .into_iter()
            .filter(|n| n.name == name)
            .collect()
    }
}

fn element(start: &BytesStart<'_>) -> Result<XmlNode> {
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| HypervisorError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| HypervisorError::Xml(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlNode {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes,
        children: Vec::new(),
    })
}

/// Parse a document and return its root element.
pub fn parse(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(element(&start)?),
            Ok(Event::Empty(start)) => {
                let node = element(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| HypervisorError::Xml("unbalanced closing tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(HypervisorError::Xml(format!(
                    "error at position {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if !stack.is_empty() {
        return Err(HypervisorError::Xml("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| HypervisorError::Xml("empty document".to_string()))
}

// =============================================================================
// DOMAIN LOOKUPS
// =============================================================================

fn pci_not_found() -> HypervisorError {
    HypervisorError::NotFound("PCI not found in xml!".to_string())
}

/// Read a `<address domain= bus= slot= function=/>` element.
fn pci_from_address(address: Option<&XmlNode>) -> Result<PciAddress> {
    let address = address.ok_or_else(pci_not_found)?;
    match (
        address.attr("domain"),
        address.attr("bus"),
        address.attr("slot"),
        address.attr("function"),
    ) {
        (Some(domain), Some(bus), Some(slot), Some(func)) => {
            PciAddress::from_hex_fields(domain, bus, slot, func)
        }
        _ => Err(pci_not_found()),
    }
}

fn is_pci_hostdev(node: &XmlNode) -> bool {
    (node.name == "hostdev" && node.attr("type") == Some("pci"))
        || (node.name == "interface" && node.attr("type") == Some("hostdev"))
}

/// Host and guest PCI addresses of every passed-through PCI device.
pub fn pci_hostdev_pairs(domain: &XmlNode) -> Result<Vec<HostdevPair>> {
    let devices: Vec<&XmlNode> = domain
        .descendants()
        .into_iter()
        .filter(|n| is_pci_hostdev(n))
        .collect();
    if devices.is_empty() {
        return Err(HypervisorError::NotFound(
            "Interface with Host VF and VM VF not found in xml!".to_string(),
        ));
    }

    devices
        .into_iter()
        .map(|device| {
            let host = pci_from_address(device.child("source").and_then(|s| s.child("address")))?;
            let guest = pci_from_address(device.child("address"))?;
            Ok(HostdevPair { host, guest })
        })
        .collect()
}

/// UUID and guest PCI address of every mediated device.
pub fn mdev_hostdevs(domain: &XmlNode) -> Result<Vec<MdevDetail>> {
    let devices: Vec<&XmlNode> = domain
        .find_all("hostdev")
        .into_iter()
        .filter(|n| n.attr("type") == Some("mdev"))
        .collect();
    if devices.is_empty() {
        return Err(HypervisorError::NotFound(
            "Interface with MDEV not found in xml!".to_string(),
        ));
    }

    devices
        .into_iter()
        .map(|device| {
            let uuid = device
                .child("source")
                .and_then(|s| s.child("address"))
                .and_then(|a| a.attr("uuid"))
                .ok_or_else(|| {
                    HypervisorError::NotFound("Interface with MDEV does not contains UUID!".to_string())
                })?;
            let guest = pci_from_address(device.child("address"))?;
            Ok(MdevDetail {
                uuid: uuid.to_string(),
                guest,
            })
        })
        .collect()
}

/// Path of the first file-backed `<source file=.../>` element.
pub fn disk_source_file(domain: &XmlNode) -> Option<String> {
    domain
        .find_all("source")
        .into_iter()
        .find_map(|s| s.attr("file"))
        .map(str::to_string)
}
