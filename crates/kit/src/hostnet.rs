//! Typed records for VBoxManage's host-side network listings.

use serde::Serialize;

use crate::output::parse_blocks;

/// One DHCP server from `VBoxManage list dhcpservers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpServer {
    pub network_name: String,
    /// Interface suffix of the network name, e.g. `vboxnet0` for
    /// `HostInterfaceNetworking-vboxnet0`.
    pub network: String,
    pub ip: String,
    pub netmask: String,
    pub lower: String,
    pub upper: String,
}

/// One host-only interface from `VBoxManage list hostonlyifs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOnlyInterface {
    pub name: String,
    pub ip: String,
    pub netmask: String,
    pub status: String,
}

const DHCP_SERVER_KEYS: &[&str] = &[
    "NetworkName",
    "IP",
    "NetworkMask",
    "lowerIPAddress",
    "upperIPAddress",
];

const HOST_ONLY_KEYS: &[&str] = &["Name", "IPAddress", "NetworkMask", "Status"];

/// Parse `list dhcpservers` output, one record per complete block in input
/// order. Empty input yields an empty vec.
pub fn parse_dhcp_servers(text: &str) -> Vec<DhcpServer> {
    parse_blocks(text, DHCP_SERVER_KEYS)
        .iter()
        .filter_map(|block| {
            let network_name = block.get("NetworkName")?;
            Some(DhcpServer {
                network_name: network_name.to_string(),
                network: network_suffix(network_name).to_string(),
                ip: block.get("IP")?.to_string(),
                netmask: block.get("NetworkMask")?.to_string(),
                lower: block.get("lowerIPAddress")?.to_string(),
                upper: block.get("upperIPAddress")?.to_string(),
            })
        })
        .collect()
}

/// Parse `list hostonlyifs` output. Keys beyond the four captured here
/// (GUID, DHCP, IPV6Address, HardwareAddress, MediumType, ...) are ignored.
pub fn parse_host_only_interfaces(text: &str) -> Vec<HostOnlyInterface> {
    parse_blocks(text, HOST_ONLY_KEYS)
        .iter()
        .filter_map(|block| {
            Some(HostOnlyInterface {
                name: block.get("Name")?.to_string(),
                ip: block.get("IPAddress")?.to_string(),
                netmask: block.get("NetworkMask")?.to_string(),
                status: block.get("Status")?.to_string(),
            })
        })
        .collect()
}

/// The portion of a network name after its final `-`, or the whole name if
/// it has none.
fn network_suffix(network_name: &str) -> &str {
    network_name
        .rsplit_once('-')
        .map(|(_, suffix)| suffix)
        .unwrap_or(network_name)
}
