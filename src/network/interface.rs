//! Active interface detection.

use pnet::datalink::{self, NetworkInterface};

/// Find the interface carrying traffic.
///
/// Returns the first interface that is:
/// - Up (active)
/// - Not a loopback interface
/// - Has at least one IP address
pub fn find_active_interface() -> Option<NetworkInterface> {
    select_active(datalink::interfaces())
}

fn select_active(interfaces: Vec<NetworkInterface>) -> Option<NetworkInterface> {
    interfaces
        .into_iter()
        .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
}
