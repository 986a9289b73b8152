//! Guest-property responses from `VBoxManage guestproperty get`.

/// Placeholder address VirtualBox reports before a guest NIC has an address.
pub const UNASSIGNED_GUEST_IP: &str = "0.0.0.0";

/// Extract the value from a `Value: <x>` response.
///
/// Any other shape, including the literal `No value set!`, means the
/// property is absent.
pub fn parse_guest_property(output: &str) -> Option<String> {
    let value = output.lines().next()?.strip_prefix("Value:")?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Extract a guest IP address, treating `0.0.0.0` as absent.
///
/// An unassigned placeholder address is not a usable answer; callers polling
/// for connectivity must keep waiting rather than connect to it.
pub fn parse_guest_ip(output: &str) -> Option<String> {
    parse_guest_property(output).filter(|ip| ip != UNASSIGNED_GUEST_IP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_line_yields_trimmed_value() {
        assert_eq!(parse_guest_property("Value: Baz\n"), Some("Baz".to_string()));
        assert_eq!(parse_guest_property("Value: Baz"), Some("Baz".to_string()));
    }

    #[test]
    fn no_value_set_is_absent() {
        assert_eq!(parse_guest_property("No value set!"), None);
        assert_eq!(parse_guest_property(""), None);
        assert_eq!(parse_guest_property("Value:"), None);
    }

    #[test]
    fn guest_ip_passes_real_addresses_through() {
        assert_eq!(parse_guest_ip("Value: 127.1.2.3"), Some("127.1.2.3".to_string()));
    }

    #[test]
    fn unassigned_guest_ip_is_absent() {
        assert_eq!(parse_guest_ip("Value: 0.0.0.0"), None);
    }
}
