//! Input validation and address arithmetic
//!
//! Interface names end up in `ip` command invocations, so they are
//! validated to prevent command injection.

use crate::error::{TrackerError, TrackerResult};
use std::net::{IpAddr, Ipv4Addr};

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Prefix length used when a netmask cannot be parsed
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> TrackerResult<()> {
    if name.is_empty() {
        return Err(TrackerError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(TrackerError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(TrackerError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(TrackerError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> TrackerResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| TrackerError::InvalidParameter(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Convert a dotted IPv4 netmask into a prefix length.
///
/// An unparsable or non-contiguous netmask falls back to
/// [`DEFAULT_PREFIX_LEN`]; the anomaly is logged by the caller but never
/// fails a connection attempt.
pub fn netmask_to_prefix_len(netmask: &str) -> u8 {
    let mask: Ipv4Addr = match netmask.parse() {
        Ok(m) => m,
        Err(_) => return DEFAULT_PREFIX_LEN,
    };

    let bits = u32::from(mask);
    let prefix = bits.leading_ones();

    // Reject masks with holes (e.g. 255.0.255.0)
    if bits != prefix_to_mask(prefix as u8) {
        return DEFAULT_PREFIX_LEN;
    }

    prefix as u8
}

fn prefix_to_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}
