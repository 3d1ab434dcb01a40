//! Input validation functions for nftfleet
//!
//! Every field that ends up interpolated into a generated script is checked
//! here before it is persisted. The compiler still escapes everything it
//! emits; validation exists so that bad input is rejected with a useful
//! message instead of being silently mangled.
//!
//! Functions return `Result<_, String>`; callers wrap the message into
//! [`crate::Error::Validation`] together with the field name.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Maximum length of rule, profile and template names
pub const MAX_NAME_LEN: usize = 128;

/// nftables limits comments to 128 bytes
pub const MAX_COMMENT_LEN: usize = 128;

/// Connection-tracking states accepted in `ct state` matches
pub const CT_STATES: [&str; 5] = ["new", "established", "related", "invalid", "untracked"];

/// Validates a display name (rules, profiles, templates).
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or contains control
/// characters.
pub fn validate_name(input: &str) -> Result<(), String> {
    if input.trim().is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if input.chars().count() > MAX_NAME_LEN {
        return Err(format!("Name too long (max {MAX_NAME_LEN} characters)"));
    }

    if input.chars().any(char::is_control) {
        return Err("Name contains control characters".to_string());
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a port spec: `22`, `1000-2000`, or a comma list of either.
///
/// # Errors
///
/// Returns `Err` if any element is not a valid port or ordered range.
pub fn validate_port_spec(spec: &str) -> Result<(), String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("Port cannot be empty".to_string());
    }

    for item in spec.split(',') {
        let item = item.trim();
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid port '{s}'"))
        };

        if let Some((start, end)) = item.split_once('-') {
            validate_port_range(parse(start)?, parse(end)?)?;
        } else {
            validate_port(parse(item)?)?;
        }
    }

    Ok(())
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates an address match (host or CIDR network, v4 or v6).
///
/// # Errors
///
/// Returns `Err` if the value does not parse as an IP network.
pub fn validate_address(addr: &str) -> Result<IpNetwork, String> {
    addr.trim()
        .parse::<IpNetwork>()
        .map_err(|e| format!("Invalid address '{addr}': {e}"))
}

/// Validates a NAT target (a single host address).
///
/// # Errors
///
/// Returns `Err` if the value is not a plain IP address.
pub fn validate_nat_address(addr: &str) -> Result<IpAddr, String> {
    addr.trim()
        .parse::<IpAddr>()
        .map_err(|_| format!("Invalid NAT address '{addr}' (expected a single IP)"))
}

/// Validates an nft rate expression such as `10/second`.
///
/// Returns Ok(Some(warning)) for high but acceptable values.
///
/// # Errors
///
/// Returns `Err` if the format is wrong, the count is zero, or it exceeds
/// the maximum for its time unit.
pub fn validate_rate(rate: &str) -> Result<Option<String>, String> {
    let (count, unit) = rate
        .trim()
        .split_once('/')
        .ok_or_else(|| format!("Invalid rate '{rate}' (expected N/unit, e.g. 10/second)"))?;

    let count: u64 = count
        .trim()
        .parse()
        .map_err(|_| format!("Invalid rate count '{count}'"))?;

    if count == 0 {
        return Err("Rate must be at least 1".to_string());
    }

    let (max, warn) = match unit.trim() {
        "second" => (10_000, 1_000),
        "minute" => (100_000, 10_000),
        "hour" => (1_000_000, 100_000),
        "day" => (10_000_000, 1_000_000),
        "week" => (70_000_000, 7_000_000),
        other => {
            return Err(format!(
                "Invalid rate unit '{other}' (use second, minute, hour, day, week)"
            ));
        }
    };

    if count > max {
        return Err(format!("Rate exceeds max {max}/{}", unit.trim()));
    }

    if count > warn {
        return Ok(Some(format!(
            "High rate ({count}/{}) - typical: 10-{}",
            unit.trim(),
            warn / 10
        )));
    }

    Ok(None)
}

/// Validates a `ct state` match such as `established,related`.
///
/// Case-insensitive; the compiler lower-cases it.
///
/// # Errors
///
/// Returns `Err` on empty input or unknown states.
pub fn validate_ct_state(state: &str) -> Result<(), String> {
    let mut seen = 0;
    for part in state.split(',') {
        let part = part.trim().to_lowercase();
        if !CT_STATES.contains(&part.as_str()) {
            return Err(format!(
                "Unknown connection state '{part}' (use {})",
                CT_STATES.join(", ")
            ));
        }
        seen += 1;
    }

    if seen == 0 {
        return Err("Connection state cannot be empty".to_string());
    }
    Ok(())
}

/// Validates a log prefix.
///
/// Log prefixes appear in kernel logs and must be safe for syslog.
///
/// # Errors
///
/// Returns `Err` if:
/// - Prefix is empty
/// - Prefix exceeds 64 characters
/// - Prefix contains control characters
pub fn validate_log_prefix(prefix: &str) -> Result<(), String> {
    if prefix.is_empty() {
        return Err("Log prefix cannot be empty".to_string());
    }

    if prefix.len() > 64 {
        return Err("Log prefix too long (max 64 chars)".to_string());
    }

    if prefix.chars().any(char::is_control) {
        return Err("Log prefix contains control characters".to_string());
    }

    Ok(())
}

/// Validates a rule comment.
///
/// # Errors
///
/// Returns `Err` if the comment exceeds the nftables comment limit.
pub fn validate_comment(comment: &str) -> Result<(), String> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(format!(
            "Comment too long (max {MAX_COMMENT_LEN} bytes)"
        ));
    }
    Ok(())
}

/// Validates a raw expression override.
///
/// Raw expressions are emitted verbatim, so they must stay on one line and
/// must not open or close blocks.
///
/// # Errors
///
/// Returns `Err` if the expression is empty, multi-line, contains braces,
/// or is unreasonably long.
pub fn validate_raw_expression(expr: &str) -> Result<(), String> {
    if expr.trim().is_empty() {
        return Err("Raw expression cannot be empty".to_string());
    }

    if expr.len() > 1024 {
        return Err("Raw expression too long (max 1024 bytes)".to_string());
    }

    if expr.chars().any(|c| c == '\n' || c == '\r') {
        return Err("Raw expression must be a single line".to_string());
    }

    if expr.contains('{') || expr.contains('}') {
        return Err("Raw expression cannot contain braces".to_string());
    }

    Ok(())
}

/// Checks if an address is in a reserved range and returns informational warning.
///
/// This is informational only and does not block saving.
pub fn check_reserved_ip(ip: IpNetwork) -> Option<String> {
    match ip.ip() {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();

            // RFC 1918 private ranges
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return Some("Private IP range (RFC 1918) - usually safe for LAN".to_string());
            }

            if octets[0] == 127 {
                return Some("Loopback range (127.x) - loopback base rule may already cover it".to_string());
            }

            if octets[0] == 169 && octets[1] == 254 {
                return Some("Link-local range (169.254.x.x) - APIPA addresses".to_string());
            }

            if ip.prefix() == 0 {
                return Some("Matches every IPv4 address".to_string());
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1)".to_string());
            }

            let segments = ipv6.segments();
            if (segments[0] & 0xfe00) == 0xfc00 {
                return Some("Unique local address (fc00::/7)".to_string());
            }

            if (segments[0] & 0xffc0) == 0xfe80 {
                return Some("Link-local address (fe80::/10)".to_string());
            }

            if ip.prefix() == 0 {
                return Some("Matches every IPv6 address".to_string());
            }

            None
        }
    }
}
