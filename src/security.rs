use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Parses an allowlist of IP addresses and CIDR ranges.
/// A bare address becomes a single-host network.
pub fn parse_allowlist(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            if let Ok(ip) = entry.parse::<IpAddr>() {
                Ok(IpNet::from(ip))
            } else if let Ok(net) = entry.parse::<IpNet>() {
                Ok(net)
            } else {
                Err(anyhow!(
                    "Invalid IP address or CIDR in allowed_client_ips: {}",
                    entry
                ))
            }
        })
        .collect()
}

/// Checks if a client IP address is allowed based on the configured allowlist
/// Returns true if no allowlist is configured (allow all) or if IP matches any entry
#[must_use]
pub fn is_client_ip_allowed(client_ip: IpAddr, allowed: Option<&[IpNet]>) -> bool {
    let Some(allowed) = allowed else {
        return true; // No restrictions configured
    };

    // IPv4 clients on a dual-stack socket arrive as mapped IPv6 addresses.
    let client_ip = match client_ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(client_ip, IpAddr::V4),
        IpAddr::V4(_) => client_ip,
    };

    allowed.iter().any(|net| net.contains(&client_ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(entries: &[&str]) -> Vec<IpNet> {
        let entries: Vec<String> = entries.iter().map(ToString::to_string).collect();
        parse_allowlist(&entries).unwrap()
    }

    #[test]
    fn no_allowlist_allows_everyone() {
        assert!(is_client_ip_allowed("203.0.113.9".parse().unwrap(), None));
    }

    #[test]
    fn matches_addresses_and_ranges() {
        let allowed = allowlist(&["127.0.0.1", "10.0.0.0/8", "2001:db8::/32"]);

        assert!(is_client_ip_allowed("127.0.0.1".parse().unwrap(), Some(allowed.as_slice())));
        assert!(is_client_ip_allowed("10.20.30.40".parse().unwrap(), Some(allowed.as_slice())));
        assert!(is_client_ip_allowed("2001:db8::5".parse().unwrap(), Some(allowed.as_slice())));
        assert!(!is_client_ip_allowed("127.0.0.2".parse().unwrap(), Some(allowed.as_slice())));
        assert!(!is_client_ip_allowed("192.168.1.1".parse().unwrap(), Some(allowed.as_slice())));
    }

    #[test]
    fn mapped_ipv4_matches_ipv4_entries() {
        let allowed = allowlist(&["192.0.2.0/24"]);
        assert!(is_client_ip_allowed("::ffff:192.0.2.1".parse().unwrap(), Some(allowed.as_slice())));
    }

    #[test]
    fn empty_allowlist_rejects_everyone() {
        assert!(!is_client_ip_allowed("127.0.0.1".parse().unwrap(), Some(&[][..])));
    }

    #[test]
    fn rejects_invalid_entries() {
        let err = parse_allowlist(&["not-an-ip".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }
}
