use super::*;

/// Strip everything a pool database would choke on from a worker name.
pub(crate) fn filter_worker_name(name: &str) -> String {
    name.chars()
        .filter(|c| {
            c.is_ascii_alphanumeric() || matches!(c, ',' | '=' | '/' | '.' | '-' | '_' | ':' | '|' | '^')
        })
        .collect()
}

/// Ethereum miners often prepend their wallet address to the worker name.
/// The address is 42 bytes starting with "0x"; drop it and the separating dot.
pub(crate) fn strip_eth_addr_from_full_name(full_name: &str) -> &str {
    match full_name.find('.') {
        Some(42) if full_name.starts_with("0x") || full_name.starts_with("0X") => &full_name[43..],
        _ => full_name,
    }
}

/// Render a worker name from the peer address using `{1}`..`{4}` placeholders
/// for the last four octets. IPv6 peers format the octets in hex.
pub(crate) fn ip_as_worker_name(format: &str, addr: &SocketAddr) -> String {
    let octets = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };

    if octets.len() < 4 {
        return addr.to_string();
    }

    let hex = addr.is_ipv6();
    let tail = &octets[octets.len() - 4..];

    let mut name = format.to_string();
    for (index, octet) in tail.iter().enumerate() {
        let rendered = if hex {
            format!("{octet:x}")
        } else {
            octet.to_string()
        };
        name = name.replace(&format!("{{{}}}", index + 1), &rendered);
    }
    name
}

/// Big-endian hex of a u32, zero padded: the session id form spliced into
/// subscribe responses and coinbases.
pub(crate) fn u32_to_hex(value: u32) -> String {
    format!("{value:08x}")
}

pub(crate) fn u64_to_hex(value: u64) -> String {
    format!("{value:016x}")
}

pub(crate) fn hex_remove_prefix(hex: &str) -> &str {
    hex.strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex)
}

pub(crate) fn hex_add_prefix(hex: &str) -> String {
    format!("0x{hex}")
}

pub(crate) fn hex_to_bin(hex: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(hex_remove_prefix(hex))?)
}

pub(crate) fn hex_to_u32(hex: &str) -> Result<u32> {
    Ok(u32::from_str_radix(hex_remove_prefix(hex), 16)?)
}

pub(crate) fn hex_to_u64(hex: &str) -> Result<u64> {
    Ok(u64::from_str_radix(hex_remove_prefix(hex), 16)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_name_filtering() {
        assert_eq!(filter_worker_name("sub.rig01"), "sub.rig01");
        assert_eq!(filter_worker_name("a b\tc\nd"), "abcd");
        assert_eq!(filter_worker_name("rig#1{}@!"), "rig1");
        assert_eq!(filter_worker_name("a,b=c/d.e-f_g:h|i^j"), "a,b=c/d.e-f_g:h|i^j");
        assert_eq!(filter_worker_name("矿工rig"), "rig");
    }

    #[test]
    fn eth_address_stripping() {
        assert_eq!(
            strip_eth_addr_from_full_name(
                "0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.rig01"
            ),
            "rig01"
        );

        assert_eq!(strip_eth_addr_from_full_name("sub.rig01"), "sub.rig01");

        // Dot in the wrong place leaves the name untouched.
        assert_eq!(
            strip_eth_addr_from_full_name("0x00d8c82Eb65124Ea3452CaC59B64aCC230AA348.rig"),
            "0x00d8c82Eb65124Ea3452CaC59B64aCC230AA348.rig"
        );
    }

    #[test]
    fn ip_worker_names() {
        let addr: SocketAddr = "10.0.1.23:3333".parse().unwrap();
        assert_eq!(
            ip_as_worker_name(DEFAULT_IP_WORKER_NAME_FORMAT, &addr),
            "10x0x1x23"
        );

        assert_eq!(ip_as_worker_name("rig-{4}", &addr), "rig-23");

        let v6: SocketAddr = "[::1]:3333".parse().unwrap();
        assert_eq!(ip_as_worker_name("{1}.{2}.{3}.{4}", &v6), "0.0.0.1");
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(u32_to_hex(0x0000abcd), "0000abcd");
        assert_eq!(u64_to_hex(0x1234), "0000000000001234");
        assert_eq!(hex_remove_prefix("0xabcd"), "abcd");
        assert_eq!(hex_remove_prefix("abcd"), "abcd");
        assert_eq!(hex_add_prefix("abcd"), "0xabcd");
        assert_eq!(hex_to_u32("0x1fffe000").unwrap(), 0x1fffe000);
        assert_eq!(hex_to_u64("ffffffffffffffff").unwrap(), u64::MAX);
        assert_eq!(hex_to_bin("0a0b").unwrap(), vec![0x0a, 0x0b]);
    }
}
