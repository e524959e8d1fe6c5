use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use anyhow::Result;

pub fn parse_addr(address: &str, port: u16) -> Result<SocketAddr> {
    let addr = if address.is_empty() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::from_str(address)?
    };

    Ok(SocketAddr::from((addr, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_address() {
        let addr = parse_addr("127.0.0.1", 7000).unwrap();
        assert_eq!(addr.port(), 7000);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn empty_address_binds_unspecified() {
        let addr = parse_addr("", 7000).unwrap();
        assert!(addr.ip().is_unspecified());
    }
}
