use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use common::errors::*;

/// An IP network in address/prefix form. Containment masks both addresses
/// with the network prefix, operating on the address words in network
/// byte order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format_err!(
                "prefix length /{} out of range for {}",
                prefix,
                addr
            ));
        }
        Ok(Self { addr, prefix })
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                let network = u32::from_be_bytes(network.octets());
                let addr = u32::from_be_bytes(addr.octets());
                (network & mask) == (addr & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                let network = u128::from_be_bytes(network.octets());
                let addr = u128::from_be_bytes(addr.octets());
                (network & mask) == (addr & mask)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format_err!("missing '/' in CIDR '{}'", s))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format_err!("bad address in CIDR '{}'", s))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format_err!("bad prefix in CIDR '{}'", s))?;
        Cidr::new(addr, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_containment() {
        let cidr: Cidr = "192.168.0.0/16".parse().unwrap();
        assert!(cidr.contains(&"192.168.7.1".parse().unwrap()));
        assert!(cidr.contains(&"192.168.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"192.169.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let cidr: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(cidr.contains(&"255.255.255.255".parse().unwrap()));
    }

    #[test]
    fn host_prefix_matches_exactly() {
        let cidr: Cidr = "10.1.2.3/32".parse().unwrap();
        assert!(cidr.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains(&"10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn v6_containment() {
        let cidr: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(cidr.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!cidr.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn family_mismatch_never_contains() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn prefix_out_of_range_rejected() {
        assert!(Cidr::new("10.0.0.0".parse().unwrap(), 33).is_err());
        assert!(Cidr::new("::1".parse().unwrap(), 129).is_err());
        assert!(Cidr::new("::1".parse().unwrap(), 128).is_ok());
    }
}
