use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CidrError;

/// An IPv4 address block in CIDR notation. The stored address is always the
/// network address (host bits cleared).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::InvalidPrefix(prefix.to_string()));
        }
        let masked = u32::from(addr) & mask_of(prefix);
        Ok(Self {
            network: Ipv4Addr::from(masked),
            prefix,
        })
    }

    /// Builds a block from a numeric start address and a host-bit count.
    pub(crate) fn from_start(start: u32, host_bits: u8) -> Self {
        let prefix = 32 - host_bits;
        Self {
            network: Ipv4Addr::from(start & mask_of(prefix)),
            prefix,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of zero bits in the mask.
    pub fn host_bits(&self) -> u8 {
        32 - self.prefix
    }

    pub fn start(&self) -> u32 {
        u32::from(self.network)
    }

    /// Last address of the block (broadcast), inclusive.
    pub fn end(&self) -> u32 {
        self.start() | !mask_of(self.prefix)
    }

    pub fn size(&self) -> u64 {
        1u64 << self.host_bits()
    }

    /// Addresses left once the network and broadcast addresses are reserved.
    pub fn usable_hosts(&self) -> u64 {
        self.size().saturating_sub(2)
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        self.prefix <= other.prefix
            && self.start() <= other.start()
            && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.start() <= other.end() && other.start() <= self.end()
    }
}

fn mask_of(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| CidrError::InvalidAddress(addr.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| CidrError::InvalidPrefix(prefix.to_string()))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_masks_host_bits() {
        let c: Ipv4Cidr = "10.1.2.3/16".parse().unwrap();
        assert_eq!(c.to_string(), "10.1.0.0/16");
        assert_eq!(c.host_bits(), 16);
        assert_eq!(c.usable_hosts(), 65534);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "10.0.0.0".parse::<Ipv4Cidr>(),
            Err(CidrError::Malformed(_))
        ));
        assert!(matches!(
            "10.0.0.300/8".parse::<Ipv4Cidr>(),
            Err(CidrError::InvalidAddress(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Ipv4Cidr>(),
            Err(CidrError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn containment_and_overlap() {
        let big: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let small: Ipv4Cidr = "10.0.4.0/24".parse().unwrap();
        let other: Ipv4Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.overlaps(&small) && small.overlaps(&big));
        assert!(!big.overlaps(&other));
    }

    #[test]
    fn serde_uses_string_form() {
        let c: Ipv4Cidr = "192.168.0.0/25".parse().unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"192.168.0.0/25\"");
        let back: Ipv4Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
