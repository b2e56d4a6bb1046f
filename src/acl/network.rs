use std::{fmt, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use thiserror::Error;

/// Reasons a `address/prefix` string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("can't parse network range `{0}` (expected address/prefix)")]
    MissingSeparator(String),
    #[error("can't parse IP address `{0}`")]
    InvalidAddress(String),
    #[error("can't parse prefix length `{0}`")]
    InvalidPrefix(String),
    #[error("prefix length {prefix} of `{input}` exceeds {max}")]
    PrefixTooLong { input: String, prefix: u32, max: u8 },
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// An IP network prefix. The stored address always has its host bits
/// cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkRange {
    net: IpNet,
}

impl NetworkRange {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, RangeError> {
        let net = IpNet::new(addr, prefix).map_err(|_| RangeError::PrefixTooLong {
            input: format!("{addr}/{prefix}"),
            prefix: prefix.into(),
            max: max_prefix_len(&addr),
        })?;
        Ok(Self { net: net.trunc() })
    }

    pub fn parse(value: &str) -> Result<Self, RangeError> {
        let (addr, prefix) = value
            .split_once('/')
            .ok_or_else(|| RangeError::MissingSeparator(value.to_owned()))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| RangeError::InvalidAddress(addr.to_owned()))?;

        // Only plain decimal digits, so "+8" and " 8" are refused.
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RangeError::InvalidPrefix(prefix.to_owned()));
        }
        let prefix_len: u32 = prefix
            .parse()
            .map_err(|_| RangeError::InvalidPrefix(prefix.to_owned()))?;

        let max = max_prefix_len(&addr);
        let too_long = || RangeError::PrefixTooLong {
            input: value.to_owned(),
            prefix: prefix_len,
            max,
        };
        let prefix_len = u8::try_from(prefix_len).map_err(|_| too_long())?;
        let net = IpNet::new(addr, prefix_len).map_err(|_| too_long())?;

        Ok(Self { net: net.trunc() })
    }

    pub fn base(&self) -> IpAddr {
        self.net.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Addresses of the other family never match; there is no implicit
    /// IPv4-mapped conversion.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }
}

impl FromStr for NetworkRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}
