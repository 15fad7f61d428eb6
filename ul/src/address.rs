//! Data types for addresses of nodes in DICOM networks.
//!
//! An application entity is reached through a socket address
//! plus an AE title,
//! written down with the syntax `«ae_title»@«network_address»:«port»`.
//! [`AeAddr`] accepts addresses in which the AE title part is missing,
//! whereas [`FullAeAddr`] requires it.
use std::{
    convert::TryFrom,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ensure, AsErrorSource, ResultExt, Snafu};

/// An error which occurred when parsing an AE address.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError<E>
where
    E: std::fmt::Debug + AsErrorSource,
{
    /// Missing `@` in full AE address
    MissingPart,

    /// Could not parse network socket address
    ParseSocketAddress { source: E },
}

/// A full address to a target application entity:
/// an AE title plus a network address,
/// typically a socket address.
///
/// # Example
///
/// ```
/// # use radlink_ul::FullAeAddr;
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr<SocketAddr> = "PACS-QR@10.0.0.34:11112".parse()?;
/// assert_eq!(addr.ae_title(), "PACS-QR");
/// assert_eq!(addr.socket_addr(), &SocketAddr::from(([10, 0, 0, 34], 11112)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FullAeAddr<T> {
    ae_title: String,
    address: T,
}

impl<T> FullAeAddr<T> {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            address: socket_addr,
        }
    }

    /// Retrieve the application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Retrieve the network address portion.
    pub fn socket_addr(&self) -> &T {
        &self.address
    }

    /// Convert the full address into its constituent parts.
    pub fn into_parts(self) -> (String, T) {
        (self.ae_title, self.address)
    }
}

impl<T> From<(String, T)> for FullAeAddr<T> {
    fn from((ae_title, socket_addr): (String, T)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

impl<T> FromStr for FullAeAddr<T>
where
    T: FromStr,
    T::Err: std::fmt::Debug + AsErrorSource,
{
    type Err = ParseAeAddressError<<T as FromStr>::Err>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        ensure!(!ae_title.is_empty(), MissingPartSnafu);
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            address: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl<T> ToSocketAddrs for FullAeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.address.to_socket_addrs()
    }
}

impl<T> std::fmt::Display for FullAeAddr<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ae_title, self.address)
    }
}

/// An address to a target application entity
/// in which the AE title may be absent.
///
/// # Example
///
/// ```
/// # use radlink_ul::AeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr<String> = "pacs.hospital.example.com:104".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// let full = addr.with_default_ae_title("ANY-SCP");
/// assert_eq!(full.ae_title(), "ANY-SCP");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AeAddr<T> {
    ae_title: Option<String>,
    address: T,
}

impl<T> AeAddr<T> {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: T) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            address: socket_addr,
        }
    }

    /// Create an address with no AE title.
    pub fn new_socket_addr(socket_addr: T) -> Self {
        AeAddr {
            ae_title: None,
            address: socket_addr,
        }
    }

    /// Retrieve the application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// Retrieve the network address portion.
    pub fn socket_addr(&self) -> &T {
        &self.address
    }

    /// Upgrade to a full address,
    /// replacing any AE title already present.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr<T> {
        FullAeAddr {
            ae_title: ae_title.into(),
            address: self.address,
        }
    }

    /// Upgrade to a full address,
    /// using the given AE title only if one is missing.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr<T> {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            address: self.address,
        }
    }
}

impl From<SocketAddr> for AeAddr<SocketAddr> {
    fn from(address: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            address,
        }
    }
}

impl<T> From<FullAeAddr<T>> for AeAddr<T> {
    fn from(full: FullAeAddr<T>) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            address: full.address,
        }
    }
}

impl<T> FromStr for AeAddr<T>
where
    T: FromStr,
{
    type Err = <T as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((ae_title, address)) => Ok(AeAddr {
                ae_title: Some(ae_title)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string()),
                address: address.parse()?,
            }),
            None => Ok(AeAddr {
                ae_title: None,
                address: s.parse()?,
            }),
        }
    }
}

impl<'a> TryFrom<&'a str> for AeAddr<String> {
    type Error = <AeAddr<String> as FromStr>::Err;

    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl<T> ToSocketAddrs for AeAddr<T>
where
    T: ToSocketAddrs,
{
    type Iter = T::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.address.to_socket_addrs()
    }
}

impl<T> std::fmt::Display for AeAddr<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        std::fmt::Display::fmt(&self.address, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ae_addr_parse() {
        let addr: FullAeAddr<String> = "STORE-SCP@127.0.0.1:104".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.socket_addr(), "127.0.0.1:104");
        assert_eq!(&addr.to_string(), "STORE-SCP@127.0.0.1:104");

        let addr: FullAeAddr<SocketAddr> = "STORE_SCP@127.0.0.1:104".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE_SCP");
        assert_eq!(addr.socket_addr(), &SocketAddr::from(([127, 0, 0, 1], 104)));
    }

    #[test]
    fn full_ae_addr_requires_title() {
        let res = FullAeAddr::<String>::from_str("pacs.hospital.example.com:104");
        assert!(matches!(res, Err(ParseAeAddressError::MissingPart)));
        let res = FullAeAddr::<String>::from_str("@pacs.hospital.example.com:104");
        assert!(matches!(res, Err(ParseAeAddressError::MissingPart)));
    }

    #[test]
    fn ae_addr_title_is_optional() {
        let addr: AeAddr<String> = "pacs.hospital.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.socket_addr(), "pacs.hospital.example.com:104");

        let addr: AeAddr<String> = "QR-SCP@pacs.hospital.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("QR-SCP"));
        let full = addr.with_default_ae_title("ANY-SCP");
        assert_eq!(full.ae_title(), "QR-SCP");
    }
}
