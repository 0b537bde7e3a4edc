//! Bluetooth device addresses and address-based device filters.

use core::fmt;
use std::{fmt::Write, str::FromStr};

/// Describes the meaning of the bytes in an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressType {
    /// Address follows the MAC address standard.
    ///
    /// The first 3 Bytes identify the vendor, the last 3 Bytes identify the device.
    Public,
    /// Address is randomly generated.
    ///
    /// These addresses can either be "Static Random" addresses, or they can be resolvable or
    /// non-resolvable "Private Random" addresses for use with BLE Privacy.
    Random,
}

impl AddressType {
    pub(crate) fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "random" => Ok(Self::Random),
            _ => Err(crate::Error::from(format!("invalid address type '{}'", s))),
        }
    }
}

/// A 6-Byte Bluetooth device address.
///
/// Parsing is case-insensitive, so two [`Address`]es compare equal regardless of how the daemon or
/// the user spelled them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 6]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Parses a Bluetooth [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        let mut parts = s.split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(|| ParseAddressError::new(s))?;
            // `from_str_radix` alone would also take a sign, eg. `+a`.
            *byte = match u8::from_str_radix(part, 16) {
                Ok(b) if part.len() == 2 && part.bytes().all(|b| b.is_ascii_hexdigit()) => b,
                _ => return Err(ParseAddressError::new(s)),
            };
        }

        if parts.next().is_some() {
            return Err(ParseAddressError::new(s));
        }
        Ok(Address(bytes))
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub struct ParseAddressError {
    input: String,
}

impl ParseAddressError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device address '{}'", self.input)
    }
}

impl std::error::Error for ParseAddressError {}

/// Selects a device either by hardware [`Address`] or by a part of its display name.
///
/// Use [`Adapter::find_device`][crate::Adapter::find_device] to apply a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Matches the device with exactly this address.
    Address(Address),
    /// Matches devices whose alias contains this string, ignoring case.
    NameSubstring(String),
}

impl DeviceFilter {
    /// Interprets `filter` as an [`Address`] if it is one, and as a name substring otherwise.
    pub fn parse(filter: &str) -> Self {
        match filter.parse() {
            Ok(address) => Self::Address(address),
            Err(_) => Self::NameSubstring(filter.to_string()),
        }
    }

    /// Returns whether a device with the given address and alias is selected by this filter.
    pub fn matches(&self, address: &Address, alias: &str) -> bool {
        match self {
            Self::Address(a) => a == address,
            Self::NameSubstring(s) => alias.to_lowercase().contains(&s.to_lowercase()),
        }
    }
}
