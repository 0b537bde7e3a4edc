//! Bluetooth UUIDs.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID, identifying a Bluetooth service or characteristic.
///
/// # Construction
///
/// This type can be constructed from a compile-time string via the [`Uuid::from_static`] function.
/// A [`FromStr`] implementation for fallible parsing is also provided; it accepts the same inputs
/// as [`Uuid::normalize`].
///
/// [`Uuid`]s can also be constructed from a 16-bit or 32-bit "alias" assigned by the Bluetooth SIG
/// via the [`Uuid::from_u16`] and [`Uuid::from_u32`] functions.
///
/// The [`Display`][fmt::Display] form is the canonical lowercase 128-bit string used by BlueZ.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    const BASE: Self = Self::from_static("00000000-0000-1000-8000-00805f9b34fb");

    /// Parses a full 128-bit [`Uuid`] like `7c9ac820-0886-4e50-bcca-588b883f8649`.
    const fn parse_full(s: &str) -> Result<Self, ErrorKind> {
        // `const fn` is still frustratingly limited (eg. you can't even index a slice with a range)
        // so this is a bit of a macro-heavy abomination.

        const fn cvt_nibble(digit: u8) -> Result<u8, ErrorKind> {
            Ok(match digit {
                b'0'..=b'9' => digit - b'0',
                b'a'..=b'f' => digit - b'a' + 10,
                b'A'..=b'F' => digit - b'A' + 10,
                _ => return Err(ErrorKind::InvalidDigit),
            })
        }

        // const-compatible `try!` / `?` operator without conversion.
        macro_rules! please {
            ($e:expr) => {
                match $e {
                    Ok(val) => val,
                    Err(e) => return Err(e),
                }
            };
        }

        // Consumes 2 hex digits from the input.
        macro_rules! next_byte {
            ($in:ident, $i:ident) => {{
                if $i + 1 >= $in.len() {
                    return Err(ErrorKind::Eof);
                }
                let high = please!(cvt_nibble($in[$i]));
                let low = please!(cvt_nibble($in[$i + 1]));
                $i += 2;
                (high << 4) | low
            }};
        }

        // Consumes a `-` from the input string.
        macro_rules! dash {
            ($in:ident, $i:ident) => {{
                if $i >= $in.len() {
                    return Err(ErrorKind::Eof);
                }
                if $in[$i] != b'-' {
                    return Err(ErrorKind::InvalidDash);
                }
                $i += 1;
            }};
        }

        let bytes = s.as_bytes();
        let mut out = [0; 16];
        let mut i = 0;
        let mut o = 0;
        while o < 16 {
            // Dashes separate the 4-2-2-2-6 byte groups.
            if o == 4 || o == 6 || o == 8 || o == 10 {
                dash!(bytes, i);
            }
            out[o] = next_byte!(bytes, i);
            o += 1;
        }

        if i != bytes.len() {
            return Err(ErrorKind::TrailingData);
        }

        Ok(Self(out))
    }

    /// Creates a [`Uuid`] from a static 128-bit UUID string, potentially at compile time.
    ///
    /// Panics if the string is invalid.
    ///
    /// This is typically the behavior you want when defining `const` [`Uuid`]s.
    pub const fn from_static(s: &'static str) -> Self {
        match Self::parse_full(s) {
            Ok(uuid) => uuid,
            Err(_) => panic!("malformed UUID"),
        }
    }

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Creates a [`Uuid`] from a 32-bit alias.
    pub const fn from_u32(short: u32) -> Self {
        let [b0, b1, b2, b3] = short.to_be_bytes();
        let mut uuid = Self::BASE;
        uuid.0[0] = b0;
        uuid.0[1] = b1;
        uuid.0[2] = b2;
        uuid.0[3] = b3;
        uuid
    }

    /// Parses a 16-bit (4 hex digits), 32-bit (8 hex digits) or 128-bit (36 characters) UUID
    /// string.
    ///
    /// Short forms are expanded with the Bluetooth base UUID. Parsing is case-insensitive, and the
    /// resulting [`Uuid`] always formats as lowercase, so normalizing an already normalized string
    /// is a no-op.
    pub fn normalize(s: &str) -> Result<Self, ParseUuidError> {
        let err = |kind| ParseUuidError {
            input: s.to_string(),
            kind,
        };

        match s.len() {
            4 | 8 => {
                if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(err(ErrorKind::InvalidDigit));
                }
                u32::from_str_radix(s, 16)
                    .map(Self::from_u32)
                    .map_err(|_| err(ErrorKind::InvalidDigit))
            }
            36 => Self::parse_full(s).map_err(err),
            _ => Err(err(ErrorKind::Length)),
        }
    }
}

/// Normalizes a 16, 32 or 128-bit UUID string to its canonical lowercase 128-bit form.
pub fn normalize(s: &str) -> crate::Result<String> {
    Uuid::normalize(s)
        .map(|uuid| uuid.to_string())
        .map_err(crate::Error::from)
}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The error type returned when a UUID string can't be parsed.
#[derive(Debug)]
pub struct ParseUuidError {
    input: String,
    kind: ErrorKind,
}

#[derive(Debug)]
enum ErrorKind {
    Length,
    Eof,
    InvalidDigit,
    InvalidDash,
    TrailingData,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match &self.kind {
            ErrorKind::Length => "isn't a valid 16, 32 or 128 bit UUID",
            ErrorKind::Eof => "ends unexpectedly",
            ErrorKind::InvalidDigit => "contains an invalid hex digit",
            ErrorKind::InvalidDash => "is missing a `-` separator",
            ErrorKind::TrailingData => "has invalid trailing data",
        };
        write!(f, "'{}' {}", self.input, reason)
    }
}

impl std::error::Error for ParseUuidError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        assert_eq!(
            Uuid::BASE.to_string(),
            "00000000-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn short_forms() {
        assert_eq!(
            Uuid::normalize("2a19").unwrap().to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            Uuid::normalize("0000180F").unwrap(),
            Uuid::normalize("0000180f-0000-1000-8000-00805F9B34FB").unwrap()
        );
        assert_eq!(Uuid::normalize("180d").unwrap(), Uuid::from_u16(0x180D));
    }

    #[test]
    fn normalize_is_idempotent() {
        for s in ["2a19", "0000180f", "0000180f-0000-1000-8000-00805f9b34fb", "CAFE"] {
            let once = normalize(s).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
            assert_eq!(once, once.to_lowercase());
        }
    }

    #[test]
    fn invalid() {
        for s in ["", "2a1", "2a19f", "0000180f-0000", "+a19", "zzzz"] {
            let err = normalize(s).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Validation);
            assert!(err.to_string().contains(&format!("'{}'", s)));
        }
        Uuid::normalize("0000180f-0000-1000-8000_00805f9b34fb").unwrap_err();
    }
}
