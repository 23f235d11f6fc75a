//! Stable 20-byte content identifiers.
//!
//! Every name the ingestion pipeline touches (metric names, instance names,
//! label names and values, sources) is interned under the SHA-1 of its raw
//! bytes, so any process computing an identifier for the same bytes arrives
//! at the same 20 octets. The canonical textual form is the 40-character
//! lowercase hex string, used wherever an identifier is embedded in a store
//! key name.

use sha1::{Digest, Sha1};

/// Width of a raw identifier, in octets.
pub const RAW_LEN: usize = 20;

/// Width of the canonical hex encoding.
pub const HEX_LEN: usize = 40;

/// A 20-byte content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; RAW_LEN]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("identifier must be {HEX_LEN} hex characters, got {0}")]
    Length(usize),
    #[error("identifier has a non-hex character at offset {0}")]
    Digit(usize),
}

impl Id {
    /// Identifier of a byte string: SHA-1 over the raw bytes.
    pub fn of(bytes: impl AsRef<[u8]>) -> Id {
        let mut sha = Sha1::new();
        sha.update(bytes.as_ref());
        Id(sha.finalize().into())
    }

    /// Identity of a single time series: one digest over the fixed-layout
    /// concatenation of the metric-name identifier, the instance-name
    /// identifier (absent for singular metrics, contributing no bytes),
    /// and the source identifier. Equal content yields an equal series.
    pub fn series(metric: Id, instance: Option<Id>, source: Id) -> Id {
        let mut sha = Sha1::new();
        sha.update(metric.0);
        if let Some(instance) = instance {
            sha.update(instance.0);
        }
        sha.update(source.0);
        Id(sha.finalize().into())
    }

    pub const fn from_raw(raw: [u8; RAW_LEN]) -> Id {
        Id(raw)
    }

    pub fn as_bytes(&self) -> &[u8; RAW_LEN] {
        &self.0
    }

    /// Write the canonical hex form into a caller-provided buffer.
    /// No allocation; one table lookup per output byte.
    pub fn write_hex(&self, out: &mut [u8; HEX_LEN]) {
        // The output buffer is exactly twice the input width.
        hex::encode_to_slice(self.0, out).expect("output buffer is 2x the identifier width");
    }

    /// The canonical hex form, on the stack.
    pub fn hex(&self) -> Hex {
        let mut buf = [0u8; HEX_LEN];
        self.write_hex(&mut buf);
        Hex(buf)
    }

    /// Parse the canonical 40-character hex form.
    pub fn parse_hex(text: &str) -> Result<Id, ParseError> {
        if text.len() != HEX_LEN {
            return Err(ParseError::Length(text.len()));
        }
        let mut raw = [0u8; RAW_LEN];
        hex::decode_to_slice(text, &mut raw).map_err(|err| match err {
            hex::FromHexError::InvalidHexCharacter { index, .. } => ParseError::Digit(index),
            _ => ParseError::Length(text.len()),
        })?;
        Ok(Id(raw))
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.hex())
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hex().as_str())
    }
}

/// A stack-allocated 40-character hex rendering of an [`Id`].
#[derive(Clone, Copy)]
pub struct Hex([u8; HEX_LEN]);

impl Hex {
    pub fn as_str(&self) -> &str {
        // Only ASCII hex digits are ever written into the buffer.
        std::str::from_utf8(&self.0).expect("hex digits are ASCII")
    }
}

impl std::ops::Deref for Hex {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_is_stable_and_forty_chars() {
        for text in ["", "a", "kernel.all.load", "host=a", "\u{1f980} unicode"] {
            let id = Id::of(text);
            assert_eq!(id.hex().len(), HEX_LEN);
            assert_eq!(id, Id::of(text.to_owned()));
            assert_eq!(id.hex().as_str(), Id::of(text).hex().as_str());
        }
    }

    #[test]
    fn test_known_digest() {
        // The classic FIPS 180-1 vector.
        assert_eq!(
            Id::of("abc").hex().as_str(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_series_layout() {
        let metric = Id::of("kernel.all.load");
        let inst = Id::of("cpu0");
        let source = Id::of("host=a");

        let mut cat = Vec::new();
        cat.extend_from_slice(metric.as_bytes());
        cat.extend_from_slice(source.as_bytes());
        assert_eq!(Id::series(metric, None, source), Id::of(&cat));

        let mut cat = Vec::new();
        cat.extend_from_slice(metric.as_bytes());
        cat.extend_from_slice(inst.as_bytes());
        cat.extend_from_slice(source.as_bytes());
        assert_eq!(Id::series(metric, Some(inst), source), Id::of(&cat));

        // Distinct instances yield distinct series.
        assert_ne!(
            Id::series(metric, Some(inst), source),
            Id::series(metric, Some(Id::of("cpu1")), source),
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let id = Id::of("disk.dev.read");
        assert_eq!(Id::parse_hex(id.hex().as_str()), Ok(id));

        assert_eq!(Id::parse_hex("abc"), Err(ParseError::Length(3)));
        let mut bad = id.hex().as_str().to_owned();
        bad.replace_range(6..7, "x");
        assert_eq!(Id::parse_hex(&bad), Err(ParseError::Digit(6)));
    }

    #[test]
    fn test_write_hex_matches_display() {
        let id = Id::of("mem.util.free");
        let mut buf = [0u8; HEX_LEN];
        id.write_hex(&mut buf);
        assert_eq!(std::str::from_utf8(&buf).unwrap(), id.to_string());
    }
}
