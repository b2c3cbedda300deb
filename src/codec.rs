//! On-wire per-object byte layout (spec 4.2): plaintext header, then an
//! (optionally encrypted) body whose plaintext begins with a preamble.
//!
//! ```text
//! offset 0   version   (1 byte, currently 0x01)
//! offset 1   flags     (1 byte; bit 0 = IV included)
//! offset 2   iv_len    (1 byte, present iff flag set; must be 16)
//! offset 3   iv        (16 bytes, present iff flag set)
//! ```
//!
//! The preamble that opens the body is `len:u16-le` followed by an ASCII
//! `k=v,k=v,...,path=<path>` string, zero-padded so the AES block boundary
//! lands on a multiple of 16 bytes.

use std::collections::BTreeMap;

use crate::error::{CodecError, CodecResult};

/// Current header version.
pub const HEADER_VERSION: u8 = 0x01;
/// Bit 0 of the flags byte: an IV follows the flags/iv_len bytes.
pub const FLAG_IV_INCLUDED: u8 = 0x01;
/// AES block size; also the padding modulus for header and preamble.
pub const BLOCK_SIZE: usize = 16;

/// A parsed plaintext header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub version: u8,
    pub flags: u8,
    pub iv: Option<[u8; 16]>,
}

impl ObjectHeader {
    /// Build a header with no IV (unencrypted object).
    pub fn plain() -> Self {
        Self {
            version: HEADER_VERSION,
            flags: 0,
            iv: None,
        }
    }

    /// Build a header carrying the given 16-byte IV.
    pub fn with_iv(iv: [u8; 16]) -> Self {
        Self {
            version: HEADER_VERSION,
            flags: FLAG_IV_INCLUDED,
            iv: Some(iv),
        }
    }

    /// Whether this header declares an IV is present.
    pub fn has_iv(&self) -> bool {
        self.flags & FLAG_IV_INCLUDED != 0
    }

    /// Serialized byte length of this header (2, or 2+1+16 with an IV).
    pub fn encoded_len(&self) -> usize {
        if self.iv.is_some() {
            2 + 1 + 16
        } else {
            2
        }
    }

    /// Encode the header to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.version);
        out.push(self.flags);
        if let Some(iv) = &self.iv {
            out.push(iv.len() as u8);
            out.extend_from_slice(iv);
        }
        out
    }

    /// Parse a header from the front of `bytes`, returning the header and
    /// the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> CodecResult<(Self, usize)> {
        if bytes.len() < 2 {
            return Err(CodecError::HeaderTooShort(bytes.len()));
        }
        let version = bytes[0];
        if version != HEADER_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let flags = bytes[1];
        if flags & FLAG_IV_INCLUDED == 0 {
            return Ok((
                Self {
                    version,
                    flags,
                    iv: None,
                },
                2,
            ));
        }
        if bytes.len() < 3 {
            return Err(CodecError::TruncatedIv);
        }
        let iv_len = bytes[2];
        if iv_len != 16 {
            return Err(CodecError::InvalidIvLength(iv_len));
        }
        if bytes.len() < 3 + 16 {
            return Err(CodecError::TruncatedIv);
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&bytes[3..3 + 16]);
        Ok((
            Self {
                version,
                flags,
                iv: Some(iv),
            },
            3 + 16,
        ))
    }
}

/// Compression tag carried in the preamble's `z` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleCompression {
    None,
    Gzip,
}

impl PreambleCompression {
    fn as_str(self) -> &'static str {
        match self {
            PreambleCompression::None => "none",
            PreambleCompression::Gzip => "gzip",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "gzip" => PreambleCompression::Gzip,
            // absent or unrecognized both fold to None per spec 4.2.
            _ => PreambleCompression::None,
        }
    }
}

/// Fields carried in the body's leading preamble, in on-wire order. `path`
/// is always encoded last so that a literal `,` inside it cannot corrupt
/// the positional parse (spec 4.2, spec 9 Open Questions #2).
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    pub compression: PreambleCompression,
    pub digest_algorithm: String,
    pub digest_hex: String,
    pub size: u64,
    pub modified: f64,
    pub accessed: f64,
    pub path_without_root: String,
}

impl Preamble {
    /// Encode to the padded on-wire preamble buffer (`len` prefix + body +
    /// zero padding to a multiple of `BLOCK_SIZE`).
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        if self.digest_algorithm.contains(',') {
            return Err(CodecError::CommaInKey(self.digest_algorithm.clone()));
        }

        let mut body = format!(
            "v=1,z={},{}={},size={},modified={},accessed={},",
            self.compression.as_str(),
            self.digest_algorithm,
            self.digest_hex,
            self.size,
            format_float(self.modified),
            format_float(self.accessed),
        );
        body.push_str("path=");
        body.push_str(&self.path_without_root);

        let body_bytes = body.into_bytes();
        if body_bytes.len() > 0xFFFF {
            return Err(CodecError::PreambleTooLong);
        }

        let total_needed = 2 + body_bytes.len();
        let padded_total = ((total_needed + BLOCK_SIZE - 1) / BLOCK_SIZE) * BLOCK_SIZE;
        let mut out = vec![0u8; padded_total];
        out[0..2].copy_from_slice(&(body_bytes.len() as u16).to_le_bytes());
        out[2..2 + body_bytes.len()].copy_from_slice(&body_bytes);
        Ok(out)
    }

    /// Parse a preamble from the front of `bytes`, returning the preamble
    /// and the total padded length consumed.
    pub fn parse(bytes: &[u8]) -> CodecResult<(Self, usize)> {
        if bytes.len() < 2 {
            return Err(CodecError::TruncatedPreamble {
                declared: 0,
                available: bytes.len(),
            });
        }
        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let total_needed = 2 + declared;
        if bytes.len() < total_needed {
            return Err(CodecError::TruncatedPreamble {
                declared,
                available: bytes.len(),
            });
        }
        let padded_total = ((total_needed + BLOCK_SIZE - 1) / BLOCK_SIZE) * BLOCK_SIZE;

        let body_str = std::str::from_utf8(&bytes[2..2 + declared])
            .map_err(|_| CodecError::InvalidPreambleEncoding)?;

        // "path" is always last, so splitting N-1 times (N = number of
        // required keys) leaves any commas inside the path value intact.
        const NUM_FIELDS: usize = 7; // v, z, <digest>, size, modified, accessed, path
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (idx, part) in body_str.splitn(NUM_FIELDS, ',').enumerate() {
            let is_last = idx == NUM_FIELDS - 1;
            if let Some((k, v)) = part.split_once('=') {
                map.insert(k.to_string(), v.to_string());
            } else if is_last {
                // A bare trailing value with no '=' would be malformed; treat
                // the whole remainder as the path under key "path" to stay
                // lenient with embedded '=' signs in the value itself, which
                // split_once already handles via first-'=' semantics.
                map.insert("path".to_string(), part.to_string());
            }
        }

        let compression = map
            .get("z")
            .map(|s| PreambleCompression::parse(s))
            .unwrap_or(PreambleCompression::None);

        let path_without_root = map
            .get("path")
            .cloned()
            .ok_or(CodecError::MissingKey("path"))?;
        let size: u64 = map
            .get("size")
            .ok_or(CodecError::MissingKey("size"))?
            .parse()
            .map_err(|_| CodecError::MissingKey("size"))?;
        let modified: f64 = map
            .get("modified")
            .ok_or(CodecError::MissingKey("modified"))?
            .parse()
            .map_err(|_| CodecError::MissingKey("modified"))?;
        let accessed: f64 = map
            .get("accessed")
            .ok_or(CodecError::MissingKey("accessed"))?
            .parse()
            .map_err(|_| CodecError::MissingKey("accessed"))?;

        let (digest_algorithm, digest_hex) = map
            .iter()
            .find(|(k, _)| {
                !matches!(k.as_str(), "v" | "z" | "size" | "modified" | "accessed" | "path")
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or(CodecError::MissingKey("<digest-algo>"))?;

        Ok((
            Self {
                compression,
                digest_algorithm,
                digest_hex,
                size,
                modified,
                accessed,
                path_without_root,
            },
            padded_total,
        ))
    }
}

fn format_float(v: f64) -> String {
    // POSIX fractional seconds; trim to microsecond precision like the
    // reference implementation's stat_result timestamps.
    format!("{:.6}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_preamble() -> Preamble {
        Preamble {
            compression: PreambleCompression::Gzip,
            digest_algorithm: "sha256".to_string(),
            digest_hex: "ab".repeat(32),
            size: 12345,
            modified: 1_700_000_000.5,
            accessed: 1_700_000_001.25,
            path_without_root: "some/dir/file.txt".to_string(),
        }
    }

    #[test]
    fn header_round_trip_without_iv() {
        let header = ObjectHeader::plain();
        let encoded = header.encode();
        assert_eq!(encoded.len(), 2);
        let (parsed, consumed) = ObjectHeader::parse(&encoded).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_round_trip_with_iv() {
        let iv = [7u8; 16];
        let header = ObjectHeader::with_iv(iv);
        let encoded = header.encode();
        assert_eq!(encoded.len(), 2 + 17);
        let (parsed, consumed) = ObjectHeader::parse(&encoded).unwrap();
        assert_eq!(consumed, 19);
        assert_eq!(parsed, header);
        assert_eq!(parsed.iv, Some(iv));
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut bytes = ObjectHeader::plain().encode();
        bytes[0] = 0x02;
        assert!(matches!(
            ObjectHeader::parse(&bytes),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn preamble_round_trip_is_block_aligned() {
        let preamble = sample_preamble();
        let encoded = preamble.encode().unwrap();
        assert_eq!(encoded.len() % BLOCK_SIZE, 0);

        let (parsed, consumed) = Preamble::parse(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed.path_without_root, preamble.path_without_root);
        assert_eq!(parsed.size, preamble.size);
        assert_eq!(parsed.digest_hex, preamble.digest_hex);
        assert_eq!(parsed.digest_algorithm, preamble.digest_algorithm);
        assert_eq!(parsed.compression, preamble.compression);
        assert!((parsed.modified - preamble.modified).abs() < 1e-6);
        assert!((parsed.accessed - preamble.accessed).abs() < 1e-6);
    }

    #[test]
    fn preamble_tolerates_comma_in_path() {
        let mut preamble = sample_preamble();
        preamble.path_without_root = "weird,path/with,commas.txt".to_string();
        let encoded = preamble.encode().unwrap();
        let (parsed, _) = Preamble::parse(&encoded).unwrap();
        assert_eq!(parsed.path_without_root, preamble.path_without_root);
    }

    #[test]
    fn preamble_rejects_comma_in_digest_algorithm() {
        let mut preamble = sample_preamble();
        preamble.digest_algorithm = "sha,256".to_string();
        assert!(matches!(
            preamble.encode(),
            Err(CodecError::CommaInKey(_))
        ));
    }

    #[test]
    fn preamble_absent_z_defaults_to_none() {
        let mut preamble = sample_preamble();
        preamble.compression = PreambleCompression::None;
        let encoded = preamble.encode().unwrap();
        let (parsed, _) = Preamble::parse(&encoded).unwrap();
        assert_eq!(parsed.compression, PreambleCompression::None);
    }
}
