//! Rate limit descriptor and fingerprint generation.

use std::fmt;
use std::io;

use indexmap::IndexMap;
use md5::{Digest, Md5};
use serde::Serialize;

use crate::error::RateLimitError;

/// A fixed-size digest of a discriminator, used as the storage key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Compute the fingerprint of a discriminator string.
    pub fn of(discriminator: &str) -> Self {
        let digest = Md5::digest(discriminator.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hexadecimal representation.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// The request-scoped rate limit: how many hits are allowed per period, and
/// the ordered set of dimensions the counter is tracked by.
///
/// Vary dimensions are accumulated from several independent modifiers before
/// the fingerprint is taken. Insertion order is significant: the same pairs
/// added in a different order produce a different fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    limit: u64,
    period: u64,
    vary: IndexMap<String, String>,
}

impl RateLimit {
    /// Create a rate limit allowing `limit` hits every `period` seconds.
    pub fn new(limit: i64, period: i64) -> Result<Self, RateLimitError> {
        if limit < 0 || period < 0 {
            return Err(RateLimitError::InvalidRateLimit { limit, period });
        }

        Ok(Self {
            limit: limit as u64,
            period: period as u64,
            vary: IndexMap::new(),
        })
    }

    /// Maximum hits allowed in one window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in seconds.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// The vary dimensions, in insertion order.
    pub fn vary(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vary.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Add a vary dimension. Each key may be set once; on a duplicate the
    /// first value is kept and an error is returned.
    pub fn vary_on(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), RateLimitError> {
        let key = key.into();
        if self.vary.contains_key(&key) {
            return Err(RateLimitError::DuplicateVaryKey(key));
        }

        self.vary.insert(key, value.into());
        Ok(())
    }

    /// Canonical encoding of the vary set.
    ///
    /// The encoding is a JSON object in insertion order with `/` and
    /// non-ASCII characters escaped, so that it is byte-stable across
    /// processes and matches fingerprints produced by existing deployments.
    pub fn discriminator(&self) -> Result<String, RateLimitError> {
        if self.vary.is_empty() {
            return Err(RateLimitError::EmptyVary);
        }

        let mut buf = Vec::with_capacity(64);
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, EscapingFormatter);
        self.vary
            .serialize(&mut ser)
            .map_err(|e| RateLimitError::Encoding(e.to_string()))?;

        String::from_utf8(buf).map_err(|e| RateLimitError::Encoding(e.to_string()))
    }

    /// Fingerprint of the discriminator, used as the storage key.
    pub fn hash(&self) -> Result<Fingerprint, RateLimitError> {
        self.discriminator().map(|d| Fingerprint::of(&d))
    }
}

/// Compact JSON formatter escaping `/` as `\/` and non-ASCII characters as
/// `\uXXXX` UTF-16 code units.
struct EscapingFormatter;

impl serde_json::ser::Formatter for EscapingFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if ch != '/' && ch.is_ascii() {
                continue;
            }

            writer.write_all(fragment[start..i].as_bytes())?;
            if ch == '/' {
                writer.write_all(b"\\/")?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
            start = i + ch.len_utf8();
        }

        writer.write_all(fragment[start..].as_bytes())
    }
}
