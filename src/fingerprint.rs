//! Content-addressed identity of processed records.
//!
//! A [`Fingerprint`] is the SHA-256 digest of a canonical byte encoding of
//! `(station id, incident id, pipeline)`. The pipeline contributes every label's name,
//! type and hyperparameters in order, so two pipelines differ in identity whenever
//! they differ in content or ordering.
//!
//! # Canonical encoding
//!
//! ```text
//! "tsprocess/fingerprint/v1"
//! str(station_id) str(incident_id) u64(label count)
//! for each label: str(name) str(type) u64(param count) { str(key) f64(value) }*
//! ```
//!
//! Strings are length-prefixed UTF-8, integers are little-endian `u64`, and floats are
//! the little-endian bits of the value after normalisation (`-0.0` becomes `0.0`, every
//! NaN becomes the canonical NaN). Integer-valued and float-valued hyperparameters are
//! both `f64`, so `40` and `40.0` hash identically.

use crate::processing::labels::ProcessingLabel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const DOMAIN_TAG: &[u8] = b"tsprocess/fingerprint/v1";

/// Fixed-width (256-bit) cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hexadecimal form, used as the durable key.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Error returned when parsing a malformed hexadecimal fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFingerprintError(String);

impl fmt::Display for ParseFingerprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fingerprint '{}'", self.0)
    }
}

impl std::error::Error for ParseFingerprintError {}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseFingerprintError(s.to_string());
        if s.len() != 64 || !s.is_ascii() {
            return Err(err());
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| err())?;
        }
        Ok(Fingerprint(bytes))
    }
}

/// Compute the fingerprint of a station's signal under an incident and pipeline.
///
/// Pure: equal logical inputs always produce the same fingerprint.
pub fn fingerprint(station_id: &str, incident_id: &str, pipeline: &[ProcessingLabel]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    write_str(&mut hasher, station_id);
    write_str(&mut hasher, incident_id);
    write_len(&mut hasher, pipeline.len());

    for label in pipeline {
        write_str(&mut hasher, &label.name);
        write_str(&mut hasher, label.label_type.as_str());
        write_len(&mut hasher, label.hyperparameters.len());
        for (key, value) in &label.hyperparameters {
            write_str(&mut hasher, key);
            hasher.update(normalize(*value).to_bits().to_le_bytes());
        }
    }

    Fingerprint(hasher.finalize().into())
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_str(hasher: &mut Sha256, s: &str) {
    write_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn normalize(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else if value.is_nan() {
        f64::NAN
    } else {
        value
    }
}
