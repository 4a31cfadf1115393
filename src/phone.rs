//! # Phone Number Normalization
//!
//! Canonicalizes phone numbers to international format so that lookups and
//! stored values share one representation. The default region applies to
//! numbers written without a country prefix.

use phonenumber::{country, Mode};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid phone number {raw:?}: {reason}")]
pub struct PhoneError {
    pub raw: String,
    pub reason: String,
}

/// Normalizes phone numbers relative to a default region.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    region: country::Id,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            region: country::AT,
        }
    }
}

impl Normalizer {
    /// Create a normalizer for the given ISO 3166-1 alpha-2 region code.
    /// Unknown codes fall back to the default region.
    pub fn new(region: &str) -> Self {
        match region.parse::<country::Id>() {
            Ok(region) => Self { region },
            Err(_) => {
                tracing::warn!(region, "unknown phone region, falling back to default");
                Self::default()
            }
        }
    }

    /// Parse and format strictly. Used where an unparseable number is an
    /// input error (e.g. attribute-level phone additions).
    pub fn parse(&self, raw: &str) -> Result<String, PhoneError> {
        match phonenumber::parse(Some(self.region), raw) {
            Ok(number) => Ok(number.format().mode(Mode::International).to_string()),
            Err(err) => Err(PhoneError {
                raw: raw.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Best-effort normalization. Unparseable input is returned verbatim with
    /// a warning so imports and lookups degrade instead of failing.
    pub fn normalize(&self, raw: &str) -> String {
        match self.parse(raw) {
            Ok(formatted) => formatted,
            Err(err) => {
                tracing::warn!(error = %err, "failed to normalize phone number, keeping raw value");
                raw.to_string()
            }
        }
    }
}
