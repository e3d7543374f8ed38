//! Host string storage
//!
//! Engine strings are sequences of UTF-16 code units and may contain unpaired
//! surrogates. `HostString` keeps the code units exactly as the engine produced
//! them so a round trip through the host never rewrites a string. Conversion
//! to UCS-4 is a separate, explicit step (`as_ucs4`).

use crate::error::{HostError, HostResult};
use crate::value::{HostValue, Payload};

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct HostString {
    units: Vec<u16>,
}

impl HostString {
    pub fn from_utf16(units: Vec<u16>) -> Self {
        Self { units }
    }

    pub fn as_utf16(&self) -> &[u16] {
        &self.units
    }

    /// Length in UTF-16 code units, matching the engine's `length`.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Decode to a Rust string, replacing unpaired surrogates with U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }

    /// Decode to a Rust string, failing on unpaired surrogates.
    pub fn to_rust_string(&self) -> HostResult<String> {
        String::from_utf16(&self.units)
            .map_err(|_| HostError::marshal("string", "contains an unpaired surrogate"))
    }

    /// Widen to UCS-4.
    ///
    /// Surrogate pairs combine into one code point. Unpaired surrogates are
    /// kept as their own code unit value, so the result is not always valid
    /// Unicode but never loses information.
    pub fn as_ucs4(&self) -> Vec<u32> {
        char::decode_utf16(self.units.iter().copied())
            .map(|decoded| match decoded {
                Ok(c) => c as u32,
                Err(lone) => lone.unpaired_surrogate() as u32,
            })
            .collect()
    }
}

impl From<&str> for HostString {
    fn from(s: &str) -> Self {
        Self {
            units: s.encode_utf16().collect(),
        }
    }
}

impl From<String> for HostString {
    fn from(s: String) -> Self {
        HostString::from(s.as_str())
    }
}

impl std::fmt::Debug for HostString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl std::fmt::Display for HostString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// UCS-4 view of a host string value. Any other payload is a type error.
pub fn as_ucs4(value: &HostValue) -> HostResult<Vec<u32>> {
    match value.payload() {
        Payload::Str(s) => Ok(s.as_ucs4()),
        _ => Err(HostError::Type(format!(
            "as_ucs4 expects a string, got {}",
            value.type_name()
        ))),
    }
}
