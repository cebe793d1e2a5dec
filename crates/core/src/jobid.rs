//! 64-bit job ids and their textual encodings.
//!
//! Three forms round-trip through [`JobId::parse`]:
//! - decimal: `1234`
//! - dot-hex: `0000.0004.b200.0000` (the KVS directory bucketing form)
//! - f58: `f3Qp6` (compact base58 with an `f` prefix, used in logs)

use serde::{Deserialize, Serialize};

use crate::errno::Error;

const B58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Dot-hex form: four 16-bit groups, high to low.
    pub fn encode_dothex(self) -> String {
        let v = self.0;
        format!(
            "{:04x}.{:04x}.{:04x}.{:04x}",
            v >> 48 & 0xffff,
            v >> 32 & 0xffff,
            v >> 16 & 0xffff,
            v & 0xffff
        )
    }

    /// Compact base58 form with an `f` prefix.
    pub fn encode_f58(self) -> String {
        let mut digits = Vec::new();
        let mut v = self.0;
        loop {
            digits.push(B58_ALPHABET[(v % 58) as usize]);
            v /= 58;
            if v == 0 {
                break;
            }
        }
        let mut out = String::from("f");
        while let Some(d) = digits.pop() {
            out.push(d as char);
        }
        out
    }

    fn decode_dothex(s: &str) -> Result<JobId, Error> {
        let mut v: u64 = 0;
        let mut parts = 0;
        for part in s.split('.') {
            if part.is_empty() || part.len() > 4 || parts == 4 {
                return Err(Error::invalid(format!("malformed dot-hex job id '{s}'")));
            }
            let n = u64::from_str_radix(part, 16)
                .map_err(|_| Error::invalid(format!("malformed dot-hex job id '{s}'")))?;
            v = v << 16 | n;
            parts += 1;
        }
        if parts != 4 {
            return Err(Error::invalid(format!("malformed dot-hex job id '{s}'")));
        }
        Ok(JobId(v))
    }

    fn decode_f58(s: &str) -> Result<JobId, Error> {
        let digits = s
            .strip_prefix('f')
            .ok_or_else(|| Error::invalid(format!("malformed f58 job id '{s}'")))?;
        if digits.is_empty() {
            return Err(Error::invalid(format!("malformed f58 job id '{s}'")));
        }
        let mut v: u64 = 0;
        for c in digits.bytes() {
            let d = B58_ALPHABET
                .iter()
                .position(|&a| a == c)
                .ok_or_else(|| Error::invalid(format!("malformed f58 job id '{s}'")))?;
            v = v
                .checked_mul(58)
                .and_then(|v| v.checked_add(d as u64))
                .ok_or_else(|| Error::invalid(format!("f58 job id '{s}' out of range")))?;
        }
        Ok(JobId(v))
    }

    /// Parse any of the three encodings.
    pub fn parse(s: &str) -> Result<JobId, Error> {
        if s.contains('.') {
            JobId::decode_dothex(s)
        } else if s.starts_with('f') {
            JobId::decode_f58(s)
        } else {
            s.parse::<u64>()
                .map(JobId)
                .map_err(|_| Error::invalid(format!("malformed job id '{s}'")))
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(v: u64) -> Self {
        JobId(v)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::parse(s)
    }
}
