use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// A size as written in a config file: either a raw byte count or a
/// human-readable string like "120M"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    /// Resolve to a strictly positive number of bytes
    pub fn to_bytes(&self) -> Result<u64> {
        let bytes = match self {
            SizeValue::Bytes(n) => *n,
            SizeValue::Text(s) => parse_size(s)?,
        };

        if bytes == 0 {
            return Err(DroverError::InvalidSize(self.to_string()));
        }

        Ok(bytes)
    }
}

impl std::fmt::Display for SizeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeValue::Bytes(n) => write!(f, "{}", n),
            SizeValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Parse a size string into bytes.
///
/// Accepts an integer followed by an optional unit: `B`, `K`/`KB`,
/// `M`/`MB`, `G`/`GB`. Units are case-insensitive and binary (1K = 1024).
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(DroverError::InvalidSize(input.to_string()));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| DroverError::InvalidSize(input.to_string()))?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => KB,
        "M" | "MB" => MB,
        "G" | "GB" => GB,
        _ => return Err(DroverError::InvalidSize(input.to_string())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| DroverError::InvalidSize(input.to_string()))
}
