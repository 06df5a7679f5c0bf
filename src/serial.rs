//! Certificate serial numbers
//!
//! Serials are random 128-bit positive integers drawn from the openssl CSPRNG.
//! They are stored as 32 lowercase hex digits so that lexical order in the
//! database equals numeric order.

use openssl::asn1::{Asn1Integer, Asn1IntegerRef};
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of the fixed hex form used for storage.
pub const SERIAL_HEX_WIDTH: usize = 32;

/// A certificate serial number issued by this authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SerialNumber(u128);

impl SerialNumber {
    /// Draw a fresh random 128-bit candidate.
    ///
    /// Zero is never returned; RFC 5280 requires a positive serial.
    pub fn random() -> Result<Self, ErrorStack> {
        loop {
            let mut bytes = [0u8; 16];
            openssl::rand::rand_bytes(&mut bytes)?;
            let value = u128::from_be_bytes(bytes);
            if value != 0 {
                return Ok(SerialNumber(value));
            }
        }
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    /// Big-endian bytes with leading zero bytes stripped.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let bytes = self.0.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
        bytes[first..].to_vec()
    }

    /// Parse an unsigned big-endian integer of at most 16 significant bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let significant: &[u8] = match bytes.iter().position(|b| *b != 0) {
            Some(first) => &bytes[first..],
            None => &[],
        };
        if significant.len() > 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf[16 - significant.len()..].copy_from_slice(significant);
        Some(SerialNumber(u128::from_be_bytes(buf)))
    }

    /// Fixed-width lowercase hex form used as the storage key.
    pub fn to_hex(&self) -> String {
        format!("{:0width$x}", self.0, width = SERIAL_HEX_WIDTH)
    }

    pub fn to_asn1_integer(&self) -> Result<Asn1Integer, ErrorStack> {
        BigNum::from_slice(&self.to_be_bytes())?.to_asn1_integer()
    }

    /// Read the serial of a parsed certificate or CRL entry.
    pub fn from_asn1_integer(serial: &Asn1IntegerRef) -> Option<Self> {
        let bn = serial.to_bn().ok()?;
        if bn.is_negative() {
            return None;
        }
        Self::from_be_slice(&bn.to_vec())
    }
}

impl From<u128> for SerialNumber {
    fn from(value: u128) -> Self {
        SerialNumber(value)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid serial number: {0}")]
pub struct ParseSerialError(String);

impl FromStr for SerialNumber {
    type Err = ParseSerialError;

    /// Accepts hex with an optional `0x` prefix and optional `:` separators,
    /// the form `openssl x509 -serial` prints.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits: String = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| *c != ':')
            .collect();
        if digits.is_empty() {
            return Err(ParseSerialError(s.to_string()));
        }
        let significant = digits.trim_start_matches('0');
        if significant.len() > SERIAL_HEX_WIDTH {
            return Err(ParseSerialError(s.to_string()));
        }
        if significant.is_empty() {
            return Ok(SerialNumber(0));
        }
        u128::from_str_radix(significant, 16)
            .map(SerialNumber)
            .map_err(|_| ParseSerialError(s.to_string()))
    }
}

impl From<SerialNumber> for String {
    fn from(serial: SerialNumber) -> Self {
        serial.to_hex()
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = ParseSerialError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
