//! Per-asset decimal precision and fixed-point scaling of raw amounts.
//!
//! Decoders never assume a precision. An asset without declared decimals is
//! kept in smallest units and the record is flagged `unknown_precision`.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::ScanError;

/// Largest scale `rust_decimal` can represent.
const MAX_SCALE: u32 = 28;

/// Declared precision of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Known(u32),
    Unknown,
}

/// A raw integer amount converted into native token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledAmount {
    pub value: Decimal,
    /// `false` if `value` is still in smallest units.
    pub precision_known: bool,
}

/// Asset → decimals table for one chain.
#[derive(Debug, Clone, Default)]
pub struct AssetPrecisions {
    by_asset: HashMap<String, u32>,
    native: Option<u32>,
}

impl AssetPrecisions {
    pub fn new(native: Option<u32>) -> Self {
        Self {
            by_asset: HashMap::new(),
            native,
        }
    }

    /// Declare the decimals of `asset` (case-insensitive).
    pub fn with_asset(mut self, asset: impl AsRef<str>, decimals: u32) -> Self {
        self.insert(asset, decimals);
        self
    }

    pub fn insert(&mut self, asset: impl AsRef<str>, decimals: u32) {
        self.by_asset
            .insert(asset.as_ref().to_ascii_lowercase(), decimals);
    }

    /// Resolve the precision of `asset`; the native-asset sentinels use the
    /// chain's native decimals.
    pub fn resolve(&self, asset: &str) -> Precision {
        let key = asset.to_ascii_lowercase();
        if let Some(d) = self.by_asset.get(&key) {
            return Precision::Known(*d);
        }
        if is_native_sentinel(&key) {
            if let Some(d) = self.native {
                return Precision::Known(d);
            }
        }
        Precision::Unknown
    }
}

/// `0x000…0` and `0xeee…e` are the usual stand-ins for the native coin.
pub fn is_native_sentinel(asset: &str) -> bool {
    let hex = asset.strip_prefix("0x").unwrap_or(asset);
    hex.len() == 40
        && (hex.bytes().all(|b| b == b'0') || hex.bytes().all(|b| b == b'e' || b == b'E'))
}

/// Scale a raw integer amount by `precision`.
///
/// Precisions beyond what `Decimal` can carry are treated as unknown;
/// amounts that overflow the 96-bit mantissa are a `MalformedRecord`.
pub fn scale_units(raw: u128, precision: Precision) -> Result<ScaledAmount, ScanError> {
    let mantissa = i128::try_from(raw)
        .map_err(|_| ScanError::MalformedRecord(format!("amount {raw} out of range")))?;
    let (scale, precision_known) = match precision {
        Precision::Known(d) if d <= MAX_SCALE => (d, true),
        _ => (0, false),
    };
    let value = Decimal::try_from_i128_with_scale(mantissa, scale)
        .map_err(|_| ScanError::MalformedRecord(format!("amount {raw} exceeds decimal range")))?;
    Ok(ScaledAmount {
        value,
        precision_known,
    })
}

/// Parse a decimal-digit string of smallest units, then scale it.
pub fn scale_digits(digits: &str, precision: Precision) -> Result<ScaledAmount, ScanError> {
    let raw: u128 = digits
        .trim()
        .parse()
        .map_err(|_| ScanError::MalformedRecord(format!("invalid amount '{digits}'")))?;
    scale_units(raw, precision)
}
