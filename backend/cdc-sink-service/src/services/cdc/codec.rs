//! Debezium logical type decoders
//!
//! `Decimal` columns arrive as base64 big-endian two's complement integers
//! with the scale carried in the schema, `Date` columns as a day count since
//! the epoch and timestamp strings in RFC 3339.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::error::DecodeError;

/// Widest unscaled value representable by `rust_decimal`
const MAX_UNSCALED_BYTES: usize = 16;

/// Decode a base64 two's complement integer plus scale into an exact decimal.
pub fn decode_decimal(encoded: &str, scale: u32) -> Result<Decimal, DecodeError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| DecodeError::InvalidDecimal(format!("bad base64 '{}': {}", encoded, e)))?;

    let unscaled = unscaled_from_be_bytes(&raw)?;

    Decimal::try_from_i128_with_scale(unscaled, scale)
        .map_err(|e| DecodeError::InvalidDecimal(format!("{} (scale {}): {}", unscaled, scale, e)))
}

/// Encode a decimal in the Debezium wire shape, rescaled to `scale`.
pub fn encode_decimal(value: Decimal, scale: u32) -> String {
    let mut rescaled = value;
    rescaled.rescale(scale);
    STANDARD.encode(unscaled_to_be_bytes(rescaled.mantissa()))
}

/// Interpret big-endian two's complement bytes as a signed integer.
///
/// When the high bit of the first byte is set the value is negative: the
/// magnitude is recovered by inverting every byte and adding one.
pub fn unscaled_from_be_bytes(raw: &[u8]) -> Result<i128, DecodeError> {
    if raw.is_empty() {
        return Ok(0);
    }

    // Leading sign-extension bytes do not change the value.
    let negative = raw[0] & 0x80 != 0;
    let pad = if negative { 0xFF } else { 0x00 };
    let significant = raw
        .iter()
        .position(|b| *b != pad)
        .map(|i| if i > 0 && (raw[i] & 0x80 != 0) != negative { i - 1 } else { i })
        .unwrap_or(raw.len() - 1);
    let raw = &raw[significant..];

    if raw.len() > MAX_UNSCALED_BYTES {
        return Err(DecodeError::InvalidDecimal(format!(
            "unscaled value needs {} bytes, at most {} supported",
            raw.len(),
            MAX_UNSCALED_BYTES
        )));
    }

    if !negative {
        return Ok(raw.iter().fold(0i128, |acc, b| (acc << 8) | *b as i128));
    }

    let magnitude = raw
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | (!*b) as u128)
        .wrapping_add(1);
    Ok((magnitude as i128).wrapping_neg())
}

/// Minimal big-endian two's complement encoding of a signed integer.
pub fn unscaled_to_be_bytes(value: i128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let negative = value < 0;
    let pad = if negative { 0xFF } else { 0x00 };

    let mut start = 0;
    while start < bytes.len() - 1
        && bytes[start] == pad
        && (bytes[start + 1] & 0x80 != 0) == negative
    {
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Debezium `io.debezium.time.Date`: signed days since 1970-01-01 UTC.
pub fn decode_date(days: i64) -> Result<NaiveDate, DecodeError> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| DecodeError::InvalidDate("epoch".to_string()))?;
    chrono::Duration::try_days(days)
        .and_then(|offset| epoch.checked_add_signed(offset))
        .ok_or_else(|| DecodeError::InvalidDate(format!("{} days is out of range", days)))
}

/// Days since 1970-01-01 for a calendar date.
pub fn days_since_epoch(date: NaiveDate) -> i64 {
    match NaiveDate::from_ymd_opt(1970, 1, 1) {
        Some(epoch) => date.signed_duration_since(epoch).num_days(),
        None => 0,
    }
}

/// Parse RFC 3339 with the same best-effort fallbacks the CDC consumers use.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    Err(DecodeError::InvalidTimestamp(format!(
        "Unsupported datetime format: {}",
        s
    )))
}
