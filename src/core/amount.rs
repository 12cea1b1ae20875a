//! Token amount conversion between human units and integer base units.
//!
//! All amounts inside the crate are `u128` base units (the smallest
//! indivisible unit of a token). Conversion only happens at the edges,
//! when an operator types "1.5" for a token with 9 decimals.

use crate::error::{Error, Result};

/// Largest decimals value supported; `10^38` still fits in a `u128`.
pub const MAX_DECIMALS: u8 = 38;

/// Parse a decimal string such as `"10000"` or `"1.25"` into base units.
///
/// # Errors
/// Returns `Error::Validation` when the string is not a plain non-negative
/// decimal number, carries more fractional digits than `decimals`, or
/// overflows `u128`.
pub fn parse_units(value: &str, decimals: u8) -> Result<u128> {
    if decimals > MAX_DECIMALS {
        return Err(Error::Validation(format!(
            "decimals {} exceeds maximum {}",
            decimals, MAX_DECIMALS
        )));
    }

    let value = value.trim();
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(Error::Validation(format!("invalid amount: {:?}", value)));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!("invalid amount: {:?}", value)));
    }
    if frac.len() > decimals as usize {
        return Err(Error::Validation(format!(
            "amount {} has more than {} fractional digits",
            value, decimals
        )));
    }

    let overflow = || Error::Validation(format!("amount {} overflows", value));
    let scale = 10u128.pow(decimals as u32);

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| overflow())?
    };
    let frac_units: u128 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = decimals as usize);
        padded.parse().map_err(|_| overflow())?
    };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Format base units as a decimal string, trimming trailing zeros.
pub fn format_units(amount: u128, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let decimals = decimals.min(MAX_DECIMALS);
    let scale = 10u128.pow(decimals as u32);
    let whole = amount / scale;
    let frac = amount % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
