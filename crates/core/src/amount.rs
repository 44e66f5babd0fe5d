//! Token amounts.
//!
//! Amounts are arbitrary-precision integers in token base units (18 decimals).
//! They are serialized as decimal strings so records stay readable and never
//! lose precision through JSON numbers.

use num_bigint::BigUint;

/// Decimals used by reward tokens.
pub const TOKEN_DECIMALS: u32 = 18;

/// `10^decimals` as a big integer.
pub fn ten_pow(decimals: u32) -> BigUint {
    BigUint::from(10u32).pow(decimals)
}

/// Convert a decimal token amount into base units without going through
/// float multiplication: the shortest decimal rendering of `value` is scaled
/// digit by digit. Returns `None` for negative, non-finite values or values
/// with more fractional digits than `decimals`.
pub fn to_base_units(value: f64, decimals: u32) -> Option<BigUint> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let rendered = format!("{value}");
    let (whole, fraction) = match rendered.split_once('.') {
        Some((w, f)) => (w, f.trim_end_matches('0')),
        None => (rendered.as_str(), ""),
    };
    if fraction.len() > decimals as usize {
        return None;
    }
    let mut digits = String::with_capacity(whole.len() + decimals as usize);
    digits.push_str(whole);
    digits.push_str(fraction);
    digits.extend(std::iter::repeat('0').take(decimals as usize - fraction.len()));
    BigUint::parse_bytes(digits.as_bytes(), 10)
}

/// Serde adapter for a single `BigUint` as a decimal string.
pub mod decimal {
    use num_bigint::BigUint;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BigUint::parse_bytes(raw.as_bytes(), 10)
            .ok_or_else(|| D::Error::custom(format!("invalid decimal amount: {raw}")))
    }
}

/// Serde adapter for `BTreeMap<String, BigUint>` with decimal string values.
pub mod decimal_map {
    use std::collections::BTreeMap;

    use num_bigint::BigUint;
    use serde::{de::Error, ser::SerializeMap, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<String, BigUint>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (k, v) in value {
            map.serialize_entry(k, &v.to_str_radix(10))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, BigUint>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                BigUint::parse_bytes(v.as_bytes(), 10)
                    .map(|amount| (k, amount))
                    .ok_or_else(|| D::Error::custom(format!("invalid decimal amount: {v}")))
            })
            .collect()
    }
}
