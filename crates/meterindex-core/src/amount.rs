//! On-chain amounts.
//!
//! Every balance, transfer and fee is a `U256` count of base units, the same
//! width the chain uses. Only auction prices, which are ratios, are
//! `Decimal`.

use rust_decimal::Decimal;

pub use alloy_primitives::U256;

use crate::error::{DecodeError, IntegrityViolation};

/// Interpret big-endian bytes (an EVM word or an RLP integer) as an amount.
/// Leading zero bytes are ignored; more than 32 significant bytes overflow.
pub fn amount_from_be_bytes(bytes: &[u8], field: &'static str) -> Result<U256, DecodeError> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    U256::try_from_be_slice(&bytes[start..]).ok_or(DecodeError::Overflow { field })
}

/// Minimal big-endian bytes of `amount` (empty for zero).
pub fn amount_to_be_bytes(amount: U256) -> Vec<u8> {
    let bytes = amount.to_be_bytes::<32>();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// `a + b`, or an integrity error naming what was being summed.
pub fn checked_add(a: U256, b: U256, what: &str) -> Result<U256, IntegrityViolation> {
    a.checked_add(b).ok_or_else(|| IntegrityViolation::AmountOverflow {
        context: what.to_string(),
    })
}

/// Sum of `amounts`, failing on overflow.
pub fn checked_sum<I>(amounts: I, what: &str) -> Result<U256, IntegrityViolation>
where
    I: IntoIterator<Item = U256>,
{
    amounts
        .into_iter()
        .try_fold(U256::ZERO, |acc, x| checked_add(acc, x, what))
}

/// `amount` as a whole `Decimal`, if it fits the 96-bit mantissa.
pub fn to_decimal(amount: U256) -> Option<Decimal> {
    if amount.bit_len() > 96 {
        return None;
    }
    let value = u128::try_from(amount).ok()?;
    Decimal::try_from_i128_with_scale(value as i128, 0).ok()
}

/// `num / den` as a `Decimal`, `None` when `den` is zero.
///
/// Operands too wide for a `Decimal` are scaled down by the same power of
/// ten first, which only drops digits far below the quotient's precision.
pub fn ratio(mut num: U256, mut den: U256) -> Option<Decimal> {
    if den.is_zero() {
        return None;
    }
    let ten = U256::from(10u8);
    while num.bit_len() > 96 || den.bit_len() > 96 {
        num /= ten;
        den /= ten;
        if den.is_zero() {
            return None;
        }
    }
    to_decimal(num)?.checked_div(to_decimal(den)?)
}

/// `amount / price` in whole base units, rounded down. `None` for a
/// non-positive price or on overflow.
pub fn div_by_price(amount: U256, price: Decimal) -> Option<U256> {
    if price <= Decimal::ZERO {
        return None;
    }
    let mantissa = u128::try_from(price.mantissa()).ok()?;
    let scale = U256::from(10u8).checked_pow(U256::from(price.scale()))?;
    amount.checked_mul(scale)?.checked_div(U256::from(mantissa))
}

/// Serde adapter reading an amount from a decimal (or `0x` hex) string or a
/// JSON integer, and writing it as a decimal string.
pub mod decimal_string {
    use super::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(U256::from(n)),
            Raw::Text(s) => match s.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16),
                None => U256::from_str_radix(&s, 10),
            }
            .map_err(|e| de::Error::custom(format!("invalid amount '{s}': {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn amounts_from_evm_words() {
        let mut word = [0u8; 32];
        word[31] = 0x64;
        assert_eq!(amount_from_be_bytes(&word, "value").unwrap(), U256::from(100));
        assert_eq!(amount_from_be_bytes(&[], "value").unwrap(), U256::ZERO);

        let wei = 1_000_000_000_000_000_000u64.to_be_bytes();
        assert_eq!(
            amount_from_be_bytes(&wei, "value").unwrap(),
            U256::from(1_000_000_000_000_000_000u64)
        );
        assert_eq!(amount_to_be_bytes(U256::from(1_000_000_000_000_000_000u64)), wei.to_vec());
        assert!(amount_to_be_bytes(U256::ZERO).is_empty());
    }

    #[test]
    fn full_width_words_are_amounts() {
        let max = [0xffu8; 32];
        assert_eq!(amount_from_be_bytes(&max, "value").unwrap(), U256::MAX);

        let mut wide = vec![0u8; 33];
        wide[0] = 1;
        assert!(matches!(
            amount_from_be_bytes(&wide, "value"),
            Err(DecodeError::Overflow { field: "value" })
        ));
    }

    #[test]
    fn sums_fail_instead_of_wrapping() {
        let half = U256::from(1u8) << 255;
        assert!(checked_add(half, half - U256::from(1u8), "x").is_ok());
        assert!(matches!(
            checked_sum([half, half], "credits"),
            Err(IntegrityViolation::AmountOverflow { .. })
        ));
    }

    #[test]
    fn price_ratio_is_exact() {
        assert_eq!(ratio(U256::from(1500), U256::from(1000)), Some(dec("1.5")));
        assert_eq!(ratio(U256::from(1), U256::ZERO), None);

        // Wei-scale operands beyond 96 bits still give the plain ratio.
        let e18 = U256::from(10u8).pow(U256::from(18));
        let released = U256::from(1_000_000_000u64) * e18;
        let received = U256::from(1_500_000_000u64) * e18;
        assert_eq!(ratio(received, released), Some(dec("1.5")));
    }

    #[test]
    fn lots_divide_by_price() {
        assert_eq!(div_by_price(U256::from(1500), dec("1.5")), Some(U256::from(1000)));
        assert_eq!(div_by_price(U256::from(1000), dec("1.5")), Some(U256::from(666)));
        assert_eq!(div_by_price(U256::from(1), Decimal::ZERO), None);
    }

    #[test]
    fn decimal_strings_and_hex_parse() {
        #[derive(serde::Deserialize)]
        struct Row {
            #[serde(with = "decimal_string")]
            v: U256,
        }
        let row: Row = serde_json::from_str(r#"{"v":"100000000000000000000000000000"}"#).unwrap();
        assert_eq!(row.v, U256::from_str_radix("100000000000000000000000000000", 10).unwrap());
        let row: Row = serde_json::from_str(r#"{"v":"0x10"}"#).unwrap();
        assert_eq!(row.v, U256::from(16));
        let row: Row = serde_json::from_str(r#"{"v":7}"#).unwrap();
        assert_eq!(row.v, U256::from(7));
    }
}
