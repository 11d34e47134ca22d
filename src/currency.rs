//! Conversion between decimal amount strings and on-chain integer amounts.
//!
//! Each currency symbol has a fixed exponent; `ETH` uses 18 decimal places.
//! Amounts on the API surface are decimal strings, amounts inside channel
//! states are [U256] base units. Formatting produces the canonical form
//! (no sign, no trailing fractional zeros, no bare `.`), and
//! `format(parse(s)) == s` holds for every canonical `s`.

use thiserror::Error;

use crate::codec::types::U256;

/// The only built-in currency. ERC-20 currencies are registered at runtime
/// with the exponent read from the token contract.
pub const ETH: &str = "ETH";

const ETH_DECIMALS: u8 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("negative amounts are not allowed: {0}")]
    Negative(String),
    #[error("not a decimal number: {0}")]
    NotANumber(String),
    #[error("more than {max} fractional digits: {amount}")]
    TooPrecise { amount: String, max: u8 },
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

/// Converts between decimal strings and base-unit integers for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parser {
    decimals: u8,
}

/// Returns whether amounts in the given currency can be interpreted.
pub fn is_supported(symbol: &str) -> bool {
    symbol == ETH
}

/// Returns the parser for a built-in symbol.
pub fn parser(symbol: &str) -> Option<Parser> {
    match symbol {
        ETH => Some(Parser::new(ETH_DECIMALS)),
        _ => None,
    }
}

impl Parser {
    pub fn new(decimals: u8) -> Self {
        Self { decimals }
    }

    fn scale(&self) -> U256 {
        U256::from(10u8).pow(U256::from(self.decimals))
    }

    /// Parses a canonical or non-canonical decimal string into base units.
    pub fn parse(&self, amount: &str) -> Result<U256, CurrencyError> {
        if amount.starts_with('-') {
            return Err(CurrencyError::Negative(amount.into()));
        }

        let (int_part, frac_part) = match amount.split_once('.') {
            Some((i, f)) => (i, f),
            None => (amount, ""),
        };
        if int_part.is_empty()
            || (amount.contains('.') && frac_part.is_empty())
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(CurrencyError::NotANumber(amount.into()));
        }
        if frac_part.len() > self.decimals as usize {
            return Err(CurrencyError::TooPrecise {
                amount: amount.into(),
                max: self.decimals,
            });
        }

        let out_of_range = || CurrencyError::OutOfRange(amount.into());
        let mut value = U256::zero();
        for b in int_part.bytes() {
            value = value
                .checked_mul(U256::from(10u8))
                .and_then(|v| v.checked_add(U256::from(b - b'0')))
                .ok_or_else(out_of_range)?;
        }
        value = value.checked_mul(self.scale()).ok_or_else(out_of_range)?;

        let mut frac = U256::zero();
        for b in frac_part.bytes() {
            frac = frac * U256::from(10u8) + U256::from(b - b'0');
        }
        for _ in 0..(self.decimals as usize - frac_part.len()) {
            frac = frac * U256::from(10u8);
        }
        value.checked_add(frac).ok_or_else(out_of_range)
    }

    /// Formats base units as the canonical decimal string.
    pub fn format(&self, value: U256) -> String {
        let int = value / self.scale();
        let frac = value % self.scale();
        if frac.is_zero() {
            return int.to_string();
        }

        let mut frac = frac.to_string();
        while frac.len() < self.decimals as usize {
            frac.insert(0, '0');
        }
        while frac.ends_with('0') {
            frac.pop();
        }
        format!("{int}.{frac}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth() -> Parser {
        parser(ETH).unwrap()
    }

    #[test]
    fn parses_whole_and_fractional_amounts() {
        let one_eth = U256::from(10u8).pow(U256::from(18u8));
        assert_eq!(eth().parse("1").unwrap(), one_eth);
        assert_eq!(eth().parse("1.0").unwrap(), one_eth);
        assert_eq!(eth().parse("0.5").unwrap(), one_eth / U256::from(2u8));
        assert_eq!(eth().parse("0.000000000000000001").unwrap(), U256::one());
    }

    #[test]
    fn rejects_bad_amounts() {
        assert_eq!(
            eth().parse("-1"),
            Err(CurrencyError::Negative("-1".into()))
        );
        assert!(matches!(
            eth().parse("1.2.3"),
            Err(CurrencyError::NotANumber(_))
        ));
        assert!(matches!(
            eth().parse("abc"),
            Err(CurrencyError::NotANumber(_))
        ));
        assert!(matches!(eth().parse(""), Err(CurrencyError::NotANumber(_))));
        assert!(matches!(
            eth().parse("1."),
            Err(CurrencyError::NotANumber(_))
        ));
        assert!(matches!(
            eth().parse(".5"),
            Err(CurrencyError::NotANumber(_))
        ));
        assert!(matches!(
            eth().parse("0.0000000000000000001"),
            Err(CurrencyError::TooPrecise { .. })
        ));
    }

    #[test]
    fn format_parse_round_trip() {
        for canonical in ["0", "1", "0.5", "1.5", "2.25", "1000000", "0.000000000000000001"] {
            let value = eth().parse(canonical).unwrap();
            assert_eq!(eth().format(value), canonical, "canonical {canonical}");
        }
    }

    #[test]
    fn format_normalizes_non_canonical_input() {
        assert_eq!(eth().format(eth().parse("1.50").unwrap()), "1.5");
        assert_eq!(eth().format(eth().parse("1.0").unwrap()), "1");
    }

    #[test]
    fn small_exponent_parser() {
        let cents = Parser::new(2);
        assert_eq!(cents.parse("1.25").unwrap(), U256::from(125u8));
        assert!(matches!(
            cents.parse("1.255"),
            Err(CurrencyError::TooPrecise { .. })
        ));
        assert_eq!(cents.format(U256::from(125u8)), "1.25");
    }

    #[test]
    fn unsupported_symbol() {
        assert!(is_supported(ETH));
        assert!(!is_supported("DOGE"));
        assert!(parser("DOGE").is_none());
    }
}
