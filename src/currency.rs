//! Currency / CurrencyPair data model and the pip-factor registry.
//!
//! Prices move through the core as 64-bit integer "cpips" (pip x 100) and
//! quantities as integer sub-units (hundredths for FX, 1e-8 for crypto).
//! Floating point only appears at the boundary conversions below.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::error::{GatewayError, Result};

pub const DEFAULT_PIP_FACTOR: i64 = 10_000;
const QUANTITY_DECIMAL_FACTOR_FX: i64 = 100;
const QUANTITY_DECIMAL_FACTOR_CRYPTO: i64 = 100_000_000;

/// Process-wide currency registry. Entries are added once at startup
/// (config load) and never mutated afterward.
#[derive(Default)]
struct CurrencyRegistry {
    pip_factors: RwLock<HashMap<String, i64>>,
    fx: RwLock<std::collections::HashSet<String>>,
}

impl CurrencyRegistry {
    fn register(&self, code: &str, pip_factor: i64, is_fx: bool) {
        self.pip_factors
            .write()
            .unwrap()
            .insert(code.to_ascii_uppercase(), pip_factor);
        if is_fx {
            self.fx.write().unwrap().insert(code.to_ascii_uppercase());
        }
    }

    fn is_registered(&self, code: &str) -> bool {
        self.pip_factors
            .read()
            .unwrap()
            .contains_key(&code.to_ascii_uppercase())
    }

    fn pip_factor(&self, code: &str) -> i64 {
        *self
            .pip_factors
            .read()
            .unwrap()
            .get(&code.to_ascii_uppercase())
            .unwrap_or(&DEFAULT_PIP_FACTOR)
    }

    fn is_fx(&self, code: &str) -> bool {
        self.fx.read().unwrap().contains(&code.to_ascii_uppercase())
    }
}

static REGISTRY: Lazy<CurrencyRegistry> = Lazy::new(|| {
    let r = CurrencyRegistry::default();
    // Common crypto bases/quotes seen across the three supported venues.
    for c in ["BTC", "ETH", "SOL", "XRP", "LTC", "BNB", "DOGE", "USDT", "USDC", "OKB"] {
        r.register(c, DEFAULT_PIP_FACTOR, false);
    }
    // Fiat quote currencies behave like FX legs (hundredths-of-a-unit quantities).
    for c in ["USD", "EUR", "GBP", "JPY"] {
        r.register(c, DEFAULT_PIP_FACTOR, true);
    }
    r
});

/// Registers (or re-registers the pip factor of) a currency code. Called
/// from configuration loading for instruments outside the built-in set.
pub fn register_currency(code: &str, pip_factor: i64, is_fx: bool) {
    REGISTRY.register(code, pip_factor, is_fx);
}

pub fn is_registered(code: &str) -> bool {
    REGISTRY.is_registered(code)
}

/// An ordered (base, quote) currency pair, e.g. "BTC/USDT".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// Parses "BASE/QUOTE". Fails if the separator is missing.
    pub fn parse(s: &str) -> Result<Self> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| GatewayError::InvalidArgument(format!("malformed pair: {s}")))?;
        Ok(Self::new(base, quote))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    pub fn valid(&self) -> bool {
        is_registered(&self.base) && is_registered(&self.quote)
    }

    /// Pip factor is taken from the quote leg, matching how FX pip
    /// conventions attach to the quote currency.
    pub fn pip_factor(&self) -> i64 {
        REGISTRY.pip_factor(&self.quote)
    }

    pub fn cpip_factor(&self) -> i64 {
        self.pip_factor() * 100
    }

    pub fn is_fx(&self) -> bool {
        REGISTRY.is_fx(&self.base) && REGISTRY.is_fx(&self.quote)
    }

    fn quantity_decimal_factor(&self) -> i64 {
        if self.is_fx() {
            QUANTITY_DECIMAL_FACTOR_FX
        } else {
            QUANTITY_DECIMAL_FACTOR_CRYPTO
        }
    }

    pub fn dbl_to_cpip(&self, price: f64) -> i64 {
        (price * self.cpip_factor() as f64).round() as i64
    }

    pub fn cpip_to_dbl(&self, cpip: i64) -> f64 {
        cpip as f64 / self.cpip_factor() as f64
    }

    pub fn qty_to_i64(&self, qty: f64) -> i64 {
        (qty * self.quantity_decimal_factor() as f64).round() as i64
    }

    pub fn i64_to_qty(&self, units: i64) -> f64 {
        units as f64 / self.quantity_decimal_factor() as f64
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        assert_eq!(cp.to_string(), "BTC/USDT");
        assert!(cp.valid());
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(CurrencyPair::parse("BTCUSDT").is_err());
    }

    #[test]
    fn cpip_round_trip_is_lossless_on_ticks() {
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        let cpip = cp.dbl_to_cpip(19800.12);
        assert_eq!(cp.cpip_to_dbl(cpip), 19800.12);
    }

    #[test]
    fn crypto_pair_is_not_fx() {
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        assert!(!cp.is_fx());
    }

    #[test]
    fn fiat_pair_is_fx() {
        register_currency("EUR", DEFAULT_PIP_FACTOR, true);
        let cp = CurrencyPair::parse("EUR/USD").unwrap();
        assert!(cp.is_fx());
    }
}
