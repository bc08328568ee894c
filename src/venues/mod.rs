//! Venue adapters: symbol translation, subscribe/unsubscribe framing, and
//! wire-message normalization. One `VenueAdapter` instance backs one
//! `Connection` for its whole lifetime, so adapters are free to carry
//! per-connection mutable state (e.g. Binance's buffered-delta bootstrap).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{SessionConfig, SessionSchema};
use crate::currency::CurrencyPair;
use crate::error::Result;
use crate::model::{MdEntry, NormalizedMDData, QuoteType, UpdateType};

pub mod binance;
pub mod coinbase;
pub mod okx;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use okx::OkxAdapter;

/// What a decoded frame turned out to be, after `detect_type` + `parse_message`.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    /// Subscription ack, heartbeat, pong-equivalent, or a buffered delta
    /// that produced no book-visible entries yet.
    Control,
    Data(NormalizedMDData),
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn ws_url(&self, session: &SessionConfig) -> String;

    /// e.g. `BTC/USDT` -> `BTCUSDT` (Binance) or `BTC/USD` -> `BTC-USD` (Coinbase).
    fn translate_symbol_to_exchange_specific(&self, cp: &CurrencyPair) -> String;
    /// Inverse of the above; used to resolve an instrument out of an inbound frame.
    fn translate_symbol(&self, raw: &str) -> Result<CurrencyPair>;

    fn build_subscribe(&self, session: &SessionConfig, instruments: &[CurrencyPair]) -> Value;
    fn build_unsubscribe(&self, session: &SessionConfig, instruments: &[CurrencyPair]) -> Value;

    fn detect_type(&self, doc: &Value) -> String;
    fn parse_message(&self, msg_type: &str, doc: &Value, now: i64) -> Result<ParseOutcome>;

    /// Binance subscribes before fetching the REST snapshot so that
    /// incremental updates arriving during the REST round trip can be
    /// buffered rather than lost; Coinbase/OKX receive their snapshot over
    /// the same socket and so snapshot before subscribe confirmation
    /// doesn't apply to them.
    fn subscribe_before_snapshot(&self) -> bool {
        false
    }

    async fn fetch_snapshot(&self, _session: &SessionConfig, _cp: &CurrencyPair, _now: i64) -> Result<NormalizedMDData> {
        Ok(NormalizedMDData::new())
    }
}

pub fn for_schema(schema: SessionSchema) -> Arc<dyn VenueAdapter> {
    match schema {
        SessionSchema::BinanceMd => Arc::new(BinanceAdapter::new()),
        SessionSchema::CoinbaseMd => Arc::new(CoinbaseAdapter::new()),
        SessionSchema::OkxMd => Arc::new(OkxAdapter::new()),
        other => unreachable!("order-execution schema {other:?} should have been rejected at config load"),
    }
}

/// Shared `ParseQuote`-equivalent: turns one side's raw `(price, qty)`
/// string pairs into `MdEntry`s per the normalization rule common to every
/// venue (§4.2): `updateType` from the quantity, `refId` from the venue's
/// own price text, `positionNo` from level index.
pub fn normalize_levels(cp: &CurrencyPair, side: QuoteType, levels: &[(String, String)], now: i64) -> Vec<MdEntry> {
    levels
        .iter()
        .enumerate()
        .map(|(idx, (price, qty))| {
            let volume: f64 = qty.parse().unwrap_or(0.0);
            let side_char = if side == QuoteType::Bid { 'B' } else { 'A' };
            let id = format!("{cp}_{side_char}{price}");
            MdEntry {
                id: id.clone(),
                ref_id: id,
                quote_id: String::new(),
                update_type: if volume == 0.0 { UpdateType::Delete } else { UpdateType::New },
                position_no: idx as u32 + 1,
                entry_type: side,
                instrument: cp.clone(),
                price: price.clone(),
                volume,
                min_qty: 0.0,
                adpt_receive_time: now,
                sequence_tag: 0,
                end_of_message: false,
            }
        })
        .collect()
}

/// Splits a venue symbol on a known quote-currency suffix (longest match
/// first), e.g. `BTCUSDT` -> `BTC/USDT`. Shared by venues that concatenate
/// base+quote with no separator.
pub fn split_concatenated_symbol(raw: &str) -> Result<CurrencyPair> {
    const QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "EUR", "USD", "BTC", "ETH"];
    let upper = raw.to_ascii_uppercase();
    for quote in QUOTES {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok(CurrencyPair::new(base, *quote));
            }
        }
    }
    Err(crate::error::GatewayError::InvalidArgument(format!(
        "cannot split venue symbol: {raw}"
    )))
}
