//! Binance depth-diff stream: subscribe-before-snapshot, REST bootstrap,
//! buffered-delta replay, and the `U <= lastUpdateId + 1 <= u` sequence
//! invariant for ongoing updates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};

use crate::config::SessionConfig;
use crate::currency::CurrencyPair;
use crate::error::{GatewayError, Result};
use crate::model::{NormalizedMDData, QuoteType};

use super::{normalize_levels, split_concatenated_symbol, ParseOutcome, VenueAdapter};

struct BookState {
    last_update_id: i64,
    bootstrapped: bool,
    buffered: Vec<Value>,
}

impl BookState {
    fn new() -> Self {
        Self {
            last_update_id: 0,
            bootstrapped: false,
            buffered: Vec::new(),
        }
    }
}

pub struct BinanceAdapter {
    state: Mutex<HashMap<CurrencyPair, BookState>>,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    fn levels_from(value: &Value) -> Vec<(String, String)> {
        value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|pair| {
                        let pair = pair.as_array()?;
                        Some((pair.first()?.as_str()?.to_string(), pair.get(1)?.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies a single `depthUpdate` against a bootstrapped book state,
    /// enforcing `U <= lastUpdateId + 1 <= u`.
    fn apply_ongoing_update(state: &mut BookState, doc: &Value, cp: &CurrencyPair, now: i64) -> Option<NormalizedMDData> {
        let first_id = doc.get("U")?.as_i64()?;
        let last_id = doc.get("u")?.as_i64()?;
        if !(first_id <= state.last_update_id + 1 && state.last_update_id + 1 <= last_id) {
            warn!(
                "binance: dropping out-of-sequence depthUpdate for {cp} (U={first_id} u={last_id} lastUpdateId={})",
                state.last_update_id
            );
            return None;
        }
        state.last_update_id = last_id;
        let mut nmd = NormalizedMDData::new();
        nmd.entries.extend(normalize_levels(cp, QuoteType::Bid, &Self::levels_from(doc.get("b")?), now));
        nmd.entries.extend(normalize_levels(cp, QuoteType::Offer, &Self::levels_from(doc.get("a")?), now));
        Some(nmd.finish())
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self, _session: &SessionConfig) -> String {
        "wss://stream.binance.com:9443/ws".to_string()
    }

    fn translate_symbol_to_exchange_specific(&self, cp: &CurrencyPair) -> String {
        format!("{}{}", cp.base(), cp.quote()).to_ascii_lowercase()
    }

    fn translate_symbol(&self, raw: &str) -> Result<CurrencyPair> {
        split_concatenated_symbol(raw)
    }

    fn build_subscribe(&self, session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let depth_suffix = if session.depth > 0 {
            format!("@depth{}@100ms", session.depth)
        } else {
            "@depth@100ms".to_string()
        };
        let params: Vec<String> = instruments
            .iter()
            .map(|cp| format!("{}{depth_suffix}", self.translate_symbol_to_exchange_specific(cp)))
            .collect();
        json!({ "method": "SUBSCRIBE", "params": params, "id": 1 })
    }

    fn build_unsubscribe(&self, session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let mut msg = self.build_subscribe(session, instruments);
        msg["method"] = json!("UNSUBSCRIBE");
        msg
    }

    fn detect_type(&self, doc: &Value) -> String {
        if doc.get("result").is_some() {
            "control".to_string()
        } else if doc.get("error").is_some() {
            "error".to_string()
        } else if doc.get("e").and_then(Value::as_str) == Some("depthUpdate") {
            "depthUpdate".to_string()
        } else if doc.get("lastUpdateId").is_some() {
            "topN".to_string()
        } else {
            "unknown".to_string()
        }
    }

    fn parse_message(&self, msg_type: &str, doc: &Value, now: i64) -> Result<ParseOutcome> {
        match msg_type {
            "control" => Ok(ParseOutcome::Control),
            "error" => {
                warn!("binance: venue error frame: {doc}");
                Ok(ParseOutcome::Control)
            }
            "depthUpdate" => {
                let symbol = doc
                    .get("s")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::ParseError("depthUpdate missing symbol".into()))?;
                let cp = self.translate_symbol(symbol)?;

                let mut state_map = self.state.lock().unwrap();
                let state = state_map.entry(cp.clone()).or_insert_with(BookState::new);

                if !state.bootstrapped {
                    state.buffered.push(doc.clone());
                    return Ok(ParseOutcome::Control);
                }

                match Self::apply_ongoing_update(state, doc, &cp, now) {
                    Some(nmd) => Ok(ParseOutcome::Data(nmd)),
                    None => Ok(ParseOutcome::Control),
                }
            }
            "topN" => {
                // depth5/10/20 streams: full top-of-book snapshot, no `e` field.
                let symbol = doc
                    .get("s")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::ParseError("depthNUpdate missing symbol".into()))?;
                let cp = self.translate_symbol(symbol)?;
                let last_update_id = doc
                    .get("lastUpdateId")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| GatewayError::ParseError("depthNUpdate missing lastUpdateId".into()))?;

                let mut state_map = self.state.lock().unwrap();
                let state = state_map.entry(cp.clone()).or_insert_with(BookState::new);

                if last_update_id < state.last_update_id {
                    warn!(
                        "binance: ignoring stale depthNUpdate for {cp} (lastUpdateId={last_update_id} < {})",
                        state.last_update_id
                    );
                    return Ok(ParseOutcome::Control);
                }
                state.last_update_id = last_update_id;

                let mut nmd = NormalizedMDData::new();
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Bid, &Self::levels_from(doc.get("bids").unwrap_or(&Value::Null)), now));
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Offer, &Self::levels_from(doc.get("asks").unwrap_or(&Value::Null)), now));
                Ok(ParseOutcome::Data(nmd.finish()))
            }
            _ => Ok(ParseOutcome::Control),
        }
    }

    fn subscribe_before_snapshot(&self) -> bool {
        true
    }

    async fn fetch_snapshot(&self, _session: &SessionConfig, cp: &CurrencyPair, now: i64) -> Result<NormalizedMDData> {
        let symbol = self.translate_symbol_to_exchange_specific(cp).to_ascii_uppercase();
        let url = format!("https://api.binance.com/api/v3/depth?symbol={symbol}&limit=5000");
        let resp: Value = reqwest::get(&url)
            .await
            .map_err(|e| GatewayError::TransportError(format!("binance snapshot fetch: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::ParseError(format!("binance snapshot body: {e}")))?;

        let last_update_id = resp
            .get("lastUpdateId")
            .and_then(Value::as_i64)
            .ok_or_else(|| GatewayError::ParseError("binance snapshot missing lastUpdateId".into()))?;

        let mut nmd = NormalizedMDData::new();
        nmd.entries
            .extend(normalize_levels(cp, QuoteType::Bid, &Self::levels_from(resp.get("bids").unwrap_or(&Value::Null)), now));
        nmd.entries
            .extend(normalize_levels(cp, QuoteType::Offer, &Self::levels_from(resp.get("asks").unwrap_or(&Value::Null)), now));

        let mut state_map = self.state.lock().unwrap();
        let state = state_map.entry(cp.clone()).or_insert_with(BookState::new);
        state.last_update_id = last_update_id;
        state.bootstrapped = true;

        let buffered = std::mem::take(&mut state.buffered);
        for delta in buffered {
            let delta_last_id = delta.get("u").and_then(Value::as_i64).unwrap_or(0);
            if delta_last_id <= state.last_update_id {
                continue; // stale, predates snapshot
            }
            if let Some(replay) = Self::apply_ongoing_update(state, &delta, cp, now) {
                nmd.entries.extend(replay.entries);
            }
        }

        Ok(nmd.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_symbol_round_trip() {
        let adapter = BinanceAdapter::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        let venue_symbol = adapter.translate_symbol_to_exchange_specific(&cp);
        assert_eq!(venue_symbol, "btcusdt");
        assert_eq!(adapter.translate_symbol("BTCUSDT").unwrap(), cp);
    }

    #[test]
    fn buffers_deltas_until_bootstrapped() {
        let adapter = BinanceAdapter::new();
        let doc = json!({"e":"depthUpdate","s":"BTCUSDT","U":1,"u":2,"b":[],"a":[]});
        let outcome = adapter.parse_message("depthUpdate", &doc, 0).unwrap();
        assert!(matches!(outcome, ParseOutcome::Control));
    }
}
