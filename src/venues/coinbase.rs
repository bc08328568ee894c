//! Coinbase Exchange `level2` channel: snapshot + incremental updates
//! delivered over the same socket, with optional HMAC-signed authenticated
//! subscribe for private feeds.

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};

use crate::config::SessionConfig;
use crate::currency::CurrencyPair;
use crate::error::{GatewayError, Result};
use crate::model::{NormalizedMDData, QuoteType};
use crate::signing::coinbase_signature;

use super::{normalize_levels, ParseOutcome, VenueAdapter};

pub struct CoinbaseAdapter;

impl CoinbaseAdapter {
    pub fn new() -> Self {
        Self
    }

    fn changes_by_side(changes: &[Value], want_buy: bool) -> Vec<(String, String)> {
        changes
            .iter()
            .filter_map(|c| {
                let c = c.as_array()?;
                let side = c.first()?.as_str()?;
                if (side == "buy") != want_buy {
                    return None;
                }
                Some((c.get(1)?.as_str()?.to_string(), c.get(2)?.as_str()?.to_string()))
            })
            .collect()
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
}

impl Default for CoinbaseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn ws_url(&self, _session: &SessionConfig) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn translate_symbol_to_exchange_specific(&self, cp: &CurrencyPair) -> String {
        format!("{}-{}", cp.base(), cp.quote())
    }

    fn translate_symbol(&self, raw: &str) -> Result<CurrencyPair> {
        let (base, quote) = raw
            .split_once('-')
            .ok_or_else(|| GatewayError::InvalidArgument(format!("malformed coinbase symbol: {raw}")))?;
        Ok(CurrencyPair::new(base, quote))
    }

    fn build_subscribe(&self, session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let product_ids: Vec<String> = instruments.iter().map(|cp| self.translate_symbol_to_exchange_specific(cp)).collect();
        let mut msg = json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channels": ["level2"],
        });

        if !session.secret_key.is_empty() {
            let timestamp = (crate::timer::now_ns() / 1_000_000_000).to_string();
            match coinbase_signature(&session.secret_key, &timestamp, "GET", "/users/self/verify", "") {
                Ok(signature) => {
                    msg["signature"] = json!(signature);
                    msg["key"] = json!(session.api_key);
                    msg["passphrase"] = json!(session.passphrase);
                    msg["timestamp"] = json!(timestamp);
                }
                Err(e) => warn!("coinbase: failed to sign subscribe request: {e}"),
            }
        }
        msg
    }

    fn build_unsubscribe(&self, _session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let product_ids: Vec<String> = instruments.iter().map(|cp| self.translate_symbol_to_exchange_specific(cp)).collect();
        json!({ "type": "unsubscribe", "product_ids": product_ids, "channels": ["level2"] })
    }

    fn detect_type(&self, doc: &Value) -> String {
        doc.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string()
    }

    fn parse_message(&self, msg_type: &str, doc: &Value, now: i64) -> Result<ParseOutcome> {
        match msg_type {
            "heartbeat" | "subscriptions" => Ok(ParseOutcome::Control),
            "snapshot" => {
                let product_id = doc
                    .get("product_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::ParseError("coinbase snapshot missing product_id".into()))?;
                let cp = self.translate_symbol(product_id)?;

                let mut nmd = NormalizedMDData::new();
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Bid, &Self::levels_from(doc.get("bids").unwrap_or(&Value::Null)), now));
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Offer, &Self::levels_from(doc.get("asks").unwrap_or(&Value::Null)), now));
                Ok(ParseOutcome::Data(nmd.finish()))
            }
            "l2update" => {
                let product_id = doc
                    .get("product_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::ParseError("coinbase l2update missing product_id".into()))?;
                let cp = self.translate_symbol(product_id)?;
                let changes = doc
                    .get("changes")
                    .and_then(Value::as_array)
                    .ok_or_else(|| GatewayError::ParseError("coinbase l2update missing changes".into()))?;

                let mut nmd = NormalizedMDData::new();
                nmd.entries.extend(normalize_levels(&cp, QuoteType::Bid, &Self::changes_by_side(changes, true), now));
                nmd.entries.extend(normalize_levels(&cp, QuoteType::Offer, &Self::changes_by_side(changes, false), now));
                Ok(ParseOutcome::Data(nmd.finish()))
            }
            _ => Ok(ParseOutcome::Control),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_symbol_round_trip() {
        let adapter = CoinbaseAdapter::new();
        let cp = CurrencyPair::parse("BTC/USD").unwrap();
        assert_eq!(adapter.translate_symbol_to_exchange_specific(&cp), "BTC-USD");
        assert_eq!(adapter.translate_symbol("BTC-USD").unwrap(), cp);
    }

    #[test]
    fn l2update_delete_maps_zero_size_to_delete() {
        let adapter = CoinbaseAdapter::new();
        let doc = json!({
            "type": "l2update",
            "product_id": "BTC-USD",
            "changes": [["buy", "10000.00", "0"]],
        });
        let outcome = adapter.parse_message("l2update", &doc, 0).unwrap();
        let ParseOutcome::Data(nmd) = outcome else { panic!("expected data") };
        assert_eq!(nmd.entries.len(), 1);
        assert_eq!(nmd.entries[0].update_type, crate::model::UpdateType::Delete);
    }
}
