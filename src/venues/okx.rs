//! OKX `books` channel: `action`-classified snapshot/update frames, and
//! `event`-classified control frames.

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};

use crate::config::SessionConfig;
use crate::currency::CurrencyPair;
use crate::error::{GatewayError, Result};
use crate::model::{NormalizedMDData, QuoteType};
use crate::signing::okx_signature;

use super::{normalize_levels, ParseOutcome, VenueAdapter};

pub struct OkxAdapter;

impl OkxAdapter {
    pub fn new() -> Self {
        Self
    }

    fn triples_from(value: &Value) -> Vec<(String, String)> {
        value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|triple| {
                        let triple = triple.as_array()?;
                        Some((triple.first()?.as_str()?.to_string(), triple.get(1)?.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for OkxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "okx"
    }

    fn ws_url(&self, _session: &SessionConfig) -> String {
        "wss://ws.okx.com:8443/ws/v5/public".to_string()
    }

    fn translate_symbol_to_exchange_specific(&self, cp: &CurrencyPair) -> String {
        format!("{}-{}", cp.base(), cp.quote())
    }

    fn translate_symbol(&self, raw: &str) -> Result<CurrencyPair> {
        let (base, quote) = raw
            .split_once('-')
            .ok_or_else(|| GatewayError::InvalidArgument(format!("malformed okx instId: {raw}")))?;
        Ok(CurrencyPair::new(base, quote))
    }

    fn build_subscribe(&self, _session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let args: Vec<Value> = instruments
            .iter()
            .map(|cp| json!({ "channel": "books", "instId": self.translate_symbol_to_exchange_specific(cp) }))
            .collect();
        json!({ "op": "subscribe", "args": args })
    }

    fn build_unsubscribe(&self, _session: &SessionConfig, instruments: &[CurrencyPair]) -> Value {
        let args: Vec<Value> = instruments
            .iter()
            .map(|cp| json!({ "channel": "books", "instId": self.translate_symbol_to_exchange_specific(cp) }))
            .collect();
        json!({ "op": "unsubscribe", "args": args })
    }

    fn detect_type(&self, doc: &Value) -> String {
        if let Some(event) = doc.get("event").and_then(Value::as_str) {
            return event.to_string();
        }
        if let Some(action) = doc.get("action").and_then(Value::as_str) {
            return action.to_string();
        }
        "unknown".to_string()
    }

    fn parse_message(&self, msg_type: &str, doc: &Value, now: i64) -> Result<ParseOutcome> {
        match msg_type {
            "error" => {
                warn!("okx: venue error frame: {doc}");
                Ok(ParseOutcome::Control)
            }
            "subscribe" | "unsubscribe" => Ok(ParseOutcome::Control),
            "snapshot" | "update" => {
                let inst_id = doc
                    .pointer("/arg/instId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::ParseError("okx frame missing arg.instId".into()))?;
                let cp = self.translate_symbol(inst_id)?;

                let payload = doc
                    .get("data")
                    .and_then(Value::as_array)
                    .and_then(|arr| arr.first())
                    .ok_or_else(|| GatewayError::ParseError("okx frame missing data[0]".into()))?;

                let mut nmd = NormalizedMDData::new();
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Bid, &Self::triples_from(payload.get("bids").unwrap_or(&Value::Null)), now));
                nmd.entries
                    .extend(normalize_levels(&cp, QuoteType::Offer, &Self::triples_from(payload.get("asks").unwrap_or(&Value::Null)), now));
                Ok(ParseOutcome::Data(nmd.finish()))
            }
            _ => Ok(ParseOutcome::Control),
        }
    }
}

/// Builds the `OK-ACCESS-*` header set for a signed REST call.
pub fn signed_headers(session: &SessionConfig, method: &str, path: &str, body: &str, timestamp_iso8601: &str) -> Result<Vec<(String, String)>> {
    let signature = okx_signature(&session.secret_key, timestamp_iso8601, method, path, body)?;
    Ok(vec![
        ("OK-ACCESS-KEY".to_string(), session.api_key.clone()),
        ("OK-ACCESS-SIGN".to_string(), signature),
        ("OK-ACCESS-TIMESTAMP".to_string(), timestamp_iso8601.to_string()),
        ("OK-ACCESS-PASSPHRASE".to_string(), session.passphrase.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_symbol_round_trip() {
        let adapter = OkxAdapter::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        assert_eq!(adapter.translate_symbol_to_exchange_specific(&cp), "BTC-USDT");
        assert_eq!(adapter.translate_symbol("BTC-USDT").unwrap(), cp);
    }

    #[test]
    fn snapshot_action_extracts_data_zero() {
        let adapter = OkxAdapter::new();
        let doc = json!({
            "arg": {"channel": "books", "instId": "BTC-USDT"},
            "action": "snapshot",
            "data": [{"bids": [["100.0", "1.0", "0", "1"]], "asks": [["101.0", "0", "0", "1"]]}],
        });
        let outcome = adapter.parse_message("snapshot", &doc, 0).unwrap();
        let ParseOutcome::Data(nmd) = outcome else { panic!("expected data") };
        assert_eq!(nmd.entries.len(), 2);
        assert_eq!(nmd.entries[1].update_type, crate::model::UpdateType::Delete);
    }
}
