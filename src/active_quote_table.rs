//! Per-connection `refId -> QuoteInfo` reconciliation map.
//!
//! Every publish rewrites or replaces the entry for a refId; a hash of
//! (volume, price, minQty, quoteId) lets "semantically identical" resends
//! skip rotating the downstream bookkeeping key (`oriKey`), matching the
//! skip-key contract used by `publish_quotes`.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::currency::CurrencyPair;
use crate::model::QuoteType;

#[derive(Debug, Clone)]
pub struct QuoteInfo {
    pub key: i64,
    pub cp: CurrencyPair,
    pub entry_type: QuoteType,
    pub hash_value: u64,
    pub ori_key: i64,
    pub sequence_tag: u64,
}

pub struct ActiveQuoteTable {
    map: RwLock<HashMap<String, QuoteInfo>>,
    next_key: AtomicI64,
}

impl ActiveQuoteTable {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            next_key: AtomicI64::new(1),
        }
    }

    pub fn new_monotonic_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// `hash(volume) ^ hash(price) ^ hash(minQty)`, additionally XORed with
    /// `hash(quoteId)` when the venue supplied a non-empty quote id.
    pub fn calculate_hash_value(volume: f64, price: &str, min_qty: f64, quote_id: &str) -> u64 {
        let mut h_vol = DefaultHasher::new();
        volume.to_bits().hash(&mut h_vol);
        let mut h_price = DefaultHasher::new();
        price.hash(&mut h_price);
        let mut h_qty = DefaultHasher::new();
        min_qty.to_bits().hash(&mut h_qty);

        let mut v = h_vol.finish() ^ h_price.finish() ^ h_qty.finish();
        if !quote_id.is_empty() {
            let mut h_id = DefaultHasher::new();
            quote_id.hash(&mut h_id);
            v ^= h_id.finish();
        }
        v
    }

    pub fn find_quote_info(&self, ref_id: &str) -> Option<QuoteInfo> {
        self.map.read().unwrap().get(ref_id).cloned()
    }

    /// Always-fresh-`oriKey` replace, with no skip-key consideration.
    pub fn replace_quote_info_simple(
        &self,
        ref_id: &str,
        new_id: &str,
        cp: CurrencyPair,
        entry_type: QuoteType,
        sequence_tag: u64,
    ) -> Option<QuoteInfo> {
        let key = self.new_monotonic_key();
        let info = QuoteInfo {
            key,
            cp,
            entry_type,
            hash_value: 0,
            ori_key: key,
            sequence_tag,
        };
        let mut map = self.map.write().unwrap();
        let prior = map.get(ref_id).cloned();
        if new_id != ref_id {
            map.remove(ref_id);
        }
        map.insert(new_id.to_string(), info);
        prior
    }

    /// The `forceKey`-parameterized overload. Returns the prior entry (if
    /// any) and whether key rotation was suppressed. `key` must be the same
    /// value the caller hands to the `OrderBook` for this publish, so that a
    /// later lookup's `prior.key` matches the book entry actually inserted.
    pub fn replace_quote_info(
        &self,
        key: i64,
        ref_id: &str,
        new_id: &str,
        cp: CurrencyPair,
        entry_type: QuoteType,
        hash_value: u64,
        sequence_tag: u64,
        force_key: bool,
    ) -> (Option<QuoteInfo>, bool) {
        let mut map = self.map.write().unwrap();
        let prior = map.get(ref_id).cloned();

        let skip_key = !force_key
            && prior
                .as_ref()
                .is_some_and(|p| p.hash_value == hash_value && ref_id == new_id);

        let ori_key = match (&prior, skip_key) {
            (Some(p), true) => p.ori_key,
            _ => key,
        };

        let info = QuoteInfo {
            key,
            cp,
            entry_type,
            hash_value,
            ori_key,
            sequence_tag,
        };

        if new_id != ref_id {
            map.remove(ref_id);
        }
        map.insert(new_id.to_string(), info);

        (prior, skip_key)
    }

    pub fn remove_quote_info(&self, ref_id: &str) -> Option<QuoteInfo> {
        self.map.write().unwrap().remove(ref_id)
    }

    /// Drops every entry with `key < limit_key`, invoking `action` once per
    /// removal.
    pub fn remove_old_quote_infos(&self, limit_key: i64, mut action: impl FnMut(&str, &QuoteInfo)) {
        let mut map = self.map.write().unwrap();
        map.retain(|ref_id, info| {
            if info.key < limit_key {
                action(ref_id, info);
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActiveQuoteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CurrencyPair;

    fn cp() -> CurrencyPair {
        CurrencyPair::parse("BTC/USDT").unwrap()
    }

    #[test]
    fn skip_key_preserves_ori_key_on_identical_resend() {
        let table = ActiveQuoteTable::new();
        let hash = ActiveQuoteTable::calculate_hash_value(1.0, "1.0", 0.0, "");

        let (prior, skip) = table.replace_quote_info(table.new_monotonic_key(), "A", "A", cp(), QuoteType::Bid, hash, 0, false);
        assert!(prior.is_none());
        assert!(!skip);
        let first = table.find_quote_info("A").unwrap();

        let (prior2, skip2) =
            table.replace_quote_info(table.new_monotonic_key(), "A", "A", cp(), QuoteType::Bid, hash, 0, false);
        let prior2 = prior2.unwrap();
        assert!(skip2);
        assert_eq!(prior2.key, first.key);

        let second = table.find_quote_info("A").unwrap();
        assert_eq!(second.ori_key, first.ori_key);
        assert_ne!(second.key, first.key);
    }

    #[test]
    fn changed_hash_forces_new_ori_key() {
        let table = ActiveQuoteTable::new();
        let hash1 = ActiveQuoteTable::calculate_hash_value(1.0, "1.0", 0.0, "");
        let hash2 = ActiveQuoteTable::calculate_hash_value(2.0, "1.0", 0.0, "");

        table.replace_quote_info(table.new_monotonic_key(), "A", "A", cp(), QuoteType::Bid, hash1, 0, false);
        let (_, skip) = table.replace_quote_info(table.new_monotonic_key(), "A", "A", cp(), QuoteType::Bid, hash2, 0, false);
        assert!(!skip);
    }

    #[test]
    fn remove_old_sweeps_by_key_threshold() {
        let table = ActiveQuoteTable::new();
        table.replace_quote_info_simple("A", "A", cp(), QuoteType::Bid, 0);
        table.replace_quote_info_simple("B", "B", cp(), QuoteType::Bid, 0);
        let mut removed = Vec::new();
        table.remove_old_quote_infos(2, |ref_id, _| removed.push(ref_id.to_string()));
        assert_eq!(removed, vec!["A".to_string()]);
        assert_eq!(table.len(), 1);
    }
}
