//! Per-instrument, per-side, price-sorted order book.
//!
//! Each `(CurrencyPair, side)` pair owns its own reader-writer lock so
//! concurrent updates to distinct instruments (or distinct sides of the
//! same instrument) never contend with each other; only the top-level
//! instrument map is ever locked exclusively, and only to insert a
//! previously-unseen instrument.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use log::warn;

use crate::currency::CurrencyPair;
use crate::metrics::METRICS;
use crate::model::{QuoteType, UpdateType};

use super::group::QuoteGroup;
use super::quote::Quote;

struct BookSide {
    bid: RwLock<Vec<Arc<Quote>>>,
    ask: RwLock<Vec<Arc<Quote>>>,
}

impl BookSide {
    fn new() -> Self {
        Self {
            bid: RwLock::new(Vec::new()),
            ask: RwLock::new(Vec::new()),
        }
    }

    fn side(&self, is_bid: bool) -> &RwLock<Vec<Arc<Quote>>> {
        if is_bid { &self.bid } else { &self.ask }
    }
}

#[allow(clippy::too_many_arguments)]
pub struct NewQuoteArgs {
    pub key: i64,
    pub ref_key: i64,
    pub adpt_receive_time: i64,
    pub receipt_time: i64,
    pub sort_time: i64,
    pub quote_id: String,
    pub seqnum: i64,
    pub price: i64,
    pub volume: i64,
    pub min_qty: i64,
    pub sending_time: i64,
    pub side: QuoteType,
    pub position_no: u32,
    pub settl_date: i64,
    pub originator: String,
}

pub struct OrderBook {
    books: RwLock<HashMap<CurrencyPair, Arc<BookSide>>>,
    last_cleanup: RwLock<HashMap<(CurrencyPair, bool), i64>>,
    last_quote: RwLock<Option<Arc<Quote>>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(HashMap::new()),
            last_quote: RwLock::new(None),
        }
    }

    fn side_for(&self, cp: &CurrencyPair) -> Arc<BookSide> {
        if let Some(side) = self.books.read().unwrap().get(cp) {
            return side.clone();
        }
        let mut books = self.books.write().unwrap();
        if let std::collections::hash_map::Entry::Vacant(entry) = books.entry(cp.clone()) {
            let side = entry.insert(Arc::new(BookSide::new()));
            METRICS.book_pairs_active.fetch_add(1, Ordering::Relaxed);
            return side.clone();
        }
        books.get(cp).unwrap().clone()
    }

    /// Applies one reconciled entry to the book. `update_type` drives
    /// whether this removes an existing quote (Update/Delete, matched by
    /// `ref_key`) or inserts a fresh one (anything else).
    pub fn add_entry(&self, cp: &CurrencyPair, update_type: UpdateType, args: NewQuoteArgs, now: i64) {
        let book = self.side_for(cp);
        let is_bid = args.side == QuoteType::Bid;
        let mut vec = book.side(is_bid).write().unwrap();

        if matches!(update_type, UpdateType::Update | UpdateType::Delete) {
            if let Some(idx) = vec.iter().position(|q| q.key == args.ref_key) {
                let existing = vec.remove(idx);
                existing.set_invalid(now);
            } else {
                warn!(
                    "orderbook: refKey {} not found for {:?} on {}",
                    args.ref_key, update_type, cp
                );
            }
        }

        if update_type == UpdateType::Delete {
            return;
        }

        let quote = Arc::new(Quote::new(
            args.adpt_receive_time,
            args.receipt_time,
            args.sort_time,
            args.quote_id,
            args.seqnum,
            args.price,
            args.volume,
            args.min_qty,
            args.key,
            args.ref_key,
            args.sending_time,
            args.side,
            args.position_no,
            args.settl_date,
            args.originator,
        ));

        let insert_at = vec
            .iter()
            .position(|q| {
                if is_bid {
                    q.price < quote.price || (q.price == quote.price && q.volume < quote.volume)
                } else {
                    q.price > quote.price || (q.price == quote.price && q.volume < quote.volume)
                }
            })
            .unwrap_or(vec.len());
        vec.insert(insert_at, quote.clone());
        drop(vec);

        *self.last_quote.write().unwrap() = Some(quote);
    }

    pub fn get_best_price(&self, cp: &CurrencyPair, is_bid: bool) -> Option<i64> {
        self.get_best_quote(cp, is_bid, |_| true).map(|q| q.price)
    }

    pub fn get_best_quote(
        &self,
        cp: &CurrencyPair,
        is_bid: bool,
        accept: impl Fn(&Quote) -> bool,
    ) -> Option<Arc<Quote>> {
        let Some(book) = self.books.read().unwrap().get(cp).cloned() else {
            return None;
        };
        let vec = book.side(is_bid).read().unwrap();
        vec.iter()
            .find(|q| q.price != 0 && accept(q))
            .cloned()
    }

    pub fn get_best_prices(&self, cp: &CurrencyPair) -> (Option<i64>, Option<i64>) {
        (
            self.get_best_price(cp, true),
            self.get_best_price(cp, false),
        )
    }

    pub fn mid_price(&self, cp: &CurrencyPair) -> i64 {
        match self.get_best_prices(cp) {
            (Some(bid), Some(ask)) => (bid + ask) / 2,
            _ => 0,
        }
    }

    /// Groups consecutive equal-price quotes and invokes `action(level,
    /// group)` for each. `quote_pred`, if given, filters individual quotes;
    /// a group left empty by the filter is skipped and does not advance
    /// the level counter. Stops early if `action` returns `false`.
    pub fn iterate_quote_groups(
        &self,
        cp: &CurrencyPair,
        is_bid: bool,
        quote_pred: Option<&dyn Fn(&Quote) -> bool>,
        mut action: impl FnMut(u32, &QuoteGroup) -> bool,
    ) {
        let Some(book) = self.books.read().unwrap().get(cp).cloned() else {
            return;
        };
        let vec = book.side(is_bid).read().unwrap();

        let mut level = 0u32;
        let mut i = 0usize;
        while i < vec.len() {
            let price = vec[i].price;
            let mut j = i;
            let group = QuoteGroup::new();
            let mut any = false;
            while j < vec.len() && vec[j].price == price {
                let q = &vec[j];
                if quote_pred.is_none_or(|p| p(q)) {
                    group.add_quote(q.clone());
                    any = true;
                }
                j += 1;
            }
            i = j;
            if !any {
                continue;
            }
            level += 1;
            if !action(level, &group) {
                break;
            }
        }
    }

    /// `n == 0` means unlimited.
    pub fn get_levels(&self, cp: &CurrencyPair, is_bid: bool, n: u32) -> Vec<QuoteGroup> {
        let mut out = Vec::new();
        self.iterate_quote_groups(cp, is_bid, None, |_level, group| {
            let g = QuoteGroup::new();
            g.add_quotes(group.get_quotes());
            out.push(g);
            n == 0 || (out.len() as u32) < n
        });
        out
    }

    /// Invalidates every quote in the book and drops all state.
    pub fn clear(&self, now: i64) {
        let mut books = self.books.write().unwrap();
        for side in books.values() {
            for v in [side.bid.write().unwrap(), side.ask.write().unwrap()] {
                for q in v.iter() {
                    q.set_invalid(now);
                }
            }
        }
        METRICS.book_pairs_active.fetch_sub(books.len(), Ordering::Relaxed);
        books.clear();
        *self.last_quote.write().unwrap() = None;
    }

    /// Removes and invalidates quotes older than `max_age_ns`, for the
    /// given `(cp, side)`. Driven externally on a configured cadence.
    pub fn cleanup_quote_vec(&self, cp: &CurrencyPair, is_bid: bool, max_age_ns: i64, now: i64) {
        let Some(book) = self.books.read().unwrap().get(cp).cloned() else {
            return;
        };
        let mut vec = book.side(is_bid).write().unwrap();
        vec.retain(|q| {
            let stale = q.age_since_send_ns(now) > max_age_ns;
            if stale {
                q.set_invalid(now);
            }
            !stale
        });
        drop(vec);
        self.last_cleanup
            .write()
            .unwrap()
            .insert((cp.clone(), is_bid), now);
    }

    pub fn last_cleanup(&self, cp: &CurrencyPair, is_bid: bool) -> Option<i64> {
        self.last_cleanup
            .read()
            .unwrap()
            .get(&(cp.clone(), is_bid))
            .copied()
    }

    pub fn last_quote(&self) -> Option<Arc<Quote>> {
        self.last_quote.read().unwrap().clone()
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

pub const ATTR_BATCHSIZE: usize = 1;
pub const ATTR_CLEANUP_INTERVAL_SECS: u64 = 10;
pub const ATTR_MAX_QUOTE_COUNT: usize = 10;
pub const ATTR_MAX_QUOTE_AGE_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    fn args(key: i64, ref_key: i64, price: i64, volume: i64, side: QuoteType) -> NewQuoteArgs {
        NewQuoteArgs {
            key,
            ref_key,
            adpt_receive_time: 0,
            receipt_time: 0,
            sort_time: 0,
            quote_id: String::new(),
            seqnum: 0,
            price,
            volume,
            min_qty: 0,
            sending_time: 0,
            side,
            position_no: 0,
            settl_date: 0,
            originator: String::new(),
        }
    }

    #[test]
    fn sorts_bid_descending_price_then_volume() {
        let book = OrderBook::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        book.add_entry(&cp, UpdateType::New, args(1, 1, 120_000, 100, QuoteType::Bid), 0);
        book.add_entry(&cp, UpdateType::New, args(2, 2, 120_000, 200, QuoteType::Bid), 0);
        book.add_entry(&cp, UpdateType::New, args(3, 3, 130_000, 50, QuoteType::Bid), 0);

        let levels = book.get_levels(&cp, true, 0);
        let prices: Vec<i64> = levels.iter().map(|g| g.single_price().unwrap()).collect();
        assert_eq!(prices, vec![130_000, 120_000]);
        let top = levels[0].get_quotes();
        assert_eq!(top[0].volume, 50);
        let second = levels[1].get_quotes();
        assert_eq!(second[0].volume, 200);
        assert_eq!(second[1].volume, 100);
    }

    #[test]
    fn update_then_delete_empties_level() {
        let book = OrderBook::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        book.add_entry(&cp, UpdateType::New, args(1, 1, 100, 10, QuoteType::Bid), 0);
        book.add_entry(&cp, UpdateType::Delete, args(2, 1, 100, 0, QuoteType::Bid), 0);
        assert!(book.get_best_price(&cp, true).is_none());
    }

    #[test]
    fn unmatched_ref_key_is_non_fatal() {
        let book = OrderBook::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        book.add_entry(&cp, UpdateType::Update, args(1, 999, 100, 10, QuoteType::Bid), 0);
        assert!(book.get_best_price(&cp, true).is_none());
    }

    #[test]
    fn mid_price_is_average_of_best_bid_ask() {
        let book = OrderBook::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        book.add_entry(&cp, UpdateType::New, args(1, 1, 100, 10, QuoteType::Bid), 0);
        book.add_entry(&cp, UpdateType::New, args(2, 2, 200, 10, QuoteType::Offer), 0);
        assert_eq!(book.mid_price(&cp), 150);
    }
}
