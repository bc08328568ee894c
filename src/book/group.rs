//! `QuoteGroup`: all quotes at one price level on one side of one
//! instrument, with lazily-computed aggregate statistics cached until the
//! next mutation.

use std::sync::{Arc, Mutex, RwLock};

use super::quote::Quote;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateValues {
    pub min_price: i64,
    pub max_price: i64,
    pub avg_price: f64,
    pub max_volume: i64,
    pub total_volume: i64,
    pub min_qty: i64,
}

pub struct QuoteGroup {
    quotes: RwLock<Vec<Arc<Quote>>>,
    agg_all: Mutex<Option<AggregateValues>>,
    agg_unused: Mutex<Option<AggregateValues>>,
}

impl QuoteGroup {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(Vec::new()),
            agg_all: Mutex::new(None),
            agg_unused: Mutex::new(None),
        }
    }

    pub fn add_quote(&self, q: Arc<Quote>) {
        self.quotes.write().unwrap().push(q);
        self.invalidate_aggregate_values();
    }

    pub fn add_quotes(&self, qs: impl IntoIterator<Item = Arc<Quote>>) {
        self.quotes.write().unwrap().extend(qs);
        self.invalidate_aggregate_values();
    }

    pub fn remove_quote(&self, key: i64) -> Option<Arc<Quote>> {
        let mut quotes = self.quotes.write().unwrap();
        let idx = quotes.iter().position(|q| q.key == key)?;
        let removed = quotes.remove(idx);
        drop(quotes);
        self.invalidate_aggregate_values();
        Some(removed)
    }

    pub fn get_quotes(&self) -> Vec<Arc<Quote>> {
        self.quotes.read().unwrap().clone()
    }

    pub fn for_each_quote(&self, mut f: impl FnMut(&Arc<Quote>)) {
        for q in self.quotes.read().unwrap().iter() {
            f(q);
        }
    }

    pub fn find_first_quote(&self, pred: impl Fn(&Quote) -> bool) -> Option<Arc<Quote>> {
        self.quotes
            .read()
            .unwrap()
            .iter()
            .find(|q| pred(q))
            .cloned()
    }

    /// `Some(price)` iff the group is non-empty and every quote shares one
    /// price (the common case: one `QuoteGroup` == one price level).
    pub fn single_price(&self) -> Option<i64> {
        let quotes = self.quotes.read().unwrap();
        let first = quotes.first()?.price;
        quotes.iter().all(|q| q.price == first).then_some(first)
    }

    pub fn has_quotes(&self) -> bool {
        !self.quotes.read().unwrap().is_empty()
    }

    pub fn quote_count(&self) -> usize {
        self.quotes.read().unwrap().len()
    }

    pub fn invalidate_aggregate_values(&self) {
        *self.agg_all.lock().unwrap() = None;
        *self.agg_unused.lock().unwrap() = None;
    }

    fn compute(&self, unused_only: bool) -> AggregateValues {
        let quotes = self.quotes.read().unwrap();
        let mut agg = AggregateValues::default();
        let mut first = true;
        let mut price_sum = 0i64;
        let mut n = 0i64;
        for q in quotes.iter() {
            if unused_only && q.used() {
                continue;
            }
            if first {
                agg.min_price = q.price;
                agg.max_price = q.price;
                agg.min_qty = q.min_qty;
                first = false;
            } else {
                agg.min_price = agg.min_price.min(q.price);
                agg.max_price = agg.max_price.max(q.price);
                agg.min_qty = agg.min_qty.min(q.min_qty);
            }
            agg.max_volume = agg.max_volume.max(q.volume);
            agg.total_volume += q.volume;
            price_sum += q.price;
            n += 1;
        }
        if n > 0 {
            agg.avg_price = price_sum as f64 / n as f64;
        }
        agg
    }

    fn aggregate(&self, unused_only: bool) -> AggregateValues {
        let cell = if unused_only {
            &self.agg_unused
        } else {
            &self.agg_all
        };
        let mut guard = cell.lock().unwrap();
        if let Some(v) = *guard {
            return v;
        }
        let computed = self.compute(unused_only);
        *guard = Some(computed);
        computed
    }

    pub fn min_price(&self, unused_only: bool) -> i64 {
        self.aggregate(unused_only).min_price
    }

    pub fn max_price(&self, unused_only: bool) -> i64 {
        self.aggregate(unused_only).max_price
    }

    pub fn avg_price(&self, unused_only: bool) -> f64 {
        self.aggregate(unused_only).avg_price
    }

    pub fn max_volume(&self, unused_only: bool) -> i64 {
        self.aggregate(unused_only).max_volume
    }

    pub fn total_volume(&self, unused_only: bool) -> i64 {
        self.aggregate(unused_only).total_volume
    }

    pub fn min_qty(&self, unused_only: bool) -> i64 {
        self.aggregate(unused_only).min_qty
    }

    /// Average price over the first `n` quotes in level order (used by
    /// `AggregateVolume` merging to report a representative price for a
    /// synthetic multi-level group).
    pub fn partial_avg_price(&self, n: usize) -> f64 {
        let quotes = self.quotes.read().unwrap();
        let take = quotes.iter().take(n);
        let (sum, count) = take.fold((0i64, 0i64), |(s, c), q| (s + q.price, c + 1));
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

impl Default for QuoteGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuoteType;

    fn quote(price: i64, volume: i64) -> Arc<Quote> {
        Arc::new(Quote::new(
            0,
            0,
            0,
            String::new(),
            0,
            price,
            volume,
            0,
            0,
            0,
            0,
            QuoteType::Bid,
            0,
            0,
            String::new(),
        ))
    }

    #[test]
    fn aggregate_values_recompute_after_mutation() {
        let group = QuoteGroup::new();
        group.add_quote(quote(100, 10));
        group.add_quote(quote(100, 20));
        assert_eq!(group.total_volume(false), 30);
        assert_eq!(group.max_volume(false), 20);

        group.add_quote(quote(100, 5));
        assert_eq!(group.total_volume(false), 35);
    }

    #[test]
    fn single_price_detects_mixed_levels() {
        let group = QuoteGroup::new();
        group.add_quote(quote(100, 10));
        assert_eq!(group.single_price(), Some(100));
        group.add_quote(quote(101, 10));
        assert_eq!(group.single_price(), None);
    }
}
