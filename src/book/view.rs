//! `BookView`/`FilterView`: a composable read-only overlay over the
//! `OrderBook`, driving a chain of `Filter`s level by level.

use crate::currency::CurrencyPair;

use super::filter::Filter;
use super::group::QuoteGroup;
use super::order_book::OrderBook;

/// A single-side, single-instrument read handle onto an `OrderBook`.
pub struct BookView<'a> {
    book: &'a OrderBook,
    cp: CurrencyPair,
    is_bid: bool,
}

impl<'a> BookView<'a> {
    pub fn new(book: &'a OrderBook, cp: CurrencyPair, is_bid: bool) -> Self {
        Self { book, cp, is_bid }
    }

    pub fn for_each_level(&self, action: impl FnMut(u32, &QuoteGroup) -> bool) {
        self.book.iterate_quote_groups(&self.cp, self.is_bid, None, action);
    }
}

/// Runs a chain of predicates over a `BookView`: each level's group is fed
/// through the filters in order; a level reaches the caller's `action`
/// only if every filter in the chain accepted it. The walk stops when the
/// caller's continuation returns `false` or any filter signals `last`.
pub struct FilterView<'a> {
    view: BookView<'a>,
    filters: Vec<Filter>,
}

impl<'a> FilterView<'a> {
    pub fn new(view: BookView<'a>, filters: Vec<Filter>) -> Self {
        Self { view, filters }
    }

    pub fn run(&self, mut action: impl FnMut(u32, &QuoteGroup) -> bool) {
        let mut stop = false;
        self.view.for_each_level(|level, group| {
            if stop {
                return false;
            }

            let mut current = QuoteGroup::new();
            current.add_quotes(group.get_quotes());

            let mut emit = true;
            for filter in &self.filters {
                let (result, dst) = filter.apply(level, &current);
                if result.last {
                    stop = true;
                }
                if !result.accept {
                    emit = false;
                    break;
                }
                current = dst;
            }

            if emit && !current.get_quotes().is_empty() && !action(level, &current) {
                stop = true;
            }

            !stop
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QuoteType, UpdateType};
    use crate::book::order_book::NewQuoteArgs;

    fn args(key: i64, price: i64, volume: i64) -> NewQuoteArgs {
        NewQuoteArgs {
            key,
            ref_key: key,
            adpt_receive_time: 0,
            receipt_time: 0,
            sort_time: 0,
            quote_id: String::new(),
            seqnum: 0,
            price,
            volume,
            min_qty: 0,
            sending_time: 0,
            side: QuoteType::Bid,
            position_no: 0,
            settl_date: 0,
            originator: String::new(),
        }
    }

    #[test]
    fn level_filter_stops_walk_at_threshold() {
        let book = OrderBook::new();
        let cp = CurrencyPair::parse("BTC/USDT").unwrap();
        for (i, price) in [50_000, 49_000, 48_000, 47_000, 46_000].into_iter().enumerate() {
            book.add_entry(&cp, UpdateType::New, args(i as i64 + 1, price, 1), 0);
        }

        let view = BookView::new(&book, cp, true);
        let filters = vec![Filter::parse("Level LE 3").unwrap()];
        let fv = FilterView::new(view, filters);

        let mut seen = Vec::new();
        fv.run(|level, _group| {
            seen.push(level);
            true
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
