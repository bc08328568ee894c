pub mod filter;
pub mod group;
pub mod order_book;
pub mod quote;
pub mod view;

pub use filter::{Filter, FilterResult};
pub use group::{AggregateValues, QuoteGroup};
pub use order_book::{NewQuoteArgs, OrderBook};
pub use quote::{Field, FieldBaseType, Quote};
pub use view::{BookView, FilterView};
