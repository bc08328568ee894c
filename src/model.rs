//! The wire-agnostic normalized data model: one `NormalizedMDData` is
//! produced per decoded venue message, independent of which exchange sent
//! it.

use std::ops::Not;

use crate::currency::CurrencyPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteType {
    Bid,
    Offer,
    Invalid,
}

impl Not for QuoteType {
    type Output = QuoteType;
    fn not(self) -> QuoteType {
        match self {
            QuoteType::Bid => QuoteType::Offer,
            QuoteType::Offer => QuoteType::Bid,
            QuoteType::Invalid => QuoteType::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Snapshot,
    New,
    Update,
    Delete,
}

/// One level of one instrument, as decoded directly off the wire before
/// reconciliation against the `ActiveQuoteTable`.
#[derive(Debug, Clone)]
pub struct MdEntry {
    pub id: String,
    pub ref_id: String,
    pub quote_id: String,
    pub update_type: UpdateType,
    pub position_no: u32,
    pub entry_type: QuoteType,
    pub instrument: CurrencyPair,
    /// The venue's own textual price representation, preserved verbatim.
    pub price: String,
    pub volume: f64,
    pub min_qty: f64,
    pub adpt_receive_time: i64,
    pub sequence_tag: u64,
    pub end_of_message: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedMDData {
    pub md_req_id: Option<String>,
    pub entries: Vec<MdEntry>,
}

impl NormalizedMDData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the last entry (if any) as `end_of_message`.
    pub fn finish(mut self) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.end_of_message = true;
        }
        self
    }
}
