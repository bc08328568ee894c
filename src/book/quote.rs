//! `Quote`: the immutable value stored in an `OrderBook` price vector, plus
//! the small set of atomic cells that let a losing writer observe it being
//! superseded without taking a lock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::model::QuoteType;

/// Fields addressable by a filter predicate (spec section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Level,
    LevelVolume,
    AggregateVolume,
    Price,
    Volume,
    MinQuantity,
    Key,
    RefKey,
    SendingTime,
    ReceiptTime,
    QuoteType,
    PositionNo,
    SeqNum,
    QuoteID,
    Session,
    Pb,
    CompID,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldBaseType {
    Int64,
    String,
    None,
}

impl Field {
    pub fn from_name(name: &str) -> Field {
        match name {
            "Level" => Field::Level,
            "LevelVolume" => Field::LevelVolume,
            "AggregateVolume" => Field::AggregateVolume,
            "Price" => Field::Price,
            "Volume" => Field::Volume,
            "MinQuantity" => Field::MinQuantity,
            "Key" => Field::Key,
            "RefKey" => Field::RefKey,
            "SendingTime" => Field::SendingTime,
            "ReceiptTime" => Field::ReceiptTime,
            "QuoteType" => Field::QuoteType,
            "PositionNo" => Field::PositionNo,
            "SeqNum" => Field::SeqNum,
            "QuoteID" => Field::QuoteID,
            "Session" => Field::Session,
            "Pb" => Field::Pb,
            "CompID" => Field::CompID,
            _ => Field::None,
        }
    }

    pub fn base_type(&self) -> FieldBaseType {
        match self {
            Field::Price
            | Field::Volume
            | Field::MinQuantity
            | Field::Key
            | Field::RefKey
            | Field::SendingTime
            | Field::ReceiptTime
            | Field::PositionNo
            | Field::SeqNum
            | Field::Level
            | Field::LevelVolume
            | Field::AggregateVolume => FieldBaseType::Int64,
            Field::QuoteType | Field::QuoteID | Field::Session | Field::Pb | Field::CompID => {
                FieldBaseType::String
            }
            Field::None => FieldBaseType::None,
        }
    }
}

#[derive(Debug)]
pub struct Quote {
    pub adpt_receive_time: i64,
    pub receipt_time: i64,
    pub sort_time: i64,
    pub quote_id: String,
    pub seqnum: i64,
    /// Integer cpips.
    pub price: i64,
    /// Integer sub-units (see `CurrencyPair::qty_to_i64`).
    pub volume: i64,
    pub min_qty: i64,
    pub key: i64,
    pub ref_key: i64,
    pub sending_time: i64,
    pub quote_type: QuoteType,
    pub position_no: u32,
    pub settl_date: i64,
    pub originator: String,
    pub session: String,
    pub pb: String,
    pub comp_id: String,

    used: AtomicBool,
    successor_sent: AtomicI64,
    successor_received: AtomicI64,
}

impl Quote {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adpt_receive_time: i64,
        receipt_time: i64,
        sort_time: i64,
        quote_id: String,
        seqnum: i64,
        price: i64,
        volume: i64,
        min_qty: i64,
        key: i64,
        ref_key: i64,
        sending_time: i64,
        quote_type: QuoteType,
        position_no: u32,
        settl_date: i64,
        originator: String,
    ) -> Self {
        Self {
            adpt_receive_time,
            receipt_time,
            sort_time,
            quote_id,
            seqnum,
            price,
            volume,
            min_qty,
            key,
            ref_key,
            sending_time,
            quote_type,
            position_no,
            settl_date,
            originator,
            session: String::new(),
            pb: String::new(),
            comp_id: String::new(),
            used: AtomicBool::new(false),
            successor_sent: AtomicI64::new(0),
            successor_received: AtomicI64::new(0),
        }
    }

    pub fn valid(&self) -> bool {
        self.successor_sent.load(Ordering::Acquire) == 0
    }

    /// CAS `successor.sent` from 0 to `sent`. Returns true if this call won
    /// the race (i.e. actually invalidated the quote), in which case it also
    /// records `successor.received` at the same instant.
    pub fn set_invalid(&self, sent: i64) -> bool {
        let won = self
            .successor_sent
            .compare_exchange(0, sent, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.record_successor_received(sent);
        }
        won
    }

    /// Only called by the CAS winner, recording when the successor was
    /// observed.
    fn record_successor_received(&self, received: i64) {
        self.successor_received.store(received, Ordering::Release);
    }

    pub fn successor_received(&self) -> i64 {
        self.successor_received.load(Ordering::Acquire)
    }

    pub fn successor_sent(&self) -> i64 {
        self.successor_sent.load(Ordering::Acquire)
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    /// CAS `used` false -> true. Returns true if this call performed the
    /// flip.
    pub fn set_used(&self) -> bool {
        self.used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn age_since_send_ns(&self, now: i64) -> i64 {
        now - self.sending_time
    }

    pub fn age_since_send_ms(&self, now: i64) -> i64 {
        self.age_since_send_ns(now) / 1_000_000
    }

    pub fn age_since_receipt_ns(&self, now: i64) -> i64 {
        now - self.receipt_time
    }

    pub fn age_since_receipt_ms(&self, now: i64) -> i64 {
        self.age_since_receipt_ns(now) / 1_000_000
    }

    pub fn sending_delay_ns(&self) -> i64 {
        self.receipt_time - self.sending_time
    }

    pub fn sort_delay_ns(&self) -> i64 {
        self.sort_time - self.receipt_time
    }

    /// Extracts an integer-typed field for predicate evaluation. Returns
    /// `None` if `field` is not `Int64`-typed.
    pub fn field_i64(&self, field: Field) -> Option<i64> {
        Some(match field {
            Field::Price => self.price,
            Field::Volume => self.volume,
            Field::MinQuantity => self.min_qty,
            Field::Key => self.key,
            Field::RefKey => self.ref_key,
            Field::SendingTime => self.sending_time,
            Field::ReceiptTime => self.receipt_time,
            Field::PositionNo => self.position_no as i64,
            Field::SeqNum => self.seqnum,
            _ => return None,
        })
    }

    /// Extracts a string-typed field for predicate evaluation. Returns
    /// `None` if `field` is not `String`-typed.
    pub fn field_str(&self, field: Field) -> Option<&str> {
        Some(match field {
            Field::QuoteType => match self.quote_type {
                QuoteType::Bid => "Bid",
                QuoteType::Offer => "Offer",
                QuoteType::Invalid => "Invalid",
            },
            Field::QuoteID => self.quote_id.as_str(),
            Field::Session => self.session.as_str(),
            Field::Pb => self.pb.as_str(),
            Field::CompID => self.comp_id.as_str(),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Quote {
        Quote::new(
            0, 0, 0, "q1".into(), 1, 100, 50, 0, 1, 0, 1_000, QuoteType::Bid, 0, 0, "venue".into(),
        )
    }

    #[test]
    fn starts_valid_and_unused() {
        let q = sample();
        assert!(q.valid());
        assert!(!q.used());
    }

    #[test]
    fn set_invalid_is_cas_first_writer_wins() {
        let q = sample();
        assert!(q.set_invalid(10));
        assert!(!q.valid());
        // Second caller loses the race.
        assert!(!q.set_invalid(20));
        assert_eq!(q.successor_sent(), 10);
    }

    #[test]
    fn set_invalid_records_successor_received_only_for_the_winner() {
        let q = sample();
        assert!(q.set_invalid(10));
        assert_eq!(q.successor_received(), 10);
        assert!(!q.set_invalid(20));
        assert_eq!(q.successor_received(), 10);
    }

    #[test]
    fn set_used_flips_once() {
        let q = sample();
        assert!(q.set_used());
        assert!(!q.set_used());
        assert!(q.used());
    }
}
