//! Text predicates over `QuoteGroup`s: `field OP value`.
//!
//! `Level`/`LevelVolume`/`AggregateVolume` are evaluated against the whole
//! group; everything else is evaluated per-quote and the matching subset
//! becomes the destination group. `AggregateVolume` is the one stateful
//! predicate: it accumulates groups across consecutive calls until the
//! requested volume threshold is reached.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{GatewayError, Result};

use super::group::QuoteGroup;
use super::quote::{Field, FieldBaseType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Ni,
}

impl Op {
    fn from_str(s: &str) -> Option<Op> {
        match s.to_ascii_uppercase().as_str() {
            "EQ" | "==" => Some(Op::Eq),
            "NE" | "!=" => Some(Op::Ne),
            "LT" | "<" => Some(Op::Lt),
            "LE" | "<=" => Some(Op::Le),
            "GT" | ">" => Some(Op::Gt),
            "GE" | ">=" => Some(Op::Ge),
            "IN" => Some(Op::In),
            "NI" => Some(Op::Ni),
            _ => None,
        }
    }

    fn compare_i64(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::In | Op::Ni => lhs == rhs,
        }
    }

    fn compare_str(self, lhs: &str, rhs: &str) -> bool {
        match self {
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::In | Op::Ni => lhs == rhs,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Set(Vec<String>),
}

static PREDICATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(\w+)\s+(EQ|NE|LT|LE|GT|GE|IN|NI|==|!=|<=|>=|<|>)\s+(.+?)\s*$"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterResult {
    pub accept: bool,
    pub open: bool,
    pub last: bool,
}

struct AggState {
    accumulated_volume: i64,
    group: QuoteGroup,
}

pub struct Filter {
    field: Field,
    op: Op,
    value: Value,
    agg_state: Mutex<AggState>,
}

impl Filter {
    pub fn parse(predicate: &str) -> Result<Self> {
        let caps = PREDICATE_RE
            .captures(predicate)
            .ok_or_else(|| GatewayError::InvalidArgument(format!("malformed predicate: {predicate}")))?;

        let field = Field::from_name(&caps[1]);
        if field == Field::None {
            return Err(GatewayError::InvalidArgument(format!(
                "unknown field: {}",
                &caps[1]
            )));
        }

        let op = Op::from_str(&caps[2])
            .ok_or_else(|| GatewayError::InvalidArgument(format!("unknown operator: {}", &caps[2])))?;

        let raw_value = caps[3].trim();
        let value = if let Some(inner) = raw_value.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Value::Set(
                inner
                    .split(',')
                    .map(|s| s.trim().trim_matches('"').to_string())
                    .collect(),
            )
        } else if let Some(inner) = raw_value.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            Value::Str(inner.to_string())
        } else {
            match raw_value.parse::<i64>() {
                Ok(n) => Value::Int(n),
                Err(_) => Value::Str(raw_value.to_string()),
            }
        };

        Ok(Self {
            field,
            op,
            value,
            agg_state: Mutex::new(AggState {
                accumulated_volume: 0,
                group: QuoteGroup::new(),
            }),
        })
    }

    fn value_as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    fn matches_set(&self, candidate_i64: Option<i64>, candidate_str: Option<&str>) -> bool {
        let Value::Set(items) = &self.value else {
            return false;
        };
        let hit = items.iter().any(|item| {
            if let Some(c) = candidate_i64 {
                item.parse::<i64>().map(|n| n == c).unwrap_or(false)
            } else if let Some(c) = candidate_str {
                item == c
            } else {
                false
            }
        });
        match self.op {
            Op::In => hit,
            Op::Ni => !hit,
            _ => false,
        }
    }

    /// Evaluates this predicate against one source level group, producing
    /// a destination group (the emitted/matched quotes) and the
    /// accept/open/last flags described in the module doc.
    pub fn apply(&self, level: u32, src: &QuoteGroup) -> (FilterResult, QuoteGroup) {
        match self.field {
            Field::Level => self.apply_level(level, src),
            Field::LevelVolume => self.apply_level_volume(src),
            Field::AggregateVolume => self.apply_aggregate_volume(src),
            _ => self.apply_per_quote(src),
        }
    }

    fn apply_level(&self, level: u32, src: &QuoteGroup) -> (FilterResult, QuoteGroup) {
        let target = self.value_as_i64().unwrap_or(0);
        let accept = self.op.compare_i64(level as i64, target);
        let last = match self.op {
            Op::Eq => accept,
            Op::Le | Op::Lt => !accept,
            _ => false,
        };
        let dst = QuoteGroup::new();
        if accept {
            dst.add_quotes(src.get_quotes());
        }
        (
            FilterResult {
                accept,
                open: false,
                last,
            },
            dst,
        )
    }

    fn apply_level_volume(&self, src: &QuoteGroup) -> (FilterResult, QuoteGroup) {
        let target = self.value_as_i64().unwrap_or(0);
        let accept = self.op.compare_i64(src.total_volume(false), target);
        let dst = QuoteGroup::new();
        if accept {
            dst.add_quotes(src.get_quotes());
        }
        (
            FilterResult {
                accept,
                open: false,
                last: false,
            },
            dst,
        )
    }

    /// Merges `src` into the running destination group kept in `agg_state`
    /// and reports `accept` only once the accumulated volume across all
    /// merged levels reaches the threshold. The merged group (not just the
    /// current level's quotes) is emitted and the accumulator resets.
    fn apply_aggregate_volume(&self, src: &QuoteGroup) -> (FilterResult, QuoteGroup) {
        let target = self.value_as_i64().unwrap_or(0);
        let mut state = self.agg_state.lock().unwrap();
        state.accumulated_volume += src.total_volume(false);
        state.group.add_quotes(src.get_quotes());
        let reached = state.accumulated_volume >= target;

        let dst = QuoteGroup::new();
        if reached {
            dst.add_quotes(state.group.get_quotes());
            state.accumulated_volume = 0;
            state.group = QuoteGroup::new();
        }
        (
            FilterResult {
                accept: reached,
                open: !reached,
                last: false,
            },
            dst,
        )
    }

    fn apply_per_quote(&self, src: &QuoteGroup) -> (FilterResult, QuoteGroup) {
        // Fast path: a uniform-price group can be decided once against the
        // group's average (== single) price instead of per quote.
        if self.field == Field::Price {
            if let Some(price) = src.single_price() {
                let accept = self.eval_i64(price);
                let dst = QuoteGroup::new();
                if accept {
                    dst.add_quotes(src.get_quotes());
                }
                return (
                    FilterResult {
                        accept,
                        open: false,
                        last: false,
                    },
                    dst,
                );
            }
        }

        let dst = QuoteGroup::new();
        for q in src.get_quotes() {
            let matched = match self.field.base_type() {
                FieldBaseType::Int64 => q.field_i64(self.field).map(|v| self.eval_i64(v)).unwrap_or(false),
                FieldBaseType::String => q
                    .field_str(self.field)
                    .map(|v| self.eval_str(v))
                    .unwrap_or(false),
                FieldBaseType::None => false,
            };
            if matched {
                dst.add_quote(q);
            }
        }
        let accept = dst.has_quotes();
        (
            FilterResult {
                accept,
                open: false,
                last: false,
            },
            dst,
        )
    }

    fn eval_i64(&self, candidate: i64) -> bool {
        match self.op {
            Op::In | Op::Ni => self.matches_set(Some(candidate), None),
            _ => match self.value_as_i64() {
                Some(target) => self.op.compare_i64(candidate, target),
                None => false,
            },
        }
    }

    fn eval_str(&self, candidate: &str) -> bool {
        match self.op {
            Op::In | Op::Ni => self.matches_set(None, Some(candidate)),
            _ => match &self.value {
                Value::Str(target) => self.op.compare_str(candidate, target),
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::quote::Quote;
    use crate::model::QuoteType;
    use std::sync::Arc;

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
    fn parses_symbolic_and_word_operators() {
        let f1 = Filter::parse("Level <= 3").unwrap();
        assert_eq!(f1.op, Op::Le);
        let f2 = Filter::parse("Price GT 100").unwrap();
        assert_eq!(f2.op, Op::Gt);
    }

    #[test]
    fn level_le_stops_after_threshold() {
        let f = Filter::parse("Level LE 3").unwrap();
        let g = QuoteGroup::new();
        let (r3, _) = f.apply(3, &g);
        assert!(r3.accept && !r3.last);
        let (r4, _) = f.apply(4, &g);
        assert!(!r4.accept && r4.last);
    }

    #[test]
    fn aggregate_volume_accumulates_until_threshold() {
        let f = Filter::parse("AggregateVolume GE 30").unwrap();
        let g1 = QuoteGroup::new();
        g1.add_quote(quote(100, 10));
        let (r1, dst1) = f.apply(1, &g1);
        assert!(r1.open && !r1.accept);
        assert_eq!(dst1.quote_count(), 0);

        let g2 = QuoteGroup::new();
        g2.add_quote(quote(99, 25));
        let (r2, dst2) = f.apply(2, &g2);
        assert!(r2.accept && !r2.open);
        assert_eq!(dst2.quote_count(), 2, "merged group must carry quotes from both levels, not just the last");
    }

    #[test]
    fn price_fast_path_skips_per_quote_scan_on_uniform_group() {
        let f = Filter::parse("Price EQ 100").unwrap();
        let g = QuoteGroup::new();
        g.add_quote(quote(100, 1));
        g.add_quote(quote(100, 2));
        let (result, dst) = f.apply(1, &g);
        assert!(result.accept);
        assert_eq!(dst.quote_count(), 2);
    }
}
