//! Budget Ledger — fixed-point cost accounting for a wave
//!
//! Sums token-usage signals and compares the total against a limit and a warn
//! threshold. All arithmetic is on integer millionths so boundaries compare
//! exactly (`4.00` is the warn threshold of `5.00 * 0.8`, not `3.9999…`).

use crate::error::{CoordinationError, CoordinationResult};
use crate::signal::names::{events, SignalPattern};
use crate::signal::types::TokenUsagePayload;
use crate::signal::SignalBus;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use tracing::{debug, warn};

const SCALE: i64 = 1_000_000;
const FRACTION_DIGITS: usize = 6;

/// Monetary amount in millionths of a unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cost(i64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Whole units plus hundredths, e.g. `Cost::from_cents(399)` is `3.99`
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents * (SCALE / 100))
    }

    /// Convert a float once, rounding to the nearest millionth
    pub fn from_f64(value: f64) -> Self {
        Self((value * SCALE as f64).round() as i64)
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    pub fn saturating_add(self, other: Cost) -> Cost {
        Cost(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Cost) -> Cost {
        Cost(self.0.saturating_sub(other.0))
    }

    /// `self * factor`, with the factor itself a fixed-point value
    pub fn scale(self, factor: Cost) -> Cost {
        let product = self.0 as i128 * factor.0 as i128 / SCALE as i128;
        Cost(product.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// `self * n`
    pub fn times(self, n: u64) -> Cost {
        let product = self.0 as i128 * n as i128;
        Cost(product.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Cost of `tokens` at `rate` per million tokens
    pub fn per_million(tokens: u64, rate: Cost) -> Cost {
        let product = tokens as i128 * rate.0 as i128 / 1_000_000;
        Cost(product.clamp(0, i64::MAX as i128) as i64)
    }
}

impl std::ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = self.saturating_add(rhs);
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

impl FromStr for Cost {
    type Err = CoordinationError;

    /// Exact decimal parse; digits past the sixth decimal round half-up
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoordinationError::invocation(format!("invalid amount '{}'", s));
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_micros: i64 = 0;
        for (i, c) in frac.chars().take(FRACTION_DIGITS).enumerate() {
            let digit = c.to_digit(10).unwrap_or(0) as i64;
            frac_micros += digit * 10_i64.pow((FRACTION_DIGITS - 1 - i) as u32);
        }
        if let Some(next) = frac.chars().nth(FRACTION_DIGITS) {
            if next >= '5' {
                frac_micros += 1;
            }
        }

        let micros = whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(frac_micros))
            .ok_or_else(invalid)?;
        Ok(Cost(if negative { -micros } else { micros }))
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u64;
        let frac = format!("{:06}", abs % SCALE as u64);
        let trimmed = frac.trim_end_matches('0');
        let frac = if trimmed.len() < 2 {
            &frac[..2]
        } else {
            trimmed
        };
        write!(f, "{}{}.{}", sign, whole, frac)
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Cost {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CostVisitor;

        impl serde::de::Visitor<'_> for CostVisitor {
            type Value = Cost;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a decimal amount as a number or string")
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Cost, E> {
                Ok(Cost::from_f64(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Cost, E> {
                v.checked_mul(SCALE)
                    .map(Cost)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Cost, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(SCALE))
                    .map(Cost)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Cost, E> {
                v.parse().map_err(|e: CoordinationError| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_any(CostVisitor)
    }
}

/// Ledger verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Warn,
    Exceeded,
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warn => write!(f, "warn"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Per-million-token prices used when a token signal carries no cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRates {
    pub input_per_mtok: Cost,
    pub output_per_mtok: Cost,
}

impl Default for TokenRates {
    fn default() -> Self {
        Self {
            input_per_mtok: Cost::from_cents(300),
            output_per_mtok: Cost::from_cents(1500),
        }
    }
}

/// Limit, warn fraction and token rates as configured for a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub limit: Cost,
    pub warn_fraction: Cost,
    #[serde(default)]
    pub rates: TokenRates,
}

impl BudgetLimits {
    /// Ledger for one wave, built from the bus
    pub fn ledger(&self, bus: &SignalBus, wave: u32) -> BudgetLedger {
        BudgetLedger::from_signals(bus, wave, self.limit, self.warn_fraction, &self.rates)
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            limit: Cost::from_cents(500),
            warn_fraction: Cost::from_micros(800_000),
            rates: TokenRates::default(),
        }
    }
}

/// Serializable view of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub input_cost: Cost,
    pub output_cost: Cost,
    pub total: Cost,
    pub limit: Cost,
    pub warn_threshold: Cost,
    pub status: BudgetStatus,
    pub entries: usize,
}

/// Running `{input_cost, output_cost}` total against a limit
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    limit: Cost,
    warn_fraction: Cost,
    input_cost: Cost,
    output_cost: Cost,
    entries: usize,
}

impl BudgetLedger {
    pub fn new(limit: Cost, warn_fraction: Cost) -> Self {
        Self {
            limit,
            warn_fraction,
            input_cost: Cost::ZERO,
            output_cost: Cost::ZERO,
            entries: 0,
        }
    }

    /// Build a ledger from every `wave-N-tokens` signal.
    ///
    /// Each participant's signal is cumulative for that participant, so the
    /// ledger sums one record per participant.
    pub fn from_signals(
        bus: &SignalBus,
        wave: u32,
        limit: Cost,
        warn_fraction: Cost,
        rates: &TokenRates,
    ) -> Self {
        let mut ledger = Self::new(limit, warn_fraction);
        let Ok(pattern) = SignalPattern::new(events::from_anyone(&events::tokens(wave))) else {
            return ledger;
        };

        for signal in bus.list(&pattern) {
            let Some(usage) = signal.payload_as::<TokenUsagePayload>() else {
                warn!(participant = %signal.participant, wave, "Ignoring malformed token signal");
                continue;
            };
            let (input, output) = match (usage.input_cost, usage.output_cost, usage.cost) {
                (Some(i), Some(o), _) => (i, o),
                (None, None, Some(total)) => (total, Cost::ZERO),
                (i, o, _) => (
                    i.unwrap_or_else(|| Cost::per_million(usage.input_tokens, rates.input_per_mtok)),
                    o.unwrap_or_else(|| {
                        Cost::per_million(usage.output_tokens, rates.output_per_mtok)
                    }),
                ),
            };
            if input.is_negative() || output.is_negative() {
                warn!(participant = %signal.participant, wave, %input, %output, "Ignoring negative token cost");
                continue;
            }
            debug!(participant = %signal.participant, %input, %output, "Token usage recorded");
            ledger.record(input, output);
        }
        ledger
    }

    pub fn record(&mut self, input_cost: Cost, output_cost: Cost) {
        self.input_cost += input_cost;
        self.output_cost += output_cost;
        self.entries += 1;
    }

    pub fn input_cost(&self) -> Cost {
        self.input_cost
    }

    pub fn output_cost(&self) -> Cost {
        self.output_cost
    }

    pub fn total(&self) -> Cost {
        self.input_cost + self.output_cost
    }

    pub fn limit(&self) -> Cost {
        self.limit
    }

    pub fn warn_threshold(&self) -> Cost {
        self.limit.scale(self.warn_fraction)
    }

    pub fn remaining(&self) -> Cost {
        self.limit.saturating_sub(self.total())
    }

    /// `exceeded` iff `total >= limit`; `warn` iff `limit*warn_fraction <= total < limit`
    pub fn status(&self) -> BudgetStatus {
        let total = self.total();
        if total >= self.limit {
            BudgetStatus::Exceeded
        } else if total >= self.warn_threshold() {
            BudgetStatus::Warn
        } else {
            BudgetStatus::Ok
        }
    }

    /// Error if the next gate transition must be blocked
    pub fn ensure_within_limit(&self) -> CoordinationResult<()> {
        if self.status() == BudgetStatus::Exceeded {
            return Err(CoordinationError::BudgetExceeded {
                spent: self.total().to_string(),
                limit: self.limit.to_string(),
            });
        }
        Ok(())
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            input_cost: self.input_cost,
            output_cost: self.output_cost,
            total: self.total(),
            limit: self.limit,
            warn_threshold: self.warn_threshold(),
            status: self.status(),
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MemorySignalStore;

    fn cost(s: &str) -> Cost {
        s.parse().unwrap()
    }

    fn ledger_at(total: &str) -> BudgetLedger {
        let mut ledger = BudgetLedger::new(cost("5.00"), cost("0.8"));
        ledger.record(cost(total), Cost::ZERO);
        ledger
    }

    #[test]
    fn test_status_boundaries_are_exact() {
        assert_eq!(ledger_at("3.99").status(), BudgetStatus::Ok);
        assert_eq!(ledger_at("4.00").status(), BudgetStatus::Warn);
        assert_eq!(ledger_at("4.999999").status(), BudgetStatus::Warn);
        assert_eq!(ledger_at("5.00").status(), BudgetStatus::Exceeded);
    }

    #[test]
    fn test_many_small_records_do_not_drift() {
        let mut ledger = BudgetLedger::new(cost("5.00"), cost("0.8"));
        for _ in 0..40 {
            ledger.record(cost("0.1"), Cost::ZERO);
        }
        assert_eq!(ledger.total(), cost("4.00"));
        assert_eq!(ledger.status(), BudgetStatus::Warn);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(cost("3.99").micros(), 3_990_000);
        assert_eq!(cost(".5").micros(), 500_000);
        assert_eq!(cost("-1.25").micros(), -1_250_000);
        assert_eq!(cost("0.0000015").micros(), 2);
        assert_eq!(cost("4").to_string(), "4.00");
        assert_eq!(cost("0.123").to_string(), "0.123");
        assert!("abc".parse::<Cost>().is_err());
        assert!("1.2.3".parse::<Cost>().is_err());
        assert!("".parse::<Cost>().is_err());
    }

    #[test]
    fn test_deserialize_number_and_string() {
        let from_number: Cost = serde_json::from_str("0.1").unwrap();
        let from_string: Cost = serde_json::from_str("\"0.1\"").unwrap();
        let from_int: Cost = serde_json::from_str("2").unwrap();
        assert_eq!(from_number, cost("0.1"));
        assert_eq!(from_string, cost("0.1"));
        assert_eq!(from_int, cost("2"));
    }

    #[test]
    fn test_ledger_from_token_signals() {
        let bus = SignalBus::new(MemorySignalStore::shared());
        bus.publish(
            "fe-1",
            "wave-1-tokens",
            serde_json::json!({"input_tokens": 1000, "output_tokens": 10, "input_cost": 1.25, "output_cost": "0.75"}),
        )
        .unwrap();
        bus.publish(
            "be-1",
            "wave-1-tokens",
            serde_json::json!({"input_tokens": 1_000_000, "output_tokens": 100_000}),
        )
        .unwrap();
        bus.publish("be-2", "wave-2-tokens", serde_json::json!({"cost": 9})).unwrap();

        let ledger = BudgetLedger::from_signals(
            &bus,
            1,
            cost("10"),
            cost("0.8"),
            &TokenRates::default(),
        );
        // 1.25 + 0.75 + (1M * 3.00/M) + (100k * 15.00/M)
        assert_eq!(ledger.total(), cost("6.50"));
        assert_eq!(ledger.summary().entries, 2);
        assert_eq!(ledger.status(), BudgetStatus::Ok);
    }

    #[test]
    fn test_negative_token_cost_is_ignored() {
        let bus = SignalBus::new(MemorySignalStore::shared());
        bus.publish("fe-1", "wave-1-tokens", serde_json::json!({"cost": "4.50"}))
            .unwrap();
        bus.publish("fe-2", "wave-1-tokens", serde_json::json!({"cost": "-3.00"}))
            .unwrap();
        bus.publish(
            "be-1",
            "wave-1-tokens",
            serde_json::json!({"input_cost": 0.5, "output_cost": -0.25}),
        )
        .unwrap();

        let ledger = BudgetLedger::from_signals(
            &bus,
            1,
            cost("5.00"),
            cost("0.8"),
            &TokenRates::default(),
        );
        assert_eq!(ledger.total(), cost("4.50"));
        assert_eq!(ledger.summary().entries, 1);
        assert_eq!(ledger.status(), BudgetStatus::Warn);
    }

    #[test]
    fn test_ensure_within_limit() {
        assert!(ledger_at("4.50").ensure_within_limit().is_ok());
        let err = ledger_at("5.00").ensure_within_limit().unwrap_err();
        assert!(matches!(err, CoordinationError::BudgetExceeded { .. }));
    }
}
