// =============================================================================
// Rebalance Arbiter — decides whether a symphony executes today
// =============================================================================
//
// Pure decision over (symphony, current positions, calendar date). Dates are
// exchange-local (the scheduler converts before calling). Two policies:
//
//   time-based:  daily always; weekly on Monday; monthly on day 1; quarterly
//                on the first day of Jan/Apr/Jul/Oct; yearly on Jan 1.
//   threshold:   trigger when the largest |current - target| weight deviation
//                across the union of tickers exceeds the corridor; with no
//                positions, always trigger (initial allocation).
//
// A threshold symphony sitting inside its corridor never triggers unless
// `min_rebalance_age_days` is configured and the last execution is older.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use rust_decimal::Decimal;
use tracing::debug;

use crate::types::{Frequency, Position, RebalancePolicy, Symphony, CASH_TICKER};

pub struct Arbiter {
    /// Corridor applied when a threshold symphony carries none (zero or
    /// negative corridors fall back to this).
    pub default_corridor: Decimal,
    /// 0 disables the age override.
    pub min_rebalance_age_days: u32,
}

impl Arbiter {
    pub fn new(default_corridor: Decimal, min_rebalance_age_days: u32) -> Self {
        Self { default_corridor, min_rebalance_age_days }
    }

    /// `(execute, reason)` for one symphony on one date. `targets` are the
    /// most recently recorded target weights, when any exist.
    pub fn should_execute(
        &self,
        symphony: &Symphony,
        positions: &[Position],
        targets: Option<&BTreeMap<String, Decimal>>,
        today: NaiveDate,
    ) -> (bool, String) {
        let decision = match &symphony.policy {
            RebalancePolicy::Frequency(freq) => Self::check_schedule(*freq, today),
            RebalancePolicy::Threshold { corridor } => {
                let corridor = if *corridor > Decimal::ZERO {
                    *corridor
                } else {
                    self.default_corridor
                };
                self.check_threshold(symphony, positions, targets, corridor)
            }
        };

        debug!(
            symphony_id = %symphony.id,
            execute = decision.0,
            reason = %decision.1,
            "arbiter decision"
        );
        decision
    }

    // -------------------------------------------------------------------------
    // Time-based
    // -------------------------------------------------------------------------

    fn check_schedule(freq: Frequency, today: NaiveDate) -> (bool, String) {
        match freq {
            Frequency::Daily => (true, "daily rebalance scheduled".into()),
            Frequency::Weekly => {
                if today.weekday() == Weekday::Mon {
                    (true, "weekly rebalance: Monday".into())
                } else {
                    (false, format!("weekly rebalance waits for Monday (today is {})", today.weekday()))
                }
            }
            Frequency::Monthly => {
                if today.day() == 1 {
                    (true, "monthly rebalance: first of month".into())
                } else {
                    (false, "monthly rebalance waits for the first of the month".into())
                }
            }
            Frequency::Quarterly => {
                if today.day() == 1 && matches!(today.month(), 1 | 4 | 7 | 10) {
                    (true, "quarterly rebalance: quarter start".into())
                } else {
                    (false, "quarterly rebalance waits for a quarter start".into())
                }
            }
            Frequency::Yearly => {
                if today.day() == 1 && today.month() == 1 {
                    (true, "yearly rebalance: January 1".into())
                } else {
                    (false, "yearly rebalance waits for January 1".into())
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Threshold-based
    // -------------------------------------------------------------------------

    fn check_threshold(
        &self,
        symphony: &Symphony,
        positions: &[Position],
        targets: Option<&BTreeMap<String, Decimal>>,
        corridor: Decimal,
    ) -> (bool, String) {
        if positions.is_empty() {
            return (true, "no positions, initial allocation".into());
        }
        let Some(targets) = targets else {
            return (true, "no recorded targets, initial allocation".into());
        };

        let total: Decimal = positions.iter().map(|p| p.market_value()).sum();
        if total <= Decimal::ZERO {
            return (true, "portfolio value is zero, rebalance".into());
        }

        // Union of held and targeted tickers; cash is not a tradable drift.
        let mut tickers: BTreeSet<&str> = positions.iter().map(|p| p.ticker.as_str()).collect();
        tickers.extend(targets.keys().map(|k| k.as_str()));
        tickers.remove(CASH_TICKER);

        let mut max_drift = Decimal::ZERO;
        let mut worst = "";
        for ticker in tickers {
            let current = positions
                .iter()
                .filter(|p| p.ticker == ticker)
                .map(|p| p.market_value())
                .sum::<Decimal>()
                / total;
            let target = targets.get(ticker).copied().unwrap_or(Decimal::ZERO);
            let drift = (current - target).abs();
            if drift > max_drift {
                max_drift = drift;
                worst = ticker;
            }
        }

        if max_drift > corridor {
            return (
                true,
                format!("drift {max_drift:.4} on {worst} exceeds corridor {corridor}"),
            );
        }

        // Inside the corridor. The configurable age override may still force
        // a rebalance of a long-idle symphony.
        if self.min_rebalance_age_days > 0 {
            let stale = match symphony.last_executed_at {
                None => true,
                Some(at) => {
                    let age_days = (Utc::now() - at).num_days();
                    age_days >= self.min_rebalance_age_days as i64
                }
            };
            if stale {
                return (
                    true,
                    format!(
                        "within corridor but older than {} days, rebalancing",
                        self.min_rebalance_age_days
                    ),
                );
            }
        }

        (false, format!("within corridor (max drift {max_drift:.4} <= {corridor})"))
    }
}

impl std::fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbiter")
            .field("default_corridor", &self.default_corridor)
            .field("min_rebalance_age_days", &self.min_rebalance_age_days)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::symphony::parser::parse_str;
    use rust_decimal_macros::dec;

    fn symphony(rebalance_json: &str) -> Symphony {
        let json = format!(
            r#"{{"id": "s1", "step": "root", "name": "n", "rebalance": {rebalance_json},
                "children": [{{"id": "a", "step": "asset", "ticker": "SPY",
                "exchange": "ARCX", "name": "S"}}]}}"#
        );
        Symphony::new("u1", parse_str(&json).unwrap())
    }

    fn position(ticker: &str, qty: Decimal, mark: Decimal) -> Position {
        Position {
            user_id: "u1".into(),
            symphony_id: "s1".into(),
            ticker: ticker.into(),
            qty,
            avg_cost: mark,
            last_mark: mark,
            cost_basis: qty * mark,
            opened_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn arbiter() -> Arbiter {
        Arbiter::new(dec!(0.05), 0)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_always_executes() {
        let s = symphony("\"daily\"");
        for day in 2..=6 {
            let (execute, _) = arbiter().should_execute(&s, &[], None, date(2025, 6, day));
            assert!(execute);
        }
    }

    #[test]
    fn weekly_executes_on_mondays_only() {
        let s = symphony("\"weekly\"");
        // 2025-06-02 is a Monday.
        assert!(arbiter().should_execute(&s, &[], None, date(2025, 6, 2)).0);
        for day in 3..=6 {
            assert!(!arbiter().should_execute(&s, &[], None, date(2025, 6, day)).0);
        }
        assert!(arbiter().should_execute(&s, &[], None, date(2025, 6, 9)).0);
    }

    #[test]
    fn monthly_quarterly_yearly_calendar_rules() {
        let monthly = symphony("\"monthly\"");
        assert!(arbiter().should_execute(&monthly, &[], None, date(2025, 6, 1)).0);
        assert!(!arbiter().should_execute(&monthly, &[], None, date(2025, 6, 15)).0);

        let quarterly = symphony("\"quarterly\"");
        assert!(arbiter().should_execute(&quarterly, &[], None, date(2025, 7, 1)).0);
        assert!(!arbiter().should_execute(&quarterly, &[], None, date(2025, 6, 1)).0);
        assert!(!arbiter().should_execute(&quarterly, &[], None, date(2025, 7, 2)).0);

        let yearly = symphony("\"yearly\"");
        assert!(arbiter().should_execute(&yearly, &[], None, date(2025, 1, 1)).0);
        assert!(!arbiter().should_execute(&yearly, &[], None, date(2025, 7, 1)).0);
    }

    #[test]
    fn threshold_within_corridor_skips() {
        // Current weights {SPY: 0.667, AGG: 0.333}; targets {0.60, 0.40}.
        // Max drift ~0.067 < corridor 0.075 -> skip.
        let s = symphony("{\"corridor-width\": 0.075}");
        let positions = vec![
            position("SPY", dec!(20), dec!(100)),
            position("AGG", dec!(10), dec!(100)),
        ];
        let targets = BTreeMap::from([
            ("SPY".to_string(), dec!(0.60)),
            ("AGG".to_string(), dec!(0.40)),
        ]);

        let (execute, reason) = arbiter().should_execute(&s, &positions, Some(&targets), date(2025, 6, 3));
        assert!(!execute, "unexpected execute: {reason}");
        assert!(reason.contains("within corridor"));
    }

    #[test]
    fn threshold_beyond_corridor_triggers() {
        let s = symphony("{\"corridor-width\": 0.05}");
        let positions = vec![
            position("SPY", dec!(30), dec!(100)),
            position("AGG", dec!(10), dec!(100)),
        ];
        // Current SPY weight 0.75 vs target 0.60 -> drift 0.15.
        let targets = BTreeMap::from([
            ("SPY".to_string(), dec!(0.60)),
            ("AGG".to_string(), dec!(0.40)),
        ]);

        let (execute, reason) = arbiter().should_execute(&s, &positions, Some(&targets), date(2025, 6, 3));
        assert!(execute);
        assert!(reason.contains("exceeds corridor"));
    }

    #[test]
    fn threshold_with_no_positions_always_triggers() {
        let s = symphony("{\"corridor-width\": 0.075}");
        let (execute, reason) = arbiter().should_execute(&s, &[], None, date(2025, 6, 3));
        assert!(execute);
        assert!(reason.contains("initial allocation"));
    }

    #[test]
    fn drift_counts_tickers_missing_from_either_side() {
        let s = symphony("{\"corridor-width\": 0.05}");
        // Held asset absent from targets: its whole weight is drift.
        let positions = vec![position("GLD", dec!(10), dec!(100))];
        let targets = BTreeMap::from([("SPY".to_string(), dec!(1.0))]);

        let (execute, _) = arbiter().should_execute(&s, &positions, Some(&targets), date(2025, 6, 3));
        assert!(execute);
    }

    #[test]
    fn age_override_forces_idle_threshold_symphonies() {
        let mut s = symphony("{\"corridor-width\": 0.075}");
        s.last_executed_at = Some(Utc::now() - chrono::Duration::days(45));

        let positions = vec![
            position("SPY", dec!(20), dec!(100)),
            position("AGG", dec!(10), dec!(100)),
        ];
        let targets = BTreeMap::from([
            ("SPY".to_string(), dec!(0.667)),
            ("AGG".to_string(), dec!(0.333)),
        ]);

        // Default arbiter: skip.
        assert!(!arbiter().should_execute(&s, &positions, Some(&targets), date(2025, 6, 3)).0);

        // With a 30-day age override: execute.
        let aged = Arbiter::new(dec!(0.05), 30);
        let (execute, reason) = aged.should_execute(&s, &positions, Some(&targets), date(2025, 6, 3));
        assert!(execute);
        assert!(reason.contains("older than 30 days"));
    }
}
