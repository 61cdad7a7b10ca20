//! Trigger definitions and edge-detection state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use kestrel_core::{Coin, Interval, Quantity};
use kestrel_indicators::{FieldSelector, IndicatorSpec};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque trigger identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TriggerId(Uuid);

impl TriggerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How an observed value must relate to a level or range.
///
/// `Above`, `Below`, `Between`, and `Outside` hold for as long as the
/// value sits in the region; their edge is the entry into it. The
/// crossing variants are instantaneous: they hold only on the
/// observation that crossed, `Crosses` in either direction and the
/// directional variants in one.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueCondition {
    Above(Decimal),
    Below(Decimal),
    Crosses(Decimal),
    CrossesAbove(Decimal),
    CrossesBelow(Decimal),
    /// Inclusive range.
    Between { low: Decimal, high: Decimal },
    Outside { low: Decimal, high: Decimal },
}

impl ValueCondition {
    /// Crossing conditions hold only at the crossing observation itself.
    #[must_use]
    pub fn is_instantaneous(&self) -> bool {
        matches!(
            self,
            Self::Crosses(_) | Self::CrossesAbove(_) | Self::CrossesBelow(_)
        )
    }
}

/// A condition on the mid price of one coin.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PriceCondition {
    pub coin: Coin,
    pub condition: ValueCondition,
}

/// What a technical trigger computes from the candle window.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum TechnicalShape {
    /// One indicator value against a level or range.
    Level {
        indicator: IndicatorSpec,
        field: FieldSelector,
        condition: ValueCondition,
    },
    /// Fast indicator crossing above the slow one.
    Crossover {
        fast: IndicatorSpec,
        slow: IndicatorSpec,
    },
    /// Fast indicator crossing below the slow one.
    Crossunder {
        fast: IndicatorSpec,
        slow: IndicatorSpec,
    },
}

impl TechnicalShape {
    /// Largest lookback any involved indicator needs.
    #[must_use]
    pub fn max_period(&self) -> usize {
        match self {
            Self::Level { indicator, .. } => indicator.max_period(),
            Self::Crossover { fast, slow } | Self::Crossunder { fast, slow } => {
                fast.max_period().max(slow.max_period())
            }
        }
    }
}

/// A condition on an indicator of one coin and interval.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TechnicalCondition {
    pub coin: Coin,
    pub interval: Interval,
    pub shape: TechnicalShape,
}

/// One leg of a trigger.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Condition {
    Price(PriceCondition),
    Technical(TechnicalCondition),
}

impl Condition {
    #[must_use]
    pub fn coin(&self) -> &str {
        match self {
            Self::Price(c) => &c.coin,
            Self::Technical(c) => &c.coin,
        }
    }
}

/// Combining operator for composite triggers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    /// Every leg must be satisfied.
    All,
    /// Any single leg suffices.
    Any,
}

/// Realtime event classes a trigger can watch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum EventFilter {
    /// Liquidations at or above a size.
    Liquidation { min_size: Quantity },
    /// Public trades, optionally restricted to one coin, at or above a
    /// size.
    LargeTrade {
        coin: Option<Coin>,
        min_size: Quantity,
    },
    /// Every fill of the account's own orders.
    UserFill,
    /// Order book snapshots, optionally restricted to one coin.
    BookUpdate { coin: Option<Coin> },
}

/// What a trigger watches.
#[derive(Clone, Debug)]
pub enum TriggerKind {
    Single(Condition),
    Composite {
        operator: CompositeOp,
        legs: Vec<Condition>,
    },
    Scheduled { every: Duration },
    Event(EventFilter),
}

/// Payload handed to a trigger callback when it fires.
#[derive(Clone, Debug)]
pub struct TriggerFire {
    pub trigger_id: TriggerId,
    pub name: String,
    pub coin: Option<Coin>,
    /// The value that satisfied the condition, when one exists.
    pub observed: Option<Decimal>,
    /// Human-readable account of why the trigger fired.
    pub detail: String,
    pub fired_at: DateTime<Utc>,
}

/// Async callback invoked on fire. Errors are caught and logged per
/// invocation; they never unwind into the evaluation loop.
pub type TriggerCallback =
    Arc<dyn Fn(TriggerFire) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A trigger as registered by the caller.
#[derive(Clone)]
pub struct TriggerSpec {
    pub name: String,
    pub kind: TriggerKind,
    /// Remove the trigger after its first fire.
    pub one_shot: bool,
    pub callback: TriggerCallback,
}

/// Edge-detection state for one condition leg.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegState {
    pub last_value: Option<Decimal>,
    pub last_satisfied: Option<bool>,
}

/// Result of feeding one observation into a leg.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LegOutcome {
    /// The condition holds for the current observation.
    pub satisfied: bool,
    /// The condition transitioned into holding with this observation.
    pub edge: bool,
}

impl LegState {
    /// Feeds an observation through the condition. The first observation
    /// only arms the state; it can never produce an edge.
    pub fn observe(&mut self, condition: &ValueCondition, value: Decimal) -> LegOutcome {
        let satisfied = match *condition {
            ValueCondition::Above(level) => value > level,
            ValueCondition::Below(level) => value < level,
            ValueCondition::Between { low, high } => value >= low && value <= high,
            ValueCondition::Outside { low, high } => value < low || value > high,
            ValueCondition::Crosses(level) => match self.last_value {
                Some(prev) => (prev <= level && value > level) || (prev >= level && value < level),
                None => false,
            },
            ValueCondition::CrossesAbove(level) => {
                matches!(self.last_value, Some(prev) if prev <= level && value > level)
            }
            ValueCondition::CrossesBelow(level) => {
                matches!(self.last_value, Some(prev) if prev >= level && value < level)
            }
        };
        let edge = if condition.is_instantaneous() {
            // The crossing is its own edge; prior-sample checks above
            // already keep the first observation from firing.
            satisfied
        } else {
            matches!(self.last_satisfied, Some(false)) && satisfied
        };
        self.last_value = Some(value);
        self.last_satisfied = Some(satisfied);
        LegOutcome { satisfied, edge }
    }
}

/// Edge state for a composite's combined outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompositeState {
    pub last_satisfied: Option<bool>,
}

impl CompositeState {
    /// Feeds the combined leg satisfaction; fires only on the false-to-true
    /// transition, and never on the first observation.
    pub fn observe(&mut self, satisfied: bool) -> bool {
        let edge = matches!(self.last_satisfied, Some(false)) && satisfied;
        self.last_satisfied = Some(satisfied);
        edge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn first_observation_never_fires() {
        let mut state = LegState::default();
        // Already above the level on arrival.
        let outcome = state.observe(&ValueCondition::Above(dec!(100)), dec!(150));
        assert!(outcome.satisfied);
        assert!(!outcome.edge);
    }

    #[test]
    fn above_fires_once_per_crossing() {
        let mut state = LegState::default();
        let cond = ValueCondition::Above(dec!(100));
        assert!(!state.observe(&cond, dec!(90)).edge);
        assert!(state.observe(&cond, dec!(110)).edge);
        // Still above: satisfied but no new edge.
        let held = state.observe(&cond, dec!(120));
        assert!(held.satisfied);
        assert!(!held.edge);
        // Dip below re-arms.
        assert!(!state.observe(&cond, dec!(95)).edge);
        assert!(state.observe(&cond, dec!(101)).edge);
    }

    #[test]
    fn below_mirrors_above() {
        let mut state = LegState::default();
        let cond = ValueCondition::Below(dec!(100));
        state.observe(&cond, dec!(110));
        assert!(state.observe(&cond, dec!(99)).edge);
        assert!(!state.observe(&cond, dec!(98)).edge);
    }

    #[test]
    fn crosses_fires_both_directions() {
        let mut state = LegState::default();
        let cond = ValueCondition::Crosses(dec!(100));
        state.observe(&cond, dec!(90));
        assert!(state.observe(&cond, dec!(105)).edge);
        assert!(state.observe(&cond, dec!(95)).edge);
        // No crossing between consecutive observations on the same side.
        assert!(!state.observe(&cond, dec!(96)).edge);
    }

    #[test]
    fn directional_crossings_ignore_the_other_direction() {
        let mut up = LegState::default();
        let cond_up = ValueCondition::CrossesAbove(dec!(50));
        up.observe(&cond_up, dec!(60));
        // Falling through the level is not a cross above.
        assert!(!up.observe(&cond_up, dec!(40)).edge);
        assert!(up.observe(&cond_up, dec!(55)).edge);

        let mut down = LegState::default();
        let cond_down = ValueCondition::CrossesBelow(dec!(50));
        down.observe(&cond_down, dec!(40));
        assert!(!down.observe(&cond_down, dec!(60)).edge);
        assert!(down.observe(&cond_down, dec!(45)).edge);
    }

    #[test]
    fn between_is_inclusive_and_edges_on_entry() {
        let mut state = LegState::default();
        let cond = ValueCondition::Between {
            low: dec!(30),
            high: dec!(70),
        };
        state.observe(&cond, dec!(80));
        let entry = state.observe(&cond, dec!(70));
        assert!(entry.satisfied, "bounds are inclusive");
        assert!(entry.edge);
        assert!(!state.observe(&cond, dec!(50)).edge);
    }

    #[test]
    fn outside_edges_on_leaving_the_band() {
        let mut state = LegState::default();
        let cond = ValueCondition::Outside {
            low: dec!(30),
            high: dec!(70),
        };
        state.observe(&cond, dec!(50));
        assert!(state.observe(&cond, dec!(75)).edge);
        assert!(!state.observe(&cond, dec!(80)).edge);
    }

    #[test]
    fn composite_edges_on_combined_transition() {
        let mut state = CompositeState::default();
        assert!(!state.observe(true), "first observation must not fire");
        assert!(!state.observe(true));
        assert!(!state.observe(false));
        assert!(state.observe(true));
        assert!(!state.observe(true));
    }
}
