//! Trigger evaluation runtime for an automated perpetuals agent.
//!
//! The runtime owns a table of triggers (price levels, indicator
//! conditions, composites, schedules, realtime events) and the position
//! ledger, evaluates triggers on an adaptive cadence, and invokes the
//! registered callbacks on rising edges. Realtime data reaches it
//! through the stream wiring; everything else arrives on its event
//! queue.

pub mod runtime;
pub mod safety;
pub mod status;
pub mod trigger;
pub mod wiring;

pub use runtime::{AgentHandle, AgentRuntime, EngineConfig, EngineError, RuntimeEvent};
pub use safety::{SafetyLimits, SafetyVerdict};
pub use status::{LogStatusSink, StatusForwarder, StatusSink, StatusUpdate};
pub use trigger::{
    CompositeOp, Condition, EventFilter, PriceCondition, TechnicalCondition, TechnicalShape,
    TriggerCallback, TriggerFire, TriggerId, TriggerKind, TriggerSpec, ValueCondition,
};
pub use wiring::wire_stream;
