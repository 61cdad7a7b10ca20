//! Order execution layer: validated, sized, fee-aware order placement,
//! cancellation sweeps, and the durable ledger of orders this agent owns.

mod executor;
mod owned;
mod result;

pub use executor::{CancelSweep, ExecutorConfig, OrderExecutor};
pub use owned::{OwnedOrder, OwnedOrderLedger, OwnedStatus};
pub use result::{OrderResult, OrderStatus};
