// =============================================================================
// Strategy seam — the engine consumes orders, it does not compute signals
// =============================================================================

use crate::types::{Candle, Order, Tick};

/// Signal pipeline boundary. Called synchronously by the market-data task on
/// every closed candle with the buffered history and the latest valid tick.
/// Returning `Some(order)` with `go == true` enqueues the order for
/// execution; anything else is a no-trade decision.
pub trait Strategy: Send + Sync {
    fn on_candle(&self, candles: &[Candle], latest_tick: Option<&Tick>) -> Option<Order>;
}

/// Strategy that never trades. Used when the session is run for data
/// collection or supervision only.
pub struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn on_candle(&self, _candles: &[Candle], _latest_tick: Option<&Tick>) -> Option<Order> {
        None
    }
}
