// =============================================================================
// Market-data task — provider fan-in for ticks and candles
// =============================================================================
//
// Single writer for `latest_tick`, the candle buffer, and the data-freshness
// stamp. Events are observed in the provider's own order. Ticks with
// `last <= 0` are discarded here and never reach the broker or the strategy.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{ExecutionRequest, Session, MAX_CANDLE_BUFFER};
use crate::types::{Candle, MarketEvent, Tick};

pub async fn market_data_task(session: Arc<Session>) -> Result<()> {
    let mut stream = session.provider.listen().await?;
    info!("market data stream connected");

    loop {
        tokio::select! {
            _ = session.shutdown.wait() => break,
            event = stream.next() => match event {
                Some(MarketEvent::Tick(tick)) => handle_tick(&session, tick),
                Some(MarketEvent::Candle(candle)) => handle_candle(&session, candle).await?,
                None => {
                    info!("market data stream ended");
                    break;
                }
            },
        }
    }
    Ok(())
}

fn handle_tick(session: &Session, tick: Tick) {
    if tick.last <= 0.0 {
        debug!(last = tick.last, "invalid tick discarded");
        return;
    }
    *session.latest_tick.write() = Some(tick);
    session.touch_data();
}

async fn handle_candle(session: &Arc<Session>, candle: Candle) -> Result<()> {
    {
        let mut candles = session.candles.write();
        candles.push_back(candle.clone());
        while candles.len() > MAX_CANDLE_BUFFER {
            candles.pop_front();
        }
    }
    session.touch_data();
    session.iterations.fetch_add(1, Ordering::Relaxed);

    // Strategy callback: synchronous, over a snapshot of the buffer.
    let snapshot = session.candles_snapshot();
    let tick = session.latest_tick();
    let order = session.strategy.on_candle(&snapshot, tick.as_ref());

    if let Some(order) = order {
        if order.go {
            debug!(
                client_order_id = %order.client_order_id,
                side = %order.side,
                qty = order.qty,
                "order enqueued for execution"
            );
            session
                .execution_tx
                .send(ExecutionRequest {
                    order,
                    candle,
                    latency_ms: session.config.execution_latency_ms,
                })
                .await
                .ok();
        }
    }
    Ok(())
}
