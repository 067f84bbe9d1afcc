// =============================================================================
// Paper Broker — simulated fills, position state machine, atomic persistence
// =============================================================================
//
// Life-cycle:
//   FLAT -> LONG|SHORT -> FLAT
//
// Working orders (unfilled remainders and untouched limits) are an orthogonal
// queue, filled head-of-line on subsequent candles while volume allows.
//
// Order gating, in this order: kill switch, idempotency, rate limit, notional
// cap, position cap, volume capacity. Fills apply side-adverse slippage and
// maker/taker fees; exits evaluate SL, TP, then trailing stop, with SL
// strictly winning when one bar touches several levels.
//
// Thread-safety: all mutable state sits behind one `parking_lot::Mutex`, so
// each broker call is atomic with respect to the others.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{Broker, Lot, Position, WorkingOrder};
use crate::events::{utc_ts, EventLog};
use crate::safety::{kill_switch_engaged, OrderRateLimiter, MAX_POSITION_SIZE_USD};
use crate::session_config::SessionConfig;
use crate::state_manager::{atomic_write_json, quarantine_corrupt_file};
use crate::types::{
    BrokerError, BrokerEvents, Candle, EntryType, ExitEvent, ExitReason, FillEvent, FundingEvent,
    Order, Side, Tick,
};

/// Share of a bar's volume one market order may absorb.
const VOLUME_CAP_FRACTION: f64 = 0.10;
/// Bounded ring of processed client order ids.
const PROCESSED_IDS_CAPACITY: usize = 500;
/// Bounded ring of journal entries.
const ORDER_HISTORY_CAPACITY: usize = 200;
/// Unrealized profit in R units at which the trailing stop arms.
const TRAIL_ACTIVATION_R: f64 = 0.5;
/// Quantities below this are treated as fully consumed.
const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    pub symbol: String,
    pub starting_balance: f64,
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
    pub slip_bps: f64,
    pub trail_atr_mult: f64,
    pub is_inverse: bool,
    pub max_position_qty: f64,
    pub kill_file: PathBuf,
    /// Where the broker state is persisted; `None` keeps it in memory only.
    pub state_path: Option<PathBuf>,
}

/// Persisted shape of the broker. Everything needed to resume a crashed
/// session: equity, position, working orders, and the idempotency ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BrokerState {
    symbol: String,
    #[serde(default)]
    starting_equity: Option<f64>,
    current_equity: f64,
    #[serde(default)]
    realized_pnl: f64,
    #[serde(default)]
    pos: Option<Position>,
    #[serde(default)]
    working_orders: Vec<WorkingOrder>,
    #[serde(default)]
    processed_order_ids: VecDeque<String>,
    #[serde(default)]
    order_history: VecDeque<Value>,
    /// Runtime index over `processed_order_ids`, rebuilt on load.
    #[serde(skip)]
    processed_set: HashSet<String>,
}

impl BrokerState {
    fn fresh(symbol: &str, starting_balance: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            starting_equity: None,
            current_equity: starting_balance,
            realized_pnl: 0.0,
            pos: None,
            working_orders: Vec::new(),
            processed_order_ids: VecDeque::new(),
            order_history: VecDeque::new(),
            processed_set: HashSet::new(),
        }
    }

    fn record_processed(&mut self, id: &str) {
        if self.processed_set.insert(id.to_string()) {
            self.processed_order_ids.push_back(id.to_string());
            while self.processed_order_ids.len() > PROCESSED_IDS_CAPACITY {
                if let Some(old) = self.processed_order_ids.pop_front() {
                    self.processed_set.remove(&old);
                }
            }
        }
    }

    fn journal(&mut self, entry: Value) {
        self.order_history.push_back(entry);
        while self.order_history.len() > ORDER_HISTORY_CAPACITY {
            self.order_history.pop_front();
        }
    }
}

pub struct PaperBroker {
    config: PaperBrokerConfig,
    state: Mutex<BrokerState>,
    rate_limiter: OrderRateLimiter,
    event_log: Option<Arc<EventLog>>,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig, event_log: Option<Arc<EventLog>>) -> Self {
        let state = Self::load_state(&config);
        Self {
            config,
            state: Mutex::new(state),
            rate_limiter: OrderRateLimiter::default(),
            event_log,
        }
    }

    pub fn from_session_config(config: &SessionConfig, event_log: Option<Arc<EventLog>>) -> Self {
        Self::new(
            PaperBrokerConfig {
                symbol: config.symbol.clone(),
                starting_balance: config.starting_balance,
                maker_fee_bps: config.maker_fee_bps,
                taker_fee_bps: config.taker_fee_bps,
                slip_bps: config.slip_bps,
                trail_atr_mult: config.trail_atr_mult,
                is_inverse: config.is_inverse,
                max_position_qty: config.max_position_qty,
                kill_file: config.kill_file.clone(),
                state_path: Some(config.broker_state_path()),
            },
            event_log,
        )
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn load_state(config: &PaperBrokerConfig) -> BrokerState {
        let Some(path) = &config.state_path else {
            return BrokerState::fresh(&config.symbol, config.starting_balance);
        };
        if !path.exists() {
            return BrokerState::fresh(&config.symbol, config.starting_balance);
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read broker state");
                return BrokerState::fresh(&config.symbol, config.starting_balance);
            }
        };
        match serde_json::from_str::<BrokerState>(&content) {
            Ok(mut state) => {
                state.processed_set = state.processed_order_ids.iter().cloned().collect();
                if let Some(pos) = state.pos.as_mut() {
                    if pos.initial_sl == 0.0 {
                        pos.initial_sl = pos.sl;
                    }
                    if pos.lots.is_empty() && pos.qty > 0.0 {
                        pos.lots.push(Lot {
                            qty: pos.qty,
                            price: pos.entry,
                            fees: pos.entry_fees,
                        });
                    }
                }
                info!(
                    path = %path.display(),
                    equity = state.current_equity,
                    position = state.pos.as_ref().map(|p| p.side.to_string()).unwrap_or_else(|| "FLAT".into()),
                    working_orders = state.working_orders.len(),
                    "broker state recovered"
                );
                state
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "broker state is corrupt");
                quarantine_corrupt_file(path);
                BrokerState::fresh(&config.symbol, config.starting_balance)
            }
        }
    }

    fn persist(&self, state: &BrokerState) {
        if let Some(path) = &self.config.state_path {
            if let Err(e) = atomic_write_json(path, state) {
                error!(path = %path.display(), error = %e, "failed to persist broker state");
            }
        }
    }

    fn append_event(&self, name: &str, payload: Value) {
        if let Some(log) = &self.event_log {
            if let Err(e) = log.append(name, payload) {
                error!(event = name, error = %e, "failed to append broker event");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Order gating + fills
    // -------------------------------------------------------------------------

    fn process_order(
        &self,
        state: &mut BrokerState,
        candle: &Candle,
        order: &Order,
        tick: Option<&Tick>,
        bar_budget: &mut f64,
        events: &mut BrokerEvents,
    ) {
        // 1. Kill switch blocks all new orders.
        if kill_switch_engaged(&self.config.kill_file) {
            warn!(client_order_id = %order.client_order_id, "order blocked by kill switch");
            events.errors.push(BrokerError::KillSwitchActive);
            return;
        }

        // 2. Idempotency.
        if order.client_order_id.is_empty() {
            events.errors.push(BrokerError::MissingOrderId);
            return;
        }
        if state.processed_set.contains(&order.client_order_id) {
            warn!(client_order_id = %order.client_order_id, "duplicate order rejected");
            events
                .errors
                .push(BrokerError::DuplicateOrderId(order.client_order_id.clone()));
            return;
        }

        // 3. Rate limit (sliding one-minute window).
        if let Err(e) = self.rate_limiter.try_acquire() {
            events.errors.push(e);
            return;
        }

        // Reference price: the tick observed after simulated latency when one
        // exists, otherwise the candle close.
        let ref_price = match tick {
            Some(t) if t.last > 0.0 => t.last,
            _ => candle.close,
        };
        if ref_price <= 0.0 || (order.entry_type == EntryType::Limit && order.entry <= 0.0) {
            events.errors.push(BrokerError::InvalidPrice(ref_price.min(order.entry)));
            return;
        }

        // 4. Notional cap.
        let notional = order.qty * ref_price;
        if notional > MAX_POSITION_SIZE_USD {
            warn!(notional, limit = MAX_POSITION_SIZE_USD, "order notional over cap");
            events.errors.push(BrokerError::NotionalCapExceeded {
                notional,
                limit: MAX_POSITION_SIZE_USD,
            });
            return;
        }

        // 5. Position cap for the instrument.
        let open_qty: f64 = state.pos.as_ref().map(|p| p.qty).unwrap_or(0.0)
            + state.working_orders.iter().map(|w| w.qty).sum::<f64>();
        let combined = open_qty + order.qty;
        if combined > self.config.max_position_qty {
            events.errors.push(BrokerError::PositionCapExceeded {
                combined,
                limit: self.config.max_position_qty,
            });
            return;
        }

        // One position per broker: an opposite-side order cannot net or flip.
        if let Some(pos) = &state.pos {
            if pos.side != order.side {
                events.errors.push(BrokerError::OppositePositionOpen);
                return;
            }
        }

        // Limit orders rest until the bar trades through them. The id is
        // accepted here: a queued limit must not re-execute after a crash.
        if order.entry_type == EntryType::Limit
            && !(candle.low <= order.entry && order.entry <= candle.high)
        {
            state.record_processed(&order.client_order_id);
            debug!(
                client_order_id = %order.client_order_id,
                entry = order.entry,
                low = candle.low,
                high = candle.high,
                "limit not touched — queued as working order"
            );
            state.working_orders.push(WorkingOrder {
                client_order_id: order.client_order_id.clone(),
                side: order.side,
                entry_type: order.entry_type,
                entry: order.entry,
                qty: order.qty,
                sl: order.sl,
                tp: order.tp,
                created_at: utc_ts(),
            });
            return;
        }

        // 6. Volume capacity: fill what the bar allows, queue the rest.
        if *bar_budget <= QTY_EPSILON {
            events
                .errors
                .push(BrokerError::NoVolumeCapacity { volume: candle.volume });
            return;
        }
        state.record_processed(&order.client_order_id);
        let fill_qty = order.qty.min(*bar_budget);
        *bar_budget -= fill_qty;
        let partial = fill_qty + QTY_EPSILON < order.qty;

        let fill_ref = if order.entry_type == EntryType::Limit {
            order.entry
        } else {
            ref_price
        };
        let fill = self.apply_fill(
            state,
            &order.client_order_id,
            order.side,
            order.entry_type,
            fill_qty,
            fill_ref,
            order.sl,
            order.tp,
            partial,
        );
        events.fills.push(fill);

        if partial {
            let remainder = order.qty - fill_qty;
            info!(
                client_order_id = %order.client_order_id,
                filled = fill_qty,
                remainder,
                "partial fill — remainder parked as working order"
            );
            state.working_orders.push(WorkingOrder {
                client_order_id: order.client_order_id.clone(),
                side: order.side,
                entry_type: order.entry_type,
                entry: order.entry,
                qty: remainder,
                sl: order.sl,
                tp: order.tp,
                created_at: utc_ts(),
            });
        }
    }

    /// Fill working orders head-of-line first, within the bar's remaining
    /// volume budget. Orders opposite an open position keep waiting.
    fn fill_working_orders(
        &self,
        state: &mut BrokerState,
        candle: &Candle,
        bar_budget: &mut f64,
        events: &mut BrokerEvents,
    ) {
        let mut idx = 0;
        while idx < state.working_orders.len() {
            if *bar_budget <= QTY_EPSILON {
                break;
            }
            let wo = state.working_orders[idx].clone();

            if let Some(pos) = &state.pos {
                if pos.side != wo.side {
                    idx += 1;
                    continue;
                }
            }
            if wo.entry_type == EntryType::Limit
                && !(candle.low <= wo.entry && wo.entry <= candle.high)
            {
                idx += 1;
                continue;
            }

            let fill_qty = wo.qty.min(*bar_budget);
            *bar_budget -= fill_qty;
            let fill_ref = if wo.entry_type == EntryType::Limit {
                wo.entry
            } else {
                candle.close
            };
            let remaining = wo.qty - fill_qty;
            let partial = remaining > QTY_EPSILON;
            let fill = self.apply_fill(
                state,
                &wo.client_order_id,
                wo.side,
                wo.entry_type,
                fill_qty,
                fill_ref,
                wo.sl,
                wo.tp,
                partial,
            );
            events.fills.push(fill);

            if partial {
                state.working_orders[idx].qty = remaining;
                idx += 1;
            } else {
                state.working_orders.remove(idx);
            }
        }
    }

    /// Apply slippage and fees, then merge the fill into the position book.
    #[allow(clippy::too_many_arguments)]
    fn apply_fill(
        &self,
        state: &mut BrokerState,
        client_order_id: &str,
        side: Side,
        entry_type: EntryType,
        qty: f64,
        ref_price: f64,
        sl: f64,
        tp: f64,
        partial: bool,
    ) -> FillEvent {
        // 7. Adverse slippage: longs pay up, shorts receive less.
        let price = ref_price * (1.0 + side.direction() * self.config.slip_bps / 1e4);

        // 8. Fees: maker for limit, taker for market.
        let fee_bps = match entry_type {
            EntryType::Limit => self.config.maker_fee_bps,
            EntryType::Market => self.config.taker_fee_bps,
        };
        let fees = qty * price * fee_bps / 1e4;

        // 9. FIFO lot book with weighted-average entry.
        match state.pos.as_mut() {
            Some(pos) => {
                pos.lots.push(Lot { qty, price, fees });
                pos.qty += qty;
                pos.entry_fees += fees;
                let notional: f64 = pos.lots.iter().map(|l| l.qty * l.price).sum();
                pos.entry = notional / pos.qty;
            }
            None => {
                state.pos = Some(Position {
                    side,
                    entry: price,
                    qty,
                    sl,
                    tp,
                    opened_at: utc_ts(),
                    entry_fees: fees,
                    bars_open: 0,
                    trail_active: false,
                    trail_stop: 0.0,
                    initial_sl: sl,
                    lots: vec![Lot { qty, price, fees }],
                });
            }
        }

        let fill = FillEvent {
            client_order_id: client_order_id.to_string(),
            side,
            qty,
            price,
            fees,
            partial,
            ts: utc_ts(),
        };
        info!(
            client_order_id,
            side = %side,
            qty,
            price,
            fees,
            partial,
            "FILL"
        );
        state.journal(json!({
            "type": "fill",
            "id": client_order_id,
            "side": side,
            "qty": qty,
            "price": price,
            "fees": fees,
            "partial": partial,
            "ts": fill.ts,
        }));
        self.append_event("Fill", serde_json::to_value(&fill).unwrap_or(Value::Null));
        fill
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Evaluate SL, TP, then trailing stop against a price range, updating the
    /// trail afterwards. SL strictly wins when a bar touches several levels.
    ///
    /// For tick evaluation, `low == high == close == tick.last`.
    fn check_exit(
        &self,
        pos: &mut Position,
        low: f64,
        high: f64,
        close: f64,
    ) -> Option<(ExitReason, f64)> {
        let long = pos.side == Side::Long;

        let sl_hit = if long { low <= pos.sl } else { high >= pos.sl };
        if sl_hit {
            return Some((ExitReason::StopLoss, pos.sl));
        }

        let tp_hit = if long { high >= pos.tp } else { low <= pos.tp };
        if tp_hit {
            return Some((ExitReason::TakeProfit, pos.tp));
        }

        if pos.trail_active {
            let trail_hit = if long {
                low <= pos.trail_stop
            } else {
                high >= pos.trail_stop
            };
            if trail_hit {
                return Some((ExitReason::Trail, pos.trail_stop));
            }
        }

        self.update_trail(pos, close);
        None
    }

    /// Arm the trail at 0.5 R of unrealized profit and ratchet it
    /// monotonically in the favorable direction only.
    fn update_trail(&self, pos: &mut Position, close: f64) {
        let r = (pos.entry - pos.initial_sl).abs();
        if r <= 0.0 {
            return;
        }
        let dir = pos.side.direction();
        let unrealized_r = dir * (close - pos.entry) / r;
        let distance = r * self.config.trail_atr_mult;
        let candidate = close - dir * distance;

        if !pos.trail_active {
            if unrealized_r >= TRAIL_ACTIVATION_R {
                pos.trail_active = true;
                pos.trail_stop = candidate;
                info!(
                    side = %pos.side,
                    trail_stop = pos.trail_stop,
                    unrealized_r,
                    "trailing stop armed"
                );
            }
            return;
        }

        let improved = if pos.side == Side::Long {
            candidate > pos.trail_stop
        } else {
            candidate < pos.trail_stop
        };
        if improved {
            debug!(old = pos.trail_stop, new = candidate, "trailing stop advanced");
            pos.trail_stop = candidate;
        }
    }

    /// Close every lot at the exit price and settle equity. `apply_slip`
    /// is false only for forced closes at an explicit price.
    fn execute_exit(
        &self,
        state: &mut BrokerState,
        reason: ExitReason,
        raw_price: f64,
        apply_slip: bool,
    ) -> Option<ExitEvent> {
        let pos = state.pos.take()?;
        let dir = pos.side.direction();
        let exit_price = if apply_slip {
            raw_price * (1.0 - dir * self.config.slip_bps / 1e4)
        } else {
            raw_price
        };

        let pnl: f64 = if self.config.is_inverse {
            pos.lots
                .iter()
                .map(|l| dir * (l.qty * l.price) * (1.0 / l.price - 1.0 / exit_price))
                .sum()
        } else {
            pos.lots
                .iter()
                .map(|l| dir * (exit_price - l.price) * l.qty)
                .sum()
        };

        let exit_notional = pos.qty * exit_price;
        let mut exit_fees = exit_notional * self.config.taker_fee_bps / 1e4;
        if self.config.is_inverse {
            // Keep fees in the same unit as inverse PnL (base currency).
            exit_fees /= exit_price;
        }

        let realized = pnl - pos.entry_fees - exit_fees;
        state.current_equity += realized;
        state.realized_pnl += realized;

        let exit = ExitEvent {
            side: pos.side,
            qty: pos.qty,
            entry: pos.entry,
            price: exit_price,
            reason,
            pnl: realized,
            fees: pos.entry_fees + exit_fees,
            ts: utc_ts(),
        };
        info!(
            side = %exit.side,
            reason = %reason,
            entry = exit.entry,
            price = exit.price,
            pnl = exit.pnl,
            equity = state.current_equity,
            "EXIT"
        );
        state.journal(json!({
            "type": "exit",
            "side": exit.side,
            "qty": exit.qty,
            "entry": exit.entry,
            "price": exit.price,
            "reason": reason.to_string(),
            "pnl": exit.pnl,
            "ts": exit.ts,
        }));
        self.append_event("Exit", serde_json::to_value(&exit).unwrap_or(Value::Null));
        Some(exit)
    }
}

impl Broker for PaperBroker {
    fn on_candle(
        &self,
        candle: &Candle,
        order: Option<&Order>,
        tick: Option<&Tick>,
    ) -> BrokerEvents {
        let mut events = BrokerEvents::default();
        let mut state = self.state.lock();

        if let Some(pos) = state.pos.as_mut() {
            pos.bars_open += 1;
        }

        let mut bar_budget = candle.volume * VOLUME_CAP_FRACTION;

        // Older orders first: the working queue gets the bar's volume before
        // any newly submitted order.
        self.fill_working_orders(&mut state, candle, &mut bar_budget, &mut events);

        if let Some(order) = order {
            if order.go {
                self.process_order(&mut state, candle, order, tick, &mut bar_budget, &mut events);
            }
        }

        if state.pos.is_some() && candle.close > 0.0 {
            let mut pos = state.pos.take().unwrap();
            let exit = self.check_exit(&mut pos, candle.low, candle.high, candle.close);
            state.pos = Some(pos);
            if let Some((reason, raw_price)) = exit {
                if let Some(e) = self.execute_exit(&mut state, reason, raw_price, true) {
                    events.exits.push(e);
                }
            }
        }

        if !events.fills.is_empty() || !events.exits.is_empty() {
            self.persist(&state);
        }
        events
    }

    fn on_tick(&self, tick: &Tick) -> BrokerEvents {
        let mut events = BrokerEvents::default();
        if tick.last <= 0.0 {
            return events;
        }
        let mut state = self.state.lock();
        if state.pos.is_none() {
            return events;
        }

        let mut pos = state.pos.take().unwrap();
        let exit = self.check_exit(&mut pos, tick.last, tick.last, tick.last);
        state.pos = Some(pos);
        if let Some((reason, raw_price)) = exit {
            if let Some(e) = self.execute_exit(&mut state, reason, raw_price, true) {
                events.exits.push(e);
            }
            self.persist(&state);
        }
        events
    }

    fn unrealized_pnl(&self, price: f64) -> f64 {
        let state = self.state.lock();
        let Some(pos) = &state.pos else {
            return 0.0;
        };
        if price <= 0.0 {
            return 0.0;
        }
        let dir = pos.side.direction();
        if self.config.is_inverse {
            dir * (pos.qty * pos.entry) * (1.0 / pos.entry - 1.0 / price)
        } else {
            dir * (price - pos.entry) * pos.qty
        }
    }

    fn close_all(&self, price: f64) -> Vec<ExitEvent> {
        if price <= 0.0 {
            warn!(price, "close_all skipped: invalid price");
            return Vec::new();
        }
        let mut state = self.state.lock();
        let mut exits = Vec::new();
        if let Some(e) = self.execute_exit(&mut state, ExitReason::ForceClose, price, false) {
            exits.push(e);
        }
        if !exits.is_empty() {
            self.persist(&state);
        }
        exits
    }

    fn cancel_all_open_orders(&self) {
        let mut state = self.state.lock();
        let cancelled = state.working_orders.len();
        if cancelled > 0 {
            info!(cancelled, "working orders cancelled");
            state.working_orders.clear();
        }
    }

    fn shutdown(&self) {
        // Resting orders are cancelled by the coordinator before the queue is
        // drained into `working_orders`; clearing here would lose the drained
        // orders the final save exists to protect.
        if let Err(e) = self.save_state() {
            error!(error = %e, "broker shutdown: failed to save state");
        }
    }

    fn save_state(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(path) = &self.config.state_path {
            atomic_write_json(path, &*state)?;
        }
        Ok(())
    }

    fn position(&self) -> Option<Position> {
        self.state.lock().pos.clone()
    }

    fn working_orders(&self) -> Vec<WorkingOrder> {
        self.state.lock().working_orders.clone()
    }

    fn push_working_order(&self, order: &Order) {
        let mut state = self.state.lock();
        info!(
            client_order_id = %order.client_order_id,
            qty = order.qty,
            "order drained into working queue"
        );
        state.working_orders.push(WorkingOrder {
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            entry_type: order.entry_type,
            entry: order.entry,
            qty: order.qty,
            sl: order.sl,
            tp: order.tp,
            created_at: utc_ts(),
        });
    }

    fn current_equity(&self) -> f64 {
        self.state.lock().current_equity
    }

    fn starting_equity(&self) -> Option<f64> {
        self.state.lock().starting_equity
    }

    fn set_starting_equity(&self, equity: f64) {
        self.state.lock().starting_equity = Some(equity);
    }

    fn apply_funding(&self, rate: f64, ts: &str) -> Option<FundingEvent> {
        let mut state = self.state.lock();
        let (notional, dir) = match state.pos.as_ref() {
            Some(pos) => (pos.qty * pos.entry, pos.side.direction()),
            None => return None,
        };
        // Longs pay a positive rate, shorts receive it.
        let charge = -dir * rate * notional;
        state.current_equity += charge;
        let event = FundingEvent {
            rate,
            notional,
            charge,
            ts: ts.to_string(),
        };
        info!(rate, notional, charge, "funding applied");
        state.journal(json!({
            "type": "funding",
            "rate": rate,
            "notional": notional,
            "charge": charge,
            "ts": ts,
        }));
        self.persist(&state);
        Some(event)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frictionless_config() -> PaperBrokerConfig {
        PaperBrokerConfig {
            symbol: "BTCUSDT".to_string(),
            starting_balance: 10_000.0,
            maker_fee_bps: 0.0,
            taker_fee_bps: 0.0,
            slip_bps: 0.0,
            trail_atr_mult: 1.5,
            is_inverse: false,
            max_position_qty: 1_000_000.0,
            kill_file: PathBuf::from("does-not-exist-kill.txt"),
            state_path: None,
        }
    }

    fn broker() -> PaperBroker {
        PaperBroker::new(frictionless_config(), None)
    }

    fn candle(close: f64, low: f64, high: f64, volume: f64) -> Candle {
        Candle {
            ts: "2024-01-01T00:00:00Z".to_string(),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    fn long_order(id: &str, qty: f64, sl: f64, tp: f64) -> Order {
        Order {
            go: true,
            side: Side::Long,
            entry_type: EntryType::Market,
            entry: 0.0,
            sl,
            tp,
            qty,
            client_order_id: id.to_string(),
            equity: 10_000.0,
            risk_pct: 1.0,
            rr_min: 1.5,
            lot_step: 0.0,
            min_notional: 0.0,
            setup: Default::default(),
        }
    }

    #[test]
    fn paper_roundtrip_take_profit() {
        // Enter LONG at 50000 (sl 49000, tp 52000), exit at tp on the next
        // bar; with zero friction pnl is (52000-50000)*0.005 = 10.00.
        let b = broker();
        let entry = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        let events = b.on_candle(&entry, Some(&long_order("s1", 0.005, 49_000.0, 52_000.0)), None);
        assert_eq!(events.fills.len(), 1);
        assert!(events.exits.is_empty());
        assert_eq!(events.fills[0].price, 50_000.0);

        let next = candle(51_800.0, 50_500.0, 52_000.0, 1_000.0);
        let events = b.on_candle(&next, None, None);
        assert_eq!(events.exits.len(), 1);
        let exit = &events.exits[0];
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert_eq!(exit.price, 52_000.0);
        assert!((exit.pnl - 10.0).abs() < 1e-9);
        assert!((b.current_equity() - 10_010.0).abs() < 1e-9);
        assert!(b.position().is_none());
    }

    #[test]
    fn stop_loss_wins_when_bar_touches_both_levels() {
        let b = broker();
        let entry = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("both-1", 0.01, 49_000.0, 52_000.0)), None);

        // One wide bar through both the stop and the target.
        let wide = candle(51_000.0, 48_500.0, 52_500.0, 1_000.0);
        let events = b.on_candle(&wide, None, None);
        assert_eq!(events.exits.len(), 1);
        assert_eq!(events.exits[0].reason, ExitReason::StopLoss);
        assert_eq!(events.exits[0].price, 49_000.0);
    }

    #[test]
    fn duplicate_client_order_id_fills_once() {
        let b = broker();
        let bar = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        let order = long_order("dup-1", 0.01, 49_000.0, 52_000.0);

        let first = b.on_candle(&bar, Some(&order), None);
        assert_eq!(first.fills.len(), 1);
        let qty_after_first = b.position().unwrap().qty;

        let second = b.on_candle(&bar, Some(&order), None);
        assert!(second.fills.is_empty());
        assert_eq!(
            second.errors,
            vec![BrokerError::DuplicateOrderId("dup-1".to_string())]
        );
        assert_eq!(b.position().unwrap().qty, qty_after_first);
    }

    #[test]
    fn partial_fill_conserves_quantity() {
        // Volume 0.1 caps the fill at 0.01; the 0.04 remainder becomes a
        // working order and fills on the next high-volume bar.
        let b = broker();
        let thin = candle(100.0, 99.0, 101.0, 0.1);
        let events = b.on_candle(&thin, Some(&long_order("wo-1", 0.05, 90.0, 120.0)), None);
        assert_eq!(events.fills.len(), 1);
        assert!(events.fills[0].partial);
        assert!((events.fills[0].qty - 0.01).abs() < 1e-12);

        let wos = b.working_orders();
        assert_eq!(wos.len(), 1);
        assert!((wos[0].qty - 0.04).abs() < 1e-12);
        assert_eq!(wos[0].client_order_id, "wo-1");

        let thick = candle(100.0, 99.0, 101.0, 100.0);
        let events = b.on_candle(&thick, None, None);
        assert_eq!(events.fills.len(), 1);
        assert!(!events.fills[0].partial);
        assert!((events.fills[0].qty - 0.04).abs() < 1e-12);
        assert!(b.working_orders().is_empty());

        let pos = b.position().unwrap();
        assert!((pos.qty - 0.05).abs() < 1e-12);
        assert_eq!(pos.lots.len(), 2);
        let lot_sum: f64 = pos.lots.iter().map(|l| l.qty).sum();
        assert!((pos.qty - lot_sum).abs() < 1e-12);
    }

    #[test]
    fn zero_volume_bar_rejects_market_order() {
        let b = broker();
        let dead = candle(100.0, 99.0, 101.0, 0.0);
        let events = b.on_candle(&dead, Some(&long_order("nv-1", 0.01, 90.0, 120.0)), None);
        assert!(events.fills.is_empty());
        assert!(matches!(
            events.errors[0],
            BrokerError::NoVolumeCapacity { .. }
        ));
        assert!(b.position().is_none());
    }

    #[test]
    fn kill_switch_file_blocks_orders_without_state_change() {
        let dir = tempdir().unwrap();
        let kill_file = dir.path().join("kill.txt");
        std::fs::write(&kill_file, "stop").unwrap();

        let mut cfg = frictionless_config();
        cfg.kill_file = kill_file;
        let b = PaperBroker::new(cfg, None);

        let bar = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        let events = b.on_candle(&bar, Some(&long_order("ks-1", 0.01, 49_000.0, 52_000.0)), None);
        assert!(events.fills.is_empty());
        assert_eq!(events.errors, vec![BrokerError::KillSwitchActive]);
        assert_eq!(events.errors[0].to_string(), "KILL_SWITCH_ACTIVE");
        assert!(b.position().is_none());
        assert_eq!(b.current_equity(), 10_000.0);
        assert!(b.working_orders().is_empty());
    }

    #[test]
    fn notional_cap_rejects_oversized_order() {
        let b = broker();
        let bar = candle(50_000.0, 49_900.0, 50_100.0, 10_000.0);
        // 3 * 50000 = 150k USD > 100k cap.
        let events = b.on_candle(&bar, Some(&long_order("big-1", 3.0, 49_000.0, 52_000.0)), None);
        assert!(events.fills.is_empty());
        assert!(matches!(
            events.errors[0],
            BrokerError::NotionalCapExceeded { .. }
        ));
        assert!(events.errors[0].to_string().contains("notional exceeds limit"));
    }

    #[test]
    fn position_cap_limits_combined_quantity() {
        let mut cfg = frictionless_config();
        cfg.max_position_qty = 0.015;
        let b = PaperBroker::new(cfg, None);
        let bar = candle(100.0, 99.0, 101.0, 1_000.0);

        assert_eq!(
            b.on_candle(&bar, Some(&long_order("pc-1", 0.01, 90.0, 120.0)), None)
                .fills
                .len(),
            1
        );
        let events = b.on_candle(&bar, Some(&long_order("pc-2", 0.01, 90.0, 120.0)), None);
        assert!(events.fills.is_empty());
        assert!(matches!(
            events.errors[0],
            BrokerError::PositionCapExceeded { .. }
        ));
    }

    #[test]
    fn opposite_side_order_is_rejected_while_position_open() {
        let b = broker();
        let bar = candle(100.0, 99.0, 101.0, 1_000.0);
        b.on_candle(&bar, Some(&long_order("op-1", 0.01, 90.0, 120.0)), None);

        let mut short = long_order("op-2", 0.01, 110.0, 80.0);
        short.side = Side::Short;
        let events = b.on_candle(&bar, Some(&short), None);
        assert!(events.fills.is_empty());
        assert_eq!(events.errors, vec![BrokerError::OppositePositionOpen]);

        let pos = b.position().unwrap();
        assert_eq!(pos.side, Side::Long);
        assert!((pos.qty - 0.01).abs() < 1e-12);
    }

    #[test]
    fn trailing_stop_long_arms_ratchets_and_triggers() {
        // Entry 50000, initial sl 48000 (R = 2000), mult 1.5 (distance 3000).
        let b = broker();
        let entry = candle(50_000.0, 49_500.0, 50_100.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("tr-1", 0.01, 48_000.0, 100_000.0)), None);

        // Close 51001: unrealized 1001 >= 0.5 R, trail arms at 48001.
        let c2 = candle(51_001.0, 50_000.0, 51_100.0, 1_000.0);
        assert!(b.on_candle(&c2, None, None).exits.is_empty());
        let pos = b.position().unwrap();
        assert!(pos.trail_active);
        assert!((pos.trail_stop - 48_001.0).abs() < 1e-9);

        // Close 55000: trail ratchets to 52000.
        let c3 = candle(55_000.0, 51_500.0, 55_200.0, 1_000.0);
        assert!(b.on_candle(&c3, None, None).exits.is_empty());
        assert!((b.position().unwrap().trail_stop - 52_000.0).abs() < 1e-9);

        // A weaker close never lowers the trail.
        let c4 = candle(54_000.0, 53_000.0, 54_500.0, 1_000.0);
        assert!(b.on_candle(&c4, None, None).exits.is_empty());
        assert!((b.position().unwrap().trail_stop - 52_000.0).abs() < 1e-9);

        // Low 51000 crosses the trail: exactly one TRAIL exit at 52000.
        let c5 = candle(51_200.0, 51_000.0, 54_100.0, 1_000.0);
        let events = b.on_candle(&c5, None, None);
        assert_eq!(events.exits.len(), 1);
        assert_eq!(events.exits[0].reason, ExitReason::Trail);
        assert_eq!(events.exits[0].price, 52_000.0);
        assert!(b.position().is_none());
    }

    #[test]
    fn tick_exit_through_stop() {
        let b = broker();
        let entry = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("tk-1", 0.01, 49_000.0, 52_000.0)), None);

        let safe = Tick {
            symbol: "BTCUSDT".into(),
            bid: 49_500.0,
            ask: 49_501.0,
            last: 49_500.5,
            ts: utc_ts(),
        };
        assert!(b.on_tick(&safe).exits.is_empty());

        let through = Tick {
            symbol: "BTCUSDT".into(),
            bid: 48_999.0,
            ask: 49_000.0,
            last: 48_999.5,
            ts: utc_ts(),
        };
        let events = b.on_tick(&through);
        assert_eq!(events.exits.len(), 1);
        assert_eq!(events.exits[0].reason, ExitReason::StopLoss);
        assert_eq!(events.exits[0].price, 49_000.0);
    }

    #[test]
    fn invalid_tick_is_ignored() {
        let b = broker();
        let entry = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("iv-1", 0.01, 49_000.0, 52_000.0)), None);

        let bad = Tick {
            symbol: "BTCUSDT".into(),
            bid: 0.0,
            ask: 0.0,
            last: 0.0,
            ts: utc_ts(),
        };
        assert!(b.on_tick(&bad).is_empty());
        assert!(b.position().is_some());
    }

    #[test]
    fn inverse_contract_pnl_in_base_currency() {
        // LONG 90500 -> 92000 on an inverse contract: pnl = notional *
        // (1/entry - 1/exit) > 0.
        let mut cfg = frictionless_config();
        cfg.is_inverse = true;
        let b = PaperBroker::new(cfg, None);

        let entry = candle(90_500.0, 90_000.0, 90_600.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("inv-1", 0.01, 89_000.0, 92_000.0)), None);

        let exit_bar = candle(91_900.0, 90_800.0, 92_000.0, 1_000.0);
        let events = b.on_candle(&exit_bar, None, None);
        assert_eq!(events.exits.len(), 1);
        let notional = 0.01 * 90_500.0;
        let expected = notional * (1.0 / 90_500.0 - 1.0 / 92_000.0);
        assert!(expected > 0.0);
        assert!((events.exits[0].pnl - expected).abs() < 1e-12);
    }

    #[test]
    fn slippage_and_fees_are_adverse() {
        let mut cfg = frictionless_config();
        cfg.slip_bps = 10.0; // 0.1%
        cfg.taker_fee_bps = 10.0;
        let b = PaperBroker::new(cfg, None);

        let bar = candle(10_000.0, 9_900.0, 10_100.0, 1_000.0);
        let events = b.on_candle(&bar, Some(&long_order("sf-1", 0.01, 9_000.0, 20_000.0)), None);
        let fill = &events.fills[0];
        assert!((fill.price - 10_010.0).abs() < 1e-9);
        assert!((fill.fees - 0.01 * 10_010.0 * 0.001).abs() < 1e-9);
    }

    #[test]
    fn limit_order_rests_until_touched() {
        let b = broker();
        let mut order = long_order("lim-1", 0.01, 90.0, 120.0);
        order.entry_type = EntryType::Limit;
        order.entry = 95.0;

        // Bar never trades down to 95: order rests.
        let above = candle(100.0, 98.0, 101.0, 1_000.0);
        let events = b.on_candle(&above, Some(&order), None);
        assert!(events.fills.is_empty());
        assert!(events.errors.is_empty());
        assert_eq!(b.working_orders().len(), 1);

        // Bar trades through 95: fills at the limit price.
        let touch = candle(96.0, 94.0, 99.0, 1_000.0);
        let events = b.on_candle(&touch, None, None);
        assert_eq!(events.fills.len(), 1);
        assert_eq!(events.fills[0].price, 95.0);
        assert!(b.working_orders().is_empty());
    }

    #[test]
    fn close_all_force_closes_at_given_price() {
        let b = broker();
        let entry = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        b.on_candle(&entry, Some(&long_order("fc-1", 0.01, 49_000.0, 52_000.0)), None);

        let exits = b.close_all(50_500.0);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::ForceClose);
        assert_eq!(exits[0].price, 50_500.0);
        assert!(b.position().is_none());
        assert!(b.close_all(50_500.0).is_empty());
    }

    #[test]
    fn state_recovery_restores_position_and_processed_ids() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("paper_state.json");
        std::fs::write(
            &state_path,
            serde_json::json!({
                "symbol": "BTCUSDT",
                "starting_equity": 10000.0,
                "current_equity": 9500.0,
                "processed_order_ids": ["order1"],
                "order_history": [{"type": "fill", "id": "order1"}],
                "working_orders": [],
                "pos": {
                    "side": "LONG",
                    "entry": 50000.0,
                    "qty": 0.1,
                    "sl": 49000.0,
                    "tp": 52000.0,
                    "opened_at": "2024-01-01T00:00:00Z",
                    "entry_fees": 1.0,
                    "bars_open": 5,
                    "trail_active": false,
                    "trail_stop": 0.0
                }
            })
            .to_string(),
        )
        .unwrap();

        let mut cfg = frictionless_config();
        cfg.state_path = Some(state_path.clone());
        let b = PaperBroker::new(cfg, None);

        assert_eq!(b.current_equity(), 9_500.0);
        let pos = b.position().unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.entry, 50_000.0);
        assert_eq!(pos.qty, 0.1);
        assert_eq!(pos.initial_sl, 49_000.0);
        assert_eq!(pos.lots.len(), 1);

        // The restored idempotency ring still rejects the old id.
        let bar = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        let events = b.on_candle(&bar, Some(&long_order("order1", 0.01, 49_000.0, 52_000.0)), None);
        assert!(events.fills.is_empty());
        assert!(matches!(events.errors[0], BrokerError::DuplicateOrderId(_)));
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("paper_state.json");
        std::fs::write(&state_path, "{ corrupt json ...").unwrap();

        let mut cfg = frictionless_config();
        cfg.state_path = Some(state_path.clone());
        let b = PaperBroker::new(cfg, None);

        assert_eq!(b.current_equity(), 10_000.0);
        assert!(b.position().is_none());
        assert!(dir.path().join("paper_state.json.corrupt").exists());
    }

    #[test]
    fn funding_charges_long_and_credits_short() {
        let b = broker();
        let bar = candle(50_000.0, 49_900.0, 50_100.0, 1_000.0);
        b.on_candle(&bar, Some(&long_order("fund-1", 0.01, 49_000.0, 60_000.0)), None);

        let ev = b.apply_funding(0.0001, "2024-01-01T08:00:00Z").unwrap();
        let notional = 0.01 * 50_000.0;
        assert!((ev.charge + 0.0001 * notional).abs() < 1e-12);
        assert!((b.current_equity() - (10_000.0 + ev.charge)).abs() < 1e-9);

        // Flat broker: no funding applies.
        b.close_all(50_000.0);
        assert!(b.apply_funding(0.0001, "2024-01-01T16:00:00Z").is_none());
    }

    #[test]
    fn cancel_clears_resting_orders_and_shutdown_persists_the_rest() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("paper_state.json");
        let mut cfg = frictionless_config();
        cfg.state_path = Some(state_path.clone());
        let b = PaperBroker::new(cfg, None);

        let thin = candle(100.0, 99.0, 101.0, 0.1);
        b.on_candle(&thin, Some(&long_order("sd-1", 0.05, 90.0, 120.0)), None);
        assert_eq!(b.working_orders().len(), 1);
        b.cancel_all_open_orders();
        assert!(b.working_orders().is_empty());

        // Orders drained in after cancellation must survive the final save.
        b.push_working_order(&long_order("sd-2", 0.02, 90.0, 120.0));
        b.shutdown();
        assert_eq!(b.working_orders().len(), 1);

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&state_path).unwrap()).unwrap();
        let wos = saved["working_orders"].as_array().unwrap();
        assert_eq!(wos.len(), 1);
        assert_eq!(wos[0]["client_order_id"], "sd-2");
        assert!(saved["pos"].is_object());
    }

    #[test]
    fn weighted_average_entry_across_lots() {
        let b = broker();
        let c1 = candle(100.0, 99.0, 101.0, 0.2); // cap 0.02
        b.on_candle(&c1, Some(&long_order("avg-1", 0.04, 90.0, 200.0)), None);
        let c2 = candle(110.0, 109.0, 111.0, 100.0);
        b.on_candle(&c2, None, None);

        let pos = b.position().unwrap();
        assert!((pos.qty - 0.04).abs() < 1e-12);
        // 0.02 @ 100 + 0.02 @ 110 -> 105.
        assert!((pos.entry - 105.0).abs() < 1e-9);
    }
}
