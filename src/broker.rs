// =============================================================================
// Broker Adapter - the port to the brokerage, plus the paper implementation
// =============================================================================
//
// The controller never talks to a brokerage directly; everything goes
// through this trait, and only execution-manager handlers invoke it. Calls
// may block (the trait is synchronous by design); fills, rejections, and
// cancels flow back through `poll_events`, drained once per controller
// cycle.
//
// `PaperBroker` is the in-process implementation: it fills armed levels
// against pushed prices and exists so the engine runs end-to-end without a
// live brokerage. It doubles as the test harness for the controller.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::level_pool::LevelKey;
use crate::market_data::{BarTimeframe, Candle, MarketQuote};
use crate::types::{ControllerError, OrderType, Side};

/// Request to arm a level at the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmLevelRequest {
    pub key: LevelKey,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: u32,
}

/// An armed level as the brokerage sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmedLevel {
    pub key: LevelKey,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: u32,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub entry_filled: bool,
    pub position_qty: i64,
}

/// An open position at the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed share count; negative for short positions.
    pub quantity: i64,
    pub avg_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
}

/// A working order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
    pub limit_price: f64,
}

/// A position whose controlling level was deactivated while it stayed open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanPosition {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub shares: i64,
    pub entry_price: f64,
    pub current_price: f64,
    pub profit_per_share: f64,
}

/// Account summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub buying_power: f64,
    pub cash: f64,
    pub total_value: f64,
    pub day_pnl: f64,
}

/// Fill/reject/cancel notifications from the brokerage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BrokerEvent {
    EntryFilled {
        key: LevelKey,
        fill_price: f64,
        quantity: i64,
        at: DateTime<Utc>,
    },
    ExitFilled {
        key: LevelKey,
        fill_price: f64,
        quantity: i64,
        at: DateTime<Utc>,
    },
    EntryRejected {
        key: LevelKey,
        reason: String,
    },
    ExitRejected {
        key: LevelKey,
        reason: String,
    },
    OrderCancelled {
        key: LevelKey,
        was_entry: bool,
    },
    Disconnected,
}

/// The boundary every brokerage integration must satisfy.
pub trait BrokerAdapter: Send + Sync {
    // --- Market data -------------------------------------------------------
    fn market_data(&self, symbol: &str) -> Option<MarketQuote>;
    fn historical_bars(&self, symbol: &str, days: u32, timeframe: BarTimeframe) -> Vec<Candle>;

    // --- Level lifecycle ---------------------------------------------------
    fn activate_level(&self, request: &ArmLevelRequest) -> Result<(), ControllerError>;
    fn deactivate_level(&self, key: &LevelKey) -> Result<(), ControllerError>;
    fn active_levels(&self) -> Vec<ArmedLevel>;

    // --- Trade lifecycle ---------------------------------------------------
    /// Cancel a pending entry order. Never touches an open position.
    fn stop_trade(&self, key: &LevelKey) -> Result<(), ControllerError>;
    /// Close (part of) a position. Never cancels pending entries.
    fn close_position(
        &self,
        symbol: &str,
        quantity: i64,
        order_type: OrderType,
    ) -> Result<(), ControllerError>;
    fn open_positions(&self) -> HashMap<String, BrokerPosition>;
    fn pending_orders(&self) -> Vec<PendingOrder>;
    fn cancel_order(&self, order_id: &str) -> Result<(), ControllerError>;
    fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize, ControllerError>;
    fn emergency_stop(&self) -> Result<(), ControllerError>;

    // --- Orphans -----------------------------------------------------------
    fn orphan_positions(&self) -> Vec<OrphanPosition>;
    fn close_orphan(&self, orphan_id: &str) -> Result<(), ControllerError>;
    fn deactivate_level_keep_position(
        &self,
        key: &LevelKey,
        reason: &str,
    ) -> Result<(), ControllerError>;
    fn should_close_orphan(&self, orphan: &OrphanPosition) -> bool;
    fn update_orphan_prices(&self, prices: &HashMap<String, f64>);

    // --- Status ------------------------------------------------------------
    fn is_connected(&self) -> bool;
    fn account_info(&self) -> AccountInfo;

    /// Drain fills/rejects/cancels accumulated since the last poll.
    fn poll_events(&self) -> Vec<BrokerEvent>;
}

// =============================================================================
// PaperBroker
// =============================================================================

/// Orphans auto-close at three cents of profit per share.
const ORPHAN_PROFIT_THRESHOLD: f64 = 0.03;

struct PaperInner {
    quotes: HashMap<String, MarketQuote>,
    bars: HashMap<String, Vec<Candle>>,
    armed: HashMap<LevelKey, ArmedLevel>,
    positions: HashMap<String, BrokerPosition>,
    orphans: HashMap<String, OrphanPosition>,
    events: Vec<BrokerEvent>,
    account: AccountInfo,
    connected: bool,
    realized_pnl: f64,
}

/// In-memory brokerage simulation.
pub struct PaperBroker {
    clock: Clock,
    inner: Mutex<PaperInner>,
}

impl PaperBroker {
    pub fn new(clock: Clock, starting_cash: f64) -> Self {
        Self {
            clock,
            inner: Mutex::new(PaperInner {
                quotes: HashMap::new(),
                bars: HashMap::new(),
                armed: HashMap::new(),
                positions: HashMap::new(),
                orphans: HashMap::new(),
                events: Vec::new(),
                account: AccountInfo {
                    buying_power: starting_cash * 2.0,
                    cash: starting_cash,
                    total_value: starting_cash,
                    day_pnl: 0.0,
                },
                connected: true,
                realized_pnl: 0.0,
            }),
        }
    }

    /// Seed historical bars for a symbol.
    pub fn load_bars(&self, symbol: &str, candles: Vec<Candle>) {
        self.inner.lock().bars.insert(symbol.to_string(), candles);
    }

    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock();
        inner.connected = connected;
        if !connected {
            inner.events.push(BrokerEvent::Disconnected);
        }
    }

    pub fn realized_pnl(&self) -> f64 {
        self.inner.lock().realized_pnl
    }

    /// Push a market price: updates the quote, fills armed entries whose
    /// limit is crossed, and fills exits of levels already in a position.
    pub fn push_price(&self, symbol: &str, price: f64, volume: u64) {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock();

        let quote = inner
            .quotes
            .entry(symbol.to_string())
            .or_insert_with(|| MarketQuote {
                symbol: symbol.to_string(),
                price,
                bid: price,
                ask: price,
                volume: 0,
                high: price,
                low: price,
                timestamp: now,
            });
        quote.price = price;
        quote.bid = price * 0.9999;
        quote.ask = price * 1.0001;
        quote.volume += volume;
        quote.high = quote.high.max(price);
        quote.low = quote.low.min(price);
        quote.timestamp = now;

        // Entry fills: a long entry fills when the market trades at or below
        // the limit, a short entry at or above.
        let keys: Vec<LevelKey> = inner
            .armed
            .values()
            .filter(|level| level.symbol == symbol)
            .map(|level| level.key.clone())
            .collect();

        for key in keys {
            let level = inner.armed.get(&key).cloned().expect("armed level exists");

            if !level.entry_filled && level.entry_order_id.is_some() {
                let crossed = match level.side {
                    Side::Long => price <= level.entry_price,
                    Side::Short => price >= level.entry_price,
                };
                if crossed {
                    let qty = match level.side {
                        Side::Long => level.shares as i64,
                        Side::Short => -(level.shares as i64),
                    };
                    {
                        let armed = inner.armed.get_mut(&key).expect("armed level exists");
                        armed.entry_filled = true;
                        armed.position_qty = qty;
                        armed.entry_order_id = None;
                        armed.exit_order_id = Some(short_id());
                    }
                    apply_fill(&mut inner, symbol, qty, level.entry_price);
                    inner.events.push(BrokerEvent::EntryFilled {
                        key: key.clone(),
                        fill_price: level.entry_price,
                        quantity: qty,
                        at: now,
                    });
                    debug!(symbol, %key, price = level.entry_price, "paper entry filled");
                    continue;
                }
            }

            if level.entry_filled && level.exit_order_id.is_some() {
                let crossed = match level.side {
                    Side::Long => price >= level.exit_price,
                    Side::Short => price <= level.exit_price,
                };
                if crossed {
                    let qty = level.position_qty;
                    apply_fill(&mut inner, symbol, -qty, level.exit_price);
                    let entry = level.entry_price;
                    let exit = level.exit_price;
                    inner.realized_pnl += (exit - entry) * qty as f64;
                    inner.armed.remove(&key);
                    inner.events.push(BrokerEvent::ExitFilled {
                        key: key.clone(),
                        fill_price: exit,
                        quantity: qty,
                        at: now,
                    });
                    debug!(symbol, %key, price = exit, "paper exit filled");
                }
            }
        }

        // Orphans track the latest price.
        for orphan in inner.orphans.values_mut() {
            if orphan.symbol == symbol {
                orphan.current_price = price;
                orphan.profit_per_share = match orphan.side {
                    Side::Long => price - orphan.entry_price,
                    Side::Short => orphan.entry_price - price,
                };
            }
        }
    }
}

fn apply_fill(inner: &mut PaperInner, symbol: &str, qty: i64, price: f64) {
    let position = inner
        .positions
        .entry(symbol.to_string())
        .or_insert_with(|| BrokerPosition {
            symbol: symbol.to_string(),
            quantity: 0,
            avg_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
        });
    position.quantity += qty;
    position.current_price = price;
    if position.quantity == 0 {
        inner.positions.remove(symbol);
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

impl BrokerAdapter for PaperBroker {
    fn market_data(&self, symbol: &str) -> Option<MarketQuote> {
        self.inner.lock().quotes.get(symbol).cloned()
    }

    fn historical_bars(&self, symbol: &str, days: u32, _timeframe: BarTimeframe) -> Vec<Candle> {
        let inner = self.inner.lock();
        let Some(bars) = inner.bars.get(symbol) else {
            return Vec::new();
        };
        let cutoff = self.clock.now_utc() - chrono::Duration::days(days as i64);
        bars.iter()
            .filter(|c| c.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn activate_level(&self, request: &ArmLevelRequest) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(ControllerError::TransientBroker("not connected".into()));
        }
        if inner.armed.contains_key(&request.key) {
            return Err(ControllerError::OrderRejected(format!(
                "level {} already armed",
                request.key
            )));
        }

        inner.armed.insert(
            request.key.clone(),
            ArmedLevel {
                key: request.key.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                entry_price: request.entry_price,
                exit_price: request.exit_price,
                shares: request.shares,
                entry_order_id: Some(short_id()),
                exit_order_id: None,
                entry_filled: false,
                position_qty: 0,
            },
        );
        info!(key = %request.key, symbol = %request.symbol, "paper level armed");
        Ok(())
    }

    fn deactivate_level(&self, key: &LevelKey) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(ControllerError::TransientBroker("not connected".into()));
        }
        match inner.armed.remove(key) {
            Some(level) => {
                if level.entry_filled && level.position_qty != 0 {
                    // Deactivating a filled level leaves the position as an
                    // orphan; that path goes through
                    // deactivate_level_keep_position.
                    inner.armed.insert(key.clone(), level);
                    return Err(ControllerError::OrderRejected(format!(
                        "level {key} holds a position; deactivate with keep-position"
                    )));
                }
                inner.events.push(BrokerEvent::OrderCancelled {
                    key: key.clone(),
                    was_entry: true,
                });
                Ok(())
            }
            None => Err(ControllerError::OrderRejected(format!(
                "level {key} is not armed"
            ))),
        }
    }

    fn active_levels(&self) -> Vec<ArmedLevel> {
        self.inner.lock().armed.values().cloned().collect()
    }

    fn stop_trade(&self, key: &LevelKey) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        let Some(level) = inner.armed.get_mut(key) else {
            return Err(ControllerError::OrderRejected(format!(
                "level {key} is not armed"
            )));
        };
        if level.entry_filled {
            return Err(ControllerError::OrderRejected(format!(
                "level {key} entry already filled; use close_position"
            )));
        }
        level.entry_order_id = None;
        inner.armed.remove(key);
        inner.events.push(BrokerEvent::OrderCancelled {
            key: key.clone(),
            was_entry: true,
        });
        Ok(())
    }

    fn close_position(
        &self,
        symbol: &str,
        quantity: i64,
        _order_type: OrderType,
    ) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(ControllerError::TransientBroker("not connected".into()));
        }
        let price = inner
            .quotes
            .get(symbol)
            .map(|q| q.price)
            .ok_or_else(|| ControllerError::OrderRejected(format!("no market for {symbol}")))?;

        let Some(position) = inner.positions.get(symbol).cloned() else {
            return Err(ControllerError::OrderRejected(format!(
                "no open position for {symbol}"
            )));
        };

        let closing = quantity.min(position.quantity.abs());
        let signed = if position.quantity > 0 { -closing } else { closing };
        let entry = position.avg_price;
        apply_fill(&mut inner, symbol, signed, price);
        inner.realized_pnl += (price - entry) * (-signed) as f64;
        Ok(())
    }

    fn open_positions(&self) -> HashMap<String, BrokerPosition> {
        self.inner.lock().positions.clone()
    }

    fn pending_orders(&self) -> Vec<PendingOrder> {
        let inner = self.inner.lock();
        inner
            .armed
            .values()
            .filter_map(|level| {
                level.entry_order_id.as_ref().map(|order_id| PendingOrder {
                    order_id: order_id.clone(),
                    symbol: level.symbol.clone(),
                    side: level.side,
                    quantity: level.shares,
                    limit_price: level.entry_price,
                })
            })
            .collect()
    }

    fn cancel_order(&self, order_id: &str) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        let key = inner
            .armed
            .values()
            .find(|l| l.entry_order_id.as_deref() == Some(order_id))
            .map(|l| l.key.clone());
        match key {
            Some(key) => {
                inner.armed.remove(&key);
                inner.events.push(BrokerEvent::OrderCancelled {
                    key,
                    was_entry: true,
                });
                Ok(())
            }
            None => Err(ControllerError::OrderRejected(format!(
                "unknown order {order_id}"
            ))),
        }
    }

    fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize, ControllerError> {
        let mut inner = self.inner.lock();
        let keys: Vec<LevelKey> = inner
            .armed
            .values()
            .filter(|l| !l.entry_filled)
            .filter(|l| symbol.map_or(true, |s| l.symbol == s))
            .map(|l| l.key.clone())
            .collect();

        let cancelled = keys.len();
        for key in keys {
            inner.armed.remove(&key);
            inner.events.push(BrokerEvent::OrderCancelled {
                key,
                was_entry: true,
            });
        }
        Ok(cancelled)
    }

    fn emergency_stop(&self) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();

        // Cancel every working entry.
        let keys: Vec<LevelKey> = inner.armed.keys().cloned().collect();
        for key in keys {
            inner.armed.remove(&key);
            inner.events.push(BrokerEvent::OrderCancelled {
                key,
                was_entry: true,
            });
        }

        // Flatten every position at the last price.
        let symbols: Vec<String> = inner.positions.keys().cloned().collect();
        for symbol in symbols {
            let Some(position) = inner.positions.remove(&symbol) else {
                continue;
            };
            let price = inner
                .quotes
                .get(&symbol)
                .map(|q| q.price)
                .unwrap_or(position.current_price);
            inner.realized_pnl += (price - position.avg_price) * position.quantity as f64;
        }
        inner.orphans.clear();

        info!("paper broker emergency stop: all orders cancelled, positions flat");
        Ok(())
    }

    fn orphan_positions(&self) -> Vec<OrphanPosition> {
        self.inner.lock().orphans.values().cloned().collect()
    }

    fn close_orphan(&self, orphan_id: &str) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        match inner.orphans.remove(orphan_id) {
            Some(orphan) => {
                inner.realized_pnl += orphan.profit_per_share * orphan.shares.abs() as f64;
                let qty = match orphan.side {
                    Side::Long => -orphan.shares,
                    Side::Short => orphan.shares,
                };
                apply_fill(&mut inner, &orphan.symbol.clone(), qty, orphan.current_price);
                Ok(())
            }
            None => Err(ControllerError::OrderRejected(format!(
                "unknown orphan {orphan_id}"
            ))),
        }
    }

    fn deactivate_level_keep_position(
        &self,
        key: &LevelKey,
        reason: &str,
    ) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        let Some(level) = inner.armed.remove(key) else {
            return Err(ControllerError::OrderRejected(format!(
                "level {key} is not armed"
            )));
        };

        if level.entry_filled && level.position_qty != 0 {
            let orphan_id = short_id();
            let current = inner
                .quotes
                .get(&level.symbol)
                .map(|q| q.price)
                .unwrap_or(level.entry_price);
            inner.orphans.insert(
                orphan_id.clone(),
                OrphanPosition {
                    id: orphan_id,
                    symbol: level.symbol.clone(),
                    side: level.side,
                    shares: level.position_qty.abs(),
                    entry_price: level.entry_price,
                    current_price: current,
                    profit_per_share: match level.side {
                        Side::Long => current - level.entry_price,
                        Side::Short => level.entry_price - current,
                    },
                },
            );
            info!(key = %key, reason, "level deactivated, position kept as orphan");
        }
        Ok(())
    }

    fn should_close_orphan(&self, orphan: &OrphanPosition) -> bool {
        orphan.profit_per_share >= ORPHAN_PROFIT_THRESHOLD
    }

    fn update_orphan_prices(&self, prices: &HashMap<String, f64>) {
        let mut inner = self.inner.lock();
        for orphan in inner.orphans.values_mut() {
            if let Some(price) = prices.get(&orphan.symbol) {
                orphan.current_price = *price;
                orphan.profit_per_share = match orphan.side {
                    Side::Long => price - orphan.entry_price,
                    Side::Short => orphan.entry_price - price,
                };
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn account_info(&self) -> AccountInfo {
        let inner = self.inner.lock();
        let mut account = inner.account.clone();
        account.day_pnl = inner.realized_pnl;
        account
    }

    fn poll_events(&self) -> Vec<BrokerEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }
}
