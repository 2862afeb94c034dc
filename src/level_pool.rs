// =============================================================================
// Level Pool - canonical registry of all candidate levels
// =============================================================================
//
// Levels are the atomic units of the grid strategy: an entry/exit percentage
// pair with a side and share size, owned exclusively by the pool. The pool
// keeps secondary indexes (by symbol, by scenario, by status) in lockstep
// with every mutation; all mutations serialise through one internal lock.
//
// Lifecycle: AVAILABLE -> ACTIVE -> (WAITING | IN_POSITION | COOLDOWN)
// -> AVAILABLE. A level in COOLDOWN is never handed out as available until
// `check_cooldowns` observes that its cooldown has elapsed. BLOCKED marks a
// level temporarily barred (risk limits) without touching its statistics.
// =============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Side;

/// Structured level identity. Kept structured (not concatenated) so scenario
/// names containing separators stay unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelKey {
    pub scenario_id: String,
    pub level_num: u32,
    pub side: Side,
}

impl std::fmt::Display for LevelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/L{}/{}", self.scenario_id, self.level_num, self.side)
    }
}

/// Lifecycle status of a pool level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelStatus {
    Available,
    Active,
    Waiting,
    InPosition,
    Cooldown,
    Blocked,
}

impl LevelStatus {
    /// Engaged levels count toward the active-level limits.
    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Active | Self::Waiting | Self::InPosition)
    }

    pub const ALL: [LevelStatus; 6] = [
        Self::Available,
        Self::Active,
        Self::Waiting,
        Self::InPosition,
        Self::Cooldown,
        Self::Blocked,
    ];
}

impl std::fmt::Display for LevelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Waiting => write!(f, "WAITING"),
            Self::InPosition => write!(f, "IN_POSITION"),
            Self::Cooldown => write!(f, "COOLDOWN"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// One level in the pool, with its per-level running statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolLevel {
    pub key: LevelKey,
    pub scenario_name: String,
    pub symbol: String,

    /// Entry/exit as signed percentages relative to the base price.
    pub entry_pct: f64,
    pub exit_pct: f64,
    pub guardian_pct: Option<f64>,
    pub shares: u32,

    /// Absolute prices, computed on activation from the base price.
    pub base_price: Option<f64>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub guardian_price: Option<f64>,

    pub status: LevelStatus,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,

    pub activation_count: u32,
    pub success_count: u32,
    pub fail_count: u32,
    pub last_score: f64,
    pub avg_hold_time_sec: f64,

    pub tags: BTreeSet<String>,
}

impl PoolLevel {
    pub fn new(
        key: LevelKey,
        scenario_name: impl Into<String>,
        symbol: impl Into<String>,
        entry_pct: f64,
        exit_pct: f64,
        shares: u32,
    ) -> Self {
        Self {
            key,
            scenario_name: scenario_name.into(),
            symbol: symbol.into(),
            entry_pct,
            exit_pct,
            guardian_pct: None,
            shares,
            base_price: None,
            entry_price: None,
            exit_price: None,
            guardian_price: None,
            status: LevelStatus::Available,
            activated_at: None,
            deactivated_at: None,
            activation_count: 0,
            success_count: 0,
            fail_count: 0,
            last_score: 0.0,
            avg_hold_time_sec: 0.0,
            tags: BTreeSet::new(),
        }
    }

    /// Profit potential of the full entry->exit traversal, percent.
    pub fn profit_potential_pct(&self) -> f64 {
        match self.key.side {
            Side::Long => self.exit_pct - self.entry_pct,
            Side::Short => self.entry_pct - self.exit_pct,
        }
    }

    /// Distance between entry and exit, percent.
    pub fn step_size_pct(&self) -> f64 {
        (self.exit_pct - self.entry_pct).abs()
    }

    /// Undefined until at least one decided outcome exists.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            None
        } else {
            Some(self.success_count as f64 / total as f64)
        }
    }

    /// Fix absolute prices against a base price on activation.
    pub fn calculate_prices(&mut self, base_price: f64) {
        self.base_price = Some(base_price);
        self.entry_price = Some(base_price * (1.0 + self.entry_pct / 100.0));
        self.exit_price = Some(base_price * (1.0 + self.exit_pct / 100.0));
        self.guardian_price = self
            .guardian_pct
            .map(|pct| base_price * (1.0 + pct / 100.0));
    }

    fn mark_activated(&mut self, now: DateTime<Utc>, score: f64) {
        self.status = LevelStatus::Active;
        self.activated_at = Some(now);
        self.activation_count += 1;
        self.last_score = score;
    }

    fn mark_deactivated(&mut self, now: DateTime<Utc>, success: bool) {
        self.deactivated_at = Some(now);

        if let Some(activated_at) = self.activated_at {
            let hold_time = (now - activated_at).num_milliseconds() as f64 / 1000.0;
            if self.activation_count > 1 {
                let n = self.activation_count as f64;
                self.avg_hold_time_sec = (self.avg_hold_time_sec * (n - 1.0) + hold_time) / n;
            } else {
                self.avg_hold_time_sec = hold_time;
            }
        }

        if success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }

        self.status = LevelStatus::Cooldown;
    }
}

/// Scenario input for pool import (produced by the external grid generator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub scenario_id: String,
    pub scenario_name: String,
    pub symbol: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub levels: Vec<ScenarioLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioLevel {
    pub level_num: u32,
    pub side: Side,
    pub entry_pct: f64,
    pub exit_pct: f64,
    #[serde(default)]
    pub guardian_pct: Option<f64>,
    pub shares: u32,
}

/// Search criteria for [`LevelPool::filter`].
#[derive(Debug, Clone, Default)]
pub struct LevelFilter {
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub status: Option<LevelStatus>,
    pub min_profit_pct: Option<f64>,
    pub min_step_pct: Option<f64>,
    pub max_step_pct: Option<f64>,
    pub required_tags: Vec<String>,
}

/// Aggregate statistics over the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub total_levels: usize,
    pub by_status: HashMap<String, usize>,
    pub by_symbol: HashMap<String, usize>,
    pub total_activations: u64,
    pub total_successes: u64,
    pub total_fails: u64,
    pub overall_success_rate: Option<f64>,
}

const POOL_STORE_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize)]
struct PoolStore {
    version: String,
    saved_at: DateTime<Utc>,
    levels: Vec<PoolLevel>,
}

struct PoolInner {
    levels: HashMap<LevelKey, PoolLevel>,
    by_symbol: HashMap<String, HashSet<LevelKey>>,
    by_scenario: HashMap<String, HashSet<LevelKey>>,
    by_status: HashMap<LevelStatus, HashSet<LevelKey>>,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            levels: HashMap::new(),
            by_symbol: HashMap::new(),
            by_scenario: HashMap::new(),
            by_status: LevelStatus::ALL
                .iter()
                .map(|s| (*s, HashSet::new()))
                .collect(),
        }
    }

    fn index_add(&mut self, level: &PoolLevel) {
        self.by_symbol
            .entry(level.symbol.clone())
            .or_default()
            .insert(level.key.clone());
        self.by_scenario
            .entry(level.key.scenario_id.clone())
            .or_default()
            .insert(level.key.clone());
        self.by_status
            .get_mut(&level.status)
            .expect("all statuses indexed")
            .insert(level.key.clone());
    }

    fn index_remove(&mut self, level: &PoolLevel) {
        if let Some(keys) = self.by_symbol.get_mut(&level.symbol) {
            keys.remove(&level.key);
        }
        if let Some(keys) = self.by_scenario.get_mut(&level.key.scenario_id) {
            keys.remove(&level.key);
        }
        if let Some(keys) = self.by_status.get_mut(&level.status) {
            keys.remove(&level.key);
        }
    }

    /// Exactly one status-index remove plus one add per transition.
    fn move_status(&mut self, key: &LevelKey, to: LevelStatus) {
        let from = self.levels[key].status;
        self.by_status.get_mut(&from).expect("indexed").remove(key);
        self.by_status
            .get_mut(&to)
            .expect("indexed")
            .insert(key.clone());
    }

    fn collect(&self, keys: impl IntoIterator<Item = LevelKey>) -> Vec<PoolLevel> {
        keys.into_iter()
            .filter_map(|k| self.levels.get(&k).cloned())
            .collect()
    }
}

/// Thread-safe level registry. All mutations take the internal lock; readers
/// receive owned snapshots.
pub struct LevelPool {
    inner: Mutex<PoolInner>,
}

impl LevelPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::new()),
        }
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    /// Add a level. Returns false when the identity already exists.
    pub fn add(&self, level: PoolLevel) -> bool {
        let mut inner = self.inner.lock();
        if inner.levels.contains_key(&level.key) {
            return false;
        }
        inner.index_add(&level);
        inner.levels.insert(level.key.clone(), level);
        true
    }

    /// Remove a level. Returns false when the identity is unknown.
    pub fn remove(&self, key: &LevelKey) -> bool {
        let mut inner = self.inner.lock();
        let Some(level) = inner.levels.remove(key) else {
            return false;
        };
        inner.index_remove(&level);
        true
    }

    pub fn get(&self, key: &LevelKey) -> Option<PoolLevel> {
        self.inner.lock().levels.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Lifecycle transitions
    // -------------------------------------------------------------------------

    /// Transition a level into ACTIVE, recording score and activation time.
    pub fn mark_activated(&self, key: &LevelKey, score: f64, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.levels.contains_key(key) {
            return false;
        }
        inner.move_status(key, LevelStatus::Active);
        inner
            .levels
            .get_mut(key)
            .expect("checked above")
            .mark_activated(now, score);
        true
    }

    /// Transition a level out of the engaged states into COOLDOWN, recording
    /// hold time and the outcome.
    pub fn mark_deactivated(&self, key: &LevelKey, success: bool, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.levels.contains_key(key) {
            return false;
        }
        inner.move_status(key, LevelStatus::Cooldown);
        inner
            .levels
            .get_mut(key)
            .expect("checked above")
            .mark_deactivated(now, success);
        true
    }

    /// Plain status transition without statistics bookkeeping (WAITING,
    /// IN_POSITION, BLOCKED, back to AVAILABLE on entry cancel).
    pub fn set_status(&self, key: &LevelKey, status: LevelStatus) -> bool {
        let mut inner = self.inner.lock();
        if !inner.levels.contains_key(key) {
            return false;
        }
        inner.move_status(key, status);
        inner.levels.get_mut(key).expect("checked above").status = status;
        true
    }

    /// Fix the absolute prices of a level against `base_price`.
    pub fn set_prices(&self, key: &LevelKey, base_price: f64) -> bool {
        let mut inner = self.inner.lock();
        match inner.levels.get_mut(key) {
            Some(level) => {
                level.calculate_prices(base_price);
                true
            }
            None => false,
        }
    }

    /// Return COOLDOWN levels older than `cooldown_secs` to AVAILABLE.
    /// Returns the number of recycled levels.
    pub fn check_cooldowns(&self, cooldown_secs: i64, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let cooling: Vec<LevelKey> = inner.by_status[&LevelStatus::Cooldown]
            .iter()
            .cloned()
            .collect();

        let mut recycled = 0;
        for key in cooling {
            let expired = inner.levels.get(&key).is_some_and(|level| {
                level
                    .deactivated_at
                    .is_some_and(|at| (now - at).num_seconds() >= cooldown_secs)
            });
            if expired {
                inner.move_status(&key, LevelStatus::Available);
                inner.levels.get_mut(&key).expect("present").status = LevelStatus::Available;
                recycled += 1;
            }
        }
        recycled
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn all(&self) -> Vec<PoolLevel> {
        self.inner.lock().levels.values().cloned().collect()
    }

    pub fn by_symbol(&self, symbol: &str) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        let keys: Vec<LevelKey> = inner
            .by_symbol
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        inner.collect(keys)
    }

    pub fn by_scenario(&self, scenario_id: &str) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        let keys: Vec<LevelKey> = inner
            .by_scenario
            .get(scenario_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        inner.collect(keys)
    }

    pub fn by_status(&self, status: LevelStatus) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        let keys: Vec<LevelKey> = inner.by_status[&status].iter().cloned().collect();
        inner.collect(keys)
    }

    /// AVAILABLE levels, optionally narrowed to one symbol. COOLDOWN and
    /// BLOCKED levels are never returned here.
    pub fn available(&self, symbol: Option<&str>) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        let available = &inner.by_status[&LevelStatus::Available];
        let keys: Vec<LevelKey> = match symbol {
            Some(sym) => match inner.by_symbol.get(sym) {
                Some(sym_keys) => available.intersection(sym_keys).cloned().collect(),
                None => Vec::new(),
            },
            None => available.iter().cloned().collect(),
        };
        inner.collect(keys)
    }

    /// Engaged (ACTIVE | WAITING | IN_POSITION) levels, optionally narrowed
    /// to one symbol.
    pub fn engaged(&self, symbol: Option<&str>) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        let mut keys: HashSet<LevelKey> = HashSet::new();
        for status in [
            LevelStatus::Active,
            LevelStatus::Waiting,
            LevelStatus::InPosition,
        ] {
            keys.extend(inner.by_status[&status].iter().cloned());
        }
        if let Some(sym) = symbol {
            match inner.by_symbol.get(sym) {
                Some(sym_keys) => keys.retain(|k| sym_keys.contains(k)),
                None => keys.clear(),
            }
        }
        inner.collect(keys)
    }

    pub fn filter(&self, criteria: &LevelFilter) -> Vec<PoolLevel> {
        let inner = self.inner.lock();
        inner
            .levels
            .values()
            .filter(|level| {
                if let Some(symbol) = &criteria.symbol {
                    if &level.symbol != symbol {
                        return false;
                    }
                }
                if let Some(side) = criteria.side {
                    if level.key.side != side {
                        return false;
                    }
                }
                if let Some(status) = criteria.status {
                    if level.status != status {
                        return false;
                    }
                }
                if let Some(min_profit) = criteria.min_profit_pct {
                    if level.profit_potential_pct() < min_profit {
                        return false;
                    }
                }
                let step = level.step_size_pct();
                if let Some(min_step) = criteria.min_step_pct {
                    if step < min_step {
                        return false;
                    }
                }
                if let Some(max_step) = criteria.max_step_pct {
                    if step > max_step {
                        return false;
                    }
                }
                criteria
                    .required_tags
                    .iter()
                    .all(|tag| level.tags.contains(tag))
            })
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> PoolStatistics {
        let inner = self.inner.lock();

        let by_status = inner
            .by_status
            .iter()
            .map(|(status, keys)| (status.to_string(), keys.len()))
            .collect();
        let by_symbol = inner
            .by_symbol
            .iter()
            .map(|(symbol, keys)| (symbol.clone(), keys.len()))
            .collect();

        let total_activations: u64 = inner
            .levels
            .values()
            .map(|l| l.activation_count as u64)
            .sum();
        let total_successes: u64 = inner.levels.values().map(|l| l.success_count as u64).sum();
        let total_fails: u64 = inner.levels.values().map(|l| l.fail_count as u64).sum();

        let decided = total_successes + total_fails;
        let overall_success_rate = if decided > 0 {
            Some(total_successes as f64 / decided as f64)
        } else {
            None
        };

        PoolStatistics {
            total_levels: inner.levels.len(),
            by_status,
            by_symbol,
            total_activations,
            total_successes,
            total_fails,
            overall_success_rate,
        }
    }

    // -------------------------------------------------------------------------
    // Scenario import
    // -------------------------------------------------------------------------

    /// Import levels from scenario templates. Existing identities are kept
    /// untouched. Returns the number of levels imported.
    pub fn import_from_scenarios(&self, scenarios: &[ScenarioSpec]) -> usize {
        let mut imported = 0;

        for scenario in scenarios {
            for spec in &scenario.levels {
                let key = LevelKey {
                    scenario_id: scenario.scenario_id.clone(),
                    level_num: spec.level_num,
                    side: spec.side,
                };

                let mut level = PoolLevel::new(
                    key,
                    scenario.scenario_name.clone(),
                    scenario.symbol.clone(),
                    spec.entry_pct,
                    spec.exit_pct,
                    spec.shares,
                );
                level.guardian_pct = spec.guardian_pct;
                level.tags.extend(scenario.tags.iter().cloned());

                let step = level.step_size_pct();
                let volatility_tag = if step > 0.8 {
                    "high_volatility"
                } else if step > 0.4 {
                    "medium_volatility"
                } else {
                    "low_volatility"
                };
                level.tags.insert(volatility_tag.to_string());

                if self.add(level) {
                    imported += 1;
                }
            }
        }

        info!(imported, total = self.len(), "scenario import finished");
        imported
    }

    pub fn clear(&self) {
        *self.inner.lock() = PoolInner::new();
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn save(&self, path: impl AsRef<Path>, now: DateTime<Utc>) -> Result<()> {
        let path = path.as_ref();
        let store = PoolStore {
            version: POOL_STORE_VERSION.to_string(),
            saved_at: now,
            levels: self.all(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(&store).context("failed to serialise level pool")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename to {}", path.display()))?;

        Ok(())
    }

    /// Load the pool from disk, replacing current contents. Returns the
    /// number of loaded levels; a missing or corrupt store loads as empty.
    pub fn load(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        if !path.exists() {
            return 0;
        }

        let store: Option<PoolStore> = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());

        let Some(store) = store else {
            warn!(path = %path.display(), "corrupt level pool store, starting empty");
            self.clear();
            return 0;
        };

        self.clear();
        let mut loaded = 0;
        for level in store.levels {
            if self.add(level) {
                loaded += 1;
            }
        }
        loaded
    }
}

impl Default for LevelPool {
    fn default() -> Self {
        Self::new()
    }
}
