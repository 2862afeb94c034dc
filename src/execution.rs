// =============================================================================
// Execution Manager - priority command queue with typed handlers and retry
// =============================================================================
//
// The one component allowed to talk to the broker boundary. Commands carry a
// typed payload, a priority (CRITICAL > HIGH > NORMAL > LOW, FIFO within a
// priority), and retry bookkeeping. Handlers are registered per command type
// and return success or a failure message; failures re-enqueue the same
// command (identity and attempt count preserved) until max_attempts is
// exhausted.
//
// Emergency mode short-circuits the queue: only EMERGENCY_STOP commands are
// popped, and the emergency command itself jumps to the queue head with a
// short timeout and a single attempt.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::level_pool::LevelKey;
use crate::types::{OrderType, Side};

/// Broker-bound command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    ActivateLevel,
    DeactivateLevel,
    StopTrade,
    ClosePosition,
    ModifyLevel,
    EmergencyStop,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActivateLevel => write!(f, "ACTIVATE_LEVEL"),
            Self::DeactivateLevel => write!(f, "DEACTIVATE_LEVEL"),
            Self::StopTrade => write!(f, "STOP_TRADE"),
            Self::ClosePosition => write!(f, "CLOSE_POSITION"),
            Self::ModifyLevel => write!(f, "MODIFY_LEVEL"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// Execution state of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Command priority. Higher pops first; equal priorities pop in enqueue
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExecutionPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl ExecutionPriority {
    fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for ExecutionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Normal => write!(f, "NORMAL"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Typed command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandPayload {
    ActivateLevel {
        key: LevelKey,
        symbol: String,
        side: Side,
        entry_price: f64,
        exit_price: f64,
        shares: u32,
        score: f64,
        reason: String,
    },
    DeactivateLevel {
        key: LevelKey,
        reason: String,
        /// True when the level's open position should survive as an orphan.
        keep_position: bool,
    },
    StopTrade {
        key: LevelKey,
        reason: String,
    },
    ClosePosition {
        symbol: String,
        quantity: i64,
        order_type: OrderType,
        reason: String,
    },
    ModifyLevel {
        key: LevelKey,
        entry_price: f64,
        exit_price: f64,
    },
    EmergencyStop {
        reason: String,
    },
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::ActivateLevel { .. } => CommandType::ActivateLevel,
            Self::DeactivateLevel { .. } => CommandType::DeactivateLevel,
            Self::StopTrade { .. } => CommandType::StopTrade,
            Self::ClosePosition { .. } => CommandType::ClosePosition,
            Self::ModifyLevel { .. } => CommandType::ModifyLevel,
            Self::EmergencyStop { .. } => CommandType::EmergencyStop,
        }
    }
}

/// A queued or executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    pub command_id: String,
    pub payload: CommandPayload,
    pub priority: ExecutionPriority,
    pub created_at: DateTime<Utc>,

    pub status: CommandStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub last_error: String,

    pub result_message: Option<String>,
    pub success: bool,

    /// Enqueue sequence, the FIFO tie-breaker within a priority.
    sequence: u64,
}

impl ExecutionCommand {
    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub retried_commands: u64,
    pub average_execution_time_ms: f64,
    pub commands_per_minute: usize,
}

pub type CommandHandler = Box<dyn Fn(&CommandPayload) -> Result<String, String> + Send + Sync>;

const TIMING_WINDOW: usize = 100;

struct Inner {
    queue: Vec<ExecutionCommand>,
    history: VecDeque<ExecutionCommand>,
    next_sequence: u64,

    total_commands: u64,
    successful_commands: u64,
    failed_commands: u64,
    retried_commands: u64,
    execution_times_ms: VecDeque<f64>,
    completion_timestamps: VecDeque<DateTime<Utc>>,

    paused: bool,
    emergency_mode: bool,
}

/// Priority command queue with retry and typed handlers.
pub struct ExecutionManager {
    max_queue_size: usize,
    default_timeout_secs: u64,
    default_max_attempts: u32,
    history_size: usize,
    clock: Clock,

    inner: Mutex<Inner>,
    handlers: Mutex<HashMap<CommandType, CommandHandler>>,
}

impl ExecutionManager {
    pub fn new(max_queue_size: usize, clock: Clock) -> Self {
        Self {
            max_queue_size,
            default_timeout_secs: 30,
            default_max_attempts: 3,
            history_size: 1000,
            clock,
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                history: VecDeque::new(),
                next_sequence: 0,
                total_commands: 0,
                successful_commands: 0,
                failed_commands: 0,
                retried_commands: 0,
                execution_times_ms: VecDeque::new(),
                completion_timestamps: VecDeque::new(),
                paused: false,
                emergency_mode: false,
            }),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Command creation
    // -------------------------------------------------------------------------

    pub fn create_command(
        &self,
        payload: CommandPayload,
        priority: ExecutionPriority,
    ) -> ExecutionCommand {
        ExecutionCommand {
            command_id: short_id(),
            payload,
            priority,
            created_at: self.clock.now_utc(),
            status: CommandStatus::Pending,
            started_at: None,
            completed_at: None,
            attempt: 0,
            max_attempts: self.default_max_attempts,
            timeout_secs: self.default_timeout_secs,
            last_error: String::new(),
            result_message: None,
            success: false,
            sequence: 0,
        }
    }

    /// Enqueue a payload with the given priority. Returns the command id, or
    /// None when the queue is full and nothing could be evicted.
    pub fn submit(&self, payload: CommandPayload, priority: ExecutionPriority) -> Option<String> {
        let command = self.create_command(payload, priority);
        let id = command.command_id.clone();
        if self.enqueue(command) {
            Some(id)
        } else {
            None
        }
    }

    /// Emergency stop: enters emergency mode and jumps the queue head.
    /// Short timeout, single attempt.
    pub fn emergency_stop(&self, reason: impl Into<String>) -> String {
        let reason = reason.into();
        let mut command = self.create_command(
            CommandPayload::EmergencyStop {
                reason: reason.clone(),
            },
            ExecutionPriority::Critical,
        );
        command.timeout_secs = 5;
        command.max_attempts = 1;
        let id = command.command_id.clone();

        let mut inner = self.inner.lock();
        inner.emergency_mode = true;
        command.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.queue.insert(0, command);

        warn!(reason = %reason, "emergency stop enqueued at queue head");
        id
    }

    // -------------------------------------------------------------------------
    // Queue management
    // -------------------------------------------------------------------------

    /// Enqueue a command. On a full queue the first LOW-priority command is
    /// evicted; without one, the enqueue is rejected.
    pub fn enqueue(&self, mut command: ExecutionCommand) -> bool {
        let mut inner = self.inner.lock();

        if inner.queue.len() >= self.max_queue_size {
            let low_idx = inner
                .queue
                .iter()
                .position(|c| c.priority == ExecutionPriority::Low);
            match low_idx {
                Some(idx) => {
                    let evicted = inner.queue.remove(idx);
                    debug!(
                        command_id = %evicted.command_id,
                        "evicted LOW-priority command from full queue"
                    );
                }
                None => {
                    warn!(command_id = %command.command_id, "queue full, command rejected");
                    return false;
                }
            }
        }

        if command.attempt == 0 {
            command.sequence = inner.next_sequence;
            inner.next_sequence += 1;
        }
        inner.queue.push(command);
        inner
            .queue
            .sort_by_key(|c| (c.priority.rank(), c.created_at, c.sequence));
        true
    }

    /// Pop the next executable command, honouring pause and emergency mode.
    pub fn next_command(&self) -> Option<ExecutionCommand> {
        let mut inner = self.inner.lock();

        if inner.paused && !inner.emergency_mode {
            return None;
        }
        if inner.queue.is_empty() {
            return None;
        }

        if inner.emergency_mode {
            let idx = inner
                .queue
                .iter()
                .position(|c| c.command_type() == CommandType::EmergencyStop)?;
            return Some(inner.queue.remove(idx));
        }

        Some(inner.queue.remove(0))
    }

    /// Cancel a pending command by id.
    pub fn cancel_command(&self, command_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.queue.iter().position(|c| c.command_id == command_id) else {
            return false;
        };
        let mut command = inner.queue.remove(idx);
        command.status = CommandStatus::Cancelled;
        push_history(&mut inner, command, self.history_size);
        true
    }

    /// Drop queued commands, optionally keeping CRITICAL ones.
    pub fn clear_queue(&self, keep_critical: bool) {
        let mut inner = self.inner.lock();
        if keep_critical {
            inner
                .queue
                .retain(|c| c.priority == ExecutionPriority::Critical);
        } else {
            inner.queue.clear();
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Pop and execute the next command, if any.
    pub fn execute_next(&self) -> Option<ExecutionCommand> {
        let command = self.next_command()?;
        Some(self.execute_command(command))
    }

    /// Drain the queue, executing until nothing pops.
    pub fn execute_all_pending(&self) -> Vec<ExecutionCommand> {
        let mut executed = Vec::new();
        while let Some(command) = self.execute_next() {
            executed.push(command);
        }
        executed
    }

    /// Execute one command through its registered handler, with retry on
    /// failure.
    pub fn execute_command(&self, mut command: ExecutionCommand) -> ExecutionCommand {
        command.status = CommandStatus::Executing;
        command.started_at = Some(self.clock.now_utc());
        command.attempt += 1;

        let started = Instant::now();
        let outcome = {
            let handlers = self.handlers.lock();
            handlers
                .get(&command.command_type())
                .map(|handler| handler(&command.payload))
        };

        match outcome {
            None => {
                command.status = CommandStatus::Failed;
                command.last_error = format!("no handler for {}", command.command_type());
                command.success = false;
                self.inner.lock().failed_commands += 1;
            }
            Some(Ok(message)) => {
                command.status = CommandStatus::Completed;
                command.success = true;
                command.result_message = Some(message);
                self.inner.lock().successful_commands += 1;
            }
            Some(Err(error)) => {
                command.last_error = error;
                if command.can_retry() {
                    command.status = CommandStatus::Retrying;
                    {
                        let mut inner = self.inner.lock();
                        if command.attempt == 1 {
                            inner.retried_commands += 1;
                        }
                    }
                    debug!(
                        command_id = %command.command_id,
                        attempt = command.attempt,
                        error = %command.last_error,
                        "command failed, re-enqueueing"
                    );
                    self.enqueue(command.clone());
                    return command;
                }
                command.status = CommandStatus::Failed;
                command.success = false;
                self.inner.lock().failed_commands += 1;
            }
        }

        // Final disposition: record completion, timing, and history.
        command.completed_at = Some(self.clock.now_utc());

        let mut inner = self.inner.lock();
        inner.total_commands += 1;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        inner.execution_times_ms.push_back(elapsed_ms);
        while inner.execution_times_ms.len() > TIMING_WINDOW {
            inner.execution_times_ms.pop_front();
        }

        let now = self.clock.now_utc();
        inner.completion_timestamps.push_back(now);
        while inner.completion_timestamps.len() > TIMING_WINDOW {
            inner.completion_timestamps.pop_front();
        }

        push_history(&mut inner, command.clone(), self.history_size);
        drop(inner);

        if command.success {
            info!(
                command_id = %command.command_id,
                command_type = %command.command_type(),
                attempt = command.attempt,
                "command completed"
            );
        } else {
            warn!(
                command_id = %command.command_id,
                command_type = %command.command_type(),
                error = %command.last_error,
                "command failed permanently"
            );
        }

        command
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    /// Register the handler for one command type. Handlers return the result
    /// message on success or the failure reason.
    pub fn register_handler(
        &self,
        command_type: CommandType,
        handler: impl Fn(&CommandPayload) -> Result<String, String> + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(command_type, Box::new(handler));
    }

    pub fn unregister_handler(&self, command_type: CommandType) {
        self.handlers.lock().remove(&command_type);
    }

    // -------------------------------------------------------------------------
    // State & stats
    // -------------------------------------------------------------------------

    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn enter_emergency_mode(&self) {
        self.inner.lock().emergency_mode = true;
    }

    pub fn exit_emergency_mode(&self) {
        self.inner.lock().emergency_mode = false;
    }

    pub fn is_emergency(&self) -> bool {
        self.inner.lock().emergency_mode
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn pending_commands(&self) -> Vec<ExecutionCommand> {
        self.inner.lock().queue.clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        let inner = self.inner.lock();

        let average_execution_time_ms = if inner.execution_times_ms.is_empty() {
            0.0
        } else {
            inner.execution_times_ms.iter().sum::<f64>() / inner.execution_times_ms.len() as f64
        };

        let minute_ago = self.clock.now_utc() - Duration::minutes(1);
        let commands_per_minute = inner
            .completion_timestamps
            .iter()
            .filter(|t| **t > minute_ago)
            .count();

        ExecutionStats {
            total_commands: inner.total_commands,
            successful_commands: inner.successful_commands,
            failed_commands: inner.failed_commands,
            retried_commands: inner.retried_commands,
            average_execution_time_ms,
            commands_per_minute,
        }
    }

    pub fn recent_history(&self, count: usize) -> Vec<ExecutionCommand> {
        let inner = self.inner.lock();
        let start = inner.history.len().saturating_sub(count);
        inner.history.iter().skip(start).cloned().collect()
    }

    /// Status of a command, searched in the queue first, then the history.
    pub fn command_status(&self, command_id: &str) -> Option<CommandStatus> {
        let inner = self.inner.lock();
        inner
            .queue
            .iter()
            .chain(inner.history.iter())
            .find(|c| c.command_id == command_id)
            .map(|c| c.status)
    }
}

fn push_history(inner: &mut Inner, command: ExecutionCommand, cap: usize) {
    inner.history.push_back(command);
    while inner.history.len() > cap {
        inner.history.pop_front();
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> ExecutionManager {
        ExecutionManager::new(100, Clock::fixed_ny(2024, 3, 12, 11, 0, 0))
    }

    fn key(num: u32) -> LevelKey {
        LevelKey {
            scenario_id: "scn-1".into(),
            level_num: num,
            side: Side::Long,
        }
    }

    fn deactivate_payload(num: u32) -> CommandPayload {
        CommandPayload::DeactivateLevel {
            key: key(num),
            reason: "test".into(),
            keep_position: false,
        }
    }

    fn ok_handler(manager: &ExecutionManager, command_type: CommandType) {
        manager.register_handler(command_type, |_payload| Ok("ok".into()));
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let m = manager();

        let low_1 = m.submit(deactivate_payload(1), ExecutionPriority::Low).unwrap();
        let normal_1 = m.submit(deactivate_payload(2), ExecutionPriority::Normal).unwrap();
        let high_1 = m.submit(deactivate_payload(3), ExecutionPriority::High).unwrap();
        let normal_2 = m.submit(deactivate_payload(4), ExecutionPriority::Normal).unwrap();
        let critical = m.submit(deactivate_payload(5), ExecutionPriority::Critical).unwrap();
        let high_2 = m.submit(deactivate_payload(6), ExecutionPriority::High).unwrap();

        let popped: Vec<String> = std::iter::from_fn(|| m.next_command())
            .map(|c| c.command_id)
            .collect();

        assert_eq!(
            popped,
            vec![critical, high_1, high_2, normal_1, normal_2, low_1]
        );
    }

    #[test]
    fn missing_handler_fails_the_command() {
        let m = manager();
        m.submit(deactivate_payload(1), ExecutionPriority::Normal);

        let executed = m.execute_next().unwrap();
        assert_eq!(executed.status, CommandStatus::Failed);
        assert!(executed.last_error.contains("no handler"));
        assert_eq!(m.stats().failed_commands, 1);
    }

    #[test]
    fn successful_execution_records_message() {
        let m = manager();
        ok_handler(&m, CommandType::DeactivateLevel);
        m.submit(deactivate_payload(1), ExecutionPriority::Normal);

        let executed = m.execute_next().unwrap();
        assert_eq!(executed.status, CommandStatus::Completed);
        assert!(executed.success);
        assert_eq!(executed.result_message.as_deref(), Some("ok"));
        assert_eq!(executed.attempt, 1);

        let stats = m.stats();
        assert_eq!(stats.total_commands, 1);
        assert_eq!(stats.successful_commands, 1);
        assert_eq!(stats.commands_per_minute, 1);
    }

    #[test]
    fn transient_failure_retries_to_success() {
        let m = manager();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        m.register_handler(CommandType::DeactivateLevel, move |_payload| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err("transient".into())
            } else {
                Ok("ok".into())
            }
        });

        let id = m.submit(deactivate_payload(1), ExecutionPriority::Normal).unwrap();

        // Attempts 1 and 2 fail and re-enqueue; attempt 3 completes.
        let executed = m.execute_all_pending();
        let last = executed.last().unwrap();

        assert_eq!(last.command_id, id);
        assert_eq!(last.status, CommandStatus::Completed);
        assert_eq!(last.attempt, 3);
        assert!(last.success);

        let stats = m.stats();
        assert_eq!(stats.retried_commands, 1);
        assert_eq!(stats.successful_commands, 1);
        assert_eq!(stats.failed_commands, 0);

        // Exactly one history record for the command.
        let records: Vec<_> = m
            .recent_history(50)
            .into_iter()
            .filter(|c| c.command_id == id)
            .collect();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn permanent_failure_exhausts_attempts() {
        let m = manager();
        m.register_handler(CommandType::DeactivateLevel, |_payload| {
            Err("broker unreachable".into())
        });

        m.submit(deactivate_payload(1), ExecutionPriority::Normal);
        let executed = m.execute_all_pending();
        let last = executed.last().unwrap();

        assert_eq!(last.status, CommandStatus::Failed);
        assert_eq!(last.attempt, 3);
        assert_eq!(last.last_error, "broker unreachable");
        assert_eq!(m.stats().failed_commands, 1);
    }

    #[test]
    fn pause_blocks_everything_but_emergency() {
        let m = manager();
        ok_handler(&m, CommandType::DeactivateLevel);
        ok_handler(&m, CommandType::EmergencyStop);

        m.submit(deactivate_payload(1), ExecutionPriority::Normal);
        m.pause();
        assert!(m.next_command().is_none());

        m.emergency_stop("halt");
        let popped = m.next_command().unwrap();
        assert_eq!(popped.command_type(), CommandType::EmergencyStop);

        m.resume();
        m.exit_emergency_mode();
        assert!(m.next_command().is_some());
    }

    #[test]
    fn emergency_mode_pops_only_emergency_commands() {
        let m = manager();
        m.submit(deactivate_payload(1), ExecutionPriority::Critical);
        let emergency_id = m.emergency_stop("black swan");

        // Despite the CRITICAL deactivation sitting in the queue, only the
        // emergency command pops.
        let popped = m.next_command().unwrap();
        assert_eq!(popped.command_id, emergency_id);
        assert_eq!(popped.max_attempts, 1);
        assert_eq!(popped.timeout_secs, 5);

        assert!(m.next_command().is_none());
        assert!(m.is_emergency());
    }

    #[test]
    fn clear_queue_can_keep_critical() {
        let m = manager();
        m.submit(deactivate_payload(1), ExecutionPriority::Low);
        m.submit(deactivate_payload(2), ExecutionPriority::Normal);
        m.submit(deactivate_payload(3), ExecutionPriority::Critical);

        m.clear_queue(true);
        assert_eq!(m.queue_len(), 1);
        assert_eq!(
            m.pending_commands()[0].priority,
            ExecutionPriority::Critical
        );

        m.clear_queue(false);
        assert_eq!(m.queue_len(), 0);
    }

    #[test]
    fn full_queue_evicts_low_priority_first() {
        let m = ExecutionManager::new(3, Clock::fixed_ny(2024, 3, 12, 11, 0, 0));

        let low = m.submit(deactivate_payload(1), ExecutionPriority::Low).unwrap();
        m.submit(deactivate_payload(2), ExecutionPriority::Normal);
        m.submit(deactivate_payload(3), ExecutionPriority::Normal);

        // Queue full: the LOW command gives way.
        assert!(m.submit(deactivate_payload(4), ExecutionPriority::High).is_some());
        assert_eq!(m.queue_len(), 3);
        assert!(m.pending_commands().iter().all(|c| c.command_id != low));

        // Full again with no LOW left: rejection.
        assert!(m.submit(deactivate_payload(5), ExecutionPriority::Normal).is_none());
    }

    #[test]
    fn cancel_removes_pending_command() {
        let m = manager();
        let id = m.submit(deactivate_payload(1), ExecutionPriority::Normal).unwrap();

        assert!(m.cancel_command(&id));
        assert_eq!(m.queue_len(), 0);
        assert_eq!(m.command_status(&id), Some(CommandStatus::Cancelled));
        assert!(!m.cancel_command(&id));
    }

    #[test]
    fn command_status_searches_queue_then_history() {
        let m = manager();
        ok_handler(&m, CommandType::DeactivateLevel);

        let queued = m.submit(deactivate_payload(1), ExecutionPriority::Normal).unwrap();
        assert_eq!(m.command_status(&queued), Some(CommandStatus::Pending));

        m.execute_next();
        assert_eq!(m.command_status(&queued), Some(CommandStatus::Completed));
        assert_eq!(m.command_status("nope"), None);
    }
}
