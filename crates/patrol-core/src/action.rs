//! Action command queue.
//!
//! The agent never executes actions itself: it queues action commands that
//! a monitor client drains on its own cadence, and it brokers the results
//! back to whoever asked. The queue is a plain FIFO plus a commandId →
//! result rendezvous table with a timed wait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// What an action command asks the monitor to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Fire the actions bound to an event.
    TriggerEvent,
    /// Bind a new action to an event.
    AddAction {
        /// Display name.
        name: String,
        /// Path of the QML page implementing the action.
        qml_path: String,
        /// Action parameters.
        params: Vec<String>,
        /// Insertion position, `None` appends.
        position: Option<u32>,
    },
    /// Replace an action bound to an event.
    EditAction {
        /// Index of the action being replaced.
        index: u32,
        /// Display name.
        name: String,
        /// Path of the QML page implementing the action.
        qml_path: String,
        /// Action parameters.
        params: Vec<String>,
    },
    /// Remove an action bound to an event.
    RemoveAction {
        /// Index of the action being removed.
        index: u32,
    },
    /// List the actions bound to an event.
    GetActions,
    /// List every known event.
    GetAllEvents,
    /// List the actions the monitor can bind.
    GetAvailableActions,
    /// Persist the current bindings.
    SaveActions,
}

/// One queued action command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCommand {
    /// Queue-assigned id, unique and monotonic. Zero before enqueue.
    #[serde(default)]
    pub command_id: u32,
    /// Event the command applies to.
    pub event_id: u32,
    /// The operation itself.
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionCommand {
    /// A trigger-event command for `event_id`.
    #[must_use]
    pub fn trigger(event_id: u32) -> Self {
        Self {
            command_id: 0,
            event_id,
            kind: ActionKind::TriggerEvent,
        }
    }
}

/// Result a monitor posts back for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// The command this answers.
    pub command_id: u32,
    /// Whether the monitor executed the command.
    pub success: bool,
    /// Command-specific result payload, opaque to the agent.
    #[serde(default)]
    pub data: serde_json::Value,
}

struct QueueState {
    next_id: u32,
    pending: VecDeque<ActionCommand>,
    results: HashMap<u32, ActionResult>,
}

/// FIFO of action commands plus the result rendezvous table.
pub struct ActionQueue {
    state: Mutex<QueueState>,
    /// Signals both new pending commands and newly stored results.
    changed: Condvar,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                pending: VecDeque::new(),
                results: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues `command`, assigning and returning its id.
    pub fn enqueue(&self, mut command: ActionCommand) -> u32 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id = match state.next_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        command.command_id = id;
        state.pending.push_back(command);
        self.changed.notify_all();
        id
    }

    /// Convenience for the common case: queue a trigger-event command.
    pub fn trigger_event(&self, event_id: u32) -> u32 {
        self.enqueue(ActionCommand::trigger(event_id))
    }

    /// Atomically drains every currently queued command, in insertion
    /// order.
    #[must_use]
    pub fn take_pending(&self) -> Vec<ActionCommand> {
        let mut state = self.lock();
        state.pending.drain(..).collect()
    }

    /// Whether any command is waiting to be drained.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Stores the result for a command and wakes its waiter.
    ///
    /// Results that arrive before anyone waits are buffered until claimed
    /// or until [`ActionQueue::clear`].
    pub fn store_result(&self, result: ActionResult) {
        let mut state = self.lock();
        state.results.insert(result.command_id, result);
        self.changed.notify_all();
    }

    /// Waits up to `timeout` for the result of `command_id`.
    ///
    /// A result is claimed by exactly one waiter; spurious wakeups are
    /// absorbed by looping until the deadline.
    #[must_use]
    pub fn wait_for_result(&self, command_id: u32, timeout: Duration) -> Option<ActionResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(result) = state.results.remove(&command_id) {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            let (next, _timed_out) = self
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
        }
    }

    /// Drops all pending commands and unclaimed results. Supervisor
    /// teardown only.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.results.clear();
        self.changed.notify_all();
    }
}
