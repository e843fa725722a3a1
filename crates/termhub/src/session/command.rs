//! Command bookkeeping: admission, dispatch order and completion.

use std::collections::VecDeque;

use uuid::Uuid;

use super::error::{SessionError, SessionId};
use super::multiplexer::now_millis;

/// Finished invocations kept for lookup.
const FINISHED_HISTORY: usize = 64;

/// Where an invocation is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationStatus::Queued => "queued",
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Cancelled => "cancelled",
            InvocationStatus::Failed => "failed",
        }
    }
}

/// One submitted command line. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub id: String,
    pub text: String,
    pub submitted_at: u64,
    pub dispatched_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub status: InvocationStatus,
}

impl CommandInvocation {
    fn new(text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            submitted_at: now_millis(),
            dispatched_at: None,
            completed_at: None,
            status: InvocationStatus::Queued,
        }
    }

    fn finish(&mut self, status: InvocationStatus) {
        self.status = status;
        self.completed_at = Some(now_millis());
    }
}

/// Admission and dispatch limits for a session's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Commands allowed to execute at once.
    pub max_in_flight: usize,
    /// Whether commands beyond the in-flight limit wait or are rejected.
    pub queue_commands: bool,
    /// Waiting commands allowed when queuing is enabled.
    pub max_queued: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            queue_commands: true,
            max_queued: 64,
        }
    }
}

/// Queued, in-flight and recently finished invocations of one session.
#[derive(Debug)]
pub struct CommandQueue {
    limits: QueueLimits,
    queued: VecDeque<CommandInvocation>,
    in_flight: VecDeque<CommandInvocation>,
    finished: VecDeque<CommandInvocation>,
}

impl CommandQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits: QueueLimits {
                max_in_flight: limits.max_in_flight.max(1),
                ..limits
            },
            queued: VecDeque::new(),
            in_flight: VecDeque::new(),
            finished: VecDeque::new(),
        }
    }

    /// Accepts a command for later dispatch, or rejects it with
    /// [`SessionError::Busy`] when the limits leave no room.
    pub fn admit(
        &mut self,
        session_id: &SessionId,
        text: String,
    ) -> Result<CommandInvocation, SessionError> {
        let full = if self.limits.queue_commands {
            self.queued.len() >= self.limits.max_queued
        } else {
            self.in_flight.len() + self.queued.len() >= self.limits.max_in_flight
        };

        if full {
            return Err(SessionError::Busy {
                id: session_id.clone(),
                in_flight: self.in_flight.len(),
                queued: self.queued.len(),
            });
        }

        let invocation = CommandInvocation::new(text);
        self.queued.push_back(invocation.clone());
        Ok(invocation)
    }

    /// Moves the oldest queued command to in-flight if the limit allows.
    pub fn next_dispatchable(&mut self) -> Option<CommandInvocation> {
        if self.in_flight.len() >= self.limits.max_in_flight {
            return None;
        }

        let mut invocation = self.queued.pop_front()?;
        invocation.status = InvocationStatus::Running;
        invocation.dispatched_at = Some(now_millis());
        self.in_flight.push_back(invocation.clone());
        Some(invocation)
    }

    /// Marks every in-flight command completed. Returns how many finished.
    pub fn complete_in_flight(&mut self) -> usize {
        self.finish_in_flight(InvocationStatus::Completed)
    }

    /// Marks one in-flight command failed.
    pub fn fail(&mut self, id: &str) {
        if let Some(pos) = self.in_flight.iter().position(|c| c.id == id) {
            if let Some(mut invocation) = self.in_flight.remove(pos) {
                invocation.finish(InvocationStatus::Failed);
                self.record(invocation);
            }
        }
    }

    /// Cancels everything queued or in flight. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let queued: Vec<_> = self.queued.drain(..).collect();
        let count = queued.len() + self.finish_in_flight(InvocationStatus::Cancelled);
        for mut invocation in queued {
            invocation.finish(InvocationStatus::Cancelled);
            self.record(invocation);
        }
        count
    }

    fn finish_in_flight(&mut self, status: InvocationStatus) -> usize {
        let done: Vec<_> = self.in_flight.drain(..).collect();
        let count = done.len();
        for mut invocation in done {
            invocation.finish(status);
            self.record(invocation);
        }
        count
    }

    fn record(&mut self, invocation: CommandInvocation) {
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back(invocation);
    }

    /// Looks up an invocation by id among live and recently finished ones.
    pub fn get(&self, id: &str) -> Option<CommandInvocation> {
        self.in_flight
            .iter()
            .chain(self.queued.iter())
            .chain(self.finished.iter().rev())
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queued.is_empty()
    }
}
