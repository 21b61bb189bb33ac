use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::info;

use crate::metrics_consts::PIPELINE_STATE;

/// Lifecycle of a task's pipeline:
/// `Configured -> Assigned -> Streaming -> (Checkpointing <-> Streaming) -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Configured = 0,
    Assigned = 1,
    Streaming = 2,
    Checkpointing = 3,
    Stopped = 4,
}

const ALL_STATES: [PipelineState; 5] = [
    PipelineState::Configured,
    PipelineState::Assigned,
    PipelineState::Streaming,
    PipelineState::Checkpointing,
    PipelineState::Stopped,
];

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Configured => "configured",
            PipelineState::Assigned => "assigned",
            PipelineState::Streaming => "streaming",
            PipelineState::Checkpointing => "checkpointing",
            PipelineState::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        ALL_STATES
            .get(value as usize)
            .copied()
            .unwrap_or(PipelineState::Stopped)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free pipeline state. `Stopped` is terminal.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl Default for StateCell {
    fn default() -> Self {
        let cell = Self {
            state: AtomicU8::new(PipelineState::Configured as u8),
        };
        report(PipelineState::Configured);
        cell
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` unless already stopped. Returns false when the cell was stopped.
    pub fn set(&self, next: PipelineState) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != PipelineState::Stopped as u8).then_some(next as u8)
            });

        match result {
            Ok(previous) => {
                let previous = PipelineState::from_u8(previous);
                if previous != next {
                    info!(from = %previous, to = %next, "Pipeline state changed");
                    report(next);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Move from `expected` to `next`; no-op when the current state differs.
    pub fn transition(&self, expected: PipelineState, next: PipelineState) -> bool {
        if expected == PipelineState::Stopped {
            return false;
        }
        let swapped = self
            .state
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if swapped && expected != next {
            info!(from = %expected, to = %next, "Pipeline state changed");
            report(next);
        }
        swapped
    }
}

fn report(active: PipelineState) {
    for state in ALL_STATES {
        let value = if state == active { 1.0 } else { 0.0 };
        metrics::gauge!(PIPELINE_STATE, "state" => state.as_str()).set(value);
    }
}
