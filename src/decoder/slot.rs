//! Pairing state of one decoder slot.

use std::fmt;

use crate::error::{IngestError, Result};

/// Which halves of slot `j` are ready.
///
/// A slot is handed to the device exactly when both halves are, whatever the
/// order they became ready in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Input is with the assembler, output is with the consumer.
    Empty,
    /// Input filled, output still with the consumer.
    InputReady,
    /// Output free, input not filled yet.
    OutputReady,
    /// Submitted to the device.
    Queued,
}

impl SlotState {
    /// Input side became ready; `true` if the slot must be submitted now.
    pub fn fill_input(&mut self, index: usize) -> Result<bool> {
        self.step(index, "fill-input", |state| match state {
            SlotState::Empty => Some((SlotState::InputReady, false)),
            SlotState::OutputReady => Some((SlotState::Queued, true)),
            _ => None,
        })
    }

    /// Output side was returned; `true` if the slot must be submitted now.
    pub fn free_output(&mut self, index: usize) -> Result<bool> {
        self.step(index, "free-output", |state| match state {
            SlotState::Empty => Some((SlotState::OutputReady, false)),
            SlotState::InputReady => Some((SlotState::Queued, true)),
            _ => None,
        })
    }

    /// The device handed the pair back.
    pub fn complete(&mut self, index: usize) -> Result<()> {
        self.step(index, "complete", |state| match state {
            SlotState::Queued => Some((SlotState::Empty, ())),
            _ => None,
        })
    }

    fn step<T>(
        &mut self,
        index: usize,
        event: &'static str,
        next: impl FnOnce(SlotState) -> Option<(SlotState, T)>,
    ) -> Result<T> {
        match next(*self) {
            Some((state, out)) => {
                *self = state;
                Ok(out)
            }
            None => Err(IngestError::InvalidTransition {
                index,
                state: *self,
                event,
            }),
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Empty => "empty",
            SlotState::InputReady => "input-ready",
            SlotState::OutputReady => "output-ready",
            SlotState::Queued => "queued",
        };
        f.write_str(name)
    }
}
