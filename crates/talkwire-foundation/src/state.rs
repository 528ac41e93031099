use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

/// Lifecycle of one capture session.
///
/// `Closed` is terminal and only reachable through explicit disposal;
/// the press/release cycle moves Idle -> Starting -> Recording ->
/// Stopping -> Idle, so a session is reusable across gestures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Closed,
}

impl SessionState {
    /// Compact encoding for the telemetry gauge.
    pub fn as_u8(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Starting => 1,
            SessionState::Recording => 2,
            SessionState::Stopping => 3,
            SessionState::Closed => 4,
        }
    }
}

pub struct SessionStateMachine {
    state: Arc<RwLock<SessionState>>,
    state_tx: Sender<SessionState>,
    state_rx: Receiver<SessionState>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(SessionState::Idle)),
            state_tx,
            state_rx,
        }
    }

    pub fn transition(&self, new_state: SessionState) -> Result<(), AppError> {
        let mut current = self.state.write();

        // Starting -> Idle covers device-acquisition failure; everything
        // else is the normal gesture cycle plus disposal from any state.
        let valid = matches!(
            (&*current, &new_state),
            (SessionState::Idle, SessionState::Starting)
                | (SessionState::Starting, SessionState::Recording)
                | (SessionState::Starting, SessionState::Stopping)
                | (SessionState::Starting, SessionState::Idle)
                | (SessionState::Recording, SessionState::Stopping)
                | (SessionState::Stopping, SessionState::Idle)
                | (SessionState::Idle, SessionState::Closed)
                | (SessionState::Starting, SessionState::Closed)
                | (SessionState::Recording, SessionState::Closed)
                | (SessionState::Stopping, SessionState::Closed)
        );

        if !valid {
            return Err(AppError::State(format!(
                "{:?} -> {:?}",
                *current, new_state
            )));
        }

        tracing::debug!("session state: {:?} -> {:?}", *current, new_state);
        *current = new_state;
        let _ = self.state_tx.send(new_state);
        Ok(())
    }

    pub fn current(&self) -> SessionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> Receiver<SessionState> {
        self.state_rx.clone()
    }
}
