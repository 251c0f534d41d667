use thiserror::Error;

use crate::dao::models::MatchState;

/// Events that move a match along its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    /// Roster is full and every connected player is ready.
    AllReady,
    /// The countdown timer elapsed.
    CountdownElapsed,
    /// Control plane suspends gameplay.
    Pause,
    /// Control plane resumes gameplay.
    Resume,
    /// The match ends (explicit completion or duration expiry).
    Finish,
}

/// Error returned when an event cannot be applied in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from:?}")]
pub struct InvalidTransition {
    /// State the match was in when the event arrived.
    pub from: MatchState,
    /// Rejected event.
    pub event: MatchEvent,
}

/// Compute the state reached by applying `event` in `from`.
///
/// Every transition moves forward except `Pause`/`Resume`, which toggle between
/// `Active` and `Paused` without changing [`MatchState::progress`].
pub fn next_state(from: MatchState, event: MatchEvent) -> Result<MatchState, InvalidTransition> {
    let next = match (from, event) {
        (MatchState::Lobby, MatchEvent::AllReady) => MatchState::Countdown,
        (MatchState::Countdown, MatchEvent::CountdownElapsed) => MatchState::Active,
        (MatchState::Active, MatchEvent::Pause) => MatchState::Paused,
        (MatchState::Paused, MatchEvent::Resume) => MatchState::Active,
        (MatchState::Completed, MatchEvent::Finish) => return Err(InvalidTransition { from, event }),
        (_, MatchEvent::Finish) => MatchState::Completed,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}
