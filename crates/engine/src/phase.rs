use serde::Serialize;

use crate::sport::SportState;

/// Session lifecycle. `Stopping` only exists for the duration of the stop sequence;
/// it is what makes a second stop (local or echoed) a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {from:?}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Fresh,
    Resumed,
}

/// What a sport state reported by the machine means in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    BeginSession,
    Resume,
    Pause,
    Stop,
    Ignore,
}

impl Phase {
    pub fn in_session(self) -> bool { matches!(self, Phase::Running | Phase::Paused) }

    pub fn can_start(self) -> bool { matches!(self, Phase::Idle | Phase::Paused | Phase::Finished) }

    pub fn begin(&mut self) -> Result<Entry, IllegalTransition> {
        let entry = match *self {
            Phase::Idle | Phase::Finished => Entry::Fresh,
            Phase::Paused => Entry::Resumed,
            from => return Err(IllegalTransition { from, action: "start" }),
        };
        *self = Phase::Running;
        Ok(entry)
    }

    pub fn pause(&mut self) -> Result<(), IllegalTransition> {
        self.step(Phase::Running, Phase::Paused, "pause")
    }

    pub fn begin_stop(&mut self) -> Result<(), IllegalTransition> {
        match *self {
            Phase::Running | Phase::Paused => {
                *self = Phase::Stopping;
                Ok(())
            }
            from => Err(IllegalTransition { from, action: "stop" }),
        }
    }

    pub fn finish(&mut self) -> Result<(), IllegalTransition> {
        self.step(Phase::Stopping, Phase::Finished, "finish")
    }

    fn step(&mut self, from: Phase, to: Phase, action: &'static str) -> Result<(), IllegalTransition> {
        if *self != from {
            return Err(IllegalTransition { from: *self, action });
        }
        *self = to;
        Ok(())
    }

    pub fn remote_action(self, observed: SportState) -> RemoteAction {
        match (self, observed) {
            (Phase::Idle | Phase::Finished, SportState::Start) => RemoteAction::BeginSession,
            (Phase::Paused, SportState::Start) => RemoteAction::Resume,
            (Phase::Running, SportState::Pause) => RemoteAction::Pause,
            (Phase::Running | Phase::Paused, SportState::Stop) => RemoteAction::Stop,
            _ => RemoteAction::Ignore,
        }
    }
}
