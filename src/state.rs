//! Whitelist-driven state machines.
//!
//! Every stateful owner in the kernel (SDK, camera session, effect slot,
//! recorder) runs the same generic controller: a closed set of states, a
//! closed set of events, and a whitelist table `(current, event) -> next`.
//! Anything not in the table is rejected with an error and leaves the stored
//! state untouched. There is no global lock; each owner keeps its machine
//! behind its own synchronization.
//!
//! The machines are pure values. Owners publish state-change events to the
//! dispatcher themselves, after a successful transition, while still holding
//! their own lock, so notification order always matches transition order.

use std::fmt;

use crate::error::{Error, ErrorCode, Result};

/// Generic finite-state controller over a static transition whitelist.
#[derive(Debug)]
pub struct StateMachine<S: 'static, E: 'static> {
    owner: &'static str,
    state: S,
    table: &'static [(S, E, S)],
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + PartialEq + fmt::Debug + 'static,
    E: Copy + PartialEq + fmt::Debug + 'static,
{
    pub fn new(owner: &'static str, initial: S, table: &'static [(S, E, S)]) -> Self {
        Self {
            owner,
            state: initial,
            table,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Apply an event. Returns the new state, or an error (state unchanged)
    /// if `(current, event)` is not whitelisted.
    pub fn handle(&mut self, event: E) -> Result<S> {
        for (from, ev, to) in self.table {
            if *from == self.state && *ev == event {
                log::debug!("{}: {:?} --{:?}--> {:?}", self.owner, self.state, event, to);
                self.state = *to;
                return Ok(*to);
            }
        }
        Err(Error::new(
            ErrorCode::InvalidParameter,
            format!(
                "{}: illegal transition {:?} from {:?}",
                self.owner, event, self.state
            ),
        ))
    }

    /// True if the event would be accepted in the current state.
    pub fn accepts(&self, event: E) -> bool {
        self.table
            .iter()
            .any(|(from, ev, _)| *from == self.state && *ev == event)
    }
}

// -------------------- SDK --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SdkState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Paused,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdkEvent {
    InitRequested,
    InitSucceeded,
    InitFailed,
    AppBackgrounded,
    AppForegrounded,
    TerminateRequested,
}

/// Terminated is terminal: no event leads out of it. Error requires an
/// explicit terminate; there is no silent self-heal back to Ready.
const SDK_TRANSITIONS: &[(SdkState, SdkEvent, SdkState)] = &[
    (
        SdkState::Uninitialized,
        SdkEvent::InitRequested,
        SdkState::Initializing,
    ),
    (
        SdkState::Initializing,
        SdkEvent::InitSucceeded,
        SdkState::Ready,
    ),
    (SdkState::Initializing, SdkEvent::InitFailed, SdkState::Error),
    (SdkState::Ready, SdkEvent::AppBackgrounded, SdkState::Paused),
    (SdkState::Paused, SdkEvent::AppForegrounded, SdkState::Ready),
    (
        SdkState::Ready,
        SdkEvent::TerminateRequested,
        SdkState::Terminated,
    ),
    (
        SdkState::Paused,
        SdkEvent::TerminateRequested,
        SdkState::Terminated,
    ),
    (
        SdkState::Error,
        SdkEvent::TerminateRequested,
        SdkState::Terminated,
    ),
];

pub fn sdk_machine() -> StateMachine<SdkState, SdkEvent> {
    StateMachine::new("sdk", SdkState::Uninitialized, SDK_TRANSITIONS)
}

// -------------------- Camera --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CameraState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraEvent {
    StartRequested,
    StartSucceeded,
    StartFailed,
    StopRequested,
    StopCompleted,
    Failed,
}

/// Stopped is terminal per session; a new session gets a fresh machine
/// rather than reusing one parked in Error.
const CAMERA_TRANSITIONS: &[(CameraState, CameraEvent, CameraState)] = &[
    (
        CameraState::Stopped,
        CameraEvent::StartRequested,
        CameraState::Starting,
    ),
    (
        CameraState::Starting,
        CameraEvent::StartSucceeded,
        CameraState::Running,
    ),
    (
        CameraState::Starting,
        CameraEvent::StartFailed,
        CameraState::Error,
    ),
    (
        CameraState::Running,
        CameraEvent::StopRequested,
        CameraState::Stopping,
    ),
    (CameraState::Running, CameraEvent::Failed, CameraState::Error),
    (
        CameraState::Stopping,
        CameraEvent::StopCompleted,
        CameraState::Stopped,
    ),
];

pub fn camera_machine() -> StateMachine<CameraState, CameraEvent> {
    StateMachine::new("camera", CameraState::Stopped, CAMERA_TRANSITIONS)
}

// -------------------- Effect --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EffectState {
    NotLoaded,
    Loading,
    Ready,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectEvent {
    LoadRequested,
    LoadSucceeded,
    LoadFailed,
    UnloadRequested,
    ReloadRequested,
}

/// Ready never goes back to Loading except through an explicit reload.
const EFFECT_TRANSITIONS: &[(EffectState, EffectEvent, EffectState)] = &[
    (
        EffectState::NotLoaded,
        EffectEvent::LoadRequested,
        EffectState::Loading,
    ),
    (
        EffectState::Loading,
        EffectEvent::LoadSucceeded,
        EffectState::Ready,
    ),
    (
        EffectState::Loading,
        EffectEvent::LoadFailed,
        EffectState::Error,
    ),
    (
        EffectState::Ready,
        EffectEvent::UnloadRequested,
        EffectState::NotLoaded,
    ),
    (
        EffectState::Loading,
        EffectEvent::UnloadRequested,
        EffectState::NotLoaded,
    ),
    (
        EffectState::Ready,
        EffectEvent::ReloadRequested,
        EffectState::Loading,
    ),
    (
        EffectState::Error,
        EffectEvent::LoadRequested,
        EffectState::Loading,
    ),
];

pub fn effect_machine() -> StateMachine<EffectState, EffectEvent> {
    StateMachine::new("effect", EffectState::NotLoaded, EFFECT_TRANSITIONS)
}

// -------------------- Recorder --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopping,
    Stopped,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderEvent {
    StartRequested,
    StopRequested,
    Finalized,
    Failed,
}

const RECORDER_TRANSITIONS: &[(RecorderState, RecorderEvent, RecorderState)] = &[
    (
        RecorderState::Idle,
        RecorderEvent::StartRequested,
        RecorderState::Recording,
    ),
    (
        RecorderState::Recording,
        RecorderEvent::StopRequested,
        RecorderState::Stopping,
    ),
    (
        RecorderState::Stopping,
        RecorderEvent::Finalized,
        RecorderState::Stopped,
    ),
    (
        RecorderState::Recording,
        RecorderEvent::Failed,
        RecorderState::Error,
    ),
    (
        RecorderState::Stopping,
        RecorderEvent::Failed,
        RecorderState::Error,
    ),
    (
        RecorderState::Stopped,
        RecorderEvent::StartRequested,
        RecorderState::Recording,
    ),
];

pub fn recorder_machine() -> StateMachine<RecorderState, RecorderEvent> {
    StateMachine::new("recorder", RecorderState::Idle, RECORDER_TRANSITIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDK_EVENTS: &[SdkEvent] = &[
        SdkEvent::InitRequested,
        SdkEvent::InitSucceeded,
        SdkEvent::InitFailed,
        SdkEvent::AppBackgrounded,
        SdkEvent::AppForegrounded,
        SdkEvent::TerminateRequested,
    ];

    #[test]
    fn illegal_transition_rejected_and_state_unchanged() {
        let mut machine = sdk_machine();
        let err = machine.handle(SdkEvent::InitSucceeded).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        assert_eq!(machine.state(), SdkState::Uninitialized);
    }

    #[test]
    fn every_non_whitelisted_pair_is_rejected() {
        // Walk each state and fire every event; anything the table does not
        // whitelist must fail without mutating the state.
        for initial in [
            SdkState::Uninitialized,
            SdkState::Initializing,
            SdkState::Ready,
            SdkState::Error,
            SdkState::Paused,
            SdkState::Terminated,
        ] {
            for &event in SDK_EVENTS {
                let mut machine = StateMachine::new("sdk", initial, SDK_TRANSITIONS);
                let whitelisted = machine.accepts(event);
                let result = machine.handle(event);
                if whitelisted {
                    assert!(result.is_ok());
                } else {
                    assert!(result.is_err());
                    assert_eq!(machine.state(), initial);
                }
            }
        }
    }

    #[test]
    fn terminated_is_terminal() {
        let mut machine = StateMachine::new("sdk", SdkState::Terminated, SDK_TRANSITIONS);
        for &event in SDK_EVENTS {
            assert!(machine.handle(event).is_err());
            assert_eq!(machine.state(), SdkState::Terminated);
        }
    }

    #[test]
    fn sdk_lifecycle_happy_path() {
        let mut machine = sdk_machine();
        assert_eq!(
            machine.handle(SdkEvent::InitRequested).unwrap(),
            SdkState::Initializing
        );
        assert_eq!(
            machine.handle(SdkEvent::InitSucceeded).unwrap(),
            SdkState::Ready
        );
        assert_eq!(
            machine.handle(SdkEvent::AppBackgrounded).unwrap(),
            SdkState::Paused
        );
        assert_eq!(
            machine.handle(SdkEvent::AppForegrounded).unwrap(),
            SdkState::Ready
        );
        assert_eq!(
            machine.handle(SdkEvent::TerminateRequested).unwrap(),
            SdkState::Terminated
        );
    }

    #[test]
    fn effect_ready_requires_explicit_reload() {
        let mut machine = effect_machine();
        machine.handle(EffectEvent::LoadRequested).unwrap();
        machine.handle(EffectEvent::LoadSucceeded).unwrap();

        // A plain load request on a Ready effect is rejected.
        assert!(machine.handle(EffectEvent::LoadRequested).is_err());
        assert_eq!(machine.state(), EffectState::Ready);

        // Reload is the sanctioned way back to Loading.
        assert_eq!(
            machine.handle(EffectEvent::ReloadRequested).unwrap(),
            EffectState::Loading
        );
    }

    #[test]
    fn camera_session_runs_to_stopped() {
        let mut machine = camera_machine();
        machine.handle(CameraEvent::StartRequested).unwrap();
        machine.handle(CameraEvent::StartSucceeded).unwrap();
        machine.handle(CameraEvent::StopRequested).unwrap();
        assert_eq!(
            machine.handle(CameraEvent::StopCompleted).unwrap(),
            CameraState::Stopped
        );
        assert!(machine.handle(CameraEvent::StopCompleted).is_err());
    }
}
