/// Translation of hypervisor (libvirt) state and reason codes into the
/// launcher's domain status model.
///
/// The hypervisor reports a domain state plus a reason code whose meaning
/// depends on that state. Only Shutdown, Shutoff, Crashed and Paused carry
/// reason tables; every other state, and every code missing from a table,
/// translates to [`StateChangeReason::Unknown`].
use crate::domain::{
    CrashedReason, LifeCycle, PausedReason, ShutdownReason, ShutoffReason, StateChangeReason,
};

/// Domain state codes as reported by the hypervisor daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainState {
    NoState = 0,
    Running = 1,
    Blocked = 2,
    Paused = 3,
    Shutdown = 4,
    Shutoff = 5,
    Crashed = 6,
    PmSuspended = 7,
}

impl DomainState {
    pub const ALL: [DomainState; 8] = [
        DomainState::NoState,
        DomainState::Running,
        DomainState::Blocked,
        DomainState::Paused,
        DomainState::Shutdown,
        DomainState::Shutoff,
        DomainState::Crashed,
        DomainState::PmSuspended,
    ];
}

impl TryFrom<i32> for DomainState {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        DomainState::ALL
            .into_iter()
            .find(|s| *s as i32 == code)
            .ok_or(code)
    }
}

/// Maps a hypervisor domain state onto its [`LifeCycle`].
pub fn translate(state: DomainState) -> LifeCycle {
    match state {
        DomainState::NoState => LifeCycle::NoState,
        DomainState::Running => LifeCycle::Running,
        DomainState::Blocked => LifeCycle::Blocked,
        DomainState::Paused => LifeCycle::Paused,
        DomainState::Shutdown => LifeCycle::Shutdown,
        DomainState::Shutoff => LifeCycle::Shutoff,
        DomainState::Crashed => LifeCycle::Crashed,
        DomainState::PmSuspended => LifeCycle::PmSuspended,
    }
}

/// Maps a `(state, reason)` pair onto a [`StateChangeReason`].
pub fn translate_reason(state: DomainState, reason: i32) -> StateChangeReason {
    let translated = match state {
        DomainState::Shutdown => shutdown_reason(reason).map(StateChangeReason::Shutdown),
        DomainState::Shutoff => shutoff_reason(reason).map(StateChangeReason::Shutoff),
        DomainState::Crashed => crashed_reason(reason).map(StateChangeReason::Crashed),
        DomainState::Paused => paused_reason(reason).map(StateChangeReason::Paused),
        _ => None,
    };
    translated.unwrap_or(StateChangeReason::Unknown)
}

fn shutdown_reason(code: i32) -> Option<ShutdownReason> {
    match code {
        0 => Some(ShutdownReason::Unknown),
        1 => Some(ShutdownReason::User),
        _ => None,
    }
}

fn shutoff_reason(code: i32) -> Option<ShutoffReason> {
    match code {
        0 => Some(ShutoffReason::Unknown),
        1 => Some(ShutoffReason::Shutdown),
        2 => Some(ShutoffReason::Destroyed),
        3 => Some(ShutoffReason::Crashed),
        4 => Some(ShutoffReason::Migrated),
        5 => Some(ShutoffReason::Saved),
        6 => Some(ShutoffReason::Failed),
        7 => Some(ShutoffReason::FromSnapshot),
        _ => None,
    }
}

fn crashed_reason(code: i32) -> Option<CrashedReason> {
    match code {
        0 => Some(CrashedReason::Unknown),
        1 => Some(CrashedReason::Panicked),
        _ => None,
    }
}

fn paused_reason(code: i32) -> Option<PausedReason> {
    match code {
        0 => Some(PausedReason::Unknown),
        1 => Some(PausedReason::User),
        2 => Some(PausedReason::Migration),
        3 => Some(PausedReason::Save),
        4 => Some(PausedReason::Dump),
        5 => Some(PausedReason::IoError),
        6 => Some(PausedReason::Watchdog),
        7 => Some(PausedReason::FromSnapshot),
        8 => Some(PausedReason::ShuttingDown),
        9 => Some(PausedReason::Snapshot),
        10 => Some(PausedReason::Crashed),
        11 => Some(PausedReason::StartingUp),
        12 => Some(PausedReason::Postcopy),
        13 => Some(PausedReason::PostcopyFailed),
        _ => None,
    }
}
