//! Pure, verifiable functions for the device control state machine.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no system calls, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` postconditions on every
//!   non-trivial function.
//!
//! The corresponding spec file is `verus/control_spec.rs`.
//!
//! # Mapping to `device.rs`
//!
//! | Verified function        | Used by                                   |
//! |--------------------------|-------------------------------------------|
//! | [`transition`]           | every `DeviceRegistry::*_all` pass        |
//! | [`holds_kernel_state`]   | `Drop for DeviceRegistry`                 |
//! | [`close_is_premature`]   | `DeviceRegistry::close_all()`             |

use crate::device::DeviceState;

/// A control operation the registry can apply to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    Arm,
    Start,
    Stop,
    Teardown,
    Close,
}

impl ControlOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arm => "ARM",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Teardown => "TEARDOWN",
            Self::Close => "CLOSE",
        }
    }
}

// ─── Transitions ────────────────────────────────────────────────────

/// The state a device moves to when `op` is applied in `state`.
///
/// Returns `None` when `op` does not apply to `state`; the registry skips
/// such devices, which is what makes every pass idempotent.
///
/// ```text
/// OPEN ──arm──▶ ARMED ──start──▶ STARTED
///                 │                 │
///                 └──────stop───────┴──▶ STOPPED ──teardown──▶ TORN_DOWN
///
/// any state except CLOSED ──close──▶ CLOSED
/// ```
///
/// # Properties verified by `verus/control_spec.rs`
///
/// - Applying the same op twice never yields a second transition.
/// - `Close` is the only op that applies to more than two states.
/// - Nothing leaves `Closed`.
pub fn transition(state: DeviceState, op: ControlOp) -> Option<DeviceState> {
    let result = match (op, state) {
        (ControlOp::Arm, DeviceState::Open) => Some(DeviceState::Armed),
        (ControlOp::Start, DeviceState::Armed) => Some(DeviceState::Started),
        (ControlOp::Stop, DeviceState::Armed | DeviceState::Started) => Some(DeviceState::Stopped),
        (ControlOp::Teardown, DeviceState::Stopped) => Some(DeviceState::TornDown),
        (ControlOp::Close, DeviceState::Closed) => None,
        (ControlOp::Close, _) => Some(DeviceState::Closed),
        _ => None,
    };

    // Postcondition: a transition always changes the state.
    debug_assert!(
        result != Some(state),
        "transition: {op:?} in {state:?} must not be a self-loop"
    );

    result
}

/// Whether the device still has kernel-side trace state that needs a STOP.
///
/// An ARMED device that never started still owns kernel buffers, so it is
/// stopped and torn down like a started one.
pub fn holds_kernel_state(state: DeviceState) -> bool {
    matches!(state, DeviceState::Armed | DeviceState::Started)
}

/// Whether closing a device in `state` skips a cleanup step that should
/// have run first.
pub fn close_is_premature(state: DeviceState) -> bool {
    matches!(state, DeviceState::Started | DeviceState::Stopped)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [DeviceState; 6] = [
        DeviceState::Open,
        DeviceState::Armed,
        DeviceState::Started,
        DeviceState::Stopped,
        DeviceState::TornDown,
        DeviceState::Closed,
    ];

    const ALL_OPS: [ControlOp; 5] = [
        ControlOp::Arm,
        ControlOp::Start,
        ControlOp::Stop,
        ControlOp::Teardown,
        ControlOp::Close,
    ];

    #[test]
    fn happy_path() {
        let mut state = DeviceState::Open;
        for op in ALL_OPS {
            state = transition(state, op).unwrap();
        }
        assert_eq!(state, DeviceState::Closed);
    }

    #[test]
    fn ops_are_idempotent() {
        for state in ALL_STATES {
            for op in ALL_OPS {
                if let Some(next) = transition(state, op) {
                    assert_eq!(
                        transition(next, op),
                        None,
                        "{op:?} applied twice from {state:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn start_only_from_armed() {
        for state in ALL_STATES {
            let expected = state == DeviceState::Armed;
            assert_eq!(transition(state, ControlOp::Start).is_some(), expected);
        }
    }

    #[test]
    fn armed_device_can_be_stopped() {
        assert_eq!(
            transition(DeviceState::Armed, ControlOp::Stop),
            Some(DeviceState::Stopped)
        );
        assert!(holds_kernel_state(DeviceState::Armed));
        assert!(!holds_kernel_state(DeviceState::Open));
        assert!(!holds_kernel_state(DeviceState::Stopped));
    }

    #[test]
    fn nothing_leaves_closed() {
        for op in ALL_OPS {
            assert_eq!(transition(DeviceState::Closed, op), None);
        }
    }

    #[test]
    fn premature_close() {
        assert!(close_is_premature(DeviceState::Started));
        assert!(close_is_premature(DeviceState::Stopped));
        assert!(!close_is_premature(DeviceState::Open));
        assert!(!close_is_premature(DeviceState::Armed));
        assert!(!close_is_premature(DeviceState::TornDown));
    }
}
