// Verus specification for the device control state machine and the
// drain-loop counters.
//
// These specs document the properties of the pure functions in
// `src/verified/control.rs` and `src/verified/drain.rs`.  They are NOT
// compiled by `cargo`; they are consumed by the Verus verifier:
//
//     verus verus/control_spec.rs
//
// Reference: https://verus-lang.github.io/verus/guide/

verus! {

// ═══════════════════════════════════════════════════════════════════════
// Device states and operations (modeled as u8 tags)
// ═══════════════════════════════════════════════════════════════════════

pub const OPEN:      u8 = 0u8;
pub const ARMED:     u8 = 1u8;
pub const STARTED:   u8 = 2u8;
pub const STOPPED:   u8 = 3u8;
pub const TORN_DOWN: u8 = 4u8;
pub const CLOSED:    u8 = 5u8;

pub const OP_ARM:      u8 = 0u8;
pub const OP_START:    u8 = 1u8;
pub const OP_STOP:     u8 = 2u8;
pub const OP_TEARDOWN: u8 = 3u8;
pub const OP_CLOSE:    u8 = 4u8;

pub open spec fn is_state(s: u8) -> bool { s <= CLOSED }
pub open spec fn is_op(op: u8) -> bool { op <= OP_CLOSE }

/// Spec model of `transition`.
pub open spec fn transition_spec(s: u8, op: u8) -> Option<u8> {
    if op == OP_ARM && s == OPEN { Some(ARMED) }
    else if op == OP_START && s == ARMED { Some(STARTED) }
    else if op == OP_STOP && (s == ARMED || s == STARTED) { Some(STOPPED) }
    else if op == OP_TEARDOWN && s == STOPPED { Some(TORN_DOWN) }
    else if op == OP_CLOSE && s != CLOSED { Some(CLOSED) }
    else { None }
}

pub fn transition(s: u8, op: u8) -> (result: Option<u8>)
    requires
        is_state(s),
        is_op(op),
    ensures
        result == transition_spec(s, op),
        // A transition always changes the state.
        result.is_some() ==> result.unwrap() != s,
        // Results are valid states.
        result.is_some() ==> is_state(result.unwrap()),
{
    if op == OP_ARM && s == OPEN { Some(ARMED) }
    else if op == OP_START && s == ARMED { Some(STARTED) }
    else if op == OP_STOP && (s == ARMED || s == STARTED) { Some(STOPPED) }
    else if op == OP_TEARDOWN && s == STOPPED { Some(TORN_DOWN) }
    else if op == OP_CLOSE && s != CLOSED { Some(CLOSED) }
    else { None }
}

/// Applying the same operation twice never transitions twice.
proof fn transition_idempotent(s: u8, op: u8)
    requires
        is_state(s),
        is_op(op),
        transition_spec(s, op).is_some(),
    ensures
        transition_spec(transition_spec(s, op).unwrap(), op).is_none(),
{ }

/// Nothing leaves CLOSED.
proof fn closed_is_terminal(op: u8)
    requires is_op(op),
    ensures transition_spec(CLOSED, op).is_none(),
{ }

/// START only applies to an ARMED device.
proof fn start_requires_armed(s: u8)
    requires
        is_state(s),
        transition_spec(s, OP_START).is_some(),
    ensures s == ARMED,
{ }

/// Every state that holds kernel buffers can be stopped.
proof fn kernel_state_is_stoppable(s: u8)
    requires s == ARMED || s == STARTED,
    ensures transition_spec(s, OP_STOP) == Some(STOPPED),
{ }

/// The cleanup sequence STOP, TEARDOWN, CLOSE takes every device holding
/// kernel buffers to CLOSED through TORN_DOWN.
proof fn cleanup_reaches_torn_down(s: u8)
    requires s == ARMED || s == STARTED,
    ensures
        transition_spec(transition_spec(s, OP_STOP).unwrap(), OP_TEARDOWN) == Some(TORN_DOWN),
        transition_spec(TORN_DOWN, OP_CLOSE) == Some(CLOSED),
{ }

// ═══════════════════════════════════════════════════════════════════════
// Drain counters
// ═══════════════════════════════════════════════════════════════════════

pub fn next_empty_count(count: u32, n: usize) -> (result: u32)
    ensures
        n > 0 ==> result == 0,
        n == 0 && count < u32::MAX ==> result == count + 1,
        n == 0 && count == u32::MAX ==> result == u32::MAX,
{
    if n == 0 {
        if count < u32::MAX { count + 1 } else { u32::MAX }
    } else {
        0
    }
}

pub open spec fn channels_exhausted_spec(count: u32, limit: u32) -> bool {
    limit != 0 && count >= limit
}

/// A limit of zero never exhausts.
proof fn zero_limit_never_exhausts(count: u32)
    ensures !channels_exhausted_spec(count, 0u32),
{ }

/// Exhaustion is monotone in the count.
proof fn exhaustion_monotone(a: u32, b: u32, limit: u32)
    requires
        a <= b,
        channels_exhausted_spec(a, limit),
    ensures channels_exhausted_spec(b, limit),
{ }

} // verus!
