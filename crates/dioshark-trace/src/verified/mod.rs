//! Pure decision functions of the collector.
//!
//! The registry, the drain loop and the record formatter delegate every
//! decision that does not need I/O to the functions here: which control
//! call a device is eligible for, how a read is classified, when a worker's
//! channels count as drained, and how header fields are named.
//!
//! Nothing in this module touches files, threads or `libc`.  The functions
//! carry `debug_assert!` postconditions and are covered by plain `#[test]`s.
//!
//! Formal properties of [`control`] and [`drain`] are stated in
//! `verus/control_spec.rs`, which `cargo` does not compile; run it through
//! the Verus verifier separately.

pub mod control;
pub mod drain;
pub mod record;
