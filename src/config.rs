//! Compile-time capacities.
//!
//! Runtime tunables live in [`crate::socket::tcp::Config`].

/// Upper bound of side effects one transition may produce.
pub const TCP_EFFECT_COUNT: usize = 16;

/// Maximum number of data segments emitted by a single transmit pass.
pub const TCP_SEGMENT_BURST: usize = 4;

/// Size of the stack buffer outgoing payloads are staged in.
pub const TCP_SCRATCH_LEN: usize = 1460;

/// Size of the MAC input buffer used for SYN cookies and unpredictable ISNs.
///
/// Holds a 4 octet counter followed by two IPv6 addresses and two ports.
pub const TCP_HASH_INPUT_LEN: usize = 4 + 16 + 2 + 16 + 2;
