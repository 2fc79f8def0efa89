#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

//! The _tcpcore_ library is a TCP connection state machine designed for
//! bare-metal, real-time systems without a heap.
//!
//! It drives each socket through the RFC 793 automaton, validates incoming
//! segments against the receive and send windows, runs the retransmission and
//! keep-alive timers, and defends listen backlogs against SYN floods with
//! stateless SYN cookies.
//!
//! # Table of contents
//!
//! The crate is split into the following parts:
//!
//!  * The [wire] module provides RFC 793 segment parsing, emission and
//!    wrapping sequence number arithmetic.
//!  * The [socket] module contains the connection engine, its control blocks
//!    and a fixed-capacity socket arena.
//!  * The [iface] module describes the collaborators the engine is driven
//!    against: the IP layer, the exclusive area and the per-call context.
//!  * The [time] module provides the millisecond clock used by timers and the
//!    coarse seconds clock used by SYN cookies.
//!
//! The engine never allocates and never blocks. All waiting is expressed as a
//! deadline serviced by [`socket::tcp::Tcp::tick`].

#[macro_use]
mod macros;

pub mod config;
pub mod iface;
pub mod socket;
pub mod time;
pub mod wire;
