use core::fmt;

use crate::wire::{IpAddress, IpEndpoint, TcpRepr};

/// Error returned by [`IpLayer::resolve_transmission_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub enum ResolveError {
    /// No route or no usable source address for the destination.
    NoRoute,
    /// The security policy forbids traffic to the destination.
    PolicyViolation,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResolveError::NoRoute => write!(f, "no route to destination"),
            ResolveError::PolicyViolation => write!(f, "forbidden by policy"),
        }
    }
}

impl core::error::Error for ResolveError {}

/// Error returned by [`IpLayer::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub enum TransmitError {
    /// No datagram buffer was available.
    NoBuffer,
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TransmitError::NoBuffer => write!(f, "no datagram buffer available"),
        }
    }
}

impl core::error::Error for TransmitError {}

/// What the IP layer needs a connection to know about a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionParams {
    /// Source address the IP layer will use towards the destination.
    pub local_addr: IpAddress,
    /// Largest IP payload a single datagram can carry, TCP header included.
    pub max_payload: u16,
}

/// The IP/addressing layer underneath the TCP core.
pub trait IpLayer {
    /// Resolves the source address and payload limit for traffic from
    /// `local` (if bound to one) to `remote`.
    fn resolve_transmission_params(
        &mut self,
        local: Option<IpAddress>,
        remote: &IpEndpoint,
    ) -> Result<TransmissionParams, ResolveError>;

    /// Frames `repr` into a datagram and sends it.
    ///
    /// The implementation computes the TCP checksum over the pseudo-header.
    fn transmit(
        &mut self,
        local: &IpEndpoint,
        remote: &IpEndpoint,
        repr: &TcpRepr,
    ) -> Result<(), TransmitError>;
}
