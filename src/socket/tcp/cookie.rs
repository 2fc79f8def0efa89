//! SYN cookies and initial sequence numbers.
//!
//! A cookie is an initial sequence number that carries enough of the
//! connection request to rebuild it from the handshake's final ACK:
//!
//! ```text
//!  31  29 28                                                   0
//! +------+------------------------------------------------------+
//! | mss  |  MAC1(tuple) + isn + counter rotation + MAC2 mod 2^24 |
//! +------+------------------------------------------------------+
//! ```
//!
//! The counter ticks every 64 seconds. A cookie verifies for the counter it was
//! issued at and the one after.

use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

use crate::config::TCP_HASH_INPUT_LEN;
use crate::time::Timestamp;
use crate::wire::{IpEndpoint, TcpSeqNumber, write_address};

/// Ascending MSS values a cookie can encode.
pub(crate) const MSS_TABLE: [u16; 8] = [536, 600, 800, 1000, 1220, 1300, 1440, 1460];

/// Amount the plain ISN counter advances for every connection it numbers.
pub(crate) const ISN_INCREMENT: u32 = 64000;

const COOKIE_INDEX_SHIFT: u32 = 29;
const COOKIE_HASH_MASK: u32 = (1 << COOKIE_INDEX_SHIFT) - 1;

/// Key selector of a [`Mac`] computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]

pub enum MacJob {
    /// Counter independent cookie hash.
    CookieKey1,
    /// Counter dependent cookie hash.
    CookieKey2,
    /// Unpredictable ISN offset.
    IsnKey,
}

/// Error returned by [`Mac`] implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]

pub struct MacError;

impl fmt::Display for MacError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mac computation failed")
    }
}

impl core::error::Error for MacError {}

/// A keyed message authentication primitive.
pub trait Mac {
    /// Compute the tag of `data` under the key of `job`.
    fn generate(&mut self, job: MacJob, data: &[u8], tag: &mut [u8; 8]) -> Result<(), MacError>;

    /// Replace the key of `job` with a fresh secret.
    fn regenerate_key(&mut self, job: MacJob) -> Result<(), MacError>;
}

/// The 64-second resolution timestamp counter.
pub(crate) fn counter(time: Timestamp) -> u32 {
    ((time.seconds_hi as u32 & 0x3f) << 26) | (time.seconds >> 6)
}

/// Writes `counter || local addr || local port || remote addr || remote port`.
fn hash_input(
    buf: &mut [u8; TCP_HASH_INPUT_LEN],
    counter: u32,
    local: &IpEndpoint,
    remote: &IpEndpoint,
) -> usize {
    NetworkEndian::write_u32(&mut buf[..4], counter);
    let mut len = 4;
    len += write_address(&local.addr, &mut buf[len..]);
    NetworkEndian::write_u16(&mut buf[len..len + 2], local.port);
    len += 2;
    len += write_address(&remote.addr, &mut buf[len..]);
    NetworkEndian::write_u16(&mut buf[len..len + 2], remote.port);
    len + 2
}

fn tag_word(mac: &mut dyn Mac, job: MacJob, data: &[u8]) -> Result<u32, MacError> {
    let mut tag = [0u8; 8];
    mac.generate(job, data, &mut tag)?;
    Ok(NetworkEndian::read_u32(&tag[..4]))
}

fn mss_index(mss: u16) -> usize {
    MSS_TABLE
        .iter()
        .rposition(|&entry| entry <= mss)
        .unwrap_or(0)
}

fn cookie_at(
    mac: &mut dyn Mac,
    counter: u32,
    local: &IpEndpoint,
    remote: &IpEndpoint,
    isn: TcpSeqNumber,
    index: usize,
) -> Result<TcpSeqNumber, MacError> {
    let mut buf = [0u8; TCP_HASH_INPUT_LEN];
    let len = hash_input(&mut buf, counter, local, remote);
    let hash1 = tag_word(mac, MacJob::CookieKey1, &buf[4..len])?;
    let hash2 = tag_word(mac, MacJob::CookieKey2, &buf[..len])?;

    let z = hash1
        .wrapping_add(isn.0)
        .wrapping_add((counter & 0xff_ffff) << 24)
        .wrapping_add(hash2 % (1 << 24));
    Ok(TcpSeqNumber(
        ((index as u32 & 0x7) << COOKIE_INDEX_SHIFT) | (z & COOKIE_HASH_MASK),
    ))
}

/// Encode a cookie for a SYN with initial sequence number `isn` offering `mss`.
///
/// Returns the cookie and the MSS it encodes, which is the largest table entry
/// not exceeding `mss`.
pub(crate) fn encode(
    mac: &mut dyn Mac,
    counter: u32,
    local: &IpEndpoint,
    remote: &IpEndpoint,
    isn: TcpSeqNumber,
    mss: u16,
) -> Result<(TcpSeqNumber, u16), MacError> {
    let index = mss_index(mss);
    let cookie = cookie_at(mac, counter, local, remote, isn, index)?;
    Ok((cookie, MSS_TABLE[index]))
}

/// Verify `cookie` against the peer's `isn`, returning the encoded MSS.
///
/// The cookie is accepted if it was issued at `counter` or at the one before.
pub(crate) fn check(
    mac: &mut dyn Mac,
    counter: u32,
    local: &IpEndpoint,
    remote: &IpEndpoint,
    cookie: TcpSeqNumber,
    isn: TcpSeqNumber,
) -> Result<Option<u16>, MacError> {
    let index = (cookie.0 >> COOKIE_INDEX_SHIFT) as usize;
    for candidate in [counter, counter.wrapping_sub(1)] {
        if cookie_at(mac, candidate, local, remote, isn, index)? == cookie {
            return Ok(Some(MSS_TABLE[index]));
        }
    }
    Ok(None)
}

/// Source of initial sequence numbers.
///
/// The counter advances on every tick and by [`ISN_INCREMENT`] for every
/// number handed out.
#[derive(Debug, Default, Clone)]
pub(crate) struct IsnGenerator {
    counter: u32,
}

impl IsnGenerator {
    pub(crate) fn new(seed: u32) -> IsnGenerator {
        IsnGenerator { counter: seed }
    }

    pub(crate) fn tick(&mut self, increment: u32) {
        self.counter = self.counter.wrapping_add(increment);
    }

    pub(crate) fn next(&mut self) -> TcpSeqNumber {
        let isn = TcpSeqNumber(self.counter);
        self.counter = self.counter.wrapping_add(ISN_INCREMENT);
        isn
    }

    /// The next counter value offset by a MAC of the connection tuple, so that
    /// connections to the same peer cannot be sequence predicted.
    pub(crate) fn next_unpredictable(
        &mut self,
        mac: &mut dyn Mac,
        local: &IpEndpoint,
        remote: &IpEndpoint,
    ) -> Result<TcpSeqNumber, MacError> {
        let mut buf = [0u8; TCP_HASH_INPUT_LEN];
        let len = hash_input(&mut buf, 0, local, remote);
        let offset = tag_word(mac, MacJob::IsnKey, &buf[4..len])?;
        Ok(self.next() + offset)
    }
}
