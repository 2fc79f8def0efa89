//! A keyed MAC built on SipHash-2-4.
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
//!
//! Keys are ratcheted forward on regeneration: the next key is the hash of the
//! previous one, so a secret seed keeps every later key secret as well.

use super::cookie::{Mac, MacError, MacJob};

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [b"somepseu", b"dorandom", b"lygenera", b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

fn word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// SipHash-2-4 of `data` under the key `(k0, k1)`.
pub(crate) fn hash(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut state = State::init(k0, k1);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        state.absorb(word(chunk));
    }
    let tail = chunks.remainder();
    state.absorb(word(tail) | (data.len() as u64) << 56);
    state.finalize()
}

/// The default [`Mac`], keeping one SipHash key per job.
#[derive(Debug, Clone)]
pub struct SipMac {
    keys: [(u64, u64); 3],
}

impl SipMac {
    /// Derive the initial keys of every job from a secret seed.
    pub fn new(seed: [u8; 16]) -> SipMac {
        let k0 = word(&seed[..8]);
        let k1 = word(&seed[8..]);
        let derive = |job: u64| (hash(k0, k1, &job.to_le_bytes()), hash(k1, k0, &job.to_le_bytes()));
        SipMac {
            keys: [derive(1), derive(2), derive(3)],
        }
    }

    fn slot(job: MacJob) -> usize {
        match job {
            MacJob::CookieKey1 => 0,
            MacJob::CookieKey2 => 1,
            MacJob::IsnKey => 2,
        }
    }
}

impl Mac for SipMac {
    fn generate(&mut self, job: MacJob, data: &[u8], tag: &mut [u8; 8]) -> Result<(), MacError> {
        let (k0, k1) = self.keys[Self::slot(job)];
        *tag = hash(k0, k1, data).to_be_bytes();
        Ok(())
    }

    fn regenerate_key(&mut self, job: MacJob) -> Result<(), MacError> {
        let key = &mut self.keys[Self::slot(job)];
        let (k0, k1) = *key;
        *key = (hash(k0, k1, b"rekey-lo"), hash(k0, k1, b"rekey-hi"));
        Ok(())
    }
}
