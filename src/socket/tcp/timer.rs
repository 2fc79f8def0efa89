use crate::time::{Duration, Instant};

/// The single state dependent timer of a control block.
///
/// Its meaning follows the connection state: a retransmission deadline while
/// anything is outstanding, a state bound in FIN-WAIT-2 and TIME-WAIT, and the
/// keep-alive schedule of an idle established connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Timer {
    Idle,
    Retransmit { expires_at: Instant },
    Bound { expires_at: Instant },
    KeepAlive { expires_at: Instant },
}

impl Timer {
    pub(crate) fn should_retransmit(&self, timestamp: Instant) -> bool {
        match *self {
            Timer::Retransmit { expires_at } if timestamp >= expires_at => true,
            _ => false,
        }
    }

    pub(crate) fn should_expire(&self, timestamp: Instant) -> bool {
        match *self {
            Timer::Bound { expires_at } if timestamp >= expires_at => true,
            _ => false,
        }
    }

    pub(crate) fn should_keep_alive(&self, timestamp: Instant) -> bool {
        match *self {
            Timer::KeepAlive { expires_at } if timestamp >= expires_at => true,
            _ => false,
        }
    }

    pub(crate) fn set_for_idle(&mut self) {
        *self = Timer::Idle
    }

    pub(crate) fn set_for_retransmit(&mut self, timestamp: Instant, delay: Duration) {
        *self = Timer::Retransmit {
            expires_at: timestamp + delay,
        }
    }

    pub(crate) fn set_for_bound(&mut self, timestamp: Instant, delay: Duration) {
        *self = Timer::Bound {
            expires_at: timestamp + delay,
        }
    }

    pub(crate) fn set_for_keep_alive(&mut self, timestamp: Instant, delay: Duration) {
        *self = Timer::KeepAlive {
            expires_at: timestamp + delay,
        }
    }

    pub fn is_retransmit(&self) -> bool {
        matches!(*self, Timer::Retransmit { .. })
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self, Timer::Bound { .. })
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(*self, Timer::KeepAlive { .. })
    }

    pub fn expires_at(&self) -> Option<Instant> {
        match *self {
            Timer::Idle => None,
            Timer::Retransmit { expires_at }
            | Timer::Bound { expires_at }
            | Timer::KeepAlive { expires_at } => Some(expires_at),
        }
    }
}

/// Delayed acknowledgement state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AckTimer {
    Idle,
    /// An ACK is owed by the deadline.
    Delayed(Instant),
    /// Sending an ACK failed; it is retried on every tick.
    Retry { attempts: u8 },
}

impl AckTimer {
    pub(crate) fn arm(&mut self, timestamp: Instant, delay: Duration) {
        if *self == AckTimer::Idle {
            *self = AckTimer::Delayed(timestamp + delay)
        }
    }

    pub(crate) fn is_due(&self, timestamp: Instant) -> bool {
        match *self {
            AckTimer::Delayed(deadline) => timestamp >= deadline,
            AckTimer::Retry { .. } => true,
            AckTimer::Idle => false,
        }
    }
}

/// Rate limit for ACKs answering unacceptable segments.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Suppression {
    until: Option<Instant>,
}

impl Suppression {
    pub(crate) fn is_idle(&self, timestamp: Instant) -> bool {
        match self.until {
            Some(until) => timestamp >= until,
            None => true,
        }
    }

    pub(crate) fn arm(&mut self, timestamp: Instant, delay: Duration) {
        self.until = Some(timestamp + delay)
    }

    pub(crate) fn expire(&mut self, timestamp: Instant) {
        if self.is_idle(timestamp) {
            self.until = None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retransmit_deadline() {
        let mut timer = Timer::Idle;
        timer.set_for_retransmit(Instant::from_millis(1000), Duration::from_millis(500));
        assert!(!timer.should_retransmit(Instant::from_millis(1499)));
        assert!(timer.should_retransmit(Instant::from_millis(1500)));
        assert!(!timer.should_expire(Instant::from_millis(1500)));
        assert_eq!(timer.expires_at(), Some(Instant::from_millis(1500)));
    }

    #[test]
    fn test_ack_timer_keeps_first_deadline() {
        let mut timer = AckTimer::Idle;
        timer.arm(Instant::from_millis(0), Duration::from_millis(200));
        timer.arm(Instant::from_millis(100), Duration::from_millis(200));
        assert_eq!(timer, AckTimer::Delayed(Instant::from_millis(200)));
        assert!(!timer.is_due(Instant::from_millis(199)));
        assert!(timer.is_due(Instant::from_millis(200)));
    }

    #[test]
    fn test_suppression() {
        let mut rate = Suppression::default();
        assert!(rate.is_idle(Instant::ZERO));
        rate.arm(Instant::ZERO, Duration::from_millis(500));
        assert!(!rate.is_idle(Instant::from_millis(499)));
        rate.expire(Instant::from_millis(500));
        assert_eq!(rate, Suppression::default());
    }
}
