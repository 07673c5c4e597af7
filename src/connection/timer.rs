use std::time::Instant;

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to close the connection after no activity
    Idle = 1,
    /// When the close timer expires, the connection has been gracefully terminated.
    Close = 2,
    /// When keys are discarded because they should not be needed anymore
    KeyDiscard = 3,
    /// When to send a `PING` frame to keep the connection alive
    KeepAlive = 4,
    /// When pacing will allow us to send a packet
    Pacing = 5,
    /// When to send an immediate ACK if there are unacked ack-eliciting packets of the peer
    MaxAckDelay = 6,
}

impl Timer {
    pub(crate) const VALUES: [Self; 7] = [
        Self::LossDetection,
        Self::Idle,
        Self::Close,
        Self::KeyDiscard,
        Self::KeepAlive,
        Self::Pacing,
        Self::MaxAckDelay,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 7],
}

impl TimerTable {
    /// Set the timer for a specific `Timer` kind
    pub(super) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    /// Get the timer for a specific `Timer` kind
    pub(super) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    /// Stop the timer for a specific `Timer` kind
    pub(super) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// The next timeout along with the kind of timer that will fire
    pub(super) fn next_timeout(&self) -> Option<(Instant, Timer)> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, &x)| x.map(|time| (time, Timer::VALUES[i])))
            .min_by_key(|&(time, _)| time)
    }

    /// Expire timers up to and including `now`, returning the earliest, if any
    pub(super) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        let (time, timer) = self.next_timeout()?;
        if time > now {
            return None;
        }
        self.stop(timer);
        Some(timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_order() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        let sec = Duration::from_secs(1);
        timers.set(Timer::Idle, now + 3 * sec);
        timers.set(Timer::Close, now + sec);
        timers.set(Timer::Idle, now + 2 * sec);

        assert_eq!(timers.next_timeout(), Some((now + sec, Timer::Close)));
        assert_eq!(timers.expire_before(now + 2 * sec), Some(Timer::Close));
        assert_eq!(timers.expire_before(now + 2 * sec), Some(Timer::Idle));
        assert_eq!(timers.expire_before(now + 2 * sec), None);
        assert_eq!(timers.next_timeout(), None);
    }
}
