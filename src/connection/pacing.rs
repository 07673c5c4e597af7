//! Pacing of packet transmissions.

use std::time::{Duration, Instant};

use tracing::warn;

/// A simple token-bucket pacer
///
/// The bucket starts full and has an adjustable capacity. Once the bucket is
/// empty, further transmission waits for refill. The bucket refills at a rate
/// slightly faster than one congestion window per RTT, so pacing shapes bursts
/// without capping throughput below what congestion control allows.
pub(super) struct Pacer {
    capacity: u64,
    tokens: u64,
    prev: Instant,
}

impl Pacer {
    /// Obtain a new `Pacer`, with a full bucket sized to the initial window
    pub(super) fn new(capacity: u64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            prev: now,
        }
    }

    /// Record that a packet has been transmitted.
    pub(super) fn on_transmit(&mut self, packet_length: u16) {
        self.tokens = self.tokens.saturating_sub(packet_length.into())
    }

    /// Return how long we need to wait before sending `bytes_to_send`
    ///
    /// If we can send a packet right away, this returns `None`. Otherwise, returns `Some(d)`,
    /// where `d` is the time before this function should be called again.
    ///
    /// The 5/4 ratio used here comes from the suggestion that N = 1.25 in draft-ietf-quic-recovery.
    pub(super) fn delay(
        &mut self,
        smoothed_rtt: Duration,
        bytes_to_send: u64,
        mtu: u16,
        window: u64,
        now: Instant,
    ) -> Option<Instant> {
        debug_assert_ne!(
            window, 0,
            "zero-sized congestion control window is nonsense"
        );

        // If we can already send a packet, there is no need for delay
        if self.tokens >= bytes_to_send {
            return None;
        }

        // We disable pacing for extremely large windows
        if window > u32::MAX.into() {
            return None;
        }

        let window = window as u32;

        let time_elapsed = now.checked_duration_since(self.prev).unwrap_or_else(|| {
            warn!("received a timestamp earlier than a previous recorded time, ignoring");
            Default::default()
        });

        if smoothed_rtt.as_nanos() == 0 {
            return None;
        }

        let elapsed_rtts = time_elapsed.as_secs_f64() / smoothed_rtt.as_secs_f64();
        let new_tokens = window as f64 * 1.25 * elapsed_rtts;
        self.tokens = self
            .tokens
            .saturating_add(new_tokens as _)
            .min(self.capacity);
        self.prev = now;

        // If refill was enough, there is no need for delay
        if self.tokens >= bytes_to_send {
            return None;
        }

        let unscaled_delay = smoothed_rtt
            .checked_mul((u64::from(mtu).max(self.capacity) - self.tokens) as _)
            .unwrap_or_else(|| Duration::new(u64::MAX, 999_999_999))
            / window;

        // Divisions come before multiplications to prevent overflow.
        // This is the time at which the pacing window becomes empty.
        Some(self.prev + (unscaled_delay / 5) * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_panic_on_bad_instant() {
        let old_instant = Instant::now();
        let new_instant = old_instant + Duration::from_micros(15);
        assert!(Pacer::new(1500, new_instant)
            .delay(Duration::from_micros(0), 1500, 1500, 3000, old_instant)
            .is_none());
    }

    #[test]
    fn full_bucket_sends_immediately() {
        let now = Instant::now();
        let mut pacer = Pacer::new(1500, now);
        assert_eq!(
            pacer.delay(Duration::from_millis(100), 1500, 1500, 12000, now),
            None
        );
    }

    #[test]
    fn empty_bucket_defers() {
        let now = Instant::now();
        let mut pacer = Pacer::new(1500, now);
        pacer.on_transmit(1500);
        let delay = pacer.delay(Duration::from_millis(100), 1500, 1500, 12000, now);
        assert!(delay.is_some());
        assert!(delay.unwrap() > now);
    }

    #[test]
    fn refill_over_time() {
        let now = Instant::now();
        let mut pacer = Pacer::new(1500, now);
        pacer.on_transmit(1500);
        // After a full RTT, more than a window's worth of tokens has accrued
        let later = now + Duration::from_millis(100);
        assert_eq!(
            pacer.delay(Duration::from_millis(100), 1500, 1500, 12000, later),
            None
        );
    }
}
