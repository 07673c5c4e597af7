use std::{cmp, net::SocketAddr, time::Duration, time::Instant};

use tracing::trace;

use super::pacing::Pacer;
use super::spaces::SentPacket;
use crate::{
    congestion::{self, Controller, ControllerFactory},
    config::TransportConfig,
    packet::SpaceId,
    TIMER_GRANULARITY,
};

/// Description of a particular network path
pub(super) struct PathData {
    pub(super) remote: SocketAddr,
    pub(super) rtt: RttEstimator,
    /// Whether we're enabling ECN on outgoing packets
    pub(super) sending_ecn: bool,
    /// Congestion controller state
    pub(super) congestion: Box<dyn congestion::Controller>,
    /// Pacing state
    pub(super) pacing: Pacer,
    /// Whether we're certain the peer can both send and receive on this address
    ///
    /// Initially false for servers, and becomes false again on migration.
    /// Always true for clients.
    pub(super) validated: bool,
    /// Total size of all UDP datagrams sent on this path
    pub(super) total_sent: u64,
    /// Total size of all UDP datagrams received on this path
    pub(super) total_recvd: u64,
    /// Largest UDP payload we are willing to hand the socket on this path
    pub(super) mtu: u16,
    /// Packet number of the first packet sent after an RTT sample was collected on this path
    ///
    /// Used in persistent congestion determination.
    pub(super) first_packet_after_rtt_sample: Option<(SpaceId, u64)>,
    pub(super) in_flight: InFlight,
}

impl PathData {
    pub(super) fn new(
        remote: SocketAddr,
        now: Instant,
        validated: bool,
        config: &TransportConfig,
    ) -> Self {
        let congestion = config.congestion_controller_factory.build(now);
        Self {
            remote,
            rtt: RttEstimator::new(config.initial_rtt),
            sending_ecn: true,
            pacing: Pacer::new(congestion.initial_window(), now),
            congestion,
            validated,
            total_sent: 0,
            total_recvd: 0,
            mtu: crate::INITIAL_MTU,
            first_packet_after_rtt_sample: None,
            in_flight: InFlight::new(),
        }
    }

    /// Construct a fresh path for a peer that migrated to `remote`
    ///
    /// Congestion state and RTT do not transfer to what may be an entirely
    /// different bottleneck.
    pub(super) fn from_previous(remote: SocketAddr, prev: &Self, now: Instant, config: &TransportConfig) -> Self {
        trace!(%remote, "resetting path state after migration");
        let mut new = Self::new(remote, now, false, config);
        new.mtu = prev.mtu;
        new
    }

    /// Indicates whether we're a server that hasn't validated the peer's address and hasn't
    /// received enough data from the peer to permit sending `bytes_to_send` additional bytes
    pub(super) fn anti_amplification_blocked(&self, bytes_to_send: u64) -> bool {
        !self.validated && self.total_recvd * 3 < self.total_sent + bytes_to_send
    }
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT, as recommended
    /// in 6.1.2 of the recovery spec (draft 29).
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far for this estimator.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The latest RTT sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    // PTO computed as described in RFC9002#6.2.1
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        // Based on RFC6298.
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

/// Pending responses to PATH_CHALLENGE frames received from the current path
///
/// We never probe paths ourselves, so this is strictly an answering machine.
#[derive(Default)]
pub(super) struct PathResponses {
    pending: Vec<u64>,
}

impl PathResponses {
    pub(super) fn push(&mut self, token: u64) {
        /// Arbitrary permissive limit to prevent abuse
        const MAX_PATH_RESPONSES: usize = 16;
        if self.pending.len() < MAX_PATH_RESPONSES {
            self.pending.push(token);
        } else {
            trace!("ignoring excessive PATH_CHALLENGE");
        }
    }

    pub(super) fn pop(&mut self) -> Option<u64> {
        self.pending.pop()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Summary statistics of packets that have been sent on a particular path, but which have not yet
/// been acked or deemed lost
pub(super) struct InFlight {
    /// Sum of the sizes of all sent packets considered "in flight" by congestion control
    ///
    /// The size does not include IP or UDP overhead. Packets only containing ACK frames do not
    /// count towards this to ensure congestion control does not impede congestion feedback.
    pub(super) bytes: u64,
    /// Number of packets in flight containing frames other than ACK and PADDING
    ///
    /// This can be 0 even when bytes is not 0 because PADDING frames cause a packet to be
    /// considered "in flight" by congestion control. However, if this is nonzero, bytes will always
    /// also be nonzero.
    pub(super) ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            bytes: 0,
            ack_eliciting: 0,
        }
    }

    pub(super) fn insert(&mut self, packet: &SentPacket) {
        self.bytes += u64::from(packet.size);
        self.ack_eliciting += u64::from(packet.ack_eliciting);
    }

    /// Update counters to account for a packet becoming acknowledged, lost, or abandoned
    pub(super) fn remove(&mut self, packet: &SentPacket) {
        self.bytes -= u64::from(packet.size);
        self.ack_eliciting -= u64::from(packet.ack_eliciting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_first_sample_initializes() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(rtt.get(), Duration::from_millis(100));
        assert_eq!(rtt.min(), Duration::from_millis(100));
        assert_eq!(rtt.latest(), Duration::from_millis(100));
    }

    #[test]
    fn rtt_smoothing() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        rtt.update(Duration::ZERO, Duration::from_millis(200));
        // smoothed = 7/8 * 100 + 1/8 * 200 = 112.5ms
        assert_eq!(rtt.get(), Duration::from_micros(112_500));
        // var = 3/4 * 50 + 1/4 * |100 - 200| = 62.5ms
        assert_eq!(rtt.pto_base(), Duration::from_micros(112_500 + 4 * 62_500));
        // min is sticky
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn ack_delay_subtracted_unless_below_min() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        // 150ms sample with 40ms ack delay adjusts to 110ms
        rtt.update(Duration::from_millis(40), Duration::from_millis(150));
        assert_eq!(rtt.get(), Duration::from_micros(101_250));
        // 110ms sample with 40ms delay would drop below min; taken unadjusted
        let mut check = RttEstimator::new(Duration::from_millis(333));
        check.update(Duration::ZERO, Duration::from_millis(100));
        check.update(Duration::from_millis(40), Duration::from_millis(110));
        assert_eq!(check.get(), Duration::from_micros(101_250));
    }
}
