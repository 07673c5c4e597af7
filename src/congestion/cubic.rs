use std::cmp;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    default_initial_window, default_minimum_window, Controller, ControllerFactory,
    MAX_DATAGRAM_SIZE,
};
use crate::connection::RttEstimator;

/// CUBIC Constants.
///
/// The beta used here is the Reno-emulation value recommended in RFC8312.
const BETA_CUBIC: f64 = 0.7;

const C: f64 = 0.4;

/// CUBIC State Variables.
///
/// We need to keep those variables across the connection.
/// k, w_max are described in the RFC.
#[derive(Debug, Default, Clone)]
struct State {
    k: f64,

    w_max: f64,

    // Store cwnd increment during congestion avoidance.
    cwnd_inc: u64,
}

/// CUBIC Functions.
///
/// Note that these calculations are based on a count of cwnd as bytes,
/// not packets.
/// Unit of t (duration) and RTT are based on seconds (f64).
impl State {
    // K = cbrt(w_max * (1 - beta_cubic) / C) (Eq. 2)
    fn cubic_k(&self) -> f64 {
        let w_max = self.w_max / MAX_DATAGRAM_SIZE as f64;
        (w_max * (1.0 - BETA_CUBIC) / C).cbrt()
    }

    // W_cubic(t) = C * (t - K)^3 + w_max (Eq. 1)
    fn w_cubic(&self, t: Duration) -> f64 {
        let w_max = self.w_max / MAX_DATAGRAM_SIZE as f64;

        (C * (t.as_secs_f64() - self.k).powi(3) + w_max) * MAX_DATAGRAM_SIZE as f64
    }

    // W_est(t) = w_max * beta_cubic + 3 * (1 - beta_cubic) / (1 + beta_cubic) *
    // (t / RTT) (Eq. 4)
    fn w_est(&self, t: Duration, rtt: Duration) -> f64 {
        let w_max = self.w_max / MAX_DATAGRAM_SIZE as f64;
        (w_max * BETA_CUBIC
            + 3.0 * (1.0 - BETA_CUBIC) / (1.0 + BETA_CUBIC) * t.as_secs_f64() / rtt.as_secs_f64())
            * MAX_DATAGRAM_SIZE as f64
    }
}

/// The RFC8312 congestion controller, as widely used for TCP, with the
/// Reno-friendly region enabled
#[derive(Debug, Clone)]
pub struct Cubic {
    config: Arc<CubicConfig>,
    /// Maximum number of bytes in flight that may be sent.
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh, the mode is
    /// slow start and the window grows by the number of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a packet sent
    /// after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Option<Instant>,
    cubic_state: State,
}

impl Cubic {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<CubicConfig>, _now: Instant) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: None,
            config,
            cubic_state: Default::default(),
        }
    }
}

impl Controller for Cubic {
    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        if app_limited
            || self
                .recovery_start_time
                .map(|recovery_start_time| sent <= recovery_start_time)
                .unwrap_or(false)
        {
            return;
        }

        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance.
            let ca_start_time = match self.recovery_start_time {
                Some(t) => t,
                None => {
                    // When we come here without a congestion event having triggered,
                    // initialize congestion_recovery_start_time, w_max and k.
                    self.recovery_start_time = Some(now);
                    self.cubic_state.w_max = self.window as f64;
                    self.cubic_state.k = 0.0;
                    now
                }
            };

            let t = now - ca_start_time;

            // w_cubic(t + rtt)
            let w_cubic = self.cubic_state.w_cubic(t + rtt.get());

            // w_est(t)
            let w_est = self.cubic_state.w_est(t, rtt.get());

            let mut cubic_cwnd = self.window;

            if w_cubic < w_est {
                // TCP friendly region.
                cubic_cwnd = cmp::max(cubic_cwnd, w_est as u64);
            } else if cubic_cwnd < w_cubic as u64 {
                // Concave region or convex region use same increment.
                let cubic_inc =
                    (w_cubic - cubic_cwnd as f64) / cubic_cwnd as f64 * MAX_DATAGRAM_SIZE as f64;

                cubic_cwnd += cubic_inc as u64;
            }

            // Update the increment and increase cwnd by MSS.
            self.cubic_state.cwnd_inc += cubic_cwnd - self.window;

            // cwnd_inc can be more than 1 MSS in the late stage of max probing.
            // However RFC9002 §7.3.3 (Congestion Avoidance) limits the increase
            // of cwnd to 1 max_datagram_size per cwnd acknowledged.
            if self.cubic_state.cwnd_inc >= MAX_DATAGRAM_SIZE {
                self.window += MAX_DATAGRAM_SIZE;
                self.cubic_state.cwnd_inc = 0;
            }
        }
    }

    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool) {
        if self
            .recovery_start_time
            .map(|recovery_start_time| sent <= recovery_start_time)
            .unwrap_or(false)
        {
            return;
        }

        self.recovery_start_time = Some(now);

        // Fast convergence
        if (self.window as f64) < self.cubic_state.w_max {
            self.cubic_state.w_max = self.window as f64 * (1.0 + BETA_CUBIC) / 2.0;
        } else {
            self.cubic_state.w_max = self.window as f64;
        }

        self.ssthresh = cmp::max(
            (self.cubic_state.w_max * BETA_CUBIC) as u64,
            self.config.minimum_window,
        );
        self.window = self.ssthresh;
        self.cubic_state.k = self.cubic_state.cubic_k();

        self.cubic_state.cwnd_inc = (self.cubic_state.cwnd_inc as f64 * BETA_CUBIC) as u64;

        if is_persistent_congestion {
            self.recovery_start_time = None;
            self.cubic_state.w_max = self.window as f64;

            // 4.7 Timeout - reduce ssthresh based on BETA_CUBIC
            self.ssthresh = cmp::max(
                (self.window as f64 * BETA_CUBIC) as u64,
                self.config.minimum_window,
            );

            self.cubic_state.cwnd_inc = 0;

            self.window = self.config.minimum_window;
        }
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }
}

/// Configuration for the `Cubic` congestion controller
#[derive(Debug, Clone)]
pub struct CubicConfig {
    initial_window: u64,
    minimum_window: u64,
}

impl CubicConfig {
    /// Default limit on the amount of outstanding data in bytes.
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Default minimum congestion window.
    pub fn minimum_window(&mut self, value: u64) -> &mut Self {
        self.minimum_window = value;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            initial_window: default_initial_window(),
            minimum_window: default_minimum_window(),
        }
    }
}

impl ControllerFactory for CubicConfig {
    fn build(&self, now: Instant) -> Box<dyn Controller> {
        Box::new(Cubic::new(Arc::new(self.clone()), now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let now = Instant::now();
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), now);
        let initial = cubic.window();
        let rtt = RttEstimator::new(Duration::from_millis(100));
        cubic.on_ack(now, now, 1200, false, &rtt);
        assert_eq!(cubic.window(), initial + 1200);
    }

    #[test]
    fn loss_applies_beta() {
        let now = Instant::now();
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), now);
        let initial = cubic.window();
        cubic.on_congestion_event(
            now + Duration::from_millis(10),
            now + Duration::from_millis(5),
            false,
        );
        assert_eq!(cubic.window(), (initial as f64 * BETA_CUBIC) as u64);
    }

    #[test]
    fn recovery_suppresses_repeat_reductions() {
        let now = Instant::now();
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), now);
        let t1 = now + Duration::from_millis(10);
        cubic.on_congestion_event(t1, now + Duration::from_millis(5), false);
        let after_first = cubic.window();
        // A loss of a packet sent before recovery began must not shrink the window again
        cubic.on_congestion_event(t1 + Duration::from_millis(1), t1 - Duration::from_millis(1), false);
        assert_eq!(cubic.window(), after_first);
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        let now = Instant::now();
        let mut cubic = Cubic::new(Arc::new(CubicConfig::default()), now);
        cubic.on_congestion_event(
            now + Duration::from_millis(10),
            now + Duration::from_millis(9),
            true,
        );
        assert_eq!(cubic.window(), default_minimum_window());
    }
}
