//! Logic for controlling the rate at which data is sent

use std::time::Instant;

use crate::connection::RttEstimator;

mod cubic;
mod new_reno;

pub use cubic::{Cubic, CubicConfig};
pub use new_reno::{NewReno, NewRenoConfig};

/// Common interface for different congestion controllers
pub trait Controller: Send {
    /// Packet deliveries were confirmed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data prior to receiving these acknowledgements.
    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    );

    /// Packets were deemed lost or marked congested
    ///
    /// `is_persistent_congestion` indicates whether all packets sent within the persistent
    /// congestion threshold period ending when the most recent packet in this batch was sent were
    /// lost.
    fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool);

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    /// Construct a fresh `Controller`
    fn build(&self, now: Instant) -> Box<dyn Controller>;
}

/// The assumed maximum UDP payload size, used to size windows
const MAX_DATAGRAM_SIZE: u64 = 1200;

/// Default initial window per RFC 9002 §7.2
fn default_initial_window() -> u64 {
    14720.clamp(2 * MAX_DATAGRAM_SIZE, 10 * MAX_DATAGRAM_SIZE)
}

/// Default floor the window never shrinks beneath
fn default_minimum_window() -> u64 {
    2 * MAX_DATAGRAM_SIZE
}
