//! # Simulated Network Configuration
//!
//! Delivery parameters for [`SimNetwork`](super::SimNetwork). The runtime
//! switches (reliable, long delays, long reordering) are toggled through the
//! network itself; this struct holds the magnitudes they apply.
//!
//! | Behavior | Config Field | Default | Active when |
//! |----------|--------------|---------|------------|
//! | Pre-delivery delay | `short_delay` | 0-27ms | unreliable |
//! | Request drop | `request_drop_probability` | 10% | unreliable |
//! | Reply drop | `reply_drop_probability` | 10% | unreliable |
//! | Unreachable timeout | `unreachable_delay` | 0-100ms | always |
//! | Long unreachable timeout | `long_unreachable_delay` | 0-7000ms | long delays |
//! | Reply reordering | `reorder_probability` | 2/3 | long reordering |
//! | Reorder base delay | `reorder_base` | 200ms | long reordering |
//! | Reorder spread | `reorder_spread` | up to 2000ms | long reordering |
//!
//! ## Configuration Examples
//!
//! ```rust
//! use moonpool_harness::NetworkConfiguration;
//!
//! let config = NetworkConfiguration::default();
//! assert_eq!(config.reorder_base.as_millis(), 200);
//!
//! let fast = NetworkConfiguration::fast_local();
//! assert_eq!(fast.long_unreachable_delay, fast.unreachable_delay);
//! ```

use std::ops::Range;
use std::time::Duration;

/// Magnitudes applied by the simulated network's fault modes.
#[derive(Debug, Clone)]
pub struct NetworkConfiguration {
    /// Delay before delivering a request while unreliable.
    pub short_delay: Range<Duration>,
    /// Probability of dropping a request while unreliable (0.0 - 1.0).
    pub request_drop_probability: f64,
    /// Probability of dropping a reply while unreliable (0.0 - 1.0).
    pub reply_drop_probability: f64,
    /// How long a call to an unreachable server takes to fail.
    pub unreachable_delay: Range<Duration>,
    /// Same as `unreachable_delay` while long delays are enabled.
    pub long_unreachable_delay: Range<Duration>,
    /// Probability of delaying a reply while long reordering is enabled.
    pub reorder_probability: f64,
    /// Minimum extra delay for a reordered reply.
    pub reorder_base: Duration,
    /// Upper bound of the random spread added to `reorder_base`.
    pub reorder_spread: Duration,
    /// How often an in-flight call re-checks that its server is still alive.
    pub liveness_poll: Duration,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            short_delay: Duration::ZERO..Duration::from_millis(27),
            request_drop_probability: 0.1,
            reply_drop_probability: 0.1,
            unreachable_delay: Duration::ZERO..Duration::from_millis(100),
            long_unreachable_delay: Duration::ZERO..Duration::from_millis(7000),
            reorder_probability: 2.0 / 3.0,
            reorder_base: Duration::from_millis(200),
            reorder_spread: Duration::from_millis(2000),
            liveness_poll: Duration::from_millis(100),
        }
    }
}

impl NetworkConfiguration {
    /// Configuration with short timeouts even in long-delay mode.
    ///
    /// Useful for unit tests that exercise unreachable servers.
    pub fn fast_local() -> Self {
        let unreachable = Duration::ZERO..Duration::from_millis(10);
        Self {
            short_delay: Duration::ZERO..Duration::from_millis(2),
            unreachable_delay: unreachable.clone(),
            long_unreachable_delay: unreachable,
            reorder_base: Duration::from_millis(20),
            reorder_spread: Duration::from_millis(50),
            liveness_poll: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Sample a duration uniformly from `range`, returning `range.start` if empty.
pub fn sample_duration(range: &Range<Duration>) -> Duration {
    use rand::Rng;

    if range.start >= range.end {
        return range.start;
    }
    let start = range.start.as_micros() as u64;
    let end = range.end.as_micros() as u64;
    Duration::from_micros(rand::rng().random_range(start..end))
}
