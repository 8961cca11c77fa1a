//! Round-trip-time smoothing and history.
//!
//! This is a fresh implementation of the exponentially-weighted moving
//! average and bucketed-minimum history the outstanding-bytes cap is built
//! on; it is deliberately not the Jacobson/Karels RFC 6298 `srtt`/`rttvar`
//! estimator used elsewhere for retransmission timeouts, since there is no
//! retransmission timer here -- the carrier is assumed reliable. The only
//! consumer of this estimate is the bandwidth-delay-product cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct HistoryBucket {
    timestamp: Instant,
    min_rtt: Duration,
}

/// Smooths RTT samples via EWMA (`s <- (7s + rtt) / 8`) and tracks a
/// sliding-window minimum ("base RTT") over a bounded number of
/// fixed-width time buckets.
pub struct RttEstimator {
    smoothed: Option<Duration>,
    history: VecDeque<HistoryBucket>,
    base_rtt_cache: Option<Duration>,
    bucket_width: Duration,
    capacity: usize,
}

impl RttEstimator {
    pub fn new(bucket_width: Duration, capacity: usize) -> Self {
        RttEstimator {
            smoothed: None,
            history: VecDeque::with_capacity(capacity),
            base_rtt_cache: None,
            bucket_width,
            capacity,
        }
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed
    }

    pub fn base_rtt(&self) -> Option<Duration> {
        self.base_rtt_cache
    }

    /// Records one RTT sample, updating the EWMA and the bucketed history.
    pub fn sample(&mut self, rtt: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => rtt,
            Some(prev) => (prev * 7 + rtt) / 8,
        });
        self.add_to_history(Instant::now(), rtt);
    }

    fn add_to_history(&mut self, now: Instant, rtt: Duration) {
        let needs_new_bucket = match self.history.front() {
            None => true,
            Some(front) => now.saturating_duration_since(front.timestamp) > self.bucket_width,
        };
        if needs_new_bucket {
            self.history.push_front(HistoryBucket {
                timestamp: now,
                min_rtt: rtt,
            });
            let newest = now;
            let max_age = self.bucket_width * self.capacity as u32;
            while let Some(oldest) = self.history.back() {
                if newest.saturating_duration_since(oldest.timestamp) > max_age {
                    self.history.pop_back();
                } else {
                    break;
                }
            }
        } else if let Some(front) = self.history.front_mut() {
            front.min_rtt = front.min_rtt.min(rtt);
        }
        self.base_rtt_cache = self.history.iter().map(|b| b.min_rtt).min();
    }
}
