//! Link diagnostics: ping/pong round-trip tracking and transport counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outstanding ping awaiting a pong.
struct PendingPing {
    sequence: u32,
    sent_at: Instant,
}

/// Configuration for the round-trip tracker.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Number of RTT samples to keep in the rolling window. Default: 32.
    pub window_size: usize,
    /// Timeout for pending pings. Default: 10s.
    pub ping_timeout: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            window_size: 32,
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Rolling window of RTT samples fed by `ping`/`pong` exchanges.
pub struct DiagnosticsTracker {
    config: DiagnosticsConfig,
    rtt_samples: VecDeque<Duration>,
    pending_pings: VecDeque<PendingPing>,
    next_sequence: u32,
    total_pings_sent: u64,
    total_pongs_received: u64,
}

impl DiagnosticsTracker {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            rtt_samples: VecDeque::with_capacity(config.window_size),
            pending_pings: VecDeque::new(),
            next_sequence: 0,
            total_pings_sent: 0,
            total_pongs_received: 0,
            config,
        }
    }

    /// Record that a ping was sent. Returns the sequence number to put in it.
    pub fn on_ping_sent(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending_pings.push_back(PendingPing {
            sequence,
            sent_at: Instant::now(),
        });
        self.total_pings_sent += 1;
        sequence
    }

    /// Record a pong. Unknown or expired sequence numbers are ignored.
    pub fn on_pong_received(&mut self, sequence: u32) {
        let Some(pos) = self
            .pending_pings
            .iter()
            .position(|p| p.sequence == sequence)
        else {
            return;
        };
        if let Some(ping) = self.pending_pings.remove(pos) {
            if self.rtt_samples.len() >= self.config.window_size {
                self.rtt_samples.pop_front();
            }
            self.rtt_samples.push_back(ping.sent_at.elapsed());
            self.total_pongs_received += 1;
        }
    }

    /// Drop pending pings older than the timeout; they count as lost.
    pub fn expire_pending(&mut self) {
        let timeout = self.config.ping_timeout;
        while let Some(front) = self.pending_pings.front() {
            if front.sent_at.elapsed() > timeout {
                self.pending_pings.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    /// Fraction of pings that were answered neither in time nor at all.
    pub fn loss_rate(&self) -> f64 {
        if self.total_pings_sent == 0 {
            return 0.0;
        }
        let lost = self
            .total_pings_sent
            .saturating_sub(self.total_pongs_received)
            .saturating_sub(self.pending_pings.len() as u64);
        lost as f64 / self.total_pings_sent as f64
    }

    pub fn sample_count(&self) -> usize {
        self.rtt_samples.len()
    }
}

/// Lifetime counters for one transport endpoint.
#[derive(Debug, Default)]
pub struct TransportStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    malformed_datagrams: AtomicU64,
    unknown_datagram_sources: AtomicU64,
    connections_dropped: AtomicU64,
}

/// Plain copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub malformed_datagrams: u64,
    pub unknown_datagram_sources: u64,
    pub connections_dropped: u64,
}

impl TransportStats {
    pub(crate) fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn malformed_datagram(&self) {
        self.malformed_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unknown_datagram_source(&self) {
        self.unknown_datagram_sources.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            malformed_datagrams: self.malformed_datagrams.load(Ordering::Relaxed),
            unknown_datagram_sources: self.unknown_datagram_sources.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tracker(window: usize) -> DiagnosticsTracker {
        DiagnosticsTracker::new(DiagnosticsConfig {
            window_size: window,
            ping_timeout: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_rtt_measured() {
        let mut tracker = make_tracker(8);
        let seq = tracker.on_ping_sent();
        tracker.on_pong_received(seq);

        let avg = tracker.average_rtt().unwrap();
        assert!(avg < Duration::from_millis(50), "RTT should be near-zero, got {avg:?}");
        assert_eq!(tracker.sample_count(), 1);
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let mut tracker = make_tracker(8);
        assert_eq!(tracker.on_ping_sent(), 0);
        assert_eq!(tracker.on_ping_sent(), 1);
        assert_eq!(tracker.on_ping_sent(), 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut tracker = make_tracker(3);
        for _ in 0..10 {
            let seq = tracker.on_ping_sent();
            tracker.on_pong_received(seq);
        }
        assert_eq!(tracker.sample_count(), 3);
    }

    #[test]
    fn test_unknown_pong_ignored() {
        let mut tracker = make_tracker(8);
        tracker.on_pong_received(42);
        assert_eq!(tracker.sample_count(), 0);
        assert!(tracker.average_rtt().is_none());
    }

    #[test]
    fn test_loss_rate_counts_expired_pings() {
        let mut tracker = DiagnosticsTracker::new(DiagnosticsConfig {
            window_size: 16,
            ping_timeout: Duration::from_millis(1),
        });
        for i in 0..10 {
            let seq = tracker.on_ping_sent();
            if i < 7 {
                tracker.on_pong_received(seq);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
        tracker.expire_pending();

        let loss = tracker.loss_rate();
        assert!((loss - 0.3).abs() < 0.01, "expected 30% loss, got {loss}");
    }

    #[test]
    fn test_transport_counters_snapshot() {
        let stats = TransportStats::default();
        stats.frame_sent();
        stats.frame_sent();
        stats.malformed_datagram();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.malformed_datagrams, 1);
        assert_eq!(snap.frames_received, 0);
    }
}
