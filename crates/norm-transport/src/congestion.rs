//! # Congestion Control
//!
//! The sender's rate loop. In `Fixed` mode the application owns the transmit
//! rate; in the feedback modes the rate tracks the TCP-friendly equation
//! evaluated against the *current limiting receiver* (CLR) — the node whose
//! (RTT, loss) pair yields the lowest sustainable rate, selected from the CC
//! feedback collected by GRTT probes.
//!
//! Slow start doubles the rate each feedback round until the first loss
//! report, bounded by twice the CLR's measured receive rate.

use tracing::debug;

/// Congestion control operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CcMode {
    /// Fixed rate set by the application.
    #[default]
    Fixed,
    /// TCP-friendly, loss-driven.
    Cc,
    /// ECN-driven: only ECN-marked feedback counts as congestion.
    Cce,
    /// Loss-tolerant: ECN preferred, plain loss discounted.
    Ccl,
}

/// One receiver's congestion state as last reported.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackSample {
    pub node_id: u32,
    /// Round-trip time in seconds.
    pub rtt: f64,
    /// Loss event fraction (0.0..=1.0).
    pub loss: f64,
    /// ECN-marked fraction (0.0..=1.0).
    pub ecn: f64,
    /// Receive rate the node reported, bytes/sec.
    pub recv_rate: f64,
}

/// The sender-side rate controller.
pub struct RateController {
    mode: CcMode,
    /// Current pacing rate, bytes/sec.
    rate: f64,
    /// Rate configured for `Fixed` mode (and the slow-start floor).
    fixed_rate: f64,
    rate_min: Option<f64>,
    rate_max: Option<f64>,
    segment_size: f64,
    slow_start: bool,
    /// Current limiting receiver.
    clr: Option<FeedbackSample>,
    active: bool,
}

/// Minimum pacing rate: one small segment per second.
const RATE_FLOOR: f64 = 64.0;

impl RateController {
    pub fn new(mode: CcMode, initial_rate: f64, segment_size: u16) -> Self {
        RateController {
            mode,
            rate: initial_rate.max(RATE_FLOOR),
            fixed_rate: initial_rate.max(RATE_FLOOR),
            rate_min: None,
            rate_max: None,
            segment_size: segment_size as f64,
            slow_start: true,
            clr: None,
            active: false,
        }
    }

    /// Current pacing rate in bytes/sec.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn mode(&self) -> CcMode {
        self.mode
    }

    /// Whether feedback has taken rate authority.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Node id of the current limiting receiver.
    pub fn clr_node(&self) -> Option<u32> {
        self.clr.map(|c| c.node_id)
    }

    /// Set the application rate. Authoritative in `Fixed` mode; otherwise the
    /// new value seeds the next slow start. Returns the new pacing rate if it
    /// changed.
    pub fn set_fixed_rate(&mut self, rate: f64) -> Option<f64> {
        self.fixed_rate = rate.max(RATE_FLOOR);
        if self.mode == CcMode::Fixed {
            let clamped = self.clamp(self.fixed_rate);
            if (clamped - self.rate).abs() > f64::EPSILON {
                self.rate = clamped;
                return Some(self.rate);
            }
        }
        None
    }

    /// Configure rate bounds; either bound may be absent.
    pub fn set_bounds(&mut self, min: Option<f64>, max: Option<f64>) {
        self.rate_min = min;
        self.rate_max = max;
        self.rate = self.clamp(self.rate);
    }

    /// At which bound (if any) the current rate is pinned.
    pub fn at_bound(&self) -> bool {
        self.rate_max.is_some_and(|m| self.rate >= m)
            || self.rate_min.is_some_and(|m| self.rate <= m)
    }

    /// Fold one receiver's feedback into the rate. Returns the new pacing
    /// rate when it changed by more than 5%.
    pub fn on_feedback(&mut self, sample: FeedbackSample) -> Option<f64> {
        if self.mode == CcMode::Fixed {
            return None;
        }
        self.active = true;

        let candidate_rate = self.sustainable_rate(&sample);
        let clr_rate = self.clr.map(|c| self.sustainable_rate(&c));
        let is_new_clr = match (clr_rate, self.clr) {
            (Some(current), Some(clr)) => {
                sample.node_id == clr.node_id || candidate_rate < current
            }
            _ => true,
        };
        if !is_new_clr {
            return None;
        }
        self.clr = Some(sample);

        let loss_signal = self.loss_signal(&sample);
        let old_rate = self.rate;
        if self.slow_start {
            if loss_signal > 0.0 {
                self.slow_start = false;
                self.rate = self.clamp(candidate_rate);
            } else {
                // Double per round, never racing past what the receiver
                // demonstrably absorbs.
                let ceiling = if sample.recv_rate > 0.0 {
                    2.0 * sample.recv_rate
                } else {
                    f64::MAX
                };
                self.rate = self.clamp((self.rate * 2.0).min(ceiling));
            }
        } else if loss_signal > 0.0 {
            self.rate = self.clamp(candidate_rate);
        } else {
            // Loss drained away entirely: probe upward gently rather than
            // jumping to the equation's unbounded zero-loss rate.
            self.rate = self.clamp(self.rate * 1.25);
        }

        if relative_change(old_rate, self.rate) > 0.05 {
            debug!(
                clr = sample.node_id,
                rate = self.rate,
                loss = loss_signal,
                "pacing rate adjusted"
            );
            Some(self.rate)
        } else {
            None
        }
    }

    /// Drop the CLR (e.g. the node left the group); re-enters slow start.
    pub fn clear_clr(&mut self) {
        self.clr = None;
        self.slow_start = true;
    }

    /// Deactivate feedback control (no live receivers).
    pub fn deactivate(&mut self) -> bool {
        let was = self.active;
        self.active = false;
        was
    }

    fn sustainable_rate(&self, sample: &FeedbackSample) -> f64 {
        let loss = self.loss_signal(sample);
        if loss <= 0.0 {
            return f64::MAX;
        }
        tcp_friendly_rate(self.segment_size, sample.rtt, loss)
    }

    fn loss_signal(&self, sample: &FeedbackSample) -> f64 {
        match self.mode {
            CcMode::Fixed => 0.0,
            CcMode::Cc => sample.loss,
            CcMode::Cce => sample.ecn,
            CcMode::Ccl => {
                if sample.ecn > 0.0 {
                    sample.ecn
                } else {
                    sample.loss * 0.5
                }
            }
        }
    }

    fn clamp(&self, rate: f64) -> f64 {
        let mut r = rate.max(RATE_FLOOR);
        if let Some(min) = self.rate_min {
            r = r.max(min);
        }
        if let Some(max) = self.rate_max {
            r = r.min(max);
        }
        r
    }
}

/// The TCP-friendly throughput equation (bytes/sec) for segment size `s`,
/// round-trip `rtt` seconds, and loss event fraction `p`, with the
/// retransmission timeout approximated as 4·RTT.
pub fn tcp_friendly_rate(s: f64, rtt: f64, p: f64) -> f64 {
    let rtt = rtt.max(1.0e-6);
    let p = p.clamp(1.0e-9, 1.0);
    let t_rto = 4.0 * rtt;
    let denom = rtt * (2.0 * p / 3.0).sqrt()
        + t_rto * 3.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p);
    s / denom
}

fn relative_change(old: f64, new: f64) -> f64 {
    if old <= 0.0 {
        return 1.0;
    }
    (new - old).abs() / old
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(node_id: u32, rtt: f64, loss: f64) -> FeedbackSample {
        FeedbackSample {
            node_id,
            rtt,
            loss,
            ecn: 0.0,
            recv_rate: 1.0e6,
        }
    }

    #[test]
    fn tcp_equation_monotonic_in_loss() {
        let r1 = tcp_friendly_rate(1400.0, 0.1, 0.01);
        let r2 = tcp_friendly_rate(1400.0, 0.1, 0.05);
        let r3 = tcp_friendly_rate(1400.0, 0.1, 0.20);
        assert!(r1 > r2 && r2 > r3);
    }

    #[test]
    fn tcp_equation_monotonic_in_rtt() {
        let fast = tcp_friendly_rate(1400.0, 0.01, 0.01);
        let slow = tcp_friendly_rate(1400.0, 0.5, 0.01);
        assert!(fast > slow);
    }

    #[test]
    fn fixed_mode_ignores_feedback() {
        let mut cc = RateController::new(CcMode::Fixed, 10_000.0, 1400);
        assert!(cc.on_feedback(sample(1, 0.1, 0.5)).is_none());
        assert_eq!(cc.rate(), 10_000.0);
        assert!(!cc.is_active());
    }

    #[test]
    fn fixed_rate_change_reports() {
        let mut cc = RateController::new(CcMode::Fixed, 10_000.0, 1400);
        assert_eq!(cc.set_fixed_rate(20_000.0), Some(20_000.0));
        assert_eq!(cc.set_fixed_rate(20_000.0), None, "no-op change silent");
    }

    #[test]
    fn slow_start_doubles_until_loss() {
        let mut cc = RateController::new(CcMode::Cc, 1_000.0, 1400);
        cc.on_feedback(sample(1, 0.05, 0.0));
        assert_eq!(cc.rate(), 2_000.0);
        cc.on_feedback(sample(1, 0.05, 0.0));
        assert_eq!(cc.rate(), 4_000.0);
        assert!(cc.in_slow_start());

        cc.on_feedback(sample(1, 0.05, 0.02));
        assert!(!cc.in_slow_start());
        let expected = tcp_friendly_rate(1400.0, 0.05, 0.02);
        assert!((cc.rate() - expected).abs() < 1.0);
    }

    #[test]
    fn slow_start_bounded_by_recv_rate() {
        let mut cc = RateController::new(CcMode::Cc, 1_000.0, 1400);
        let mut s = sample(1, 0.05, 0.0);
        s.recv_rate = 1_200.0;
        cc.on_feedback(s);
        assert_eq!(cc.rate(), 2_400.0, "capped at 2x receive rate");
    }

    #[test]
    fn clr_tracks_worst_receiver() {
        let mut cc = RateController::new(CcMode::Cc, 1_000.0, 1400);
        cc.on_feedback(sample(1, 0.01, 0.01));
        assert_eq!(cc.clr_node(), Some(1));

        // Node 2 is worse (higher rtt, higher loss): takes over as CLR.
        cc.on_feedback(sample(2, 0.2, 0.05));
        assert_eq!(cc.clr_node(), Some(2));

        // Node 3 is better: CLR unchanged.
        cc.on_feedback(sample(3, 0.001, 0.001));
        assert_eq!(cc.clr_node(), Some(2));
    }

    #[test]
    fn bounds_clamp_rate() {
        let mut cc = RateController::new(CcMode::Cc, 1_000.0, 1400);
        cc.set_bounds(Some(5_000.0), Some(50_000.0));
        assert_eq!(cc.rate(), 5_000.0, "min bound applies immediately");

        for _ in 0..16 {
            cc.on_feedback(sample(1, 0.05, 0.0));
        }
        assert!(cc.rate() <= 50_000.0);
        assert!(cc.at_bound());
    }

    #[test]
    fn cce_mode_uses_ecn_signal() {
        let mut cc = RateController::new(CcMode::Cce, 1_000.0, 1400);
        let mut s = sample(1, 0.05, 0.5);
        s.ecn = 0.0;
        cc.on_feedback(s);
        assert!(cc.in_slow_start(), "plain loss is not congestion in CCE");

        s.ecn = 0.02;
        cc.on_feedback(s);
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn ccl_mode_discounts_plain_loss() {
        let mut ccl = RateController::new(CcMode::Ccl, 1_000.0, 1400);
        let mut cc = RateController::new(CcMode::Cc, 1_000.0, 1400);
        let s = sample(1, 0.05, 0.04);
        ccl.on_feedback(s);
        cc.on_feedback(s);
        assert!(
            ccl.rate() > cc.rate(),
            "loss-tolerant mode yields a higher rate for the same loss"
        );
    }
}
