//! Per-session difficulty retargeting.
//!
//! Holds a session's share rate near a configured shares-per-minute target by
//! scaling its difficulty proportionally to the observed rate. Windows close
//! after a fixed duration or a fixed share count, whichever comes first, and
//! retargets only fire when the rate strays beyond a dead band, so a steady
//! miner is left alone.

use std::time::{Duration, Instant};

/// Observation window duration limit.
const WINDOW_DURATION: Duration = Duration::from_secs(120);

/// Observation window share-count limit.
const WINDOW_SHARES: u32 = 30;

/// Fractional deviation from the target rate tolerated without a retarget.
const DEAD_BAND: f64 = 0.30;

/// Retargeting configuration, from the vardiff config options.
#[derive(Debug, Clone, Copy)]
pub struct VardiffConfig {
    /// Desired accepted shares per minute.
    pub target_per_minute: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

impl VardiffConfig {
    pub fn clamp(&self, difficulty: f64) -> f64 {
        difficulty.clamp(self.min_difficulty, self.max_difficulty)
    }
}

/// Per-session vardiff window state.
#[derive(Debug)]
pub struct Vardiff {
    config: VardiffConfig,
    window_start: Instant,
    shares: u32,
}

impl Vardiff {
    pub fn new(config: VardiffConfig, now: Instant) -> Self {
        Self {
            config,
            window_start: now,
            shares: 0,
        }
    }

    /// Record one accepted share.
    ///
    /// Returns the new difficulty when the window closed outside the dead
    /// band; the caller is responsible for the `set_difficulty`/`notify`
    /// pair. The window resets whenever it closes, retarget or not.
    pub fn record_share(&mut self, now: Instant, current_difficulty: f64) -> Option<f64> {
        self.shares += 1;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < WINDOW_DURATION && self.shares < WINDOW_SHARES {
            return None;
        }

        let minutes = elapsed.as_secs_f64() / 60.0;
        let observed = if minutes > 0.0 {
            self.shares as f64 / minutes
        } else {
            // A full share burst within one clock tick: treat as far too fast.
            f64::MAX
        };
        self.window_start = now;
        self.shares = 0;

        let target = self.config.target_per_minute;
        if (observed - target).abs() / target <= DEAD_BAND {
            return None;
        }

        let retargeted = self.config.clamp(current_difficulty * (observed / target));
        if retargeted == current_difficulty {
            None
        } else {
            Some(retargeted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VardiffConfig {
        VardiffConfig {
            target_per_minute: 20.0,
            min_difficulty: 1.0,
            max_difficulty: 65536.0,
        }
    }

    #[test]
    fn test_no_retarget_inside_window() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        for i in 1..WINDOW_SHARES {
            assert_eq!(
                vardiff.record_share(start + Duration::from_secs(i as u64), 8.0),
                None,
                "share {i} closed the window early"
            );
        }
    }

    #[test]
    fn test_window_closes_on_share_count() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        // 30 shares in 30 seconds = 60/min, 3x the target of 20/min
        let mut result = None;
        for i in 0..WINDOW_SHARES {
            result = vardiff.record_share(start + Duration::from_secs(i as u64 + 1), 8.0);
        }
        let new_difficulty = result.expect("3x rate should retarget");
        assert!((new_difficulty - 8.0 * 3.0).abs() < 0.5);
    }

    #[test]
    fn test_window_closes_on_duration() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        // 2 shares in 2 minutes = 1/min against a target of 20/min
        assert_eq!(vardiff.record_share(start + Duration::from_secs(60), 64.0), None);
        let result = vardiff.record_share(start + WINDOW_DURATION, 64.0);
        let new_difficulty = result.expect("5% rate should retarget");
        assert!((new_difficulty - 64.0 / 20.0).abs() < 0.1);
    }

    #[test]
    fn test_dead_band_suppresses_small_drift() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        // 30 shares in 75 s = 24/min, 20% over a 20/min target: inside ±30%
        let mut result = None;
        for i in 0..WINDOW_SHARES {
            result = vardiff.record_share(start + Duration::from_millis(2500 * (i as u64 + 1)), 8.0);
        }
        assert_eq!(result, None);
    }

    #[test]
    fn test_retarget_clamps_to_min() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        assert_eq!(vardiff.record_share(start + Duration::from_secs(60), 1.5), None);
        // 2 shares in 2 minutes at difficulty 1.5 wants ~0.075, clamps to the
        // floor
        let result = vardiff.record_share(start + WINDOW_DURATION, 1.5);
        assert_eq!(result, Some(1.0));
    }

    #[test]
    fn test_retarget_clamps_to_max() {
        let cfg = VardiffConfig {
            max_difficulty: 16.0,
            ..config()
        };
        let start = Instant::now();
        let mut vardiff = Vardiff::new(cfg, start);
        let mut result = None;
        for _ in 0..WINDOW_SHARES {
            // all 30 shares within one second: absurdly fast
            result = vardiff.record_share(start + Duration::from_secs(1), 8.0);
        }
        assert_eq!(result, Some(16.0));
    }

    #[test]
    fn test_no_change_when_already_at_clamp() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        assert_eq!(vardiff.record_share(start + WINDOW_DURATION, 1.0), None);
        // far too slow but already at the floor
        let result = vardiff.record_share(start + WINDOW_DURATION * 2, 1.0);
        assert_eq!(result, None);
    }

    #[test]
    fn test_window_resets_after_close() {
        let start = Instant::now();
        let mut vardiff = Vardiff::new(config(), start);
        let mut result = None;
        for i in 0..WINDOW_SHARES {
            result = vardiff.record_share(start + Duration::from_secs(i as u64 + 1), 8.0);
        }
        assert!(result.is_some());
        // the very next share starts a fresh window
        assert_eq!(
            vardiff.record_share(start + Duration::from_secs(31), 24.0),
            None
        );
    }
}
