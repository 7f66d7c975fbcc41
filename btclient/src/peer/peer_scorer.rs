use std::collections::HashMap;
use std::net::SocketAddr;

const EWMA_ALPHA: f64 = 0.2;
const HISTORY_LEN: usize = 10;
const TRUST_BONUS_PER_WIN: f64 = 0.01;
const TRUST_BONUS_CAP: f64 = 2.0;

/// Per-peer reputation state: a smoothed rate, a short rate history for
/// stability measurement, and a count of rounds won.
#[derive(Debug, Default)]
pub struct PeerStats {
    ewma_rate: f64,
    rate_history: Vec<f64>,
    top_tier_count: u32,
}

impl PeerStats {
    /// Folds a new rate sample into the EWMA (seeded with the first
    /// non-zero sample) and the bounded history window.
    fn add_sample(&mut self, rate: f64) {
        if self.ewma_rate == 0.0 {
            self.ewma_rate = rate;
        } else {
            self.ewma_rate = EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * self.ewma_rate;
        }

        self.rate_history.push(rate);
        if self.rate_history.len() > HISTORY_LEN {
            self.rate_history.remove(0);
        }
    }

    /// A factor in (0, 1] that shrinks as the peer's rate gets less stable:
    /// `1 / (1 + coefficient_of_variation)`.
    fn variance_penalty(&self) -> f64 {
        if self.rate_history.len() < 2 {
            return 1.0;
        }
        let mean = self.rate_history.iter().sum::<f64>() / self.rate_history.len() as f64;
        if mean == 0.0 {
            return 1.0;
        }
        let variance = self
            .rate_history
            .iter()
            .map(|rate| (rate - mean) * (rate - mean))
            .sum::<f64>()
            / self.rate_history.len() as f64;
        let cv = variance.sqrt() / mean;
        1.0 / (1.0 + cv)
    }

    /// A loyalty multiplier: 1% per round won, capped at 2x.
    fn trust_bonus(&self) -> f64 {
        TRUST_BONUS_CAP.min(1.0 + self.top_tier_count as f64 * TRUST_BONUS_PER_WIN)
    }
}

/// Scores peers for the choke algorithm from current rate, smoothed
/// history, rate stability and past round wins.
#[derive(Debug, Default)]
pub struct PeerScorer {
    stats: HashMap<SocketAddr, PeerStats>,
}

impl PeerScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a peer's win count after it was selected into the top
    /// tier of a choke round.
    pub fn record_win(&mut self, addr: SocketAddr) {
        self.stats.entry(addr).or_default().top_tier_count += 1;
    }

    /// Feeds the current rate sample into the peer's stats and returns its
    /// score: `(0.7·rate + 0.3·ewma) · variance_penalty · trust_bonus`.
    pub fn score(&mut self, addr: SocketAddr, current_rate: f64) -> f64 {
        let stats = self.stats.entry(addr).or_default();
        stats.add_sample(current_rate);

        let base_performance = 0.7 * current_rate + 0.3 * stats.ewma_rate;
        base_performance * stats.variance_penalty() * stats.trust_bonus()
    }
}
