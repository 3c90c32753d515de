use stratum_core::StateSnapshot;

type Potential = Box<dyn Fn(&StateSnapshot) -> f64 + Send + Sync>;

/// Potential-based reward shaping: `r + scale·(γ·Φ(s') − Φ(s))`.
///
/// Without a potential function rewards pass through unchanged.
pub struct RewardShaper {
    potential: Option<Potential>,
    pub gamma: f64,
    pub baseline: f64,
    pub scale: f64,
}

impl RewardShaper {
    pub fn new(gamma: f64) -> Self {
        Self {
            potential: None,
            gamma,
            baseline: 0.0,
            scale: 1.0,
        }
    }

    pub fn with_potential(mut self, f: impl Fn(&StateSnapshot) -> f64 + Send + Sync + 'static) -> Self {
        self.potential = Some(Box::new(f));
        self
    }

    pub fn shape(&self, reward: f64, state: &StateSnapshot, next_state: &StateSnapshot) -> f64 {
        match &self.potential {
            Some(phi) => reward + self.scale * (self.gamma * phi(next_state) - phi(state)),
            None => reward,
        }
    }

    /// `(r − baseline) / max(scale, 0.01)`, clamped to [-1, 1].
    pub fn normalize(&self, reward: f64) -> f64 {
        ((reward - self.baseline) / self.scale.max(0.01)).clamp(-1.0, 1.0)
    }
}

impl Default for RewardShaper {
    fn default() -> Self {
        Self::new(0.99)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(n: i64) -> StateSnapshot {
        let mut s = StateSnapshot::new();
        s.insert("progress".into(), serde_json::json!(n));
        s
    }

    fn phi(s: &StateSnapshot) -> f64 {
        s.get("progress").and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    #[test]
    fn passthrough_without_potential() {
        let shaper = RewardShaper::default();
        assert_eq!(shaper.shape(0.3, &progress(0), &progress(5)), 0.3);
    }

    #[test]
    fn potential_difference_is_added() {
        let shaper = RewardShaper::new(0.5).with_potential(phi);
        // 0.1 + (0.5 * 4 - 2)
        assert!((shaper.shape(0.1, &progress(2), &progress(4)) - 0.1).abs() < 1e-12);
        // 0.0 + (0.5 * 6 - 1)
        assert!((shaper.shape(0.0, &progress(1), &progress(6)) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_clamps() {
        let mut shaper = RewardShaper::default();
        shaper.baseline = 0.5;
        shaper.scale = 0.25;
        assert!((shaper.normalize(0.6) - 0.4).abs() < 1e-12);
        assert_eq!(shaper.normalize(3.0), 1.0);
        shaper.scale = 0.0;
        assert_eq!(shaper.normalize(0.4), -1.0);
    }
}
