use stratum_core::{StateSnapshot, Transition, ValueFunction};

/// Generalized advantage estimation over a transition sequence.
#[derive(Debug, Clone, Copy)]
pub struct AdvantageEstimator {
    pub gamma: f64,
    pub lambda: f64,
}

impl AdvantageEstimator {
    pub fn new(gamma: f64, lambda: f64) -> Self {
        Self { gamma, lambda }
    }

    /// Per-step advantages for `trajectory`, in the same order.
    ///
    /// `δ_t = r_t + γ·V(s_{t+1})·(1 - done_t) − V(s_t)` and
    /// `A_t = δ_t + γλ·A_{t+1}·(1 - done_t)`, accumulated backwards.
    /// Without a value function every state is worth 0.
    pub fn compute(&self, trajectory: &[Transition], values: Option<&dyn ValueFunction>) -> Vec<f64> {
        let value = |state: &StateSnapshot| values.map_or(0.0, |v| v.value(state));

        let mut advantages = vec![0.0; trajectory.len()];
        let mut gae = 0.0;
        for (i, step) in trajectory.iter().enumerate().rev() {
            let not_done = if step.done { 0.0 } else { 1.0 };
            let v_next = value(&step.next_state) * not_done;
            let delta = step.reward + self.gamma * v_next - value(&step.state);
            gae = delta + self.gamma * self.lambda * gae * not_done;
            advantages[i] = gae;
        }
        advantages
    }

    /// Rescale to zero mean and unit variance: `(a − mean) / sqrt(var + 1e-8)`.
    pub fn normalize(advantages: &[f64]) -> Vec<f64> {
        if advantages.is_empty() {
            return Vec::new();
        }
        let n = advantages.len() as f64;
        let mean = advantages.iter().sum::<f64>() / n;
        let var = advantages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
        let std = (var + 1e-8).sqrt();
        advantages.iter().map(|a| (a - mean) / std).collect()
    }
}

impl Default for AdvantageEstimator {
    fn default() -> Self {
        Self::new(0.99, 0.95)
    }
}
