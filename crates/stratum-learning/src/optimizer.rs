use std::collections::HashMap;

/// Adam with per-parameter moments and one global step counter.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    m: HashMap<String, f64>,
    v: HashMap<String, f64>,
    t: u64,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Bias-corrected step `lr · m̂ / (√v̂ + ε)` for the named parameter.
    ///
    /// Every call advances the shared step counter.
    pub fn compute_update(&mut self, gradient: f64, name: &str) -> f64 {
        self.t += 1;
        let m = self.m.entry(name.to_string()).or_insert(0.0);
        *m = self.beta1 * *m + (1.0 - self.beta1) * gradient;
        let m = *m;
        let v = self.v.entry(name.to_string()).or_insert(0.0);
        *v = self.beta2 * *v + (1.0 - self.beta2) * gradient * gradient;
        let v = *v;

        let t = self.t as i32;
        let m_hat = m / (1.0 - self.beta1.powi(t));
        let v_hat = v / (1.0 - self.beta2.powi(t));
        self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon)
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }
}

impl Default for AdamOptimizer {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999, 1e-8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_is_learning_rate_times_sign() {
        let mut adam = AdamOptimizer::new(0.01, 0.9, 0.999, 1e-8);
        let up = adam.compute_update(3.0, "a");
        assert!((up - 0.01).abs() < 1e-6);
        let down = adam.compute_update(-2.0, "b");
        // b has fresh moments but the step counter is shared
        assert!(down < 0.0);
        assert_eq!(adam.steps(), 2);
    }

    #[test]
    fn reset_clears_state() {
        let mut adam = AdamOptimizer::default();
        adam.compute_update(1.0, "x");
        adam.reset();
        assert_eq!(adam.steps(), 0);
        let again = adam.compute_update(1.0, "x");
        assert!((again - 0.001).abs() < 1e-6);
    }
}
