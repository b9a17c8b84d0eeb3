//! Turiya — contextual LinUCB bandit over routing tiers.
//!
//! Maintains, per arm, the ridge-regularized design matrix
//! `A = I + Σ x·xᵀ` and reward vector `b = Σ r·x`. Selection solves
//! `A θ = b` by Cholesky decomposition and picks
//! `argmax θᵀx + α √(xᵀ A⁻¹ x)`; the square-root term is the optimism
//! bonus that keeps undersampled arms in play. The same machinery backs the
//! orchestrator's LinUCB strategy mode with a different dimension.
//!
//! All learned state (matrices included) round-trips through serde so the
//! host can persist and restore the bandit across runs.

use serde::{Deserialize, Serialize};

/// Dimension of the routing context vector.
pub const CONTEXT_DIM: usize = 7;

/// Seven-dimensional request context, each component clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextVector {
    pub complexity: f64,
    pub urgency: f64,
    pub creativity: f64,
    pub precision: f64,
    pub code_ratio: f64,
    pub conversation_depth: f64,
    pub memory_load: f64,
}

impl ContextVector {
    pub fn new(
        complexity: f64,
        urgency: f64,
        creativity: f64,
        precision: f64,
        code_ratio: f64,
        conversation_depth: f64,
        memory_load: f64,
    ) -> Self {
        Self {
            complexity: complexity.clamp(0.0, 1.0),
            urgency: urgency.clamp(0.0, 1.0),
            creativity: creativity.clamp(0.0, 1.0),
            precision: precision.clamp(0.0, 1.0),
            code_ratio: code_ratio.clamp(0.0, 1.0),
            conversation_depth: conversation_depth.clamp(0.0, 1.0),
            memory_load: memory_load.clamp(0.0, 1.0),
        }
    }

    pub fn to_array(&self) -> [f64; CONTEXT_DIM] {
        [
            self.complexity,
            self.urgency,
            self.creativity,
            self.precision,
            self.code_ratio,
            self.conversation_depth,
            self.memory_load,
        ]
    }
}

impl Default for ContextVector {
    fn default() -> Self {
        Self::new(0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0)
    }
}

// ---- Dense symmetric linear algebra (row-major, d×d) ----

/// Cholesky decomposition of a symmetric positive-definite matrix.
/// Returns the lower-triangular factor `L` with `L·Lᵀ = A`, or `None`
/// when the matrix is not positive-definite.
pub(crate) fn cholesky(a: &[f64], dim: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; dim * dim];
    for i in 0..dim {
        for j in 0..=i {
            let mut sum = a[i * dim + j];
            for k in 0..j {
                sum -= l[i * dim + k] * l[j * dim + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i * dim + j] = sum.sqrt();
            } else {
                l[i * dim + j] = sum / l[j * dim + j];
            }
        }
    }
    Some(l)
}

/// Solve `A x = rhs` given the Cholesky factor of `A` (forward then
/// backward substitution).
pub(crate) fn cholesky_solve(l: &[f64], rhs: &[f64], dim: usize) -> Vec<f64> {
    // L y = rhs
    let mut y = vec![0.0; dim];
    for i in 0..dim {
        let mut sum = rhs[i];
        for k in 0..i {
            sum -= l[i * dim + k] * y[k];
        }
        y[i] = sum / l[i * dim + i];
    }
    // Lᵀ x = y
    let mut x = vec![0.0; dim];
    for i in (0..dim).rev() {
        let mut sum = y[i];
        for k in (i + 1)..dim {
            sum -= l[k * dim + i] * x[k];
        }
        x[i] = sum / l[i * dim + i];
    }
    x
}

/// Per-arm LinUCB state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinUcbArm {
    /// Row-major `d×d` design matrix `A = I + Σ x·xᵀ`.
    pub a: Vec<f64>,
    /// Reward vector `b = Σ r·x`.
    pub b: Vec<f64>,
    /// Number of updates applied to this arm.
    pub pulls: u64,
}

impl LinUcbArm {
    fn identity(dim: usize) -> Self {
        let mut a = vec![0.0; dim * dim];
        for i in 0..dim {
            a[i * dim + i] = 1.0;
        }
        Self {
            a,
            b: vec![0.0; dim],
            pulls: 0,
        }
    }
}

/// Generic LinUCB over `num_arms` arms of dimension `dim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinUcb {
    pub dim: usize,
    pub alpha: f64,
    pub arms: Vec<LinUcbArm>,
}

impl LinUcb {
    pub fn new(num_arms: usize, dim: usize, alpha: f64) -> Self {
        Self {
            dim,
            alpha,
            arms: (0..num_arms).map(|_| LinUcbArm::identity(dim)).collect(),
        }
    }

    /// Upper-confidence score of one arm for context `x`.
    pub fn score(&self, arm: usize, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim);
        let state = &self.arms[arm];
        let l = match cholesky(&state.a, self.dim) {
            Some(l) => l,
            // A is I + Σ x·xᵀ and stays SPD; a failed factorization means
            // corrupted state, so keep the arm out of contention.
            None => return f64::NEG_INFINITY,
        };
        let theta = cholesky_solve(&l, &state.b, self.dim);
        let a_inv_x = cholesky_solve(&l, x, self.dim);
        let mean: f64 = theta.iter().zip(x).map(|(t, xi)| t * xi).sum();
        let variance: f64 = x.iter().zip(&a_inv_x).map(|(xi, yi)| xi * yi).sum();
        mean + self.alpha * variance.max(0.0).sqrt()
    }

    /// Index of the highest-scoring arm (first wins ties).
    pub fn select(&self, x: &[f64]) -> usize {
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for arm in 0..self.arms.len() {
            let score = self.score(arm, x);
            if score > best_score {
                best_score = score;
                best = arm;
            }
        }
        best
    }

    /// Rank-1 update: `A += x·xᵀ`, `b += r·x`.
    pub fn update(&mut self, arm: usize, x: &[f64], reward: f64) {
        debug_assert_eq!(x.len(), self.dim);
        let state = &mut self.arms[arm];
        for i in 0..self.dim {
            for j in 0..self.dim {
                state.a[i * self.dim + j] += x[i] * x[j];
            }
            state.b[i] += reward * x[i];
        }
        state.pulls += 1;
    }

    /// The per-arm coefficient estimate `θ = A⁻¹ b`.
    pub fn theta(&self, arm: usize) -> Option<Vec<f64>> {
        let state = &self.arms[arm];
        let l = cholesky(&state.a, self.dim)?;
        Some(cholesky_solve(&l, &state.b, self.dim))
    }
}

/// The routing bandit: one LinUCB arm per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turiya {
    model: LinUcb,
}

/// Default exploration parameter.
pub const DEFAULT_ALPHA: f64 = 1.5;

impl Turiya {
    /// `num_tiers` arms over the seven-dimensional routing context.
    pub fn new(num_tiers: usize) -> Self {
        Self::with_alpha(num_tiers, DEFAULT_ALPHA)
    }

    pub fn with_alpha(num_tiers: usize, alpha: f64) -> Self {
        Self {
            model: LinUcb::new(num_tiers, CONTEXT_DIM, alpha),
        }
    }

    /// Pick the tier arm for this context.
    pub fn select(&self, context: &ContextVector) -> usize {
        self.model.select(&context.to_array())
    }

    /// Report the observed reward for a prior selection.
    pub fn update(&mut self, arm: usize, context: &ContextVector, reward: f64) {
        self.model
            .update(arm, &context.to_array(), reward.clamp(0.0, 1.0));
    }

    pub fn arm_pulls(&self, arm: usize) -> u64 {
        self.model.arms[arm].pulls
    }

    pub fn num_arms(&self) -> usize {
        self.model.arms.len()
    }

    /// Persist all matrices as JSON.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Restore from [`serialize`](Turiya::serialize) output.
    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
