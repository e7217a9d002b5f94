//! Robust loss functions for iteratively reweighted least squares.
//!
//! A robustifier maps the squared residual norm `s = ‖r‖²` to a cost `ρ(s)`.
//! In the normal equations each observation is weighted by `ρ'(s)`.

use serde::{Deserialize, Serialize};

/// Robust kernel applied to squared residual norms.
pub trait Robustifier: Send + Sync {
    /// Cost `ρ(s)`.
    fn rho(&self, s: f64) -> f64;

    /// IRLS weight `ρ'(s)`.
    fn weight(&self, s: f64) -> f64;
}

/// Plain least squares: `ρ(s) = s`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredLoss;

impl Robustifier for SquaredLoss {
    fn rho(&self, s: f64) -> f64 {
        s
    }

    fn weight(&self, _s: f64) -> f64 {
        1.0
    }
}

/// Huber kernel: quadratic up to `threshold` (pixels), linear beyond.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    pub threshold: f64,
}

impl Robustifier for HuberLoss {
    fn rho(&self, s: f64) -> f64 {
        let d2 = self.threshold * self.threshold;
        if s <= d2 {
            s
        } else {
            2.0 * self.threshold * s.sqrt() - d2
        }
    }

    fn weight(&self, s: f64) -> f64 {
        if s <= self.threshold * self.threshold {
            1.0
        } else {
            self.threshold / s.sqrt()
        }
    }
}

/// Cauchy kernel: `ρ(s) = c² ln(1 + s/c²)`. Its influence decays for large
/// residuals, so gross outliers barely move the solution.
#[derive(Debug, Clone, Copy)]
pub struct CauchyLoss {
    pub scale: f64,
}

impl Robustifier for CauchyLoss {
    fn rho(&self, s: f64) -> f64 {
        let c2 = self.scale * self.scale;
        c2 * (1.0 + s / c2).ln()
    }

    fn weight(&self, s: f64) -> f64 {
        1.0 / (1.0 + s / (self.scale * self.scale))
    }
}

/// Serializable choice of robustifier.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    Squared,
    Huber {
        threshold: f64,
    },
    Cauchy {
        scale: f64,
    },
}

impl RobustLoss {
    pub fn build(&self) -> Box<dyn Robustifier> {
        match *self {
            RobustLoss::Squared => Box::new(SquaredLoss),
            RobustLoss::Huber { threshold } => Box::new(HuberLoss { threshold }),
            RobustLoss::Cauchy { scale } => Box::new(CauchyLoss { scale }),
        }
    }
}
