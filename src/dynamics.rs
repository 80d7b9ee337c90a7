//! CR3BP Equations of Motion
//!
//! Dynamics of a massless third body under the gravity of two primaries in
//! circular mutual orbit, written in the co-rotating, nondimensionalized,
//! barycentric frame. Units are chosen so that the primaries' separation,
//! their total mass and their angular rate are all 1.
//!
//! The larger body sits at `(-μ, 0, 0)` and the smaller at `(1 - μ, 0, 0)`.
//! The state is `[x, y, z, vx, vy, vz]`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PropagationError;
use crate::solver::OdeSystem;

/// Earth-Moon mass ratio
pub const EARTH_MOON_MU: f64 = 0.0121505842699;

/// Distance to a primary below which the dynamics are treated as singular
pub const SINGULARITY_RADIUS: f64 = 1e-12;

/// One of the two massive bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Larger body, mass 1 - μ, at (-μ, 0, 0)
    Primary,
    /// Smaller body, mass μ, at (1 - μ, 0, 0)
    Secondary,
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Primary => write!(f, "primary"),
            Body::Secondary => write!(f, "secondary"),
        }
    }
}

/// Failure of a single right-hand-side evaluation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicsError {
    /// The state coincides with a primary; 1/r³ is undefined there
    #[error("state coincides with the {0}")]
    Singular(Body),
}

/// Circular Restricted Three-Body Problem with a fixed mass ratio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cr3bp {
    mu: f64,
}

impl Cr3bp {
    /// Create the model for mass ratio `mu`, which must lie in (0, 1)
    pub fn new(mu: f64) -> Result<Self, PropagationError> {
        if !(mu > 0.0 && mu < 1.0) {
            return Err(PropagationError::invalid(format!(
                "mu must lie in (0, 1), got {}",
                mu
            )));
        }
        Ok(Self { mu })
    }

    /// Earth-Moon system
    pub fn earth_moon() -> Self {
        Self { mu: EARTH_MOON_MU }
    }

    /// Mass ratio μ
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Position of `body` in the rotating frame
    pub fn position_of(&self, body: Body) -> [f64; 3] {
        match body {
            Body::Primary => [-self.mu, 0.0, 0.0],
            Body::Secondary => [1.0 - self.mu, 0.0, 0.0],
        }
    }

    /// Distances `(r1, r2)` from the state to the primary and the secondary
    pub fn distances(&self, s: &[f64; 6]) -> (f64, f64) {
        let (x, y, z) = (s[0], s[1], s[2]);
        let yz2 = y * y + z * z;
        let r1 = ((x + self.mu).powi(2) + yz2).sqrt();
        let r2 = ((x - 1.0 + self.mu).powi(2) + yz2).sqrt();
        (r1, r2)
    }

    /// Evaluate ds/dt at state `s`.
    ///
    /// ```text
    /// ax =  2 vy + x - (1-μ)(x+μ)/r1³ - μ(x-1+μ)/r2³
    /// ay = -2 vx + y - (1-μ) y/r1³    - μ y/r2³
    /// az =           - (1-μ) z/r1³    - μ z/r2³
    /// ```
    pub fn derivative(&self, s: &[f64; 6], ds: &mut [f64; 6]) -> Result<(), DynamicsError> {
        let (r1, r2) = self.distances(s);
        if r1 <= SINGULARITY_RADIUS {
            return Err(DynamicsError::Singular(Body::Primary));
        }
        if r2 <= SINGULARITY_RADIUS {
            return Err(DynamicsError::Singular(Body::Secondary));
        }

        let mu = self.mu;
        let one_minus_mu = 1.0 - mu;
        let (x, y, z) = (s[0], s[1], s[2]);
        let (vx, vy, vz) = (s[3], s[4], s[5]);

        let k1 = one_minus_mu / (r1 * r1 * r1);
        let k2 = mu / (r2 * r2 * r2);

        ds[0] = vx;
        ds[1] = vy;
        ds[2] = vz;
        ds[3] = 2.0 * vy + x - k1 * (x + mu) - k2 * (x - one_minus_mu);
        ds[4] = -2.0 * vx + y - k1 * y - k2 * y;
        ds[5] = -k1 * z - k2 * z;
        Ok(())
    }

    /// Effective potential Ω = (x² + y²)/2 + (1-μ)/r1 + μ/r2
    pub fn pseudo_potential(&self, s: &[f64; 6]) -> f64 {
        let (r1, r2) = self.distances(s);
        0.5 * (s[0] * s[0] + s[1] * s[1]) + (1.0 - self.mu) / r1 + self.mu / r2
    }

    /// Jacobi constant C = 2Ω - v², conserved along every trajectory
    pub fn jacobi_constant(&self, s: &[f64; 6]) -> f64 {
        let v2 = s[3] * s[3] + s[4] * s[4] + s[5] * s[5];
        2.0 * self.pseudo_potential(s) - v2
    }
}

impl OdeSystem<6> for Cr3bp {
    fn rhs(&self, _t: f64, y: &[f64; 6], dydt: &mut [f64; 6]) -> Result<(), DynamicsError> {
        self.derivative(y, dydt)
    }
}
