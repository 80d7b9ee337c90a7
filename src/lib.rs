//! # CR3BP: Circular Restricted Three-Body Propagator
//!
//! Trajectory propagation for a massless body moving under the gravity of
//! two primaries in circular orbit, in the rotating, nondimensionalized,
//! barycentric frame.
//!
//! ## Features
//!
//! - Rotating-frame equations of motion with singularity detection at both
//!   primaries and the Jacobi constant as a conserved quantity
//! - Two adaptive embedded Runge-Kutta pairs: Dormand-Prince 5(4) and
//!   Fehlberg 7(8)
//! - Mixed absolute/relative local error control with bounded step-size
//!   growth and shrink
//! - Sparse output (every accepted step) or dense output resampled onto a
//!   fixed grid by each pair's interpolant
//! - Forward and backward propagation; the last sample lands exactly on `t1`
//! - Parallel batches of independent propagations via rayon
//!
//! ## Basic Usage
//!
//! ```rust
//! use cr3bp::{propagate, IntegratorOrder, OutputMode, PropagationConfig, EARTH_MOON_MU};
//!
//! let config = PropagationConfig::default()
//!     .with_order(IntegratorOrder::Rk78)
//!     .with_output(OutputMode::Sparse)
//!     .with_tolerances(1e-12, 1e-5);
//!
//! let state = [-0.27, -0.42, 0.0, 0.3, -1.0, 0.0];
//! let trajectory = propagate(&state, (0.0, 1.0), EARTH_MOON_MU, &config).unwrap();
//!
//! assert_eq!(trajectory.first().unwrap().state, state);
//! assert_eq!(trajectory.last().unwrap().t, 1.0);
//! ```
//!
//! ## Custom Systems
//!
//! The integrator is generic over [`OdeSystem`], so the same steppers drive
//! any fixed-size first-order system:
//!
//! ```rust
//! use cr3bp::coefficients::dopri5;
//! use cr3bp::{DynamicsError, EmbeddedRk, OdeSystem, Tolerances};
//!
//! struct HarmonicOscillator { omega: f64 }
//!
//! impl OdeSystem<2> for HarmonicOscillator {
//!     fn rhs(&self, _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), DynamicsError> {
//!         dydt[0] = y[1];
//!         dydt[1] = -self.omega * self.omega * y[0];
//!         Ok(())
//!     }
//! }
//!
//! let sys = HarmonicOscillator { omega: 1.0 };
//! let mut solver = EmbeddedRk::new(&dopri5::TABLEAU, Tolerances::new(1e-10, 1e-10));
//! let (tf, yf) = solver.integrate(&sys, 0.0, &[1.0, 0.0], 10.0).unwrap();
//! assert_eq!(tf, 10.0);
//! assert!((yf[0] - 10.0_f64.cos()).abs() < 1e-7);
//! ```
//!
//! ## Tolerance Selection
//!
//! States are nondimensional, so one tolerance usually serves every
//! component. For the Earth-Moon system:
//!
//! - `atol = rtol = 1e-12` with RK78 keeps the Jacobi constant drift near
//!   the tolerance level over a few time units
//! - RK45 becomes expensive below `1e-10`; prefer RK78 there
//! - Dense output with RK78 uses cubic Hermite between its long steps and
//!   loses accuracy at interior samples (around `1e-6` at `1e-12`
//!   tolerances); use RK45 when resampled states must meet the tolerance
//!
//! Failures are reported through [`PropagationError`]. Nothing is retried
//! internally; loosen the tolerances and resubmit if a propagation underflows.
//!
//! ## References
//!
//! 1. Szebehely, V. (1967). "Theory of Orbits: The Restricted Problem of
//!    Three Bodies". Academic Press.
//!
//! 2. Fehlberg, E. (1968). "Classical Fifth-, Sixth-, Seventh-, and
//!    Eighth-Order Runge-Kutta Formulas with Stepsize Control".
//!    NASA TR R-287.
//!
//! 3. Dormand, J.R. & Prince, P.J. (1980). "A family of embedded
//!    Runge-Kutta formulae". J. Comp. Appl. Math. 6(1).
//!
//! 4. Hairer, E., Nørsett, S.P., & Wanner, G. (1993). "Solving
//!    Ordinary Differential Equations I: Nonstiff Problems".
//!    Springer.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod coefficients;
pub mod dense;
pub mod dynamics;
pub mod error;
pub mod propagate;
pub mod solver;

pub use dense::{DenseGrid, DenseMethod, DenseSampler, Interpolant};
pub use dynamics::{Body, Cr3bp, DynamicsError, EARTH_MOON_MU, SINGULARITY_RADIUS};
pub use error::PropagationError;
pub use propagate::{
    propagate, propagate_batch, Case, IntegratorOrder, OutputMode, PropagationConfig, Sample,
    Trajectory, STATE_DIM,
};
pub use solver::{
    AcceptedStep, EmbeddedRk, OdeSystem, Settings, Stats, StepController, StepResult, Tolerances,
};
