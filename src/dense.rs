//! Dense Output
//!
//! Resamples an adaptive trajectory onto a fixed grid of evenly spaced
//! times. Each accepted step is covered by a local interpolant; grid points
//! falling inside the step are evaluated from it as soon as the step is
//! accepted. The step-size control never sees the grid.
//!
//! Two interpolants are available:
//!
//! - **DOPRI5 continuous extension**: 4th-order, built from the stages of
//!   the Dormand-Prince step itself (Hairer, Nørsett & Wanner, II.6).
//! - **Cubic Hermite**: 3rd-order, built from the states and derivatives at
//!   both ends of the step. Used with pairs that have no continuous
//!   extension of their own (Fehlberg 7(8)). Its error grows as `h⁴`, so
//!   over long RKF78 steps interior samples are far less accurate than
//!   the steps themselves.

use serde::{Deserialize, Serialize};

use crate::coefficients::dopri5;
use crate::error::PropagationError;
use crate::solver::AcceptedStep;

/// Interpolation scheme used inside an accepted step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenseMethod {
    /// Cubic Hermite interpolation from end states and derivatives
    Hermite,
    /// Dormand-Prince 5(4) continuous extension; requires DOPRI5 stages
    Dopri5,
}

/// Local continuous extension over one accepted step
#[derive(Debug, Clone)]
pub enum Interpolant<const N: usize> {
    /// Cubic Hermite interpolation
    Hermite {
        /// Step start time
        t0: f64,
        /// Signed step size
        h: f64,
        /// State at the start
        y0: [f64; N],
        /// Derivative at the start
        f0: [f64; N],
        /// State at the end
        y1: [f64; N],
        /// Derivative at the end
        f1: [f64; N],
    },
    /// DOPRI5 continuous extension
    Dopri5 {
        /// Step start time
        t0: f64,
        /// Signed step size
        h: f64,
        /// Polynomial coefficients
        cont: [[f64; N]; 5],
    },
}

impl<const N: usize> Interpolant<N> {
    /// Build the interpolant of `method` for `step`
    pub fn new(method: DenseMethod, step: &AcceptedStep<'_, N>) -> Self {
        match method {
            DenseMethod::Hermite => Self::hermite(step),
            DenseMethod::Dopri5 => Self::dopri5(step),
        }
    }

    /// Cubic Hermite interpolant through both ends of `step`
    pub fn hermite(step: &AcceptedStep<'_, N>) -> Self {
        Interpolant::Hermite {
            t0: step.t_prev,
            h: step.h,
            y0: *step.y_prev,
            f0: *step.f_prev,
            y1: *step.y,
            f1: *step.f,
        }
    }

    /// DOPRI5 continuous extension of `step`. The step must carry the seven
    /// Dormand-Prince stages.
    #[allow(clippy::needless_range_loop)]
    pub fn dopri5(step: &AcceptedStep<'_, N>) -> Self {
        debug_assert_eq!(step.stages.len(), dopri5::STAGES);
        let k = step.stages;
        let h = step.h;
        let mut cont = [[0.0; N]; 5];

        for i in 0..N {
            let y0 = step.y_prev[i];
            let ydiff = step.y[i] - y0;
            let bspl = h * k[0][i] - ydiff;
            let mut dense = 0.0;
            for (s, &d) in dopri5::D.iter().enumerate() {
                dense += d * k[s][i];
            }
            cont[0][i] = y0;
            cont[1][i] = ydiff;
            cont[2][i] = bspl;
            cont[3][i] = ydiff - h * k[dopri5::STAGES - 1][i] - bspl;
            cont[4][i] = h * dense;
        }

        Interpolant::Dopri5 {
            t0: step.t_prev,
            h,
            cont,
        }
    }

    /// Evaluate the interpolant at time `t` inside the step
    #[allow(clippy::needless_range_loop)]
    pub fn eval(&self, t: f64) -> [f64; N] {
        let mut y = [0.0; N];
        match self {
            Interpolant::Hermite {
                t0,
                h,
                y0,
                f0,
                y1,
                f1,
            } => {
                let alpha = (t - t0) / h;
                let a2 = alpha * alpha;
                let a3 = a2 * alpha;
                // Hermite basis functions
                let h00 = 1.0 - 3.0 * a2 + 2.0 * a3;
                let h10 = alpha - 2.0 * a2 + a3;
                let h01 = 3.0 * a2 - 2.0 * a3;
                let h11 = -a2 + a3;
                for i in 0..N {
                    y[i] = h00 * y0[i] + h10 * h * f0[i] + h01 * y1[i] + h11 * h * f1[i];
                }
            }
            Interpolant::Dopri5 { t0, h, cont } => {
                let theta = (t - t0) / h;
                let theta1 = 1.0 - theta;
                for i in 0..N {
                    y[i] = cont[0][i]
                        + theta
                            * (cont[1][i]
                                + theta1
                                    * (cont[2][i]
                                        + theta * (cont[3][i] + theta1 * cont[4][i])));
                }
            }
        }
        y
    }
}

/// `n` evenly spaced times covering `[t0, t1]` inclusive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseGrid {
    t0: f64,
    t1: f64,
    n: usize,
}

impl DenseGrid {
    /// Grid of `n >= 2` points over a non-empty span
    pub fn new(t0: f64, t1: f64, n: usize) -> Result<Self, PropagationError> {
        if n < 2 {
            return Err(PropagationError::invalid(format!(
                "dense output needs at least 2 samples, got {}",
                n
            )));
        }
        if !(t0.is_finite() && t1.is_finite()) || t0 == t1 {
            return Err(PropagationError::invalid(
                "dense output needs a finite, non-empty time span",
            ));
        }
        Ok(Self { t0, t1, n })
    }

    /// Number of grid points
    pub fn len(&self) -> usize {
        self.n
    }

    /// Always false; a grid holds at least two points
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Time of point `i`; the last point is exactly `t1`
    pub fn time(&self, i: usize) -> f64 {
        if i + 1 >= self.n {
            self.t1
        } else {
            self.t0 + i as f64 * (self.t1 - self.t0) / (self.n - 1) as f64
        }
    }

    /// All grid times in propagation order
    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.n).map(move |i| self.time(i))
    }
}

/// Collects grid samples while the integrator advances
#[derive(Debug, Clone)]
pub struct DenseSampler<const N: usize> {
    grid: DenseGrid,
    method: DenseMethod,
    direction: f64,
    next: usize,
    samples: Vec<(f64, [f64; N])>,
}

impl<const N: usize> DenseSampler<N> {
    /// Start sampling; the first grid point takes the initial state verbatim
    pub fn new(grid: DenseGrid, method: DenseMethod, y0: &[f64; N]) -> Self {
        let mut samples = Vec::with_capacity(grid.len());
        samples.push((grid.time(0), *y0));
        Self {
            direction: (grid.t1 - grid.t0).signum(),
            grid,
            method,
            next: 1,
            samples,
        }
    }

    /// Emit every pending grid point covered by `step`
    pub fn observe(&mut self, step: &AcceptedStep<'_, N>) {
        let mut interp = None;
        while self.next < self.grid.len() {
            let t = self.grid.time(self.next);
            if (t - step.t) * self.direction > 0.0 {
                break;
            }
            let y = if t == step.t {
                *step.y
            } else {
                interp
                    .get_or_insert_with(|| Interpolant::new(self.method, step))
                    .eval(t)
            };
            self.samples.push((t, y));
            self.next += 1;
        }
    }

    /// Whether every grid point has been emitted
    pub fn is_complete(&self) -> bool {
        self.next == self.grid.len()
    }

    /// The collected samples
    pub fn finish(self) -> Vec<(f64, [f64; N])> {
        self.samples
    }
}
