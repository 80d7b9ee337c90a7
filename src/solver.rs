//! Adaptive Embedded Runge-Kutta Integrator
//!
//! Advances an ODE system with one of the embedded pairs in
//! [`coefficients`](crate::coefficients), estimating the local truncation
//! error from the difference of the two solutions and adapting the step
//! size so that every accepted step satisfies the mixed absolute/relative
//! tolerance on every component.
//!
//! Reference: Hairer, E., Nørsett, S.P., & Wanner, G. (1993). "Solving
//! Ordinary Differential Equations I: Nonstiff Problems", Section II.4.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::coefficients::{Tableau, MAX_STAGES};
use crate::dynamics::DynamicsError;
use crate::error::PropagationError;

/// System of ordinary differential equations: dy/dt = f(t, y)
pub trait OdeSystem<const N: usize> {
    /// Evaluate the right-hand side of the ODE system
    ///
    /// # Arguments
    /// * `t` - Current time
    /// * `y` - Current state vector
    /// * `dydt` - Output: derivative dy/dt
    ///
    /// Fails when the system is undefined at `(t, y)`.
    fn rhs(&self, t: f64, y: &[f64; N], dydt: &mut [f64; N]) -> Result<(), DynamicsError>;
}

/// Integration result from a single trial step
#[derive(Debug, Clone)]
pub struct StepResult<const N: usize> {
    /// New state after the step (higher-order solution)
    pub y: [f64; N],
    /// New time value
    pub t: f64,
    /// Normalized error estimate (should be ≤ 1.0 for acceptance)
    pub error: f64,
    /// Suggested magnitude of the next step
    pub h_next: f64,
    /// Whether the step was accepted
    pub accepted: bool,
}

/// An accepted step, handed to the observer of [`EmbeddedRk::integrate_with`]
#[derive(Debug)]
pub struct AcceptedStep<'a, const N: usize> {
    /// Time at the start of the step
    pub t_prev: f64,
    /// State at the start of the step
    pub y_prev: &'a [f64; N],
    /// Derivative at the start of the step
    pub f_prev: &'a [f64; N],
    /// Time at the end of the step
    pub t: f64,
    /// State at the end of the step
    pub y: &'a [f64; N],
    /// Derivative at the end of the step
    pub f: &'a [f64; N],
    /// Signed step size
    pub h: f64,
    /// Stage derivatives of the step, one per tableau stage
    pub stages: &'a [[f64; N]],
}

/// Integration statistics for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Total number of function evaluations
    pub fn_evals: u64,
    /// Number of accepted steps
    pub accepted_steps: u64,
    /// Number of rejected steps
    pub rejected_steps: u64,
}

/// Step-size controller using an I-controller
///
/// h_new = safety * h * error^(-1/(q+1))
/// where q is the lower order of the embedded pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepController {
    /// Safety factor (0.8-0.9 typical)
    pub safety: f64,
    /// Maximum growth factor per step
    pub max_factor: f64,
    /// Minimum reduction factor per step
    pub min_factor: f64,
}

impl Default for StepController {
    fn default() -> Self {
        Self {
            safety: 0.9,
            max_factor: 5.0,
            min_factor: 0.1,
        }
    }
}

impl StepController {
    /// Compute the step size adjustment factor for a normalized `error`
    pub fn compute_factor(&self, error: f64, exponent: f64) -> f64 {
        if error == 0.0 {
            return self.max_factor;
        }
        if !error.is_finite() {
            return self.min_factor;
        }

        let factor = self.safety * error.powf(-exponent);
        factor.clamp(self.min_factor, self.max_factor)
    }

    fn validate(&self) -> Result<(), PropagationError> {
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(PropagationError::invalid(format!(
                "controller safety must lie in (0, 1], got {}",
                self.safety
            )));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            return Err(PropagationError::invalid(format!(
                "controller min_factor must lie in (0, 1), got {}",
                self.min_factor
            )));
        }
        if !(self.max_factor > 1.0 && self.max_factor.is_finite()) {
            return Err(PropagationError::invalid(format!(
                "controller max_factor must be finite and > 1, got {}",
                self.max_factor
            )));
        }
        Ok(())
    }
}

/// Tolerance specification for error control
///
/// Component `i` of a step passes when
/// `|err_i| <= atol_i + rtol_i * max(|y_i|, |y_new_i|)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TolerancesRepr", try_from = "TolerancesRepr")]
pub struct Tolerances<const N: usize> {
    /// Absolute tolerance per component
    pub atol: [f64; N],
    /// Relative tolerance per component
    pub rtol: [f64; N],
}

impl<const N: usize> Tolerances<N> {
    /// Create tolerances with uniform values
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self {
            atol: [atol; N],
            rtol: [rtol; N],
        }
    }

    /// Create tolerances with per-component values
    pub fn with_components(atol: [f64; N], rtol: [f64; N]) -> Self {
        Self { atol, rtol }
    }

    /// Both tolerances must be positive and finite on every component
    pub fn validate(&self) -> Result<(), PropagationError> {
        for (i, (&a, &r)) in self.atol.iter().zip(self.rtol.iter()).enumerate() {
            if !(a.is_finite() && a > 0.0) {
                return Err(PropagationError::invalid(format!(
                    "atol[{}] must be positive and finite, got {}",
                    i, a
                )));
            }
            if !(r.is_finite() && r > 0.0) {
                return Err(PropagationError::invalid(format!(
                    "rtol[{}] must be positive and finite, got {}",
                    i, r
                )));
            }
        }
        Ok(())
    }

    #[inline]
    fn scale(&self, i: usize, y: f64, y_new: f64) -> f64 {
        self.atol[i] + self.rtol[i] * y.abs().max(y_new.abs())
    }
}

/// Serialized form of a tolerance: one value for every component, or one per component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ToleranceValue {
    Uniform(f64),
    Components(Vec<f64>),
}

impl ToleranceValue {
    fn expand<const N: usize>(self, name: &str) -> Result<[f64; N], String> {
        match self {
            ToleranceValue::Uniform(v) => Ok([v; N]),
            ToleranceValue::Components(v) => <[f64; N]>::try_from(v.as_slice())
                .map_err(|_| format!("{} needs {} components, got {}", name, N, v.len())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TolerancesRepr {
    atol: ToleranceValue,
    rtol: ToleranceValue,
}

impl<const N: usize> From<Tolerances<N>> for TolerancesRepr {
    fn from(tol: Tolerances<N>) -> Self {
        Self {
            atol: ToleranceValue::Components(tol.atol.to_vec()),
            rtol: ToleranceValue::Components(tol.rtol.to_vec()),
        }
    }
}

impl<const N: usize> TryFrom<TolerancesRepr> for Tolerances<N> {
    type Error = String;

    fn try_from(repr: TolerancesRepr) -> Result<Self, Self::Error> {
        Ok(Self {
            atol: repr.atol.expand("atol")?,
            rtol: repr.rtol.expand("rtol")?,
        })
    }
}

/// Integrator knobs beyond the tolerances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Signed initial step. `None` selects one from the local derivatives.
    pub h0: Option<f64>,
    /// Minimum step magnitude; a rejected step proposing less fails the
    /// propagation. A floor of 16 ulp of the current time always applies,
    /// and trial steps below it (including `h0`) are raised to it.
    pub h_min: f64,
    /// Maximum step magnitude. `None` means only the time span bounds it.
    /// The final step is stretched by up to 1% to land on `tf` only when
    /// the stretched step still respects this bound.
    pub h_max: Option<f64>,
    /// Maximum number of trial steps before error
    pub max_steps: u64,
    /// Step-size controller
    pub controller: StepController,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            h0: None,
            h_min: 0.0,
            h_max: None,
            max_steps: 10_000_000,
            controller: StepController::default(),
        }
    }
}

impl Settings {
    /// Validate the settings for a propagation from `t0` to `tf`
    pub fn validate(&self, t0: f64, tf: f64) -> Result<(), PropagationError> {
        if let Some(h0) = self.h0 {
            if !h0.is_finite() || h0 == 0.0 {
                return Err(PropagationError::invalid(format!(
                    "h0 must be finite and non-zero, got {}",
                    h0
                )));
            }
            let direction = tf - t0;
            if direction != 0.0 && h0.signum() != direction.signum() {
                return Err(PropagationError::invalid(
                    "h0 sign must match integration direction (tf - t0)",
                ));
            }
        }
        if !(self.h_min.is_finite() && self.h_min >= 0.0) {
            return Err(PropagationError::invalid(format!(
                "h_min must be finite and non-negative, got {}",
                self.h_min
            )));
        }
        if let Some(h_max) = self.h_max {
            if !(h_max > 0.0) || h_max < self.h_min {
                return Err(PropagationError::invalid(format!(
                    "h_max must be positive and at least h_min, got {}",
                    h_max
                )));
            }
        }
        if self.max_steps == 0 {
            return Err(PropagationError::invalid("max_steps must be positive"));
        }
        self.controller.validate()
    }
}

/// Adaptive embedded Runge-Kutta integrator
///
/// # Type Parameters
/// * `N` - Dimension of the state vector
///
/// # Example
/// ```ignore
/// use cr3bp::coefficients::rkf78;
/// use cr3bp::{Cr3bp, EmbeddedRk, Tolerances};
///
/// let sys = Cr3bp::earth_moon();
/// let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-12, 1e-12));
///
/// let y0 = [0.8, 0.0, 0.0, 0.0, 0.3, 0.0];
/// let (tf, yf) = solver.integrate(&sys, 0.0, &y0, 2.0)?;
/// ```
#[derive(Clone)]
pub struct EmbeddedRk<const N: usize> {
    /// Butcher tableau of the pair
    tableau: &'static Tableau,
    /// Tolerance specification
    tol: Tolerances<N>,
    /// Step limits, initial step and controller
    settings: Settings,
    /// Stage evaluations (pre-allocated workspace)
    k: [[f64; N]; MAX_STAGES],
    /// Integration statistics
    pub stats: Stats,
}

impl<const N: usize> EmbeddedRk<N> {
    /// Create a new solver for `tableau` with specified tolerances
    pub fn new(tableau: &'static Tableau, tol: Tolerances<N>) -> Self {
        Self {
            tableau,
            tol,
            settings: Settings::default(),
            k: [[0.0; N]; MAX_STAGES],
            stats: Stats::default(),
        }
    }

    /// Replace the integrator settings
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// The embedded pair in use
    pub fn tableau(&self) -> &'static Tableau {
        self.tableau
    }

    /// The current settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access to the settings
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Perform a single trial step of size `h` from `(t, y)`.
    ///
    /// `f0` must be the derivative at `(t, y)`; it is used as the first
    /// stage. This computes the remaining stages, forms the higher-order
    /// solution, estimates the error, and determines if the step should be
    /// accepted.
    pub fn step<S: OdeSystem<N>>(
        &mut self,
        sys: &S,
        t: f64,
        y: &[f64; N],
        f0: &[f64; N],
        h: f64,
    ) -> Result<StepResult<N>, PropagationError> {
        self.compute_stages(sys, t, y, f0, h)?;

        let y_new = self.compute_solution(y, h);
        let error = self.compute_error(y, &y_new, h);
        let accepted = error <= 1.0;

        let factor = self
            .settings
            .controller
            .compute_factor(error, self.tableau.error_exponent());
        let h_next = h.abs() * factor;

        if accepted {
            self.stats.accepted_steps += 1;
        } else {
            self.stats.rejected_steps += 1;
        }

        Ok(StepResult {
            y: y_new,
            t: t + h,
            error,
            h_next,
            accepted,
        })
    }

    /// Integrate from t0 to tf
    ///
    /// # Returns
    /// * `Ok((t_final, y_final))` on success, with `t_final == tf`
    /// * `Err(PropagationError)` on failure
    pub fn integrate<S: OdeSystem<N>>(
        &mut self,
        sys: &S,
        t0: f64,
        y0: &[f64; N],
        tf: f64,
    ) -> Result<(f64, [f64; N]), PropagationError> {
        self.integrate_with(sys, t0, y0, tf, |_| {})
    }

    /// Integrate from t0 to tf, calling `on_step` after every accepted step.
    ///
    /// The final accepted step lands exactly on `tf`. Backward integration
    /// (`tf < t0`) is supported.
    pub fn integrate_with<S, F>(
        &mut self,
        sys: &S,
        t0: f64,
        y0: &[f64; N],
        tf: f64,
        mut on_step: F,
    ) -> Result<(f64, [f64; N]), PropagationError>
    where
        S: OdeSystem<N>,
        F: FnMut(&AcceptedStep<'_, N>),
    {
        self.validate_inputs(t0, y0, tf)?;

        let mut t = t0;
        let mut y = *y0;
        let mut f = [0.0; N];
        self.eval(sys, t, &y, &mut f)?;

        if t0 == tf {
            return Ok((t0, *y0));
        }

        let direction = (tf - t0).signum();
        let h_max = self
            .settings
            .h_max
            .unwrap_or(f64::INFINITY)
            .min((tf - t0).abs());
        let mut h = match self.settings.h0 {
            Some(h0) => h0.abs(),
            None => self.initial_step(sys, t, &y, &f, direction, h_max)?,
        }
        .min(h_max);

        let stages = self.tableau.stages();
        let mut step_count = 0u64;
        let mut reject = false;

        loop {
            step_count += 1;
            if step_count > self.settings.max_steps {
                return Err(PropagationError::MaxStepsExceeded {
                    t,
                    state: y.to_vec(),
                    max_steps: self.settings.max_steps,
                });
            }

            // A step below the round-off floor would not advance t
            h = h.max(self.min_step(t));

            // Shrink the final step to land exactly on tf, or stretch it by
            // up to 1% when that stays within h_max
            let remaining = (tf - t) * direction;
            let last = remaining <= h || (remaining <= 1.01 * h && remaining <= h_max);
            let h_signed = if last { tf - t } else { direction * h };

            let result = self.step(sys, t, &y, &f, h_signed)?;

            if !result.accepted {
                trace!(
                    "rejected step at t = {}: h = {:e}, error = {:.3}",
                    t,
                    h_signed,
                    result.error
                );
                reject = true;
                if result.h_next < self.min_step(t) {
                    return Err(PropagationError::StepSizeUnderflow {
                        t,
                        h: direction * result.h_next,
                        state: y.to_vec(),
                    });
                }
                h = result.h_next;
                continue;
            }

            let t_new = if last { tf } else { result.t };
            if !result.y.iter().all(|v| v.is_finite()) {
                return Err(PropagationError::NonFiniteState {
                    t: t_new,
                    state: result.y.to_vec(),
                });
            }

            let f_new = if self.tableau.fsal {
                self.k[stages - 1]
            } else {
                let mut f_new = [0.0; N];
                self.eval(sys, t_new, &result.y, &mut f_new)?;
                f_new
            };

            on_step(&AcceptedStep {
                t_prev: t,
                y_prev: &y,
                f_prev: &f,
                t: t_new,
                y: &result.y,
                f: &f_new,
                h: h_signed,
                stages: &self.k[..stages],
            });

            t = t_new;
            y = result.y;
            f = f_new;

            if last {
                break;
            }

            // No growth right after a rejection
            let mut h_next = result.h_next;
            if reject {
                h_next = h_next.min(h_signed.abs());
                reject = false;
            }
            h = h_next.min(h_max);
        }

        Ok((t, y))
    }

    /// Starting step estimate from the local derivatives.
    ///
    /// Hairer, Nørsett & Wanner, Section II.4: balance an explicit Euler
    /// probe against the order of the method. Returns a magnitude.
    pub fn initial_step<S: OdeSystem<N>>(
        &mut self,
        sys: &S,
        t: f64,
        y: &[f64; N],
        f0: &[f64; N],
        direction: f64,
        h_max: f64,
    ) -> Result<f64, PropagationError> {
        let mut dnf = 0.0;
        let mut dny = 0.0;
        for i in 0..N {
            let sk = self.tol.scale(i, y[i], y[i]);
            dnf += (f0[i] / sk).powi(2);
            dny += (y[i] / sk).powi(2);
        }

        let mut h = if dnf <= 1e-10 || dny <= 1e-10 {
            1.0e-6
        } else {
            (dny / dnf).sqrt() * 0.01
        };
        h = h.min(h_max);

        // Explicit Euler probe
        let mut y1 = [0.0; N];
        for i in 0..N {
            y1[i] = y[i] + direction * h * f0[i];
        }
        let mut f1 = [0.0; N];
        self.eval(sys, t + direction * h, &y1, &mut f1)?;

        // Estimate of the second derivative
        let mut der2 = 0.0;
        for i in 0..N {
            let sk = self.tol.scale(i, y[i], y[i]);
            der2 += ((f1[i] - f0[i]) / sk).powi(2);
        }
        let der2 = der2.sqrt() / h;

        let der12 = der2.max(dnf.sqrt());
        let h1 = if der12 <= 1.0e-15 {
            (1.0e-6_f64).max(h * 1.0e-3)
        } else {
            (0.01 / der12).powf(1.0 / f64::from(self.tableau.order))
        };

        Ok((100.0 * h).min(h1).min(h_max))
    }

    /// Reset statistics
    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Smallest admissible step magnitude at time `t`
    fn min_step(&self, t: f64) -> f64 {
        self.settings
            .h_min
            .max(16.0 * f64::EPSILON * t.abs().max(1.0))
    }

    /// Evaluate the right-hand side, lifting a singularity into a located error
    fn eval<S: OdeSystem<N>>(
        &mut self,
        sys: &S,
        t: f64,
        y: &[f64; N],
        dydt: &mut [f64; N],
    ) -> Result<(), PropagationError> {
        self.stats.fn_evals += 1;
        sys.rhs(t, y, dydt).map_err(|err| match err {
            DynamicsError::Singular(body) => PropagationError::Singularity {
                body,
                t,
                state: y.to_vec(),
            },
        })
    }

    /// Compute all stages; stage 0 is the supplied derivative
    #[allow(clippy::needless_range_loop)]
    fn compute_stages<S: OdeSystem<N>>(
        &mut self,
        sys: &S,
        t: f64,
        y: &[f64; N],
        f0: &[f64; N],
        h: f64,
    ) -> Result<(), PropagationError> {
        let tab = self.tableau;
        let mut y_temp = [0.0; N];
        let mut k_i = [0.0; N];

        self.k[0] = *f0;

        for i in 1..tab.stages() {
            // y_temp = y + h * sum_{j=0}^{i-1} a[i][j] * k[j]
            let row = tab.a[i];
            for n in 0..N {
                let mut sum = 0.0;
                for (j, &a) in row.iter().enumerate() {
                    sum += a * self.k[j][n];
                }
                y_temp[n] = y[n] + h * sum;
            }

            // k[i] = f(t + c[i]*h, y_temp)
            self.eval(sys, t + tab.c[i] * h, &y_temp, &mut k_i)?;
            self.k[i] = k_i;
        }
        Ok(())
    }

    /// Compute the propagated (higher-order) solution from the stages
    #[allow(clippy::needless_range_loop)]
    fn compute_solution(&self, y: &[f64; N], h: f64) -> [f64; N] {
        let tab = self.tableau;
        let mut y_new = [0.0; N];

        for n in 0..N {
            let mut sum = 0.0;
            for (i, &b) in tab.b.iter().enumerate() {
                sum += b * self.k[i][n];
            }
            y_new[n] = y[n] + h * sum;
        }

        y_new
    }

    /// Compute the normalized error estimate
    ///
    /// Uses the infinity norm of the scaled error:
    /// error = max_i( |h * sum_j b_err[j] * k[j][i]| / scale[i] )
    /// where scale[i] = atol[i] + rtol[i] * max(|y[i]|, |y_new[i]|)
    #[allow(clippy::needless_range_loop)]
    fn compute_error(&self, y: &[f64; N], y_new: &[f64; N], h: f64) -> f64 {
        let tab = self.tableau;
        let mut max_err: f64 = 0.0;

        for n in 0..N {
            let mut err_n = 0.0;
            for (i, &e) in tab.b_err.iter().enumerate() {
                err_n += e * self.k[i][n];
            }
            err_n *= h;

            let scaled_err = err_n.abs() / self.tol.scale(n, y[n], y_new[n]);
            if scaled_err.is_nan() {
                return f64::INFINITY;
            }
            max_err = max_err.max(scaled_err);
        }

        max_err
    }

    /// Validate integration inputs
    fn validate_inputs(&self, t0: f64, y0: &[f64; N], tf: f64) -> Result<(), PropagationError> {
        if !t0.is_finite() || !tf.is_finite() {
            return Err(PropagationError::invalid("t0 and tf must be finite"));
        }
        for (i, &val) in y0.iter().enumerate() {
            if !val.is_finite() {
                return Err(PropagationError::invalid(format!(
                    "y0[{}] is not finite",
                    i
                )));
            }
        }
        self.tol.validate()?;
        self.settings.validate(t0, tf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::{dopri5, rkf78};
    use crate::dynamics::Body;

    /// Harmonic oscillator: y'' + ω²y = 0
    /// State: [y, y']
    struct HarmonicOscillator {
        omega: f64,
    }

    impl OdeSystem<2> for HarmonicOscillator {
        fn rhs(&self, _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), DynamicsError> {
            dydt[0] = y[1];
            dydt[1] = -self.omega * self.omega * y[0];
            Ok(())
        }
    }

    fn rkf78_solver(atol: f64, rtol: f64) -> EmbeddedRk<2> {
        EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(atol, rtol))
    }

    fn with_h0<const N: usize>(solver: EmbeddedRk<N>, h0: f64) -> EmbeddedRk<N> {
        solver.with_settings(Settings {
            h0: Some(h0),
            ..Settings::default()
        })
    }

    #[test]
    fn test_harmonic_oscillator() {
        let sys = HarmonicOscillator { omega: 1.0 };

        // Exact solution: y = cos(t), y' = -sin(t)
        let y0 = [1.0, 0.0];
        let tf = 2.0 * std::f64::consts::PI;

        for tab in [&rkf78::TABLEAU, &dopri5::TABLEAU] {
            let mut solver = EmbeddedRk::new(tab, Tolerances::new(1e-12, 1e-12));
            let (t_final, y_final) = solver.integrate(&sys, 0.0, &y0, tf).unwrap();

            assert_eq!(t_final, tf, "{} must land exactly on tf", tab.name);
            assert!(
                (y_final[0] - 1.0).abs() < 1e-9,
                "{}: y(2π) = {}, expected 1.0",
                tab.name,
                y_final[0]
            );
            assert!(
                y_final[1].abs() < 1e-9,
                "{}: y'(2π) = {}, expected 0.0",
                tab.name,
                y_final[1]
            );
            println!("{} stats: {:?}", tab.name, solver.stats);
        }
    }

    #[test]
    fn test_exponential_decay() {
        // y' = -y, y(0) = 1
        struct ExpDecay;

        impl OdeSystem<1> for ExpDecay {
            fn rhs(&self, _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DynamicsError> {
                dydt[0] = -y[0];
                Ok(())
            }
        }

        let tf = 5.0;
        let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-14, 1e-14));

        let (_, y_final) = solver.integrate(&ExpDecay, 0.0, &[1.0], tf).unwrap();
        let exact = (-tf).exp();

        let rel_error = (y_final[0] - exact).abs() / exact;
        assert!(rel_error < 1e-11, "Relative error {} too large", rel_error);
    }

    /// y' = f(t), y(0) = 0: a single step is a quadrature rule
    struct Quadrature(fn(f64) -> f64);

    impl OdeSystem<1> for Quadrature {
        fn rhs(&self, t: f64, _y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DynamicsError> {
            dydt[0] = (self.0)(t);
            Ok(())
        }
    }

    fn single_step_errors(
        tab: &'static Tableau,
        f: fn(f64) -> f64,
        exact: fn(f64) -> f64,
        step_sizes: &[f64],
    ) -> Vec<f64> {
        step_sizes
            .iter()
            .map(|&h| {
                // Very loose tolerances so the step is always accepted
                let mut solver = EmbeddedRk::new(tab, Tolerances::new(1.0, 1.0));
                let result = solver
                    .step(&Quadrature(f), 0.0, &[0.0], &[f(0.0)], h)
                    .unwrap();
                assert!(result.accepted, "Step with h={} should be accepted", h);
                (result.y[0] - exact(h)).abs()
            })
            .collect()
    }

    fn check_ratios(errors: &[f64], lo: f64, hi: f64) {
        let mut checked = 0;
        for pair in errors.windows(2) {
            // Skip pairs where the smaller error is at machine epsilon
            if pair[1] < 1e-15 {
                continue;
            }
            let ratio = pair[0] / pair[1];
            assert!(
                ratio > lo && ratio < hi,
                "Error ratio {:.1} outside [{}, {}]",
                ratio,
                lo,
                hi
            );
            checked += 1;
        }
        assert!(checked >= 2, "Need at least 2 valid error ratios, got {}", checked);
    }

    #[test]
    fn test_order_of_convergence_rkf78() {
        // Local truncation error O(h^9): halving h divides the error by ~512
        let steps = [1.6, 0.8, 0.4, 0.2];
        let errors = single_step_errors(&rkf78::TABLEAU, f64::cos, f64::sin, &steps);
        check_ratios(&errors, 100.0, 800.0);
    }

    #[test]
    fn test_order_of_convergence_dopri5() {
        // Local truncation error O(h^6): halving h divides the error by ~64.
        // exp keeps the t^5 Taylor term that cos lacks.
        let steps = [0.8, 0.4, 0.2, 0.1];
        let errors = single_step_errors(&dopri5::TABLEAU, f64::exp, f64::exp_m1, &steps);
        check_ratios(&errors, 30.0, 100.0);
    }

    /// Two-body problem for testing energy conservation
    struct TwoBody {
        mu: f64,
    }

    impl OdeSystem<6> for TwoBody {
        fn rhs(&self, _t: f64, y: &[f64; 6], dydt: &mut [f64; 6]) -> Result<(), DynamicsError> {
            let r = (y[0] * y[0] + y[1] * y[1] + y[2] * y[2]).sqrt();
            let mu_r3 = self.mu / (r * r * r);

            dydt[0] = y[3];
            dydt[1] = y[4];
            dydt[2] = y[5];
            dydt[3] = -mu_r3 * y[0];
            dydt[4] = -mu_r3 * y[1];
            dydt[5] = -mu_r3 * y[2];
            Ok(())
        }
    }

    #[test]
    fn test_eccentric_orbit_energy_conservation() {
        let mu = 398600.4418;
        let sys = TwoBody { mu };

        // Eccentric orbit: e=0.7, periapsis at 6678 km
        let rp = 6678.0;
        let e = 0.7;
        let a = rp / (1.0 - e);
        let v_peri = (mu * (2.0 / rp - 1.0 / a)).sqrt();
        let y0 = [rp, 0.0, 0.0, 0.0, v_peri, 0.0];
        let period = 2.0 * std::f64::consts::PI * (a.powi(3) / mu).sqrt();

        let energy = |y: &[f64; 6]| {
            let r = (y[0] * y[0] + y[1] * y[1] + y[2] * y[2]).sqrt();
            let v2 = y[3] * y[3] + y[4] * y[4] + y[5] * y[5];
            0.5 * v2 - mu / r
        };

        let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-12, 1e-12));
        let (_, y_final) = solver.integrate(&sys, 0.0, &y0, period).unwrap();

        let rel_energy_error = (energy(&y_final) - energy(&y0)).abs() / energy(&y0).abs();
        assert!(
            rel_energy_error < 1e-9,
            "Eccentric orbit (e=0.7) energy drift {} exceeds 1e-9",
            rel_energy_error
        );
    }

    // ==================== Input Validation ====================

    #[test]
    fn test_nan_tolerance_rejected() {
        let mut solver = rkf78_solver(f64::NAN, 1e-12);
        let sys = HarmonicOscillator { omega: 1.0 };
        let result = solver.integrate(&sys, 0.0, &[1.0, 0.0], 1.0);
        assert!(matches!(result, Err(PropagationError::InvalidArgument { .. })));
    }

    #[test]
    fn test_non_positive_tolerances_rejected() {
        let sys = HarmonicOscillator { omega: 1.0 };
        for (atol, rtol) in [(-1e-12, 1e-12), (0.0, 1e-12), (1e-12, 0.0), (1e-12, -1.0)] {
            let mut solver = rkf78_solver(atol, rtol);
            let result = solver.integrate(&sys, 0.0, &[1.0, 0.0], 1.0);
            assert!(
                matches!(result, Err(PropagationError::InvalidArgument { .. })),
                "atol={}, rtol={} should be rejected",
                atol,
                rtol
            );
        }
    }

    #[test]
    fn test_h0_wrong_sign_rejected() {
        let mut solver = with_h0(rkf78_solver(1e-12, 1e-12), -0.1);
        let sys = HarmonicOscillator { omega: 1.0 };
        let result = solver.integrate(&sys, 0.0, &[1.0, 0.0], 1.0);
        assert!(matches!(result, Err(PropagationError::InvalidArgument { .. })));
    }

    #[test]
    fn test_nan_initial_state_rejected() {
        let mut solver = rkf78_solver(1e-12, 1e-12);
        let sys = HarmonicOscillator { omega: 1.0 };
        let result = solver.integrate(&sys, 0.0, &[f64::NAN, 0.0], 1.0);
        assert!(matches!(result, Err(PropagationError::InvalidArgument { .. })));
    }

    #[test]
    fn test_bad_settings_rejected() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let bad = [
            Settings {
                max_steps: 0,
                ..Settings::default()
            },
            Settings {
                h_max: Some(0.0),
                ..Settings::default()
            },
            Settings {
                h_min: -1.0,
                ..Settings::default()
            },
            Settings {
                controller: StepController {
                    max_factor: 0.5,
                    ..StepController::default()
                },
                ..Settings::default()
            },
        ];
        for settings in bad {
            let mut solver = rkf78_solver(1e-12, 1e-12).with_settings(settings.clone());
            let result = solver.integrate(&sys, 0.0, &[1.0, 0.0], 1.0);
            assert!(
                matches!(result, Err(PropagationError::InvalidArgument { .. })),
                "{:?} should be rejected",
                settings
            );
        }
    }

    #[test]
    fn test_zero_length_integration() {
        let mut solver = rkf78_solver(1e-12, 1e-12);
        let sys = HarmonicOscillator { omega: 1.0 };
        let (t, y) = solver.integrate(&sys, 5.0, &[42.0, 1.0], 5.0).unwrap();
        assert_eq!(t, 5.0);
        assert_eq!(y, [42.0, 1.0]);
    }

    // ==================== Step Control ====================

    #[test]
    fn test_backward_integration() {
        // Harmonic oscillator integrated backward from 2π to 0
        let sys = HarmonicOscillator { omega: 1.0 };
        let tf = 2.0 * std::f64::consts::PI;

        let mut solver = rkf78_solver(1e-12, 1e-12);
        let mut times = Vec::new();
        let (t_final, y_final) = solver
            .integrate_with(&sys, tf, &[1.0, 0.0], 0.0, |step| {
                assert!(step.h < 0.0, "backward step must be negative");
                times.push(step.t);
            })
            .unwrap();

        assert_eq!(t_final, 0.0);
        assert!(times.windows(2).all(|w| w[1] < w[0]), "times must decrease");
        assert!((y_final[0] - 1.0).abs() < 1e-10, "y(0) = {}", y_final[0]);
        assert!(y_final[1].abs() < 1e-10, "y'(0) = {}", y_final[1]);
    }

    #[test]
    fn test_singularity_located() {
        // Stage evaluation hitting the singular point reports time and state
        struct Wall;
        impl OdeSystem<1> for Wall {
            fn rhs(&self, _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DynamicsError> {
                if y[0] >= 1.0 {
                    return Err(DynamicsError::Singular(Body::Secondary));
                }
                dydt[0] = 1.0;
                Ok(())
            }
        }

        let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-10, 1e-10));
        let result = solver.integrate(&Wall, 0.0, &[0.0], 5.0);
        match result {
            Err(PropagationError::Singularity { body, t, state }) => {
                assert_eq!(body, Body::Secondary);
                assert!(state[0] >= 1.0, "state {:?}", state);
                assert!(t > 0.0 && t <= 5.0, "t = {}", t);
            }
            other => panic!("Expected Singularity, got {:?}", other),
        }
    }

    #[test]
    fn test_step_size_too_small_error() {
        // System with a singularity: y' = -1/y^2, blows up as y->0
        struct SingularODE;
        impl OdeSystem<1> for SingularODE {
            fn rhs(&self, _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DynamicsError> {
                dydt[0] = -1.0 / (y[0] * y[0] + 1e-30);
                Ok(())
            }
        }

        let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-12, 1e-12))
            .with_settings(Settings {
                h0: Some(1e-4),
                h_min: 1e-4,
                ..Settings::default()
            });

        let result = solver.integrate(&SingularODE, 0.0, &[0.001], 1.0);
        assert!(
            matches!(result, Err(PropagationError::StepSizeUnderflow { .. })),
            "Expected StepSizeUnderflow, got {:?}",
            result
        );
    }

    #[test]
    fn test_blow_up_underflows_near_singular_time() {
        // y' = y², y(0) = 1 has the solution 1/(1 - t), which escapes at t = 1
        struct Riccati;
        impl OdeSystem<1> for Riccati {
            fn rhs(&self, _t: f64, y: &[f64; 1], dydt: &mut [f64; 1]) -> Result<(), DynamicsError> {
                dydt[0] = y[0] * y[0];
                Ok(())
            }
        }

        let mut solver = EmbeddedRk::new(&rkf78::TABLEAU, Tolerances::new(1e-10, 1e-10));
        match solver.integrate(&Riccati, 0.0, &[1.0], 2.0) {
            Err(PropagationError::StepSizeUnderflow { t, h, state }) => {
                assert!((t - 1.0).abs() < 1e-6, "underflow at t = {}", t);
                assert!(h > 0.0 && h < 1e-13, "h = {:e}", h);
                assert!(state[0] > 1e6, "state {:?}", state);
            }
            other => panic!("Expected StepSizeUnderflow, got {:?}", other),
        }
    }

    #[test]
    fn test_max_steps_exceeded() {
        let mut solver = rkf78_solver(1e-12, 1e-12).with_settings(Settings {
            h0: Some(0.01),
            max_steps: 5,
            ..Settings::default()
        });

        let sys = HarmonicOscillator { omega: 1.0 };
        let result = solver.integrate(&sys, 0.0, &[1.0, 0.0], 100.0);
        assert!(
            matches!(result, Err(PropagationError::MaxStepsExceeded { max_steps: 5, .. })),
            "Expected MaxStepsExceeded, got {:?}",
            result
        );
    }

    #[test]
    fn test_step_rejection_with_large_h0() {
        // h0 = 100 is absurdly large; the solver rejects and recovers
        let sys = HarmonicOscillator { omega: 1.0 };
        let tf = 2.0 * std::f64::consts::PI;

        let mut solver = with_h0(rkf78_solver(1e-12, 1e-12), 100.0);
        let (t_final, y_final) = solver.integrate(&sys, 0.0, &[1.0, 0.0], tf).unwrap();

        assert_eq!(t_final, tf);
        assert!(solver.stats.rejected_steps > 0, "expected rejections");
        assert!((y_final[0] - 1.0).abs() < 1e-9, "y(2π) = {}", y_final[0]);
    }

    #[test]
    fn test_accepted_steps_respect_growth_bound() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let mut solver = with_h0(rkf78_solver(1e-10, 1e-10), 1e-6);
        let mut sizes = Vec::new();
        solver
            .integrate_with(&sys, 0.0, &[1.0, 0.0], 10.0, |step| sizes.push(step.h.abs()))
            .unwrap();

        // The final step may be stretched by 1% to land on tf
        for w in sizes.windows(2) {
            assert!(
                w[1] <= 5.05 * w[0],
                "step grew from {:e} to {:e}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_tiny_h0_raised_to_round_off_floor() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let mut solver = with_h0(rkf78_solver(1e-12, 1e-10), 1e-30);
        let mut times = vec![1.0];
        let (t_final, _) = solver
            .integrate_with(&sys, 1.0, &[1.0, 0.0], 2.0, |step| times.push(step.t))
            .unwrap();

        assert_eq!(t_final, 2.0);
        for w in times.windows(2) {
            assert!(w[1] > w[0], "time did not advance: {} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_final_stretch_respects_h_max() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let mut solver = rkf78_solver(1e-6, 1e-6).with_settings(Settings {
            h0: Some(0.1),
            h_max: Some(0.1),
            ..Settings::default()
        });
        let mut sizes = Vec::new();
        let (t_final, _) = solver
            .integrate_with(&sys, 0.0, &[1.0, 0.0], 0.1005, |step| sizes.push(step.h))
            .unwrap();

        // 0.1005 is within the 1% stretch of h = 0.1 but above h_max
        assert_eq!(t_final, 0.1005);
        assert_eq!(sizes.len(), 2, "steps: {:?}", sizes);
        assert!(sizes.iter().all(|&h| h <= 0.1), "steps: {:?}", sizes);
    }

    #[test]
    fn test_fsal_reuses_last_stage() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let mut solver = EmbeddedRk::new(&dopri5::TABLEAU, Tolerances::new(1e-10, 1e-10))
            .with_settings(Settings {
                h0: Some(0.1),
                ..Settings::default()
            });
        solver
            .integrate_with(&sys, 0.0, &[1.0, 0.0], 1.0, |step| {
                let mut f = [0.0; 2];
                sys.rhs(step.t, step.y, &mut f).unwrap();
                assert_eq!(&f, step.f);
            })
            .unwrap();

        let stats = &solver.stats;
        let trials = stats.accepted_steps + stats.rejected_steps;
        // One initial evaluation plus six new stages per trial
        assert_eq!(stats.fn_evals, 1 + 6 * trials);
    }

    #[test]
    fn test_forward_backward_round_trip() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let y0 = [1.0, 0.0];
        let period = 2.0 * std::f64::consts::PI;

        let mut solver = rkf78_solver(1e-12, 1e-12);
        let (t_mid, y_mid) = solver.integrate(&sys, 0.0, &y0, period).unwrap();

        let mut solver2 = rkf78_solver(1e-12, 1e-12);
        let (t_final, y_final) = solver2.integrate(&sys, t_mid, &y_mid, 0.0).unwrap();

        assert_eq!(t_final, 0.0);
        assert!((y_final[0] - y0[0]).abs() < 1e-10, "y[0] = {}", y_final[0]);
        assert!((y_final[1] - y0[1]).abs() < 1e-10, "y[1] = {}", y_final[1]);
    }

    #[test]
    fn test_per_component_tolerance() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let y0 = [1.0, 0.0];
        let tf = 10.0 * std::f64::consts::PI;

        let mut solver_loose = rkf78_solver(1e-6, 1e-6);
        solver_loose.integrate(&sys, 0.0, &y0, tf).unwrap();

        let tol_mixed = Tolerances::with_components([1e-13, 1e-6], [1e-13, 1e-6]);
        let mut solver_mixed = EmbeddedRk::new(&rkf78::TABLEAU, tol_mixed);
        solver_mixed.integrate(&sys, 0.0, &y0, tf).unwrap();

        assert!(
            solver_mixed.stats.accepted_steps > solver_loose.stats.accepted_steps,
            "tight component should drive more steps ({} vs {})",
            solver_mixed.stats.accepted_steps,
            solver_loose.stats.accepted_steps
        );
    }

    // ==================== Step Controller Boundary Tests ====================

    const EXP: f64 = 1.0 / 8.0;

    #[test]
    fn test_step_controller_zero_error() {
        let ctrl = StepController::default();
        assert_eq!(ctrl.compute_factor(0.0, EXP), ctrl.max_factor);
    }

    #[test]
    fn test_step_controller_unit_error() {
        let ctrl = StepController::default();
        let factor = ctrl.compute_factor(1.0, EXP);
        assert!((factor - ctrl.safety).abs() < 1e-15, "got {}", factor);
    }

    #[test]
    fn test_step_controller_tiny_error_clamped() {
        let ctrl = StepController::default();
        assert_eq!(ctrl.compute_factor(1e-20, EXP), 5.0);
    }

    #[test]
    fn test_step_controller_huge_error_clamped() {
        let ctrl = StepController::default();
        assert_eq!(ctrl.compute_factor(1e20, EXP), 0.1);
        assert_eq!(ctrl.compute_factor(f64::INFINITY, EXP), 0.1);
        assert_eq!(ctrl.compute_factor(f64::NAN, EXP), 0.1);
    }

    #[test]
    fn test_tolerance_sensitivity() {
        // Harmonic oscillator over 10 periods: tighter tolerances give smaller errors
        let sys = HarmonicOscillator { omega: 1.0 };
        let y0 = [1.0, 0.0];
        let tf = 10.0 * 2.0 * std::f64::consts::PI;
        let exact = tf.cos();

        for tab in [&rkf78::TABLEAU, &dopri5::TABLEAU] {
            let run = |tol: f64| -> f64 {
                let mut solver = EmbeddedRk::new(tab, Tolerances::new(tol, tol));
                let (_, y_final) = solver.integrate(&sys, 0.0, &y0, tf).unwrap();
                (y_final[0] - exact).abs()
            };

            let err_loose = run(1e-6);
            let err_tight = run(1e-10);
            assert!(
                err_loose > err_tight,
                "{}: loose error {:.3e} should exceed tight {:.3e}",
                tab.name,
                err_loose,
                err_tight
            );
        }
    }

    #[test]
    fn test_initial_step_is_bounded() {
        let sys = HarmonicOscillator { omega: 1.0 };
        let mut solver = rkf78_solver(1e-12, 1e-12);
        let h = solver
            .initial_step(&sys, 0.0, &[1.0, 0.0], &[0.0, -1.0], 1.0, 0.5)
            .unwrap();
        assert!(h > 0.0 && h <= 0.5, "h = {}", h);
    }

    #[test]
    fn test_tolerances_serde_forms() {
        let tol: Tolerances<3> =
            serde_json::from_str(r#"{"atol": 1e-9, "rtol": [1e-6, 1e-7, 1e-8]}"#).unwrap();
        assert_eq!(tol.atol, [1e-9; 3]);
        assert_eq!(tol.rtol, [1e-6, 1e-7, 1e-8]);

        let json = serde_json::to_string(&tol).unwrap();
        let back: Tolerances<3> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tol);

        let short = serde_json::from_str::<Tolerances<3>>(r#"{"atol": [1.0], "rtol": 1.0}"#);
        assert!(short.is_err());
    }
}
