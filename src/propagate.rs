//! Propagation entry point
//!
//! [`propagate`] validates a [`PropagationConfig`] together with the initial
//! state, time span and mass ratio, runs the selected embedded pair over the
//! CR3BP dynamics and returns the resulting [`Trajectory`].
//!
//! Nothing is shared between calls, so independent propagations may run on
//! separate threads; [`propagate_batch`] does exactly that on the rayon pool.

use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::coefficients::{dopri5, rkf78, Tableau};
use crate::dense::{DenseGrid, DenseMethod, DenseSampler};
use crate::dynamics::Cr3bp;
use crate::error::PropagationError;
use crate::solver::{EmbeddedRk, Settings, Stats, Tolerances};

/// Dimension of the CR3BP state vector
pub const STATE_DIM: usize = 6;

/// Supported embedded Runge-Kutta pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegratorOrder {
    /// Dormand-Prince 5(4), 7 stages with FSAL
    Rk45,
    /// Fehlberg 7(8), 13 stages, 8th-order solution propagated
    #[default]
    Rk78,
}

impl IntegratorOrder {
    /// Butcher tableau of the pair
    pub fn tableau(self) -> &'static Tableau {
        match self {
            IntegratorOrder::Rk45 => &dopri5::TABLEAU,
            IntegratorOrder::Rk78 => &rkf78::TABLEAU,
        }
    }

    /// Interpolant used for dense output with this pair
    pub fn dense_method(self) -> DenseMethod {
        match self {
            IntegratorOrder::Rk45 => DenseMethod::Dopri5,
            IntegratorOrder::Rk78 => DenseMethod::Hermite,
        }
    }
}

impl fmt::Display for IntegratorOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegratorOrder::Rk45 => write!(f, "rk45"),
            IntegratorOrder::Rk78 => write!(f, "rk78"),
        }
    }
}

impl TryFrom<u32> for IntegratorOrder {
    type Error = PropagationError;

    /// `45` selects RK45, `78` selects RK78
    fn try_from(selector: u32) -> Result<Self, Self::Error> {
        match selector {
            45 => Ok(IntegratorOrder::Rk45),
            78 => Ok(IntegratorOrder::Rk78),
            other => Err(PropagationError::invalid(format!(
                "unsupported integrator order {} (expected 45 or 78)",
                other
            ))),
        }
    }
}

impl FromStr for IntegratorOrder {
    type Err = PropagationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rk45" | "dopri5" => Ok(IntegratorOrder::Rk45),
            "rk78" | "rkf78" => Ok(IntegratorOrder::Rk78),
            _ => Err(PropagationError::invalid(format!(
                "unsupported integrator order {:?}",
                s
            ))),
        }
    }
}

/// Which samples a propagation returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Every accepted integrator step, at irregular times
    #[default]
    Sparse,
    /// Exactly `samples` evenly spaced points over the span, inclusive.
    ///
    /// RK45 interpolates with its own 4th-order continuous extension and
    /// tracks the tolerance closely. RK78 falls back to cubic Hermite over
    /// its long steps, so interior samples can be several orders of
    /// magnitude less accurate than the accepted steps (around 1e-6 at
    /// `atol = rtol = 1e-12` in the Earth-Moon system). Prefer RK45 when
    /// the resampled states themselves must be accurate.
    Dense {
        /// Number of output points, at least 2
        samples: usize,
    },
}

impl OutputMode {
    /// Integer density selector: `0` is sparse, `n >= 2` is `n` dense samples
    pub fn from_selector(selector: usize) -> Result<Self, PropagationError> {
        match selector {
            0 => Ok(OutputMode::Sparse),
            1 => Err(PropagationError::invalid(
                "dense output needs at least 2 samples, got 1",
            )),
            samples => Ok(OutputMode::Dense { samples }),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Sparse => write!(f, "sparse"),
            OutputMode::Dense { samples } => write!(f, "dense({})", samples),
        }
    }
}

/// Everything a propagation needs besides the initial state, span and μ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Embedded pair
    pub order: IntegratorOrder,
    /// Output density
    pub output: OutputMode,
    /// Local error tolerances
    pub tolerances: Tolerances<STATE_DIM>,
    /// Step limits and controller
    pub settings: Settings,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            order: IntegratorOrder::Rk78,
            output: OutputMode::Sparse,
            tolerances: Tolerances::new(1e-12, 1e-12),
            settings: Settings::default(),
        }
    }
}

impl PropagationConfig {
    /// Select the embedded pair
    pub fn with_order(mut self, order: IntegratorOrder) -> Self {
        self.order = order;
        self
    }

    /// Select the output density
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Uniform absolute and relative tolerances
    pub fn with_tolerances(mut self, atol: f64, rtol: f64) -> Self {
        self.tolerances = Tolerances::new(atol, rtol);
        self
    }

    /// Per-component tolerances
    pub fn with_component_tolerances(mut self, tolerances: Tolerances<STATE_DIM>) -> Self {
        self.tolerances = tolerances;
        self
    }

    /// Signed initial step
    pub fn with_initial_step(mut self, h0: f64) -> Self {
        self.settings.h0 = Some(h0);
        self
    }

    /// Replace the integrator settings
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Check everything that does not depend on the time span
    pub fn validate(&self) -> Result<(), PropagationError> {
        self.tolerances.validate()?;
        if let OutputMode::Dense { samples } = self.output {
            if samples < 2 {
                return Err(PropagationError::invalid(format!(
                    "dense output needs at least 2 samples, got {}",
                    samples
                )));
            }
        }
        // A zero span skips the direction check on h0
        self.settings.validate(0.0, 0.0)
    }
}

/// One time-tagged state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Time
    pub t: f64,
    /// State `[x, y, z, vx, vy, vz]`
    pub state: [f64; STATE_DIM],
}

/// Result of a successful propagation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    samples: Vec<Sample>,
    stats: Stats,
}

impl Trajectory {
    /// Samples in propagation order; the first is the initial state at t0
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Integrator statistics
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether there are no samples; never true for a returned trajectory
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First sample
    pub fn first(&self) -> Option<&Sample> {
        self.samples.first()
    }

    /// Last sample
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Sample times
    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.t)
    }

    /// Iterate over the samples
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Take ownership of the samples
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Propagate `initial_state` over `time_span = (t0, t1)` in the CR3BP with
/// mass ratio `mu`.
///
/// `t1 < t0` propagates backward. In sparse mode the trajectory holds every
/// accepted step; in dense mode it holds exactly the requested number of
/// evenly spaced samples. Either way the first sample is the initial state
/// at `t0` and the last sample is at `t1` exactly.
///
/// # Errors
/// * `InvalidArgument` for a state that is not 6 finite components, `mu`
///   outside (0, 1), non-positive tolerances, an unusable dense request or
///   inconsistent settings. Nothing is integrated in that case.
/// * `Singularity`, `StepSizeUnderflow`, `MaxStepsExceeded` and
///   `NonFiniteState` abort the integration; the partial trajectory is
///   discarded and the error carries the time and state of the failure.
pub fn propagate(
    initial_state: &[f64],
    time_span: (f64, f64),
    mu: f64,
    config: &PropagationConfig,
) -> Result<Trajectory, PropagationError> {
    let y0: [f64; STATE_DIM] = initial_state.try_into().map_err(|_| {
        PropagationError::invalid(format!(
            "state vector must have {} components, got {}",
            STATE_DIM,
            initial_state.len()
        ))
    })?;
    let sys = Cr3bp::new(mu)?;
    config.validate()?;

    let (t0, t1) = time_span;
    let grid = match config.output {
        OutputMode::Sparse => None,
        OutputMode::Dense { samples } => Some(DenseGrid::new(t0, t1, samples)?),
    };

    debug!(
        "propagating {} {} from t = {} to t = {} (mu = {}, atol = {}, rtol = {}, h0 = {:?})",
        config.order,
        config.output,
        t0,
        t1,
        mu,
        tolerance_summary(&config.tolerances.atol),
        tolerance_summary(&config.tolerances.rtol),
        config.settings.h0
    );

    let result = run(&sys, &y0, t0, t1, grid, config);
    match &result {
        Ok(trajectory) => debug!(
            "propagation finished: {} samples, {} accepted / {} rejected steps, {} evaluations",
            trajectory.len(),
            trajectory.stats.accepted_steps,
            trajectory.stats.rejected_steps,
            trajectory.stats.fn_evals
        ),
        Err(e) => warn!("propagation failed: {}", e),
    }
    result
}

/// One value when uniform, the whole array otherwise
fn tolerance_summary(values: &[f64]) -> String {
    match values.split_first() {
        Some((first, rest)) if rest.iter().all(|v| v == first) => format!("{:e}", first),
        _ => format!("{:?}", values),
    }
}

fn run(
    sys: &Cr3bp,
    y0: &[f64; STATE_DIM],
    t0: f64,
    t1: f64,
    grid: Option<DenseGrid>,
    config: &PropagationConfig,
) -> Result<Trajectory, PropagationError> {
    let mut solver = EmbeddedRk::new(config.order.tableau(), config.tolerances.clone())
        .with_settings(config.settings.clone());

    let samples = match grid {
        None => {
            let mut samples = vec![Sample { t: t0, state: *y0 }];
            solver.integrate_with(sys, t0, y0, t1, |step| {
                samples.push(Sample {
                    t: step.t,
                    state: *step.y,
                })
            })?;
            samples
        }
        Some(grid) => {
            let mut sampler = DenseSampler::new(grid, config.order.dense_method(), y0);
            solver.integrate_with(sys, t0, y0, t1, |step| sampler.observe(step))?;
            sampler
                .finish()
                .into_iter()
                .map(|(t, state)| Sample { t, state })
                .collect()
        }
    };

    Ok(Trajectory {
        samples,
        stats: solver.stats,
    })
}

/// One independent propagation request for [`propagate_batch`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Initial state, 6 components
    pub initial_state: Vec<f64>,
    /// `(t0, t1)`
    pub time_span: (f64, f64),
    /// Mass ratio
    pub mu: f64,
}

impl Case {
    /// New case
    pub fn new(initial_state: impl Into<Vec<f64>>, time_span: (f64, f64), mu: f64) -> Self {
        Self {
            initial_state: initial_state.into(),
            time_span,
            mu,
        }
    }
}

/// Propagate independent cases in parallel on the rayon pool.
///
/// Results come back in the order of `cases`; a failing case does not
/// affect the others.
pub fn propagate_batch(
    cases: &[Case],
    config: &PropagationConfig,
) -> Vec<Result<Trajectory, PropagationError>> {
    use rayon::prelude::*;

    cases
        .par_iter()
        .map(|case| propagate(&case.initial_state, case.time_span, case.mu, config))
        .collect()
}
