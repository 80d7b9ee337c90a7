//! Embedded Runge-Kutta Coefficients
//!
//! Butcher tableaux for the two supported embedded pairs:
//!
//! - **Fehlberg 7(8)**: 13 stages, 8th-order propagated solution, 7th-order
//!   embedded solution for error estimation.
//!   Fehlberg, E. (1968). "Classical Fifth-, Sixth-, Seventh-, and
//!   Eighth-Order Runge-Kutta Formulas with Stepsize Control"
//!   NASA TR R-287, Table X, pages 64-65.
//! - **Dormand-Prince 5(4)**: 7 stages (first same as last), 5th-order
//!   propagated solution, 4th-order embedded solution, plus the weights of
//!   its 4th-order continuous extension.
//!   Hairer, E., Nørsett, S.P., & Wanner, G. (1993). "Solving Ordinary
//!   Differential Equations I", Section II.5 and II.6.
//!
//! The matrix `a` is stored as lower-triangular rows: row `i` holds the
//! `i` coefficients `a[i][0..i]`.

/// Largest stage count among the supported pairs (sizes the stage workspace)
pub const MAX_STAGES: usize = 13;

/// An embedded Runge-Kutta pair in Butcher form
#[derive(Debug)]
pub struct Tableau {
    /// Human readable name of the pair
    pub name: &'static str,
    /// Order of the solution used to advance the state
    pub order: u8,
    /// Order of the embedded solution used only for the error estimate
    pub embedded_order: u8,
    /// Nodes c_i
    pub c: &'static [f64],
    /// Lower-triangular Runge-Kutta matrix, one row per stage
    pub a: &'static [&'static [f64]],
    /// Weights of the propagated solution
    pub b: &'static [f64],
    /// Error weights b_i - b_hat_i
    pub b_err: &'static [f64],
    /// Whether the last stage is evaluated at (t + h, y_new), i.e. it equals
    /// the first stage of the next step
    pub fsal: bool,
}

impl Tableau {
    /// Number of stages
    pub fn stages(&self) -> usize {
        self.c.len()
    }

    /// Exponent of the I-controller: 1 / (q + 1) with q the lower order of the pair
    pub fn error_exponent(&self) -> f64 {
        1.0 / (f64::from(self.order.min(self.embedded_order)) + 1.0)
    }
}

/// Runge-Kutta-Fehlberg 7(8)
pub mod rkf78 {
    use super::Tableau;

    /// Number of stages
    pub const STAGES: usize = 13;

    /// Node coefficients (α values of NASA TR R-287, Table X)
    pub const C: [f64; STAGES] = [
        0.0,
        2.0 / 27.0,
        1.0 / 9.0,
        1.0 / 6.0,
        5.0 / 12.0,
        0.5,
        5.0 / 6.0,
        1.0 / 6.0,
        2.0 / 3.0,
        1.0 / 3.0,
        1.0,
        0.0, // error estimation only
        1.0, // error estimation only
    ];

    /// Runge-Kutta matrix (β values of NASA TR R-287, Table X)
    pub const A: &[&[f64]] = &[
        &[],
        &[2.0 / 27.0],
        &[1.0 / 36.0, 1.0 / 12.0],
        &[1.0 / 24.0, 0.0, 1.0 / 8.0],
        &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
        &[1.0 / 20.0, 0.0, 0.0, 1.0 / 4.0, 1.0 / 5.0],
        &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
        &[31.0 / 300.0, 0.0, 0.0, 0.0, 61.0 / 225.0, -2.0 / 9.0, 13.0 / 900.0],
        &[2.0, 0.0, 0.0, -53.0 / 6.0, 704.0 / 45.0, -107.0 / 9.0, 67.0 / 90.0, 3.0],
        &[
            -91.0 / 108.0,
            0.0,
            0.0,
            23.0 / 108.0,
            -976.0 / 135.0,
            311.0 / 54.0,
            -19.0 / 60.0,
            17.0 / 6.0,
            -1.0 / 12.0,
        ],
        &[
            2383.0 / 4100.0,
            0.0,
            0.0,
            -341.0 / 164.0,
            4496.0 / 1025.0,
            -301.0 / 82.0,
            2133.0 / 4100.0,
            45.0 / 82.0,
            45.0 / 164.0,
            18.0 / 41.0,
        ],
        &[
            3.0 / 205.0,
            0.0,
            0.0,
            0.0,
            0.0,
            -6.0 / 41.0,
            -3.0 / 205.0,
            -3.0 / 41.0,
            3.0 / 41.0,
            6.0 / 41.0,
            0.0,
        ],
        &[
            -1777.0 / 4100.0,
            0.0,
            0.0,
            -341.0 / 164.0,
            4496.0 / 1025.0,
            -289.0 / 82.0,
            2193.0 / 4100.0,
            51.0 / 82.0,
            33.0 / 164.0,
            12.0 / 41.0,
            0.0,
            1.0,
        ],
    ];

    /// Weights for the 8th-order solution. Only stages 0-10 contribute.
    pub const B: [f64; STAGES] = [
        41.0 / 840.0,
        0.0,
        0.0,
        0.0,
        0.0,
        34.0 / 105.0,
        9.0 / 35.0,
        9.0 / 35.0,
        9.0 / 280.0,
        9.0 / 280.0,
        41.0 / 840.0,
        0.0,
        0.0,
    ];

    /// Weights for the 7th-order solution (stages 0, 5-12)
    pub const B_HAT: [f64; STAGES] = [
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        34.0 / 105.0,
        9.0 / 35.0,
        9.0 / 35.0,
        9.0 / 280.0,
        9.0 / 280.0,
        0.0,
        41.0 / 840.0,
        41.0 / 840.0,
    ];

    /// Error weights B - B_HAT.
    ///
    /// TE = (41/840) * (f_0 + f_10 - f_11 - f_12) * h
    pub const B_ERR: [f64; STAGES] = [
        41.0 / 840.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        41.0 / 840.0,
        -41.0 / 840.0,
        -41.0 / 840.0,
    ];

    /// The Fehlberg 7(8) pair
    pub const TABLEAU: Tableau = Tableau {
        name: "RKF7(8)",
        order: 8,
        embedded_order: 7,
        c: &C,
        a: A,
        b: &B,
        b_err: &B_ERR,
        fsal: false,
    };
}

/// Dormand-Prince 5(4)
pub mod dopri5 {
    use super::Tableau;

    /// Number of stages
    pub const STAGES: usize = 7;

    /// Node coefficients
    pub const C: [f64; STAGES] = [0.0, 0.2, 0.3, 0.8, 8.0 / 9.0, 1.0, 1.0];

    /// Runge-Kutta matrix. The last row equals `B` (FSAL).
    pub const A: &[&[f64]] = &[
        &[],
        &[0.2],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ];

    /// Weights for the 5th-order solution
    pub const B: [f64; STAGES] = [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ];

    /// Weights for the 4th-order solution
    pub const B_HAT: [f64; STAGES] = [
        5179.0 / 57600.0,
        0.0,
        7571.0 / 16695.0,
        393.0 / 640.0,
        -92097.0 / 339200.0,
        187.0 / 2100.0,
        1.0 / 40.0,
    ];

    /// Error weights B - B_HAT
    pub const B_ERR: [f64; STAGES] = [
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ];

    /// Weights of the 4th-order continuous extension (fifth dense coefficient)
    pub const D: [f64; STAGES] = [
        -12715105075.0 / 11282082432.0,
        0.0,
        87487479700.0 / 32700410799.0,
        -10690763975.0 / 1880347072.0,
        701980252875.0 / 199316789632.0,
        -1453857185.0 / 822651844.0,
        69997945.0 / 29380423.0,
    ];

    /// The Dormand-Prince 5(4) pair
    pub const TABLEAU: Tableau = Tableau {
        name: "DOPRI5(4)",
        order: 5,
        embedded_order: 4,
        c: &C,
        a: A,
        b: &B,
        b_err: &B_ERR,
        fsal: true,
    };
}
