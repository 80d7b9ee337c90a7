//! Earth-Moon CR3BP arc, sparse and dense.
//!
//! Propagates a spatial state near the Moon for half a time unit with the
//! Fehlberg 7(8) pair, prints every accepted step, then resamples the same
//! arc onto 11 evenly spaced points with Dormand-Prince 5(4).
//!
//! Run with:
//!   cargo run --example earth_moon

use cr3bp::{propagate, Cr3bp, IntegratorOrder, OutputMode, PropagationConfig, Trajectory};

fn print_trajectory(traj: &Trajectory) {
    for sample in traj {
        let s = sample.state;
        println!(
            "  {:>10.6} {:>12.8} {:>12.8} {:>12.8} {:>12.8} {:>12.8} {:>12.8}",
            sample.t, s[0], s[1], s[2], s[3], s[4], s[5]
        );
    }
}

fn main() {
    let mu = 0.0122;
    let sys = Cr3bp::new(mu).expect("mass ratio in (0, 1)");

    let y0 = [0.788, 0.2, 0.0, -0.88, 0.2, 0.0];
    let span = (0.0, 0.5);

    let sparse = PropagationConfig::default()
        .with_order(IntegratorOrder::Rk78)
        .with_tolerances(1e-12, 1e-5)
        .with_initial_step(1e-5);

    let traj = match propagate(&y0, span, mu, &sparse) {
        Ok(traj) => traj,
        Err(e) => {
            eprintln!("propagation failed: {}", e);
            std::process::exit(1);
        }
    };

    let c0 = sys.jacobi_constant(&y0);
    let cf = sys.jacobi_constant(&traj.last().expect("non-empty trajectory").state);

    println!("Earth-Moon CR3BP (mu = {mu})");
    println!("  Span:           {:?}", span);
    println!("  Jacobi C0:      {c0:.12}");
    println!("  Jacobi drift:   {:.2e}", (cf - c0).abs());
    println!();
    println!("RK78, accepted steps:");
    print_trajectory(&traj);
    println!();
    println!("  Accepted steps: {}", traj.stats().accepted_steps);
    println!("  Rejected steps: {}", traj.stats().rejected_steps);
    println!("  Function evals: {}", traj.stats().fn_evals);

    let dense = PropagationConfig::default()
        .with_order(IntegratorOrder::Rk45)
        .with_output(OutputMode::Dense { samples: 11 })
        .with_tolerances(1e-12, 1e-10);

    match propagate(&y0, span, mu, &dense) {
        Ok(traj) => {
            println!();
            println!("RK45, dense output:");
            print_trajectory(&traj);
        }
        Err(e) => eprintln!("dense propagation failed: {}", e),
    }
}
