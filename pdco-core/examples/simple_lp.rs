//! Small bounded LP solved with a direct and an iterative Newton solve.
//!
//!   minimize    x1 + x2 + 3 x3
//!   subject to  x1 + x2 + x3 = 1
//!               x1 - x2      = 0
//!               0 <= x <= 1
//!
//! Optimal solution: x = (0.5, 0.5, 0), objective = 1.0

use pdco_core::linalg::sparse;
use pdco_core::{
    solve, ConstraintOperator, KrylovMethod, LinearObjective, PreconditionerKind, ProblemData, SolveFamily,
    SolverSettings,
};

fn problem() -> ProblemData {
    let a = sparse::from_triplets(
        2,
        3,
        vec![(0, 0, 1.0), (0, 1, 1.0), (0, 2, 1.0), (1, 0, 1.0), (1, 1, -1.0)],
    );
    ProblemData::new(
        LinearObjective::new(vec![1.0, 1.0, 3.0]),
        ConstraintOperator::Explicit(a),
        vec![1.0, 0.0],
        vec![0.0; 3],
        vec![1.0; 3],
    )
}

fn main() {
    let prob = problem();
    let runs = [
        ("cholesky", SolverSettings::default()),
        (
            "sqd-minres",
            SolverSettings {
                family: SolveFamily::SqdKrylov,
                krylov_method: KrylovMethod::Minres,
                preconditioner: PreconditionerKind::DiagonalJacobiSchur,
                ..SolverSettings::default()
            },
        ),
    ];

    for (label, settings) in runs {
        match solve(&prob, &settings) {
            Ok(result) => {
                println!(
                    "{:<10} {} in {} iterations ({} inner)",
                    label, result.status, result.info.iters, result.info.inner_iters_total
                );
                println!("           x = {:?}", result.x);
                println!("           objective = {:.8}", result.obj_val);
                for event in &result.diagnostics.events {
                    println!("           {}", event);
                }
            }
            Err(e) => println!("{:<10} failed: {}", label, e),
        }
    }
}
