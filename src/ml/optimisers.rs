extern crate ndarray;

use ndarray::prelude::*;
use ndarray::Zip;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::ml::error::{Result, StyleError};

//________________________________________________________________
/// Snapshot handed to the iteration observer after every accepted step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationState {
    pub iteration: usize,
    pub loss: f64,
    pub projected_gradient_norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Infinity norm of the projected gradient fell below `pgtol`.
    ProjectedGradient,
    /// Relative loss reduction of the last step fell below `ftol`.
    RelativeReduction,
    MaxIterations,
    MaxEvaluations,
    /// No sufficient decrease along steepest descent.
    LineSearchFailed,
}

#[derive(Debug, Clone)]
pub struct OptimResult {
    pub x: Array1<f64>,
    pub fun: f64,
    pub nit: usize,
    pub nfev: usize,
    pub termination: Termination,
}
//________________________________________________________________
/// Limited-memory BFGS over a box.
///
/// Variables sitting on a bound with the gradient pointing outwards are frozen
/// for the iteration, the quasi-Newton direction is built on the remaining
/// free variables and every trial point is projected back into the box.
///
/// The line search only enforces sufficient decrease (Armijo), not the
/// curvature condition, so a step with `s·y <= 0` is accepted but its pair is
/// left out of the history.
#[derive(Debug, Clone)]
pub struct Lbfgsb {
    pub max_iter: usize,
    pub max_correction: usize,
    pub max_fun: usize,
    pub ftol: f64,
    pub pgtol: f64,
    pub max_line_search: usize,
}

impl Default for Lbfgsb {
    fn default() -> Self {
        Self {
            max_iter: 15000,
            max_correction: 10,
            max_fun: 15000,
            ftol: 2.220446049250313e-9,
            pgtol: 1e-5,
            max_line_search: 20,
        }
    }
}

const ARMIJO_C1: f64 = 1e-4;

struct Evaluator<F> {
    fun: F,
    nfev: usize,
}

impl<F> Evaluator<F>
where
    F: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
{
    fn eval(&mut self, x: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        self.nfev += 1;
        let (f, g) = (self.fun)(x)?;

        if !f.is_finite() {
            return Err(StyleError::NonFiniteObjective { evaluation: self.nfev, detail: format!("loss is {}", f) });
        }
        if g.len() != x.len() {
            return Err(StyleError::shape(x.len(), g.len()));
        }
        if let Some(i) = g.iter().position(|v| !v.is_finite()) {
            return Err(StyleError::NonFiniteObjective {
                evaluation: self.nfev,
                detail: format!("gradient component {} is {}", i, g[i]),
            });
        }
        Ok((f, g))
    }
}

impl Lbfgsb {
    pub fn new(max_iter: usize) -> Self {
        Self { max_iter, ..Self::default() }
    }

    pub fn with_max_correction(mut self, max_correction: usize) -> Self {
        self.max_correction = max_correction.max(1);
        self
    }

    /// Minimizes `fun` (returning loss and gradient) starting from `x0`, one
    /// `(lower, upper)` pair per variable. `callback` observes every accepted
    /// iteration and cannot influence the trajectory.
    pub fn minimize<F, C>(&self, fun: F, x0: Array1<f64>, bounds: &[(f64, f64)], mut callback: C) -> Result<OptimResult>
    where
        F: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
        C: FnMut(&IterationState),
    {
        if bounds.len() != x0.len() {
            return Err(StyleError::shape(x0.len(), bounds.len()));
        }
        let lower: Array1<f64> = bounds.iter().map(|b| b.0).collect();
        let upper: Array1<f64> = bounds.iter().map(|b| b.1).collect();

        let mut evaluator = Evaluator { fun, nfev: 0 };
        let mut x = project(&x0, &lower, &upper);
        let (mut f, mut g) = evaluator.eval(&x)?;

        let mut history: VecDeque<(Array1<f64>, Array1<f64>)> = VecDeque::with_capacity(self.max_correction);
        let mut nit = 0;

        let termination = loop {
            let pg_norm = projected_gradient_norm(&x, &g, &lower, &upper);
            if pg_norm <= self.pgtol {
                break Termination::ProjectedGradient;
            }
            if nit >= self.max_iter {
                break Termination::MaxIterations;
            }
            if evaluator.nfev >= self.max_fun {
                break Termination::MaxEvaluations;
            }

            let free = free_variables(&x, &g, &lower, &upper);
            let mut d = two_loop(&g, &free, &history);
            let mut slope = g.dot(&d);
            if !(slope < 0.0) {
                debug!("quasi-Newton direction is not a descent direction, resetting history");
                history.clear();
                d = -&g * &free;
                slope = g.dot(&d);
            }

            // the first step has no curvature information to scale it
            let step = if history.is_empty() {
                let norm = d.dot(&d).sqrt();
                if norm > 1.0 { 1.0 / norm } else { 1.0 }
            } else {
                1.0
            };

            let accepted = self.line_search(&mut evaluator, &x, f, &g, &d, step, &lower, &upper)?;
            let (x_new, f_new, g_new) = match accepted {
                Some(point) => point,
                None if evaluator.nfev >= self.max_fun => break Termination::MaxEvaluations,
                None if !history.is_empty() => {
                    warn!(iteration = nit, "line search failed, restarting from steepest descent");
                    history.clear();
                    continue;
                }
                None => {
                    debug!(slope, "line search failed along steepest descent");
                    break Termination::LineSearchFailed;
                }
            };

            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            if sy > f64::EPSILON * y.dot(&y) {
                if history.len() == self.max_correction {
                    history.pop_front();
                }
                history.push_back((s, y));
            }

            let reduction = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);
            x = x_new;
            f = f_new;
            g = g_new;
            nit += 1;

            callback(&IterationState {
                iteration: nit,
                loss: f,
                projected_gradient_norm: projected_gradient_norm(&x, &g, &lower, &upper),
            });

            if reduction <= self.ftol {
                break Termination::RelativeReduction;
            }
        };

        debug!(nit, nfev = evaluator.nfev, loss = f, ?termination, "optimization finished");
        Ok(OptimResult { x, fun: f, nit, nfev: evaluator.nfev, termination })
    }

    /// Projected backtracking search with the Armijo condition measured along
    /// the actual (projected) displacement.
    #[allow(clippy::too_many_arguments)]
    fn line_search<F>(
        &self,
        evaluator: &mut Evaluator<F>,
        x: &Array1<f64>,
        f: f64,
        g: &Array1<f64>,
        d: &Array1<f64>,
        initial_step: f64,
        lower: &Array1<f64>,
        upper: &Array1<f64>,
    ) -> Result<Option<(Array1<f64>, f64, Array1<f64>)>>
    where
        F: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
    {
        let mut step = initial_step;
        for _ in 0..self.max_line_search {
            if evaluator.nfev >= self.max_fun {
                return Ok(None);
            }
            let trial = project(&(x + &(d * step)), lower, upper);
            let decrease = g.dot(&(&trial - x));
            if decrease >= 0.0 {
                // projection removed the whole step
                return Ok(None);
            }

            let (f_trial, g_trial) = evaluator.eval(&trial)?;
            if f_trial <= f + ARMIJO_C1 * decrease {
                return Ok(Some((trial, f_trial, g_trial)));
            }
            step *= 0.5;
        }
        Ok(None)
    }
}
//________________________________________________________________
fn project(x: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> Array1<f64> {
    let mut out = x.clone();
    Zip::from(&mut out).and(lower).and(upper).for_each(|v, &l, &u| {
        *v = v.max(l).min(u);
    });
    out
}

fn projected_gradient_norm(x: &Array1<f64>, g: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> f64 {
    let mut norm = 0.0f64;
    Zip::from(x).and(g).and(lower).and(upper).for_each(|&xi, &gi, &l, &u| {
        let moved = (xi - gi).max(l).min(u) - xi;
        norm = norm.max(moved.abs());
    });
    norm
}

/// 1.0 for variables free to move this iteration, 0.0 for variables held at
/// a bound by a gradient pointing out of the box.
fn free_variables(x: &Array1<f64>, g: &Array1<f64>, lower: &Array1<f64>, upper: &Array1<f64>) -> Array1<f64> {
    let mut free = Array1::<f64>::ones(x.len());
    Zip::from(&mut free).and(x).and(g).and(lower).and(upper).for_each(|m, &xi, &gi, &l, &u| {
        if (xi <= l && gi > 0.0) || (xi >= u && gi < 0.0) {
            *m = 0.0;
        }
    });
    free
}

/// Two-loop recursion on the free subspace; returns `-H g` with frozen
/// components zeroed.
fn two_loop(g: &Array1<f64>, free: &Array1<f64>, history: &VecDeque<(Array1<f64>, Array1<f64>)>) -> Array1<f64> {
    let mut q = g * free;
    let mut alphas = Vec::with_capacity(history.len());
    let mut gamma = 1.0;
    let mut last = true;

    for (s, y) in history.iter().rev() {
        let s_free = s * free;
        let y_free = y * free;
        let sy = s_free.dot(&y_free);
        if sy <= 0.0 {
            alphas.push(None);
            continue;
        }
        if last {
            gamma = sy / y_free.dot(&y_free);
            last = false;
        }
        let rho = 1.0 / sy;
        let alpha = rho * s_free.dot(&q);
        q.scaled_add(-alpha, &y_free);
        alphas.push(Some((rho, alpha, s_free, y_free)));
    }

    let mut r = q * gamma;
    for entry in alphas.into_iter().rev() {
        if let Some((rho, alpha, s_free, y_free)) = entry {
            let beta = rho * y_free.dot(&r);
            r.scaled_add(alpha - beta, &s_free);
        }
    }

    -(r * free)
}
//________________________________________________________________

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quadratic(centre: Array1<f64>) -> impl FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)> {
        move |x: &Array1<f64>| {
            let diff = x - &centre;
            Ok((diff.dot(&diff), diff * 2.0))
        }
    }

    fn rosenbrock(x: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = array![-2.0 * (1.0 - a) - 400.0 * a * (b - a * a), 200.0 * (b - a * a)];
        Ok((f, g))
    }

    #[test]
    fn quadratic_solution_is_clipped_to_the_box() {
        let bounds = [(0.0, 1.0), (-1.0, 1.0), (0.0, 1.0)];
        let result = Lbfgsb::new(100)
            .minimize(quadratic(array![2.0, -3.0, 0.5]), array![0.5, 0.0, 0.0], &bounds, |_| {})
            .unwrap();

        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.x[1], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.x[2], 0.5, epsilon = 1e-4);
        assert!(result.termination == Termination::ProjectedGradient || result.termination == Termination::RelativeReduction);
    }

    #[test]
    fn coupled_variables_settle_against_an_active_bound() {
        // f = (a - 2)^2 + (b + 3)^2 + (c - 0.5 - 0.15 a)^2
        let fun = |x: &Array1<f64>| {
            let r = x[2] - 0.5 - 0.15 * x[0];
            let f = (x[0] - 2.0).powi(2) + (x[1] + 3.0).powi(2) + r * r;
            let g = array![2.0 * (x[0] - 2.0) - 0.3 * r, 2.0 * (x[1] + 3.0), 2.0 * r];
            Ok((f, g))
        };
        let bounds = [(0.0, 1.0), (-1.0, 1.0), (0.0, 1.0)];
        let result = Lbfgsb::new(100).minimize(fun, array![0.0, 0.0, 0.0], &bounds, |_| {}).unwrap();

        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.x[1], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.x[2], 0.65, epsilon = 1e-3);
    }

    #[test]
    fn starting_point_is_projected_into_the_box() {
        let bounds = [(0.0, 1.0)];
        let mut seen = Vec::new();
        let fun = |x: &Array1<f64>| {
            seen.push(x[0]);
            Ok((x[0], array![1.0]))
        };
        let result = Lbfgsb::new(10).minimize(fun, array![5.0], &bounds, |_| {}).unwrap();
        assert_eq!(seen[0], 1.0);
        assert_eq!(result.x[0], 0.0);
    }

    #[test]
    fn rosenbrock_converges() {
        let bounds = [(-2.0, 2.0), (-2.0, 2.0)];
        let result = Lbfgsb::new(500).minimize(rosenbrock, array![-1.2, 1.0], &bounds, |_| {}).unwrap();
        assert_abs_diff_eq!(result.x[0], 1.0, epsilon = 1e-2);
        assert_abs_diff_eq!(result.x[1], 1.0, epsilon = 2e-2);
        assert!(result.fun < 1e-4);
        assert!(result.nfev >= result.nit);
    }

    #[test]
    fn callback_observes_every_iteration() {
        let bounds = [(-2.0, 2.0), (-2.0, 2.0)];
        let mut states = Vec::new();
        let result = Lbfgsb::new(3)
            .with_max_correction(8)
            .minimize(rosenbrock, array![-1.2, 1.0], &bounds, |state| states.push(*state))
            .unwrap();

        assert_eq!(result.nit, 3);
        assert_eq!(result.termination, Termination::MaxIterations);
        let iterations: Vec<usize> = states.iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(states[2].loss, result.fun);
        assert!(states[2].loss < 24.2);
    }

    #[test]
    fn evaluation_budget_is_respected() {
        let bounds = [(-2.0, 2.0), (-2.0, 2.0)];
        let mut optimiser = Lbfgsb::new(1000);
        optimiser.max_fun = 5;
        let result = optimiser.minimize(rosenbrock, array![-1.2, 1.0], &bounds, |_| {}).unwrap();
        assert_eq!(result.termination, Termination::MaxEvaluations);
        assert!(result.nfev <= 5);
    }

    #[test]
    fn non_finite_loss_aborts() {
        let bounds = [(-1.0, 1.0)];
        let fun = |_: &Array1<f64>| Ok((f64::NAN, array![0.0]));
        let result = Lbfgsb::new(10).minimize(fun, array![0.0], &bounds, |_| {});
        assert!(matches!(result, Err(StyleError::NonFiniteObjective { evaluation: 1, .. })));
    }

    #[test]
    fn non_finite_gradient_aborts() {
        let bounds = [(-1.0, 1.0), (-1.0, 1.0)];
        let fun = |_: &Array1<f64>| Ok((1.0, array![0.5, f64::INFINITY]));
        let result = Lbfgsb::new(10).minimize(fun, array![0.0, 0.0], &bounds, |_| {});
        assert!(matches!(result, Err(StyleError::NonFiniteObjective { .. })));
    }

    #[test]
    fn bounds_must_match_the_variables() {
        let result = Lbfgsb::new(10).minimize(quadratic(array![0.0, 0.0]), array![0.0, 0.0], &[(0.0, 1.0)], |_| {});
        assert!(matches!(result, Err(StyleError::ShapeMismatch(_))));
    }
}
