//! Limited-memory BFGS with a backtracking line search, used to fit the
//! log-linear model weights. Follows Nocedal (1980) with the cautious
//! update of Kelley (1999).

use std::collections::VecDeque;

use crate::utils::{add_scaled, dot, two_norm, Err};

/// A differentiable objective function to be minimized.
pub trait Differentiable {
  /// Evaluates the objective at `x`, writes the gradient into `grad`, and
  /// returns the value. Implementations are expected to cache the last
  /// evaluation point, since the optimizer re-evaluates at unchanged `x`.
  fn value_and_gradient(&mut self, x: &[f64], grad: &mut [f64]) -> f64;
}

/// An objective the L-BFGS loop can minimize. The objective is consulted
/// after every iteration and may change itself, in which case the stored
/// correction vectors no longer apply and the search restarts from the
/// objective's own decision vector.
pub trait Objective: Differentiable {
  /// The decision vector to resume from after the objective has changed.
  fn current_x(&self) -> Vec<f64>;

  /// Called at the end of each iteration (`iter` starts at 0; `is_last` is
  /// set when the search is about to stop). Returns true if the objective
  /// has changed and the correction history must be discarded.
  fn check(&mut self, iter: usize, is_last: bool) -> bool;
}

const LINE_SEARCH_ITERATIONS: usize = 100;
const SUFFICIENT_DECREASE: f64 = 1e-4;
const BACKTRACK_LOW: f64 = 0.1;
const BACKTRACK_HIGH: f64 = 0.5;
const STEP_TOLERANCE: f64 = 1e-7;

/// Backtracking line search (Armijo, 1966). The step size is refined by
/// quadratic interpolation on the first backtrack and cubic interpolation
/// afterwards, clamped to a geometric backtracking window.
pub struct LineSearch;

impl LineSearch {
  /// Moves `x` along `dir` until the objective value sufficiently
  /// decreases. Returns false (with `x` restored) if no acceptable step
  /// exists above the minimum step size.
  pub fn decrease(
    obj: &mut dyn Differentiable,
    x: &mut [f64],
    dir: &[f64],
  ) -> Result<bool, Err> {
    let mut grad = vec![0.0; x.len()];
    let val0 = obj.value_and_gradient(x, &mut grad);
    let gd0 = dot(&grad, dir);
    if gd0 >= 0.0 {
      tracing::error!(gd0, "line search direction does not descend");
      return Err("roundoff problem: line search direction does not descend".into());
    }
    // minimum step size, Press et al. (1992)
    let mut scale: f64 = 0.0;
    for (d, xi) in dir.iter().zip(x.iter()) {
      scale = scale.max(d.abs() / xi.abs().max(1.0));
    }
    let min_lambda = STEP_TOLERANCE / scale;
    let x0 = x.to_vec();
    let mut lambda = 1.0;
    let mut last_val = val0;
    let mut last_lambda = 1.0;
    for _ in 0..LINE_SEARCH_ITERATIONS {
      if lambda < min_lambda {
        x.copy_from_slice(&x0);
        tracing::warn!("line search step size is too small");
        return Ok(false);
      }
      x.copy_from_slice(&add_scaled(&x0, lambda, dir));
      let val = obj.value_and_gradient(x, &mut grad);
      if val - val0 < SUFFICIENT_DECREASE * lambda * gd0 {
        return Ok(true);
      }
      let next_lambda = if lambda == 1.0 {
        -gd0 / (2.0 * (val - val0 - gd0))
      } else {
        let r1 = val - val0 - gd0 * lambda;
        let r2 = last_val - val0 - gd0 * last_lambda;
        let a =
          (r1 / (lambda * lambda) - r2 / (last_lambda * last_lambda)) / (lambda - last_lambda);
        let b = (-last_lambda * r1 / (lambda * lambda)
          + lambda * r2 / (last_lambda * last_lambda))
          / (lambda - last_lambda);
        if a == 0.0 {
          -gd0 / (2.0 * b)
        } else {
          let d = b * b - 3.0 * a * gd0;
          if d < 0.0 {
            0.5 * lambda
          } else if b <= 0.0 {
            (-b + d.sqrt()) / (3.0 * a)
          } else {
            -gd0 / (b + d.sqrt())
          }
        }
      };
      last_val = val;
      last_lambda = lambda;
      lambda = next_lambda.clamp(BACKTRACK_LOW * lambda, BACKTRACK_HIGH * lambda);
    }
    x.copy_from_slice(&x0);
    tracing::warn!("line search fails to converge");
    Ok(false)
  }
}

const MAX_ITERATIONS: usize = 1000;
const NUM_CORRECTIONS: usize = 4;
const ABS_RESIDUAL: f64 = 1e-1;
const REL_RESIDUAL: f64 = 1e-3;

/// The limited-memory BFGS minimizer. Keeps a short window of correction
/// pairs and builds the search direction with the two-loop recursion,
/// scaled as in Byrd, Nocedal & Schnabel (1992).
pub struct Lbfgs {
  last_x: Option<Vec<f64>>,
  last_grad: Option<Vec<f64>>,
  s: VecDeque<Vec<f64>>,
  y: VecDeque<Vec<f64>>,
  rho: VecDeque<f64>,
}

impl Default for Lbfgs {
  fn default() -> Self {
    Lbfgs::new()
  }
}

impl Lbfgs {
  pub fn new() -> Self {
    Lbfgs {
      last_x: None,
      last_grad: None,
      s: VecDeque::with_capacity(NUM_CORRECTIONS),
      y: VecDeque::with_capacity(NUM_CORRECTIONS),
      rho: VecDeque::with_capacity(NUM_CORRECTIONS),
    }
  }

  /// Discards the stored correction vectors. Required whenever the
  /// objective function changes between iterations.
  pub fn reset(&mut self) {
    self.last_x = None;
    self.last_grad = None;
    self.s.clear();
    self.y.clear();
    self.rho.clear();
  }

  /// Finds a decision vector that locally minimizes `obj`, starting from
  /// and writing back through `x`. Returns true if the search converges.
  pub fn minimize<O: Objective>(&mut self, obj: &mut O, x: &mut Vec<f64>) -> Result<bool, Err> {
    let mut grad = vec![0.0; x.len()];
    obj.value_and_gradient(x, &mut grad);
    let g0 = two_norm(&grad);
    if g0 == 0.0 {
      return Ok(true);
    }
    self.reset();
    for iter in 0..MAX_ITERATIONS {
      tracing::debug!(iter, "l-bfgs iteration");
      let mut pair = None;
      if let (Some(lx), Some(lg)) = (&self.last_x, &self.last_grad) {
        let s = add_scaled(x, -1.0, lx);
        let y = add_scaled(&grad, -1.0, lg);
        let sy = dot(&s, &y);
        // cautious update, Kelley (1999)
        if sy <= 0.0 {
          tracing::warn!("curvature condition violated, resetting correction vectors");
          self.reset();
        } else {
          pair = Some((s, y, sy));
        }
      }
      let dir = if let Some((s, y, sy)) = pair {
        let gamma = sy / dot(&y, &y);
        if self.s.len() == NUM_CORRECTIONS {
          self.s.pop_front();
          self.y.pop_front();
          self.rho.pop_front();
        }
        self.s.push_back(s);
        self.y.push_back(y);
        self.rho.push_back(1.0 / sy);
        let size = self.s.len();
        let mut dir = grad.clone();
        let mut alpha = vec![0.0; size];
        for i in (0..size).rev() {
          alpha[i] = self.rho[i] * dot(&self.s[i], &dir);
          dir = add_scaled(&dir, -alpha[i], &self.y[i]);
        }
        for d in dir.iter_mut() {
          *d *= gamma;
        }
        for i in 0..size {
          let beta = self.rho[i] * dot(&self.y[i], &dir);
          dir = add_scaled(&dir, alpha[i] - beta, &self.s[i]);
        }
        for d in dir.iter_mut() {
          *d = -*d;
        }
        dir
      } else {
        grad.iter().map(|g| -g).collect()
      };
      self.last_x = Some(x.clone());
      self.last_grad = Some(grad.clone());
      let line_minimized = LineSearch::decrease(obj, x, &dir)?;
      obj.value_and_gradient(x, &mut grad);
      let converged = two_norm(&grad) < REL_RESIDUAL * g0 + ABS_RESIDUAL;
      if obj.check(iter, !line_minimized || converged) {
        // the objective has changed under us, start over from its state
        self.reset();
        *x = obj.current_x();
        grad = vec![0.0; x.len()];
        obj.value_and_gradient(x, &mut grad);
        continue;
      }
      if !line_minimized {
        return Ok(false);
      }
      if converged {
        return Ok(true);
      }
    }
    tracing::warn!("l-bfgs fails to converge");
    Ok(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Quadratic {
    target: Vec<f64>,
    last_x: Vec<f64>,
    moves_to: Option<Vec<f64>>,
  }

  impl Quadratic {
    fn new(target: &[f64]) -> Self {
      Quadratic { target: target.to_vec(), last_x: Vec::new(), moves_to: None }
    }
  }

  impl Differentiable for Quadratic {
    fn value_and_gradient(&mut self, x: &[f64], grad: &mut [f64]) -> f64 {
      self.last_x = x.to_vec();
      let mut val = 0.0;
      for i in 0..x.len() {
        let d = x[i] - self.target[i];
        val += d * d;
        grad[i] = 2.0 * d;
      }
      val
    }
  }

  impl Objective for Quadratic {
    fn current_x(&self) -> Vec<f64> {
      self.last_x.clone()
    }

    fn check(&mut self, _iter: usize, _is_last: bool) -> bool {
      if let Some(target) = self.moves_to.take() {
        self.target = target;
        true
      } else {
        false
      }
    }
  }

  #[test]
  fn test_line_search_decreases() {
    let mut obj = Quadratic::new(&[0.0]);
    let mut x = vec![2.0];
    let mut grad = vec![0.0];
    let before = obj.value_and_gradient(&x, &mut grad);
    assert!(LineSearch::decrease(&mut obj, &mut x, &[-1.0]).unwrap());
    let after = obj.value_and_gradient(&x, &mut grad);
    assert!(after < before);
  }

  #[test]
  fn test_line_search_rejects_ascent_direction() {
    let mut obj = Quadratic::new(&[0.0]);
    let mut x = vec![2.0];
    assert!(LineSearch::decrease(&mut obj, &mut x, &[1.0]).is_err());
  }

  #[test]
  fn test_minimize_quadratic() {
    let mut obj = Quadratic::new(&[3.0, -4.0]);
    let mut x = vec![10.0, 10.0];
    assert!(Lbfgs::new().minimize(&mut obj, &mut x).unwrap());
    assert!((x[0] - 3.0).abs() < 0.1);
    assert!((x[1] + 4.0).abs() < 0.1);
  }

  #[test]
  fn test_minimize_at_optimum_converges_immediately() {
    let mut obj = Quadratic::new(&[1.0]);
    let mut x = vec![1.0];
    assert!(Lbfgs::new().minimize(&mut obj, &mut x).unwrap());
    assert_eq!(x, vec![1.0]);
  }

  #[test]
  fn test_objective_change_restarts_search() {
    let mut obj = Quadratic::new(&[3.0]);
    obj.moves_to = Some(vec![8.0]);
    let mut x = vec![20.0];
    assert!(Lbfgs::new().minimize(&mut obj, &mut x).unwrap());
    assert!((x[0] - 8.0).abs() < 0.1);
  }
}
