//! Maximum-entropy parameter estimation for the translation model. The
//! conditional log-likelihood of the training examples is maximized with
//! L-BFGS, using the parser's inside-outside pass for the expected feature
//! counts and a Gaussian prior on the weights.

use std::collections::HashSet;

use crate::earley::{Expected, ScfgParser};
use crate::gap::GapModel;
use crate::grammar::Grammar;
use crate::mrl::Example;
use crate::optimize::{Differentiable, Lbfgs, Objective};
use crate::utils::{log_add, Err};

/// Knobs for parameter estimation.
pub struct TrainOptions {
  /// Variance of the zero-mean Gaussian prior over the weights.
  pub prior_variance: f64,
  /// How many L-BFGS iterations pass between Viterbi-approximation checks.
  /// Zero disables the approximation entirely.
  pub viterbi_interval: usize,
  /// How many top parses per example the Viterbi check considers.
  pub viterbi_k: usize,
}

impl Default for TrainOptions {
  fn default() -> Self {
    TrainOptions { prior_variance: 100.0, viterbi_interval: 10, viterbi_k: 1 }
  }
}

/// Estimates the rule and word-gap weights from gold sentence/meaning
/// pairs, writing the fitted weights back into `gram` and `gap`.
pub fn estimate(
  gram: &mut Grammar,
  gap: &mut GapModel,
  examples: &[Example],
  opts: &TrainOptions,
) -> Result<(), Err> {
  tracing::info!(
    examples = examples.len(),
    rules = gram.count_rules(),
    "estimating translation model parameters"
  );
  let mut weights = vec![0.0; gram.count_rules() + gap.count_params(gram.dict())];
  let mut obj = TrainObjective { gram, gap, examples, opts, last: None };
  let converged = Lbfgs::new().minimize(&mut obj, &mut weights)?;
  obj.set_weight_vector(&weights);
  tracing::info!(converged, "parameter estimation done");
  Ok(())
}

/// The negated penalized log-likelihood, as seen by the minimizer. The
/// weight vector is one entry per rule id (only active, self-tied rules
/// carry nonzero weight) followed by the gap model's parameters.
struct TrainObjective<'a> {
  gram: &'a mut Grammar,
  gap: &'a mut GapModel,
  examples: &'a [Example],
  opts: &'a TrainOptions,
  last: Option<(Vec<f64>, f64, Vec<f64>)>,
}

impl TrainObjective<'_> {
  fn set_weight_vector(&mut self, x: &[f64]) {
    let nr = self.gram.count_rules();
    for id in 0..nr {
      if self.gram.is_active(id) {
        let tied = self.gram.tied_id(self.gram.rule(id)).unwrap_or(id);
        self.gram.set_weight(id, x[tied]);
      }
    }
    self.gap.set_weight_vector(self.gram.dict(), &x[nr..]);
  }

  /// Log-adds one example's expected feature counts, normalized by `z`,
  /// into the accumulator `t`.
  fn add_t(&self, t: &mut [f64], expected: &Expected, z: f64) {
    let nr = self.gram.count_rules();
    for tied in 0..nr {
      if expected.rules[tied] > f64::NEG_INFINITY {
        t[tied] = log_add(t[tied], self.gram.weight(tied) + expected.rules[tied] - z);
      }
    }
    let weights = self.gap.weight_vector(self.gram.dict());
    let outers = self.gap.outer_vector(self.gram.dict(), &expected.gap);
    for i in 0..weights.len() {
      t[nr + i] = log_add(t[nr + i], weights[i] + outers[i] - z);
    }
  }
}

impl Differentiable for TrainObjective<'_> {
  fn value_and_gradient(&mut self, x: &[f64], grad: &mut [f64]) -> f64 {
    if let Some((last_x, last_val, last_grad)) = &self.last {
      if last_x == x {
        grad.copy_from_slice(last_grad);
        return *last_val;
      }
    }
    self.set_weight_vector(x);
    let mut t_e = vec![f64::NEG_INFINITY; x.len()];
    let mut t_ef = vec![f64::NEG_INFINITY; x.len()];
    let mut val = 0.0;
    let mut parser = ScfgParser::new(self.gram, self.gap);
    for ex in self.examples {
      parser.parse(&ex.e, Some(&ex.f));
      let mut z_e = f64::NEG_INFINITY;
      let mut z_ef = f64::NEG_INFINITY;
      for parse in parser.parses() {
        z_e = log_add(z_e, parse.score);
        if !parse.empty_mask {
          z_ef = log_add(z_ef, parse.score);
        }
      }
      if z_ef > f64::NEG_INFINITY {
        val += z_e - z_ef;
        let expected_e = parser.outside(false);
        self.add_t(&mut t_e, &expected_e, z_e);
        let expected_ef = parser.outside(true);
        self.add_t(&mut t_ef, &expected_ef, z_ef);
        tracing::debug!(id = ex.id, log_prob = z_ef - z_e, "example");
      } else {
        tracing::debug!(id = ex.id, "example has no gold-consistent parse");
      }
    }
    drop(parser);
    tracing::debug!(log_likelihood = -val, "corpus log-likelihood");
    for i in 0..x.len() {
      val += x[i] * x[i] / (2.0 * self.opts.prior_variance);
      grad[i] = t_e[i].exp() - t_ef[i].exp() + x[i] / self.opts.prior_variance;
    }
    self.last = Some((x.to_vec(), val, grad.to_vec()));
    val
  }
}

impl Objective for TrainObjective<'_> {
  fn current_x(&self) -> Vec<f64> {
    let nr = self.gram.count_rules();
    let mut x = vec![0.0; nr];
    for id in 0..nr {
      if self.gram.is_active(id) && self.gram.tied_id(self.gram.rule(id)) == Some(id) {
        x[id] = self.gram.weight(id);
      }
    }
    x.extend(self.gap.weight_vector(self.gram.dict()));
    x
  }

  /// The Viterbi approximation: rules absent from every example's
  /// top-ranked gold-consistent parses are deactivated, shrinking the
  /// objective for the remaining iterations.
  fn check(&mut self, iter: usize, is_last: bool) -> bool {
    if self.opts.viterbi_interval == 0 {
      return false;
    }
    if !is_last && (iter + 1) % self.opts.viterbi_interval != 0 {
      return false;
    }
    let mut marked = HashSet::new();
    {
      let mut parser = ScfgParser::viterbi(self.gram, self.gap, self.opts.viterbi_k);
      for ex in self.examples {
        parser.parse(&ex.e, Some(&ex.f));
        for parse in parser.parses() {
          parser.mark_rules(parse.item, &mut marked);
        }
      }
    }
    let mut changed = false;
    for id in 0..self.gram.count_rules() {
      if !self.gram.is_active(id) || self.gram.rule(id).is_init() {
        continue;
      }
      let tied = self.gram.tied_id(self.gram.rule(id)).unwrap_or(id);
      if !marked.contains(&tied) {
        tracing::debug!(
          rule = %self.gram.rule(id).display(self.gram.dict()),
          "deactivating unused rule"
        );
        self.gram.deactivate(id);
        changed = true;
      }
    }
    if changed {
      self.last = None;
    }
    changed
  }
}
