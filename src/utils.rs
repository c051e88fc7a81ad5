use std::error::Error;

/// Boxed static error type
pub type Err = Box<dyn Error + 'static>;

/// Differences bigger than this in log terms don't affect the sum to 12 or
/// so decimal places, so the larger argument is returned unchanged.
const LOG_TOLERANCE: f64 = 30.0;

/// Returns `log(exp(lx) + exp(ly))`, taking care to avoid overflow when the
/// arguments differ greatly in magnitude, and handling -inf (probability 0).
pub fn log_add(lx: f64, ly: f64) -> f64 {
  let (max, neg_diff) = if lx > ly { (lx, ly - lx) } else { (ly, lx - ly) };
  if max == f64::NEG_INFINITY || neg_diff < -LOG_TOLERANCE {
    max
  } else {
    max + (1.0 + neg_diff.exp()).ln()
  }
}

/// Reflexive-transitive closure of a binary relation given as an adjacency
/// matrix: `closure[i][j]` iff there is a path of length >= 0 from i to j.
pub fn reflexive_transitive(rel: &[Vec<bool>]) -> Vec<Vec<bool>> {
  let n = rel.len();
  let mut t: Vec<Vec<bool>> = (0..n)
    .map(|i| (0..n).map(|j| i == j || rel[i][j]).collect())
    .collect();
  for k in 0..n {
    for i in 0..n {
      if t[i][k] {
        for j in 0..n {
          if t[k][j] {
            t[i][j] = true;
          }
        }
      }
    }
  }
  t
}

pub fn two_norm(v: &[f64]) -> f64 {
  v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `a + c * b`, elementwise, into a fresh vector.
pub fn add_scaled(a: &[f64], c: f64, b: &[f64]) -> Vec<f64> {
  a.iter().zip(b).map(|(x, y)| x + c * y).collect()
}

#[test]
fn test_log_add() {
  let x: f64 = 0.3_f64.ln();
  let y: f64 = 0.4_f64.ln();
  assert!((log_add(x, y).exp() - 0.7).abs() < 1e-12);
  assert_eq!(log_add(f64::NEG_INFINITY, x), x);
  assert_eq!(log_add(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
  // a huge difference falls back to the larger argument
  assert_eq!(log_add(0.0, -1e3), 0.0);
}

#[test]
fn test_reflexive_transitive() {
  // 0 -> 1 -> 2, 3 isolated
  let rel = vec![
    vec![false, true, false, false],
    vec![false, false, true, false],
    vec![false, false, false, false],
    vec![false, false, false, false],
  ];
  let t = reflexive_transitive(&rel);
  assert!(t[0][0] && t[0][1] && t[0][2]);
  assert!(!t[0][3]);
  assert!(t[3][3]);
  assert!(!t[2][0]);
}
