use std::collections::HashMap;

use crate::dictionary::Dictionary;
use crate::utils::{log_add, Err};

/// The basic word-gap model. Words skipped inside a rule's word gap are
/// scored `weight(word) = w0 + w_word`, a default weight plus a word-
/// specific weight. Both kinds of parameter are trained alongside the rule
/// weights.
#[derive(Debug, Default)]
pub struct GapModel {
  def_weight: f64,
  word_weights: HashMap<u32, f64>,
}

/// Expected-count accumulator for the gap model, filled in by the outside
/// pass. Scores are in log domain, split per weight component.
#[derive(Debug)]
pub struct GapOuter {
  pub def: f64,
  pub words: HashMap<u32, f64>,
}

impl GapOuter {
  pub fn new() -> Self {
    GapOuter { def: f64::NEG_INFINITY, words: HashMap::new() }
  }
}

impl Default for GapOuter {
  fn default() -> Self {
    GapOuter::new()
  }
}

impl GapModel {
  pub fn new() -> Self {
    GapModel::default()
  }

  fn word_weight(&self, word: u32) -> f64 {
    self.word_weights.get(&word).copied().unwrap_or(0.0)
  }

  /// The weight of generating `word` from a word gap.
  pub fn weight(&self, word: u32) -> f64 {
    self.def_weight + self.word_weight(word)
  }

  /// Number of parameters: one per dictionary word, plus the default.
  pub fn count_params(&self, dict: &Dictionary) -> usize {
    dict.count_words() + 1
  }

  /// The parameter vector: the default weight followed by the word weights
  /// in ascending word-id order.
  pub fn weight_vector(&self, dict: &Dictionary) -> Vec<f64> {
    let mut weights = Vec::with_capacity(self.count_params(dict));
    weights.push(self.def_weight);
    weights.extend(dict.words().map(|w| self.word_weight(w)));
    weights
  }

  pub fn set_weight_vector(&mut self, dict: &Dictionary, weights: &[f64]) {
    assert_eq!(weights.len(), self.count_params(dict));
    self.def_weight = weights[0];
    self.word_weights = dict
      .words()
      .zip(&weights[1..])
      .filter(|&(_, &w)| w != 0.0)
      .map(|(id, &w)| (id, w))
      .collect();
  }

  /// Splits an outer score `z` for a skipped word between the default and
  /// word-specific components, log-adding into the accumulator.
  pub fn add_outer(&self, word: u32, z: f64, out: &mut GapOuter) {
    out.def = log_add(out.def, z - self.def_weight);
    let entry = out.words.entry(word).or_insert(f64::NEG_INFINITY);
    *entry = log_add(*entry, z - self.word_weight(word));
  }

  /// The accumulated outer scores, laid out like the parameter vector.
  pub fn outer_vector(&self, dict: &Dictionary, out: &GapOuter) -> Vec<f64> {
    let mut outers = Vec::with_capacity(self.count_params(dict));
    outers.push(out.def);
    outers.extend(
      dict
        .words()
        .map(|w| out.words.get(&w).copied().unwrap_or(f64::NEG_INFINITY)),
    );
    outers
  }

  /// Writes the model parameters in the persisted text form.
  pub fn write(&self, dict: &Dictionary) -> String {
    let mut out = String::new();
    out.push_str("begin default-weight\n");
    out.push_str(&format!("{}\n", self.def_weight));
    out.push_str("end default-weight\n");
    out.push_str("begin word-weights\n");
    for word in dict.words() {
      if let Some(w) = self.word_weights.get(&word) {
        out.push_str(&format!("{} {}\n", dict.term_str(word), w));
      }
    }
    out.push_str("end word-weights\n");
    out
  }

  /// Reads model parameters as written by [`write`](Self::write).
  pub fn read(&mut self, dict: &mut Dictionary, text: &str) -> Result<(), Err> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let malformed = |line: &str| -> Err { format!("malformed gap model: {}", line).into() };
    match lines.next() {
      Some("begin default-weight") => {}
      other => return Err(malformed(other.unwrap_or(""))),
    }
    let def = lines.next().ok_or_else(|| malformed(""))?;
    self.def_weight = def.parse().map_err(|_| malformed(def))?;
    match lines.next() {
      Some("end default-weight") => {}
      other => return Err(malformed(other.unwrap_or(""))),
    }
    match lines.next() {
      Some("begin word-weights") => {}
      other => return Err(malformed(other.unwrap_or(""))),
    }
    self.word_weights = HashMap::new();
    for line in lines {
      if line == "end word-weights" {
        return Ok(());
      }
      let (word, weight) = line.rsplit_once(' ').ok_or_else(|| malformed(line))?;
      let id = dict.term(word, true);
      self
        .word_weights
        .insert(id, weight.parse().map_err(|_| malformed(line))?);
    }
    Err("gap model is missing its end marker".into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_weight_vector_layout() {
    let mut dict = Dictionary::new();
    let the = dict.term("the", true);
    let city = dict.term("city", true);
    let mut gm = GapModel::new();
    gm.set_weight_vector(&dict, &[-0.5, 0.0, -1.0]);
    assert_eq!(gm.weight(the), -0.5);
    assert_eq!(gm.weight(city), -1.5);
    assert_eq!(gm.weight_vector(&dict), vec![-0.5, 0.0, -1.0]);
  }

  #[test]
  fn test_outer_split() {
    let mut dict = Dictionary::new();
    let the = dict.term("the", true);
    let mut gm = GapModel::new();
    gm.set_weight_vector(&dict, &[-0.5, -1.0]);
    let mut out = GapOuter::new();
    gm.add_outer(the, -2.0, &mut out);
    assert_eq!(out.def, -1.5);
    assert_eq!(out.words[&the], -1.0);
    gm.add_outer(the, -2.0, &mut out);
    assert!((out.def - log_add(-1.5, -1.5)).abs() < 1e-12);
    let v = gm.outer_vector(&dict, &out);
    assert_eq!(v.len(), 2);
    assert_eq!(v[1], out.words[&the]);
  }

  #[test]
  fn test_persistence_round_trip() {
    let mut dict = Dictionary::new();
    dict.term("the", true);
    dict.term("city", true);
    let mut gm = GapModel::new();
    gm.set_weight_vector(&dict, &[-0.25, 0.0, -2.0]);
    let text = gm.write(&dict);

    let mut dict2 = Dictionary::new();
    dict2.term("the", true);
    dict2.term("city", true);
    let mut loaded = GapModel::new();
    loaded.read(&mut dict2, &text).unwrap();
    assert_eq!(loaded.weight_vector(&dict2), gm.weight_vector(&dict));
  }
}
