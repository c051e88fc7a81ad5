use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use crate::mask::Mask;
use crate::rules::Rule;
use crate::utils::log_add;

/// Handle into the chart's item arena. Back pointers and work lists hold
/// handles rather than references, so the packed forest has no ownership
/// cycles.
pub type ItemId = usize;

/// An Earley item: a partial or complete parse state of one SCFG rule.
///
/// `back` holds one entry per way the item can be derived. Each entry pairs
/// the predecessor item with the complete child item that advanced the dot,
/// or `None` for scan and word-skip steps. Structurally equal items reached
/// by different derivations are merged into one arena slot.
#[derive(Debug)]
pub struct Item {
  pub rule: Rc<Rule>,
  pub dot: usize,
  /// Words skipped so far in the gap left of the dot.
  pub gap: u16,
  pub start: usize,
  pub current: usize,
  /// Derivation-consistency bits, training only.
  pub m: Option<Mask>,
  pub inner: f64,
  pub outer: f64,
  pub timestamp: usize,
  pub back: Vec<(ItemId, Option<ItemId>)>,
}

impl Item {
  /// A fresh item for the prediction step, with the dot at position zero.
  pub fn predict(rule: Rc<Rule>, start: usize) -> Item {
    Item {
      rule,
      dot: 0,
      gap: 0,
      start,
      current: start,
      m: None,
      inner: f64::NEG_INFINITY,
      outer: f64::NEG_INFINITY,
      timestamp: 0,
      back: Vec::new(),
    }
  }

  /// Advances `back`'s dot over a scanned terminal. `rule` is `back`'s rule,
  /// or its wildcard specialization bound to the scanned word.
  pub fn scan(back_id: ItemId, back: &Item, rule: Rc<Rule>) -> Item {
    Item {
      rule,
      dot: back.dot + 1,
      gap: 0,
      start: back.start,
      current: back.current + 1,
      m: None,
      inner: f64::NEG_INFINITY,
      outer: f64::NEG_INFINITY,
      timestamp: 0,
      back: vec![(back_id, None)],
    }
  }

  /// Advances `back`'s dot over the nonterminal completed by `comp`.
  pub fn complete(back_id: ItemId, back: &Item, comp_id: ItemId, comp: &Item) -> Item {
    Item {
      rule: back.rule.clone(),
      dot: back.dot + 1,
      gap: 0,
      start: back.start,
      current: comp.current,
      m: None,
      inner: f64::NEG_INFINITY,
      outer: f64::NEG_INFINITY,
      timestamp: 0,
      back: vec![(back_id, Some(comp_id))],
    }
  }

  /// Skips one input word inside `back`'s word gap.
  pub fn skip(back_id: ItemId, back: &Item) -> Item {
    Item {
      rule: back.rule.clone(),
      dot: back.dot,
      gap: back.gap + 1,
      start: back.start,
      current: back.current + 1,
      m: None,
      inner: f64::NEG_INFINITY,
      outer: f64::NEG_INFINITY,
      timestamp: 0,
      back: vec![(back_id, None)],
    }
  }

  pub fn is_complete(&self) -> bool {
    self.dot == self.rule.len_e()
  }

  pub fn is_predict_step(&self) -> bool {
    self.back.is_empty()
  }

  pub fn is_scan_step(&self) -> bool {
    matches!(self.back.first(), Some((_, None)))
  }

  pub fn is_complete_step(&self) -> bool {
    matches!(self.back.first(), Some((_, Some(_))))
  }

  fn key(&self) -> ItemKey {
    ItemKey {
      rule: self.rule.clone(),
      dot: self.dot,
      gap: self.gap,
      start: self.start,
      current: self.current,
      m: self.m.clone(),
    }
  }
}

/// Item identity for packing: two items are the same chart entry iff rule,
/// dot, gap counter, span and mask all match.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ItemKey {
  rule: Rc<Rule>,
  dot: usize,
  gap: u16,
  start: usize,
  current: usize,
  m: Option<Mask>,
}

/// Per-position priority queue entry: complete items pop latest-start-first,
/// ties broken by discovery order. `BinaryHeap` is a max-heap, so larger
/// starts and smaller timestamps must compare greater.
type CompEntry = (usize, Reverse<usize>, ItemId);

/// An Earley chart for one sentence. Items are bucketed by end position,
/// with per-(end, start, LHS, ...) interning for item packing and k-best
/// truncation, and per-end-position queues of complete items driving the
/// completion step.
pub struct Chart {
  /// Top theories kept per chart entry; 0 means pack everything into one.
  kbest: usize,
  /// Drop items whose mask is empty (Viterbi approximation training).
  ignore_empty: bool,
  pub max_pos: usize,
  items: Vec<Item>,
  sets: Vec<Vec<ItemId>>,
  to_comps: Vec<HashMap<u32, Vec<ItemId>>>,
  comps: Vec<BinaryHeap<CompEntry>>,
  predicted: Vec<Vec<bool>>,
  intern: HashMap<ItemKey, Vec<ItemId>>,
  timestamp: usize,
}

impl Chart {
  pub fn new(nonterms: usize, len: usize, kbest: usize, ignore_empty: bool) -> Self {
    Chart {
      kbest,
      ignore_empty,
      max_pos: len,
      items: Vec::new(),
      sets: vec![Vec::new(); len + 1],
      to_comps: vec![HashMap::new(); len + 1],
      comps: (0..=len).map(|_| BinaryHeap::new()).collect(),
      predicted: vec![vec![false; nonterms]; len + 1],
      intern: HashMap::new(),
      timestamp: 0,
    }
  }

  pub fn item(&self, id: ItemId) -> &Item {
    &self.items[id]
  }

  pub fn item_mut(&mut self, id: ItemId) -> &mut Item {
    &mut self.items[id]
  }

  /// Items ending at `pos`, in discovery order.
  pub fn set(&self, pos: usize) -> &[ItemId] {
    &self.sets[pos]
  }

  /// Incomplete items anchored at `start` waiting for an LHS completion.
  pub fn waiting(&self, start: usize, lhs: u32) -> &[ItemId] {
    self
      .to_comps[start]
      .get(&lhs)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  /// Pops the next complete item ending at `pos`, latest start first.
  pub fn pop_complete(&mut self, pos: usize) -> Option<ItemId> {
    self.comps[pos].pop().map(|(_, _, id)| id)
  }

  pub fn is_predicted(&self, pos: usize, lhs: u32) -> bool {
    self.predicted[pos][lhs as usize]
  }

  pub fn mark_predicted(&mut self, pos: usize, lhs: u32) {
    self.predicted[pos][lhs as usize] = true;
  }

  pub fn reset_outer_scores(&mut self) {
    for item in &mut self.items {
      item.outer = f64::NEG_INFINITY;
    }
  }

  /// Adds an item to the chart, packing it into an existing arena slot when
  /// an equal item is present. With `kbest == 0` equal items are merged
  /// (inner scores log-summed, back pointers accumulated); otherwise only
  /// the top `kbest` theories per entry survive, the contents of lower-
  /// ranked slots cascading downward so handles already held in work lists
  /// stay valid. Returns the slot the item landed in, or `None` if it was
  /// pruned.
  pub fn add(&mut self, item: Item) -> Option<ItemId> {
    if self.ignore_empty && item.m.as_ref().is_some_and(|m| m.is_empty()) {
      return None;
    }
    let key = item.key();
    let mut slots = self.intern.remove(&key).unwrap_or_default();
    let result = if self.kbest == 0 {
      match slots.first() {
        None => {
          let id = self.push(item);
          slots.push(id);
          Some(id)
        }
        Some(&id) => {
          let existing = &mut self.items[id];
          existing.inner = log_add(existing.inner, item.inner);
          // each derivation edge appears once; a skip chain re-anchored on
          // a re-derived slot arrives with an edge the slot already has
          for edge in item.back {
            if !existing.back.contains(&edge) {
              existing.back.push(edge);
            }
          }
          Some(id)
        }
      }
    } else {
      let mut i = 0;
      while i < slots.len() && self.items[slots[i]].inner > item.inner {
        i += 1;
      }
      if i >= self.kbest {
        None
      } else if slots.len() < self.kbest {
        let id = self.push(item);
        slots.insert(i, id);
        Some(id)
      } else {
        for j in (i + 1..self.kbest).rev() {
          let (inner, back) = {
            let src = &self.items[slots[j - 1]];
            (src.inner, src.back.clone())
          };
          let dst = &mut self.items[slots[j]];
          dst.inner = inner;
          dst.back = back;
        }
        let id = slots[i];
        let dst = &mut self.items[id];
        dst.inner = item.inner;
        dst.back = item.back;
        Some(id)
      }
    };
    self.intern.insert(key, slots);
    result
  }

  fn push(&mut self, mut item: Item) -> ItemId {
    let id = self.items.len();
    item.timestamp = self.timestamp;
    self.timestamp += 1;
    self.sets[item.current].push(id);
    if item.is_complete() {
      self.comps[item.current].push((item.start, Reverse(item.timestamp), id));
    } else {
      let sym = item.rule.e()[item.dot];
      if sym.is_nonterminal() && item.current < self.max_pos {
        self
          .to_comps[item.current]
          .entry(sym.id())
          .or_default()
          .push(id);
      }
    }
    self.items.push(item);
    id
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dictionary::Dictionary;
  use crate::mrl::ProductionSet;

  fn rule(text: &str, dict: &mut Dictionary, prods: &mut ProductionSet) -> Rc<Rule> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut pos = 0;
    Rc::new(Rule::read(&tokens, &mut pos, dict, prods, false).unwrap())
  }

  #[test]
  fn test_merge_packs_items() {
    let mut dict = Dictionary::new();
    let mut prods = ProductionSet::new();
    let r = rule("*n:Query -> ({ what })({ answer })", &mut dict, &mut prods);

    let mut chart = Chart::new(1, 3, 0, false);
    let mut a = Item::predict(r.clone(), 0);
    a.inner = 0.5_f64.ln();
    let mut b = Item::predict(r.clone(), 0);
    b.inner = 0.25_f64.ln();
    let ia = chart.add(a).unwrap();
    let ib = chart.add(b).unwrap();
    assert_eq!(ia, ib);
    assert!((chart.item(ia).inner.exp() - 0.75).abs() < 1e-12);
    assert_eq!(chart.set(0).len(), 1);
  }

  #[test]
  fn test_merge_keeps_back_edges_unique() {
    let mut dict = Dictionary::new();
    let mut prods = ProductionSet::new();
    let r = rule("*n:Query -> ({ what })({ answer })", &mut dict, &mut prods);

    let mut chart = Chart::new(1, 3, 0, false);
    let mut a = Item::predict(r.clone(), 0);
    a.inner = 0.5_f64.ln();
    a.back = vec![(7, None)]; // marker, not a real handle
    let mut b = Item::predict(r.clone(), 0);
    b.inner = 0.25_f64.ln();
    b.back = vec![(7, None)];
    let ia = chart.add(a).unwrap();
    let ib = chart.add(b).unwrap();
    assert_eq!(ia, ib);
    // the mass merges but the shared edge is not repeated
    assert!((chart.item(ia).inner.exp() - 0.75).abs() < 1e-12);
    assert_eq!(chart.item(ia).back, vec![(7, None)]);
  }

  #[test]
  fn test_kbest_truncation() {
    let mut dict = Dictionary::new();
    let mut prods = ProductionSet::new();
    let r = rule("*n:Query -> ({ what })({ answer })", &mut dict, &mut prods);

    let mut chart = Chart::new(1, 3, 2, false);
    for (i, score) in [-3.0, -1.0, -2.0].into_iter().enumerate() {
      let mut item = Item::predict(r.clone(), 0);
      item.inner = score;
      item.back = vec![(i, None)]; // marker, not a real handle
      chart.add(item);
    }
    // only the top two theories survive; the worst slot's contents were
    // overwritten in place rather than merged
    let set = chart.set(0);
    assert_eq!(set.len(), 2);
    let mut inners: Vec<f64> = set.iter().map(|&id| chart.item(id).inner).collect();
    inners.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(inners, vec![-1.0, -2.0]);
    let worst = set.iter().find(|&&id| chart.item(id).inner == -2.0).unwrap();
    assert_eq!(chart.item(*worst).back, vec![(2, None)]);
  }

  #[test]
  fn test_completion_order_latest_start_first() {
    let mut dict = Dictionary::new();
    let mut prods = ProductionSet::new();
    let r1 = rule("*n:A -> ({ x })({ x })", &mut dict, &mut prods);
    let r2 = rule("*n:B -> ({ y })({ y })", &mut dict, &mut prods);

    let mut chart = Chart::new(2, 4, 0, false);
    let mut early = Item::predict(r1.clone(), 0);
    early.dot = 1;
    early.current = 2;
    early.inner = 0.0;
    let mut late = Item::predict(r2.clone(), 1);
    late.dot = 1;
    late.current = 2;
    late.inner = 0.0;
    let early_id = chart.add(early).unwrap();
    let late_id = chart.add(late).unwrap();
    assert_eq!(chart.pop_complete(2), Some(late_id));
    assert_eq!(chart.pop_complete(2), Some(early_id));
    assert_eq!(chart.pop_complete(2), None);
  }
}
