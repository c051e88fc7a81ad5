use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

use crate::chart::{Chart, Item, ItemId};
use crate::gap::{GapModel, GapOuter};
use crate::grammar::{Grammar, RuleId};
use crate::mask::Mask;
use crate::mrl::{Meaning, Production};
use crate::rules::Rule;
use crate::symbol::Symbol;
use crate::syntree::{Constituent, SynTree, Word};
use crate::utils::log_add;

/// The Earley parser for synchronous context-free grammars.
///
/// One parser drives both decoding and training. Decoding parses an NL
/// sentence alone; training parses it against a gold meaning, threading the
/// derivation-consistency masks through the chart so that one parse yields
/// both the unconstrained total `Z(E)` and the gold-consistent total
/// `Z(E,F)`, and the outside pass turns the same chart into expected rule
/// counts.
pub struct ScfgParser<'a> {
  gram: &'a Grammar,
  gap: &'a GapModel,
  kbest: usize,
  ignore_empty: bool,
  chart: Option<Chart>,
  e: Vec<Symbol>,
  gold: Option<Meaning>,
  masks: Option<MaskTables>,
}

/// One full parse: a complete start-symbol item over the whole sentence.
#[derive(Debug, Clone, Copy)]
pub struct ScfgParse {
  pub score: f64,
  pub item: ItemId,
  /// Set when the parse carries an empty mask, i.e. it derives the sentence
  /// but not the gold meaning. Always false outside training.
  pub empty_mask: bool,
}

/// Expected counts produced by the outside pass, in log domain: one
/// accumulator per rule id (only tied canonical rules receive mass) plus
/// the gap model's split accumulator.
pub struct Expected {
  pub rules: Vec<f64>,
  pub gap: GapOuter,
}

/// The training-time mask lookup tables built from one gold MR parse tree.
struct MaskTables {
  whole: Mask,
  empty: Mask,
  wilds: HashMap<Symbol, Mask>,
  prods: HashMap<Rc<Production>, Mask>,
}

impl MaskTables {
  fn build(f: &Meaning, gram: &Grammar) -> Self {
    let size = f.len();
    let mut whole = Mask::empty(size);
    whole.set(0, true);
    let empty = Mask::empty(size);

    // positions holding the same wildcard-compatible literal share one mask
    let mut wilds: HashMap<Symbol, Mask> = HashMap::new();
    for (i, node) in f.linear.iter().enumerate() {
      if gram.productions().tied(&node.prod, gram.dict()).is_wildcard() {
        let literal = node.prod.rhs()[0];
        wilds
          .entry(literal)
          .or_insert_with(|| Mask::empty(size))
          .set(i, true);
      }
    }

    // per interned production, the gold nodes whose derivation matches its
    // parse shape up to tying
    let mut prods = HashMap::new();
    for prod in gram.productions().iter() {
      let mut m = Mask::empty(size);
      for j in 0..size {
        if gram.productions().matches(prod, f, j, gram.dict()) {
          m.set(j, true);
        }
      }
      if !m.is_empty() {
        prods.insert(prod.clone(), m);
      }
    }
    MaskTables { whole, empty, wilds, prods }
  }

  fn for_production(&self, prod: &Rc<Production>) -> Mask {
    self.prods.get(prod).unwrap_or(&self.empty).clone()
  }

  fn for_scanned_word(&self, word: Symbol) -> &Mask {
    self.wilds.get(&word).unwrap_or(&self.empty)
  }
}

impl<'a> ScfgParser<'a> {
  /// A parser for parameter estimation: everything is packed (`kbest == 0`)
  /// and gold-inconsistent items stay in the chart.
  pub fn new(gram: &'a Grammar, gap: &'a GapModel) -> Self {
    ScfgParser::with_options(gram, gap, 0, false)
  }

  /// A parser for the Viterbi approximation: keeps the top `kbest` theories
  /// per entry and drops items whose mask is empty.
  pub fn viterbi(gram: &'a Grammar, gap: &'a GapModel, kbest: usize) -> Self {
    ScfgParser::with_options(gram, gap, kbest, true)
  }

  /// A parser for decoding with a top-`kbest` cut.
  pub fn decoder(gram: &'a Grammar, gap: &'a GapModel, kbest: usize) -> Self {
    ScfgParser::with_options(gram, gap, kbest, false)
  }

  fn with_options(gram: &'a Grammar, gap: &'a GapModel, kbest: usize, ignore_empty: bool) -> Self {
    ScfgParser {
      gram,
      gap,
      kbest,
      ignore_empty,
      chart: None,
      e: Vec::new(),
      gold: None,
      masks: None,
    }
  }

  pub fn chart(&self) -> &Chart {
    self.chart.as_ref().expect("no sentence has been parsed")
  }

  /// Parses a sentence, against a gold meaning during training. The chart
  /// is kept for [`parses`](Self::parses) and [`outside`](Self::outside)
  /// until the next call.
  pub fn parse(&mut self, e: &[Symbol], f: Option<&Meaning>) {
    self.e = e.to_vec();
    self.gold = f.cloned();
    self.masks = f.map(|f| MaskTables::build(f, self.gram));
    let mut chart = Chart::new(self.gram.count_nonterms(), e.len(), self.kbest, self.ignore_empty);

    let mut root = Item::predict(Rc::new(Rule::dummy(self.gram.start())), 0);
    root.inner = 0.0;
    root.m = self.masks.as_ref().map(|m| m.whole.clone());
    chart.add(root);

    for i in 0..=e.len() {
      if i > 0 {
        self.complete(&mut chart, i);
      }
      if i < e.len() {
        self.predict_and_scan(&mut chart, i);
      }
    }
    tracing::debug!(len = e.len(), items = chart.set(e.len()).len(), "parsed sentence");
    self.chart = Some(chart);
  }

  fn complete(&self, chart: &mut Chart, current: usize) {
    while let Some(comp_id) = chart.pop_complete(current) {
      let (comp_lhs, comp_start) = {
        let comp = chart.item(comp_id);
        if comp.rule.is_dummy() {
          continue;
        }
        (comp.rule.lhs().unwrap(), comp.start)
      };
      let waiting: Vec<ItemId> = chart.waiting(comp_start, comp_lhs).to_vec();
      for back_id in waiting {
        let next = {
          let back = chart.item(back_id);
          let comp = chart.item(comp_id);
          let mut next = Item::complete(back_id, back, comp_id, comp);
          if self.masks.is_some() {
            next.m = Some(self.m_complete(back, comp));
          }
          next.inner = back.inner + comp.inner;
          next
        };
        let inner = next.inner;
        if let Some(id) = chart.add(next) {
          self.skip_words(chart, id, inner);
        }
      }
    }
  }

  /// Mask propagation at completion: under the dummy root, plain
  /// intersection; otherwise each surviving parent bit must see the child's
  /// mask set at the gold node reached by the completed coindex's frontier
  /// path.
  fn m_complete(&self, back: &Item, comp: &Item) -> Mask {
    let gold = self.gold.as_ref().unwrap();
    let bm = back.m.as_ref().unwrap();
    let cm = comp.m.as_ref().unwrap();
    if back.rule.is_dummy() {
      return bm.intersect(cm);
    }
    let path = back.rule.path(back.rule.e()[back.dot].index());
    let mut m = bm.clone();
    for i in bm.ones() {
      let j = gold.descend(i, path);
      if !cm.get(j) {
        m.set(i, false);
      }
    }
    m
  }

  /// Extends skip items through the word gap left of `start_id`'s dot.
  /// `inner` is the inside mass of the derivation just merged into
  /// `start_id`, not the slot total: a packed slot can be derived several
  /// times, and each chain carries only the mass of the derivation that
  /// triggered it.
  fn skip_words(&self, chart: &mut Chart, start_id: ItemId, mut inner: f64) {
    let (gap, mut current) = {
      let item = chart.item(start_id);
      (item.rule.gap(item.dot - 1) as usize, item.current)
    };
    let mut id = start_id;
    for _ in 0..gap {
      if current >= self.e.len() {
        break;
      }
      let next = {
        let item = chart.item(id);
        let mut next = Item::skip(id, item);
        next.m = item.m.clone();
        next.inner = inner + self.gap.weight(self.e[current].id());
        next
      };
      let contributed = next.inner;
      match chart.add(next) {
        Some(next_id) => {
          id = next_id;
          inner = contributed;
          current += 1;
        }
        None => break,
      }
    }
  }

  fn predict_and_scan(&self, chart: &mut Chart, current: usize) {
    let mut idx = 0;
    while idx < chart.set(current).len() {
      let id = chart.set(current)[idx];
      idx += 1;
      let (rule, dot) = {
        let item = chart.item(id);
        (item.rule.clone(), item.dot)
      };
      if dot == rule.len_e() {
        continue;
      }
      let sym = rule.e()[dot];
      if sym.is_nonterminal() {
        self.predict(chart, current, sym.id());
      } else if sym.matches(&self.e[current], self.gram.dict()) {
        self.scan(chart, id, current);
      }
    }
  }

  fn predict(&self, chart: &mut Chart, current: usize, wanted: u32) {
    for j in 0..self.gram.count_nonterms() as u32 {
      if self.gram.is_left_corner_for_e(wanted, j) && !chart.is_predicted(current, j) {
        chart.mark_predicted(current, j);
        for &rid in self.gram.rules_for(j) {
          if self.gram.is_active(rid) {
            let rule = self.gram.rule(rid).clone();
            let mut next = Item::predict(rule, current);
            if let Some(masks) = &self.masks {
              next.m = Some(masks.for_production(self.gram.rule(rid).production()));
            }
            next.inner = self.gram.weight(rid);
            chart.add(next);
          }
        }
      }
    }
  }

  fn scan(&self, chart: &mut Chart, id: ItemId, current: usize) {
    let word = self.e[current];
    let next = {
      let back = chart.item(id);
      let rule = if back.rule.is_wildcard() {
        Rc::new(Rule::specialize(&back.rule, word, self.gram.dict()))
      } else {
        back.rule.clone()
      };
      let mut next = Item::scan(id, back, rule);
      if let Some(masks) = &self.masks {
        let bm = back.m.as_ref().unwrap();
        next.m = Some(if back.rule.is_wildcard() {
          masks.for_scanned_word(word).intersect(bm)
        } else {
          bm.clone()
        });
      }
      next.inner = back.inner;
      next
    };
    let inner = next.inner;
    if let Some(next_id) = chart.add(next) {
      self.skip_words(chart, next_id, inner);
    }
  }

  fn is_full_parse(&self, item: &Item) -> bool {
    item.start == 0 && item.is_complete() && item.rule.lhs() == Some(self.gram.start())
  }

  /// The full parses of the last sentence, rank-ordered and cut to the
  /// top `kbest` when one was requested. Restartable: each call walks the
  /// chart afresh.
  pub fn parses(&self) -> Parses<'_> {
    let chart = self.chart();
    let mut ids: Vec<ItemId> = chart
      .set(chart.max_pos)
      .iter()
      .copied()
      .filter(|&id| self.is_full_parse(chart.item(id)))
      .collect();
    if self.kbest > 0 {
      ids.sort_by(|&a, &b| {
        chart
          .item(b)
          .inner
          .partial_cmp(&chart.item(a).inner)
          .unwrap()
          .then(chart.item(a).timestamp.cmp(&chart.item(b).timestamp))
      });
      ids.truncate(self.kbest);
    }
    Parses { chart, ids: ids.into_iter() }
  }

  /// The outside algorithm over the last chart. With `ignore_empty`, outer
  /// scores are seeded only from gold-consistent parses, so the expected
  /// counts condition on the gold meaning; otherwise they condition on the
  /// sentence alone.
  pub fn outside(&mut self, ignore_empty: bool) -> Expected {
    let mut chart = self.chart.take().expect("no sentence has been parsed");
    let mut expected = Expected {
      rules: vec![f64::NEG_INFINITY; self.gram.count_rules()],
      gap: GapOuter::new(),
    };
    chart.reset_outer_scores();

    let full: Vec<ItemId> = chart
      .set(chart.max_pos)
      .iter()
      .copied()
      .filter(|&id| {
        let item = chart.item(id);
        self.is_full_parse(item)
          && !(ignore_empty && item.m.as_ref().is_some_and(|m| m.is_empty()))
      })
      .collect();
    for id in full {
      chart.item_mut(id).outer = 0.0;
    }

    for i in (1..=chart.max_pos).rev() {
      self.reverse_complete(&mut chart, i);
      self.reverse_scan(&mut chart, i, &mut expected.gap);
    }

    for i in 0..chart.max_pos {
      for &id in chart.set(i) {
        let item = chart.item(id);
        if item.is_predict_step() && !item.rule.is_dummy() {
          if let Some(tid) = self.gram.tied_id(&item.rule) {
            expected.rules[tid] = log_add(expected.rules[tid], item.outer);
          }
        }
      }
    }
    self.chart = Some(chart);
    expected
  }

  /// Pushes outer scores from completed items back to both derivation
  /// siblings. Items pop earliest-start-first (ties: latest discovery
  /// first), so a parent is drained before any item it feeds.
  fn reverse_complete(&self, chart: &mut Chart, current: usize) {
    let mut heap: BinaryHeap<(Reverse<usize>, usize, ItemId)> = BinaryHeap::new();
    for &id in chart.set(current) {
      let item = chart.item(id);
      if item.is_complete_step() {
        heap.push((Reverse(item.start), item.timestamp, id));
      }
    }
    while let Some((_, _, id)) = heap.pop() {
      let outer = chart.item(id).outer;
      let backs = chart.item(id).back.clone();
      for (back_id, comp_id) in backs {
        let comp_id = comp_id.expect("completion entry lost its child");
        let comp_inner = chart.item(comp_id).inner;
        let back_inner = chart.item(back_id).inner;
        let back = chart.item_mut(back_id);
        back.outer = log_add(back.outer, outer + comp_inner);
        let comp = chart.item_mut(comp_id);
        comp.outer = log_add(comp.outer, outer + back_inner);
      }
    }
  }

  /// Pushes outer scores through scan and word-skip steps. A skip step adds
  /// the gap weight of the skipped word and feeds the gap model's expected
  /// counts.
  fn reverse_scan(&self, chart: &mut Chart, current: usize, gap_out: &mut GapOuter) {
    let ids: Vec<ItemId> = chart.set(current).to_vec();
    for id in ids {
      let item = chart.item(id);
      if !item.is_scan_step() {
        continue;
      }
      let outer = item.outer;
      let dot = item.dot;
      let backs = item.back.clone();
      for (back_id, _) in backs {
        let (back_dot, back_current, back_inner) = {
          let back = chart.item(back_id);
          (back.dot, back.current, back.inner)
        };
        if back_dot == dot {
          // word gap
          let word = self.e[back_current].id();
          let w = self.gap.weight(word);
          let back = chart.item_mut(back_id);
          back.outer = log_add(back.outer, outer + w);
          self.gap.add_outer(word, outer + back_inner + w, gap_out);
        } else {
          let back = chart.item_mut(back_id);
          back.outer = log_add(back.outer, outer);
        }
      }
    }
  }

  /// The NL parse tree of a full parse: constituents labeled with
  /// nonterminal names, leaves for scanned and gap-skipped words alike, so
  /// the frontier spells out the sentence.
  pub fn nl_tree(&self, id: ItemId) -> SynTree<String, String> {
    let item = self.chart().item(id);
    let label = match item.rule.lhs() {
      Some(lhs) => self.gram.dict().nonterm_str(lhs).to_string(),
      None => "-".to_string(),
    };
    SynTree::Branch(
      Constituent { value: label, span: (item.start, item.current) },
      self.nl_children(id),
    )
  }

  fn nl_children(&self, id: ItemId) -> Vec<SynTree<String, String>> {
    let chart = self.chart();
    let item = chart.item(id);
    let Some(&(back_id, comp)) = item.back.first() else {
      return Vec::new();
    };
    let mut children = self.nl_children(back_id);
    match comp {
      Some(comp_id) => children.push(self.nl_tree(comp_id)),
      None => {
        let pos = item.current - 1;
        let word = self.gram.dict().term_str(self.e[pos].id()).to_string();
        children.push(SynTree::Leaf(Word { value: word, span: (pos, pos + 1) }));
      }
    }
    children
  }

  /// The MR parse tree of a full parse: one node per rule application,
  /// labeled with the rule's production, children in frontier-argument
  /// order.
  pub fn mr_tree(&self, id: ItemId) -> SynTree<Rc<Production>, Rc<Production>> {
    let chart = self.chart();
    let item = chart.item(id);
    let span = (item.start, item.current);
    let prod = item.rule.production().clone();
    let mut children: Vec<Option<SynTree<Rc<Production>, Rc<Production>>>> =
      vec![None; item.rule.count_args()];
    let mut cur = id;
    loop {
      let Some(&(back_id, comp)) = chart.item(cur).back.first() else {
        break;
      };
      if let Some(comp_id) = comp {
        let back = chart.item(back_id);
        let index = back.rule.e()[back.dot].index();
        children[coindex_arg(&back.rule, index)] = Some(self.mr_tree(comp_id));
      }
      cur = back_id;
    }
    if children.is_empty() {
      SynTree::Leaf(Word { value: prod, span })
    } else {
      let children = children
        .into_iter()
        .map(|c| c.expect("complete item is missing an argument"))
        .collect();
      SynTree::Branch(Constituent { value: prod, span }, children)
    }
  }

  /// Collects the tied ids of every rule used in a parse's derivation, for
  /// the Viterbi-approximation pruning pass.
  pub fn mark_rules(&self, id: ItemId, marked: &mut HashSet<RuleId>) {
    let chart = self.chart();
    if let Some(tid) = self.gram.tied_id(&chart.item(id).rule) {
      marked.insert(tid);
    }
    let mut cur = id;
    loop {
      let Some(&(back_id, comp)) = chart.item(cur).back.first() else {
        break;
      };
      if let Some(comp_id) = comp {
        self.mark_rules(comp_id, marked);
      }
      cur = back_id;
    }
  }
}

/// Frontier-argument position of the MR-side nonterminal carrying a
/// coindex.
fn coindex_arg(rule: &Rule, index: u16) -> usize {
  rule
    .f()
    .iter()
    .filter(|s| s.is_indexable())
    .position(|s| s.index() == index)
    .expect("coindex without an MR-side twin")
}

/// Rank-ordered full parses of the last sentence.
pub struct Parses<'a> {
  chart: &'a Chart,
  ids: std::vec::IntoIter<ItemId>,
}

impl Iterator for Parses<'_> {
  type Item = ScfgParse;

  fn next(&mut self) -> Option<ScfgParse> {
    let id = self.ids.next()?;
    let item = self.chart.item(id);
    Some(ScfgParse {
      score: item.inner,
      item: id,
      empty_mask: item.m.as_ref().is_some_and(|m| m.is_empty()),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mrl::GoldTree;

  fn words(gram: &mut Grammar, sentence: &[&str]) -> Vec<Symbol> {
    let mut e = vec![Symbol::boundary()];
    e.extend(
      sentence
        .iter()
        .map(|w| Symbol::terminal(gram.dict_mut().term(w, true))),
    );
    e.push(Symbol::boundary());
    e
  }

  fn geo_grammar() -> Grammar {
    "
start *n:Query
*n:Query -> ({ answer *n:City })
*n:City -> ({ capital *n:State })
*n:City -> ({ *t:Ident })
*n:State -> ({ *t:Ident })
*n:Query -> ({ *t:Bound what is *n:City#1 *t:Bound })({ answer *n:City#1 })
*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })
"
    .parse()
    .unwrap()
  }

  #[test]
  fn test_decode_reconstructs_sentence() {
    let mut gram = geo_grammar();
    let gap = GapModel::new();
    let e = words(&mut gram, &["what", "is", "the", "capital", "of", "'texas'"]);
    let mut parser = ScfgParser::decoder(&gram, &gap, 5);
    parser.parse(&e, None);
    let parses: Vec<ScfgParse> = parser.parses().collect();
    assert_eq!(parses.len(), 1);

    let nl = parser.nl_tree(parses[0].item);
    let leaves: Vec<String> = nl.leaves().iter().map(|w| w.value.clone()).collect();
    assert_eq!(
      leaves,
      vec!["*t:Bound", "what", "is", "the", "capital", "of", "'texas'", "*t:Bound"]
    );

    let mr = parser.mr_tree(parses[0].item);
    let (root, children) = mr.get_branch().unwrap();
    assert_eq!(root.value.lhs(), Some(gram.start()));
    assert_eq!(children.len(), 1);
  }

  #[test]
  fn test_no_parse_is_empty_sequence() {
    let mut gram = geo_grammar();
    let gap = GapModel::new();
    let e = words(&mut gram, &["colorless", "green", "ideas"]);
    let mut parser = ScfgParser::decoder(&gram, &gap, 5);
    parser.parse(&e, None);
    assert_eq!(parser.parses().count(), 0);
  }

  #[test]
  fn test_wildcard_passthrough_single_parse() {
    let mut gram: Grammar = "
start *n:City
*n:City -> ({ *t:Any })
"
    .parse()
    .unwrap();
    let gap = GapModel::new();
    let e: Vec<Symbol> = vec![Symbol::terminal(gram.dict_mut().term("city", true))];
    let mut parser = ScfgParser::decoder(&gram, &gap, 5);
    parser.parse(&e, None);
    let parses: Vec<ScfgParse> = parser.parses().collect();
    assert_eq!(parses.len(), 1);
    let mr = parser.mr_tree(parses[0].item);
    let leaf = mr.get_leaf().unwrap();
    assert_eq!(leaf.value.lhs(), Some(gram.start()));
    assert!(!leaf.value.is_wildcard());
  }

  #[test]
  fn test_word_gap_skipping() {
    let mut gram: Grammar = "
start *n:Query
*n:Query -> ({ answer })
*n:Query -> ({ answer *g:1 })({ answer })
"
    .parse()
    .unwrap();
    let mut gap = GapModel::new();
    gap.set_weight_vector(gram.dict(), &[-0.5, 0.0]);
    // "answer please": the trailing word is only reachable via the gap
    let sentence = vec![
      Symbol::terminal(gram.dict_mut().term("answer", true)),
      Symbol::terminal(gram.dict_mut().term("please", true)),
    ];
    let mut parser = ScfgParser::decoder(&gram, &gap, 5);
    parser.parse(&sentence, None);
    let parses: Vec<ScfgParse> = parser.parses().collect();
    assert_eq!(parses.len(), 1);
    // the skipped word costs one gap weight
    assert!((parses[0].score - gap.weight(sentence[1].id())).abs() < 1e-12);
    let nl = parser.nl_tree(parses[0].item);
    assert_eq!(nl.leaves().len(), 2);
  }

  #[test]
  fn test_merged_item_skips_each_derivation_once() {
    // *n:A derives "w" two ways, so the packed Query item holding it is
    // derived twice; the skip chain over "u" must carry exactly that mass
    let mut gram: Grammar = "
start *n:Query
*n:A -> ({ w })
*n:A -> ({ w })({ w })
*n:A -> ({ *t:Any })
*n:Query -> ({ *n:A#1 *g:1 z })({ ans *n:A#1 })
"
    .parse()
    .unwrap();
    let gap = GapModel::new();
    let sentence = vec![
      Symbol::terminal(gram.dict_mut().term("w", true)),
      Symbol::terminal(gram.dict_mut().term("u", true)),
      Symbol::terminal(gram.dict_mut().term("z", true)),
    ];
    let mut parser = ScfgParser::new(&gram, &gap);
    parser.parse(&sentence, None);
    let mut z = f64::NEG_INFINITY;
    for p in parser.parses() {
      z = log_add(z, p.score);
    }
    // two derivations at weight zero: total mass is exactly 2
    assert!((z - 2.0_f64.ln()).abs() < 1e-9);
    // the top rule is used once in each derivation, so its expected count
    // matches the total mass
    let expected = parser.outside(false);
    let top = gram
      .read_rule("*n:Query -> ({ *n:A#1 *g:1 z })({ ans *n:A#1 })", true)
      .unwrap();
    assert!((expected.rules[top] - 2.0_f64.ln()).abs() < 1e-9);
  }

  #[test]
  fn test_mask_monotonicity() {
    let mut gram = geo_grammar();
    // an ambiguous extra rule that parses the same sentence to a different MR
    gram
      .read_rule("*n:Query -> ({ *t:Bound what is *n:State#1 *t:Bound })({ answer *n:State#1 })", true)
      .unwrap();
    gram
      .read_rule("*n:State -> ({ the capital of *n:State#1 })({ capital *n:State#1 })", true)
      .unwrap();
    let gap = GapModel::new();
    let e = words(&mut gram, &["what", "is", "the", "capital", "of", "'texas'"]);
    let f = gold_capital_of_texas(&mut gram);

    let mut parser = ScfgParser::new(&gram, &gap);
    parser.parse(&e, Some(&f));
    let mut z_e = f64::NEG_INFINITY;
    let mut z_ef = f64::NEG_INFINITY;
    for parse in parser.parses() {
      z_e = log_add(z_e, parse.score);
      if !parse.empty_mask {
        z_ef = log_add(z_ef, parse.score);
      }
    }
    assert!(z_ef > f64::NEG_INFINITY);
    assert!(z_ef <= z_e + 1e-12);
    // the ambiguous reading is not gold-consistent, so the bound is strict
    assert!(z_ef < z_e);
  }

  /// answer(capital('texas')) built over the Query/City/State productions.
  fn gold_capital_of_texas(gram: &mut Grammar) -> Meaning {
    let dict = gram.dict_mut();
    let q = dict.nonterm("Query");
    let c = dict.nonterm("City");
    let s = dict.nonterm("State");
    let answer = dict.term("answer", false);
    let capital = dict.term("capital", false);
    let texas = dict.term("'texas'", false);

    let prods = gram.productions_mut();
    let top = prods
      .add(crate::mrl::Production::original(
        q,
        vec![Symbol::terminal(answer), Symbol::nonterminal(c)],
      ))
      .0;
    let mid = prods
      .add(crate::mrl::Production::original(
        c,
        vec![Symbol::terminal(capital), Symbol::nonterminal(s)],
      ))
      .0;
    let wild = prods
      .add(crate::mrl::Production::original(s, vec![Symbol::wildcard_ident()]))
      .0;
    let leaf = Rc::new(crate::mrl::Production::specialize(
      &wild,
      Symbol::terminal(texas),
      gram.dict(),
    ));
    Meaning::from_gold(&GoldTree::new(
      top,
      vec![GoldTree::new(mid, vec![GoldTree::leaf(leaf)])],
    ))
  }

  #[test]
  fn test_outside_expected_counts_sum_to_parses() {
    // with a single unambiguous parse, every used rule's expected count
    // equals the parse probability mass assigned to it
    let mut gram = geo_grammar();
    let gap = GapModel::new();
    let e = words(&mut gram, &["what", "is", "the", "capital", "of", "'texas'"]);
    let f = gold_capital_of_texas(&mut gram);
    let mut parser = ScfgParser::new(&gram, &gap);
    parser.parse(&e, Some(&f));
    let z: f64 = {
      let mut z = f64::NEG_INFINITY;
      for p in parser.parses() {
        z = log_add(z, p.score);
      }
      z
    };
    // all weights are zero and the derivation is unique, so z = log 1
    assert!(z.abs() < 1e-12);
    let expected = parser.outside(false);
    // every rule on the derivation has expected count 1
    let top = gram
      .read_rule("*n:Query -> ({ *t:Bound what is *n:City#1 *t:Bound })({ answer *n:City#1 })", true)
      .unwrap();
    let city = gram
      .read_rule("*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })", true)
      .unwrap();
    let wild = gram
      .read_rule("*n:State -> ({ *t:Ident#1 })({ *t:Ident#1 })", true)
      .unwrap();
    for id in [top, city, wild] {
      assert!(expected.rules[id].abs() < 1e-9);
    }
    // rules never predicted stay at log 0
    let unused = gram.read_rule("*n:City -> ({ *t:Ident#1 })({ *t:Ident#1 })", true).unwrap();
    assert_eq!(expected.rules[unused], f64::NEG_INFINITY);
  }

  #[test]
  fn test_viterbi_mark_rules() {
    let mut gram = geo_grammar();
    let gap = GapModel::new();
    let e = words(&mut gram, &["what", "is", "the", "capital", "of", "'texas'"]);
    let f = gold_capital_of_texas(&mut gram);
    let mut parser = ScfgParser::viterbi(&gram, &gap, 1);
    parser.parse(&e, Some(&f));
    let mut marked = HashSet::new();
    for p in parser.parses() {
      parser.mark_rules(p.item, &mut marked);
    }
    // the top rule, the capital rule, and the State wildcard rule
    assert_eq!(marked.len(), 3);
    let wild_state = gram
      .read_rule("*n:State -> ({ *t:Ident#1 })({ *t:Ident#1 })", true)
      .unwrap();
    assert!(marked.contains(&wild_state));
  }
}
