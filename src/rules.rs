use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::dictionary::Dictionary;
use crate::mrl::{Production, ProductionSet};
use crate::symbol::Symbol;

/// A rule of a synchronous context-free grammar: one LHS nonterminal
/// rewriting simultaneously to an NL pattern and an MR string. Co-indexed
/// nonterminals on the two sides expand in lockstep.
///
/// Rules are immutable and interned; their weights and active flags live in
/// the owning [`Grammar`](crate::grammar::Grammar).
#[derive(Debug)]
pub struct Rule {
  lhs: Option<u32>,
  /// The NL pattern, with co-indices.
  e: Vec<Symbol>,
  /// Word-gap size to the right of each NL symbol.
  gaps: Vec<u16>,
  /// The MR string, with co-indices.
  f: Vec<Symbol>,
  /// The MR production this rule writes.
  prod: Rc<Production>,
  init: bool,
  ngaps: u16,
}

impl PartialEq for Rule {
  fn eq(&self, other: &Self) -> bool {
    self.lhs == other.lhs && self.e == other.e && self.gaps == other.gaps && self.f == other.f
  }
}

impl Eq for Rule {}

impl Hash for Rule {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.lhs.hash(state);
    self.e.hash(state);
    self.gaps.hash(state);
    self.f.hash(state);
  }
}

impl Rule {
  /// Builds a rule around an interned production. The MR side is the
  /// production's RHS with fresh co-indices 1, 2, ... on its indexable
  /// symbols; `e` must use the same indices.
  pub fn new(prod: Rc<Production>, e: Vec<Symbol>, gaps: Vec<u16>, init: bool) -> Self {
    assert_eq!(e.len(), gaps.len());
    let mut next = 1;
    let f = prod
      .rhs()
      .iter()
      .map(|&sym| {
        if sym.is_indexable() {
          let indexed = sym.with_index(next);
          next += 1;
          indexed
        } else {
          sym
        }
      })
      .collect();
    let ngaps = count_gaps(&gaps);
    Rule { lhs: prod.lhs(), e, gaps, f, prod, init, ngaps }
  }

  /// Builds a rule from both sides as read from text, interning the
  /// production for the MR side if it is not known yet.
  pub fn from_parts(
    lhs: u32,
    e: Vec<Symbol>,
    gaps: Vec<u16>,
    f: Vec<Symbol>,
    prods: &mut ProductionSet,
    init: bool,
  ) -> Self {
    assert_eq!(e.len(), gaps.len());
    let prod = prods.add(Production::original(lhs, f.clone())).0;
    let ngaps = count_gaps(&gaps);
    Rule { lhs: Some(lhs), e, gaps, f, prod, init, ngaps }
  }

  /// The dummy rule that seeds the parse chart. It has no LHS and carries no
  /// weight; completed parses are read off just below it.
  pub fn dummy(rhs: u32) -> Self {
    let nt = Symbol::nonterminal(rhs).with_index(1);
    Rule {
      lhs: None,
      e: vec![nt],
      gaps: vec![0],
      f: vec![nt],
      prod: Rc::new(Production::dummy(rhs)),
      init: false,
      ngaps: 0,
    }
  }

  /// Specializes a wildcard rule by substituting a matching input terminal
  /// on both sides. The result is not interned; it ties back to `rule`.
  pub fn specialize(rule: &Rule, term: Symbol, dict: &Dictionary) -> Self {
    assert!(
      rule.is_wildcard() && rule.e[0].matches(&term, dict),
      "cannot specialize a non-wildcard rule"
    );
    let term = term.with_index(0);
    Rule {
      lhs: rule.lhs,
      e: vec![term],
      gaps: vec![0],
      f: vec![term],
      prod: Rc::new(Production::specialize(&rule.prod, term, dict)),
      init: false,
      ngaps: 0,
    }
  }

  /// The LHS nonterminal; `None` for the dummy rule.
  pub fn lhs(&self) -> Option<u32> {
    self.lhs
  }

  pub fn e(&self) -> &[Symbol] {
    &self.e
  }

  pub fn f(&self) -> &[Symbol] {
    &self.f
  }

  pub fn len_e(&self) -> usize {
    self.e.len()
  }

  pub fn len_f(&self) -> usize {
    self.f.len()
  }

  /// Word-gap size to the right of the i-th NL symbol.
  pub fn gap(&self, i: usize) -> u16 {
    self.gaps[i]
  }

  pub fn gaps(&self) -> &[u16] {
    &self.gaps
  }

  /// Number of non-zero word gaps.
  pub fn count_gaps(&self) -> u16 {
    self.ngaps
  }

  pub fn production(&self) -> &Rc<Production> {
    &self.prod
  }

  pub fn is_init(&self) -> bool {
    self.init
  }

  pub fn has_args(&self) -> bool {
    self.prod.has_args()
  }

  pub fn count_args(&self) -> usize {
    self.prod.count_args()
  }

  pub fn is_unary(&self) -> bool {
    self.e.len() == 1 && self.e[0].is_nonterminal() && self.prod.is_unary()
  }

  pub fn is_wildcard(&self) -> bool {
    self.e.len() == 1 && self.e[0].is_wildcard() && self.prod.is_wildcard()
  }

  pub fn is_dummy(&self) -> bool {
    self.lhs.is_none()
  }

  /// Child-index path from the MR parse root to the frontier nonterminal
  /// with the given co-index.
  pub fn path(&self, index: u16) -> &[usize] {
    self.prod.path(index as usize - 1)
  }

  pub fn display<'a>(&'a self, dict: &'a Dictionary) -> RuleDisplay<'a> {
    RuleDisplay { rule: self, dict }
  }

  /// Reads a rule from whitespace-split tokens starting at `*pos`:
  ///
  /// ```text
  /// *n:LHS -> ({ E-symbols, each optionally followed by *g:N })({ F-symbols })
  /// ```
  ///
  /// On success `*pos` is left just past the closing `})`. On failure `None`
  /// is returned and `*pos` is unchanged.
  pub fn read(
    tokens: &[&str],
    pos: &mut usize,
    dict: &mut Dictionary,
    prods: &mut ProductionSet,
    init: bool,
  ) -> Option<Rule> {
    let mut i = *pos;
    let lhs_tok = tokens.get(i)?.strip_prefix("*n:")?;
    let lhs = dict.nonterm(lhs_tok);
    i += 1;
    if tokens.get(i) != Some(&"->") {
      return None;
    }
    i += 1;
    if tokens.get(i) != Some(&"({") {
      return None;
    }
    i += 1;
    let mut e = Vec::new();
    let mut gaps: Vec<u16> = Vec::new();
    while i < tokens.len() && tokens[i] != "})({" {
      if let Some(n) = tokens[i].strip_prefix("*g:") {
        let last = gaps.last_mut()?;
        *last = n.parse().ok()?;
      } else {
        e.push(Symbol::read(tokens[i], dict, true)?);
        gaps.push(0);
      }
      i += 1;
    }
    if i >= tokens.len() {
      return None;
    }
    i += 1;
    let mut f = Vec::new();
    while i < tokens.len() && tokens[i] != "})" {
      f.push(Symbol::read(tokens[i], dict, false)?);
      i += 1;
    }
    if i >= tokens.len() {
      return None;
    }
    *pos = i + 1;
    Some(Rule::from_parts(lhs, e, gaps, f, prods, init))
  }
}

fn count_gaps(gaps: &[u16]) -> u16 {
  gaps.iter().filter(|&&g| g > 0).count() as u16
}

pub struct RuleDisplay<'a> {
  rule: &'a Rule,
  dict: &'a Dictionary,
}

impl fmt::Display for RuleDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.rule.lhs {
      Some(lhs) => write!(f, "*n:{}", self.dict.nonterm_str(lhs))?,
      None => write!(f, "*n:-")?,
    }
    write!(f, " -> ({{")?;
    for (i, sym) in self.rule.e.iter().enumerate() {
      write!(f, " {}", sym.display(self.dict))?;
      if self.rule.gaps[i] > 0 {
        write!(f, " *g:{}", self.rule.gaps[i])?;
      }
    }
    write!(f, " }})({{")?;
    for sym in &self.rule.f {
      write!(f, " {}", sym.display(self.dict))?;
    }
    write!(f, " }})")
  }
}
