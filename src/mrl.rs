use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::dictionary::Dictionary;
use crate::symbol::Symbol;

/// A production of the meaning-representation grammar.
///
/// Productions come in three kinds: *original* productions of the
/// hand-written unambiguous MR grammar, wildcard *specializations* (the
/// wildcard on the RHS replaced by a literal terminal), and *derived*
/// combinations created by merging a production with one of its arguments.
/// Structurally equal productions are interned and shared.
#[derive(Debug)]
pub struct Production {
  lhs: Option<u32>,
  rhs: Vec<Symbol>,
  orig: bool,
  /// Argument (nonterminal) ids in left-to-right RHS order.
  args: Vec<u32>,
  /// Parse of the RHS under the original MR grammar. `None` means the parse
  /// is a single node labeled by this production itself, with one frontier
  /// hole per argument. Derived productions carry a multi-node shape.
  shape: Option<MrShape>,
  /// Child-index paths from the parse root to each frontier hole.
  paths: Vec<Vec<usize>>,
}

/// Parse shape of a derived production's RHS: internal nodes are original
/// productions, leaves are unfilled argument slots.
#[derive(Debug, Clone)]
pub enum MrShape {
  Sub(Rc<Production>, Vec<MrShape>),
  Hole(u32),
}

impl PartialEq for Production {
  fn eq(&self, other: &Self) -> bool {
    self.lhs == other.lhs && self.rhs == other.rhs
  }
}

impl Eq for Production {}

impl Hash for Production {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.lhs.hash(state);
    self.rhs.hash(state);
  }
}

impl Production {
  /// A production of the original, unambiguous MR grammar. Co-indices on
  /// `rhs` are ignored; productions are index-free.
  pub fn original(lhs: u32, rhs: Vec<Symbol>) -> Self {
    let rhs: Vec<Symbol> = rhs.into_iter().map(|s| s.with_index(0)).collect();
    let args: Vec<u32> = rhs.iter().filter(|s| s.is_nonterminal()).map(|s| s.id()).collect();
    let paths = (0..args.len()).map(|i| vec![i]).collect();
    Production {
      lhs: Some(lhs),
      rhs,
      orig: true,
      args,
      shape: None,
      paths,
    }
  }

  /// The dummy production used only by the parser's root item.
  pub fn dummy(rhs: u32) -> Self {
    Production {
      lhs: None,
      rhs: vec![Symbol::nonterminal(rhs)],
      orig: false,
      args: vec![rhs],
      shape: None,
      paths: vec![vec![0]],
    }
  }

  /// Specializes a wildcard production by substituting a literal terminal.
  /// Callers must only specialize wildcard productions with a matching
  /// terminal; anything else is a contract violation.
  pub fn specialize(prod: &Production, term: Symbol, dict: &Dictionary) -> Self {
    assert!(
      prod.is_wildcard() && prod.rhs[0].matches(&term, dict),
      "cannot specialize a non-wildcard production"
    );
    Production {
      lhs: prod.lhs,
      rhs: vec![term.with_index(0)],
      orig: false,
      args: Vec::new(),
      shape: None,
      paths: Vec::new(),
    }
  }

  pub fn lhs(&self) -> Option<u32> {
    self.lhs
  }

  pub fn rhs(&self) -> &[Symbol] {
    &self.rhs
  }

  pub fn is_orig(&self) -> bool {
    self.orig
  }

  pub fn args(&self) -> &[u32] {
    &self.args
  }

  pub fn count_args(&self) -> usize {
    self.args.len()
  }

  pub fn has_args(&self) -> bool {
    !self.args.is_empty()
  }

  /// Child-index path from the parse root to the i-th frontier hole.
  pub fn path(&self, i: usize) -> &[usize] {
    &self.paths[i]
  }

  pub fn is_unary(&self) -> bool {
    self.rhs.len() == 1 && self.rhs[0].is_nonterminal()
  }

  pub fn is_wildcard(&self) -> bool {
    self.rhs.len() == 1 && self.rhs[0].is_wildcard()
  }

  pub fn is_dummy(&self) -> bool {
    self.lhs.is_none()
  }

  pub fn shape(&self) -> Option<&MrShape> {
    self.shape.as_ref()
  }

  pub fn display<'a>(&'a self, dict: &'a Dictionary) -> ProductionDisplay<'a> {
    ProductionDisplay { prod: self, dict }
  }
}

pub struct ProductionDisplay<'a> {
  prod: &'a Production,
  dict: &'a Dictionary,
}

impl fmt::Display for ProductionDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.prod.lhs {
      Some(lhs) => write!(f, "*n:{}", self.dict.nonterm_str(lhs))?,
      None => write!(f, "*n:-")?,
    }
    write!(f, " -> ({{")?;
    for sym in &self.prod.rhs {
      write!(f, " {}", sym.display(self.dict))?;
    }
    write!(f, " }})")
  }
}

/// The interning table for productions: structurally equal productions share
/// one `Rc`, so handle comparison implies structural equality.
#[derive(Debug, Default)]
pub struct ProductionSet {
  prods: Vec<Rc<Production>>,
  ids: HashMap<Rc<Production>, usize>,
}

impl ProductionSet {
  pub fn new() -> Self {
    ProductionSet::default()
  }

  /// Interns a production. Returns the canonical copy and whether it was
  /// newly added.
  pub fn add(&mut self, prod: Production) -> (Rc<Production>, bool) {
    if let Some(&id) = self.ids.get(&prod) {
      return (self.prods[id].clone(), false);
    }
    let rc = Rc::new(prod);
    self.ids.insert(rc.clone(), self.prods.len());
    self.prods.push(rc.clone());
    (rc, true)
  }

  /// Returns the interned copy of a production, if one exists.
  pub fn intern(&self, prod: &Production) -> Option<Rc<Production>> {
    self.ids.get(prod).map(|&id| self.prods[id].clone())
  }

  pub fn len(&self) -> usize {
    self.prods.len()
  }

  pub fn is_empty(&self) -> bool {
    self.prods.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Rc<Production>> {
    self.prods.iter()
  }

  /// The canonical production that `prod` shares a parse shape with: for a
  /// literal specialization of a wildcard (a number, unit number or
  /// identifier RHS), the interned wildcard production; otherwise the
  /// interned copy of `prod` itself.
  pub fn tied(&self, prod: &Rc<Production>, dict: &Dictionary) -> Rc<Production> {
    if prod.rhs.len() == 1 && prod.rhs[0].is_terminal() && !prod.rhs[0].is_wildcard() {
      if let Some(lhs) = prod.lhs {
        let id = prod.rhs[0].id();
        for wild in [
          (dict.is_num(id), Symbol::wildcard_num()),
          (dict.is_unum(id), Symbol::wildcard_unum()),
          (dict.is_ident(id), Symbol::wildcard_ident()),
        ] {
          if wild.0 {
            let candidate = Production::original(lhs, vec![wild.1]);
            if let Some(interned) = self.intern(&candidate) {
              return interned;
            }
          }
        }
      }
    }
    self.intern(prod).unwrap_or_else(|| prod.clone())
  }

  /// Derives a new production by merging `base` with `arg` at the given
  /// argument index, producing the multi-node parse shape used for mask
  /// matching. The argument's LHS must match the required argument type.
  pub fn combine(
    &mut self,
    base: &Rc<Production>,
    arg: &Rc<Production>,
    arg_index: usize,
  ) -> Rc<Production> {
    assert!(
      arg.lhs == Some(base.args[arg_index]) && !arg.is_wildcard(),
      "argument does not fit production"
    );
    let mut rhs = Vec::with_capacity(base.rhs.len() + arg.rhs.len() - 1);
    let mut seen = 0;
    for sym in &base.rhs {
      if sym.is_nonterminal() {
        if seen == arg_index {
          rhs.extend(arg.rhs.iter().copied());
          seen += 1;
          continue;
        }
        seen += 1;
      }
      rhs.push(*sym);
    }
    let mut remaining = arg_index;
    let shape = replace_hole(as_shape(base), &mut remaining, &as_shape(arg));
    let mut args = Vec::new();
    let mut paths = Vec::new();
    collect_holes(&shape, &mut Vec::new(), &mut args, &mut paths);
    let prod = Production {
      lhs: base.lhs,
      rhs,
      orig: false,
      args,
      shape: Some(shape),
      paths,
    };
    self.add(prod).0
  }

  /// Indicates if `prod`'s parse shape matches the gold derivation rooted at
  /// node `at` of the linearized meaning, comparing productions up to tying.
  pub fn matches(&self, prod: &Rc<Production>, f: &Meaning, at: usize, dict: &Dictionary) -> bool {
    match &prod.shape {
      None => self.root_matches(prod, f, at, dict),
      Some(shape) => self.shape_matches(shape, f, at, dict),
    }
  }

  fn root_matches(&self, prod: &Rc<Production>, f: &Meaning, at: usize, dict: &Dictionary) -> bool {
    let gold = &f.linear[at].prod;
    **prod == **gold || *prod == self.tied(gold, dict)
  }

  fn shape_matches(&self, shape: &MrShape, f: &Meaning, at: usize, dict: &Dictionary) -> bool {
    match shape {
      MrShape::Hole(_) => true,
      MrShape::Sub(prod, children) => {
        if !self.root_matches(prod, f, at, dict) {
          return false;
        }
        let gold_children = &f.linear[at].children;
        children.len() == gold_children.len()
          && children
            .iter()
            .zip(gold_children)
            .all(|(child, &gc)| self.shape_matches(child, f, gc, dict))
      }
    }
  }
}

fn as_shape(prod: &Rc<Production>) -> MrShape {
  match &prod.shape {
    Some(shape) => shape.clone(),
    None => MrShape::Sub(
      prod.clone(),
      prod.args.iter().map(|&n| MrShape::Hole(n)).collect(),
    ),
  }
}

fn replace_hole(shape: MrShape, remaining: &mut usize, replacement: &MrShape) -> MrShape {
  match shape {
    MrShape::Hole(n) => {
      if *remaining == 0 {
        *remaining = usize::MAX; // consumed
        replacement.clone()
      } else {
        *remaining -= 1;
        MrShape::Hole(n)
      }
    }
    MrShape::Sub(prod, children) => MrShape::Sub(
      prod,
      children
        .into_iter()
        .map(|c| {
          if *remaining == usize::MAX {
            c
          } else {
            replace_hole(c, remaining, replacement)
          }
        })
        .collect(),
    ),
  }
}

fn collect_holes(
  shape: &MrShape,
  path: &mut Vec<usize>,
  args: &mut Vec<u32>,
  paths: &mut Vec<Vec<usize>>,
) {
  match shape {
    MrShape::Hole(n) => {
      args.push(*n);
      paths.push(path.clone());
    }
    MrShape::Sub(_, children) => {
      for (i, child) in children.iter().enumerate() {
        path.push(i);
        collect_holes(child, path, args, paths);
        path.pop();
      }
    }
  }
}

/// One node of a linearized gold MR parse tree.
#[derive(Debug, Clone)]
pub struct MeaningNode {
  pub prod: Rc<Production>,
  /// Linear indices of the argument subtrees, in order.
  pub children: Vec<usize>,
  /// Linear index of this node's last descendant (itself if a leaf).
  pub last_descendant: usize,
}

/// A gold meaning representation: its parse tree under the unambiguous MR
/// grammar, linearized in pre-order.
#[derive(Debug, Clone)]
pub struct Meaning {
  pub linear: Vec<MeaningNode>,
}

/// A gold MR parse tree in recursive form, for building `Meaning`s.
#[derive(Debug, Clone)]
pub struct GoldTree {
  pub prod: Rc<Production>,
  pub children: Vec<GoldTree>,
}

impl GoldTree {
  pub fn leaf(prod: Rc<Production>) -> Self {
    GoldTree { prod, children: Vec::new() }
  }

  pub fn new(prod: Rc<Production>, children: Vec<GoldTree>) -> Self {
    GoldTree { prod, children }
  }
}

impl Meaning {
  pub fn from_gold(root: &GoldTree) -> Self {
    let mut linear = Vec::new();
    linearize(root, &mut linear);
    Meaning { linear }
  }

  pub fn len(&self) -> usize {
    self.linear.len()
  }

  pub fn is_empty(&self) -> bool {
    self.linear.is_empty()
  }

  /// Walks a child-index path down from the node at `at`.
  pub fn descend(&self, at: usize, path: &[usize]) -> usize {
    let mut node = at;
    for &c in path {
      node = self.linear[node].children[c];
    }
    node
  }
}

fn linearize(tree: &GoldTree, linear: &mut Vec<MeaningNode>) -> usize {
  let at = linear.len();
  linear.push(MeaningNode {
    prod: tree.prod.clone(),
    children: Vec::new(),
    last_descendant: at,
  });
  let mut children = Vec::with_capacity(tree.children.len());
  for child in &tree.children {
    children.push(linearize(child, linear));
  }
  linear[at].children = children;
  linear[at].last_descendant = linear.len() - 1;
  at
}

/// A training example: a boundary-wrapped NL token sequence paired with its
/// gold meaning. Word alignments live in the excluded alignment subsystem
/// and are not consumed by the parser core.
#[derive(Debug, Clone)]
pub struct Example {
  pub id: usize,
  pub e: Vec<Symbol>,
  pub f: Meaning,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn set_with(prods: Vec<Production>) -> (ProductionSet, Vec<Rc<Production>>) {
    let mut set = ProductionSet::new();
    let rcs = prods.into_iter().map(|p| set.add(p).0).collect();
    (set, rcs)
  }

  #[test]
  fn test_interning_idempotent() {
    let mut dict = Dictionary::new();
    let q = dict.nonterm("Query");
    let c = dict.nonterm("City");
    let answer = dict.term("answer", false);

    let mut set = ProductionSet::new();
    let p1 = Production::original(q, vec![Symbol::terminal(answer), Symbol::nonterminal(c)]);
    let p2 = Production::original(q, vec![Symbol::terminal(answer), Symbol::nonterminal(c)]);
    let (rc1, added1) = set.add(p1);
    let (rc2, added2) = set.add(p2);
    assert!(added1);
    assert!(!added2);
    assert!(Rc::ptr_eq(&rc1, &rc2));
    assert_eq!(set.len(), 1);
  }

  #[test]
  fn test_tied_specialization() {
    let mut dict = Dictionary::new();
    let num = dict.nonterm("Num");
    let two = dict.term("2", false);

    let (set, rcs) = set_with(vec![Production::original(num, vec![Symbol::wildcard_num()])]);
    let wild = &rcs[0];
    let spec = Rc::new(Production::specialize(wild, Symbol::terminal(two), &dict));
    let tied = set.tied(&spec, &dict);
    assert!(Rc::ptr_eq(&tied, wild));
    // tied is idempotent
    assert!(Rc::ptr_eq(&set.tied(&tied, &dict), wild));
  }

  #[test]
  fn test_combine_shape_and_paths() {
    let mut dict = Dictionary::new();
    let q = dict.nonterm("Query");
    let c = dict.nonterm("City");
    let s = dict.nonterm("State");
    let answer = dict.term("answer", false);
    let loc = dict.term("loc", false);

    let mut set = ProductionSet::new();
    let base = set
      .add(Production::original(q, vec![Symbol::terminal(answer), Symbol::nonterminal(c)]))
      .0;
    let arg = set
      .add(Production::original(c, vec![Symbol::terminal(loc), Symbol::nonterminal(s)]))
      .0;
    let merged = set.combine(&base, &arg, 0);
    assert_eq!(merged.count_args(), 1);
    assert_eq!(merged.args(), &[s]);
    // the State hole sits under the first (only) child of the root, at its
    // first child position
    assert_eq!(merged.path(0), &[0, 0]);
    assert!(!merged.is_orig());
    assert_eq!(merged.rhs().len(), 3);
  }

  #[test]
  fn test_meaning_linearization() {
    let mut dict = Dictionary::new();
    let q = dict.nonterm("Query");
    let c = dict.nonterm("City");
    let answer = dict.term("answer", false);
    let austin = dict.term("'austin'", false);

    let mut set = ProductionSet::new();
    let top = set
      .add(Production::original(q, vec![Symbol::terminal(answer), Symbol::nonterminal(c)]))
      .0;
    let leaf = set.add(Production::original(c, vec![Symbol::terminal(austin)])).0;

    let gold = GoldTree::new(top.clone(), vec![GoldTree::leaf(leaf.clone())]);
    let f = Meaning::from_gold(&gold);
    assert_eq!(f.len(), 2);
    assert_eq!(f.linear[0].children, vec![1]);
    assert_eq!(f.linear[0].last_descendant, 1);
    assert_eq!(f.linear[1].last_descendant, 1);
    assert_eq!(f.descend(0, &[0]), 1);

    assert!(set.matches(&top, &f, 0, &dict));
    assert!(!set.matches(&leaf, &f, 0, &dict));
    assert!(set.matches(&leaf, &f, 1, &dict));
  }
}
