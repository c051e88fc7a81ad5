use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::dictionary::Dictionary;
use crate::mrl::{Production, ProductionSet};
use crate::rules::Rule;
use crate::symbol::Symbol;
use crate::utils::{reflexive_transitive, Err};

pub type RuleId = usize;

/// The SCFG rule store. Owns the dictionary and the production table,
/// interns rules, and answers the left-corner reachability queries that
/// gate Earley prediction.
///
/// Rules themselves are immutable; their weights and active flags are kept
/// here, keyed by [`RuleId`].
#[derive(Debug)]
pub struct Grammar {
  dict: Dictionary,
  prods: ProductionSet,
  start: u32,
  rules: Vec<Rc<Rule>>,
  ids: HashMap<Rc<Rule>, RuleId>,
  by_lhs: Vec<Vec<RuleId>>,
  /// Explicit parameter ties, rule to canonical rule.
  ties: HashMap<Rc<Rule>, RuleId>,
  weights: Vec<f64>,
  active: Vec<bool>,
  n_init: usize,
  /// Immediate left-corner adjacency for the NL and MR sides, and their
  /// lazily computed reflexive-transitive closures. A closure is dropped
  /// whenever a rule adds a new edge.
  e_lc: Vec<Vec<bool>>,
  f_lc: Vec<Vec<bool>>,
  e_lc_trans: RefCell<Option<Vec<Vec<bool>>>>,
  f_lc_trans: RefCell<Option<Vec<Vec<bool>>>>,
}

impl Grammar {
  pub fn new(start: &str) -> Self {
    let mut dict = Dictionary::new();
    let start = dict.nonterm(start);
    Grammar {
      dict,
      prods: ProductionSet::new(),
      start,
      rules: Vec::new(),
      ids: HashMap::new(),
      by_lhs: Vec::new(),
      ties: HashMap::new(),
      weights: Vec::new(),
      active: Vec::new(),
      n_init: 0,
      e_lc: Vec::new(),
      f_lc: Vec::new(),
      e_lc_trans: RefCell::new(None),
      f_lc_trans: RefCell::new(None),
    }
  }

  pub fn start(&self) -> u32 {
    self.start
  }

  pub fn dict(&self) -> &Dictionary {
    &self.dict
  }

  pub fn dict_mut(&mut self) -> &mut Dictionary {
    &mut self.dict
  }

  pub fn productions(&self) -> &ProductionSet {
    &self.prods
  }

  pub fn productions_mut(&mut self) -> &mut ProductionSet {
    &mut self.prods
  }

  pub fn count_nonterms(&self) -> usize {
    self.dict.count_nonterms()
  }

  pub fn count_rules(&self) -> usize {
    self.rules.len()
  }

  pub fn count_init_rules(&self) -> usize {
    self.n_init
  }

  pub fn rule(&self, id: RuleId) -> &Rc<Rule> {
    &self.rules[id]
  }

  pub fn id_of(&self, rule: &Rule) -> Option<RuleId> {
    self.ids.get(rule).copied()
  }

  /// Rules with the given LHS nonterminal, in insertion order.
  pub fn rules_for(&self, lhs: u32) -> &[RuleId] {
    self
      .by_lhs
      .get(lhs as usize)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  fn grow(&mut self) {
    let n = self.dict.count_nonterms();
    if self.by_lhs.len() < n {
      self.by_lhs.resize_with(n, Vec::new);
      for row in &mut self.e_lc {
        row.resize(n, false);
      }
      self.e_lc.resize_with(n, || vec![false; n]);
      for row in &mut self.f_lc {
        row.resize(n, false);
      }
      self.f_lc.resize_with(n, || vec![false; n]);
    }
  }

  /// Interns a rule. Returns its id and whether it was newly added. New
  /// rules start with weight zero and active.
  pub fn add(&mut self, rule: Rule) -> (RuleId, bool) {
    if let Some(&id) = self.ids.get(&rule) {
      return (id, false);
    }
    self.grow();
    let lhs = rule.lhs().expect("the dummy rule is never stored") as usize;
    let rc = Rc::new(rule);
    let id = self.rules.len();
    self.ids.insert(rc.clone(), id);
    self.by_lhs[lhs].push(id);
    if rc.is_init() {
      self.n_init += 1;
    }
    if rc.e()[0].is_nonterminal() {
      self.e_lc[lhs][rc.e()[0].id() as usize] = true;
      *self.e_lc_trans.borrow_mut() = None;
    }
    if rc.f()[0].is_nonterminal() {
      self.f_lc[lhs][rc.f()[0].id() as usize] = true;
      *self.f_lc_trans.borrow_mut() = None;
    }
    self.weights.push(0.0);
    self.active.push(true);
    self.rules.push(rc);
    (id, true)
  }

  /// Ties `rule`'s weight to `canon`'s, adding both if necessary. Returns
  /// `rule`'s id.
  pub fn add_tie(&mut self, rule: Rule, canon: Rule) -> RuleId {
    let (rule_id, _) = self.add(rule);
    let (canon_id, _) = self.add(canon);
    self.ties.insert(self.rules[rule_id].clone(), canon_id);
    rule_id
  }

  /// The id of the rule that `rule` shares its weight with: an explicit tie
  /// if one was declared, else the matching wildcard rule for a literal
  /// number/unit-number/identifier specialization, else `rule`'s own
  /// interned id.
  pub fn tied_id(&self, rule: &Rule) -> Option<RuleId> {
    if let Some(&id) = self.ties.get(rule) {
      return Some(id);
    }
    if rule.len_e() == 1 && rule.len_f() == 1 {
      let e = rule.e()[0];
      let f = rule.f()[0];
      if e.is_terminal() && e == f {
        if let Some(lhs) = rule.lhs() {
          for (is_class, wild) in [
            (self.dict.is_num(e.id()), Symbol::wildcard_num()),
            (self.dict.is_unum(e.id()), Symbol::wildcard_unum()),
            (self.dict.is_ident(e.id()), Symbol::wildcard_ident()),
          ] {
            if is_class {
              let candidate = wildcard_rule(lhs, wild);
              if let Some(&id) = self.ids.get(&candidate) {
                return Some(id);
              }
            }
          }
        }
      }
    }
    self.ids.get(rule).copied()
  }

  /// The interned rule that `rule` is tied to, or `rule` itself if it is
  /// not in this grammar.
  pub fn tied(&self, rule: &Rc<Rule>) -> Rc<Rule> {
    match self.tied_id(rule) {
      Some(id) => self.rules[id].clone(),
      None => rule.clone(),
    }
  }

  pub fn weight(&self, id: RuleId) -> f64 {
    self.weights[id]
  }

  pub fn set_weight(&mut self, id: RuleId, weight: f64) {
    self.weights[id] = weight;
  }

  pub fn is_active(&self, id: RuleId) -> bool {
    self.active[id]
  }

  /// Deactivates a rule. Initial rules cannot be deactivated, and rules are
  /// never reactivated.
  pub fn deactivate(&mut self, id: RuleId) {
    if !self.rules[id].is_init() {
      self.active[id] = false;
    }
  }

  /// Indicates if `n2` can appear on the left fringe of an NL parse tree
  /// rooted at `n1`.
  pub fn is_left_corner_for_e(&self, n1: u32, n2: u32) -> bool {
    let mut cache = self.e_lc_trans.borrow_mut();
    let t = cache.get_or_insert_with(|| closure(&self.e_lc, self.dict.count_nonterms()));
    t[n1 as usize][n2 as usize]
  }

  /// Indicates if `n2` can appear on the left fringe of an MR parse tree
  /// rooted at `n1`.
  pub fn is_left_corner_for_f(&self, n1: u32, n2: u32) -> bool {
    let mut cache = self.f_lc_trans.borrow_mut();
    let t = cache.get_or_insert_with(|| closure(&self.f_lc, self.dict.count_nonterms()));
    t[n1 as usize][n2 as usize]
  }

  /// Reads one SCFG rule from a single line of text and adds it, honoring a
  /// trailing `tied-to <rule>` clause. Used by tests and by grammar loading.
  pub fn read_rule(&mut self, line: &str, init: bool) -> Result<RuleId, Err> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut pos = 0;
    let rule = Rule::read(&tokens, &mut pos, &mut self.dict, &mut self.prods, init)
      .ok_or_else(|| format!("malformed rule: {}", line))?;
    if tokens.get(pos) == Some(&"tied-to") {
      pos += 1;
      let canon = Rule::read(&tokens, &mut pos, &mut self.dict, &mut self.prods, init)
        .ok_or_else(|| format!("malformed tied-to rule: {}", line))?;
      if pos < tokens.len() {
        return Err(format!("trailing tokens in rule: {}", line).into());
      }
      return Ok(self.add_tie(rule, canon));
    }
    if pos < tokens.len() {
      return Err(format!("trailing tokens in rule: {}", line).into());
    }
    Ok(self.add(rule).0)
  }

  fn read_production(&mut self, line: &str) -> Result<(), Err> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let malformed = || -> Err { format!("malformed production: {}", line).into() };
    let lhs_tok = tokens
      .first()
      .and_then(|t| t.strip_prefix("*n:"))
      .ok_or_else(malformed)?;
    let lhs = self.dict.nonterm(lhs_tok);
    if tokens.get(1) != Some(&"->") || tokens.get(2) != Some(&"({") || tokens.last() != Some(&"})")
    {
      return Err(malformed());
    }
    let mut rhs = Vec::new();
    for tok in &tokens[3..tokens.len() - 1] {
      rhs.push(Symbol::read(tok, &mut self.dict, false).ok_or_else(malformed)?);
    }
    if rhs.is_empty() {
      return Err(malformed());
    }
    self.prods.add(Production::original(lhs, rhs));
    Ok(())
  }

  /// Adds the default initial rules: one rule per unary or wildcard
  /// original production, with the NL side mirroring the MR side.
  fn add_default_init(&mut self) {
    let defaults: Vec<Rc<Production>> = self
      .prods
      .iter()
      .filter(|p| p.is_orig() && (p.is_unary() || p.is_wildcard()))
      .cloned()
      .collect();
    for prod in defaults {
      let e = vec![prod.rhs()[0].with_index(1)];
      self.add(Rule::new(prod, e, vec![0], true));
    }
  }

  /// Reads persisted rules (one per line, with a trailing `weight W`) as
  /// produced by [`write_rules`](Self::write_rules).
  pub fn read_rules(&mut self, text: &str) -> Result<(), Err> {
    for line in text.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with("//") {
        continue;
      }
      let tokens: Vec<&str> = line.split_whitespace().collect();
      let mut pos = 0;
      let rule = Rule::read(&tokens, &mut pos, &mut self.dict, &mut self.prods, false)
        .ok_or_else(|| -> Err { format!("malformed rule: {}", line).into() })?;
      let mut canon = None;
      if tokens.get(pos) == Some(&"tied-to") {
        pos += 1;
        canon = Some(
          Rule::read(&tokens, &mut pos, &mut self.dict, &mut self.prods, false)
            .ok_or_else(|| -> Err { format!("malformed tied-to rule: {}", line).into() })?,
        );
      }
      let mut weight = 0.0;
      if tokens.get(pos) == Some(&"weight") {
        weight = tokens
          .get(pos + 1)
          .and_then(|t| t.parse().ok())
          .ok_or_else(|| -> Err { format!("malformed weight: {}", line).into() })?;
        pos += 2;
      }
      if pos < tokens.len() {
        return Err(format!("trailing tokens in rule: {}", line).into());
      }
      let id = match canon {
        Some(canon) => self.add_tie(rule, canon),
        None => self.add(rule).0,
      };
      self.weights[id] = weight;
    }
    Ok(())
  }

  /// Writes all active rules, one per line with their explicit tie (if
  /// any) and their weight.
  pub fn write_rules(&self) -> String {
    let mut out = String::new();
    for (id, rule) in self.rules.iter().enumerate() {
      if self.active[id] {
        out.push_str(&format!("{}", rule.display(&self.dict)));
        if let Some(&canon) = self.ties.get(rule) {
          out.push_str(&format!(" tied-to {}", self.rules[canon].display(&self.dict)));
        }
        out.push_str(&format!(" weight {}\n", self.weights[id]));
      }
    }
    out
  }
}

/// The canonical single-wildcard rule used for weight tying.
fn wildcard_rule(lhs: u32, wild: Symbol) -> Rule {
  let prod = Rc::new(Production::original(lhs, vec![wild]));
  Rule::new(prod, vec![wild.with_index(1)], vec![0], false)
}

fn closure(adj: &[Vec<bool>], n: usize) -> Vec<Vec<bool>> {
  // pad to the current nonterminal count so closures stay valid when
  // nonterminals were interned after the last rule was added
  let padded: Vec<Vec<bool>> = (0..n)
    .map(|i| {
      let mut row = adj.get(i).cloned().unwrap_or_default();
      row.resize(n, false);
      row
    })
    .collect();
  reflexive_transitive(&padded)
}

/// Loads grammar source: a `start` declaration, MR productions
/// (`*n:LHS -> ({ syms })`), and initial SCFG rules
/// (`*n:LHS -> ({ E-syms })({ F-syms })`, optionally `tied-to` another).
/// Unary and wildcard productions get default initial rules. Malformed
/// input fails the whole load.
impl FromStr for Grammar {
  type Err = Err;

  fn from_str(s: &str) -> Result<Self, Err> {
    let mut gram = None;
    for line in s.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with("//") {
        continue;
      }
      if let Some(name) = line.strip_prefix("start ") {
        let name = name
          .trim()
          .strip_prefix("*n:")
          .ok_or_else(|| -> Err { format!("malformed start symbol: {}", line).into() })?;
        gram = Some(Grammar::new(name));
        continue;
      }
      let gram = gram
        .as_mut()
        .ok_or_else(|| -> Err { "grammar must declare its start symbol first".into() })?;
      if line.contains("})({") {
        gram.read_rule(line, true)?;
      } else {
        gram.read_production(line)?;
      }
    }
    let mut gram = gram.ok_or_else(|| -> Err { "grammar has no start symbol".into() })?;
    gram.add_default_init();
    Ok(gram)
  }
}

impl fmt::Display for Grammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "start *n:{}", self.dict.nonterm_str(self.start))?;
    for rule in &self.rules {
      writeln!(f, "{}", rule.display(&self.dict))?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const GEO: &str = "
start *n:Query
*n:Query -> ({ answer *n:City })
*n:City -> ({ capital *n:State })
*n:City -> ({ *t:Ident })
*n:State -> ({ *t:Ident })
*n:Query -> ({ what is *n:City#1 })({ answer *n:City#1 })
*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })
";

  #[test]
  fn test_load_with_default_init() {
    let gram: Grammar = GEO.parse().unwrap();
    // two explicit rules plus two default wildcard rules
    assert_eq!(gram.count_rules(), 4);
    assert_eq!(gram.count_init_rules(), 4);
    assert_eq!(gram.productions().len(), 4);
    let start = gram.start();
    assert_eq!(gram.dict().nonterm_str(start), "Query");
  }

  #[test]
  fn test_interning_idempotent() {
    let mut gram: Grammar = GEO.parse().unwrap();
    let n = gram.count_rules();
    let id = gram
      .read_rule("*n:Query -> ({ what is *n:City#1 })({ answer *n:City#1 })", true)
      .unwrap();
    assert_eq!(gram.count_rules(), n);
    assert!(gram.is_active(id));
  }

  #[test]
  fn test_left_corner_closure() {
    let mut gram: Grammar = GEO.parse().unwrap();
    let query = gram.dict_mut().nonterm("Query");
    let city = gram.dict_mut().nonterm("City");
    let state = gram.dict_mut().nonterm("State");
    // reflexive even with no edges
    assert!(gram.is_left_corner_for_e(query, query));
    assert!(!gram.is_left_corner_for_e(city, state));
    // MR sides all start with terminals here
    assert!(!gram.is_left_corner_for_f(query, city));
    // a new edge invalidates the cached closure
    gram
      .read_rule("*n:City -> ({ *n:State#1 city })({ capital *n:State#1 })", true)
      .unwrap();
    assert!(gram.is_left_corner_for_e(city, state));
    assert!(!gram.is_left_corner_for_e(state, city));
  }

  #[test]
  fn test_tied_wildcard() {
    let mut gram: Grammar = GEO.parse().unwrap();
    let spec_id = gram.read_rule("*n:City -> ({ 'austin' })({ 'austin' })", false).unwrap();
    let spec = gram.rule(spec_id).clone();
    let tied = gram.tied(&spec);
    assert!(tied.is_wildcard());
    assert!(!Rc::ptr_eq(&tied, &spec));
    // tying is idempotent
    assert!(Rc::ptr_eq(&gram.tied(&tied), &tied));
    assert_eq!(gram.tied_id(&spec), gram.id_of(&tied));
  }

  #[test]
  fn test_deactivation_is_one_way() {
    let mut gram: Grammar = GEO.parse().unwrap();
    let id = gram.read_rule("*n:State -> ({ texas })({ 'texas' })", false).unwrap();
    assert!(gram.is_active(id));
    gram.deactivate(id);
    assert!(!gram.is_active(id));
    // initial rules cannot be deactivated
    let init = gram.rules_for(gram.start())[0];
    gram.deactivate(init);
    assert!(gram.is_active(init));
  }

  #[test]
  fn test_rule_persistence_round_trip() {
    let mut gram: Grammar = GEO.parse().unwrap();
    let id = gram.read_rule("*n:State -> ({ texas })({ 'texas' })", false).unwrap();
    gram.set_weight(id, -1.25);
    let text = gram.write_rules();
    assert!(text.contains("weight -1.25"));

    let mut loaded: Grammar = "start *n:Query".parse().unwrap();
    loaded.read_rules(&text).unwrap();
    assert_eq!(loaded.count_rules(), gram.count_rules());
    assert_eq!(loaded.write_rules(), text);
  }

  #[test]
  fn test_tied_rule_persistence_round_trip() {
    let mut gram: Grammar = GEO.parse().unwrap();
    gram
      .read_rule(
        "*n:City -> ({ austin })({ 'austin' }) tied-to *n:City -> ({ *t:Ident#1 })({ *t:Ident#1 })",
        false,
      )
      .unwrap();
    let text = gram.write_rules();
    assert!(text.contains("tied-to"));

    let mut loaded: Grammar = "start *n:Query".parse().unwrap();
    loaded.read_rules(&text).unwrap();
    assert_eq!(loaded.write_rules(), text);
    // the explicit tie survives the round trip
    let id = loaded.read_rule("*n:City -> ({ austin })({ 'austin' })", false).unwrap();
    let rule = loaded.rule(id).clone();
    assert!(loaded.tied(&rule).is_wildcard());
  }
}
