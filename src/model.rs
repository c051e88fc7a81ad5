use std::rc::Rc;

use crate::earley::ScfgParser;
use crate::gap::GapModel;
use crate::grammar::Grammar;
use crate::maxent::{estimate, TrainOptions};
use crate::mrl::{Example, Production};
use crate::symbol::Symbol;
use crate::syntree::SynTree;
use crate::utils::Err;

/// The complete translation model: an SCFG with trained rule weights plus
/// the word-gap model. Wraps training, decoding and persistence.
pub struct Model {
  grammar: Grammar,
  gap: GapModel,
}

/// One decoded meaning representation, highest-scoring first.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
  pub score: f64,
  pub mr: String,
}

impl Model {
  pub fn new(grammar: Grammar) -> Self {
    Model { grammar, gap: GapModel::new() }
  }

  pub fn grammar(&self) -> &Grammar {
    &self.grammar
  }

  pub fn grammar_mut(&mut self) -> &mut Grammar {
    &mut self.grammar
  }

  pub fn gap(&self) -> &GapModel {
    &self.gap
  }

  /// Turns a whitespace-separated NL sentence into the boundary-wrapped
  /// terminal sequence the parser consumes, interning each token as a word.
  pub fn tokenize(&mut self, sentence: &str) -> Vec<Symbol> {
    let dict = self.grammar.dict_mut();
    let mut e = vec![Symbol::boundary()];
    e.extend(
      sentence
        .split_whitespace()
        .map(|tok| Symbol::terminal(dict.term(tok, true))),
    );
    e.push(Symbol::boundary());
    e
  }

  /// Fits the rule and word-gap weights to the training examples.
  pub fn train(&mut self, examples: &[Example], opts: &TrainOptions) -> Result<(), Err> {
    estimate(&mut self.grammar, &mut self.gap, examples, opts)
  }

  /// Translates a tokenized sentence into its `kbest` highest-scoring
  /// meaning representations. An unparsable sentence yields no
  /// translations.
  pub fn decode(&self, e: &[Symbol], kbest: usize) -> Vec<Translation> {
    let mut parser = ScfgParser::decoder(&self.grammar, &self.gap, kbest);
    parser.parse(e, None);
    parser
      .parses()
      .map(|parse| Translation {
        score: parse.score,
        mr: self.mr_string(&parser.mr_tree(parse.item)),
      })
      .collect()
  }

  fn mr_string(&self, tree: &SynTree<Rc<Production>, Rc<Production>>) -> String {
    let mut tokens = Vec::new();
    self.mr_tokens(tree, &mut tokens);
    tokens.join(" ")
  }

  /// In-order expansion of an MR parse tree: terminals spell themselves,
  /// nonterminals expand to the matching argument subtree.
  fn mr_tokens(&self, tree: &SynTree<Rc<Production>, Rc<Production>>, out: &mut Vec<String>) {
    let dict = self.grammar.dict();
    match tree {
      SynTree::Leaf(w) => {
        for sym in w.value.rhs() {
          out.push(dict.term_str(sym.id()).to_string());
        }
      }
      SynTree::Branch(c, children) => {
        let mut args = children.iter();
        for sym in c.value.rhs() {
          if sym.is_nonterminal() {
            let arg = args.next().expect("MR tree is missing an argument");
            self.mr_tokens(arg, out);
          } else {
            out.push(dict.term_str(sym.id()).to_string());
          }
        }
      }
    }
  }

  /// The persisted model: the active rules with their weights, followed by
  /// the word-gap model's sections.
  pub fn save(&self) -> String {
    let mut out = self.grammar.write_rules();
    out.push_str(&self.gap.write(self.grammar.dict()));
    out
  }

  /// Loads a model saved by [`save`](Self::save) into this model's grammar,
  /// which needs only its start symbol declared.
  pub fn load(&mut self, text: &str) -> Result<(), Err> {
    let split = text
      .find("begin default-weight")
      .ok_or_else(|| -> Err { "saved model has no word-gap section".into() })?;
    self.grammar.read_rules(&text[..split])?;
    self.gap.read(self.grammar.dict_mut(), &text[split..])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mrl::GoldTree;

  const GEO: &str = "
start *n:Query
*n:Query -> ({ answer *n:City })
*n:City -> ({ capital *n:State })
*n:State -> ({ *t:Ident })
*n:Query -> ({ *t:Bound what is *n:City#1 *t:Bound })({ answer *n:City#1 })
*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })
";

  #[test]
  fn test_tokenize_wraps_and_normalizes() {
    let mut model = Model::new(GEO.parse().unwrap());
    let e = model.tokenize("What is 2.0");
    assert_eq!(e.len(), 5);
    assert_eq!(e[0], Symbol::boundary());
    assert_eq!(e[4], Symbol::boundary());
    let dict = model.grammar().dict();
    assert_eq!(dict.term_str(e[1].id()), "what");
    assert_eq!(dict.term_str(e[3].id()), "2");
  }

  #[test]
  fn test_decode_unambiguous() {
    let mut model = Model::new(GEO.parse().unwrap());
    let e = model.tokenize("what is the capital of 'texas'");
    let out = model.decode(&e, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].mr, "answer capital 'texas'");
    let unparsable = model.tokenize("how tall is everest");
    assert!(model.decode(&unparsable, 1).is_empty());
  }

  /// answer(capital('texas'))
  fn gold(gram: &mut Grammar) -> crate::mrl::Meaning {
    let dict = gram.dict_mut();
    let q = dict.nonterm("Query");
    let c = dict.nonterm("City");
    let s = dict.nonterm("State");
    let answer = dict.term("answer", false);
    let capital = dict.term("capital", false);
    let texas = dict.term("'texas'", false);
    let prods = gram.productions_mut();
    let top = prods
      .add(Production::original(q, vec![Symbol::terminal(answer), Symbol::nonterminal(c)]))
      .0;
    let mid = prods
      .add(Production::original(c, vec![Symbol::terminal(capital), Symbol::nonterminal(s)]))
      .0;
    let wild = prods.add(Production::original(s, vec![Symbol::wildcard_ident()])).0;
    let leaf = Rc::new(Production::specialize(&wild, Symbol::terminal(texas), gram.dict()));
    crate::mrl::Meaning::from_gold(&GoldTree::new(
      top,
      vec![GoldTree::new(mid, vec![GoldTree::leaf(leaf)])],
    ))
  }

  #[test]
  fn test_train_save_load_round_trip() {
    let mut gram: Grammar = GEO.parse().unwrap();
    // a competing reading that maps the same sentence to a different MR
    gram
      .read_rule(
        "*n:Query -> ({ *t:Bound what is *n:State#1 *t:Bound })({ answer population *n:State#1 })",
        false,
      )
      .unwrap();
    gram
      .read_rule("*n:State -> ({ the capital of *n:State#1 })({ capital *n:State#1 })", false)
      .unwrap();
    let mut model = Model::new(gram);
    let e = model.tokenize("what is the capital of 'texas'");
    let f = gold(model.grammar_mut());
    model
      .train(&[Example { id: 0, e: e.clone(), f }], &TrainOptions::default())
      .unwrap();
    let out = model.decode(&e, 1);
    assert_eq!(out[0].mr, "answer capital 'texas'");

    let text = model.save();
    let mut fresh = Model::new("start *n:Query".parse().unwrap());
    fresh.load(&text).unwrap();
    let e2 = fresh.tokenize("what is the capital of 'texas'");
    let out2 = fresh.decode(&e2, 1);
    assert_eq!(out2[0].mr, "answer capital 'texas'");
    assert!((out2[0].score - out[0].score).abs() < 1e-9);
  }
}
