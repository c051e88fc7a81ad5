use std::fmt;

use crate::dictionary::{
  Dictionary, BOUNDARY, WILDCARD_ANY, WILDCARD_IDENT, WILDCARD_NUM, WILDCARD_UNUM,
};

/// A terminal or nonterminal symbol. Symbols are the building blocks of
/// sentences, meaning representations and grammar rules.
///
/// `index` is the co-indexing index: a positive value associates an
/// occurrence on the NL side of a rule with an occurrence on the MR side.
/// Only nonterminals and wildcard terminals are indexable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
  Terminal { id: u32, index: u16 },
  Nonterminal { id: u32, index: u16 },
}

impl Symbol {
  pub fn terminal(id: u32) -> Self {
    Symbol::Terminal { id, index: 0 }
  }

  pub fn nonterminal(id: u32) -> Self {
    Symbol::Nonterminal { id, index: 0 }
  }

  pub fn wildcard_any() -> Self {
    Symbol::terminal(WILDCARD_ANY)
  }

  pub fn wildcard_num() -> Self {
    Symbol::terminal(WILDCARD_NUM)
  }

  pub fn wildcard_unum() -> Self {
    Symbol::terminal(WILDCARD_UNUM)
  }

  pub fn wildcard_ident() -> Self {
    Symbol::terminal(WILDCARD_IDENT)
  }

  pub fn boundary() -> Self {
    Symbol::terminal(BOUNDARY)
  }

  pub fn id(&self) -> u32 {
    match *self {
      Symbol::Terminal { id, .. } | Symbol::Nonterminal { id, .. } => id,
    }
  }

  pub fn index(&self) -> u16 {
    match *self {
      Symbol::Terminal { index, .. } | Symbol::Nonterminal { index, .. } => index,
    }
  }

  pub fn with_index(self, index: u16) -> Self {
    match self {
      Symbol::Terminal { id, .. } => Symbol::Terminal { id, index },
      Symbol::Nonterminal { id, .. } => Symbol::Nonterminal { id, index },
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Symbol::Terminal { .. })
  }

  pub fn is_nonterminal(&self) -> bool {
    matches!(self, Symbol::Nonterminal { .. })
  }

  pub fn is_wildcard(&self) -> bool {
    matches!(
      self,
      Symbol::Terminal { id, .. }
        if *id == WILDCARD_ANY || *id == WILDCARD_NUM || *id == WILDCARD_UNUM
          || *id == WILDCARD_IDENT
    )
  }

  pub fn is_boundary(&self) -> bool {
    matches!(self, Symbol::Terminal { id, .. } if *id == BOUNDARY)
  }

  /// Only nonterminals and wildcard terminals can carry a co-index.
  pub fn is_indexable(&self) -> bool {
    self.is_nonterminal() || self.is_wildcard()
  }

  /// Pattern matching against an input terminal, used during scanning.
  /// Unlike equality, wildcards match whole lexical classes.
  pub fn matches(&self, sym: &Symbol, dict: &Dictionary) -> bool {
    match (self, sym) {
      (Symbol::Terminal { id, .. }, Symbol::Terminal { id: other, .. }) => {
        *id == WILDCARD_ANY
          || (*id == WILDCARD_NUM && dict.is_num(*other))
          || (*id == WILDCARD_UNUM && dict.is_unum(*other))
          || (*id == WILDCARD_IDENT && dict.is_ident(*other))
          || id == other
      }
      _ => false,
    }
  }

  pub fn display<'a>(&'a self, dict: &'a Dictionary) -> SymbolDisplay<'a> {
    SymbolDisplay { sym: self, dict }
  }

  /// Reads a symbol token: `*n:Name(#i)?` for nonterminals,
  /// `*t:Any|Num|Unum|Ident|Bound(#i)?` for special terminals, anything else
  /// is a literal terminal. `read_words` marks literals as NL words.
  pub fn read(token: &str, dict: &mut Dictionary, read_words: bool) -> Option<Symbol> {
    let (body, index) = match token.rsplit_once('#') {
      Some((body, idx)) if !body.is_empty() && !body.starts_with('\'') => {
        (body, idx.parse::<u16>().ok()?)
      }
      _ => (token, 0),
    };
    if let Some(name) = body.strip_prefix("*n:") {
      let id = dict.nonterm(name);
      return Some(Symbol::Nonterminal { id, index });
    }
    if let Some(class) = body.strip_prefix("*t:") {
      let sym = match class {
        "Any" => Symbol::wildcard_any(),
        "Num" => Symbol::wildcard_num(),
        "Unum" => Symbol::wildcard_unum(),
        "Ident" => Symbol::wildcard_ident(),
        "Bound" => Symbol::boundary(),
        _ => return None,
      };
      return Some(if sym.is_indexable() { sym.with_index(index) } else { sym });
    }
    let id = dict.term(token, read_words);
    Some(Symbol::Terminal { id, index: 0 })
  }
}

pub struct SymbolDisplay<'a> {
  sym: &'a Symbol,
  dict: &'a Dictionary,
}

impl fmt::Display for SymbolDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self.sym {
      Symbol::Nonterminal { id, index } => {
        write!(f, "*n:{}", self.dict.nonterm_str(id))?;
        if index > 0 {
          write!(f, "#{}", index)?;
        }
      }
      Symbol::Terminal { id, index } => {
        // reserved names already carry the *t: prefix
        write!(f, "{}", self.dict.term_str(id))?;
        if index > 0 {
          write!(f, "#{}", index)?;
        }
      }
    }
    Ok(())
  }
}

#[test]
fn test_wildcard_matching() {
  let mut dict = Dictionary::new();
  let two = Symbol::terminal(dict.term("2", false));
  let texas = Symbol::terminal(dict.term("'texas'", false));
  let word = Symbol::terminal(dict.term("city", true));

  assert!(Symbol::wildcard_any().matches(&two, &dict));
  assert!(Symbol::wildcard_any().matches(&word, &dict));
  assert!(Symbol::wildcard_num().matches(&two, &dict));
  assert!(!Symbol::wildcard_num().matches(&word, &dict));
  assert!(Symbol::wildcard_unum().matches(&two, &dict));
  assert!(Symbol::wildcard_ident().matches(&texas, &dict));
  assert!(!Symbol::wildcard_ident().matches(&two, &dict));
  assert!(word.matches(&word, &dict));
  assert!(!word.matches(&two, &dict));
  // nonterminals never pattern-match
  assert!(!Symbol::nonterminal(0).matches(&two, &dict));
}

#[test]
fn test_read_round_trip() {
  let mut dict = Dictionary::new();
  let nt = Symbol::read("*n:City#1", &mut dict, false).unwrap();
  assert!(nt.is_nonterminal());
  assert_eq!(nt.index(), 1);
  assert_eq!(format!("{}", nt.display(&dict)), "*n:City#1");

  let wild = Symbol::read("*t:Num#2", &mut dict, false).unwrap();
  assert!(wild.is_wildcard());
  assert_eq!(wild.index(), 2);

  let bound = Symbol::read("*t:Bound", &mut dict, false).unwrap();
  assert!(bound.is_boundary());
  assert_eq!(bound.index(), 0);

  let lit = Symbol::read("capital", &mut dict, true).unwrap();
  assert_eq!(format!("{}", lit.display(&dict)), "capital");
}

#[test]
fn test_index_only_on_indexable() {
  // boundary is not indexable, its index stays 0
  let mut dict = Dictionary::new();
  let bound = Symbol::read("*t:Bound#3", &mut dict, false).unwrap();
  assert_eq!(bound.index(), 0);
}
