use std::collections::HashMap;

use regex::Regex;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// Reserved terminal ids, in order: the wildcard classes and the sentence
/// boundary marker. Everything at or above `NUM_SPECIAL_TERMS` is a real
/// terminal string.
pub const WILDCARD_ANY: u32 = 0;
pub const WILDCARD_NUM: u32 = 1;
pub const WILDCARD_UNUM: u32 = 2;
pub const WILDCARD_IDENT: u32 = 3;
pub const BOUNDARY: u32 = 4;
pub const NUM_SPECIAL_TERMS: u32 = 5;

#[derive(Debug, Clone, Copy, Default)]
struct TermFlags {
  word: bool,
  num: bool,
  unum: bool,
  ident: bool,
}

/// Maps terminal and nonterminal names to small integer ids and back.
/// Terminals carry lexical-class flags used by wildcard matching; terminals
/// that have occurred in NL text are flagged as words, which determines the
/// word-gap model's parameter space.
#[derive(Debug, Default)]
pub struct Dictionary {
  terms: Vec<String>,
  term_ids: HashMap<String, u32>,
  flags: Vec<TermFlags>,
  nonterms: Vec<String>,
  nonterm_ids: HashMap<String, u32>,
}

fn is_num(s: &str) -> bool {
  s.parse::<f64>().is_ok()
}

fn is_unum(s: &str) -> bool {
  matches!(s.parse::<u32>(), Ok(n) if (1..=11).contains(&n))
}

fn is_ident(s: &str) -> bool {
  regex_static!(IDENT, r"^'[^']+'$");
  IDENT.is_match(s)
}

impl Dictionary {
  pub fn new() -> Self {
    let mut d = Dictionary::default();
    for name in ["*t:Any", "*t:Num", "*t:Unum", "*t:Ident", "*t:Bound"] {
      let id = d.terms.len() as u32;
      d.terms.push(name.to_string());
      d.term_ids.insert(name.to_string(), id);
      d.flags.push(TermFlags::default());
    }
    d
  }

  /// Interns a terminal string. Numbers are normalized so that `2` and `2.0`
  /// share an id. `is_word` marks the terminal as an NL word.
  pub fn term(&mut self, s: &str, is_word: bool) -> u32 {
    let norm = normalize(s);
    let key = if is_word && !is_ident(&norm) { norm.to_lowercase() } else { norm };
    let id = match self.term_ids.get(&key) {
      Some(&id) => id,
      None => {
        let id = self.terms.len() as u32;
        self.flags.push(TermFlags {
          word: false,
          num: is_num(&key),
          unum: is_unum(&key),
          ident: is_ident(&key),
        });
        self.terms.push(key.clone());
        self.term_ids.insert(key, id);
        id
      }
    };
    if is_word {
      self.flags[id as usize].word = true;
    }
    id
  }

  pub fn term_str(&self, id: u32) -> &str {
    &self.terms[id as usize]
  }

  pub fn nonterm(&mut self, s: &str) -> u32 {
    match self.nonterm_ids.get(s) {
      Some(&id) => id,
      None => {
        let id = self.nonterms.len() as u32;
        self.nonterms.push(s.to_string());
        self.nonterm_ids.insert(s.to_string(), id);
        id
      }
    }
  }

  pub fn nonterm_str(&self, id: u32) -> &str {
    &self.nonterms[id as usize]
  }

  pub fn count_nonterms(&self) -> usize {
    self.nonterms.len()
  }

  pub fn count_terms(&self) -> usize {
    self.terms.len()
  }

  /// Number of terminals flagged as NL words.
  pub fn count_words(&self) -> usize {
    self.flags.iter().filter(|f| f.word).count()
  }

  /// Word ids in ascending order; this fixes the layout of the word-gap
  /// model's parameter vector.
  pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
    (0..self.terms.len() as u32).filter(|&id| self.flags[id as usize].word)
  }

  pub fn is_word(&self, id: u32) -> bool {
    self.flags[id as usize].word
  }

  pub fn is_num(&self, id: u32) -> bool {
    self.flags[id as usize].num
  }

  pub fn is_unum(&self, id: u32) -> bool {
    self.flags[id as usize].unum
  }

  pub fn is_ident(&self, id: u32) -> bool {
    self.flags[id as usize].ident
  }
}

fn normalize(s: &str) -> String {
  match s.parse::<f64>() {
    Ok(num) if num == (num as i64) as f64 => (num as i64).to_string(),
    Ok(num) => num.to_string(),
    Err(_) => s.to_string(),
  }
}

#[test]
fn test_term_normalization() {
  let mut d = Dictionary::new();
  let a = d.term("2", false);
  let b = d.term("2.0", false);
  assert_eq!(a, b);
  assert!(d.is_num(a));
  assert!(d.is_unum(a));
  assert!(!d.is_ident(a));
}

#[test]
fn test_word_flags() {
  let mut d = Dictionary::new();
  let city = d.term("City", true);
  assert_eq!(d.term_str(city), "city");
  assert!(d.is_word(city));
  let quoted = d.term("'Texas'", true);
  assert!(d.is_ident(quoted));
  assert_eq!(d.term_str(quoted), "'Texas'");
  assert_eq!(d.count_words(), 2);
  assert_eq!(d.words().collect::<Vec<_>>(), vec![city, quoted]);
}

#[test]
fn test_nonterm_ids() {
  let mut d = Dictionary::new();
  let q = d.nonterm("Query");
  assert_eq!(d.nonterm("Query"), q);
  assert_ne!(d.nonterm("City"), q);
  assert_eq!(d.count_nonterms(), 2);
}
