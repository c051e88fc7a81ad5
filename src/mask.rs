use std::fmt;

/// A fixed-width bit vector over the nodes of one gold MR parse tree.
///
/// During training, each chart item carries one of these: bit *i* set means
/// the item's partial derivation is consistent with generating exactly the
/// gold subtree rooted at node *i*. An all-zero mask marks a derivation that
/// parses the sentence but is not part of the gold standard.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Mask {
  bits: Vec<u64>,
  len: usize,
}

impl Mask {
  pub fn empty(len: usize) -> Self {
    Mask {
      bits: vec![0; len.div_ceil(64)],
      len,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.bits.iter().all(|&b| b == 0)
  }

  pub fn get(&self, i: usize) -> bool {
    debug_assert!(i < self.len);
    self.bits[i / 64] & (1 << (i % 64)) != 0
  }

  pub fn set(&mut self, i: usize, value: bool) {
    debug_assert!(i < self.len);
    if value {
      self.bits[i / 64] |= 1 << (i % 64);
    } else {
      self.bits[i / 64] &= !(1 << (i % 64));
    }
  }

  pub fn intersect(&self, other: &Mask) -> Mask {
    debug_assert_eq!(self.len, other.len);
    Mask {
      bits: self.bits.iter().zip(&other.bits).map(|(a, b)| a & b).collect(),
      len: self.len,
    }
  }

  /// Indices of set bits, ascending.
  pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
    (0..self.len).filter(|&i| self.get(i))
  }
}

impl fmt::Debug for Mask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Mask[")?;
    for i in 0..self.len {
      write!(f, "{}", if self.get(i) { '1' } else { '0' })?;
    }
    write!(f, "]")
  }
}

#[test]
fn test_set_get() {
  let mut m = Mask::empty(70);
  assert!(m.is_empty());
  m.set(0, true);
  m.set(69, true);
  assert!(m.get(0) && m.get(69) && !m.get(1));
  assert_eq!(m.ones().collect::<Vec<_>>(), vec![0, 69]);
  m.set(0, false);
  assert_eq!(m.ones().collect::<Vec<_>>(), vec![69]);
}

#[test]
fn test_intersect() {
  let mut a = Mask::empty(8);
  let mut b = Mask::empty(8);
  a.set(1, true);
  a.set(3, true);
  b.set(3, true);
  b.set(5, true);
  let c = a.intersect(&b);
  assert_eq!(c.ones().collect::<Vec<_>>(), vec![3]);
  assert!(a.intersect(&Mask::empty(8)).is_empty());
}

#[test]
fn test_equality_and_hash_by_content() {
  use std::collections::HashSet;
  let mut a = Mask::empty(10);
  let mut b = Mask::empty(10);
  a.set(4, true);
  b.set(4, true);
  assert_eq!(a, b);
  let mut set = HashSet::new();
  set.insert(a);
  assert!(set.contains(&b));
}
