//! A statistical semantic parser: a synchronous context-free grammar maps
//! natural-language sentences to meaning representations, an Earley chart
//! parser derives both sides in lockstep, and a maximum-entropy model
//! trained by inside-outside and L-BFGS ranks the derivations.

#[macro_use]
extern crate lazy_static;

pub mod chart;
pub mod dictionary;
pub mod earley;
pub mod gap;
pub mod grammar;
pub mod mask;
pub mod maxent;
pub mod model;
pub mod mrl;
pub mod optimize;
pub mod rules;
pub mod symbol;
pub mod syntree;
pub mod utils;

pub use crate::earley::ScfgParser;
pub use crate::gap::GapModel;
pub use crate::grammar::Grammar;
pub use crate::maxent::TrainOptions;
pub use crate::model::Model;
pub use crate::mrl::Example;
pub use crate::utils::Err;

#[test]
fn test_decode_through_public_api() {
  let gram: Grammar = "
start *n:Query
*n:Query -> ({ answer *n:City })
*n:City -> ({ capital *n:State })
*n:State -> ({ *t:Ident })
*n:Query -> ({ *t:Bound what is *n:City#1 *t:Bound })({ answer *n:City#1 })
*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })
"
  .parse()
  .unwrap();
  let mut model = Model::new(gram);
  let e = model.tokenize("what is the capital of 'oregon'");
  let out = model.decode(&e, 1);
  assert_eq!(out.len(), 1);
  assert_eq!(out[0].mr, "answer capital 'oregon'");
}
