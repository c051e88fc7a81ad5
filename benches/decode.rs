use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lockstep::{Grammar, Model};

const GRAMMAR_SRC: &str = "
start *n:Query
*n:Query -> ({ answer *n:City })
*n:Query -> ({ answer *n:State })
*n:City -> ({ capital *n:State })
*n:City -> ({ largest city *n:State })
*n:City -> ({ *t:Ident })
*n:State -> ({ loc *n:City })
*n:State -> ({ *t:Ident })
*n:Query -> ({ *t:Bound what is *n:City#1 *t:Bound })({ answer *n:City#1 })
*n:Query -> ({ *t:Bound what is *n:State#1 *t:Bound })({ answer *n:State#1 })
*n:City -> ({ the capital of *n:State#1 })({ capital *n:State#1 })
*n:City -> ({ the largest city in *n:State#1 })({ largest city *n:State#1 })
*n:State -> ({ the state containing *n:City#1 })({ loc *n:City#1 })
";

fn decode(model: &Model, e: &[lockstep::symbol::Symbol]) -> usize {
  model.decode(e, 5).len()
}

fn criterion_benchmark(c: &mut Criterion) {
  let grammar = GRAMMAR_SRC.parse::<Grammar>().unwrap();
  let mut model = Model::new(grammar);
  let simple = model.tokenize("what is the capital of 'texas'");
  let nested = model.tokenize("what is the largest city in the state containing 'austin'");

  c.bench_function("decode simple", |b| {
    b.iter(|| decode(black_box(&model), black_box(&simple)))
  });

  c.bench_function("decode nested", |b| {
    b.iter(|| decode(black_box(&model), black_box(&nested)))
  });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
