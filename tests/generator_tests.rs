//! Generators across tiers: yields from optimized code resume in baseline

mod common;

use common::*;
use pretty_assertions::assert_eq;
use tierjit::runtime::GeneratorState;
use tierjit::{ChunkBuilder, Error, FunctionId, IterResult, Value};

/// range(n) { i = 0; while (i < n) { yield i; i = i + 1 } return "done" }
fn range_chunk() -> tierjit::Chunk {
    let mut b = ChunkBuilder::new("range", 1);
    b.generator();
    let i = b.local();
    b.number(0.0).set_local(i);
    let head = b.here();
    let exit = b.new_label();
    b.get_local(i).get_local(0).lt().jump_if_false(exit);
    b.get_local(i).yield_value().pop();
    b.get_local(i).number(1.0).add().set_local(i);
    b.jump(head);
    b.bind(exit);
    b.string("done").ret();
    b.finish().unwrap()
}

/// pair(a) { x = yield a * 2; return x + a }
fn pair_chunk() -> tierjit::Chunk {
    let mut b = ChunkBuilder::new("pair", 1);
    b.generator();
    b.get_local(0).number(2.0).mul().yield_value();
    b.get_local(0).add().ret();
    b.finish().unwrap()
}

fn collect(engine: &mut tierjit::Engine, id: FunctionId, args: Vec<Value>) -> Vec<Value> {
    let generator = engine.call(id, args).unwrap();
    let mut out = Vec::new();
    loop {
        let IterResult { value, done } = engine.generator_next(&generator, Value::Undefined).unwrap();
        out.push(value);
        if done {
            return out;
        }
    }
}

#[test]
fn test_generator_yields_in_order() {
    let mut engine = engine(100);
    let range = engine.define(range_chunk()).unwrap();
    assert_eq!(
        collect(&mut engine, range, nums(&[3.0])),
        vec![num(0.0), num(1.0), num(2.0), Value::string("done")]
    );
}

#[test]
fn test_yield_in_loop_is_not_optimized() {
    let mut engine = engine(2);
    let range = engine.define(range_chunk()).unwrap();
    for _ in 0..5 {
        assert_eq!(collect(&mut engine, range, nums(&[2.0])).len(), 3);
    }
    assert!(!engine.is_optimized(range));
    assert_eq!(engine.stats().compile_failures, 1);
}

#[test]
fn test_optimized_first_activation_yields_and_resumes() {
    let mut engine = engine(100);
    let id = engine.define(pair_chunk()).unwrap();
    let warm = engine.call(id, nums(&[3.0])).unwrap();
    engine.generator_next(&warm, Value::Undefined).unwrap();
    engine.generator_next(&warm, num(1.0)).unwrap();

    engine.optimize_on_next_call(id).unwrap();
    let generator = engine.call(id, nums(&[5.0])).unwrap();
    assert!(engine.is_optimized(id));
    assert_eq!(
        engine.generator_next(&generator, Value::Undefined).unwrap(),
        IterResult { value: num(10.0), done: false }
    );
    assert_eq!(
        engine.generator_next(&generator, num(4.0)).unwrap(),
        IterResult { value: num(9.0), done: true }
    );
    assert_eq!(engine.status(id).unwrap().optimized_calls, 1);
}

#[test]
fn test_optimized_generator_deopts_before_yield() {
    let mut engine = engine(100);
    let id = engine.define(pair_chunk()).unwrap();
    let warm = engine.call(id, nums(&[3.0])).unwrap();
    engine.generator_next(&warm, Value::Undefined).unwrap();
    engine.generator_next(&warm, num(1.0)).unwrap();
    engine.optimize_on_next_call(id).unwrap();

    let generator = engine.call(id, nums(&[0.25])).unwrap();
    assert!(engine.is_optimized(id));
    assert_eq!(engine.generator_next(&generator, Value::Undefined).unwrap().value, num(0.5));
    assert!(!engine.is_optimized(id));
    assert_eq!(engine.generator_next(&generator, num(1.0)).unwrap().value, num(1.25));
}

#[test]
fn test_two_generators_are_independent() {
    let mut engine = engine(100);
    let range = engine.define(range_chunk()).unwrap();
    let a = engine.call(range, nums(&[5.0])).unwrap();
    let b = engine.call(range, nums(&[5.0])).unwrap();
    engine.generator_next(&a, Value::Undefined).unwrap();
    engine.generator_next(&a, Value::Undefined).unwrap();
    assert_eq!(engine.generator_next(&b, Value::Undefined).unwrap().value, num(0.0));
    assert_eq!(engine.generator_next(&a, Value::Undefined).unwrap().value, num(2.0));
}

#[test]
fn test_next_on_plain_value_fails() {
    let mut engine = engine(100);
    let err = engine.generator_next(&num(1.0), Value::Undefined).unwrap_err();
    assert!(matches!(err, Error::NotAGenerator));
    assert_eq!(err.to_string(), "TypeError: not a generator object");
}

#[test]
fn test_running_generator_cannot_be_resumed() {
    let mut engine = engine(100);
    let mut b = ChunkBuilder::new("gen", 0);
    b.generator();
    b.number(1.0).yield_value().ret();
    let id = engine.define(b.finish().unwrap()).unwrap();
    let generator = engine.call(id, vec![]).unwrap();
    let Value::Generator(object) = &generator else {
        panic!("expected a generator object");
    };
    object.borrow_mut().state = GeneratorState::Running;
    assert!(matches!(
        engine.generator_next(&generator, Value::Undefined),
        Err(Error::GeneratorRunning)
    ));
}
