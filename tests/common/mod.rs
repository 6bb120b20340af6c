//! Shared test helpers for integration tests

use tierjit::{Chunk, ChunkBuilder, Engine, EngineConfig, FunctionId, Value};

/// Engine with the given tier-up threshold and otherwise default settings
pub fn engine(threshold: u32) -> Engine {
    Engine::new(EngineConfig::default().with_tier_up_threshold(threshold)).unwrap()
}

pub fn num(n: f64) -> Value {
    Value::Number(n)
}

pub fn nums(values: &[f64]) -> Vec<Value> {
    values.iter().copied().map(Value::Number).collect()
}

/// add(a, b) { return a + b }
pub fn add_chunk() -> Chunk {
    let mut b = ChunkBuilder::new("add", 2);
    b.get_local(0).get_local(1).add().ret();
    b.finish().unwrap()
}

/// point(a, b) { p = { x: a, y: b }; return p.x * p.y + p.x }
#[allow(dead_code)]
pub fn point_chunk() -> Chunk {
    let mut b = ChunkBuilder::new("point", 2);
    let p = b.local();
    b.create_object().get_local(0).define_named("x").get_local(1).define_named("y").set_local(p);
    b.get_local(p).get_named("x").get_local(p).get_named("y").mul();
    b.get_local(p).get_named("x").add().ret();
    b.finish().unwrap()
}

/// Define `chunk`, warm it with `warm` and force it into the optimized tier
#[allow(dead_code)]
pub fn optimized(engine: &mut Engine, chunk: Chunk, warm: &[Vec<Value>]) -> FunctionId {
    let id = engine.define(chunk).unwrap();
    for args in warm {
        engine.call(id, args.clone()).unwrap();
    }
    engine.optimize_on_next_call(id).unwrap();
    engine.call(id, warm[0].clone()).unwrap();
    assert!(engine.is_optimized(id), "{} did not tier up", engine.status(id).unwrap());
    id
}

/// Run `chunk` once in a baseline-only engine
#[allow(dead_code)]
pub fn baseline_result(chunk: Chunk, args: Vec<Value>) -> tierjit::Result<Value> {
    let mut engine = Engine::default();
    let id = engine.define(chunk)?;
    engine.never_optimize(id)?;
    engine.call(id, args)
}
