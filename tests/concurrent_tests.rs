//! Background compilation: jobs install at call boundaries, stale jobs are dropped

mod common;

use common::*;
use pretty_assertions::assert_eq;
use tierjit::{ChunkBuilder, Engine, EngineConfig, Tier};

fn concurrent(threshold: u32) -> Engine {
    Engine::new(
        EngineConfig::default()
            .with_tier_up_threshold(threshold)
            .with_concurrent_compilation(true),
    )
    .unwrap()
}

#[test]
fn test_background_job_installs_after_finalize() {
    let mut engine = concurrent(3);
    let add = engine.define(add_chunk()).unwrap();
    for _ in 0..3 {
        assert_eq!(engine.call(add, nums(&[1.0, 2.0])).unwrap(), num(3.0));
    }
    // the third call submitted the job and still ran in baseline
    assert_eq!(engine.status(add).unwrap().optimized_calls, 0);

    engine.finalize_optimization();
    assert_eq!(engine.pending_compilations(), 0);
    assert!(engine.is_optimized(add));
    assert_eq!(engine.call(add, nums(&[20.0, 22.0])).unwrap(), num(42.0));
    assert_eq!(engine.status(add).unwrap().optimized_calls, 1);
}

#[test]
fn test_pending_job_is_not_resubmitted() {
    let mut engine = concurrent(1);
    let add = engine.define(add_chunk()).unwrap();
    engine.call(add, nums(&[1.0, 2.0])).unwrap();
    // until the job is installed every call stays in baseline
    for _ in 0..20 {
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        if engine.is_optimized(add) {
            break;
        }
    }
    engine.finalize_optimization();
    assert!(engine.is_optimized(add));
    assert_eq!(engine.stats().compilations, 1);
}

#[test]
fn test_stale_job_discarded_after_bytecode_replacement() {
    let mut engine = concurrent(1);
    let f = engine.define(add_chunk()).unwrap();
    engine.call(f, nums(&[1.0, 2.0])).unwrap();

    let mut b = ChunkBuilder::new("sub", 2);
    b.get_local(0).get_local(1).sub().ret();
    engine.replace_bytecode(f, b.finish().unwrap()).unwrap();
    engine.finalize_optimization();

    assert!(!engine.is_optimized(f));
    assert_eq!(engine.stats().discarded_compilations, 1);
    assert_eq!(engine.call(f, nums(&[5.0, 2.0])).unwrap(), num(3.0));
}

#[test]
fn test_never_optimize_cancels_in_flight_job() {
    let mut engine = concurrent(1);
    let f = engine.define(add_chunk()).unwrap();
    engine.call(f, nums(&[1.0, 2.0])).unwrap();
    engine.never_optimize(f).unwrap();
    engine.finalize_optimization();
    assert!(!engine.is_optimized(f));
    assert_eq!(engine.status(f).unwrap().tier, Tier::Baseline);
    assert_eq!(engine.stats().discarded_compilations, 1);
}

#[test]
fn test_compile_failure_reported_from_worker() {
    let mut engine = concurrent(1);
    let mut b = ChunkBuilder::new("h", 1);
    b.set_flags(tierjit::ChunkFlags::UNSUPPORTED_CONSTRUCT);
    b.get_local(0).ret();
    let h = engine.define(b.finish().unwrap()).unwrap();
    engine.call(h, nums(&[1.0])).unwrap();
    engine.finalize_optimization();
    assert!(!engine.is_optimized(h));
    assert!(engine.status(h).unwrap().compile_disabled);
    assert_eq!(engine.call(h, nums(&[4.0])).unwrap(), num(4.0));
}

#[test]
fn test_results_match_synchronous_engine() {
    let mut sync = engine(4);
    let mut background = concurrent(4);
    let a = sync.define(common::point_chunk()).unwrap();
    let b = background.define(common::point_chunk()).unwrap();
    for i in 0..50 {
        let args = nums(&[i as f64, (i % 7) as f64 + 0.5 * (i % 2) as f64]);
        assert_eq!(background.call(b, args.clone()).unwrap(), sync.call(a, args).unwrap());
        if i % 10 == 0 {
            background.finalize_optimization();
        }
    }
}
