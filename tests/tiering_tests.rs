//! Tier-up, never-optimize and compile-failure behavior through the public engine API

mod common;

use common::*;
use pretty_assertions::assert_eq;
use tierjit::jit::{Cardinality, DeoptReason};
use tierjit::{ChunkBuilder, ChunkFlags, EngineConfig, Engine, Tier, Value};

mod tier_up {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stays_baseline_below_threshold() {
        let mut engine = engine(10);
        let add = engine.define(add_chunk()).unwrap();
        for i in 0..9 {
            engine.call(add, nums(&[i as f64, 1.0])).unwrap();
        }
        let status = engine.status(add).unwrap();
        assert_eq!(status.tier, Tier::Baseline);
        assert_eq!(status.invocation_count, 9);
        assert_eq!(status.baseline_calls, 9);
    }

    #[test]
    fn test_optimized_at_threshold() {
        let mut engine = engine(10);
        let add = engine.define(add_chunk()).unwrap();
        for i in 0..10 {
            assert_eq!(engine.call(add, nums(&[i as f64, 1.0])).unwrap(), num(i as f64 + 1.0));
        }
        assert!(engine.is_optimized(add));
        let status = engine.status(add).unwrap();
        assert_eq!(status.compilations, 1);
        assert_eq!(status.optimized_calls, 1);
    }

    #[test]
    fn test_forced_optimization_ignores_threshold() {
        let mut engine = engine(1_000_000);
        let add = optimized(&mut engine, add_chunk(), &[nums(&[1.0, 2.0])]);
        assert_eq!(engine.call(add, nums(&[40.0, 2.0])).unwrap(), num(42.0));
        assert_eq!(engine.stats().compilations, 1);
    }

    #[test]
    fn test_prepare_for_optimization_restarts_warmup() {
        let mut engine = engine(5);
        let add = engine.define(add_chunk()).unwrap();
        for _ in 0..4 {
            engine.call(add, nums(&[1.0, 2.0])).unwrap();
        }
        engine.prepare_for_optimization(add).unwrap();
        assert_eq!(engine.status(add).unwrap().invocation_count, 0);
        assert_eq!(engine.feedback(add).unwrap().slots()[0].cardinality(), Cardinality::Uninitialized);
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        assert!(!engine.is_optimized(add));
    }

    #[test]
    fn test_megamorphic_site_defers_tier_up() {
        // f(o) { return o.v }
        let mut engine = Engine::new(
            EngineConfig {
                max_polymorphism: 2,
                max_optimizable_polymorphism: 2,
                ..EngineConfig::default()
            }
            .with_tier_up_threshold(4),
        )
        .unwrap();
        let mut b = ChunkBuilder::new("f", 1);
        b.get_local(0).get_named("v").ret();
        let f = engine.define(b.finish().unwrap()).unwrap();

        let receivers = [
            engine.new_object(&[("v", num(1.0))]),
            engine.new_object(&[("a", num(0.0)), ("v", num(2.0))]),
            engine.new_object(&[("b", num(0.0)), ("v", num(3.0))]),
        ];
        for _ in 0..3 {
            for (i, r) in receivers.iter().enumerate() {
                assert_eq!(engine.call(f, vec![r.clone()]).unwrap(), num(i as f64 + 1.0));
            }
        }
        assert_eq!(engine.feedback(f).unwrap().slots()[0].cardinality(), Cardinality::Megamorphic);
        assert!(!engine.is_optimized(f));
    }
}

mod scenarios {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_overflow_returns_exact_value_and_deopts() {
        let mut engine = engine(100);
        let add = engine.define(add_chunk()).unwrap();
        for _ in 0..150 {
            assert_eq!(engine.call(add, nums(&[1.0, 2.0])).unwrap(), num(3.0));
        }
        engine.optimize_on_next_call(add).unwrap();
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        assert!(engine.is_optimized(add));

        let big = 2f64.powi(31);
        assert_eq!(engine.call(add, nums(&[big, big])).unwrap(), num(2f64.powi(32)));
        assert!(!engine.is_optimized(add));
        assert_eq!(engine.stats().deopts, 1);
    }

    #[test]
    fn test_smi_overflow_in_range_deopts_with_overflow_reason() {
        let mut engine = engine(100);
        let add = optimized(&mut engine, add_chunk(), &[nums(&[1.0, 2.0])]);
        let max = i32::MAX as f64;
        assert_eq!(engine.call(add, nums(&[max, 1.0])).unwrap(), num(max + 1.0));
        assert_eq!(engine.stats().deopts_for(DeoptReason::Overflow), 1);

        // the overflow result was recorded, so the next compile takes the float path
        engine.optimize_on_next_call(add).unwrap();
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        assert!(engine.is_optimized(add));
        assert_eq!(engine.call(add, nums(&[max, 1.0])).unwrap(), num(max + 1.0));
        assert!(engine.is_optimized(add));
    }

    #[test]
    fn test_second_shape_makes_site_polymorphic() {
        let mut engine = engine(100);
        let mut b = ChunkBuilder::new("f", 1);
        b.get_local(0).get_named("x").ret();
        let f = engine.define(b.finish().unwrap()).unwrap();

        let first = engine.new_object(&[("x", num(1.0))]);
        engine.call(f, vec![first]).unwrap();
        assert_eq!(engine.feedback(f).unwrap().slots()[0].cardinality(), Cardinality::Monomorphic);

        let second = engine.new_object(&[("x", num(1.0)), ("y", num(2.0))]);
        assert_eq!(engine.call(f, vec![second]).unwrap(), num(1.0));
        assert_eq!(engine.feedback(f).unwrap().slots()[0].cardinality(), Cardinality::Polymorphic);
    }

    #[test]
    fn test_polymorphic_load_optimizes_and_deopts_on_new_shape() {
        let mut engine = engine(100);
        let mut b = ChunkBuilder::new("f", 1);
        b.get_local(0).get_named("x").ret();
        let a = engine.new_object(&[("x", num(1.0))]);
        let b2 = engine.new_object(&[("y", num(0.0)), ("x", num(2.0))]);
        let f = optimized(&mut engine, b.finish().unwrap(), &[vec![a.clone()], vec![b2.clone()]]);

        assert_eq!(engine.call(f, vec![b2]).unwrap(), num(2.0));
        assert!(engine.is_optimized(f));
        let c = engine.new_object(&[("z", num(0.0)), ("x", num(3.0))]);
        assert_eq!(engine.call(f, vec![c]).unwrap(), num(3.0));
        assert_eq!(engine.stats().deopts_for(DeoptReason::WrongShape), 1);
        assert_eq!(engine.call(f, vec![Value::Null]).unwrap_err().to_string(),
            "TypeError: Cannot read properties of null (reading 'x')");
    }

    #[test]
    fn test_never_optimize_holds_for_ten_thousand_calls() {
        let mut engine = engine(10);
        let g = engine.define(add_chunk()).unwrap();
        engine.never_optimize(g).unwrap();
        for i in 0..10_000 {
            engine.call(g, nums(&[i as f64, 1.0])).unwrap();
            assert!(!engine.is_optimized(g));
        }
        engine.optimize_on_next_call(g).unwrap();
        engine.call(g, nums(&[1.0, 1.0])).unwrap();
        assert!(!engine.is_optimized(g));
        assert_eq!(engine.stats().compilations, 0);
    }

    #[test]
    fn test_unsupported_construct_stays_baseline() {
        let mut engine = engine(3);
        let mut b = ChunkBuilder::new("h", 2);
        b.set_flags(ChunkFlags::UNSUPPORTED_CONSTRUCT);
        b.get_local(0).get_local(1).mul().ret();
        let h = engine.define(b.finish().unwrap()).unwrap();
        for i in 0..20 {
            assert_eq!(engine.call(h, nums(&[i as f64, 2.0])).unwrap(), num(i as f64 * 2.0));
            assert!(!engine.is_optimized(h));
        }
        assert_eq!(engine.stats().compile_failures, 1);
        assert!(engine.status(h).unwrap().compile_disabled);
    }

    #[test]
    fn test_repeated_deopts_enter_cooldown() {
        let mut engine = Engine::new(
            EngineConfig::default()
                .with_deopt_retry_budget(2)
                .with_cooldown_invocations(10),
        )
        .unwrap();
        let add = engine.define(add_chunk()).unwrap();
        for _ in 0..3 {
            engine.prepare_for_optimization(add).unwrap();
            engine.call(add, nums(&[1.0, 2.0])).unwrap();
            engine.optimize_on_next_call(add).unwrap();
            engine.call(add, nums(&[1.0, 2.0])).unwrap();
            assert!(engine.is_optimized(add));
            assert_eq!(engine.call(add, nums(&[0.5, 2.0])).unwrap(), num(2.5));
        }
        assert_eq!(engine.stats().cooldowns, 1);

        // fourth attempt is deferred while the function keeps running in baseline
        engine.prepare_for_optimization(add).unwrap();
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        engine.optimize_on_next_call(add).unwrap();
        assert_eq!(engine.call(add, nums(&[3.0, 4.0])).unwrap(), num(7.0));
        assert!(!engine.is_optimized(add));
        let status = engine.status(add).unwrap();
        assert_eq!(status.deopt_count, 3);
        assert_eq!(status.cooldown_remaining, 8);

        // the pending request is honored once the cooldown runs out
        for _ in 0..8 {
            engine.call(add, nums(&[1.0, 2.0])).unwrap();
        }
        assert!(!engine.is_optimized(add));
        engine.call(add, nums(&[1.0, 2.0])).unwrap();
        assert!(engine.is_optimized(add));
    }
}

mod replace {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replaced_bytecode_gets_fresh_feedback() {
        let mut engine = engine(100);
        let f = optimized(&mut engine, add_chunk(), &[nums(&[1.0, 2.0])]);
        let mut b = ChunkBuilder::new("f2", 2);
        b.get_local(0).get_local(1).mul().ret();
        engine.replace_bytecode(f, b.finish().unwrap()).unwrap();

        let status = engine.status(f).unwrap();
        assert_eq!(status.tier, Tier::Baseline);
        assert_eq!(status.bytecode_version, 1);
        assert_eq!(status.name, "f2");
        assert_eq!(engine.feedback(f).unwrap().slots()[0].cardinality(), Cardinality::Uninitialized);
        assert_eq!(engine.call(f, nums(&[3.0, 4.0])).unwrap(), num(12.0));
    }

    #[test]
    fn test_replace_rejects_malformed_bytecode() {
        let mut engine = engine(100);
        let f = engine.define(add_chunk()).unwrap();
        let mut bad = add_chunk();
        bad.code.push(0xff);
        assert!(engine.replace_bytecode(f, bad).unwrap_err().is_fatal());
        assert_eq!(engine.call(f, nums(&[1.0, 2.0])).unwrap(), num(3.0));
    }
}
