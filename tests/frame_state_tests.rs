//! Frame-state metadata stays linear in program size

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tierjit::jit::{compile, CompileRequest, CompilerOptions, FeedbackVector, OptimizedUnit};
use tierjit::{Chunk, ChunkBuilder, FunctionId, Value};

/// acc = a; repeated `steps` times: acc = acc + a (or acc + acc); emit(acc); return acc
fn concat_chain(steps: usize, rng: &mut StdRng) -> Chunk {
    let mut b = ChunkBuilder::new("chain", 1);
    let acc = b.local();
    b.get_local(0).set_local(acc);
    for _ in 0..steps {
        if rng.gen_bool(0.5) {
            b.get_local(acc).get_local(0).add().set_local(acc);
        } else {
            b.get_local(acc).get_local(acc).add().dup().emit().set_local(acc);
        }
    }
    b.get_local(acc).ret();
    b.finish().unwrap()
}

fn compile_with(chunk: Chunk, sample: Value) -> OptimizedUnit {
    let mut feedback = FeedbackVector::new(&chunk.call_sites, 4);
    for site in 0..chunk.call_sites.len() as u16 {
        feedback.record_binary(site, &sample, &sample, Some(&sample));
    }
    let request = CompileRequest {
        function: FunctionId(0),
        bytecode_version: 0,
        chunk: Arc::new(chunk),
        feedback,
        globals: Default::default(),
        options: CompilerOptions::default(),
    };
    compile(&request).unwrap()
}

#[test]
fn test_frame_states_bounded_by_guard_points() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..40 {
        let steps = rng.gen_range(1..120);
        let chunk = concat_chain(steps, &mut rng);
        let instructions = chunk.instructions().unwrap().len();
        let width = chunk.local_count as usize + 3;
        let sample = if rng.gen_bool(0.5) { Value::string("ab") } else { Value::Number(0.5) };
        let unit = compile_with(chunk, sample);

        assert!(unit.frame_states.len() <= unit.guards.len());
        assert!(unit.guards.len() <= instructions);
        assert!(
            unit.frame_state_size() <= instructions * width,
            "{} steps: frame-state size {} exceeds {} x {}",
            steps,
            unit.frame_state_size(),
            instructions,
            width
        );
    }
}

#[test]
fn test_frame_state_size_grows_linearly() {
    let sizes: Vec<usize> = [50, 100, 200, 400]
        .iter()
        .map(|&steps| {
            let mut rng = StdRng::seed_from_u64(7);
            compile_with(concat_chain(steps, &mut rng), Value::string("x")).frame_state_size()
        })
        .collect();
    for pair in sizes.windows(2) {
        // doubling the program at most roughly doubles the metadata
        assert!(pair[1] <= pair[0] * 2 + 16, "superlinear growth: {:?}", sizes);
    }
}
