//! Fuzz target for arena allocation sequences.
//!
//! Any sequence of malloc/realloc/free on live chunks must keep the
//! free + used + overhead accounting equal to the region size.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pb_arena::{Arena, Chunk};

#[derive(Debug, Arbitrary)]
enum Op {
    Malloc(u16),
    Realloc(u8, u16),
    Free(u8),
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(mut arena) = Arena::create("fuzz", 32 * 1024, true) else {
        return;
    };
    let mut live: Vec<Chunk> = Vec::new();

    for op in ops {
        match op {
            Op::Malloc(size) => {
                if let Some(chunk) = arena.malloc(u64::from(size)) {
                    live.push(chunk);
                }
            }
            Op::Realloc(i, size) if !live.is_empty() => {
                let idx = usize::from(i) % live.len();
                if let Some(chunk) = arena.realloc(live[idx], u64::from(size)) {
                    live[idx] = chunk;
                }
            }
            Op::Free(i) if !live.is_empty() => {
                let idx = usize::from(i) % live.len();
                arena.free(live.swap_remove(idx));
            }
            _ => {}
        }

        let stats = arena.stats();
        assert_eq!(
            stats.free_size + stats.used_size + stats.overhead,
            arena.total_size()
        );
    }

    for chunk in live {
        arena.free(chunk);
    }
    assert_eq!(arena.stats().used_chunks, 0);
});
