use std::collections::HashSet;

use lockstep_core::{BlockAllocator, CacheConfig, CacheError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire { seq: usize, blocks: usize },
    Grow { seq: usize, blocks: usize },
    Release { seq: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..8usize, 0..12usize).prop_map(|(seq, blocks)| Op::Acquire { seq, blocks }),
        (0..8usize, 1..6usize).prop_map(|(seq, blocks)| Op::Grow { seq, blocks }),
        (0..8usize).prop_map(|seq| Op::Release { seq }),
    ]
}

fn check_invariants(alloc: &BlockAllocator) {
    let info = alloc.info();
    assert!(info.used_blocks <= info.total_blocks);
    assert_eq!(info.used_blocks + info.free_blocks, info.total_blocks);

    let mut seen = HashSet::new();
    let mut owned = 0;
    for seq in 0..8 {
        let Some(table) = alloc.block_table(seq) else {
            continue;
        };
        for &block in table {
            assert!(seen.insert(block), "block {block} is in two tables");
            assert_eq!(alloc.owner(block), Some(seq));
        }
        owned += table.len();
    }
    assert_eq!(owned, info.used_blocks);
}

proptest! {
    #[test]
    fn used_blocks_never_exceed_the_pool(
        num_blocks in 1..24usize,
        ops in proptest::collection::vec(op(), 1..64),
    ) {
        let mut alloc = BlockAllocator::new(CacheConfig {
            block_size: 4,
            num_blocks,
            ..Default::default()
        });
        for op in ops {
            let free_before = alloc.num_free_blocks();
            match op {
                Op::Acquire { seq, blocks } => {
                    let held = alloc.block_table(seq).is_some();
                    match alloc.acquire(seq, blocks).map(<[_]>::len) {
                        Ok(len) => prop_assert_eq!(len, blocks),
                        Err(CacheError::AlreadyAllocated(id)) => {
                            prop_assert!(held);
                            prop_assert_eq!(id, seq);
                        }
                        Err(CacheError::OutOfMemory { .. }) => {
                            prop_assert!(blocks > free_before);
                            prop_assert_eq!(alloc.num_free_blocks(), free_before);
                        }
                        Err(CacheError::ExceedsCapacity { .. }) => {
                            prop_assert!(blocks > num_blocks);
                            prop_assert!(alloc.block_table(seq).is_none());
                        }
                        Err(e) => prop_assert!(false, "unexpected {e}"),
                    }
                }
                Op::Grow { seq, blocks } => {
                    let before = alloc.block_table(seq).map(<[_]>::to_vec);
                    match alloc.grow(seq, blocks).map(<[_]>::to_vec) {
                        Ok(table) => {
                            let before = before.unwrap_or_default();
                            prop_assert_eq!(table.len(), before.len() + blocks);
                            prop_assert_eq!(&table[..before.len()], before.as_slice());
                        }
                        Err(_) => {
                            prop_assert_eq!(alloc.num_free_blocks(), free_before);
                            prop_assert_eq!(alloc.block_table(seq).map(<[_]>::to_vec), before);
                        }
                    }
                }
                Op::Release { seq } => {
                    let held = alloc.block_table(seq).map_or(0, <[_]>::len);
                    prop_assert_eq!(alloc.release(seq), held);
                    prop_assert_eq!(alloc.num_free_blocks(), free_before + held);
                }
            }
            check_invariants(&alloc);
        }
    }
}
