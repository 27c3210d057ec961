//! Property-based tests for task orchestration invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

#![cfg(feature = "test-utils")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use tokio_test::block_on;

use datafed_core::{RecordId, ResourceId, SubjectId};
use datafed_tasks::admission::{self, Dependency};
use datafed_tasks::driver::TaskDriver;
use datafed_tasks::model::ItemRef;
use datafed_tasks::permissions::AclOracle;
use datafed_tasks::preprocess::{self, Mode};
use datafed_tasks::store::memory::InMemoryStore;
use datafed_tasks::store::{ResourceStore, Transaction};
use datafed_tasks::task::{ProjDeletePayload, Task, TaskPayload, TaskStatus};
use datafed_tasks::transfer::{pack_chunks, TransferFile};
use datafed_test_utils::{
    assert_no_conflicting_active_locks, assert_no_edges, fast_config, items, FaultConfig,
    ScriptedExecutor, World, GB,
};

fn arb_files() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..=10_000, 0..24)
}

fn files(sizes: &[u64]) -> Vec<TransferFile> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| TransferFile {
            id: RecordId::from_key(&i.to_string()),
            size: *size,
            from: i.to_string(),
            to: i.to_string(),
        })
        .collect()
}

proptest! {
    /// Every file lands in exactly one chunk, and only a lone file may
    /// exceed the limit.
    #[test]
    fn chunks_partition_files_within_limit(sizes in arb_files(), max in 1u64..=20_000) {
        let chunks = pack_chunks(files(&sizes), max);

        let mut seen: Vec<RecordId> = chunks.iter().flatten().map(|f| f.id.clone()).collect();
        seen.sort();
        let mut expected: Vec<RecordId> = files(&sizes).into_iter().map(|f| f.id).collect();
        expected.sort();
        prop_assert_eq!(seen, expected);

        for chunk in &chunks {
            prop_assert!(!chunk.is_empty());
            let total: u64 = chunk.iter().map(|f| f.size).sum();
            prop_assert!(chunk.len() == 1 || total <= max, "chunk of {} bytes over {}", total, max);
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    /// Admit a task locking `(resource, exclusive)` pairs.
    Admit(Vec<(u8, bool)>),
    /// Finish the n-th runnable task (modulo their count).
    Complete(usize, bool),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop::collection::vec((0u8..4, any::<bool>()), 1..4).prop_map(Op::Admit),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(n, ok)| Op::Complete(n, ok)),
    ]
}

fn new_task() -> Task {
    Task::new(
        SubjectId::user("alice"),
        TaskPayload::ProjDelete(ProjDeletePayload {
            projects: vec![],
            allocs: vec![],
        }),
        1,
    )
}

fn check_admission(tx: &dyn Transaction) {
    assert_no_conflicting_active_locks(tx);
    for task in tx.tasks().unwrap() {
        let blocked = !tx.blockers_of(&task.id).unwrap().is_empty();
        match task.status {
            TaskStatus::Blocked => assert!(blocked, "blocked task {} has no blockers", task.id),
            TaskStatus::Ready | TaskStatus::Running => {
                assert!(!blocked, "runnable task {} is blocked", task.id);
            }
            TaskStatus::Succeeded | TaskStatus::Failed => {
                assert!(tx.locks_held_by(&task.id).unwrap().is_empty());
                assert!(tx.waiting_on(&task.id).unwrap().is_empty());
            }
        }
    }
}

proptest! {
    /// Admission never lets two runnable tasks hold conflicting locks, and
    /// a task is blocked exactly while it has blockers.
    #[test]
    fn admission_keeps_runnable_tasks_conflict_free(ops in prop::collection::vec(arb_op(), 1..40)) {
        let store = InMemoryStore::new();
        let mut tx = store.begin().unwrap();

        for op in ops {
            match op {
                Op::Admit(deps) => {
                    let deps: Vec<Dependency> = deps
                        .into_iter()
                        .map(|(r, exclusive)| {
                            let resource = ResourceId::new(format!("r/{r}"));
                            if exclusive {
                                Dependency::exclusive(resource)
                            } else {
                                Dependency::shared(resource)
                            }
                        })
                        .collect();
                    let mut task = new_task();
                    admission::admit(tx.as_mut(), &mut task, &deps).unwrap();
                }
                Op::Complete(n, success) => {
                    let runnable: Vec<Task> = tx
                        .tasks()
                        .unwrap()
                        .into_iter()
                        .filter(|t| t.status.is_runnable())
                        .collect();
                    if runnable.is_empty() {
                        continue;
                    }
                    let mut task = runnable[n % runnable.len()].clone();
                    if task.status == TaskStatus::Ready {
                        task.transition_to(TaskStatus::Running, "Running").unwrap();
                        tx.put_task(task.clone()).unwrap();
                    }
                    admission::complete(tx.as_mut(), &task.id, success, None).unwrap();
                }
            }
            check_admission(tx.as_ref());
        }
    }
}

fn arb_links() -> impl Strategy<Value = (usize, Vec<u8>, u8)> {
    (1usize..=4).prop_flat_map(|colls| {
        let full = (1u8 << colls) - 1;
        (
            Just(colls),
            prop::collection::vec(1u8..=full, 1..6),
            1u8..=full,
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Deleting collections selects exactly the records whose every parent
    /// is being deleted.
    #[test]
    fn delete_selects_records_without_surviving_parents((colls, parents, deleted) in arb_links()) {
        let world = World::new();
        let alice = world.user("alice");
        let repo = world.repo("store", &[]);
        world.allocation(&alice, &repo, 100 * GB, 100);
        let root = world.root(&alice);

        let collections: Vec<_> = (0..colls)
            .map(|i| world.collection(&format!("c{i}"), &alice, &root))
            .collect();

        let mut expected = BTreeSet::new();
        for (n, mask) in parents.iter().enumerate() {
            let linked: Vec<_> = (0..colls).filter(|i| mask & (1 << i) != 0).collect();
            let rec = world.record(&format!("r{n}"), &alice, GB, &repo, &collections[linked[0]]);
            for i in &linked[1..] {
                world.link(&collections[*i], ItemRef::Record(rec.clone()));
            }
            if mask & !deleted == 0 {
                expected.insert(rec);
            }
        }

        let request: Vec<ItemRef> = (0..colls)
            .filter(|i| deleted & (1 << i) != 0)
            .map(|i| ItemRef::Collection(collections[i].clone()))
            .collect();

        let selected: BTreeSet<RecordId> = world.read(|tx| {
            let client = tx.require_user(&alice).unwrap();
            preprocess::classify(tx, &AclOracle::new(), &client, None, &request, Mode::Delete)
                .unwrap()
                .record_ids()
                .into_iter()
                .collect()
        });
        prop_assert_eq!(selected, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever the worker does, a record move ends with every record
    /// settled in exactly one allocation.
    #[test]
    fn record_moves_conserve_allocation_totals(
        sizes in prop::collection::vec(1u64..=3, 1..6),
        seed in any::<u64>(),
        failure_rate in 0.0f64..0.6,
        permanent in any::<bool>(),
    ) {
        let world = World::with_config(fast_config().with_max_xfr_size(4 * GB));
        let admin = world.admin("admin");
        let alice = world.user("alice");
        let src = world.repo("src", &[&admin]);
        let dst = world.repo("dst", &[&admin]);
        world.allocation(&alice, &src, 100 * GB, 100);
        world.allocation(&alice, &dst, 100 * GB, 100);
        let root = world.root(&alice);

        let records: Vec<RecordId> = sizes
            .iter()
            .enumerate()
            .map(|(n, size)| world.record(&format!("r{n}"), &alice, size * GB, &src, &root))
            .collect();
        let refs: Vec<&RecordId> = records.iter().collect();
        let total: u64 = sizes.iter().sum::<u64>() * GB;

        let task = block_on(world.service().init_rec_alloc_change(
            &alice,
            &items(&refs),
            &dst,
            None,
            false,
        ))
        .unwrap()
        .task
        .unwrap();

        let executor = ScriptedExecutor::with_seed(seed).configure_faults(FaultConfig {
            failure_rate,
            permanent,
        });
        let driver = TaskDriver::new(world.service(), executor);
        block_on(driver.drain()).unwrap();

        let done = world.read(|tx| tx.require_task(&task.id)).unwrap();
        prop_assert!(done.status.is_terminal(), "task left {}", done.status);
        assert_no_edges(&world, &task.id);

        world.read(|tx| {
            let at_src = tx.allocation(&alice, &src).unwrap().unwrap();
            let at_dst = tx.allocation(&alice, &dst).unwrap().unwrap();
            assert_eq!(at_src.rec_count + at_dst.rec_count, records.len() as u64);
            assert_eq!(at_src.data_size + at_dst.data_size, total);

            for id in &records {
                let loc = tx.location(id).unwrap().unwrap();
                assert!(!loc.is_moving(), "record {id} left mid-move");
                if done.status == TaskStatus::Succeeded {
                    assert_eq!(loc.repo, dst);
                }
            }
        });
    }
}
