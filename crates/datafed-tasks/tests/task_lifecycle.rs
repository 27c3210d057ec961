//! End-to-end task scenarios: init, drive through the worker loop, and
//! inspect the catalog afterwards.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use datafed_core::{perm, RepoId, SubjectId};
use datafed_tasks::driver::TaskDriver;
use datafed_tasks::error::{Error, Result};
use datafed_tasks::machines::{MachineRegistry, StepContext, StepOutcome, StepRunner};
use datafed_tasks::model::{ItemRef, User};
use datafed_tasks::permissions::{AclOracle, LocalPermissions, PermissionOracle};
use datafed_tasks::preprocess::{self, Mode};
use datafed_tasks::service::{ListFilter, TaskService};
use datafed_tasks::store::memory::InMemoryStore;
use datafed_tasks::store::Transaction;
use datafed_tasks::task::{Command, Encryption, TaskPayload, TaskStatus, TaskType};
use datafed_tasks::transfer::AllocTarget;
use datafed_test_utils::{
    assert_allocation, assert_no_conflicting_active_locks, assert_no_edges, assert_task_status,
    fast_config, init_test_logging, items, ScriptedExecutor, World, GB,
};

struct Setup {
    world: World,
    alice: SubjectId,
    admin: SubjectId,
    src: RepoId,
    dst: RepoId,
}

/// Alice with 10 GB allocations on two repositories.
fn setup_with(world: World) -> Setup {
    init_test_logging();
    let admin = world.admin("admin");
    let alice = world.user("alice");
    let src = world.repo("src", &[&admin]);
    let dst = world.repo("dst", &[&admin]);
    world.allocation(&alice, &src, 10 * GB, 10);
    world.allocation(&alice, &dst, 10 * GB, 10);
    Setup {
        world,
        alice,
        admin,
        src,
        dst,
    }
}

fn setup() -> Setup {
    setup_with(World::new())
}

fn driver(world: &World) -> TaskDriver<InMemoryStore, ScriptedExecutor> {
    TaskDriver::new(world.service(), ScriptedExecutor::new())
}

// --- Allocations ---

#[tokio::test]
async fn allocation_create_then_delete() {
    let s = setup();
    let bob = s.world.user("bob");
    let service = s.world.service();

    let task = service
        .init_alloc_create(&s.admin, &s.src, &bob, 5 * GB, 100)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Ready);

    let dup = service
        .init_alloc_create(&s.admin, &s.src, &bob, 5 * GB, 100)
        .await
        .unwrap_err();
    assert!(matches!(dup, Error::InUse(_)), "{dup}");

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    assert_no_edges(&s.world, &task.id);
    assert_allocation(&s.world, &bob, &s.src, 0, 0);

    let exists = service
        .init_alloc_create(&s.admin, &s.src, &bob, 5 * GB, 100)
        .await
        .unwrap_err();
    assert!(matches!(exists, Error::InvalidParam(_)), "{exists}");

    let task = service.init_alloc_delete(&s.admin, &s.src, &bob).await.unwrap();
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    assert!(s.world.read(|tx| tx.allocation(&bob, &s.src)).unwrap().is_none());
    assert_eq!(d.executor().labels(), vec!["alloc_create", "alloc_delete"]);
}

#[tokio::test]
async fn allocation_changes_need_repo_admin() {
    let s = setup();
    let bob = s.world.user("bob");
    let err = s
        .world
        .service()
        .init_alloc_create(&s.alice, &s.src, &bob, GB, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    let missing = s
        .world
        .service()
        .init_alloc_create(&s.admin, &s.src, &SubjectId::user("nobody"), GB, 1)
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::NotFound { .. }), "{missing}");
}

#[tokio::test]
async fn allocation_with_records_cannot_be_deleted() {
    let s = setup();
    let root = s.world.root(&s.alice);
    s.world.record("r1", &s.alice, GB, &s.src, &root);

    let err = s
        .world
        .service()
        .init_alloc_delete(&s.admin, &s.src, &s.alice)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InUse(_)), "{err}");
}

#[tokio::test]
async fn failed_allocation_delete_restores_allocation() {
    let s = setup();
    let service = s.world.service();
    let task = service
        .init_alloc_delete(&s.admin, &s.dst, &s.alice)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_nth("alloc_delete", 0, true);
    let d = TaskDriver::new(service, executor);
    d.drive(&task.id).await.unwrap();

    assert_task_status(&s.world, &task.id, TaskStatus::Failed);
    assert_allocation(&s.world, &s.alice, &s.dst, 0, 0);
    assert_no_edges(&s.world, &task.id);
}

// --- Data get / put ---

#[tokio::test]
async fn data_get_groups_by_source_and_forwards_credentials() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 5 * GB, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, 3 * GB, &s.src, &root);
    let r3 = s.world.record("r3", &s.alice, GB, &s.dst, &root);

    let init = s
        .world
        .service()
        .init_data_get(&s.alice, "laptop/downloads", Encryption::Available, &items(&[&r1, &r2, &r3]), false, false)
        .await
        .unwrap();
    assert_eq!(init.classification.managed.len(), 3);
    let task = init.task.unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);

    let commands = d.executor().succeeded_for(&task.id);
    assert_eq!(commands.len(), 2);
    let Command::RawDataTransfer(params) = &commands[0] else {
        panic!("expected transfer, got {:?}", commands[0]);
    };
    assert_eq!(params.encrypt, Encryption::Available);
    assert_eq!(params.descriptor.dst_endpoint, "laptop");
    assert_eq!(params.descriptor.dst_path, "/downloads/");
    assert_eq!(params.descriptor.files.len(), 2);
    let credentials = params.credentials.as_ref().unwrap();
    assert_eq!(credentials.access_token, "alice-access");
    assert!(credentials.expires_in > 0);
}

#[tokio::test]
async fn data_get_check_mode_creates_no_task() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);

    let init = s
        .world
        .service()
        .init_data_get(&s.alice, "laptop/downloads", Encryption::None, &items(&[&r1]), false, true)
        .await
        .unwrap();
    assert!(init.task.is_none());
    assert_eq!(init.classification.managed[0].id, r1);
    assert!(s.world.service().reload().unwrap().is_empty());
}

#[tokio::test]
async fn data_get_rejects_duplicate_original_names() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, GB, &s.src, &root);
    s.world.write(|tx| {
        for (id, source) in [(&r1, "ep1/a/data.h5"), (&r2, "ep2/b/data.h5")] {
            let mut rec = tx.require_record(id).unwrap();
            rec.source = Some(source.to_string());
            tx.put_record(rec).unwrap();
        }
    });

    let err = s
        .world
        .service()
        .init_data_get(&s.alice, "laptop/downloads", Encryption::None, &items(&[&r1, &r2]), true, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransferConflict(_)), "{err}");

    let bad_path = s
        .world
        .service()
        .init_data_get(&s.alice, "/no/endpoint", Encryption::None, &items(&[&r1]), false, false)
        .await
        .unwrap_err();
    assert!(matches!(bad_path, Error::InvalidParam(_)), "{bad_path}");
}

#[tokio::test]
async fn data_get_requires_read_permission() {
    let s = setup();
    let bob = s.world.user("bob");
    let root = s.world.root(&s.alice);
    let shared = s.world.collection("shared", &s.alice, &root);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &shared);

    let service = s.world.service();
    let err = service
        .init_data_get(&bob, "laptop/x", Encryption::None, &items(&[&r1]), false, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    s.world.grant(shared.clone(), &bob, perm::LIST, perm::RD_DATA);
    let init = service
        .init_data_get(&bob, "laptop/x", Encryption::None, &[ItemRef::Collection(shared)], false, true)
        .await
        .unwrap();
    assert_eq!(init.classification.managed.len(), 1);
}

#[tokio::test]
async fn data_put_records_source_and_extension() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 0, &s.src, &root);

    let init = s
        .world
        .service()
        .init_data_put(&s.alice, "laptop/out/result.tar.gz", Encryption::None, Some("tgz"), &items(&[&r1]), false)
        .await
        .unwrap();
    let task = init.task.unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    assert_eq!(d.executor().labels(), vec!["raw_data_transfer", "raw_data_update_size"]);

    let rec = s.world.read(|tx| tx.require_record(&r1)).unwrap();
    assert_eq!(rec.source.as_deref(), Some("laptop/out/result.tar.gz"));
    assert_eq!(rec.ext.as_deref(), Some(".tgz"));
    assert!(!rec.ext_auto);
}

#[tokio::test]
async fn data_put_updates_sizes_in_every_repository() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 0, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, 0, &s.dst, &root);

    let task = s
        .world
        .service()
        .init_data_put(&s.alice, "laptop/out/result.h5", Encryption::None, None, &items(&[&r1, &r2]), false)
        .await
        .unwrap()
        .task
        .unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);

    let updated: Vec<_> = d
        .executor()
        .succeeded_for(&task.id)
        .into_iter()
        .filter_map(|command| match command {
            Command::RawDataUpdateSize(files) => Some((files.repo_id, files.ids)),
            _ => None,
        })
        .collect();
    assert_eq!(updated, vec![(s.src.clone(), vec![r1.clone()]), (s.dst.clone(), vec![r2.clone()])]);

    for id in [&r1, &r2] {
        let rec = s.world.read(|tx| tx.require_record(id)).unwrap();
        assert_eq!(rec.source.as_deref(), Some("laptop/out/result.h5"));
        assert_eq!(rec.ext.as_deref(), Some(".h5"));
    }
}

#[tokio::test]
async fn data_put_rejects_collections_and_bare_directories() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 0, &s.src, &root);
    let service = s.world.service();

    let err = service
        .init_data_put(&s.alice, "laptop/out/", Encryption::None, None, &items(&[&r1]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");

    let err = service
        .init_data_put(&s.alice, "laptop/out/f", Encryption::None, None, &[ItemRef::Collection(root)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
}

// --- Record moves ---

#[tokio::test]
async fn allocation_change_splits_transfers_by_size() {
    let s = setup_with(World::with_config(fast_config().with_max_xfr_size(4 * GB)));
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 5 * GB, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, 3 * GB, &s.src, &root);
    let r3 = s.world.record("r3", &s.alice, GB, &s.src, &root);

    let init = s
        .world
        .service()
        .init_rec_alloc_change(&s.alice, &items(&[&r1, &r2, &r3]), &s.dst, None, false)
        .await
        .unwrap();
    assert_eq!((init.tot_cnt, init.act_cnt, init.act_size), (3, 3, 9 * GB));
    let task = init.task.unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);

    let done = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    let TaskPayload::RecAllocChange(state) = &done.payload else {
        panic!("unexpected payload");
    };
    assert_eq!(state.xfr.len(), 2);
    assert_eq!(done.steps, 10);
    assert_eq!(
        d.executor().labels(),
        vec!["raw_data_transfer", "raw_data_delete", "raw_data_transfer", "raw_data_delete"]
    );

    assert_allocation(&s.world, &s.alice, &s.src, 0, 0);
    assert_allocation(&s.world, &s.alice, &s.dst, 3, 9 * GB);
    s.world.read(|tx| {
        for id in [&r1, &r2, &r3] {
            let loc = tx.location(id).unwrap().unwrap();
            assert_eq!(loc.repo, s.dst);
            assert!(!loc.is_moving());
        }
    });
}

#[tokio::test]
async fn allocation_change_check_reports_capacity() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, 2 * GB, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, GB, &s.dst, &root);

    let init = s
        .world
        .service()
        .init_rec_alloc_change(&s.alice, &items(&[&r1, &r2]), &s.dst, None, true)
        .await
        .unwrap();
    assert!(init.task.is_none());
    assert_eq!((init.tot_cnt, init.act_cnt, init.act_size), (2, 1, 2 * GB));
    assert_eq!((init.data_limit, init.data_size), (10 * GB, GB));
    assert_eq!((init.rec_limit, init.rec_count), (10, 1));
}

#[tokio::test]
async fn allocation_change_over_capacity_fails_cleanly() {
    let s = setup();
    let tight = s.world.repo("tight", &[&s.admin]);
    s.world.allocation(&s.alice, &tight, 10 * GB, 1);
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);
    let r2 = s.world.record("r2", &s.alice, GB, &s.src, &root);

    let task = s
        .world
        .service()
        .init_rec_alloc_change(&s.alice, &items(&[&r1, &r2]), &tight, None, false)
        .await
        .unwrap()
        .task
        .unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();

    let failed = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("record count limit"));
    assert!(d.executor().labels().is_empty());
    assert_allocation(&s.world, &s.alice, &s.src, 2, 2 * GB);
    assert_allocation(&s.world, &s.alice, &tight, 0, 0);
    assert_no_edges(&s.world, &task.id);
}

#[tokio::test]
async fn allocation_change_only_moves_the_owners_records() {
    let s = setup();
    let project = s.world.project("p1", &s.alice, &[], &[]);
    s.world.allocation(&project, &s.src, 10 * GB, 10);
    s.world.allocation(&project, &s.dst, 1, 0);
    let shared = s.world.record("shared", &project, GB, &s.src, &s.world.root(&project));
    let service = s.world.service();

    let err = service
        .init_rec_alloc_change(&s.alice, &items(&[&shared]), &s.dst, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    let mine = s.world.record("mine", &s.alice, GB, &s.src, &s.world.root(&s.alice));
    let err = service
        .init_rec_alloc_change(&s.alice, &items(&[&mine]), &s.dst, Some(&project), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    s.world.read(|tx| {
        assert!(tx.tasks().unwrap().is_empty());
        assert!(!tx.location(&shared).unwrap().unwrap().is_moving());
    });
    assert_allocation(&s.world, &s.alice, &s.dst, 0, 0);
    assert_allocation(&s.world, &project, &s.dst, 0, 0);
}

#[tokio::test]
async fn failed_transfer_reverts_pending_moves() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);

    let task = s
        .world
        .service()
        .init_rec_alloc_change(&s.alice, &items(&[&r1]), &s.dst, None, false)
        .await
        .unwrap()
        .task
        .unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_nth("raw_data_transfer", 0, true);
    let d = TaskDriver::new(s.world.service(), executor);
    d.drive(&task.id).await.unwrap();

    let failed = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("scripted raw_data_transfer failure"));
    s.world.read(|tx| {
        let loc = tx.location(&r1).unwrap().unwrap();
        assert_eq!(loc.repo, s.src);
        assert!(!loc.is_moving());
    });
    assert_allocation(&s.world, &s.alice, &s.src, 1, GB);
    assert_allocation(&s.world, &s.alice, &s.dst, 0, 0);
}

#[tokio::test]
async fn owner_change_moves_records_into_new_owner_collection() {
    let s = setup();
    let bob = s.world.user("bob");
    s.world.allocation(&bob, &s.dst, 10 * GB, 10);
    let inbox = s.world.collection("inbox", &bob, &s.world.root(&bob));
    s.world.grant(inbox.clone(), &s.alice, perm::CREATE, 0);

    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);
    let e1 = s.world.external_record("e1", &s.alice, "globus/share/e1.csv", &root);
    s.world.alias(&r1, "results");

    let service = s.world.service();
    let check = service
        .init_rec_owner_change(&s.alice, &items(&[&r1, &e1]), &inbox, None, true)
        .await
        .unwrap();
    assert!(check.task.is_none());
    assert_eq!(check.allocs.len(), 1);
    assert_eq!(check.allocs[0].repo, s.dst);

    let init = service
        .init_rec_owner_change(&s.alice, &items(&[&r1, &e1]), &inbox, Some(&s.dst), false)
        .await
        .unwrap();
    assert_eq!((init.tot_cnt, init.act_cnt, init.act_size), (2, 2, GB));
    let task = init.task.unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    assert_eq!(d.executor().labels(), vec!["raw_data_transfer", "raw_data_delete"]);

    s.world.read(|tx| {
        for id in [&r1, &e1] {
            let rec = tx.require_record(id).unwrap();
            assert_eq!(rec.owner, bob);
            assert_eq!(
                tx.parents(&ItemRef::Record(id.clone())).unwrap(),
                vec![inbox.clone()]
            );
        }
        let loc = tx.location(&r1).unwrap().unwrap();
        assert_eq!((loc.repo.clone(), loc.uid.clone()), (s.dst.clone(), bob.clone()));
        assert_eq!(tx.alias_target("u:bob:results").unwrap(), Some(r1.clone()));
        assert_eq!(tx.alias_target("u:alice:results").unwrap(), None);
    });
    assert_allocation(&s.world, &s.alice, &s.src, 0, 0);
    assert_allocation(&s.world, &bob, &s.dst, 1, GB);
}

#[tokio::test]
async fn owner_change_needs_create_on_destination() {
    let s = setup();
    let bob = s.world.user("bob");
    s.world.allocation(&bob, &s.dst, 10 * GB, 10);
    let inbox = s.world.collection("inbox", &bob, &s.world.root(&bob));
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &s.world.root(&s.alice));

    let err = s
        .world
        .service()
        .init_rec_owner_change(&s.alice, &items(&[&r1]), &inbox, Some(&s.dst), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");
}

// --- Deletes ---

#[tokio::test]
async fn delete_keeps_records_linked_elsewhere() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let coll = s.world.collection("batch", &s.alice, &root);
    let only_here = s.world.record("r1", &s.alice, GB, &s.src, &coll);
    let also_root = s.world.record("r2", &s.alice, GB, &s.src, &coll);
    s.world.link(&root, also_root.clone());

    let init = s
        .world
        .service()
        .init_rec_coll_delete(&s.alice, &[ItemRef::Collection(coll.clone())])
        .await
        .unwrap();
    assert_eq!(init.classification.visits.get(&only_here), Some(&1));
    assert_eq!(init.classification.visits.get(&also_root), Some(&1));
    assert_eq!(init.classification.record_ids(), vec![only_here.clone()]);
    let task = init.task.unwrap();

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);

    let commands = d.executor().succeeded_for(&task.id);
    let [Command::RawDataDelete(files)] = commands.as_slice() else {
        panic!("expected one delete, got {commands:?}");
    };
    assert_eq!(files.ids, vec![only_here.clone()]);
    assert_eq!(files.repo_path, "/mnt/src/user/alice/");

    s.world.read(|tx| {
        assert!(tx.record(&only_here).unwrap().is_none());
        assert!(tx.collection(&coll).unwrap().is_none());
        assert!(tx.record(&also_root).unwrap().is_some());
        assert_eq!(
            tx.parents(&ItemRef::Record(also_root.clone())).unwrap(),
            vec![root.clone()]
        );
    });
    assert_allocation(&s.world, &s.alice, &s.src, 1, GB);
}

#[tokio::test]
async fn explicit_records_are_always_deleted() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let coll = s.world.collection("batch", &s.alice, &root);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &coll);
    s.world.link(&root, r1.clone());

    let init = s
        .world
        .service()
        .init_rec_coll_delete(&s.alice, &[ItemRef::Record(r1.clone())])
        .await
        .unwrap();
    assert_eq!(init.classification.visits.get(&r1), Some(&-1));
    assert_eq!(init.classification.record_ids(), vec![r1.clone()]);
    s.world.read(|tx| {
        assert!(tx.parents(&ItemRef::Record(r1.clone())).unwrap().is_empty());
    });
}

#[tokio::test]
async fn named_records_are_deleted_whatever_the_request_order() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let batch = s.world.collection("batch", &s.alice, &root);
    let keep = s.world.collection("keep", &s.alice, &root);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &batch);
    s.world.link(&keep, r1.clone());
    s.world.link(&root, r1.clone());

    let record_last = [ItemRef::Collection(batch.clone()), ItemRef::Record(r1.clone())];
    let record_first = [ItemRef::Record(r1.clone()), ItemRef::Collection(batch.clone())];
    for request in [&record_last, &record_first] {
        let classification = s.world.read(|tx| {
            let client = tx.require_user(&s.alice).unwrap();
            preprocess::classify(tx, &AclOracle::new(), &client, None, request, Mode::Delete)
                .unwrap()
        });
        assert_eq!(classification.visits.get(&r1), Some(&-1));
        assert_eq!(classification.record_ids(), vec![r1.clone()]);
    }

    let task = s
        .world
        .service()
        .init_rec_coll_delete(&s.alice, &record_last)
        .await
        .unwrap()
        .task
        .unwrap();
    driver(&s.world).drive(&task.id).await.unwrap();

    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    s.world.read(|tx| {
        assert!(tx.record(&r1).unwrap().is_none());
        assert!(tx.collection(&keep).unwrap().is_some());
    });
    assert_allocation(&s.world, &s.alice, &s.src, 0, 0);
}

#[tokio::test]
async fn delete_refuses_public_and_locked_data() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let public = s.world.collection("public", &s.alice, &root);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &public);
    s.world.publish(&public, "physics.runs");
    let service = s.world.service();

    let err = service
        .init_rec_coll_delete(&s.alice, &items(&[&r1]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    let r2 = s.world.record("r2", &s.alice, GB, &s.src, &root);
    service
        .init_rec_alloc_change(&s.alice, &items(&[&r2]), &s.dst, None, false)
        .await
        .unwrap();
    let err = service
        .init_rec_coll_delete(&s.alice, &items(&[&r2]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InUse(_)), "{err}");

    let err = service
        .init_rec_coll_delete(&s.alice, &[ItemRef::Collection(root)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");
}

#[tokio::test]
async fn project_delete_removes_everything_it_owns() {
    let s = setup();
    let bob = s.world.user("bob");
    let proj = s.world.project("climate", &s.alice, &[&bob], &[&bob]);
    s.world.allocation(&proj, &s.src, 10 * GB, 10);
    let proot = s.world.root(&proj);
    let data = s.world.collection("runs", &proj, &proot);
    let r1 = s.world.record("p1", &proj, GB, &s.src, &data);

    let service = s.world.service();
    let err = service.init_proj_delete(&bob, &[proj.clone()]).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");

    let task = service.init_proj_delete(&s.alice, &[proj.clone()]).await.unwrap();
    let project = s.world.read(|tx| tx.require_project(&proj)).unwrap();
    assert!(project.admins.is_empty() && project.members.is_empty());

    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);
    assert_eq!(d.executor().labels(), vec!["alloc_delete"]);

    s.world.read(|tx| {
        assert!(tx.project(&proj).unwrap().is_none());
        assert!(tx.record(&r1).unwrap().is_none());
        assert!(tx.collection(&data).unwrap().is_none());
        assert!(tx.collection(&proot).unwrap().is_none());
        assert!(tx.allocation(&proj, &s.src).unwrap().is_none());
    });
}

// --- Run protocol ---

#[tokio::test]
async fn mismatched_step_is_rejected_without_side_effects() {
    let s = setup();
    let bob = s.world.user("bob");
    let service = s.world.service();
    let task = service
        .init_alloc_create(&s.admin, &s.src, &bob, GB, 1)
        .await
        .unwrap();

    let reply = service.run(&task.id, None, None).await.unwrap();
    assert_eq!(reply.step, Some(1));
    assert!(matches!(reply.command, Command::AllocCreate(_)));

    let before = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    let err = service.run(&task.id, Some(2), None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
    let after = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert_eq!(before, after);

    let reply = service.run(&task.id, Some(1), None).await.unwrap();
    assert!(reply.is_stop());
    assert_task_status(&s.world, &task.id, TaskStatus::Succeeded);

    let err = service.run(&task.id, None, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
}

#[tokio::test]
async fn resumed_task_repeats_its_pending_command() {
    let s = setup();
    let bob = s.world.user("bob");
    let service = s.world.service();
    let task = service
        .init_alloc_create(&s.admin, &s.src, &bob, GB, 1)
        .await
        .unwrap();

    let first = service.run(&task.id, None, None).await.unwrap();
    let again = service.run(&task.id, None, None).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(service.reload().unwrap(), vec![task.id]);
}

#[tokio::test]
async fn conflicting_tasks_queue_and_drain_in_order() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);
    let service = s.world.service();

    let first = service
        .init_rec_alloc_change(&s.alice, &items(&[&r1]), &s.dst, None, false)
        .await
        .unwrap()
        .task
        .unwrap();
    let second = service
        .init_data_put(&s.alice, "laptop/new.dat", Encryption::None, None, &items(&[&r1]), false)
        .await
        .unwrap()
        .task
        .unwrap();
    assert_eq!(second.status, TaskStatus::Blocked);
    assert_eq!(service.view(&second.id).unwrap().blocked_by, vec![first.id]);
    assert_eq!(service.view(&first.id).unwrap().blocking, vec![second.id]);
    s.world.read(assert_no_conflicting_active_locks);

    let d = driver(&s.world);
    let driven = d.drain().await.unwrap();
    assert_eq!(driven, vec![first.id, second.id]);
    assert_task_status(&s.world, &first.id, TaskStatus::Succeeded);
    assert_task_status(&s.world, &second.id, TaskStatus::Succeeded);
    assert_no_edges(&s.world, &second.id);

    // The upload ran after the move, so it targets the new repository.
    let uploads: Vec<_> = d
        .executor()
        .succeeded_for(&second.id)
        .into_iter()
        .filter_map(|c| match c {
            Command::RawDataTransfer(p) => Some(p.descriptor),
            _ => None,
        })
        .collect();
    assert_eq!(uploads[0].dst_repo.as_ref(), Some(&s.dst));
}

#[tokio::test]
async fn abort_releases_waiting_tasks() {
    let s = setup();
    let root = s.world.root(&s.alice);
    let r1 = s.world.record("r1", &s.alice, GB, &s.src, &root);
    let service = s.world.service();

    let put = |path: &'static str| {
        let service = service.clone();
        let ids = items(&[&r1]);
        let alice = s.alice.clone();
        async move {
            service
                .init_data_put(&alice, path, Encryption::None, None, &ids, false)
                .await
                .unwrap()
                .task
                .unwrap()
        }
    };
    let first = put("laptop/a.dat").await;
    let second = put("laptop/b.dat").await;
    assert_eq!(second.status, TaskStatus::Blocked);

    let ready = service.abort(&first.id, Some("cancelled by user")).await.unwrap();
    assert_eq!(ready, vec![second.id]);
    let aborted = s.world.read(|tx| tx.require_task(&first.id)).unwrap();
    assert_eq!(aborted.status, TaskStatus::Failed);
    assert_eq!(aborted.error.as_deref(), Some("cancelled by user"));
    assert_task_status(&s.world, &second.id, TaskStatus::Ready);
    assert_no_edges(&s.world, &first.id);

    let err = service.abort(&first.id, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
}

// --- Queries and housekeeping ---

#[tokio::test]
async fn list_filters_and_orders_by_update_time() {
    let s = setup();
    let bob = s.world.user("bob");
    let carol = s.world.user("carol");
    let service = s.world.service();

    let t1 = service.init_alloc_create(&s.admin, &s.src, &bob, GB, 1).await.unwrap();
    let t2 = service.init_alloc_create(&s.admin, &s.src, &carol, GB, 1).await.unwrap();
    driver(&s.world).drive(&t1.id).await.unwrap();

    let all = service.list(&s.admin, &ListFilter::default()).unwrap();
    assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![t1.id, t2.id]);

    let ready = service
        .list(
            &s.admin,
            &ListFilter {
                status: vec![TaskStatus::Ready],
                ..ListFilter::default()
            },
        )
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, t2.id);

    let recent = service
        .list(
            &s.admin,
            &ListFilter {
                since: Some(Duration::from_secs(3600)),
                count: Some(1),
                ..ListFilter::default()
            },
        )
        .unwrap();
    assert_eq!(recent.len(), 1);

    assert!(service.list(&bob, &ListFilter::default()).unwrap().is_empty());
}

#[tokio::test]
async fn purge_and_delete_only_touch_finished_tasks() {
    let s = setup();
    let bob = s.world.user("bob");
    let carol = s.world.user("carol");
    let service = s.world.service();

    let done = service.init_alloc_create(&s.admin, &s.src, &bob, GB, 1).await.unwrap();
    let pending = service.init_alloc_create(&s.admin, &s.src, &carol, GB, 1).await.unwrap();
    driver(&s.world).drive(&done.id).await.unwrap();

    let err = service.delete_task(&pending.id).await.unwrap_err();
    assert!(matches!(err, Error::InUse(_)), "{err}");

    assert_eq!(service.purge(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(service.purge(Duration::ZERO).await.unwrap(), 1);
    assert!(service.view(&done.id).is_err());
    assert!(service.view(&pending.id).is_ok());
}

#[tokio::test]
async fn write_conflicts_are_retried() {
    let s = setup();
    let bob = s.world.user("bob");
    let service = s.world.service();

    s.world.store().inject_conflicts(3).unwrap();
    let task = service.init_alloc_create(&s.admin, &s.src, &bob, GB, 1).await.unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Ready);

    s.world.store().inject_conflicts(50).unwrap();
    let err = service.abort(&task.id, None).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
    s.world.store().inject_conflicts(0).unwrap();
    assert_task_status(&s.world, &task.id, TaskStatus::Ready);
}

// --- Pluggable policy ---

/// Delegates to the ACL oracle but recognizes no repository administrators.
struct NoRepoAdmins(AclOracle);

impl PermissionOracle for NoRepoAdmins {
    fn is_admin_of_object(
        &self,
        tx: &dyn Transaction,
        client: &User,
        owner: &SubjectId,
        creator: &SubjectId,
    ) -> Result<bool> {
        self.0.is_admin_of_object(tx, client, owner, creator)
    }

    fn is_repo_admin(&self, _tx: &dyn Transaction, _client: &User, _repo: &RepoId) -> Result<bool> {
        Ok(false)
    }

    fn is_project_admin(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool> {
        self.0.is_project_admin(tx, client, project)
    }

    fn is_project_manager(
        &self,
        tx: &dyn Transaction,
        client: &User,
        project: &SubjectId,
    ) -> Result<bool> {
        self.0.is_project_manager(tx, client, project)
    }

    fn local_permissions(
        &self,
        tx: &dyn Transaction,
        client: &SubjectId,
        item: &ItemRef,
        inherit_until: Option<u32>,
    ) -> Result<LocalPermissions> {
        self.0.local_permissions(tx, client, item, inherit_until)
    }

    fn has_permissions(
        &self,
        tx: &dyn Transaction,
        client: &User,
        item: &ItemRef,
        requested: u32,
        inherited: bool,
    ) -> Result<bool> {
        self.0.has_permissions(tx, client, item, requested, inherited)
    }
}

#[tokio::test]
async fn service_consults_its_permission_oracle() {
    let service = TaskService::new(InMemoryStore::new(), fast_config())
        .with_oracle(Arc::new(NoRepoAdmins(AclOracle::new())));
    let s = setup_with(World::with_service(service));
    let bob = s.world.user("bob");

    let err = s
        .world
        .service()
        .init_alloc_create(&s.admin, &s.src, &bob, GB, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");
}

/// Refuses to plan new allocations.
struct FrozenAllocations;

impl StepRunner for FrozenAllocations {
    fn task_type(&self) -> TaskType {
        TaskType::AllocCreate
    }

    fn plan(&self, _ctx: &mut StepContext<'_>) -> Result<i64> {
        Err(Error::InvalidParam("allocations are frozen".into()))
    }

    fn step(&self, _ctx: &mut StepContext<'_>, _step: i64) -> Result<StepOutcome> {
        Err(Error::InternalFault("frozen runner has no steps".into()))
    }
}

#[tokio::test]
async fn registered_state_machine_replaces_the_standard_one() {
    let mut machines = MachineRegistry::standard();
    machines.register(Box::new(FrozenAllocations));
    let service = TaskService::new(InMemoryStore::new(), fast_config()).with_machines(machines);
    let s = setup_with(World::with_service(service));
    let bob = s.world.user("bob");

    let task = s
        .world
        .service()
        .init_alloc_create(&s.admin, &s.src, &bob, GB, 1)
        .await
        .unwrap();
    let d = driver(&s.world);
    d.drive(&task.id).await.unwrap();

    assert_task_status(&s.world, &task.id, TaskStatus::Failed);
    assert_no_edges(&s.world, &task.id);
    assert!(d.executor().labels().is_empty());
    let failed = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert!(failed.message.contains("allocations are frozen"), "{}", failed.message);
    assert!(s.world.read(|tx| tx.allocation(&bob, &s.src)).unwrap().is_none());
}


/// Plans like the standard allocation create but cannot undo its command.
struct BrokenUndo;

impl StepRunner for BrokenUndo {
    fn task_type(&self) -> TaskType {
        TaskType::AllocCreate
    }

    fn plan(&self, _ctx: &mut StepContext<'_>) -> Result<i64> {
        Ok(3)
    }

    fn step(&self, ctx: &mut StepContext<'_>, _step: i64) -> Result<StepOutcome> {
        let TaskPayload::AllocCreate(state) = &ctx.task.payload else {
            return Err(Error::InternalFault("unexpected payload".into()));
        };
        Ok(StepOutcome::Command(Command::AllocCreate(AllocTarget {
            repo_id: state.repo_id.clone(),
            repo_path: state.repo_path.clone(),
        })))
    }

    fn rollback(&self, _ctx: &mut StepContext<'_>, _step: i64) -> Result<()> {
        Err(Error::InternalFault("undo broke".into()))
    }
}

#[tokio::test]
async fn failed_rollback_reports_both_errors() {
    let mut machines = MachineRegistry::standard();
    machines.register(Box::new(BrokenUndo));
    let service = TaskService::new(InMemoryStore::new(), fast_config()).with_machines(machines);
    let s = setup_with(World::with_service(service));
    let bob = s.world.user("bob");
    let service = s.world.service();

    let task = service
        .init_alloc_create(&s.admin, &s.src, &bob, GB, 1)
        .await
        .unwrap();
    let reply = service.run(&task.id, None, None).await.unwrap();
    assert_eq!(reply.step, Some(1));

    let reply = service.run(&task.id, None, Some("worker died")).await.unwrap();
    assert!(reply.is_stop());

    let failed = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("worker died (Rollback failed: internal fault: undo broke)")
    );
    assert_no_edges(&s.world, &task.id);

    let err = service
        .run(&task.id, None, Some("worker died"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
    assert_eq!(s.world.read(|tx| tx.require_task(&task.id)).unwrap(), failed);
}

#[tokio::test]
async fn repeated_failure_report_does_not_roll_back_twice() {
    let s = setup();
    let service = s.world.service();
    let task = service
        .init_alloc_delete(&s.admin, &s.dst, &s.alice)
        .await
        .unwrap();

    let reply = service.run(&task.id, None, None).await.unwrap();
    assert!(matches!(reply.command, Command::AllocDelete(_)));
    assert!(s.world.read(|tx| tx.allocation(&s.alice, &s.dst)).unwrap().is_none());

    assert!(service
        .run(&task.id, None, Some("storage offline"))
        .await
        .unwrap()
        .is_stop());
    let failed = s.world.read(|tx| tx.require_task(&task.id)).unwrap();
    assert_eq!(failed.error.as_deref(), Some("storage offline"));
    assert_allocation(&s.world, &s.alice, &s.dst, 0, 0);

    let err = service
        .run(&task.id, None, Some("storage offline"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)), "{err}");
    assert_eq!(s.world.read(|tx| tx.require_task(&task.id)).unwrap(), failed);
    assert_allocation(&s.world, &s.alice, &s.dst, 0, 0);
    assert_no_edges(&s.world, &task.id);
}
