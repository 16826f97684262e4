// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{fixture, wait_until};
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;
use test_log::test;
use vinyl_scheduler::{ErrorInjection, LsmTree, Statement, VylogRecord};

#[test]
fn dump_roundtrip_preserves_keys() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    lsm.insert(Statement::new_value("apple", "1", 1));
    lsm.insert(Statement::new_value("banana", "2", 2));
    lsm.insert(Statement::new_value("cherry", "3", 3));

    fx.scheduler.dump()?;

    let stats = lsm.stats();
    assert_eq!(1, stats.run_count);
    assert_eq!(0, stats.sealed_mem_count);
    assert_eq!(1, stats.dump_count);
    assert_eq!(3, stats.dumped_in_stmts);
    assert_eq!(3, stats.dumped_out_stmts);
    assert_eq!(Some(3), lsm.dump_lsn());

    // The data must be readable back from the slice
    let ranges = lsm.ranges();
    let slices = ranges[0].slices();
    assert_eq!(1, slices.len());

    let read: Vec<Statement> = slices[0]
        .scan(fx.dir.path())?
        .collect::<vinyl_scheduler::Result<_>>()?;
    assert_eq!(
        vec![
            Statement::new_value("apple", "1", 1),
            Statement::new_value("banana", "2", 2),
            Statement::new_value("cherry", "3", 3),
        ],
        read,
    );

    // Run lifecycle is journaled
    let records = fx.vylog.committed();
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::PrepareRun { lsm_id, .. } if *lsm_id == lsm.id())));
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::CreateRun { dump_lsn: Some(3), .. })));
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::InsertSlice { .. })));
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::DumpLsm { dump_lsn: Some(3), .. })));

    // Round bookkeeping
    let stats = fx.scheduler.stats();
    assert_eq!(stats.generation, stats.dump_generation);
    assert!(!fx.scheduler.dump_in_progress());
    assert_eq!(1, fx.rounds.load(Relaxed));
    assert_eq!(0, stats.dump_task_count);

    Ok(())
}

#[test]
fn empty_dump_completes_round() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    fx.scheduler.dump()?;

    // Nothing was written, but the round is over and was reported
    assert!(!fx.scheduler.dump_in_progress());
    assert_eq!(1, fx.rounds.load(Relaxed));
    assert_eq!(0, lsm.stats().run_count);
    assert!(fx
        .vylog
        .committed()
        .iter()
        .all(|r| !matches!(r, VylogRecord::CreateRun { .. })));

    Ok(())
}

#[test]
fn tombstone_only_dump_logs_dump_lsm_without_run() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    // With no runs on disk the dump merges at the last level and the
    // tombstones evaporate: the new run comes out empty.
    lsm.insert(Statement::new_tombstone("ghost", 7));

    fx.scheduler.dump()?;

    let records = fx.vylog.committed();
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::DumpLsm { dump_lsn: Some(7), .. })));
    assert!(!records
        .iter()
        .any(|r| matches!(r, VylogRecord::CreateRun { .. })));
    // The prepared run was discarded
    assert!(records
        .iter()
        .any(|r| matches!(r, VylogRecord::DropRun { .. })));

    assert_eq!(0, lsm.stats().run_count);
    assert_eq!(0, lsm.stats().sealed_mem_count);
    assert_eq!(1, fx.rounds.load(Relaxed));

    Ok(())
}

#[test]
fn secondary_index_dumps_before_primary() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let pk = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    let sk = LsmTree::new(512, 1, Some(pk.clone()), fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&pk);
    fx.scheduler.add_lsm(&sk);

    pk.insert(Statement::new_value("k", "v", 1));
    sk.insert(Statement::new_value("v", "k", 1));

    fx.scheduler.dump()?;

    let records = fx.vylog.committed();
    let dump_order: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            VylogRecord::DumpLsm { lsm_id, .. } => Some(*lsm_id),
            _ => None,
        })
        .collect();

    // On WAL replay the primary must not be ahead of its secondaries,
    // so the secondary dumps first.
    assert_eq!(vec![sk.id(), pk.id()], dump_order);

    assert_eq!(1, pk.stats().run_count);
    assert_eq!(1, sk.stats().run_count);
    assert_eq!(0, pk.pin_count());

    let stats = fx.scheduler.stats();
    assert_eq!(stats.generation, stats.dump_generation);

    Ok(())
}

#[test]
fn trigger_dump_is_idempotent_while_round_runs() {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    lsm.insert(Statement::new_value("a", "1", 1));

    // Hold the dump task in its execute phase
    ErrorInjection::set(&fx.config.errinj.run_write_delay, true);

    fx.scheduler.trigger_dump();
    assert!(wait_until(Duration::from_secs(5), || {
        fx.scheduler.stats().dump_task_count > 0
    }));

    let generation = fx.scheduler.stats().generation;

    fx.scheduler.trigger_dump();
    fx.scheduler.trigger_dump();
    assert_eq!(generation, fx.scheduler.stats().generation);

    ErrorInjection::set(&fx.config.errinj.run_write_delay, false);

    assert!(wait_until(Duration::from_secs(5), || {
        !fx.scheduler.dump_in_progress()
    }));
    assert_eq!(generation, fx.scheduler.stats().dump_generation);
    assert_eq!(1, lsm.stats().run_count);
}

#[test]
fn dropped_lsm_does_not_wedge_the_round() {
    let fx = fixture();
    let doomed = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    // A second, empty tree keeps the heap honest about round completion
    let idle = LsmTree::new(513, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&doomed);
    fx.scheduler.add_lsm(&idle);

    doomed.insert(Statement::new_value("a", "1", 1));

    ErrorInjection::set(&fx.config.errinj.run_write_delay, true);

    fx.scheduler.trigger_dump();
    assert!(wait_until(Duration::from_secs(5), || {
        fx.scheduler.stats().dump_task_count > 0
    }));

    // Drop the tree while its dump is mid-flight
    doomed.mark_dropped();
    fx.scheduler.remove_lsm(&doomed);

    ErrorInjection::set(&fx.config.errinj.run_write_delay, false);

    // The silent abort must still close the round
    assert!(wait_until(Duration::from_secs(5), || {
        !fx.scheduler.dump_in_progress()
    }));

    // The doomed tree's prepared run was rolled back
    assert_eq!(0, doomed.stats().run_count);
    assert!(fx
        .vylog
        .committed()
        .iter()
        .any(|r| matches!(r, VylogRecord::DropRun { .. })));
    assert!(!fx.scheduler.stats().is_throttled, "a drop is not an error");
}
