// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{fixture, wait_until};
use std::time::Duration;
use test_log::test;
use vinyl_scheduler::{LsmTree, Statement};

#[test]
fn checkpoint_advances_generation_by_one() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    lsm.insert(Statement::new_value("a", "1", 1));

    let before = fx.scheduler.stats().generation;

    fx.scheduler.begin_checkpoint()?;
    fx.scheduler.wait_checkpoint()?;
    fx.scheduler.end_checkpoint();

    let stats = fx.scheduler.stats();
    assert_eq!(before + 1, stats.generation);
    assert_eq!(stats.generation, stats.dump_generation);
    assert!(!stats.checkpoint_in_progress);
    assert_eq!(1, lsm.stats().run_count);

    Ok(())
}

#[test]
fn trigger_dump_during_checkpoint_is_postponed() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    lsm.insert(Statement::new_value("a", "1", 1));

    fx.scheduler.begin_checkpoint()?;
    fx.scheduler.wait_checkpoint()?;

    // The checkpoint's dump round is over but the checkpoint itself is
    // still open: a dump request must be parked, not started.
    let generation = fx.scheduler.stats().generation;
    fx.scheduler.trigger_dump();

    let stats = fx.scheduler.stats();
    assert!(stats.dump_pending);
    assert_eq!(generation, stats.generation, "no round may start yet");

    lsm.insert(Statement::new_value("b", "2", 2));
    fx.scheduler.end_checkpoint();

    // The parked dump starts now
    let stats = fx.scheduler.stats();
    assert!(!stats.dump_pending);
    assert_eq!(generation + 1, stats.generation);

    assert!(wait_until(Duration::from_secs(5), || {
        !fx.scheduler.dump_in_progress()
    }));
    assert_eq!(2, lsm.stats().run_count);

    Ok(())
}

#[test]
fn dump_waits_for_open_checkpoint() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    let lsm = LsmTree::new(512, 0, None, fx.config.clone(), fx.vylog.clone());
    fx.scheduler.add_lsm(&lsm);

    fx.scheduler.begin_checkpoint()?;
    fx.scheduler.wait_checkpoint()?;

    let scheduler = &fx.scheduler;
    std::thread::scope(|scope| {
        let dumper = scope.spawn(|| scheduler.dump());

        // The dump call must park while the checkpoint is open
        std::thread::sleep(Duration::from_millis(50));
        assert!(!dumper.is_finished());

        scheduler.end_checkpoint();
        dumper.join().expect("dump thread should not panic")
    })?;

    Ok(())
}

#[test]
fn wait_checkpoint_without_checkpoint_is_a_noop() -> vinyl_scheduler::Result<()> {
    let fx = fixture();
    fx.scheduler.wait_checkpoint()?;
    Ok(())
}
