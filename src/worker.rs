// Copyright (c) 2024-present, vinyl-scheduler
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::scheduler::SchedulerShared;
use crate::task::Task;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Which pool a worker belongs to.
///
/// Dumps get their own pool so they are never starved by long compactions;
/// a stalled dump stalls foreground writes waiting on memory quota.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PoolKind {
    Dump,
    Compact,
}

impl PoolKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dump => "dump",
            Self::Compact => "compact",
        }
    }
}

/// Identifies a borrowed worker so completion can return it to its pool.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorkerHandle {
    pub kind: PoolKind,
    pub index: usize,
}

pub(crate) enum WorkerMsg {
    Execute(Box<Task>),
    Shutdown,
}

struct Worker {
    sender: Sender<WorkerMsg>,
    thread: Option<JoinHandle<()>>,
}

/// A fixed set of worker threads, started lazily on first use so they are
/// not dangling around if the engine never writes.
pub(crate) struct WorkerPool {
    kind: PoolKind,
    size: usize,
    workers: Vec<Worker>,
    idle: Vec<usize>,
}

impl WorkerPool {
    pub fn new(kind: PoolKind, size: usize) -> Self {
        assert!(size > 0, "a worker pool cannot be empty");

        Self {
            kind,
            size,
            workers: Vec::new(),
            idle: Vec::new(),
        }
    }

    fn start(&mut self, shared: &Arc<SchedulerShared>) {
        debug_assert!(self.workers.is_empty());
        log::debug!("starting {} vinyl {} workers", self.size, self.kind.name());

        for index in 0..self.size {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let shared = shared.clone();

            let thread = std::thread::Builder::new()
                .name(format!("vinyl.{}.{index}", self.kind.name()))
                .spawn(move || worker_loop(&shared, &receiver))
                .expect("failed to spawn vinyl worker thread");

            self.workers.push(Worker {
                sender,
                thread: Some(thread),
            });
            self.idle.push(index);
        }
    }

    /// Borrows an idle worker, or `None` if all are busy. Never blocks.
    pub fn get(&mut self, shared: &Arc<SchedulerShared>) -> Option<WorkerHandle> {
        if self.workers.is_empty() {
            self.start(shared);
        }

        self.idle.pop().map(|index| WorkerHandle {
            kind: self.kind,
            index,
        })
    }

    /// Returns a borrowed worker to the idle list.
    pub fn put(&mut self, handle: WorkerHandle) {
        debug_assert_eq!(self.kind, handle.kind);
        debug_assert!(!self.idle.contains(&handle.index));
        self.idle.push(handle.index);
    }

    /// Ships a task to its assigned worker.
    pub fn send(&self, task: Box<Task>) {
        let index = task.worker.index;

        if let Some(worker) = self.workers.get(index) {
            // Workers only disconnect on shutdown; the task is then
            // aborted by the teardown path
            let _ = worker.sender.send(WorkerMsg::Execute(task));
        }
    }

    /// Asks every worker to exit after finishing its current task and
    /// hands back the join handles; joining happens outside the scheduler
    /// lock so workers can still deliver completions.
    pub fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for worker in &mut self.workers {
            let _ = worker.sender.send(WorkerMsg::Shutdown);

            if let Some(thread) = worker.thread.take() {
                handles.push(thread);
            }
        }

        handles
    }
}

/// Worker thread main loop: execute tasks, ship them back to tx.
fn worker_loop(shared: &Arc<SchedulerShared>, receiver: &Receiver<WorkerMsg>) {
    while let Ok(msg) = receiver.recv() {
        match msg {
            WorkerMsg::Execute(mut task) => {
                if let Err(e) = task.execute() {
                    if !task.is_failed {
                        task.is_failed = true;
                        task.error = Some(e);
                    }
                }

                shared.push_processed(task);
            }
            WorkerMsg::Shutdown => break,
        }
    }
}
