//! Fixed-size pool draining a queue of utterance bases.
//!
//! The producer enqueues every base, then one `None` sentinel per worker, then
//! waits for the queue to drain before joining the workers. A failing (or
//! panicking) unit is logged with its base and the worker moves on, so one bad
//! utterance never stalls the barrier.

use crate::stage::Stage;
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WorkerMode {
    /// Units run inside worker threads.
    #[default]
    Thread,
    /// Each unit runs in a child process of this executable.
    Process,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-utterance unit of work run by every worker of a pool.
pub trait WorkUnit: Send + Sync {
    fn stage(&self) -> Stage;
    fn process(&self, base: &str) -> Result<()>;
}

struct WorkQueue {
    tx: Sender<Option<String>>,
    rx: Receiver<Option<String>>,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn put(&self, item: Option<String>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        // both ends live in `self`, the channel cannot be disconnected
        let _ = self.tx.send(item);
    }

    fn get(&self) -> Option<Option<String>> {
        self.rx.recv().ok()
    }

    fn task_done(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn join(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .drained
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Debug, Default)]
struct WorkerLog {
    processed: Vec<String>,
    failed: Vec<(String, String)>,
    skipped: Vec<String>,
    sentinels: usize,
}

#[derive(Debug)]
pub struct PoolReport {
    pub stage: Stage,
    /// Bases handled by each worker, successful or not.
    pub assignments: Vec<Vec<String>>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
    pub sentinels: usize,
}

impl PoolReport {
    pub fn succeeded(&self) -> usize {
        self.assignments.iter().map(Vec::len).sum::<usize>() - self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        Self {
            size: size.max(1),
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn run(&self, unit: Arc<dyn WorkUnit>, bases: &[String]) -> PoolReport {
        let stage = unit.stage();
        let queue = Arc::new(WorkQueue::new());

        let workers: Vec<_> = (0..self.size)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let unit = Arc::clone(&unit);
                let cancel = self.cancel.clone();
                thread::Builder::new()
                    .name(format!("{stage}-{id}"))
                    .spawn(move || worker_loop(&queue, unit.as_ref(), &cancel))
            })
            .collect();

        for base in bases {
            queue.put(Some(base.clone()));
        }
        let mut spawned = 0;
        for worker in &workers {
            if worker.is_ok() {
                queue.put(None);
                spawned += 1;
            }
        }
        if spawned == 0 {
            error!("{}: no worker could be started", stage);
            return PoolReport {
                stage,
                assignments: Vec::new(),
                failed: bases
                    .iter()
                    .map(|b| (b.clone(), "no worker available".to_string()))
                    .collect(),
                skipped: Vec::new(),
                sentinels: 0,
            };
        }

        queue.join();

        let mut report = PoolReport {
            stage,
            assignments: Vec::with_capacity(self.size),
            failed: Vec::new(),
            skipped: Vec::new(),
            sentinels: 0,
        };
        for worker in workers {
            let log = match worker.map(|handle| handle.join()) {
                Ok(Ok(log)) => log,
                Ok(Err(_)) => {
                    error!("{}: a worker thread panicked outside its unit of work", stage);
                    continue;
                }
                Err(e) => {
                    error!("{}: cannot spawn worker: {}", stage, e);
                    continue;
                }
            };
            report.sentinels += log.sentinels;
            report.failed.extend(log.failed);
            report.skipped.extend(log.skipped);
            report.assignments.push(log.processed);
        }
        debug!(
            "{}: {} succeeded, {} failed, {} skipped",
            stage,
            report.succeeded(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }
}

fn worker_loop(queue: &WorkQueue, unit: &dyn WorkUnit, cancel: &CancellationToken) -> WorkerLog {
    let mut log = WorkerLog::default();
    while let Some(item) = queue.get() {
        let Some(base) = item else {
            log.sentinels += 1;
            queue.task_done();
            break;
        };

        if cancel.is_cancelled() {
            log.skipped.push(base);
            queue.task_done();
            continue;
        }

        let result = catch_unwind(AssertUnwindSafe(|| unit.process(&base)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{} failed for {}: {:#}", unit.stage(), base, e);
                log.failed.push((base.clone(), format!("{e:#}")));
            }
            Err(_) => {
                error!("{} panicked for {}", unit.stage(), base);
                log.failed.push((base.clone(), "panicked".to_string()));
            }
        }
        log.processed.push(base);
        queue.task_done();
    }
    log
}

/// Utterances that dropped out of the run, with the reason.
#[derive(Debug, Default)]
pub struct Ledger {
    failed: BTreeMap<String, String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: impl std::fmt::Display, base: &str, reason: impl std::fmt::Display) {
        warn!("{} dropped at {}: {}", base, stage, reason);
        self.failed
            .entry(base.to_string())
            .or_insert_with(|| format!("{stage}: {reason}"));
    }

    pub fn absorb(&mut self, report: PoolReport) {
        for (base, reason) in report.failed {
            self.record(report.stage, &base, reason);
        }
        for base in report.skipped {
            self.record(report.stage, &base, "cancelled");
        }
    }

    pub fn is_failed(&self, base: &str) -> bool {
        self.failed.contains_key(base)
    }

    /// Bases still worth processing.
    pub fn active(&self, bases: &[String]) -> Vec<String> {
        bases
            .iter()
            .filter(|b| !self.is_failed(b))
            .cloned()
            .collect()
    }

    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl WorkUnit for Recorder {
        fn stage(&self) -> Stage {
            Stage::ParameterConversion
        }

        fn process(&self, base: &str) -> Result<()> {
            thread::sleep(Duration::from_millis(1));
            self.seen.lock().unwrap().push(base.to_string());
            Ok(())
        }
    }

    struct Flaky;

    impl WorkUnit for Flaky {
        fn stage(&self) -> Stage {
            Stage::WorldSynthesis
        }

        fn process(&self, base: &str) -> Result<()> {
            match base {
                "bad" => anyhow::bail!("unreadable"),
                "boom" => panic!("unit panicked"),
                _ => Ok(()),
            }
        }
    }

    fn bases(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("utt{i:03}")).collect()
    }

    #[test]
    fn every_item_processed_exactly_once() {
        for (size, count) in [(1, 0), (1, 7), (3, 20), (8, 5)] {
            let unit = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
            let pool = WorkerPool::new(size, CancellationToken::new());
            let report = pool.run(unit.clone(), &bases(count));

            assert_eq!(report.sentinels, size);
            assert_eq!(report.assignments.len(), size);
            let total: usize = report.assignments.iter().map(Vec::len).sum();
            assert_eq!(total, count);
            let union: BTreeSet<_> = report.assignments.iter().flatten().cloned().collect();
            assert_eq!(union, bases(count).into_iter().collect());
            assert_eq!(unit.seen.lock().unwrap().len(), count);
        }
    }

    #[test]
    fn failures_do_not_stall_the_pool() {
        let items: Vec<String> = ["ok1", "bad", "boom", "ok2"].iter().map(|s| s.to_string()).collect();
        let report = WorkerPool::new(2, CancellationToken::new()).run(Arc::new(Flaky), &items);
        assert_eq!(report.sentinels, 2);
        assert_eq!(report.succeeded(), 2);
        let mut failed: Vec<_> = report.failed.iter().map(|(b, _)| b.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["bad", "boom"]);

        let mut ledger = Ledger::new();
        ledger.absorb(report);
        assert_eq!(ledger.active(&items), vec!["ok1", "ok2"]);
    }

    #[test]
    fn cancelled_pool_drains_without_running_units() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let unit = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let report = WorkerPool::new(4, cancel).run(unit.clone(), &bases(10));
        assert_eq!(report.sentinels, 4);
        assert_eq!(report.skipped.len(), 10);
        assert!(unit.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn zero_size_pool_gets_one_worker() {
        assert_eq!(WorkerPool::new(0, CancellationToken::new()).size(), 1);
    }
}
