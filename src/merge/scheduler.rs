//! C9: MergeScheduler — a fixed-size thread pool that runs merge tasks
//! handed to it by a `LeveledCompactor`, sharing one bounded sub-worker
//! pool (§4.9) across every task it ever runs.

use super::context::CancelToken;
use super::level::{LeveledCompactor, PendingMerge};
use super::task::SubWorkerPool;
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum Job {
    Run {
        pending: PendingMerge,
        journal_dir: PathBuf,
    },
    Shutdown,
}

/// `mergeThreadNum` worker threads draining a shared job queue. Every
/// worker shares the scheduler's single `SubWorkerPool`: the sub-pool's
/// capacity is a property of the whole scheduler, not of any one task
/// (§4.9).
pub struct MergeScheduler {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl MergeScheduler {
    pub fn start(compactor: Arc<LeveledCompactor>, thread_num: usize, sub_worker_num: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let sub_pool = Arc::new(SubWorkerPool::new(sub_worker_num));
        let cancel = CancelToken::new();

        let mut workers = Vec::with_capacity(thread_num.max(1));
        for index in 0..thread_num.max(1) {
            let receiver = receiver.clone();
            let compactor = compactor.clone();
            let sub_pool = sub_pool.clone();
            let cancel = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("merge-worker-{index}"))
                .spawn(move || worker_loop(receiver, compactor, sub_pool, cancel))
                .expect("failed to spawn merge worker thread");
            workers.push(handle);
        }

        Self {
            sender,
            workers,
            cancel,
        }
    }

    /// Enqueues one pending merge for a worker to pick up. Non-blocking;
    /// the scheduler's thread pool provides the only backpressure.
    pub fn submit(&self, pending: PendingMerge, journal_dir: PathBuf) -> Result<()> {
        self.sender
            .send(Job::Run { pending, journal_dir })
            .map_err(|_| Error::Inconsistent("merge scheduler has shut down".to_string()))
    }

    /// Cooperative cancellation (§4.9, §5): every running and future task
    /// observes this and aborts at its next chunk or file boundary.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Stops accepting new work and joins every worker thread.
    pub fn shutdown(self) {
        for _ in &self.workers {
            self.sender.send(Job::Shutdown).ok();
        }
        for worker in self.workers {
            worker.join().ok();
        }
    }
}

fn worker_loop(
    receiver: Arc<Mutex<Receiver<Job>>>,
    compactor: Arc<LeveledCompactor>,
    sub_pool: Arc<SubWorkerPool>,
    cancel: CancelToken,
) {
    loop {
        let job = {
            let guard = receiver.lock().expect("merge scheduler queue lock poisoned");
            guard.recv()
        };
        match job {
            Ok(Job::Run { pending, journal_dir }) => {
                let partition = pending.partition.clone();
                let task_id = uuid::Uuid::new_v4();
                let span = tracing::info_span!("merge_task", partition = %partition, task_id = %task_id);
                let _enter = span.enter();
                if let Err(e) = compactor.run_and_apply(pending, &cancel, &sub_pool, &journal_dir) {
                    tracing::warn!(partition = %partition, error = %e, "merge task failed");
                }
            }
            Ok(Job::Shutdown) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;
    use crate::io::codec::FileCatalogue;
    use crate::merge::context::CompactionContext;
    use crate::model::{SegmentKind, Timestamp};
    use std::path::Path;
    use tempfile::TempDir;

    fn env() -> CompactionContext {
        CompactionContext::new(
            Arc::new(FileCatalogue::new()),
            Arc::new(|_p: &Path| Err(Error::Inconsistent("no reader in test env".to_string()))),
            Arc::new(|_p: &Path| Err(Error::Inconsistent("no writer in test env".to_string()))),
            Arc::new(|_p: &Path, _s: u64, _e: Vec<crate::model::ChunkMetadata>| {
                Err(Error::Inconsistent("no resume writer in test env".to_string()))
            }),
            MergeConfig::default(),
        )
    }

    #[test]
    fn submitted_job_with_empty_selection_fails_without_crashing_the_worker() {
        let dir = TempDir::new().unwrap();
        let compactor = Arc::new(LeveledCompactor::new(env()));
        let scheduler = MergeScheduler::start(compactor, 1, 1);

        let pending = PendingMerge {
            partition: "sg1".to_string(),
            plan: super::super::task::MergeTaskPlan {
                selection: super::super::selector::Selection::default(),
                mode: super::super::resource::CommitMode::Squeeze,
                concurrent_merge_series_num: 1,
            },
            output_level: 1,
            output_kind: SegmentKind::Sequence,
        };
        scheduler.submit(pending, dir.path().to_path_buf()).unwrap();
        scheduler.shutdown();
        // The worker thread must still have exited cleanly even though the
        // job failed at `Selection::is_empty()`.
    }

    #[test]
    fn rejects_submit_after_shutdown() {
        let compactor = Arc::new(LeveledCompactor::new(env()));
        let scheduler = MergeScheduler::start(compactor, 1, 1);
        scheduler.cancel_all();
        let sender = scheduler.sender.clone();
        scheduler.shutdown();
        // Every worker has joined and dropped its receiver clone, so the
        // channel is closed: further sends on the original sender fail.
        assert!(sender
            .send(Job::Run {
                pending: PendingMerge {
                    partition: "sg1".to_string(),
                    plan: super::super::task::MergeTaskPlan {
                        selection: super::super::selector::Selection::default(),
                        mode: super::super::resource::CommitMode::Squeeze,
                        concurrent_merge_series_num: 1,
                    },
                    output_level: 1,
                    output_kind: SegmentKind::Sequence,
                },
                journal_dir: PathBuf::new(),
            })
            .is_err());
        let _ = Timestamp::MIN;
    }
}
