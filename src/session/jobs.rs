//! 具名延时任务
//!
//! `schedule_once` 以名字为键：同名任务再次调度会替换（中止）尚未触发的旧任务。
//! 任务到点后先从表中摘除再执行，执行中的任务不会被后续同名调度打断。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::AbortHandle;

/// 到点后执行的任务体
pub type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub trait JobScheduler: Send + Sync {
    /// 调度（或替换）同名任务，delay 后执行一次
    fn schedule_once(&self, name: &str, delay: Duration, job: JobFn);

    /// 取消尚未触发的同名任务，返回是否存在
    fn cancel(&self, name: &str) -> bool;

    fn is_pending(&self, name: &str) -> bool;

    fn pending_jobs(&self) -> Vec<String>;
}

struct ScheduledJob {
    generation: u64,
    handle: AbortHandle,
}

type JobTable = Arc<Mutex<HashMap<String, ScheduledJob>>>;

fn lock_jobs(jobs: &JobTable) -> MutexGuard<'_, HashMap<String, ScheduledJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 基于 tokio 定时器的实现；需在 Tokio 运行时内调用
#[derive(Default)]
pub struct TokioJobScheduler {
    jobs: JobTable,
    generation: AtomicU64,
}

impl TokioJobScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule_once(&self, name: &str, delay: Duration, job: JobFn) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let jobs = Arc::clone(&self.jobs);
        let key = name.to_string();

        // 持锁 spawn + insert：任务到点后必须拿到同一把锁才能确认自己仍是当前代
        let mut table = lock_jobs(&self.jobs);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut table = lock_jobs(&jobs);
                match table.get(&key) {
                    Some(current) if current.generation == generation => {
                        table.remove(&key);
                    }
                    _ => return,
                }
            }
            tracing::debug!(job = %key, "scheduled job fired");
            job().await;
        });
        let previous = table.insert(
            name.to_string(),
            ScheduledJob {
                generation,
                handle: task.abort_handle(),
            },
        );
        drop(table);

        if let Some(previous) = previous {
            previous.handle.abort();
            tracing::debug!(job = %name, "scheduled job replaced");
        }
    }

    fn cancel(&self, name: &str) -> bool {
        match lock_jobs(&self.jobs).remove(name) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_pending(&self, name: &str) -> bool {
        lock_jobs(&self.jobs).contains_key(name)
    }

    fn pending_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_jobs(&self.jobs).keys().cloned().collect();
        names.sort();
        names
    }
}
