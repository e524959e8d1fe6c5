//! `Service::spawn_worker`: the escape hatch for handler code that must
//! block (CPU-bound work, blocking I/O) without stalling the service loop.
//! Backed by `tokio::task::spawn_blocking`'s dedicated thread pool rather
//! than a hand-rolled one, matching the rest of the crate's reliance on
//! tokio's runtime primitives instead of bespoke pools.

use tokio::task::JoinHandle;

pub struct WorkerPool {
    service: String,
}

impl WorkerPool {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Runs `f` on the blocking thread pool. The returned handle resolves
    /// once `f` completes; the service loop is never blocked by it.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        metrics::increment_counter!("node_worker_spawned_total", "service" => self.service.clone());
        tokio::task::spawn_blocking(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_work_runs_off_the_loop_task() {
        let pool = WorkerPool::new("test");
        let handle = pool.spawn(|| 2 + 2);
        assert_eq!(handle.await.unwrap(), 4);
    }
}
