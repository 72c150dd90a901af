//! Process-wide admission gate based on live resource usage.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;

use crate::error::AdmissionReason;

/// Cached snapshot of process-wide resource usage, refreshed periodically by
/// a background task so `should_accept_connection` never blocks on a syscall.
struct Snapshot {
    cpu_pct_x100: AtomicU64,
    mem_pct_x100: AtomicU64,
    mem_used_mb_x100: AtomicU64,
}

/// Admission gate combining task-count, CPU, memory, and connection-count
/// checks. All four must pass for a new connection to be admitted.
pub struct ResourceGuard {
    snapshot: Arc<Snapshot>,
    live_tasks: AtomicUsize,
    connections: AtomicUsize,
    max_goroutines: usize,
    max_connections: usize,
    cpu_reject_pct: f32,
    memory_reject_pct: f32,
}

impl ResourceGuard {
    pub fn new(
        max_goroutines: usize,
        max_connections: usize,
        cpu_reject_pct: f32,
        memory_reject_pct: f32,
    ) -> Self {
        Self {
            snapshot: Arc::new(Snapshot {
                cpu_pct_x100: AtomicU64::new(0),
                mem_pct_x100: AtomicU64::new(0),
                mem_used_mb_x100: AtomicU64::new(0),
            }),
            live_tasks: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            max_goroutines,
            max_connections,
            cpu_reject_pct,
            memory_reject_pct,
        }
    }

    /// Spawns the background sampler. Call once at startup; the returned
    /// handle may be aborted on shutdown.
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let snapshot = self.snapshot.clone();
        tokio::spawn(async move {
            let mut sys = System::new_all();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let cpu = sys.global_cpu_usage();
                let mem_pct = if sys.total_memory() > 0 {
                    (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0
                } else {
                    0.0
                };
                let mem_used_mb = sys.used_memory() as f64 / (1024.0 * 1024.0);
                snapshot
                    .cpu_pct_x100
                    .store((cpu as f64 * 100.0) as u64, Ordering::Relaxed);
                snapshot
                    .mem_pct_x100
                    .store((mem_pct * 100.0) as u64, Ordering::Relaxed);
                snapshot
                    .mem_used_mb_x100
                    .store((mem_used_mb * 100.0) as u64, Ordering::Relaxed);
            }
        })
    }

    pub fn task_started(&self) {
        self.live_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.live_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn cpu_pct(&self) -> f32 {
        (self.snapshot.cpu_pct_x100.load(Ordering::Relaxed) as f32) / 100.0
    }

    fn mem_pct(&self) -> f32 {
        (self.snapshot.mem_pct_x100.load(Ordering::Relaxed) as f32) / 100.0
    }

    /// Current CPU usage, percent. Surfaced on the admin `/health` endpoint.
    pub fn cpu_percentage(&self) -> f32 {
        self.cpu_pct()
    }

    /// Current resident memory usage, megabytes. Surfaced on `/health`.
    pub fn memory_used_mb(&self) -> f64 {
        (self.snapshot.mem_used_mb_x100.load(Ordering::Relaxed) as f64) / 100.0
    }

    /// Current count of live connection pump tasks, the Tokio analogue of a
    /// goroutine count. Surfaced on `/health`.
    pub fn live_task_count(&self) -> usize {
        self.live_tasks.load(Ordering::Relaxed)
    }

    pub fn should_accept_connection(&self) -> Result<(), AdmissionReason> {
        if self.live_tasks.load(Ordering::Relaxed) >= self.max_goroutines {
            return Err(AdmissionReason::Overloaded);
        }
        if self.cpu_pct() >= self.cpu_reject_pct {
            return Err(AdmissionReason::Overloaded);
        }
        if self.mem_pct() >= self.memory_reject_pct {
            return Err(AdmissionReason::Overloaded);
        }
        if self.connections.load(Ordering::Relaxed) >= self.max_connections {
            return Err(AdmissionReason::AtCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_when_under_every_threshold() {
        let guard = ResourceGuard::new(1000, 1000, 75.0, 90.0);
        assert!(guard.should_accept_connection().is_ok());
    }

    #[test]
    fn rejects_at_connection_capacity() {
        let guard = ResourceGuard::new(1000, 2, 75.0, 90.0);
        guard.connection_opened();
        guard.connection_opened();
        assert_eq!(
            guard.should_accept_connection(),
            Err(AdmissionReason::AtCapacity)
        );
    }

    #[test]
    fn rejects_at_task_ceiling() {
        let guard = ResourceGuard::new(1, 1000, 75.0, 90.0);
        guard.task_started();
        assert_eq!(
            guard.should_accept_connection(),
            Err(AdmissionReason::Overloaded)
        );
    }

    #[test]
    fn connection_count_decrements_on_close() {
        let guard = ResourceGuard::new(1000, 1000, 75.0, 90.0);
        guard.connection_opened();
        guard.connection_opened();
        guard.connection_closed();
        assert_eq!(guard.connection_count(), 1);
    }
}
