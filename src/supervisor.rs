//! Supervised loop runner.
//!
//! Every long-running component is spawned as a named loop. A loop that
//! returns cleanly is considered done; a loop that errors (or panics) is
//! restarted after a cooldown, forever. The process itself never halts on
//! a loop crash.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct LoopHealth {
    pub alive: bool,
    pub restarts: u64,
    pub last_error: String,
}

/// Shared per-loop health counters, surfaced to the journal and diagnostics.
#[derive(Default)]
pub struct RuntimeHealth {
    loops: RwLock<HashMap<String, LoopHealth>>,
}

impl RuntimeHealth {
    pub fn touch(&self, name: &str, alive: bool) {
        let mut map = self.loops.write();
        let h = map.entry(name.to_string()).or_default();
        h.alive = alive;
    }

    pub fn restarted(&self, name: &str, err: &str) {
        let mut map = self.loops.write();
        let h = map.entry(name.to_string()).or_default();
        h.alive = false;
        h.restarts += 1;
        h.last_error = err.to_string();
    }

    pub fn snapshot(&self) -> HashMap<String, LoopHealth> {
        self.loops.read().clone()
    }

    pub fn summary(&self) -> String {
        let map = self.loops.read();
        if map.is_empty() {
            return "loops=0".to_string();
        }
        let up = map.values().filter(|h| h.alive).count();
        let restarts: u64 = map.values().map(|h| h.restarts).sum();
        format!("loops={}/{} restarts={}", up, map.len(), restarts)
    }
}

pub struct Supervisor {
    pub health: Arc<RuntimeHealth>,
    cooldown: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            health: Arc::new(RuntimeHealth::default()),
            cooldown: Duration::from_secs(10),
        }
    }

    #[cfg(test)]
    fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            health: Arc::new(RuntimeHealth::default()),
            cooldown,
        }
    }

    /// Spawn `factory()` as a supervised named loop. The factory is invoked
    /// again for every restart so the loop starts from clean state.
    pub fn spawn<F, Fut>(&self, name: &'static str, factory: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let health = self.health.clone();
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            loop {
                health.touch(name, true);
                info!(loop_name = name, "loop started");
                let result = tokio::spawn(factory()).await;
                match result {
                    Ok(Ok(())) => {
                        health.touch(name, false);
                        info!(loop_name = name, "loop exited cleanly");
                        return;
                    }
                    Ok(Err(e)) => {
                        health.restarted(name, &format!("{e:#}"));
                        error!(loop_name = name, error = %format!("{e:#}"), "loop crashed");
                    }
                    Err(join_err) => {
                        health.restarted(name, &join_err.to_string());
                        error!(loop_name = name, error = %join_err, "loop panicked");
                    }
                }
                tokio::time::sleep(cooldown).await;
                warn!(loop_name = name, "restarting loop after cooldown");
            }
        })
    }

    /// Periodic one-line health summary.
    pub fn spawn_health_reporter(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let health = self.health.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                info!(summary = %health.summary(), "runtime health");
            }
        })
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn restarts_crashing_loop_and_counts() {
        let sup = Supervisor::with_cooldown(Duration::from_millis(5));
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();

        sup.spawn("crashy", move || {
            let runs = runs_clone.clone();
            async move {
                let n = runs.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("boom {n}");
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let snap = sup.health.snapshot();
        let h = snap.get("crashy").expect("health entry");
        assert_eq!(h.restarts, 2);
        assert!(h.last_error.contains("boom"));
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let sup = Supervisor::with_cooldown(Duration::from_millis(5));
        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();

        let handle = sup.spawn("oneshot", move || {
            let runs = runs_clone.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let _ = handle.await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
