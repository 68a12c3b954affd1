//! Wave-based parallel execution.
//!
//! A wave is every pending module whose dependencies have completed. Modules
//! in a wave run concurrently, bounded by a semaphore, each against a frozen
//! snapshot of its transitive dependencies' results. Outputs are merged back
//! into the authoritative context by the engine in resolved order once the
//! whole wave has finished.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::events::PipelineEvent;
use super::executor::{invoke_module, joined, Prepared, RunState};
use super::report::ModuleStatus;
use crate::core::errors::{PipelineError, Result};

impl RunState {
    pub(crate) async fn run_parallel(&mut self, order: &[String], max_workers: usize) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut pending: Vec<String> = order.to_vec();
        let mut wave = 0usize;

        while !pending.is_empty() {
            self.propagate_skips(&mut pending);
            if pending.is_empty() {
                break;
            }

            let ready: Vec<String> = pending
                .iter()
                .filter(|name| self.dependencies_completed(name))
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(PipelineError::internal(format!(
                    "no runnable modules left among {:?}",
                    pending
                )));
            }
            pending.retain(|name| !ready.contains(name));

            wave += 1;
            for name in &ready {
                self.statuses.insert(name.clone(), ModuleStatus::Ready);
            }
            info!(wave, modules = ?ready, max_workers, "Starting wave");
            self.events.emit(
                &self.context.run_id(),
                PipelineEvent::WaveStarted {
                    wave,
                    modules: ready.clone(),
                },
            );

            let mut running = FuturesUnordered::new();
            for name in &ready {
                let Prepared::Invoke(inv) = self.prepare(name).await? else {
                    continue;
                };

                let view = self.context.snapshot(&self.transitive_dependencies(name));
                let semaphore = semaphore.clone();
                let handle = inv.handle.clone();
                let config = inv.config.clone();
                let timeout = inv.timeout;
                let started = Instant::now();

                let task = tokio::spawn(async move {
                    // The timeout only covers the module itself, not the wait for a worker
                    let _permit = semaphore.acquire_owned().await.ok();
                    invoke_module(handle, view, config, timeout).await
                });
                running.push(async move {
                    let result = joined(task.await, started);
                    (inv, result)
                });
            }

            let mut finished = Vec::with_capacity(running.len());
            while let Some(done) = running.next().await {
                finished.push(done);
            }
            finished.sort_by_key(|(inv, _)| {
                position
                    .get(inv.module.as_str())
                    .copied()
                    .unwrap_or(usize::MAX)
            });

            for (inv, result) in finished {
                self.finish(inv, result).await?;
            }
            debug!(wave, remaining = pending.len(), "Wave merged");
        }

        Ok(())
    }

    /// Skip every pending module with a failed or skipped dependency, until
    /// nothing changes.
    fn propagate_skips(&mut self, pending: &mut Vec<String>) {
        loop {
            let blocked: Vec<(String, String)> = pending
                .iter()
                .filter_map(|name| self.blocked_reason(name).map(|r| (name.clone(), r)))
                .collect();
            if blocked.is_empty() {
                return;
            }
            for (name, reason) in blocked {
                pending.retain(|p| p != &name);
                self.skip(&name, reason);
            }
        }
    }
}
