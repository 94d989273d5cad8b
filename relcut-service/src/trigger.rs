// Trigger and Concurrency Control
// Decides whether an event starts a pipeline and which in-flight runs it preempts

use crate::error::ConfigError;
use crate::execution::cancel::CancelToken;
use crate::execution::context::Macros;
use crate::parser::models::{EventKind, PipelineSpec, TriggerEvent, TriggerSpec};
use crate::utils::{compile_globs, PathGlob};

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of trigger filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Run,
    Skip(String),
}

impl TriggerDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, TriggerDecision::Run)
    }
}

/// Compiled `trigger` section of a pipeline
#[derive(Debug, Clone)]
pub struct TriggerFilter {
    branches: Vec<glob::Pattern>,
    paths: Vec<PathGlob>,
}

impl TriggerFilter {
    pub fn from_spec(spec: &TriggerSpec) -> Result<Self, ConfigError> {
        let branches = spec
            .branches
            .iter()
            .map(|raw| {
                glob::Pattern::new(raw).map_err(|e| ConfigError::InvalidGlob {
                    pattern: raw.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let paths = compile_globs(&spec.paths).map_err(|(pattern, e)| ConfigError::InvalidGlob {
            pattern,
            message: e.to_string(),
        })?;

        Ok(Self { branches, paths })
    }

    /// Manual dispatches, tag pushes and pushes to a listed branch always run.
    /// Anything else needs a changed path matching a path filter.
    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        if event.kind == EventKind::Manual {
            return TriggerDecision::Run;
        }

        if event.kind == EventKind::Push {
            if event.is_tag() {
                return TriggerDecision::Run;
            }
            if let Some(branch) = event.branch() {
                if self.branches.iter().any(|p| p.matches(branch)) {
                    return TriggerDecision::Run;
                }
            }
        }

        if self.paths.is_empty() {
            return TriggerDecision::Run;
        }

        let hit = event
            .changed_paths
            .iter()
            .any(|changed| self.paths.iter().any(|g| g.matches(Path::new(changed))));
        if hit {
            TriggerDecision::Run
        } else {
            TriggerDecision::Skip(format!(
                "none of {} changed path(s) match the path filters",
                event.changed_paths.len()
            ))
        }
    }
}

/// Render the cancellation group key for an event
pub fn resolve_group(spec: &PipelineSpec, event: &TriggerEvent) -> String {
    let mut macros = Macros::for_pipeline(spec);
    macros.add_event(event);
    macros.substitute(&spec.concurrency.group)
}

struct ActiveRun {
    generation: u64,
    token: CancelToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    active: Vec<ActiveRun>,
}

type Groups = Arc<DashMap<String, GroupState>>;

/// Tracks active runs per cancellation group. Groups never share a lock.
#[derive(Clone, Default)]
pub struct ConcurrencyController {
    groups: Groups,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancellation group key for `event`
    pub fn resolve(&self, spec: &PipelineSpec, event: &TriggerEvent) -> String {
        resolve_group(spec, event)
    }

    /// Register a new run under `key`.
    ///
    /// With `cancel_in_progress` every active run in the group is cancelled
    /// (last trigger wins); otherwise the new run queues behind them. Either
    /// way the ticket waits for its predecessors to release the group.
    pub fn on_new_run(&self, key: &str, cancel_in_progress: bool) -> RunTicket {
        let token = CancelToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let mut group = self.groups.entry(key.to_string()).or_default();
        group.generation += 1;
        let generation = group.generation;

        let mut cancel_previous = false;
        if cancel_in_progress {
            for run in &group.active {
                if !run.token.is_cancelled() {
                    run.token
                        .cancel(format!("superseded by a newer trigger in group '{}'", key));
                    cancel_previous = true;
                }
            }
        }

        let wait_for = group.active.iter().map(|r| r.done.clone()).collect();
        group.active.push(ActiveRun {
            generation,
            token: token.clone(),
            done: done_rx,
        });
        drop(group);

        if cancel_previous {
            tracing::info!(group = key, generation, "cancelled in-flight runs");
        }

        RunTicket {
            key: key.to_string(),
            generation,
            token,
            cancel_previous,
            wait_for,
            done: done_tx,
            groups: self.groups.clone(),
        }
    }

    /// Cancel every run registered in a group; returns how many were cancelled
    pub fn cancel(&self, key: &str, reason: &str) -> usize {
        let Some(group) = self.groups.get(key) else {
            return 0;
        };
        let mut cancelled = 0;
        for run in group.active.iter().filter(|r| !r.token.is_cancelled()) {
            run.token.cancel(reason);
            cancelled += 1;
        }
        cancelled
    }

    /// Number of registered (running or queued) runs in a group
    pub fn active_runs(&self, key: &str) -> usize {
        self.groups.get(key).map(|g| g.active.len()).unwrap_or(0)
    }

    /// Number of groups with registered runs
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Registration of one run in a group. Dropping it releases the group.
pub struct RunTicket {
    pub key: String,
    pub generation: u64,
    /// Cancelled when a newer trigger supersedes this run
    pub token: CancelToken,
    /// Whether registering this run cancelled earlier ones
    pub cancel_previous: bool,
    wait_for: Vec<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
    groups: Groups,
}

impl RunTicket {
    /// Whether earlier runs in the group still have to finish first
    pub fn is_queued(&self) -> bool {
        self.wait_for.iter().any(|rx| !*rx.borrow())
    }

    /// Wait until every earlier run in the group has released it
    pub async fn wait_turn(&mut self) {
        for rx in &mut self.wait_for {
            // A dropped sender means the predecessor is gone
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Release the group
    pub fn finish(self) {}

    fn release(&mut self) {
        let _ = self.done.send(true);
        if let Some(mut group) = self.groups.get_mut(&self.key) {
            group.active.retain(|r| r.generation != self.generation);
        }
        self.groups
            .remove_if(&self.key, |_, group| group.active.is_empty());
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RunTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTicket")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("cancel_previous", &self.cancel_previous)
            .finish()
    }
}
