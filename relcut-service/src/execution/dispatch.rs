// Dispatcher
// Routes trigger events through the concurrency controller into the executor

use crate::execution::cancel::CancelToken;
use crate::execution::executor::{PipelineExecutor, PipelineReport};
use crate::parser::models::{RunStatus, TriggerEvent};
use crate::trigger::{ConcurrencyController, TriggerDecision};

/// Composes the concurrency controller with a pipeline executor
#[derive(Clone)]
pub struct Dispatcher {
    controller: ConcurrencyController,
    executor: PipelineExecutor,
}

impl Dispatcher {
    pub fn new(executor: PipelineExecutor) -> Self {
        Self {
            controller: ConcurrencyController::new(),
            executor,
        }
    }

    /// Share a controller between dispatchers of different pipelines
    pub fn with_controller(mut self, controller: ConcurrencyController) -> Self {
        self.controller = controller;
        self
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    /// Handle one event: filter, register in its group, wait for the group
    /// if queued, execute under the group's token and release the group.
    pub async fn dispatch(&self, event: &TriggerEvent) -> PipelineReport {
        let spec = self.executor.spec();

        // Filtered events never enter a group, so they cannot cancel anything
        if let TriggerDecision::Skip(_) = self.executor.evaluate(event) {
            return self.executor.execute(event, &CancelToken::new()).await;
        }

        let key = self.controller.resolve(spec, event);
        let mut ticket = self
            .controller
            .on_new_run(&key, spec.concurrency.cancel_in_progress);

        let token = ticket.token.clone();

        if ticket.is_queued() {
            tracing::info!(group = %key, generation = ticket.generation, "waiting for earlier runs in group");
            tokio::select! {
                _ = ticket.wait_turn() => {}
                _ = token.cancelled() => {}
            }
        }

        let report = self.executor.execute(event, &token).await;
        ticket.finish();

        if report.count(RunStatus::Cancelled) > 0 {
            tracing::info!(
                group = %key,
                reason = %token.reason().unwrap_or_default(),
                "runs cancelled"
            );
        }
        report
    }
}
