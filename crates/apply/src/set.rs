//! All-or-nothing application of a batch.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use kubor_core::{Object, ObjectReference, ValidationError};
use kubor_kubehub::ClusterError;

use crate::error::{ApplyError, BatchError, RollbackReport};
use crate::unit::{ApplyUnit, Engine, UnitOptions, UnitSummary};

/// Units in discovery order. Any failure undoes every unit that was written.
pub struct ApplySet<'e> {
    engine: &'e Engine,
    units: Vec<ApplyUnit>,
}

impl<'e> ApplySet<'e> {
    pub fn new(engine: &'e Engine) -> Self { Self { engine, units: Vec::new() } }

    /// Add an object; its control annotations are validated here, before
    /// anything is sent.
    pub fn push(&mut self, object: Object) -> Result<(), ValidationError> {
        let options = UnitOptions::resolve(&object, self.engine.readiness())?;
        self.units.push(ApplyUnit::new(object, options));
        Ok(())
    }

    pub fn len(&self) -> usize { self.units.len() }
    pub fn is_empty(&self) -> bool { self.units.is_empty() }
    pub fn units(&self) -> &[ApplyUnit] { &self.units }

    pub fn summaries(&self) -> Vec<UnitSummary> { self.units.iter().map(ApplyUnit::summary).collect() }

    /// Execute every unit in order. The first failure rolls back the whole set.
    pub async fn execute(&mut self) -> Result<(), BatchError> {
        for i in 0..self.units.len() {
            if let Err(source) = self.units[i].execute(self.engine).await {
                return Err(self.abort(source).await);
            }
        }
        Ok(())
    }

    /// Wait for every unit within one shared `total` budget: each unit gets
    /// what the previous ones left.
    pub async fn wait(&mut self, total: Duration) -> Result<(), BatchError> {
        let started = Instant::now();
        for i in 0..self.units.len() {
            if !self.units[i].needs_wait() {
                continue;
            }
            let remaining = total.saturating_sub(started.elapsed());
            let outcome = if remaining.is_zero() {
                Err(ApplyError::Timeout { reference: self.units[i].reference().clone(), elapsed: started.elapsed(), budget: remaining })
            } else {
                self.units[i].wait(self.engine, remaining).await
            };
            if let Err(source) = outcome {
                return Err(self.abort(source).await);
            }
        }
        Ok(())
    }

    /// `execute` then `wait`.
    pub async fn apply(&mut self, total: Duration) -> Result<(), BatchError> {
        self.execute().await?;
        self.wait(total).await
    }

    async fn abort(&mut self, source: ApplyError) -> BatchError {
        warn!(error = %source, "apply failed; rolling back");
        let rollback = self.rollback_all().await;
        BatchError { source, rollback }
    }

    /// Undo every applied unit, newest first, attempting all of them.
    pub async fn rollback_all(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        for unit in self.units.iter_mut().rev() {
            if let Some(outcome) = unit.rollback(self.engine).await {
                report.entries.push((unit.reference().to_string(), outcome));
            }
        }
        report.entries.reverse();
        if report.succeeded() {
            info!(count = report.entries.len(), "rollback done");
        } else {
            warn!(report = %report, "rollback incomplete");
        }
        report
    }

    /// Delete units marked `cleanup-on: executed`. Failures are reported, not raised.
    pub async fn delete_executed(&mut self) -> Vec<(ObjectReference, Result<(), ClusterError>)> {
        let mut out = Vec::new();
        for unit in &mut self.units {
            if let Some(outcome) = unit.delete_executed(self.engine).await {
                out.push((unit.reference().clone(), outcome));
            }
        }
        out
    }
}
