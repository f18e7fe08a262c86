//! One object's way through the apply engine.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kubor_core::annotations::{ApplyOn, CleanupOn, ControlAnnotations, DryRunOn, WaitMode, WaitUntil};
use kubor_core::{Object, ObjectReference, ReadinessRegistry, ValidationError};
use kubor_kubehub::{ClusterApi, ClusterError, WatchEvent};
use kubor_transform::{Context, Pipeline};

use crate::diff::{diff_summary, strip_noisy, DiffSummary};
use crate::error::{ApplyError, RollbackOutcome, Step};

/// Shared collaborators of every unit in a pass.
pub struct Engine {
    cluster: Arc<dyn ClusterApi>,
    pipeline: Pipeline,
    context: Context,
    readiness: ReadinessRegistry,
    dry_run: bool,
}

impl Engine {
    /// Built-in transformations, default readiness strategies, real apply.
    pub fn new(cluster: Arc<dyn ClusterApi>, context: Context) -> Self {
        Self { cluster, pipeline: Pipeline::with_builtins(), context, readiness: ReadinessRegistry::default(), dry_run: false }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessRegistry) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool { self.dry_run }
    pub fn cluster(&self) -> &dyn ClusterApi { self.cluster.as_ref() }
    pub fn readiness(&self) -> &ReadinessRegistry { &self.readiness }
    pub fn context(&self) -> &Context { &self.context }
}

/// Control annotations of one object, with per-kind defaults filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitOptions {
    pub apply_on: ApplyOn,
    pub dry_run_on: DryRunOn,
    pub wait: WaitUntil,
    pub cleanup_on: CleanupOn,
}

impl UnitOptions {
    pub fn from_annotations(control: &ControlAnnotations, object: &Object, readiness: &ReadinessRegistry) -> Self {
        let wait = control.wait_until.unwrap_or_else(|| {
            let mode = if readiness.strategy_for(&object.gvk().kind).is_some() { WaitMode::Deployed } else { WaitMode::Applied };
            WaitUntil { mode, timeout: None }
        });
        Self { apply_on: control.apply_on, dry_run_on: control.dry_run_on, wait, cleanup_on: control.cleanup_on }
    }

    pub fn resolve(object: &Object, readiness: &ReadinessRegistry) -> Result<Self, ValidationError> {
        Ok(Self::from_annotations(&ControlAnnotations::from_object(object)?, object, readiness))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitState {
    Pending,
    CheckedAbsent,
    CheckedPresent,
    Created,
    Updated,
    Ready,
    RolledBack,
    Skipped,
    /// Removed after completion (`cleanup-on: executed`).
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
}

/// Reportable view of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSummary {
    pub object: String,
    pub state: UnitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyUnit {
    desired: Object,
    options: UnitOptions,
    state: UnitState,
    existing: Option<Object>,
    result: Option<Object>,
    applied: Option<Applied>,
    simulated: bool,
    diff: Option<DiffSummary>,
    note: Option<String>,
}

impl ApplyUnit {
    pub fn new(desired: Object, options: UnitOptions) -> Self {
        Self {
            desired,
            options,
            state: UnitState::Pending,
            existing: None,
            result: None,
            applied: None,
            simulated: false,
            diff: None,
            note: None,
        }
    }

    pub fn reference(&self) -> &ObjectReference { self.desired.reference() }
    pub fn desired(&self) -> &Object { &self.desired }
    pub fn options(&self) -> &UnitOptions { &self.options }
    pub fn state(&self) -> UnitState { self.state }
    /// Live object fetched before the update, kept verbatim.
    pub fn existing(&self) -> Option<&Object> { self.existing.as_ref() }
    /// What the server (or the local dry run) returned.
    pub fn result(&self) -> Option<&Object> { self.result.as_ref() }
    pub fn diff(&self) -> Option<DiffSummary> { self.diff }

    /// Something was really written to the cluster and not yet undone.
    pub fn is_applied(&self) -> bool {
        self.applied.is_some() && !self.simulated && matches!(self.state, UnitState::Created | UnitState::Updated | UnitState::Ready)
    }

    /// `wait` would block on this unit.
    pub fn needs_wait(&self) -> bool {
        self.is_applied() && self.state != UnitState::Ready && self.options.wait.blocks()
    }

    pub fn summary(&self) -> UnitSummary {
        UnitSummary { object: self.reference().to_string(), state: self.state, diff: self.diff, note: self.note.clone() }
    }

    fn skip(&mut self, why: &str) {
        debug!(object = %self.reference(), why, "skipped");
        self.state = UnitState::Skipped;
        self.note = Some(why.to_string());
    }

    /// Fetch, transform and send the object. A failure leaves the cluster untouched
    /// for this unit.
    pub async fn execute(&mut self, engine: &Engine) -> Result<(), ApplyError> {
        if self.state != UnitState::Pending {
            return Ok(());
        }
        let t0 = Instant::now();
        let reference = self.reference().clone();
        if self.options.apply_on == ApplyOn::Never {
            self.skip("apply-on: never");
            return Ok(());
        }
        if engine.dry_run && self.options.dry_run_on == DryRunOn::Nowhere {
            self.skip("dry-run-on: nowhere");
            return Ok(());
        }

        let existing = match engine.cluster.get(&reference).await {
            Ok(live) => Some(live),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(ApplyError::remote(&reference, Step::Get, e));
            }
        };
        self.state = if existing.is_some() { UnitState::CheckedPresent } else { UnitState::CheckedAbsent };
        match (&existing, self.options.apply_on) {
            (Some(_), ApplyOn::Create) => {
                self.skip("apply-on: create, object exists");
                return Ok(());
            }
            (None, ApplyOn::Update) => {
                self.skip("apply-on: update, object absent");
                return Ok(());
            }
            _ => {}
        }

        let mut target = self.desired.clone();
        let ran = match &existing {
            None => engine.pipeline.run_create(&engine.context, &mut target),
            Some(live) => engine.pipeline.run_update(&engine.context, live, &mut target),
        }
        .map_err(|source| ApplyError::Transform { reference: reference.clone(), source })?;
        debug!(object = %reference, transformations = ?ran, "transformed");

        let base = existing.as_ref().map_or(serde_json::Value::Null, |live| strip_noisy(live.body().clone()));
        self.diff = Some(diff_summary(&strip_noisy(target.body().clone()), &base));

        let client_only = engine.dry_run && self.options.dry_run_on == DryRunOn::Client;
        let sent = if client_only {
            Ok(target.clone())
        } else {
            let sent = self.send(engine, &target, existing.is_some()).await;
            match sent {
                Err(e) if engine.dry_run && self.options.dry_run_on == DryRunOn::ServerIfPossible && e.rejects_dry_run() => {
                    debug!(object = %reference, error = %e, "server refused dry run; checked locally");
                    self.note = Some("dry run checked locally".into());
                    Ok(target.clone())
                }
                other => other,
            }
        };
        let step = if existing.is_some() { Step::Update } else { Step::Create };
        let result = sent.map_err(|e| {
            counter!("apply_err", 1u64);
            ApplyError::remote(&reference, step, e)
        })?;

        let applied = if existing.is_some() { Applied::Updated } else { Applied::Created };
        self.state = match applied {
            Applied::Created => UnitState::Created,
            Applied::Updated => UnitState::Updated,
        };
        self.applied = Some(applied);
        self.simulated = engine.dry_run;
        self.existing = existing;
        self.result = Some(result);
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        info!(object = %reference, action = ?applied, dry_run = engine.dry_run, diff = ?self.diff, "applied");
        Ok(())
    }

    async fn send(&self, engine: &Engine, target: &Object, update: bool) -> Result<Object, ClusterError> {
        if update {
            engine.cluster.update(target, engine.dry_run).await
        } else {
            engine.cluster.create(target, engine.dry_run).await
        }
    }

    /// Block until the applied object reports readiness for its generation, or
    /// `budget` (capped by `wait-until`) runs out.
    pub async fn wait(&mut self, engine: &Engine, budget: Duration) -> Result<(), ApplyError> {
        if !self.needs_wait() {
            return Ok(());
        }
        let budget = self.options.wait.timeout.map_or(budget, |cap| cap.min(budget));
        let reference = self.reference().clone();
        let applied = self.result.as_ref().ok_or_else(|| ApplyError::Consistency {
            reference: reference.clone(),
            message: "no applied object to wait for".into(),
        })?;
        let generation = applied.generation().ok_or_else(|| ApplyError::Consistency {
            reference: reference.clone(),
            message: "applied object carries no metadata.generation".into(),
        })?;
        let expected = applied.reference().clone();

        let started = Instant::now();
        let deadline = started + budget;
        debug!(object = %reference, generation, budget = ?budget, "waiting");
        let mut events = engine.cluster.watch(&expected).await.map_err(|e| ApplyError::remote(&reference, Step::Watch, e))?;
        let current = engine.cluster.get(&expected).await.map_err(|e| ApplyError::remote(&reference, Step::Get, e))?;
        if self.satisfied(engine, &expected, generation, &current) {
            self.mark_ready(started);
            return Ok(());
        }
        loop {
            match tokio::time::timeout_at(deadline, events.next()).await {
                Ok(Some(Ok(WatchEvent::Applied(body)))) => {
                    let Ok(seen) = Object::from_json(body) else { continue };
                    if self.satisfied(engine, &expected, generation, &seen) {
                        self.mark_ready(started);
                        return Ok(());
                    }
                }
                Ok(Some(Ok(WatchEvent::Deleted(_)))) => {
                    return Err(ApplyError::Consistency { reference, message: "deleted while waiting for readiness".into() });
                }
                Ok(Some(Err(e))) => return Err(ApplyError::remote(&reference, Step::Watch, e)),
                // A closed watch cannot deliver the event any more.
                Ok(None) | Err(_) => break,
            }
        }
        counter!("wait_timeouts", 1u64);
        let elapsed = started.elapsed();
        warn!(object = %reference, elapsed = ?elapsed, budget = ?budget, "not ready in time");
        Err(ApplyError::Timeout { reference, elapsed, budget })
    }

    fn satisfied(&self, engine: &Engine, expected: &ObjectReference, generation: i64, seen: &Object) -> bool {
        let same = seen.gvk() == &expected.gvk && seen.namespace() == expected.namespace.as_deref() && seen.name() == expected.name;
        same && seen.generation() == Some(generation) && engine.readiness.evaluate(seen).ready_or_unknown()
    }

    fn mark_ready(&mut self, started: Instant) {
        histogram!("wait_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(object = %self.reference(), elapsed = ?started.elapsed(), "ready");
        self.state = UnitState::Ready;
    }

    /// Undo what `execute` wrote. Never fails; the outcome says what happened.
    pub async fn rollback(&mut self, engine: &Engine) -> Option<RollbackOutcome> {
        if !self.is_applied() {
            return None;
        }
        let reference = self.reference().clone();
        let outcome = match self.applied {
            Some(Applied::Created) => match engine.cluster.delete(&reference).await {
                Ok(()) => RollbackOutcome::Deleted,
                Err(e) if e.is_not_found() => RollbackOutcome::Deleted,
                Err(e) => RollbackOutcome::Failed(e.to_string()),
            },
            Some(Applied::Updated) => match self.restore(engine).await {
                Ok(()) => RollbackOutcome::Restored,
                Err(e) => RollbackOutcome::Failed(e.to_string()),
            },
            None => return None,
        };
        match &outcome {
            RollbackOutcome::Failed(error) => warn!(object = %reference, error = %error, "rollback failed"),
            _ => {
                counter!("apply_rollbacks", 1u64);
                info!(object = %reference, outcome = ?outcome, "rolled back");
                self.state = UnitState::RolledBack;
            }
        }
        self.note = Some(match &outcome {
            RollbackOutcome::Failed(e) => format!("rollback failed: {e}"),
            _ => "rolled back".to_string(),
        });
        Some(outcome)
    }

    /// Re-submit the snapshot on top of the latest resource version.
    async fn restore(&self, engine: &Engine) -> Result<(), ClusterError> {
        let Some(snapshot) = &self.existing else {
            return Err(ClusterError::Encoding("no snapshot to restore".into()));
        };
        let latest = match engine.cluster.get(snapshot.reference()).await {
            Ok(live) => live.resource_version().map(str::to_string),
            Err(e) => {
                debug!(object = %snapshot.reference(), error = %e, "no fresh resource version; using the applied one");
                self.result.as_ref().and_then(|r| r.resource_version().map(str::to_string))
            }
        };
        let mut body = snapshot.clone();
        match latest {
            Some(rv) => body.set_path(&["metadata", "resourceVersion"], serde_json::Value::String(rv)),
            None => body.delete_path(&["metadata", "resourceVersion"]),
        }
        .map_err(|e| ClusterError::Encoding(e.to_string()))?;
        engine.cluster.update(&body, false).await.map(|_| ())
    }

    /// Delete a finished unit marked `cleanup-on: executed`.
    pub async fn delete_executed(&mut self, engine: &Engine) -> Option<Result<(), ClusterError>> {
        if self.options.cleanup_on != CleanupOn::Executed || !self.is_applied() {
            return None;
        }
        let outcome = match engine.cluster.delete(self.reference()).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        };
        match &outcome {
            Ok(()) => {
                info!(object = %self.reference(), "deleted after completion");
                self.state = UnitState::Deleted;
            }
            Err(e) => warn!(object = %self.reference(), error = %e, "delete after completion failed"),
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> Object { Object::from_json(v).unwrap() }

    #[test]
    fn wait_defaults_follow_readiness_strategies() {
        let readiness = ReadinessRegistry::default();
        let deployment = obj(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}}));
        let config = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        assert_eq!(UnitOptions::resolve(&deployment, &readiness).unwrap().wait.mode, WaitMode::Deployed);
        assert_eq!(UnitOptions::resolve(&config, &readiness).unwrap().wait.mode, WaitMode::Applied);

        let capped = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c",
            "annotations": {"kubor.echocat.org/wait-until": "deployed:2m"}}}));
        let wait = UnitOptions::resolve(&capped, &readiness).unwrap().wait;
        assert_eq!((wait.mode, wait.timeout), (WaitMode::Deployed, Some(Duration::from_secs(120))));
    }

    #[test]
    fn bad_annotations_are_rejected() {
        let bad = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c",
            "annotations": {"kubor.echocat.org/apply-on": "sometimes"}}}));
        assert!(UnitOptions::resolve(&bad, &ReadinessRegistry::default()).is_err());
    }

    #[test]
    fn fresh_units_are_not_applied() {
        let o = obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        let options = UnitOptions::resolve(&o, &ReadinessRegistry::default()).unwrap();
        let unit = ApplyUnit::new(o, options);
        assert_eq!(unit.state(), UnitState::Pending);
        assert!(!unit.is_applied());
        assert!(!unit.needs_wait());
    }
}
