use metrics::counter;
use tracing::{debug, info, warn};

use kubor_core::annotations::CleanupOn;
use kubor_core::{GvkRegistry, Object, ResourceIdentity};
use kubor_kubehub::{ClusterApi, ListOptions, Scope};

use crate::keep::{Claim, KeepSet};
use crate::{CleanupError, CleanupReport, Mode};

/// Lists what a claim covers and deletes what the keep set does not name.
pub struct Cleaner<'a> {
    cluster: &'a dyn ClusterApi,
    twins: &'a GvkRegistry,
    list_limit: u32,
    dry_run: bool,
}

impl<'a> Cleaner<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, twins: &'a GvkRegistry) -> Self {
        Self { cluster, twins, list_limit: 500, dry_run: false }
    }

    pub fn list_limit(mut self, limit: u32) -> Self {
        self.list_limit = limit.max(1);
        self
    }

    /// Report what would be deleted without deleting it.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// One representative per twin class: the identity the desired batch
    /// uses, else the first claimed one.
    pub fn representatives(&self, claim: &Claim, keep: &KeepSet) -> Vec<ResourceIdentity> {
        let mut out: Vec<ResourceIdentity> = Vec::new();
        for kind in &claim.kinds {
            if out.iter().any(|seen| self.twins.are_twins(seen, kind)) {
                continue;
            }
            let preferred = keep.kinds().filter(|k| self.twins.are_twins(k, kind)).min().cloned().unwrap_or_else(|| kind.clone());
            out.push(preferred);
        }
        out
    }

    async fn namespaces(&self, claim: &Claim) -> Result<Vec<String>, CleanupError> {
        if !claim.namespaces.is_empty() {
            return Ok(claim.namespaces.clone());
        }
        let mut out = Vec::new();
        let mut token = None;
        loop {
            let options = ListOptions::default().limit(self.list_limit).continue_from(token);
            let page = self.cluster.list_namespaces(&options).await.map_err(CleanupError::Namespaces)?;
            out.extend(page.items.into_iter().filter(|ns| claim.claims_namespace(ns)));
            match page.continue_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    /// Sweep everything `claim` covers. Per-object failures are recorded and the
    /// sweep goes on; list failures other than NotFound end it.
    pub async fn run(&self, claim: &Claim, keep: &KeepSet, mode: Mode) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport::default();
        let kinds = self.representatives(claim, keep);
        if kinds.is_empty() {
            return Ok(report);
        }
        let namespaces = self.namespaces(claim).await?;
        debug!(kinds = kinds.len(), namespaces = namespaces.len(), ?mode, "cleanup scope");

        for gvk in &kinds {
            let scope = match self.cluster.scope(gvk).await {
                Ok(scope) => scope,
                Err(e) if e.is_not_found() => {
                    debug!(gvk = %gvk, "kind not served; nothing to clean");
                    continue;
                }
                Err(source) => return Err(CleanupError::List { gvk: gvk.clone(), namespace: None, source }),
            };
            match scope {
                Scope::Cluster => self.sweep(claim, keep, mode, gvk, None, &mut report).await?,
                Scope::Namespaced => {
                    for ns in &namespaces {
                        self.sweep(claim, keep, mode, gvk, Some(ns.as_str()), &mut report).await?;
                    }
                }
            }
        }
        info!(
            deleted = report.deleted.len(),
            kept = report.kept.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            dry_run = self.dry_run,
            "cleanup done"
        );
        Ok(report)
    }

    async fn sweep(
        &self,
        claim: &Claim,
        keep: &KeepSet,
        mode: Mode,
        gvk: &ResourceIdentity,
        namespace: Option<&str>,
        report: &mut CleanupReport,
    ) -> Result<(), CleanupError> {
        let mut items = Vec::new();
        let mut token = None;
        loop {
            let options = ListOptions::default().labels(&claim.selector).limit(self.list_limit).continue_from(token);
            let page = match self.cluster.list(gvk, namespace, &options).await {
                Ok(page) => page,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(source) => {
                    return Err(CleanupError::List { gvk: gvk.clone(), namespace: namespace.map(str::to_string), source })
                }
            };
            items.extend(page.items);
            match page.continue_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        // Deletes start only after the listing is complete.
        for item in items {
            match Object::from_json(item) {
                Ok(live) => self.consider(claim, keep, mode, live, report).await,
                Err(e) => {
                    warn!(gvk = %gvk, ns = ?namespace, error = %e, "unresolvable listed resource");
                    report.skipped.push(format!("{gvk} in {}: {e}", namespace.unwrap_or("<cluster>")));
                }
            }
        }
        Ok(())
    }

    async fn consider(&self, claim: &Claim, keep: &KeepSet, mode: Mode, live: Object, report: &mut CleanupReport) {
        let r = live.reference().clone();
        if !claim.claims_name(&r.name) {
            return;
        }
        let ns = r.namespace_or_empty();
        let kept = keep.contains(&r.gvk, ns, &r.name) || (ns == claim.default_namespace && keep.contains(&r.gvk, "", &r.name));
        if kept {
            report.kept.push(r.to_string());
            return;
        }
        let allowed = match CleanupOn::from_object(&live) {
            Ok(on) => match mode {
                Mode::Orphans => on.on_orphaned(),
                Mode::Delete => on.on_delete(),
            },
            Err(e) => {
                warn!(object = %r, error = %e, "unreadable cleanup-on; leaving it");
                false
            }
        };
        if !allowed {
            report.skipped.push(r.to_string());
            return;
        }
        if self.dry_run {
            info!(object = %r, "would delete");
            report.deleted.push(r.to_string());
            return;
        }
        match self.cluster.delete(&r).await {
            Ok(()) => {
                counter!("cleanup_deleted", 1u64);
                info!(object = %r, "deleted");
                report.deleted.push(r.to_string());
            }
            Err(e) if e.is_not_found() => report.deleted.push(r.to_string()),
            Err(e) => {
                counter!("cleanup_failed", 1u64);
                warn!(object = %r, error = %e, "delete failed");
                report.failed.push((r.to_string(), e.to_string()));
            }
        }
    }
}
