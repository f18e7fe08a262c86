use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};

use kubor_apply::{ApplySet, Engine};
use kubor_cleanup::{Claim, Cleaner, KeepSet, Mode};
use kubor_core::annotations::ControlAnnotations;
use kubor_core::{GvkRegistry, Object, Project, ReadinessRegistry, ResourceIdentity, ValidationError};
use kubor_kubehub::{assign_namespace, effective_namespace, ClusterApi, KubeCluster};
use kubor_schema::{Decoder, FileSource, SchemaRegistry};
use kubor_transform::{Context, Environment};

mod render;

use render::{ApplyReport, StatusRow};

#[derive(Parser, Debug)]
#[command(name = "kubor", version, about = "Apply rendered manifests, wait for them and clean up what is left behind")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project file
    #[arg(long = "project", global = true, env = "KUBOR_PROJECT", default_value = kubor_core::project::DEFAULT_PROJECT_FILE)]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Output {
    Human,
    Json,
}

#[derive(Args, Debug)]
struct Files {
    /// Manifest files or directories; `-` reads standard input
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply one stage of the manifests, wait for readiness, then remove orphans
    Apply {
        #[command(flatten)]
        files: Files,
        /// Only objects annotated with this stage are applied
        #[arg(long = "stage", env = "KUBOR_STAGE", default_value = kubor_core::annotations::DEFAULT_STAGE)]
        stage: String,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Total wait budget, e.g. "5m" (default: the project's waitTimeout)
        #[arg(long = "wait-timeout", value_parser = humantime::parse_duration)]
        wait_timeout: Option<Duration>,
        /// Skip the orphan sweep
        #[arg(long = "no-cleanup", action = ArgAction::SetTrue)]
        no_cleanup: bool,
    },
    /// Delete what the project owns but the manifests no longer declare
    Cleanup {
        #[command(flatten)]
        files: Files,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete everything the project owns
    Delete {
        #[command(flatten)]
        files: Files,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show presence and readiness of every declared object
    Status {
        #[command(flatten)]
        files: Files,
    },
    /// Print the twin catalog, or the twins of one identity ("apps/v1/Deployment")
    Twins { gvk: Option<String> },
}

fn init_tracing() {
    let env = std::env::var("KUBOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBOR_METRICS_ADDR; expected host:port");
        }
    }
}

/// Decode every manifest under `paths`.
fn load_batch(project: &Project, paths: &[PathBuf]) -> Result<Vec<Object>> {
    let source = FileSource::new(paths)?;
    let mut decoder = Decoder::new(SchemaRegistry::with_builtins(), project);
    let decoded = decoder.decode_all(source)?;
    info!(objects = decoded.len(), "manifests decoded");
    Ok(decoded.into_iter().map(|d| d.object).collect())
}

/// Objects of `stage` in batch order. Control annotations of every object are
/// checked, also of those outside the stage.
fn select_stage(batch: &[Object], stage: &str) -> Result<Vec<Object>, ValidationError> {
    let mut selected = Vec::new();
    for object in batch {
        if ControlAnnotations::from_object(object)?.in_stage(stage) {
            selected.push(object.clone());
        }
    }
    Ok(selected)
}

/// Decode the manifests and place namespace-less objects of namespaced kinds
/// where the server would put them. Returns the batch and that namespace, which
/// the cleanup claim must share.
async fn load_placed_batch(project: &Project, paths: &[PathBuf], cluster: &dyn ClusterApi) -> Result<(Vec<Object>, String)> {
    let mut batch = load_batch(project, paths)?;
    let namespace = effective_namespace(project, cluster);
    assign_namespace(cluster, &mut batch, &namespace).await?;
    debug!(namespace = %namespace, "default namespace resolved");
    Ok((batch, namespace))
}

fn load_project(path: &Path) -> Result<Project> {
    let project = Project::load(path)?;
    info!(group = %project.group_id, artifact = %project.artifact_id, release = %project.release, "project loaded");
    Ok(project)
}

async fn apply(output: Output, project: Project, paths: &[PathBuf], stage: &str, dry_run: bool, wait_timeout: Option<Duration>, no_cleanup: bool) -> Result<()> {
    let cluster = Arc::new(KubeCluster::connect().await?);
    let (batch, namespace) = load_placed_batch(&project, paths, cluster.as_ref()).await?;
    let twins = GvkRegistry::with_builtin_catalog();
    let keep = KeepSet::build(&batch, &twins)?;
    let selected = select_stage(&batch, stage)?;
    let context = Context::new(project.clone(), Environment::from_process());
    let engine = Engine::new(cluster.clone(), context).dry_run(dry_run);

    let mut set = ApplySet::new(&engine);
    for object in selected {
        set.push(object)?;
    }
    let budget = wait_timeout.unwrap_or(project.wait_timeout);
    info!(stage, objects = set.len(), dry_run, budget = ?budget, "applying");

    let outcome = set.apply(budget).await;
    let mut report = ApplyReport { units: set.summaries(), ..ApplyReport::default() };
    if let Err(e) = outcome {
        render::apply(output, &report)?;
        return Err(e.into());
    }
    if !dry_run {
        for (reference, result) in set.delete_executed().await {
            match result {
                Ok(()) => report.executed.push(reference.to_string()),
                Err(e) => warn!(object = %reference, error = %e, "could not delete executed object"),
            }
        }
        report.units = set.summaries();
    }
    if !no_cleanup {
        let claim = Claim::from_project(&project, &namespace, &batch)?;
        let cleaner = Cleaner::new(cluster.as_ref(), &twins).list_limit(project.list_limit).dry_run(dry_run);
        report.cleanup = Some(cleaner.run(&claim, &keep, Mode::Orphans).await?);
    }
    render::apply(output, &report)
}

async fn cleanup(output: Output, project: Project, paths: &[PathBuf], dry_run: bool, mode: Mode) -> Result<()> {
    let cluster = KubeCluster::connect().await?;
    let (batch, namespace) = load_placed_batch(&project, paths, &cluster).await?;
    let twins = GvkRegistry::with_builtin_catalog();
    let keep = match mode {
        Mode::Orphans => KeepSet::build(&batch, &twins)?,
        Mode::Delete => KeepSet::default(),
    };
    let claim = Claim::from_project(&project, &namespace, &batch)?;
    let report = Cleaner::new(&cluster, &twins).list_limit(project.list_limit).dry_run(dry_run).run(&claim, &keep, mode).await?;
    render::cleanup(output, &report)?;
    if !report.is_clean() {
        bail!("{} object(s) could not be deleted", report.failed.len());
    }
    Ok(())
}

async fn status(output: Output, project: Project, paths: &[PathBuf]) -> Result<()> {
    let cluster = KubeCluster::connect().await?;
    let (batch, _) = load_placed_batch(&project, paths, &cluster).await?;
    let readiness = ReadinessRegistry::default();
    let mut rows = Vec::with_capacity(batch.len());
    for object in &batch {
        let row = match cluster.get(object.reference()).await {
            Ok(live) => StatusRow::present(object.reference(), readiness.evaluate(&live)),
            Err(e) if e.is_not_found() => StatusRow::absent(object.reference()),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("reading {}", object.reference()))),
        };
        rows.push(row);
    }
    render::status(output, &rows)
}

fn twins(output: Output, gvk: Option<&str>) -> Result<()> {
    let registry = GvkRegistry::with_builtin_catalog();
    let classes: Vec<Vec<ResourceIdentity>> = match gvk {
        Some(key) => {
            let id: ResourceIdentity = key.parse()?;
            let mut members: Vec<_> = registry.twins_of(&id).into_iter().collect();
            members.sort();
            vec![members]
        }
        None => registry.classes(),
    };
    render::twins(output, &classes)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Apply { files, stage, dry_run, wait_timeout, no_cleanup } => {
            let project = load_project(&cli.project)?;
            apply(cli.output, project, &files.paths, stage, *dry_run, *wait_timeout, *no_cleanup).await
        }
        Commands::Cleanup { files, dry_run } => {
            let project = load_project(&cli.project)?;
            cleanup(cli.output, project, &files.paths, *dry_run, Mode::Orphans).await
        }
        Commands::Delete { files, dry_run } => {
            let project = load_project(&cli.project)?;
            cleanup(cli.output, project, &files.paths, *dry_run, Mode::Delete).await
        }
        Commands::Status { files } => {
            let project = load_project(&cli.project)?;
            status(cli.output, project, &files.paths).await
        }
        Commands::Twins { gvk } => twins(cli.output, gvk.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    fn obj(name: &str, stage: Option<&str>) -> Object {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}});
        if let Some(stage) = stage {
            v["metadata"]["annotations"] = json!({"kubor.echocat.org/stage": stage});
        }
        Object::from_json(v).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_flags_parse() {
        let cli = Cli::try_parse_from(["kubor", "-o", "json", "apply", "--stage", "migrate", "--wait-timeout", "90s", "--no-cleanup", "out/"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Apply { files, stage, dry_run, wait_timeout, no_cleanup } => {
                assert_eq!(files.paths, vec![PathBuf::from("out/")]);
                assert_eq!(stage, "migrate");
                assert!(!dry_run);
                assert_eq!(wait_timeout, Some(Duration::from_secs(90)));
                assert!(no_cleanup);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["kubor", "apply"]).is_err());
        assert!(Cli::try_parse_from(["kubor", "apply", "--wait-timeout", "soon", "x.yaml"]).is_err());
    }

    #[test]
    fn stages_select_objects_and_validate_all() {
        let batch = [obj("a", None), obj("b", Some("migrate")), obj("c", Some("deploy, migrate"))];
        let names = |stage| select_stage(&batch, stage).unwrap().iter().map(|o| o.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names("deploy"), vec!["a", "c"]);
        assert_eq!(names("migrate"), vec!["b", "c"]);

        let bad = [obj("a", None), obj("b", Some(" , "))];
        assert!(select_stage(&bad, "deploy").is_err());
    }

    #[test]
    fn batches_load_from_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  selector: {}\n  template: {}\n",
        )
        .unwrap();
        let project = Project { default_namespace: Some("prod".into()), ..Project::default() };
        let batch = load_batch(&project, &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|o| o.namespace() == Some("prod")));
    }
}
