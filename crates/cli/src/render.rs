//! Human and JSON output.

use anyhow::Result;
use serde::Serialize;

use kubor_apply::{UnitState, UnitSummary};
use kubor_cleanup::CleanupReport;
use kubor_core::{ObjectReference, Readiness, ReadyState, ResourceIdentity};

use crate::Output;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub units: Vec<UnitSummary>,
    /// Removed after completing (`cleanup-on: executed`).
    pub executed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Serialize)]
pub struct StatusRow {
    pub object: String,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
}

impl StatusRow {
    pub fn present(reference: &ObjectReference, readiness: Readiness) -> Self {
        Self { object: reference.to_string(), present: true, readiness: Some(readiness) }
    }

    pub fn absent(reference: &ObjectReference) -> Self { Self { object: reference.to_string(), present: false, readiness: None } }
}

fn state_label(state: UnitState) -> &'static str {
    match state {
        UnitState::Pending => "pending",
        UnitState::CheckedAbsent => "absent",
        UnitState::CheckedPresent => "present",
        UnitState::Created => "created",
        UnitState::Updated => "updated",
        UnitState::Ready => "ready",
        UnitState::RolledBack => "rolled-back",
        UnitState::Skipped => "skipped",
        UnitState::Deleted => "deleted",
    }
}

fn count(n: Option<i64>) -> String { n.map_or_else(|| "-".to_string(), |n| n.to_string()) }

fn json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn apply(output: Output, report: &ApplyReport) -> Result<()> {
    match output {
        Output::Json => json(report),
        Output::Human => {
            println!("STATE        DIFF         OBJECT");
            for unit in &report.units {
                let diff = unit.diff.map(|d| d.to_string()).unwrap_or_default();
                match &unit.note {
                    Some(note) => println!("{:<12} {:<12} {} ({})", state_label(unit.state), diff, unit.object, note),
                    None => println!("{:<12} {:<12} {}", state_label(unit.state), diff, unit.object),
                }
            }
            for object in &report.executed {
                println!("{:<12} {:<12} {}", "deleted", "", object);
            }
            if let Some(cleanup) = &report.cleanup {
                print_cleanup(cleanup);
            }
            Ok(())
        }
    }
}

fn print_cleanup(report: &CleanupReport) {
    for object in &report.deleted {
        println!("- {object}");
    }
    for (object, error) in &report.failed {
        println!("! {object}: {error}");
    }
    println!(
        "cleanup: {} deleted, {} kept, {} skipped, {} failed",
        report.deleted.len(),
        report.kept.len(),
        report.skipped.len(),
        report.failed.len()
    );
}

pub fn cleanup(output: Output, report: &CleanupReport) -> Result<()> {
    match output {
        Output::Json => json(report),
        Output::Human => {
            print_cleanup(report);
            Ok(())
        }
    }
}

pub fn status(output: Output, rows: &[StatusRow]) -> Result<()> {
    match output {
        Output::Json => json(rows),
        Output::Human => {
            println!("STATE      DESIRED READY UPDATED AVAIL OBJECT");
            for row in rows {
                let Some(r) = &row.readiness else {
                    println!("{:<10} {:>7} {:>5} {:>7} {:>5} {}", "absent", "-", "-", "-", "-", row.object);
                    continue;
                };
                let state = match r.state() {
                    ReadyState::Ready => "ready",
                    ReadyState::NotReady => "not-ready",
                    ReadyState::Unknown => "present",
                };
                println!(
                    "{:<10} {:>7} {:>5} {:>7} {:>5} {}",
                    state,
                    count(r.desired),
                    count(r.ready),
                    count(r.up_to_date),
                    count(r.available),
                    row.object
                );
            }
            Ok(())
        }
    }
}

pub fn twins(output: Output, classes: &[Vec<ResourceIdentity>]) -> Result<()> {
    match output {
        Output::Json => {
            let names: Vec<Vec<String>> = classes.iter().map(|c| c.iter().map(ToString::to_string).collect()).collect();
            json(&names)
        }
        Output::Human => {
            for class in classes {
                let names: Vec<String> = class.iter().map(ToString::to_string).collect();
                println!("{}", names.join(" = "));
            }
            Ok(())
        }
    }
}
