//! Inspect command implementation.

use opsync_storage::{FileStore, OperationQueue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    /// Queue directory.
    pub path: String,
    /// Pending operations across all projects.
    pub total_pending: usize,
    /// Per-project details, sorted by project id.
    pub projects: Vec<ProjectStats>,
}

/// Statistics for a single project.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStats {
    /// Project id.
    pub id: String,
    /// Pending operations.
    pub pending: usize,
    /// Last acknowledged server version, if any.
    pub version: Option<u64>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_existing(path)?;
    let result = inspect(&store)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects pending counts and versions from an open store.
pub fn inspect(store: &FileStore) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let versions = store.versions();
    let mut projects: BTreeMap<String, ProjectStats> = BTreeMap::new();

    for id in store.projects()? {
        let pending = store.count(&id)?;
        projects.insert(
            id.clone(),
            ProjectStats {
                version: versions.get(&id).copied(),
                id,
                pending,
            },
        );
    }
    // Projects with a version but nothing pending.
    for (id, version) in versions {
        projects.entry(id.clone()).or_insert(ProjectStats {
            id,
            pending: 0,
            version: Some(version),
        });
    }

    Ok(InspectResult {
        path: store.path().display().to_string(),
        total_pending: store.len(),
        projects: projects.into_values().collect(),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("opsync Queue Inspection");
    println!("=======================");
    println!();
    println!("Path: {}", result.path);
    println!("Pending operations: {}", result.total_pending);

    if result.projects.is_empty() {
        println!();
        println!("No projects.");
        return;
    }

    println!();
    println!("Projects:");
    for project in &result.projects {
        let version = project
            .version
            .map_or_else(|| "never synced".to_string(), |v| format!("version {v}"));
        println!("  [{}] {} pending, {}", project.id, project.pending, version);
    }
}
