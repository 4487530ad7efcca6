//! Out-of-band import of users and assignments from a JSON file.
//!
//! Assignments come from an external HR feed; the HTTP API never creates
//! them. Loading is safe to repeat: known users and identical assignments
//! are skipped.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::engine::{Engine, EngineError};
use crate::model::{AssignmentInput, User};
use crate::store::RecordFilter;

#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub assignments: Vec<AssignmentInput>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub users_created: usize,
    pub users_skipped: usize,
    pub assignments_created: usize,
    pub assignments_skipped: usize,
    pub offerings_created: usize,
}

pub async fn load_file(engine: &Engine, path: &Path) -> anyhow::Result<LoadReport> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading fixtures from {}", path.display()))?;
    let fixtures: Fixtures = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing fixtures in {}", path.display()))?;
    let report = apply(engine, fixtures).await?;
    tracing::info!(
        path = %path.display(),
        users = report.users_created,
        assignments = report.assignments_created,
        offerings = report.offerings_created,
        "fixtures loaded"
    );
    Ok(report)
}

pub async fn apply(engine: &Engine, fixtures: Fixtures) -> anyhow::Result<LoadReport> {
    let mut report = LoadReport::default();

    for user in fixtures.users {
        match engine.get_user(user.id).await {
            Ok(_) => report.users_skipped += 1,
            Err(EngineError::NotFound { .. }) => {
                let id = user.id;
                engine
                    .create_user(user)
                    .await
                    .with_context(|| format!("creating user {id}"))?;
                report.users_created += 1;
            }
            Err(e) => return Err(e).context("looking up fixture user"),
        }
    }

    for input in fixtures.assignments {
        let existing = engine
            .list_assignments(RecordFilter::Workspace(input.workspace_id))
            .await
            .context("listing assignments")?;
        let duplicate = existing.iter().any(|a| {
            a.user_id == input.user_id && a.start_time == input.start_time && a.end_time == input.end_time
        });
        if duplicate {
            report.assignments_skipped += 1;
            continue;
        }
        let (workspace_id, user_id) = (input.workspace_id, input.user_id);
        let (_, offering) = engine
            .create_assignment(input)
            .await
            .with_context(|| format!("assigning workspace {workspace_id} to user {user_id}"))?;
        report.assignments_created += 1;
        if offering.is_some() {
            report.offerings_created += 1;
        }
    }

    Ok(report)
}
