//! Command implementations.
//!
//! `run` spins up a full job runtime (worker pool included) inside the
//! CLI process and blocks until the job is terminal. The inspection
//! commands read the store directly without starting workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use unimark_core::action::{ACTION_KIND, logs_for};
use unimark_core::{
    ActionKind, ActionRecord, ActionStatus, EntityStore, JobRuntime, ReconcilerConfig,
    UniqueConstraintSet,
};
use unimark_store::SqliteStore;
use uuid::Uuid;

fn open_store(config: &ReconcilerConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.store_path).with_context(|| {
        format!("failed to open store at {}", config.store_path.display())
    })?;
    Ok(Arc::new(store))
}

fn parse_kind(kind: &str) -> Result<ActionKind> {
    match kind {
        "check" => Ok(ActionKind::Check),
        "repair" => Ok(ActionKind::Repair),
        "clean" => Ok(ActionKind::Clean),
        other => bail!("unknown job kind '{other}'"),
    }
}

const fn status_str(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Running => "running",
        ActionStatus::Done => "done",
        ActionStatus::Failed => "failed",
    }
}

/// Submit a job and block until it reaches a terminal phase.
pub fn run(config: &ReconcilerConfig, kind: &str, model: &str, timeout_secs: u64) -> Result<()> {
    let kind = parse_kind(kind)?;
    let store = open_store(config)?;
    let deriver = Arc::new(UniqueConstraintSet::from_models(&config.models));
    let runtime = JobRuntime::start(store, deriver, config.clone());

    let job_id = runtime.submit(kind, model).context("failed to submit job")?;
    println!("submitted {kind} job {job_id} for model '{model}'");

    let status = runtime
        .wait(job_id, Duration::from_secs(timeout_secs))
        .context("job did not finish in time")?;

    println!(
        "job {job_id}: {} ({} discrepancies)",
        status_str(status.status),
        status.log_count
    );
    for log in &status.logs {
        println!(
            "  {:<18} instance={} marker={}",
            log.kind.as_str(),
            log.instance_key,
            log.marker_key
        );
    }
    if status.status == ActionStatus::Failed {
        bail!("job {job_id} failed");
    }
    Ok(())
}

/// List every action record in the store.
pub fn jobs(config: &ReconcilerConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let entities = store.scan(ACTION_KIND, None, None, usize::MAX)?;
    let mut records: Vec<ActionRecord> = entities
        .iter()
        .map(ActionRecord::from_entity)
        .collect::<Result<_, _>>()?;
    records.sort_by_key(|r| r.created_at);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    println!(
        "{:<38} {:<8} {:<20} {:<10} {:>6}  {}",
        "ID", "KIND", "MODEL", "PHASE", "LOGS", "CREATED"
    );
    for record in records {
        println!(
            "{:<38} {:<8} {:<20} {:<10} {:>6}  {}",
            record.id,
            record.kind.as_str(),
            record.model,
            record.phase,
            record.log_count,
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

/// Show one job's record.
pub fn status(config: &ReconcilerConfig, job_id: Uuid) -> Result<()> {
    let store = open_store(config)?;
    let found = store.get_many(&[ActionRecord::key(job_id)])?;
    let Some(entity) = &found[0] else {
        bail!("unknown job {job_id}");
    };
    let record = ActionRecord::from_entity(entity)?;

    println!("job:      {}", record.id);
    println!("kind:     {}", record.kind);
    println!("model:    {}", record.model);
    println!("alias:    {}", record.alias);
    println!("phase:    {}", record.phase);
    println!("status:   {}", status_str(record.status()));
    println!("logs:     {}", record.log_count);
    println!("created:  {}", record.created_at.to_rfc3339());
    Ok(())
}

/// Print a job's discrepancy log entries.
pub fn logs(config: &ReconcilerConfig, job_id: Uuid, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let entries = logs_for(store.as_ref(), job_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no discrepancies recorded for {job_id}");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<18} instance={} marker={}",
            entry.kind.as_str(),
            entry.instance_key,
            entry.marker_key
        );
    }
    Ok(())
}

/// List configured models with their unique-constraint combinations.
pub fn models(config: &ReconcilerConfig) -> Result<()> {
    if config.models.is_empty() {
        println!("no models configured");
        return Ok(());
    }
    for model in &config.models {
        println!("{}", model.name);
        for combo in &model.unique {
            println!("  unique({})", combo.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(dir: &tempfile::TempDir) -> ReconcilerConfig {
        let mut config = ReconcilerConfig::from_toml(
            r#"
            [[models]]
            name = "profile"
            unique = [["email"]]
            "#,
        )
        .unwrap();
        config.store_path = dir.path().join("unimark.db");
        config
    }

    #[test]
    fn kind_parsing() {
        assert_eq!(parse_kind("check").unwrap(), ActionKind::Check);
        assert_eq!(parse_kind("repair").unwrap(), ActionKind::Repair);
        assert_eq!(parse_kind("clean").unwrap(), ActionKind::Clean);
        assert!(parse_kind("scrub").is_err());
    }

    #[test]
    fn run_on_empty_store_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        run(&temp_config(&dir), "check", "profile", 30).unwrap();
    }

    #[test]
    fn run_rejects_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&temp_config(&dir), "check", "account", 30).is_err());
    }

    #[test]
    fn inspection_commands_work_on_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);
        jobs(&config, false).unwrap();
        jobs(&config, true).unwrap();
        logs(&config, Uuid::new_v4(), true).unwrap();
        models(&config).unwrap();
        assert!(status(&config, Uuid::new_v4()).is_err());
    }
}
