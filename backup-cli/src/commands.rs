//! Command handlers. Each writes its report to `out` and returns whether the
//! operation succeeded; errors bubble up to `main` for the exit code.

use crate::cli::{Command, LockCommand};
use crate::docker::{ComposeServices, DockerVolumes};
use anyhow::Context;
use backup_engine::config::VolumeDriver;
use backup_engine::daemon::RunLock;
use backup_engine::{
    verify, BackupOrchestrator, BackupStore, Config, DirectoryVolumes, NoServices, RestoreEngine,
    RetentionManager, ServiceControl, Tier, VolumeTransfer,
};
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Failed => 1,
        }
    }
}

pub fn run(
    command: Command,
    config: &Config,
    out: &mut dyn Write,
    input: &mut dyn BufRead,
) -> anyhow::Result<Outcome> {
    match command {
        Command::Backup { tier } => backup(config, tier, out),
        Command::List { tier, json } => list(config, tier, json, out),
        Command::Verify { id, tier } => verify_set(config, &id, tier, out),
        Command::Restore { id, tier, yes } => restore(config, &id, tier, yes, out, input),
        Command::Prune { tier } => prune(config, tier, out),
        Command::Lock { action } => lock(config, action, out),
        Command::Config => {
            write!(out, "{}", config.to_toml()?)?;
            Ok(Outcome::Success)
        }
    }
}

fn backup(config: &Config, tier: Tier, out: &mut dyn Write) -> anyhow::Result<Outcome> {
    let volumes = volume_transfer(config)?;
    let run = BackupOrchestrator::new(config, volumes.as_ref()).run(tier)?;
    let set = &run.backup_set;

    writeln!(
        out,
        "{}/{} {} ({} sources, {})",
        tier,
        set.id,
        set.status,
        set.sources.len(),
        format_bytes(set.total_bytes())
    )?;
    if let Some(e) = run.error() {
        writeln!(out, "  error: {}", e)?;
    }
    if let Some(report) = &run.retention {
        for id in &report.pruned {
            writeln!(out, "  pruned {}/{}", tier, id)?;
        }
    }

    Ok(if run.succeeded() {
        Outcome::Success
    } else {
        Outcome::Failed
    })
}

fn list(
    config: &Config,
    tier: Option<Tier>,
    json: bool,
    out: &mut dyn Write,
) -> anyhow::Result<Outcome> {
    let store = BackupStore::from_config(config);
    let tiers = tier.map(|t| vec![t]).unwrap_or_else(|| Tier::ALL.to_vec());

    let mut rows = Vec::new();
    for tier in tiers {
        for set in store.list(tier)? {
            let row = match &set.manifest {
                Ok(manifest) => {
                    let backup_set = &manifest.backup_set;
                    serde_json::json!({
                        "tier": tier,
                        "id": set.id,
                        "created_at": backup_set.created_at.to_rfc3339(),
                        "status": backup_set.status,
                        "sources": backup_set.sources.len(),
                        "size_bytes": backup_set.total_bytes(),
                        "error": backup_set.error,
                    })
                }
                Err(e) => serde_json::json!({
                    "tier": tier,
                    "id": set.id,
                    "created_at": null,
                    "status": "corrupt",
                    "sources": null,
                    "size_bytes": null,
                    "error": e.to_string(),
                }),
            };
            rows.push(row);
        }
    }

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(Outcome::Success);
    }

    writeln!(
        out,
        "{:<8} {:<24} {:<26} {:<12} {:>7} {:>11}",
        "TIER", "ID", "CREATED", "STATUS", "SOURCES", "SIZE"
    )?;
    for row in &rows {
        let text = |key: &str| row[key].as_str().unwrap_or("-").to_string();
        let sources = row["sources"].as_u64().map(|n| n.to_string()).unwrap_or_else(|| "-".into());
        let size = row["size_bytes"].as_u64().map(format_bytes).unwrap_or_else(|| "-".into());
        writeln!(
            out,
            "{:<8} {:<24} {:<26} {:<12} {:>7} {:>11}",
            text("tier"),
            text("id"),
            text("created_at"),
            text("status"),
            sources,
            size
        )?;
        if let Some(error) = row["error"].as_str() {
            writeln!(out, "         {}", error)?;
        }
    }
    Ok(Outcome::Success)
}

fn verify_set(
    config: &Config,
    id: &str,
    tier: Tier,
    out: &mut dyn Write,
) -> anyhow::Result<Outcome> {
    let set_dir = BackupStore::from_config(config).locate(tier, id)?;
    let result = verify(&set_dir);

    for check in &result.checks {
        match (&check.error, check.entries) {
            (None, Some(entries)) => writeln!(out, "  ok    {} ({} entries)", check.name, entries)?,
            (None, None) => writeln!(out, "  ok    {}", check.name)?,
            (Some(e), _) => writeln!(out, "  FAIL  {}: {}", check.name, e)?,
        }
    }
    for e in &result.set_errors {
        writeln!(out, "  FAIL  {}", e)?;
    }

    let recorded = result
        .recorded_status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let verdict = if result.passed() { "passed" } else { "FAILED" };
    writeln!(out, "{}/{}: {} (recorded status {})", tier, id, verdict, recorded)?;

    Ok(if result.passed() {
        Outcome::Success
    } else {
        Outcome::Failed
    })
}

fn restore(
    config: &Config,
    id: &str,
    tier: Tier,
    yes: bool,
    out: &mut dyn Write,
    input: &mut dyn BufRead,
) -> anyhow::Result<Outcome> {
    if !yes && !confirm(id, tier, out, input)? {
        writeln!(out, "Restore cancelled")?;
        return Ok(Outcome::Failed);
    }

    let services = service_control(config);
    let volumes = volume_transfer(config)?;
    let report = RestoreEngine::new(config, services.as_ref(), volumes.as_ref()).restore(id, tier)?;

    writeln!(
        out,
        "Restored {}/{} ({} sources) in {}ms",
        report.tier,
        report.set_id,
        report.sources.len(),
        report.duration.as_millis()
    )?;
    Ok(Outcome::Success)
}

/// The operator has to type the set id back.
fn confirm(
    id: &str,
    tier: Tier,
    out: &mut dyn Write,
    input: &mut dyn BufRead,
) -> anyhow::Result<bool> {
    writeln!(
        out,
        "Restoring {}/{} stops the stack and overwrites live data.",
        tier, id
    )?;
    write!(out, "Type the backup set id to continue: ")?;
    out.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer).context("reading confirmation")?;
    Ok(answer.trim() == id)
}

fn prune(config: &Config, tier: Tier, out: &mut dyn Write) -> anyhow::Result<Outcome> {
    let _lock = RunLock::acquire(&config.storage.lock_path(), &format!("prune {}", tier))?;
    let report = RetentionManager::from_config(config).prune(&config.retention.policy(tier))?;

    for id in &report.pruned {
        writeln!(out, "  pruned   {}/{}", tier, id)?;
    }
    for issue in &report.skipped {
        writeln!(out, "  skipped  {}/{}: {}", tier, issue.id, issue.reason)?;
    }
    for issue in &report.failed {
        writeln!(out, "  FAILED   {}/{}: {}", tier, issue.id, issue.reason)?;
    }
    writeln!(
        out,
        "{}: {} pruned, {} retained, {} skipped, {} failed",
        tier,
        report.pruned.len(),
        report.retained,
        report.skipped.len(),
        report.failed.len()
    )?;

    Ok(if report.failed.is_empty() {
        Outcome::Success
    } else {
        Outcome::Failed
    })
}

fn lock(config: &Config, action: LockCommand, out: &mut dyn Write) -> anyhow::Result<Outcome> {
    let path = config.storage.lock_path();
    match action {
        LockCommand::Status => match RunLock::inspect(&path)? {
            Some(state) => writeln!(out, "{}: {}", path.display(), state.describe())?,
            None => writeln!(out, "{}: not held", path.display())?,
        },
        LockCommand::Clear { force } => {
            if RunLock::clear(&path, force)? {
                writeln!(out, "{}: cleared", path.display())?;
            } else {
                writeln!(out, "{}: not held", path.display())?;
            }
        }
    }
    Ok(Outcome::Success)
}

fn volume_transfer(config: &Config) -> anyhow::Result<Box<dyn VolumeTransfer>> {
    match config.volumes.driver {
        VolumeDriver::Docker => Ok(Box::new(DockerVolumes::new(&config.volumes.helper_image))),
        VolumeDriver::Directory => {
            let root = config
                .volumes
                .directory_root
                .as_ref()
                .context("volumes.directory_root is required with the directory driver")?;
            Ok(Box::new(DirectoryVolumes::new(root)))
        }
    }
}

fn service_control(config: &Config) -> Box<dyn ServiceControl> {
    match ComposeServices::from_config(&config.services) {
        Some(compose) => Box::new(compose),
        None => Box::new(NoServices),
    }
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> Config {
        let doc = format!(
            r#"
[storage]
backup_dir = "{root}/backups"
reserve_bytes = 0

[volumes]
driver = "directory"
directory_root = "{root}/volumes"

[[sources]]
name = "config"
kind = "filesystem_path"
path = "{root}/live/config"

[[sources]]
name = "uploads"
kind = "filesystem_path"
path = "{root}/live/uploads"
"#,
            root = root.display()
        );
        Config::from_toml_str(&doc).unwrap()
    }

    fn seed(root: &Path) {
        fs::create_dir_all(root.join("live/config")).unwrap();
        fs::create_dir_all(root.join("live/uploads")).unwrap();
        fs::write(root.join("live/config/app.env"), "DEBUG=0").unwrap();
    }

    fn exec(config: &Config, command: Command, stdin: &str) -> (Outcome, String) {
        let mut out = Vec::new();
        let mut input = stdin.as_bytes();
        let outcome = run(command, config, &mut out, &mut input).unwrap();
        (outcome, String::from_utf8(out).unwrap())
    }

    fn only_set_id(config: &Config) -> String {
        BackupStore::from_config(config).list(Tier::Daily).unwrap()[0].id.clone()
    }

    #[test]
    fn test_backup_list_verify() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());
        seed(root.path());

        let (outcome, text) = exec(&config, Command::Backup { tier: Tier::Daily }, "");
        assert_eq!(outcome, Outcome::Success);
        assert!(text.contains("verified (2 sources"));
        let id = only_set_id(&config);

        let (_, text) = exec(&config, Command::List { tier: None, json: true }, "");
        let rows: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(rows[0]["id"], id.as_str());
        assert_eq!(rows[0]["status"], "verified");
        assert_eq!(rows[0]["sources"], 2);

        let (outcome, text) = exec(&config, Command::Verify { id: id.clone(), tier: Tier::Daily }, "");
        assert_eq!(outcome, Outcome::Success);
        assert!(text.contains("passed (recorded status verified)"));
    }

    #[test]
    fn test_failed_backup_exits_nonzero() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());

        let (outcome, text) = exec(&config, Command::Backup { tier: Tier::Daily }, "");
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(outcome.exit_code(), 1);
        assert!(text.contains("failed"));
        assert!(text.contains("error: Source unavailable: config"));
    }

    #[test]
    fn test_restore_requires_typed_confirmation() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());
        seed(root.path());
        exec(&config, Command::Backup { tier: Tier::Daily }, "");
        let id = only_set_id(&config);
        fs::write(root.path().join("live/config/app.env"), "DEBUG=1").unwrap();

        let restore = Command::Restore {
            id: id.clone(),
            tier: Tier::Daily,
            yes: false,
        };
        let (outcome, text) = exec(&config, restore.clone(), "wrong\n");
        assert_eq!(outcome, Outcome::Failed);
        assert!(text.contains("Restore cancelled"));
        assert_eq!(fs::read_to_string(root.path().join("live/config/app.env")).unwrap(), "DEBUG=1");

        let (outcome, _) = exec(&config, restore, &format!("{}\n", id));
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(fs::read_to_string(root.path().join("live/config/app.env")).unwrap(), "DEBUG=0");
    }

    #[test]
    fn test_verify_unknown_set_is_an_error() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());
        let mut out = Vec::new();
        let err = run(
            Command::Verify {
                id: "nope".into(),
                tier: Tier::Weekly,
            },
            &config,
            &mut out,
            &mut "".as_bytes(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Backup set not found: weekly/nope"));
    }

    #[test]
    fn test_lock_status_and_clear() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());

        let (_, text) = exec(&config, Command::Lock { action: LockCommand::Status }, "");
        assert!(text.ends_with("not held\n"));

        // Lock left behind by a process that no longer exists
        fs::create_dir_all(root.path().join("backups")).unwrap();
        let stale = serde_json::json!({
            "pid": 999_999_999u32,
            "host": "elsewhere",
            "operation": "backup daily",
            "acquired_at": "2026-10-01T03:00:00Z",
        });
        fs::write(config.storage.lock_path(), stale.to_string()).unwrap();

        let (_, text) = exec(&config, Command::Lock { action: LockCommand::Status }, "");
        assert!(text.contains("backup daily by pid 999999999 on elsewhere"));

        let (_, text) = exec(&config, Command::Lock { action: LockCommand::Clear { force: true } }, "");
        assert!(text.ends_with("cleared\n"));
        assert!(!config.storage.lock_path().exists());
    }

    #[test]
    fn test_prune_and_config() {
        let root = TempDir::new().unwrap();
        let config = config_for(root.path());

        let (outcome, text) = exec(&config, Command::Prune { tier: Tier::Monthly }, "");
        assert_eq!(outcome, Outcome::Success);
        assert!(text.contains("monthly: 0 pruned, 0 retained"));

        let (_, text) = exec(&config, Command::Config, "");
        let reparsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(reparsed.sources.len(), 2);
        assert_eq!(reparsed.storage.backup_dir, config.storage.backup_dir);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
