//! Run configuration, loaded from a JSON file.
//!
//! The file holds every user known to the operator; exactly one is selected
//! per run. Validation happens at load time so the step loop never sees a
//! half-usable configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::checkpoint::StepKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub user_to_migrate: String,
    pub intended_steps_to_run: Vec<StepKind>,
    #[serde(rename = "locationOfDBFiles")]
    pub location_of_db_files: PathBuf,
    pub location_of_dataset: PathBuf,
    #[serde(rename = "apiBaseURL")]
    pub api_base_url: String,
    pub users: BTreeMap<String, UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub api_key: String,
    #[serde(rename = "oldUserID")]
    pub old_user_id: String,
}

/// Configuration resolved down to the single user this run migrates.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub user: String,
    /// Lowercased legacy user UUID; the export tables are filtered against it
    /// case-insensitively.
    pub legacy_user_id: String,
    pub api_key: String,
    pub api_base_url: String,
    pub steps: Vec<StepKind>,
    pub db_files_dir: PathBuf,
    pub dataset_dir: PathBuf,
}

impl RunConfig {
    /// Checkpoint file for the selected user.
    pub fn progress_path(&self) -> PathBuf {
        self.db_files_dir
            .join("staging")
            .join(format!("{}_progress.json", self.user))
    }

    /// Path of one legacy export table.
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.db_files_dir.join(format!("{table}.txt"))
    }
}

pub fn load(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read configuration {}", path.display()))?;
    let file: ConfigFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse configuration {}", path.display()))?;
    resolve(file)
}

pub fn resolve(file: ConfigFile) -> Result<RunConfig> {
    let Some(user_info) = file.users.get(&file.user_to_migrate) else {
        bail!(
            "selected user '{}' does not have an entry in the users table",
            file.user_to_migrate
        );
    };

    Uuid::parse_str(&user_info.old_user_id).with_context(|| {
        format!(
            "legacy user id for '{}' is not a UUID: {:?}",
            file.user_to_migrate, user_info.old_user_id
        )
    })?;

    if file.intended_steps_to_run.is_empty() {
        bail!("intendedStepsToRun is empty; nothing to do");
    }

    Ok(RunConfig {
        user: file.user_to_migrate.clone(),
        legacy_user_id: user_info.old_user_id.to_lowercase(),
        api_key: user_info.api_key.clone(),
        api_base_url: file.api_base_url,
        steps: file.intended_steps_to_run,
        db_files_dir: file.location_of_db_files,
        dataset_dir: file.location_of_dataset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user: &str, old_id: &str) -> ConfigFile {
        let mut users = BTreeMap::new();
        users.insert(
            "paula".to_string(),
            UserConfig {
                api_key: "key".into(),
                old_user_id: old_id.into(),
            },
        );
        ConfigFile {
            user_to_migrate: user.into(),
            intended_steps_to_run: vec![StepKind::CreateTags, StepKind::Assets],
            location_of_db_files: "/exports".into(),
            location_of_dataset: "/dataset".into(),
            api_base_url: "http://localhost:2283/api".into(),
            users,
        }
    }

    #[test]
    fn resolves_selected_user() {
        let cfg = resolve(sample("paula", "6F1B24D1-4C2F-4AA0-9C93-102030405060")).unwrap();
        assert_eq!(cfg.user, "paula");
        // Owner comparison is case-insensitive, so the id is lowercased once.
        assert_eq!(cfg.legacy_user_id, "6f1b24d1-4c2f-4aa0-9c93-102030405060");
        assert_eq!(
            cfg.progress_path(),
            PathBuf::from("/exports/staging/paula_progress.json")
        );
        assert_eq!(cfg.table_path("asset stacks"), PathBuf::from("/exports/asset stacks.txt"));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let err = resolve(sample("nobody", "6f1b24d1-4c2f-4aa0-9c93-102030405060")).unwrap_err();
        assert!(err.to_string().contains("nobody"));
    }

    #[test]
    fn malformed_legacy_user_id_is_rejected() {
        let err = resolve(sample("paula", "not-a-uuid")).unwrap_err();
        assert!(err.to_string().contains("not a UUID"));
    }

    #[test]
    fn step_names_parse_from_camel_case() {
        let raw = r#"{
            "userToMigrate": "paula",
            "intendedStepsToRun": ["createTags", "assets", "tagAssets", "stacks", "albums"],
            "locationOfDBFiles": "/exports",
            "locationOfDataset": "/dataset",
            "apiBaseURL": "http://localhost:2283/api",
            "users": {"paula": {"apiKey": "key", "oldUserID": "6f1b24d1-4c2f-4aa0-9c93-102030405060"}}
        }"#;
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.intended_steps_to_run, StepKind::ALL.to_vec());
    }
}
