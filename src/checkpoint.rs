//! Durable migration progress, one JSON record per user.
//!
//! The checkpoint is the only shared mutable state in a run. It is loaded
//! once at startup (created empty when the file is absent), threaded through
//! every step as `&mut Checkpoint`, and rewritten wholesale — never
//! incrementally — after each step boundary and on any fatal error path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

/// Legacy sentinel for "intentionally not migrated". Stored verbatim in the
/// on-disk maps; in memory it becomes [`MapEntry::Skipped`].
pub const NONE_SENTINEL: &str = "NONE";

/// The five migration steps, in sequencer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    CreateTags,
    Assets,
    TagAssets,
    Stacks,
    Albums,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::CreateTags,
        StepKind::Assets,
        StepKind::TagAssets,
        StepKind::Stacks,
        StepKind::Albums,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StepKind::CreateTags => "create-tags",
            StepKind::Assets => "assets",
            StepKind::TagAssets => "tag-assets",
            StepKind::Stacks => "stacks",
            StepKind::Albums => "albums",
        }
    }
}

/// Resolution state of one legacy id. Absence from the table means the
/// entity has not been migrated at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntry {
    /// Migrated; carries the id assigned by the remote service.
    Mapped(String),
    /// Intentionally not migrated (`"NONE"` on disk).
    Skipped,
}

impl MapEntry {
    pub fn as_mapped(&self) -> Option<&str> {
        match self {
            MapEntry::Mapped(id) => Some(id),
            MapEntry::Skipped => None,
        }
    }
}

/// Legacy id → new id table. Serialized as the flat `map<string,string>`
/// shape the legacy tracker file used, with `"NONE"` preserved exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable(BTreeMap<String, MapEntry>);

impl RemapTable {
    pub fn get(&self, legacy_id: &str) -> Option<&MapEntry> {
        self.0.get(legacy_id)
    }

    /// The new id, if this legacy id is mapped (not skipped, not absent).
    pub fn mapped(&self, legacy_id: &str) -> Option<&str> {
        self.0.get(legacy_id).and_then(MapEntry::as_mapped)
    }

    pub fn contains(&self, legacy_id: &str) -> bool {
        self.0.contains_key(legacy_id)
    }

    pub fn insert(&mut self, legacy_id: impl Into<String>, new_id: impl Into<String>) {
        self.0
            .insert(legacy_id.into(), MapEntry::Mapped(new_id.into()));
    }

    pub fn mark_skipped(&mut self, legacy_id: impl Into<String>) {
        self.0.insert(legacy_id.into(), MapEntry::Skipped);
    }

    pub fn remove(&mut self, legacy_id: &str) {
        self.0.remove(legacy_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MapEntry)> {
        self.0.iter()
    }
}

impl Serialize for RemapTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(legacy, entry)| {
            let value = match entry {
                MapEntry::Mapped(id) => id.as_str(),
                MapEntry::Skipped => NONE_SENTINEL,
            };
            (legacy, value)
        }))
    }
}

impl<'de> Deserialize<'de> for RemapTable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(RemapTable(
            raw.into_iter()
                .map(|(legacy, value)| {
                    let entry = if value == NONE_SENTINEL {
                        MapEntry::Skipped
                    } else {
                        MapEntry::Mapped(value)
                    };
                    (legacy, entry)
                })
                .collect(),
        ))
    }
}

/// One legacy tag as carried in the checkpoint forward map: display name,
/// parent legacy id resolved from the closure table, and legacy member ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTag {
    pub name: String,
    #[serde(rename = "parentID")]
    pub parent_id: Option<String>,
    pub assets: Vec<String>,
}

/// The legacy tracker stored sets as maps with marker values
/// (`{"<id>": ""}` for problems, `{"<id>": true}` for trashed). These serde
/// shims keep that file shape while the in-memory type is a plain set.
mod empty_markers {
    use super::*;

    pub fn serialize<S: serde::Serializer>(
        set: &BTreeSet<String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(set.iter().map(|id| (id, "")))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<String>, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(raw.into_keys().collect())
    }
}

mod flag_markers {
    use super::*;

    pub fn serialize<S: serde::Serializer>(
        set: &BTreeSet<String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(set.iter().map(|id| (id, true)))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<String>, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        Ok(raw.into_keys().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    /// Set when a previous run died with an unhandled error; cleared (and
    /// reported) on the next load.
    pub interrupted: bool,
    pub steps_completed: BTreeSet<StepKind>,
    pub asset_map: RemapTable,
    pub tag_map: RemapTable,
    /// Legacy tag id → tag definition, merged from the export tables and
    /// whatever a previous run already recorded.
    pub tag_fwd_map: BTreeMap<String, LegacyTag>,
    pub album_map: RemapTable,
    pub stack_map: RemapTable,
    /// Legacy stack id → new asset ids accumulated so far, primary first.
    pub stack_staging: BTreeMap<String, Vec<String>>,
    #[serde(with = "empty_markers")]
    pub problem_assets: BTreeSet<String>,
    #[serde(with = "flag_markers")]
    pub trashed_assets: BTreeSet<String>,
    #[serde(with = "empty_markers")]
    pub problem_stacks: BTreeSet<String>,
}

impl Checkpoint {
    /// Load the record for a user, defaulting to an empty one when the file
    /// does not exist yet or is empty.
    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(source) => {
                return Err(MigrateError::CheckpointIo {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(Checkpoint::default());
        }
        serde_json::from_str(&raw).map_err(|source| MigrateError::CheckpointJson {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overwrite the record atomically: write a sibling tmp file, fsync,
    /// rename over the target. Partial checkpoint files must never be
    /// observable.
    pub fn save(&self, path: &Path) -> Result<(), MigrateError> {
        let io_err = |source: io::Error| MigrateError::CheckpointIo {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec(self).map_err(|source| MigrateError::CheckpointJson {
            path: path.display().to_string(),
            source,
        })?;

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn step_completed(&self, step: StepKind) -> bool {
        self.steps_completed.contains(&step)
    }

    pub fn mark_step_completed(&mut self, step: StepKind) {
        self.steps_completed.insert(step);
    }

    /// Drop a stale problem marker once the asset turns out to be resolved
    /// (tracked, trashed or found on the server).
    pub fn clear_problem_asset(&mut self, legacy_id: &str) {
        self.problem_assets.remove(legacy_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_default() {
        let tmp = TempDir::new().unwrap();
        let checkpoint = Checkpoint::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(checkpoint, Checkpoint::default());
    }

    #[test]
    fn empty_file_loads_as_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        fs::write(&path, "  \n").unwrap();
        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint, Checkpoint::default());
    }

    #[test]
    fn none_sentinel_round_trips_exactly() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");

        let mut checkpoint = Checkpoint::default();
        checkpoint.asset_map.insert("old-1", "6f1b24d1-4c2f-4aa0-9c93-102030405060");
        checkpoint.asset_map.mark_skipped("old-2");
        checkpoint.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["assetMap"]["old-2"], "NONE");

        let reloaded = Checkpoint::load(&path).unwrap();
        assert_eq!(reloaded.asset_map.get("old-2"), Some(&MapEntry::Skipped));
        assert_eq!(
            reloaded.asset_map.mapped("old-1"),
            Some("6f1b24d1-4c2f-4aa0-9c93-102030405060")
        );
        assert_eq!(reloaded.asset_map.mapped("old-2"), None);
    }

    #[test]
    fn marker_sets_keep_legacy_file_shape() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.problem_assets.insert("bad".into());
        checkpoint.trashed_assets.insert("gone".into());
        checkpoint.problem_stacks.insert("tiny".into());

        let raw = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(raw["problemAssets"], serde_json::json!({"bad": ""}));
        assert_eq!(raw["trashedAssets"], serde_json::json!({"gone": true}));
        assert_eq!(raw["problemStacks"], serde_json::json!({"tiny": ""}));

        let reloaded: Checkpoint = serde_json::from_value(raw).unwrap();
        assert!(reloaded.problem_assets.contains("bad"));
        assert!(reloaded.trashed_assets.contains("gone"));
        assert!(reloaded.problem_stacks.contains("tiny"));
    }

    #[test]
    fn steps_serialize_as_camel_case_names() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.mark_step_completed(StepKind::CreateTags);
        checkpoint.mark_step_completed(StepKind::TagAssets);

        let raw = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(
            raw["stepsCompleted"],
            serde_json::json!(["createTags", "tagAssets"])
        );
    }

    #[test]
    fn tag_fwd_map_uses_legacy_field_names() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.tag_fwd_map.insert(
            "t1".into(),
            LegacyTag {
                name: "People".into(),
                parent_id: None,
                assets: vec!["a1".into()],
            },
        );

        let raw = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(
            raw["tagFwdMap"]["t1"],
            serde_json::json!({"name": "People", "parentID": null, "assets": ["a1"]})
        );
    }

    #[test]
    fn save_overwrites_previous_record_wholesale() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");

        let mut first = Checkpoint::default();
        first.tag_map.insert("t1", "new-1");
        first.save(&path).unwrap();

        let mut second = Checkpoint::default();
        second.stack_map.insert("s1", "new-2");
        second.save(&path).unwrap();

        let reloaded = Checkpoint::load(&path).unwrap();
        assert!(reloaded.tag_map.is_empty());
        assert_eq!(reloaded.stack_map.mapped("s1"), Some("new-2"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn unknown_fields_in_old_records_are_tolerated() {
        let raw = r#"{"interrupted": true, "somethingElse": 42}"#;
        let checkpoint: Checkpoint = serde_json::from_str(raw).unwrap();
        assert!(checkpoint.interrupted);
        assert!(checkpoint.steps_completed.is_empty());
    }
}
