//! In-memory view of the legacy export, filtered to the selected user.
//!
//! Each table is a tab-separated text file with a header row. Tables are
//! streamed line by line and released as soon as their collection is built to
//! bound peak memory; the three tag tables are not read at all when prior
//! progress shows they are no longer needed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use crate::checkpoint::{Checkpoint, LegacyTag, StepKind};
use crate::config::RunConfig;
use crate::error::MigrateError;

/// The export writes `\N` where a column is NULL.
pub const NULL_MARKER: &str = "\\N";

const ASSETS_TABLE: &str = "assets";
const TAGS_TABLE: &str = "tags";
const TAGS_CLOSURE_TABLE: &str = "tags closure";
const TAGS_ASSETS_TABLE: &str = "tags assets";
const ALBUMS_TABLE: &str = "albums";
const FILES_IN_ALBUMS_TABLE: &str = "files in albums";
const ASSET_STACKS_TABLE: &str = "asset stacks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl FromStr for MediaKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMAGE" => Ok(MediaKind::Image),
            "VIDEO" => Ok(MediaKind::Video),
            _ => Err(()),
        }
    }
}

/// One asset row, owner-filtered. Only the columns the pipeline reads are
/// named; the rest of the 29-column row is discarded at parse time.
#[derive(Debug, Clone)]
pub struct AssetRow {
    pub id: String,
    /// Device-local id, or the literal `"NONE"`.
    pub device_asset_id: String,
    pub device_id: String,
    pub media_type: MediaKind,
    pub file_path: String,
    pub file_created_at: String,
    pub file_modified_at: String,
    /// Legacy id of the live-photo companion video, when the asset is the
    /// photo half of a live photo.
    pub live_photo_video_id: Option<String>,
    pub filename: String,
    pub sidecar_path: Option<String>,
    pub stack_id: Option<String>,
    pub status: String,
    pub dedupe_id: Option<String>,
    pub update_id: Option<String>,
}

impl AssetRow {
    pub fn is_trashed(&self) -> bool {
        self.status == "trashed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAlbum {
    pub name: String,
    pub description: Option<String>,
    /// Legacy member ids, minus assets already known to be trashed.
    pub assets: BTreeSet<String>,
}

/// Everything the sequencer needs from the export, built once per run.
#[derive(Debug)]
pub struct SourceSnapshot {
    /// Legacy stack id → primary legacy asset id.
    pub stacks: BTreeMap<String, String>,
    pub albums: BTreeMap<String, LegacyAlbum>,
    pub assets: Vec<AssetRow>,
}

impl SourceSnapshot {
    /// Read the export tables, merging tag state into the checkpoint's
    /// forward map. The checkpoint is consulted for trash knowledge and for
    /// deciding whether the tag tables still need to be read.
    pub fn load(config: &RunConfig, checkpoint: &mut Checkpoint) -> Result<Self, MigrateError> {
        tracing::info!(user = %config.user, "building source snapshot");

        let stacks = load_stacks(config, checkpoint)?;
        let albums = load_albums(config, checkpoint)?;

        if checkpoint.step_completed(StepKind::Assets)
            && checkpoint.step_completed(StepKind::CreateTags)
        {
            tracing::info!("tag tables skipped; prior progress already covers them");
        } else {
            merge_tags(config, checkpoint)?;
        }

        let assets = load_assets(config)?;

        tracing::info!(
            tags = checkpoint.tag_fwd_map.len(),
            albums = albums.len(),
            stacks = stacks.len(),
            assets = assets.len(),
            "snapshot ready"
        );

        Ok(SourceSnapshot {
            stacks,
            albums,
            assets,
        })
    }
}

/// Iterate the data rows of one table: header discarded, blank lines
/// skipped, `\r\n` endings tolerated.
fn for_each_row(
    config: &RunConfig,
    table: &'static str,
    mut visit: impl FnMut(&str) -> Result<(), MigrateError>,
) -> Result<(), MigrateError> {
    let path = config.table_path(table);
    let file = File::open(&path).map_err(|source| MigrateError::TableIo { table, source })?;
    let reader = BufReader::new(file);

    let mut lines = reader.lines();
    // Header row.
    if let Some(header) = lines.next() {
        header.map_err(|source| MigrateError::TableIo { table, source })?;
    }

    for line in lines {
        let line = line.map_err(|source| MigrateError::TableIo { table, source })?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        visit(line)?;
    }
    Ok(())
}

fn field<'a>(
    fields: &[&'a str],
    index: usize,
    table: &'static str,
    line: &str,
) -> Result<&'a str, MigrateError> {
    match fields.get(index) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(MigrateError::MalformedRow {
            table,
            line: line.to_string(),
        }),
    }
}

fn optional_field(fields: &[&str], index: usize) -> Option<String> {
    fields
        .get(index)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn null_to_none(value: &str) -> Option<String> {
    if value == NULL_MARKER {
        None
    } else {
        Some(value.to_string())
    }
}

fn load_stacks(
    config: &RunConfig,
    checkpoint: &Checkpoint,
) -> Result<BTreeMap<String, String>, MigrateError> {
    let mut stacks = BTreeMap::new();
    for_each_row(config, ASSET_STACKS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let stack_id = field(&fields, 0, ASSET_STACKS_TABLE, line)?;
        let primary_asset_id = field(&fields, 1, ASSET_STACKS_TABLE, line)?;
        stacks.insert(stack_id.to_string(), primary_asset_id.to_string());
        Ok(())
    })?;

    if !checkpoint.step_completed(StepKind::Stacks) && !checkpoint.stack_staging.is_empty() {
        tracing::info!(
            staged = checkpoint.stack_staging.len(),
            "stacks were previously staged but not finished"
        );
    }
    Ok(stacks)
}

fn load_albums(
    config: &RunConfig,
    checkpoint: &Checkpoint,
) -> Result<BTreeMap<String, LegacyAlbum>, MigrateError> {
    let mut albums = BTreeMap::new();
    for_each_row(config, ALBUMS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let album_id = field(&fields, 0, ALBUMS_TABLE, line)?;
        let owner_id = field(&fields, 1, ALBUMS_TABLE, line)?;
        let name = field(&fields, 2, ALBUMS_TABLE, line)?;
        let description = optional_field(&fields, 6).and_then(|value| null_to_none(&value));

        if !owner_id.eq_ignore_ascii_case(&config.legacy_user_id) {
            return Ok(());
        }

        albums.insert(
            album_id.to_string(),
            LegacyAlbum {
                name: name.to_string(),
                description,
                assets: BTreeSet::new(),
            },
        );
        Ok(())
    })?;

    for_each_row(config, FILES_IN_ALBUMS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let album_id = field(&fields, 0, FILES_IN_ALBUMS_TABLE, line)?;
        let asset_id = field(&fields, 1, FILES_IN_ALBUMS_TABLE, line)?;

        // Albums absent from the map belong to another user.
        let Some(album) = albums.get_mut(album_id) else {
            return Ok(());
        };
        // Assets identified as trashed on a previous run never re-enter.
        if checkpoint.trashed_assets.contains(asset_id) {
            return Ok(());
        }
        album.assets.insert(asset_id.to_string());
        Ok(())
    })?;

    Ok(albums)
}

/// Build the tag forward map from the three tag tables, on top of whatever a
/// previous run already recorded in the checkpoint.
fn merge_tags(config: &RunConfig, checkpoint: &mut Checkpoint) -> Result<(), MigrateError> {
    for_each_row(config, TAGS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let tag_id = field(&fields, 0, TAGS_TABLE, line)?;
        let user_id = field(&fields, 1, TAGS_TABLE, line)?;
        let name = field(&fields, 2, TAGS_TABLE, line)?;

        if !user_id.eq_ignore_ascii_case(&config.legacy_user_id) {
            return Ok(());
        }
        if checkpoint.tag_fwd_map.contains_key(tag_id) {
            return Ok(());
        }

        // The export's parent column is NOT NULL; real parentage comes from
        // the closure table below.
        checkpoint.tag_fwd_map.insert(
            tag_id.to_string(),
            LegacyTag {
                name: name.to_string(),
                parent_id: None,
                assets: Vec::new(),
            },
        );
        Ok(())
    })?;

    for_each_row(config, TAGS_CLOSURE_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let ancestor = field(&fields, 0, TAGS_CLOSURE_TABLE, line)?;
        let descendant = field(&fields, 1, TAGS_CLOSURE_TABLE, line)?;

        // Every tag is listed as its own ancestor; those pairs carry no
        // parentage.
        if ancestor.eq_ignore_ascii_case(descendant) {
            return Ok(());
        }
        // Already-created tags keep whatever parent they were created with.
        if checkpoint.tag_map.contains(descendant) {
            return Ok(());
        }
        // Tags absent from the map belong to another user.
        if let Some(tag) = checkpoint.tag_fwd_map.get_mut(descendant) {
            tag.parent_id = Some(ancestor.to_string());
        }
        Ok(())
    })?;

    for_each_row(config, TAGS_ASSETS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();
        let asset_id = field(&fields, 0, TAGS_ASSETS_TABLE, line)?;
        let tag_id = field(&fields, 1, TAGS_ASSETS_TABLE, line)?;

        if let Some(tag) = checkpoint.tag_fwd_map.get_mut(tag_id) {
            if !tag.assets.iter().any(|existing| existing == asset_id) {
                tag.assets.push(asset_id.to_string());
            }
        }
        Ok(())
    })?;

    Ok(())
}

fn load_assets(config: &RunConfig) -> Result<Vec<AssetRow>, MigrateError> {
    let mut assets = Vec::new();
    for_each_row(config, ASSETS_TABLE, |line| {
        let fields: Vec<&str> = line.split('\t').collect();

        // Rows for other users are dropped before the strict field checks so
        // a malformed foreign row cannot abort this user's run.
        let Some(owner_id) = fields.get(2) else {
            return Err(MigrateError::MalformedRow {
                table: ASSETS_TABLE,
                line: line.to_string(),
            });
        };
        if !owner_id.eq_ignore_ascii_case(&config.legacy_user_id) {
            return Ok(());
        }

        let media_type = field(&fields, 4, ASSETS_TABLE, line)?
            .parse::<MediaKind>()
            .map_err(|()| MigrateError::MalformedRow {
                table: ASSETS_TABLE,
                line: line.to_string(),
            })?;

        assets.push(AssetRow {
            id: field(&fields, 0, ASSETS_TABLE, line)?.to_string(),
            device_asset_id: field(&fields, 1, ASSETS_TABLE, line)?.to_string(),
            device_id: field(&fields, 3, ASSETS_TABLE, line)?.to_string(),
            media_type,
            file_path: field(&fields, 5, ASSETS_TABLE, line)?.to_string(),
            file_created_at: field(&fields, 6, ASSETS_TABLE, line)?.to_string(),
            file_modified_at: field(&fields, 7, ASSETS_TABLE, line)?.to_string(),
            live_photo_video_id: null_to_none(field(&fields, 13, ASSETS_TABLE, line)?),
            filename: field(&fields, 17, ASSETS_TABLE, line)?.to_string(),
            sidecar_path: null_to_none(field(&fields, 18, ASSETS_TABLE, line)?),
            stack_id: optional_field(&fields, 25).and_then(|value| null_to_none(&value)),
            status: field(&fields, 27, ASSETS_TABLE, line)?.to_string(),
            dedupe_id: optional_field(&fields, 26).and_then(|value| null_to_none(&value)),
            update_id: optional_field(&fields, 28).and_then(|value| null_to_none(&value)),
        });
        Ok(())
    })?;
    Ok(assets)
}
