//! Per-asset upload pipeline.
//!
//! One pass per media kind, videos first so that live-photo companion videos
//! hold a new id before the photo referencing them is created. Each asset is
//! classified (tracked / trashed / server duplicate / needs upload) before
//! any bytes move; every mutating call is preceded by an idempotency check
//! against the checkpoint so re-running after a crash never duplicates.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::api::{AssetUpload, RemoteLibrary};
use crate::checkpoint::{Checkpoint, MapEntry, NONE_SENTINEL};
use crate::error::{ApiError, MigrateError};
use crate::progress::{AssetCounts, ProgressSink};
use crate::snapshot::{AssetRow, MediaKind};
use crate::stacks::StackAssembler;

/// Leading directory of every path in the export; the dataset root already
/// is that directory.
const DATASET_PREFIX: &str = "upload/";

/// Result of a full upload pass (both media kinds).
#[derive(Debug, Clone, Copy)]
pub struct PassOutcome {
    pub counts: AssetCounts,
    /// False when any per-asset failure occurred or assets remain parked in
    /// the problem set; the step must not be marked completed.
    pub clean: bool,
}

/// Recoverable, per-asset failures. These are logged, recorded in the
/// checkpoint problem set and skipped; they never abort the pass.
#[derive(Debug, Error)]
enum UploadFailure {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("create call returned the NONE placeholder instead of an id")]
    NonePlaceholder,
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct UploadPipeline<'a, R> {
    remote: &'a R,
    dataset_dir: &'a Path,
    assembler: StackAssembler<'a>,
    counts: AssetCounts,
    pass_failed: bool,
}

impl<'a, R: RemoteLibrary> UploadPipeline<'a, R> {
    pub fn new(remote: &'a R, dataset_dir: &'a Path, assembler: StackAssembler<'a>) -> Self {
        Self {
            remote,
            dataset_dir,
            assembler,
            counts: AssetCounts::default(),
            pass_failed: false,
        }
    }

    /// Run both media passes over the owner-filtered asset rows.
    pub async fn run(
        mut self,
        checkpoint: &mut Checkpoint,
        assets: &[AssetRow],
        progress: &mut dyn ProgressSink,
    ) -> Result<PassOutcome, MigrateError> {
        progress.println(&self.counts.progress_line(assets.len()));
        // Videos first: live photos reference their companion video by id.
        self.upload_kind(checkpoint, assets, MediaKind::Video, progress)
            .await?;
        self.upload_kind(checkpoint, assets, MediaKind::Image, progress)
            .await?;

        let clean = !self.pass_failed && self.counts.problems == 0;
        Ok(PassOutcome {
            counts: self.counts,
            clean,
        })
    }

    async fn upload_kind(
        &mut self,
        checkpoint: &mut Checkpoint,
        assets: &[AssetRow],
        kind: MediaKind,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), MigrateError> {
        let total = assets.len();
        for asset in assets.iter().filter(|asset| asset.media_type == kind) {
            self.process_asset(checkpoint, asset, total, progress)
                .await?;
        }
        Ok(())
    }

    async fn process_asset(
        &mut self,
        checkpoint: &mut Checkpoint,
        asset: &AssetRow,
        total: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), MigrateError> {
        // A tracked id that is not well-formed is dropped so the asset gets
        // re-uploaded instead of poisoning downstream steps.
        if let Some(tracked) = checkpoint.asset_map.mapped(&asset.id) {
            if Uuid::parse_str(tracked).is_err() {
                checkpoint.asset_map.remove(&asset.id);
            }
        }

        match checkpoint.asset_map.get(&asset.id) {
            Some(MapEntry::Mapped(new_id)) => {
                let new_id = new_id.clone();
                self.counts.record_tracked();
                checkpoint.clear_problem_asset(&asset.id);
                // Staging can lag asset creation across runs.
                if let Some(stack_id) = &asset.stack_id {
                    self.assembler
                        .stage(checkpoint, stack_id, &asset.id, &new_id);
                }
                progress.update(&self.counts.progress_line(total));
                return Ok(());
            }
            Some(MapEntry::Skipped) => {
                // Intentionally not migrated; counts as already handled.
                self.counts.record_tracked();
                checkpoint.clear_problem_asset(&asset.id);
                progress.update(&self.counts.progress_line(total));
                return Ok(());
            }
            None => {}
        }

        if asset.is_trashed() {
            self.counts.record_trashed();
            checkpoint.trashed_assets.insert(asset.id.clone());
            checkpoint.clear_problem_asset(&asset.id);
            progress.update(&self.counts.progress_line(total));
            return Ok(());
        }

        // Permanently-failed assets wait for the operator to clear them.
        if checkpoint.problem_assets.contains(&asset.id) {
            self.counts.record_problem_skip();
            progress.update(&self.counts.progress_line(total));
            return Ok(());
        }

        if asset.device_asset_id != NONE_SENTINEL {
            let existing = self
                .remote
                .existing_asset_ids(&asset.device_id, &[asset.device_asset_id.clone()])
                .await?;
            if let Some(found) = existing.first() {
                if found != NONE_SENTINEL && Uuid::parse_str(found).is_ok() {
                    checkpoint.asset_map.insert(&asset.id, found);
                    self.counts.record_duplicate();
                    checkpoint.clear_problem_asset(&asset.id);
                    if let Some(stack_id) = &asset.stack_id {
                        self.assembler.stage(checkpoint, stack_id, &asset.id, found);
                    }
                    progress.update(&self.counts.progress_line(total));
                    return Ok(());
                }
                // A malformed id from the server is not trusted; fall through
                // and upload again.
            }
        }

        // Videos were processed first, so a missing companion id here means
        // the ordering precondition is broken. Not retryable.
        let live_photo_video_id = match &asset.live_photo_video_id {
            Some(companion) => match checkpoint.asset_map.mapped(companion) {
                Some(new_id) => Some(new_id.to_string()),
                None => {
                    return Err(MigrateError::MissingLivePhotoVideo {
                        filename: asset.filename.clone(),
                        companion: companion.clone(),
                    })
                }
            },
            None => None,
        };

        let new_id = match self.try_upload(asset, live_photo_video_id).await {
            Ok(new_id) => new_id,
            Err(failure) => {
                tracing::warn!(
                    legacy_id = %asset.id,
                    path = %asset.file_path,
                    error = %failure,
                    "asset upload failed; recorded as problem"
                );
                progress.println(&format!(
                    "Error uploading asset {} ({}): {failure}",
                    asset.id, asset.file_path
                ));
                checkpoint.problem_assets.insert(asset.id.clone());
                self.pass_failed = true;
                return Ok(());
            }
        };

        // The service answered; an id that is not well-formed now is a bug on
        // the far side and aborts the run.
        if Uuid::parse_str(&new_id).is_err() {
            return Err(MigrateError::MalformedNewId {
                entity: "asset",
                legacy_id: asset.id.clone(),
                id: new_id,
            });
        }

        checkpoint.asset_map.insert(&asset.id, &new_id);
        if let Some(stack_id) = &asset.stack_id {
            self.assembler
                .stage(checkpoint, stack_id, &asset.id, &new_id);
        }
        self.counts.record_created();
        progress.update(&self.counts.progress_line(total));
        Ok(())
    }

    async fn try_upload(
        &self,
        asset: &AssetRow,
        live_photo_video_id: Option<String>,
    ) -> Result<String, UploadFailure> {
        let data = self.read_dataset_file(&asset.file_path)?;
        let sidecar = match &asset.sidecar_path {
            Some(sidecar_path) => Some(self.read_dataset_file(sidecar_path)?),
            None => None,
        };

        let device_asset_id = if asset.device_asset_id == NONE_SENTINEL {
            synthesized_device_asset_id(data.len())
        } else {
            asset.device_asset_id.clone()
        };

        let outcome = self
            .remote
            .upload_asset(AssetUpload {
                device_asset_id,
                device_id: asset.device_id.clone(),
                file_created_at: asset.file_created_at.clone(),
                file_modified_at: asset.file_modified_at.clone(),
                filename: asset.filename.clone(),
                live_photo_video_id,
                data,
                sidecar,
            })
            .await?;

        if outcome.id == NONE_SENTINEL {
            return Err(UploadFailure::NonePlaceholder);
        }
        Ok(outcome.id)
    }

    fn read_dataset_file(&self, export_path: &str) -> Result<Vec<u8>, UploadFailure> {
        let path = self.dataset_dir.join(dataset_relative(export_path));
        std::fs::read(&path).map_err(|source| UploadFailure::Read { path, source })
    }
}

/// Translate an export path into a dataset-relative one: drop the leading
/// `upload/`, then apply the two directory renames the dataset uses.
fn dataset_relative(export_path: &str) -> String {
    let trimmed = export_path
        .strip_prefix(DATASET_PREFIX)
        .unwrap_or(export_path);
    trimmed
        .replacen("upload", "uploads", 1)
        .replacen("encoded-video", "encoded_videos", 1)
}

/// Stand-in device asset id when the export carries none. Stable enough for
/// one run; a re-run synthesizes a different one, so cross-run identity rests
/// on the checkpoint map instead.
fn synthesized_device_asset_id(payload_len: usize) -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_paths_map_into_the_dataset_layout() {
        assert_eq!(
            dataset_relative("upload/upload/lib/2021/img.jpg"),
            "uploads/lib/2021/img.jpg"
        );
        assert_eq!(
            dataset_relative("upload/encoded-video/lib/vid.mp4"),
            "encoded_videos/lib/vid.mp4"
        );
    }

    #[test]
    fn paths_without_the_prefix_are_left_in_place() {
        assert_eq!(dataset_relative("elsewhere/img.jpg"), "elsewhere/img.jpg");
    }

    #[test]
    fn synthesized_ids_embed_the_payload_size() {
        let id = synthesized_device_asset_id(1234);
        assert!(id.ends_with("-1234"));
        assert!(id.split('-').next().unwrap().parse::<i64>().is_ok());
    }
}
