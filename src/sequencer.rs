//! The five-step migration state machine.
//!
//! Steps run in a fixed order (tags, assets, tag assignment, stacks,
//! albums); a step runs only when it is requested in the configuration and
//! not already recorded complete. Tag assignment, stacks and albums
//! additionally require the asset step to be complete in the *current*
//! checkpoint, which guarantees every member id they touch has either a new
//! id or an explicit trashed/skip marking. The checkpoint is persisted after
//! every step and on the failure path, never partially.

use std::collections::BTreeSet;
use std::path::Path;

use uuid::Uuid;

use crate::api::{BulkIdResult, RemoteLibrary};
use crate::checkpoint::{Checkpoint, MapEntry, StepKind, NONE_SENTINEL};
use crate::config::RunConfig;
use crate::error::MigrateError;
use crate::hierarchy;
use crate::pipeline::UploadPipeline;
use crate::progress::ProgressSink;
use crate::snapshot::SourceSnapshot;
use crate::stacks::StackAssembler;

/// Load the checkpoint, build the snapshot and run every requested step.
/// On any fatal error the checkpoint is marked interrupted, persisted, and
/// the error propagates to the caller.
pub async fn run<R: RemoteLibrary>(
    config: &RunConfig,
    remote: &R,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    let checkpoint_path = config.progress_path();
    let mut checkpoint = Checkpoint::load(&checkpoint_path)?;

    progress.println(&format!("Preparing to migrate user: {}", config.user));

    if checkpoint.interrupted {
        tracing::warn!(user = %config.user, "previous run was interrupted");
        progress.println("Previous run for this user was interrupted due to a failure");
        checkpoint.interrupted = false;
    }

    let steps: Vec<StepKind> = config
        .steps
        .iter()
        .copied()
        .filter(|step| !checkpoint.step_completed(*step))
        .collect();
    if steps.len() < config.steps.len() {
        progress.println("Configuration had steps that have already been completed");
    }

    let snapshot = SourceSnapshot::load(config, &mut checkpoint)?;
    progress.println(&format!(
        "Tags: {}; Albums: {}; Stacks: {}; Assets: {}",
        checkpoint.tag_fwd_map.len(),
        snapshot.albums.len(),
        snapshot.stacks.len(),
        snapshot.assets.len()
    ));

    let outcome = drive(
        config,
        remote,
        &mut checkpoint,
        &checkpoint_path,
        &snapshot,
        &steps,
        progress,
    )
    .await;

    match outcome {
        Ok(()) => {
            checkpoint.save(&checkpoint_path)?;
            progress.println("Migration configuration executed");
            Ok(())
        }
        Err(err) => {
            checkpoint.interrupted = true;
            if let Err(save_err) = checkpoint.save(&checkpoint_path) {
                tracing::error!(
                    error = %save_err,
                    "failed to persist checkpoint while handling a fatal error"
                );
            }
            Err(err)
        }
    }
}

async fn drive<R: RemoteLibrary>(
    config: &RunConfig,
    remote: &R,
    checkpoint: &mut Checkpoint,
    checkpoint_path: &Path,
    snapshot: &SourceSnapshot,
    steps: &[StepKind],
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    let requested = |step: StepKind| steps.contains(&step);

    if requested(StepKind::CreateTags) {
        run_create_tags(remote, checkpoint, progress).await?;
        checkpoint.save(checkpoint_path)?;
    }

    if requested(StepKind::Assets) {
        run_assets(config, remote, checkpoint, snapshot, progress).await?;
        checkpoint.save(checkpoint_path)?;
    }

    if checkpoint.step_completed(StepKind::Assets) {
        if requested(StepKind::TagAssets) {
            run_tag_assets(remote, checkpoint, progress).await?;
            checkpoint.save(checkpoint_path)?;
        }
        if requested(StepKind::Stacks) {
            run_stacks(remote, checkpoint, progress).await?;
            checkpoint.save(checkpoint_path)?;
        }
        if requested(StepKind::Albums) {
            run_albums(remote, checkpoint, snapshot, progress).await?;
            checkpoint.save(checkpoint_path)?;
        }
    } else if [StepKind::TagAssets, StepKind::Stacks, StepKind::Albums]
        .iter()
        .any(|step| requested(*step))
    {
        tracing::info!("asset step incomplete; tag assignment, stacks and albums deferred");
        progress.println("Dependent steps deferred until the asset step completes");
    }

    Ok(())
}

async fn run_create_tags<R: RemoteLibrary>(
    remote: &R,
    checkpoint: &mut Checkpoint,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    progress.println("Running tag creation step");
    let existing = remote.all_tags().await?;
    let order = hierarchy::creation_order(&checkpoint.tag_fwd_map);
    let total = order.len() as u64;

    let mut created = 0_u64;
    let mut skipped = 0_u64;
    for tag_id in &order {
        if checkpoint.tag_map.contains(tag_id) {
            skipped += 1;
            progress.update(&format!(
                "Tags created: {created} / {total}; Tags skipped: {skipped}"
            ));
            continue;
        }

        let (name, parent_id) = match checkpoint.tag_fwd_map.get(tag_id) {
            Some(tag) => (tag.name.clone(), tag.parent_id.clone()),
            None => continue,
        };

        if let Some(hit) = existing
            .iter()
            .find(|tag| hierarchy::remote_tag_satisfies(&name, &tag.name))
        {
            checkpoint.tag_map.insert(tag_id, &hit.id);
            skipped += 1;
            progress.update(&format!(
                "Tags created: {created} / {total}; Tags skipped: {skipped}"
            ));
            continue;
        }

        // Breadth-first order means a parent inside the forest is already
        // mapped by the time its children come up.
        let parent_new_id = parent_id
            .as_deref()
            .and_then(|parent| checkpoint.tag_map.mapped(parent))
            .map(str::to_string);

        let new_tag = remote.create_tag(&name, parent_new_id.as_deref()).await?;
        if Uuid::parse_str(&new_tag.id).is_err() {
            return Err(MigrateError::MalformedNewId {
                entity: "tag",
                legacy_id: tag_id.clone(),
                id: new_tag.id,
            });
        }
        checkpoint.tag_map.insert(tag_id, &new_tag.id);
        created += 1;
        progress.update(&format!(
            "Tags created: {created} / {total}; Tags skipped: {skipped}"
        ));
    }

    if created + skipped == total {
        checkpoint.mark_step_completed(StepKind::CreateTags);
    }
    Ok(())
}

async fn run_assets<R: RemoteLibrary>(
    config: &RunConfig,
    remote: &R,
    checkpoint: &mut Checkpoint,
    snapshot: &SourceSnapshot,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    progress.println("Running asset upload step");
    let assembler = StackAssembler::new(&snapshot.stacks);
    let pipeline = UploadPipeline::new(remote, &config.dataset_dir, assembler);
    let outcome = pipeline.run(checkpoint, &snapshot.assets, progress).await?;

    let total = snapshot.assets.len() as u64;
    if outcome.clean && outcome.counts.accounted() == total {
        checkpoint.mark_step_completed(StepKind::Assets);
    }
    if !outcome.clean {
        // The pass ran to the end so every uploadable asset got its chance;
        // the failures are recorded and the run stops here.
        return Err(MigrateError::AssetPassIncomplete);
    }
    Ok(())
}

async fn run_tag_assets<R: RemoteLibrary>(
    remote: &R,
    checkpoint: &mut Checkpoint,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    progress.println("Running tag assignment step");
    let total = checkpoint.tag_fwd_map.len() as u64;
    let entries: Vec<(String, Vec<String>)> = checkpoint
        .tag_fwd_map
        .iter()
        .map(|(tag_id, tag)| (tag_id.clone(), tag.assets.clone()))
        .collect();

    let mut populated = 0_u64;
    for (tag_id, members) in entries {
        let Some(new_tag_id) = checkpoint.tag_map.mapped(&tag_id).map(str::to_string) else {
            return Err(MigrateError::UnmappedTag { legacy_id: tag_id });
        };

        let new_ids = resolve_members(checkpoint, members.iter(), "tag", &tag_id)?;
        let results = remote.tag_assets(&new_tag_id, &new_ids).await?;
        ensure_bulk_success("tag", &new_tag_id, &results)?;

        populated += 1;
        progress.update(&format!("Tags populated with assets: {populated} / {total}"));
    }

    if populated == total {
        checkpoint.mark_step_completed(StepKind::TagAssets);
    }
    Ok(())
}

async fn run_stacks<R: RemoteLibrary>(
    remote: &R,
    checkpoint: &mut Checkpoint,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    progress.println("Running stack creation step");
    let entries: Vec<(String, Vec<String>)> = checkpoint
        .stack_staging
        .iter()
        .map(|(stack_id, staged)| (stack_id.clone(), staged.clone()))
        .collect();
    let total = entries.len() as u64;

    let mut created = 0_u64;
    let mut skipped = 0_u64;
    let mut problems = 0_u64;
    for (stack_id, staged) in entries {
        if checkpoint.stack_map.contains(&stack_id) {
            skipped += 1;
            progress.update(&format!(
                "Stacks created: {created} / {total}; Stacks skipped: {skipped}"
            ));
            continue;
        }
        if checkpoint.problem_stacks.contains(&stack_id) {
            problems += 1;
            continue;
        }
        // Staging lists are pre-filtered for trashed assets, so fewer than
        // two entries means the stack can never form.
        if staged.len() < 2 {
            tracing::warn!(
                stack = %stack_id,
                assets = staged.len(),
                "stack does not have enough assets; permanently skipped"
            );
            progress.println(&format!(
                "Stack {stack_id} does not have enough assets to form a stack"
            ));
            checkpoint.problem_stacks.insert(stack_id);
            problems += 1;
            continue;
        }

        let new_id = remote.create_stack(&staged).await?;
        if new_id == NONE_SENTINEL || Uuid::parse_str(&new_id).is_err() {
            return Err(MigrateError::MalformedNewId {
                entity: "stack",
                legacy_id: stack_id,
                id: new_id,
            });
        }
        checkpoint.stack_map.insert(&stack_id, &new_id);
        created += 1;
        progress.update(&format!(
            "Stacks created: {created} / {total}; Stacks skipped: {skipped}"
        ));
    }

    if created + skipped + problems == total {
        checkpoint.mark_step_completed(StepKind::Stacks);
    }
    Ok(())
}

async fn run_albums<R: RemoteLibrary>(
    remote: &R,
    checkpoint: &mut Checkpoint,
    snapshot: &SourceSnapshot,
    progress: &mut dyn ProgressSink,
) -> Result<(), MigrateError> {
    progress.println("Running album step");
    let total = snapshot.albums.len() as u64;

    let mut created = 0_u64;
    let mut updated = 0_u64;
    for (album_id, album) in &snapshot.albums {
        let new_ids = resolve_members(checkpoint, album.assets.iter(), "album", album_id)?;

        if let Some(new_album_id) = checkpoint.album_map.mapped(album_id).map(str::to_string) {
            updated += 1;
            let info = remote.album_info(&new_album_id).await?;
            let present: BTreeSet<&str> = info.assets.iter().map(|a| a.id.as_str()).collect();
            let missing: Vec<String> = new_ids
                .iter()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let results = remote.add_assets_to_album(&new_album_id, &missing).await?;
                ensure_bulk_success("album", &new_album_id, &results)?;
                progress.println(&format!("Assets updated for {}", album.name));
            }
            continue;
        }

        let new_album_id = remote
            .create_album(&album.name, album.description.as_deref(), &new_ids)
            .await?;
        if Uuid::parse_str(&new_album_id).is_err() {
            return Err(MigrateError::MalformedNewId {
                entity: "album",
                legacy_id: album_id.clone(),
                id: new_album_id,
            });
        }
        checkpoint.album_map.insert(album_id, &new_album_id);
        created += 1;
        progress.update(&format!("Albums created: {created} / {total}"));
    }

    if created + updated == total {
        checkpoint.mark_step_completed(StepKind::Albums);
    }
    Ok(())
}

/// Trash-filter a membership list and map it through the asset table.
/// `Skipped` members were intentionally left behind and drop out silently;
/// an absent member means the asset-step gate failed and is fatal.
fn resolve_members<'m>(
    checkpoint: &Checkpoint,
    members: impl IntoIterator<Item = &'m String>,
    entity: &'static str,
    legacy_id: &str,
) -> Result<Vec<String>, MigrateError> {
    let mut new_ids = Vec::new();
    for member in members {
        if checkpoint.trashed_assets.contains(member) {
            continue;
        }
        match checkpoint.asset_map.get(member) {
            Some(MapEntry::Mapped(new_id)) => new_ids.push(new_id.clone()),
            Some(MapEntry::Skipped) => {}
            None => {
                return Err(MigrateError::UnmappedMember {
                    entity,
                    legacy_id: legacy_id.to_string(),
                    member: member.clone(),
                })
            }
        }
    }
    Ok(new_ids)
}

fn ensure_bulk_success(
    entity: &'static str,
    id: &str,
    results: &[BulkIdResult],
) -> Result<(), MigrateError> {
    let failures: Vec<String> = results
        .iter()
        .filter(|result| {
            result
                .error
                .as_deref()
                .map_or(false, |error| error != crate::api::DUPLICATE_ERROR)
        })
        .map(|result| {
            format!(
                "{}: {}",
                result.id,
                result.error.as_deref().unwrap_or("unknown")
            )
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MigrateError::AssignmentFailed {
            entity,
            id: id.to_string(),
            errors: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, success: bool, error: Option<&str>) -> BulkIdResult {
        BulkIdResult {
            id: id.into(),
            success,
            error: error.map(String::from),
        }
    }

    #[test]
    fn duplicate_assignment_errors_are_success() {
        let results = vec![
            result("a", true, None),
            result("b", false, Some("duplicate")),
        ];
        assert!(ensure_bulk_success("tag", "t", &results).is_ok());
    }

    #[test]
    fn other_assignment_errors_are_fatal() {
        let results = vec![result("a", false, Some("no_permission"))];
        let err = ensure_bulk_success("tag", "t", &results).unwrap_err();
        assert!(matches!(err, MigrateError::AssignmentFailed { .. }));
    }

    #[test]
    fn skipped_members_drop_out_silently() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.asset_map.insert("a1", "new-1");
        checkpoint.asset_map.mark_skipped("a2");
        let members = vec!["a1".to_string(), "a2".to_string()];

        let resolved = resolve_members(&checkpoint, members.iter(), "tag", "t1").unwrap();
        assert_eq!(resolved, vec!["new-1"]);
    }

    #[test]
    fn trashed_members_are_filtered_before_mapping() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.trashed_assets.insert("a1".into());
        // Deliberately unmapped: the trash filter must win.
        let members = vec!["a1".to_string()];

        let resolved = resolve_members(&checkpoint, members.iter(), "album", "al1").unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn unmapped_member_is_fatal() {
        let checkpoint = Checkpoint::default();
        let members = vec!["a1".to_string()];
        let err = resolve_members(&checkpoint, members.iter(), "tag", "t1").unwrap_err();
        assert!(matches!(err, MigrateError::UnmappedMember { .. }));
    }
}
