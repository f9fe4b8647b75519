use thiserror::Error;

/// Failure talking to the remote service. The endpoint label identifies the
/// operation so the step loop can surface which call went wrong.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Fatal migration errors. Anything constructed here aborts the run; the
/// sequencer marks the checkpoint interrupted, persists it and re-raises.
/// Per-asset upload failures are not represented here — they go into the
/// checkpoint problem set and the pass continues.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("failed to read export table {table}: {source}")]
    TableIo {
        table: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {table} row: {line}")]
    MalformedRow { table: &'static str, line: String },
    #[error("checkpoint {path}: {source}")]
    CheckpointIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is not valid JSON: {source}")]
    CheckpointJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("live-photo video {companion} has no migrated id yet (needed by {filename})")]
    MissingLivePhotoVideo { filename: String, companion: String },
    #[error("create call for {entity} {legacy_id} returned malformed id {id:?}")]
    MalformedNewId {
        entity: &'static str,
        legacy_id: String,
        id: String,
    },
    #[error("tag {legacy_id} is missing from the tag map")]
    UnmappedTag { legacy_id: String },
    #[error("{entity} {legacy_id} references asset {member} with no migrated id")]
    UnmappedMember {
        entity: &'static str,
        legacy_id: String,
        member: String,
    },
    #[error("bulk assignment to {entity} {id} failed: {errors}")]
    AssignmentFailed {
        entity: &'static str,
        id: String,
        errors: String,
    },
    #[error(
        "some assets could not be uploaded; inspect the problem set in the checkpoint and re-run"
    )]
    AssetPassIncomplete,
    #[error(transparent)]
    Api(#[from] ApiError),
}
