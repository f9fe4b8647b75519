//! The remote service boundary.
//!
//! Every operation the migration consumes is behind [`RemoteLibrary`] so the
//! sequencer can be driven against an in-memory fake in tests. The real
//! implementation, [`HttpRemote`], speaks the service's REST API with an
//! `x-api-key` header. All calls are awaited sequentially; the trait is not a
//! license to parallelize.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;

/// Per-asset error code the bulk endpoints use for "already there". Treated
/// as success everywhere.
pub const DUPLICATE_ERROR: &str = "duplicate";

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Created,
    Replaced,
    Duplicate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadOutcome {
    pub id: String,
    pub status: UploadStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkIdResult {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl BulkIdResult {
    /// An error that only says the asset was already assigned.
    pub fn is_duplicate(&self) -> bool {
        self.error.as_deref() == Some(DUPLICATE_ERROR)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumAsset {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumInfo {
    pub id: String,
    #[serde(default)]
    pub assets: Vec<AlbumAsset>,
}

/// One asset create request, bytes included.
#[derive(Debug)]
pub struct AssetUpload {
    pub device_asset_id: String,
    pub device_id: String,
    pub file_created_at: String,
    pub file_modified_at: String,
    pub filename: String,
    pub live_photo_video_id: Option<String>,
    pub data: Vec<u8>,
    pub sidecar: Option<Vec<u8>>,
}

#[async_trait]
pub trait RemoteLibrary: Sync {
    async fn all_tags(&self) -> Result<Vec<RemoteTag>, ApiError>;

    async fn create_tag(&self, name: &str, parent_id: Option<&str>)
        -> Result<RemoteTag, ApiError>;

    /// Ids of assets the server already holds for this device.
    async fn existing_asset_ids(
        &self,
        device_id: &str,
        device_asset_ids: &[String],
    ) -> Result<Vec<String>, ApiError>;

    async fn upload_asset(&self, upload: AssetUpload) -> Result<UploadOutcome, ApiError>;

    async fn create_stack(&self, asset_ids: &[String]) -> Result<String, ApiError>;

    async fn tag_assets(
        &self,
        tag_id: &str,
        asset_ids: &[String],
    ) -> Result<Vec<BulkIdResult>, ApiError>;

    async fn create_album(
        &self,
        name: &str,
        description: Option<&str>,
        asset_ids: &[String],
    ) -> Result<String, ApiError>;

    async fn album_info(&self, album_id: &str) -> Result<AlbumInfo, ApiError>;

    async fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<Vec<BulkIdResult>, ApiError>;
}

pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, anyhow::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut key_value = reqwest::header::HeaderValue::from_str(api_key)?;
        key_value.set_sensitive(true);
        headers.insert("x-api-key", key_value);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            endpoint,
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|source| ApiError::Decode { endpoint, source })
    }

    fn transport(endpoint: &'static str) -> impl FnOnce(reqwest::Error) -> ApiError {
        move |source| ApiError::Transport { endpoint, source }
    }
}

#[async_trait]
impl RemoteLibrary for HttpRemote {
    async fn all_tags(&self) -> Result<Vec<RemoteTag>, ApiError> {
        const EP: &str = "list-tags";
        let response = self
            .client
            .get(self.url("/tags"))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }

    async fn create_tag(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<RemoteTag, ApiError> {
        const EP: &str = "create-tag";
        let response = self
            .client
            .post(self.url("/tags"))
            .json(&json!({ "name": name, "parentId": parent_id }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }

    async fn existing_asset_ids(
        &self,
        device_id: &str,
        device_asset_ids: &[String],
    ) -> Result<Vec<String>, ApiError> {
        const EP: &str = "check-existing-assets";

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ExistingAssets {
            existing_ids: Vec<String>,
        }

        let response = self
            .client
            .post(self.url("/assets/exist"))
            .json(&json!({
                "deviceId": device_id,
                "deviceAssetIds": device_asset_ids,
            }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        let body: ExistingAssets = Self::decode(Self::check(response, EP).await?, EP).await?;
        Ok(body.existing_ids)
    }

    async fn upload_asset(&self, upload: AssetUpload) -> Result<UploadOutcome, ApiError> {
        const EP: &str = "upload-asset";

        let asset_part = reqwest::multipart::Part::bytes(upload.data)
            .file_name(upload.filename.clone());
        let mut form = reqwest::multipart::Form::new()
            .text("deviceAssetId", upload.device_asset_id)
            .text("deviceId", upload.device_id)
            .text("fileCreatedAt", upload.file_created_at)
            .text("fileModifiedAt", upload.file_modified_at)
            .part("assetData", asset_part);
        if let Some(live_photo_video_id) = upload.live_photo_video_id {
            form = form.text("livePhotoVideoId", live_photo_video_id);
        }
        if let Some(sidecar) = upload.sidecar {
            let sidecar_part = reqwest::multipart::Part::bytes(sidecar)
                .file_name(format!("{}.xmp", upload.filename));
            form = form.part("sidecarData", sidecar_part);
        }

        let response = self
            .client
            .post(self.url("/assets"))
            .multipart(form)
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }

    async fn create_stack(&self, asset_ids: &[String]) -> Result<String, ApiError> {
        const EP: &str = "create-stack";

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let response = self
            .client
            .post(self.url("/stacks"))
            .json(&json!({ "assetIds": asset_ids }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        let body: Created = Self::decode(Self::check(response, EP).await?, EP).await?;
        Ok(body.id)
    }

    async fn tag_assets(
        &self,
        tag_id: &str,
        asset_ids: &[String],
    ) -> Result<Vec<BulkIdResult>, ApiError> {
        const EP: &str = "tag-assets";
        let response = self
            .client
            .put(self.url(&format!("/tags/{tag_id}/assets")))
            .json(&json!({ "ids": asset_ids }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }

    async fn create_album(
        &self,
        name: &str,
        description: Option<&str>,
        asset_ids: &[String],
    ) -> Result<String, ApiError> {
        const EP: &str = "create-album";

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }

        let response = self
            .client
            .post(self.url("/albums"))
            .json(&json!({
                "albumName": name,
                "description": description,
                "assetIds": asset_ids,
            }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        let body: Created = Self::decode(Self::check(response, EP).await?, EP).await?;
        Ok(body.id)
    }

    async fn album_info(&self, album_id: &str) -> Result<AlbumInfo, ApiError> {
        const EP: &str = "get-album-info";
        let response = self
            .client
            .get(self.url(&format!("/albums/{album_id}")))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }

    async fn add_assets_to_album(
        &self,
        album_id: &str,
        asset_ids: &[String],
    ) -> Result<Vec<BulkIdResult>, ApiError> {
        const EP: &str = "add-assets-to-album";
        let response = self
            .client
            .put(self.url(&format!("/albums/{album_id}/assets")))
            .json(&json!({ "ids": asset_ids }))
            .send()
            .await
            .map_err(Self::transport(EP))?;
        Self::decode(Self::check(response, EP).await?, EP).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_bulk_errors_count_as_success() {
        let duplicate = BulkIdResult {
            id: "a".into(),
            success: false,
            error: Some("duplicate".into()),
        };
        let denied = BulkIdResult {
            id: "b".into(),
            success: false,
            error: Some("no_permission".into()),
        };
        assert!(duplicate.is_duplicate());
        assert!(!denied.is_duplicate());
    }

    #[test]
    fn upload_status_parses_service_values() {
        let status: UploadStatus = serde_json::from_str("\"duplicate\"").unwrap();
        assert_eq!(status, UploadStatus::Duplicate);
        let status: UploadStatus = serde_json::from_str("\"created\"").unwrap();
        assert_eq!(status, UploadStatus::Created);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let remote = HttpRemote::new("http://localhost:2283/api/", "key").unwrap();
        assert_eq!(remote.url("/tags"), "http://localhost:2283/api/tags");
    }
}
