use crate::engine::EngineHandle;
use std::path::PathBuf;
use zbus::interface;

/// D-Bus interface for the faceid daemon.
///
/// Bus name: io.faceid.FaceId1
/// Object path: /io/faceid/FaceId1
///
/// Upload methods return `(status, json_body)` mirroring the HTTP-style
/// contract of the enrollment boundary. Empty strings stand for missing
/// fields.
pub struct FaceIdService {
    engine: EngineHandle,
    bus: String,
}

impl FaceIdService {
    pub fn new(engine: EngineHandle, bus: String) -> Self {
        Self { engine, bus }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn engine_error(e: crate::engine::EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "engine request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "io.faceid.FaceId1")]
impl FaceIdService {
    /// Enroll `user_id` from the video at `path` (a file readable by the daemon).
    async fn upload_video(&self, user_id: &str, path: &str) -> zbus::fdo::Result<(u16, String)> {
        tracing::info!(user_id, path, "UploadVideo requested");
        let response = self
            .engine
            .upload_video(non_empty(user_id), non_empty(path).map(PathBuf::from))
            .await
            .map_err(engine_error)?;
        Ok((response.status, response.body.to_string()))
    }

    /// Verify the probe image at `path` against `user_id`'s model.
    async fn upload_image(&self, user_id: &str, path: &str) -> zbus::fdo::Result<(u16, String)> {
        tracing::info!(user_id, path, "UploadImage requested");
        let response = self
            .engine
            .upload_image(non_empty(user_id), non_empty(path).map(PathBuf::from))
            .await
            .map_err(engine_error)?;
        Ok((response.status, response.body.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "bus": self.bus,
            "data_dir": status.data_dir.display().to_string(),
            "models": status.models,
            "requests_served": status.requests_served,
        })
        .to_string())
    }

    /// List stored models as a JSON array of `{user_id, classes, created_at}`.
    async fn list_models(&self) -> zbus::fdo::Result<String> {
        let manifests = self.engine.list_models().await.map_err(engine_error)?;
        let models: Vec<_> = manifests
            .iter()
            .map(|m| {
                serde_json::json!({
                    "user_id": m.user_id,
                    "classes": m.classes,
                    "created_at": m.created_at.to_rfc3339(),
                    "val_accuracy": m.report.val_accuracy,
                })
            })
            .collect();
        Ok(serde_json::Value::from(models).to_string())
    }

    /// Remove `user_id`'s model. Returns false if none was stored.
    async fn remove_model(&self, user_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user_id, "RemoveModel requested");
        self.engine
            .remove_model(user_id.to_string())
            .await
            .map_err(engine_error)
    }
}
