use faceid_core::enrollment::Response;
use faceid_core::store::StoreError;
use faceid_core::{ArtifactManifest, Classifier, EnrollmentService, UserId};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests buffered ahead of the engine thread.
const REQUEST_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid user id: {0}")]
    InvalidUser(String),
    #[error("model store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot reported by the `Status` method.
pub struct EngineStatus {
    pub data_dir: PathBuf,
    pub models: usize,
    pub requests_served: u64,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    UploadVideo {
        user_id: Option<String>,
        path: Option<PathBuf>,
        reply: oneshot::Sender<Response>,
    },
    UploadImage {
        user_id: Option<String>,
        path: Option<PathBuf>,
        reply: oneshot::Sender<Response>,
    },
    ListModels {
        reply: oneshot::Sender<Result<Vec<ArtifactManifest>, EngineError>>,
    },
    RemoveModel {
        user_id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll from an uploaded video: extract faces, train, store.
    pub async fn upload_video(
        &self,
        user_id: Option<String>,
        path: Option<PathBuf>,
    ) -> Result<Response, EngineError> {
        self.call(|reply| EngineRequest::UploadVideo {
            user_id,
            path,
            reply,
        })
        .await
    }

    /// Verify an uploaded probe image against the user's model.
    pub async fn upload_image(
        &self,
        user_id: Option<String>,
        path: Option<PathBuf>,
    ) -> Result<Response, EngineError> {
        self.call(|reply| EngineRequest::UploadImage {
            user_id,
            path,
            reply,
        })
        .await
    }

    pub async fn list_models(&self) -> Result<Vec<ArtifactManifest>, EngineError> {
        self.call(|reply| EngineRequest::ListModels { reply }).await?
    }

    pub async fn remove_model(&self, user_id: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::RemoveModel { user_id, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the enrollment service and handles one request at a
/// time in arrival order, so work for the same user never overlaps.
pub fn spawn_engine<C>(mut service: EnrollmentService<C>) -> Result<EngineHandle, EngineError>
where
    C: Classifier + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut served: u64 = 0;
            while let Some(req) = rx.blocking_recv() {
                served += 1;
                match req {
                    EngineRequest::UploadVideo {
                        user_id,
                        path,
                        reply,
                    } => {
                        tracing::info!(user = ?user_id, "upload_video");
                        let response = service.upload_video(user_id.as_deref(), path.as_deref());
                        tracing::info!(status = response.status, "upload_video done");
                        let _ = reply.send(response);
                    }
                    EngineRequest::UploadImage {
                        user_id,
                        path,
                        reply,
                    } => {
                        tracing::info!(user = ?user_id, "upload_image");
                        let response = service.upload_image(user_id.as_deref(), path.as_deref());
                        tracing::info!(status = response.status, "upload_image done");
                        let _ = reply.send(response);
                    }
                    EngineRequest::ListModels { reply } => {
                        let _ = reply.send(service.store().list().map_err(EngineError::from));
                    }
                    EngineRequest::RemoveModel { user_id, reply } => {
                        let _ = reply.send(run_remove(&service, &user_id));
                    }
                    EngineRequest::Status { reply } => {
                        let status = service.store().list().map_err(EngineError::from).map(
                            |models| EngineStatus {
                                data_dir: service.config().storage.data_dir.clone(),
                                models: models.len(),
                                requests_served: served,
                            },
                        );
                        let _ = reply.send(status);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_remove<C: Classifier>(
    service: &EnrollmentService<C>,
    raw: &str,
) -> Result<bool, EngineError> {
    let user = UserId::parse(raw).map_err(|e| EngineError::InvalidUser(e.to_string()))?;
    Ok(service.store().remove(&user)?)
}
