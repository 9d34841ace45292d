//! Per-user classifier artifacts on disk.
//!
//! A user's artifact is its manifest, `models/{user}.json`, which names the
//! weights file it belongs to. Every training run writes its weights under a
//! fresh generation name (`models/{user}.{generation}.bin`) and only then
//! renames the manifest into place. That rename is the single commit point,
//! so a reader always pairs a manifest with the weights it was written for.

use crate::classifier::{Classifier, TrainedModel, TrainingReport};
use crate::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const WEIGHTS_EXTENSION: &str = "bin";
const MANIFEST_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no model for user {0}")]
    ModelNotFound(String),
    #[error("model for user {user} is corrupt: {reason}")]
    Corrupt { user: String, reason: String },
    #[error("model store I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("manifest encoding error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Classifier(#[from] crate::classifier::ClassifierError),
}

/// Metadata stored next to a user's weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    pub user_id: String,
    /// Class names in label order; `classes[i]` is output `i` of the model.
    pub classes: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// File name of the weights, relative to the store directory.
    pub weights_file: String,
    pub report: TrainingReport,
}

/// Directory of per-user classifier artifacts.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, user: &UserId) -> PathBuf {
        self.dir.join(format!("{user}.{MANIFEST_EXTENSION}"))
    }

    /// Weights path named by the user's current manifest.
    pub fn weights_path(&self, user: &UserId) -> Result<PathBuf, StoreError> {
        let manifest = self.manifest(user)?;
        self.resolve_weights(user, &manifest)
    }

    pub fn exists(&self, user: &UserId) -> bool {
        self.manifest_path(user).is_file()
    }

    /// Persist a trained model, replacing any previous artifact for `user`.
    pub fn save<M: TrainedModel>(
        &self,
        user: &UserId,
        model: &M,
        classes: &[String],
        report: &TrainingReport,
    ) -> Result<ArtifactManifest, StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| self.io_error(&self.dir, source))?;

        let previous = self.manifest(user).ok();
        let created_at = Utc::now();
        let weights_file = self.fresh_weights_file(user, &created_at);
        let weights = self.dir.join(&weights_file);
        let manifest_path = self.manifest_path(user);
        let manifest_tmp = self.dir.join(format!(".{user}.partial.{MANIFEST_EXTENSION}"));

        let manifest = ArtifactManifest {
            user_id: user.to_string(),
            classes: classes.to_vec(),
            created_at,
            weights_file,
            report: report.clone(),
        };

        if let Err(e) = model.save(&weights) {
            let _ = std::fs::remove_file(&weights);
            return Err(e.into());
        }
        let json = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(&manifest_tmp, json).map_err(|source| self.io_error(&manifest_tmp, source))?;
        std::fs::rename(&manifest_tmp, &manifest_path)
            .map_err(|source| self.io_error(&manifest_path, source))?;

        if let Some(old) = previous.filter(|m| m.weights_file != manifest.weights_file) {
            if let Ok(path) = self.resolve_weights(user, &old) {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove superseded weights");
                }
            }
        }

        tracing::info!(
            user = %user,
            classes = ?manifest.classes,
            path = %weights.display(),
            "model saved"
        );
        Ok(manifest)
    }

    pub fn manifest(&self, user: &UserId) -> Result<ArtifactManifest, StoreError> {
        let path = self.manifest_path(user);
        if !path.is_file() {
            return Err(StoreError::ModelNotFound(user.to_string()));
        }
        let bytes = std::fs::read(&path).map_err(|source| self.io_error(&path, source))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            user: user.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load a user's model and its manifest.
    pub fn load<C: Classifier>(
        &self,
        classifier: &C,
        user: &UserId,
    ) -> Result<(C::Model, ArtifactManifest), StoreError> {
        if !self.exists(user) {
            return Err(StoreError::ModelNotFound(user.to_string()));
        }
        let manifest = self.manifest(user)?;
        let weights = self.resolve_weights(user, &manifest)?;
        let model = classifier.load(&weights, manifest.classes.len())?;
        if model.num_classes() != manifest.classes.len() {
            return Err(StoreError::Corrupt {
                user: user.to_string(),
                reason: format!(
                    "model has {} outputs, manifest lists {} classes",
                    model.num_classes(),
                    manifest.classes.len()
                ),
            });
        }
        Ok((model, manifest))
    }

    /// Manifests of every stored model, sorted by user id. Unreadable
    /// manifests are skipped with a warning.
    pub fn list(&self) -> Result<Vec<ArtifactManifest>, StoreError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|source| self.io_error(&self.dir, source))?;

        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry.map_err(|source| self.io_error(&self.dir, source))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(user) = UserId::parse(stem) else {
                continue;
            };
            match self.manifest(&user) {
                Ok(m) => manifests.push(m),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping manifest"),
            }
        }
        manifests.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(manifests)
    }

    /// Delete a user's artifact. Returns `false` if there was none.
    pub fn remove(&self, user: &UserId) -> Result<bool, StoreError> {
        let manifest_path = self.manifest_path(user);
        let weights = self
            .manifest(user)
            .ok()
            .and_then(|m| self.resolve_weights(user, &m).ok());

        match std::fs::remove_file(&manifest_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(self.io_error(&manifest_path, source)),
        }
        if let Some(path) = weights {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(self.io_error(&path, source)),
            }
        }
        tracing::info!(user = %user, "model removed");
        Ok(true)
    }

    /// Weights file name for a new generation that does not exist yet.
    fn fresh_weights_file(&self, user: &UserId, created_at: &DateTime<Utc>) -> String {
        let generation = created_at.format("%Y%m%d%H%M%S%6f");
        let mut name = format!("{user}.{generation}.{WEIGHTS_EXTENSION}");
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{user}.{generation}-{n}.{WEIGHTS_EXTENSION}");
            n += 1;
        }
        name
    }

    /// The weights path a manifest names; it must be a plain file name.
    fn resolve_weights(&self, user: &UserId, manifest: &ArtifactManifest) -> Result<PathBuf, StoreError> {
        let name = Path::new(&manifest.weights_file);
        if name.file_name() != Some(name.as_os_str()) {
            return Err(StoreError::Corrupt {
                user: user.to_string(),
                reason: format!("weights file {:?} is not a plain file name", manifest.weights_file),
            });
        }
        Ok(self.dir.join(name))
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classifier::{ClassifierError, Prediction};
    use crate::dataset::DatasetSplit;
    use ndarray::ArrayView2;

    /// Model whose weights file is just its fixed probabilities as JSON.
    #[derive(Debug, Clone)]
    pub(crate) struct FixedModel {
        pub probabilities: Vec<f32>,
    }

    impl TrainedModel for FixedModel {
        fn num_classes(&self) -> usize {
            self.probabilities.len()
        }

        fn predict(&self, _face: ArrayView2<'_, f32>) -> Result<Prediction, ClassifierError> {
            Ok(Prediction::new(self.probabilities.clone()))
        }

        fn save(&self, weights: &Path) -> Result<(), ClassifierError> {
            let json = serde_json::to_vec(&self.probabilities).map_err(|e| ClassifierError::Save {
                path: weights.display().to_string(),
                reason: e.to_string(),
            })?;
            std::fs::write(weights, json).map_err(|e| ClassifierError::Save {
                path: weights.display().to_string(),
                reason: e.to_string(),
            })
        }
    }

    /// Classifier that "trains" a [`FixedModel`] with the given probabilities.
    #[derive(Debug, Clone)]
    pub(crate) struct FixedClassifier {
        pub probabilities: Vec<f32>,
    }

    impl Classifier for FixedClassifier {
        type Model = FixedModel;

        fn fit(&self, split: &DatasetSplit) -> Result<(FixedModel, TrainingReport), ClassifierError> {
            let mut probabilities = self.probabilities.clone();
            probabilities.resize(split.classes.len(), 0.0);
            Ok((FixedModel { probabilities }, report()))
        }

        fn load(&self, weights: &Path, _num_classes: usize) -> Result<FixedModel, ClassifierError> {
            let load_err = |reason: String| ClassifierError::Load {
                path: weights.display().to_string(),
                reason,
            };
            let bytes = std::fs::read(weights).map_err(|e| load_err(e.to_string()))?;
            let probabilities = serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
            Ok(FixedModel { probabilities })
        }
    }

    pub(crate) fn report() -> TrainingReport {
        TrainingReport {
            epochs_run: 1,
            best_epoch: 0,
            best_val_loss: 0.1,
            val_accuracy: 1.0,
            test_accuracy: None,
            history: vec![],
        }
    }

    fn classes() -> Vec<String> {
        vec!["alice".into(), "unknown".into()]
    }

    fn alice() -> UserId {
        UserId::parse("alice").unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        let model = FixedModel {
            probabilities: vec![0.9, 0.1],
        };

        let saved = store.save(&alice(), &model, &classes(), &report()).unwrap();
        assert!(store.exists(&alice()));
        let weights = store.weights_path(&alice()).unwrap();
        assert_eq!(weights, store.dir().join(&saved.weights_file));
        assert!(saved.weights_file.starts_with("alice."));
        assert!(saved.weights_file.ends_with(".bin"));

        let classifier = FixedClassifier { probabilities: vec![] };
        let (loaded, manifest) = store.load(&classifier, &alice()).unwrap();
        assert_eq!(loaded.probabilities, vec![0.9, 0.1]);
        assert_eq!(manifest.classes, classes());
        assert_eq!(manifest.user_id, "alice");
    }

    #[test]
    fn test_save_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = FixedModel {
            probabilities: vec![0.5, 0.5],
        };
        let saved = store.save(&alice(), &model, &classes(), &report()).unwrap();

        let mut names = file_names(dir.path());
        names.sort();
        let mut expected = vec![saved.weights_file, "alice.json".to_string()];
        expected.sort();
        assert_eq!(names, expected);
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_retrain_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let classifier = FixedClassifier { probabilities: vec![] };

        let first = FixedModel {
            probabilities: vec![0.6, 0.4],
        };
        store.save(&alice(), &first, &classes(), &report()).unwrap();
        let second = FixedModel {
            probabilities: vec![0.2, 0.8],
        };
        store.save(&alice(), &second, &classes(), &report()).unwrap();

        let (loaded, _) = store.load(&classifier, &alice()).unwrap();
        assert_eq!(loaded.probabilities, vec![0.2, 0.8]);
    }

    #[test]
    fn test_retrain_pairs_manifest_with_its_own_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let classifier = FixedClassifier { probabilities: vec![] };

        let two = FixedModel {
            probabilities: vec![0.6, 0.4],
        };
        let first = store.save(&alice(), &two, &classes(), &report()).unwrap();

        let three = FixedModel {
            probabilities: vec![0.1, 0.2, 0.7],
        };
        let wider: Vec<String> = vec!["alice".into(), "bob".into(), "carol".into()];
        let second = store.save(&alice(), &three, &wider, &report()).unwrap();

        assert_ne!(first.weights_file, second.weights_file);
        assert!(!dir.path().join(&first.weights_file).exists());
        assert_eq!(file_names(dir.path()).len(), 2);

        let (loaded, manifest) = store.load(&classifier, &alice()).unwrap();
        assert_eq!(manifest.classes, wider);
        assert_eq!(loaded.probabilities, vec![0.1, 0.2, 0.7]);
    }

    #[test]
    fn test_manifest_naming_foreign_path_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = FixedModel {
            probabilities: vec![0.5, 0.5],
        };
        let mut manifest = store.save(&alice(), &model, &classes(), &report()).unwrap();
        manifest.weights_file = "../elsewhere.bin".into();
        std::fs::write(
            store.manifest_path(&alice()),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let classifier = FixedClassifier { probabilities: vec![] };
        assert!(matches!(
            store.load(&classifier, &alice()),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let classifier = FixedClassifier { probabilities: vec![] };
        assert!(matches!(
            store.load(&classifier, &alice()),
            Err(StoreError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_load_class_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = FixedModel {
            probabilities: vec![0.2, 0.3, 0.5],
        };
        store.save(&alice(), &model, &classes(), &report()).unwrap();
        let classifier = FixedClassifier { probabilities: vec![] };
        assert!(matches!(
            store.load(&classifier, &alice()),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let model = FixedModel {
            probabilities: vec![0.5, 0.5],
        };
        let bob = UserId::parse("bob").unwrap();
        store.save(&bob, &model, &classes(), &report()).unwrap();
        store.save(&alice(), &model, &classes(), &report()).unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{").unwrap();

        let users: Vec<String> = store.list().unwrap().into_iter().map(|m| m.user_id).collect();
        assert_eq!(users, vec!["alice", "bob"]);

        assert!(store.remove(&alice()).unwrap());
        assert!(!store.remove(&alice()).unwrap());
        assert!(!store.exists(&alice()));
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(file_names(dir.path()).iter().all(|n| !n.starts_with("alice.")));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }
}
