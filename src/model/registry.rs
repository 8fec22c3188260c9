use std::{path::Path, time::Instant};

use tracing::info;

use crate::{
    error::{Result, SdkError},
    model::{
        ClassificationModel, FeatureExtractionModel, Img2ImgModel, Img2TextModel, ModelKind,
        ModelLoader, ModelMetadata, ObjectDetectionModel, SegmentationModel, Seq2SeqModel,
        ZeroShotClassificationModel,
    },
};

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelMetadata>,
}

/// A task model of any kind, resolved once at creation.
pub enum AnyModel {
    Classification(ClassificationModel),
    Segmentation(SegmentationModel),
    ObjectDetection(ObjectDetectionModel),
    Img2Img(Img2ImgModel),
    FeatureExtraction(FeatureExtractionModel),
    Seq2Seq(Seq2SeqModel),
    Img2Text(Img2TextModel),
    ZeroShotClassification(ZeroShotClassificationModel),
}

impl AnyModel {
    pub fn metadata(&self) -> &ModelMetadata {
        match self {
            AnyModel::Classification(m) => m.metadata(),
            AnyModel::Segmentation(m) => m.metadata(),
            AnyModel::ObjectDetection(m) => m.metadata(),
            AnyModel::Img2Img(m) => m.metadata(),
            AnyModel::FeatureExtraction(m) => m.metadata(),
            AnyModel::Seq2Seq(m) => m.metadata(),
            AnyModel::Img2Text(m) => m.metadata(),
            AnyModel::ZeroShotClassification(m) => m.metadata(),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.metadata().kind
    }
}

pub struct LoadedModel {
    pub model: AnyModel,
    pub elapsed: f64,
}

impl ModelRegistry {
    pub fn new(models: Vec<ModelMetadata>) -> Result<Self> {
        for (i, model) in models.iter().enumerate() {
            if models[..i].iter().any(|m| m.id == model.id) {
                return Err(SdkError::Config(format!("duplicate model id {}", model.id)));
            }
        }
        Ok(Self { models })
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Self::new(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_json_str(&raw)?;
        info!(path = %path.as_ref().display(), models = registry.models.len(), "model catalog loaded");
        Ok(registry)
    }

    pub fn all(&self) -> &[ModelMetadata] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&ModelMetadata> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Models carrying every one of `tags` and, when given, of exactly `kind`.
    pub fn list(&self, tags: &[&str], kind: Option<ModelKind>) -> Vec<&ModelMetadata> {
        self.models
            .iter()
            .filter(|m| m.has_tags(tags))
            .filter(|m| kind.is_none_or(|k| m.kind == k))
            .collect()
    }

    /// Builds and initialises the task model registered under `id`.
    pub async fn create(&self, id: &str, loader: &ModelLoader, proxy: bool) -> Result<LoadedModel> {
        let metadata = self
            .get(id)
            .cloned()
            .ok_or_else(|| SdkError::Config(format!("unknown model id {id}")))?;
        let start = Instant::now();
        let model = match metadata.kind {
            ModelKind::Classification => {
                AnyModel::Classification(ClassificationModel::init(metadata, loader, proxy).await?.0)
            }
            ModelKind::Segmentation => {
                AnyModel::Segmentation(SegmentationModel::init(metadata, loader, proxy).await?.0)
            }
            ModelKind::ObjectDetection => AnyModel::ObjectDetection(
                ObjectDetectionModel::init(metadata, loader, proxy).await?.0,
            ),
            ModelKind::Img2Img => {
                AnyModel::Img2Img(Img2ImgModel::init(metadata, loader, proxy).await?.0)
            }
            ModelKind::FeatureExtraction => AnyModel::FeatureExtraction(
                FeatureExtractionModel::init(metadata, loader, proxy).await?.0,
            ),
            ModelKind::Seq2Seq => {
                AnyModel::Seq2Seq(Seq2SeqModel::init(metadata, loader, proxy).await?.0)
            }
            ModelKind::Img2Text => {
                AnyModel::Img2Text(Img2TextModel::init(metadata, loader, proxy).await?.0)
            }
            ModelKind::ZeroShotClassification => AnyModel::ZeroShotClassification(
                ZeroShotClassificationModel::init(metadata, loader, proxy).await?.0,
            ),
        };
        let elapsed = start.elapsed().as_secs_f64();
        info!(model = id, kind = ?model.kind(), elapsed_s = elapsed, "model ready");
        Ok(LoadedModel { model, elapsed })
    }
}
