//! Task models and the catalog they are created from.
//!
//! Every task model is built through an async `init(metadata, loader, proxy)`
//! that acquires its sessions, configs and tokenizer, and returns the ready
//! model together with the seconds it took.

mod classification;
mod detection;
mod features;
mod img2img;
mod img2text;
mod loader;
mod registry;
mod segmentation;
mod seq2seq;
mod types;
mod zero_shot;

pub use classification::{ClassificationModel, ClassificationResult, top_classes};
pub use detection::{
    CONFIDENCE_THRESHOLD, Detection, DetectionResult, ObjectDetectionModel, decode_detections,
};
pub use features::{EmbeddingResult, FeatureExtractionModel, mean_pool};
pub use img2img::{Img2ImgModel, Img2ImgResult, planes_to_image};
pub use img2text::Img2TextModel;
pub use loader::{ModelLoader, TokenizerParser};
pub use registry::{AnyModel, LoadedModel, ModelRegistry};
pub use segmentation::{SegmentClass, SegmentationModel, SegmentationResult, class_mask, palette};
pub use seq2seq::{GenerationOptions, Seq2SeqModel};
pub use types::{ClassLabels, ClassPrediction, ModelKind, ModelMetadata, SpecialTokens};
pub use zero_shot::{ZeroShotClassificationModel, ZeroShotResult};
