use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Classification,
    Segmentation,
    ObjectDetection,
    #[serde(rename = "img2img")]
    Img2Img,
    FeatureExtraction,
    #[serde(rename = "seq2seq")]
    Seq2Seq,
    #[serde(rename = "img2text")]
    Img2Text,
    ZeroShotClassification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    #[serde(default)]
    pub pad_token_id: i64,
    #[serde(default)]
    pub bos_token_id: i64,
    #[serde(default = "default_eos")]
    pub eos_token_id: i64,
}

fn default_eos() -> i64 {
    1
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad_token_id: 0,
            bos_token_id: 0,
            eos_token_id: default_eos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    #[serde(default)]
    pub description: String,
    pub memory_mb: u64,
    pub model_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub preprocessor_path: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub tokenizer_path: Option<String>,
    #[serde(default)]
    pub special_tokens: Option<SpecialTokens>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ModelMetadata {
    /// Path of a named artifact (`"model"`, `"encoder"`, `"decoder"`, `"dense"`).
    pub fn artifact(&self, name: &str) -> Result<&str> {
        self.model_paths.get(name).map(String::as_str).ok_or_else(|| {
            SdkError::Config(format!("model {} has no {name} artifact path", self.id))
        })
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.model_paths.contains_key(name)
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens.unwrap_or_default()
    }

    pub fn has_tags(&self, tags: &[&str]) -> bool {
        tags.iter().all(|tag| self.tags.iter().any(|t| t == tag))
    }
}

/// Class names indexed by class id, read from a model `config.json`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassLabels {
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct LabelConfig {
    id2label: HashMap<String, String>,
}

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn from_config_json(bytes: &[u8]) -> Result<Self> {
        let config: LabelConfig = serde_json::from_slice(bytes)?;
        let mut indexed = Vec::with_capacity(config.id2label.len());
        for (id, label) in config.id2label {
            let id: usize = id
                .parse()
                .map_err(|_| SdkError::Config(format!("id2label key `{id}` is not an index")))?;
            indexed.push((id, label));
        }
        let len = indexed.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
        let mut labels: Vec<String> = (0..len).map(|i| format!("class_{i}")).collect();
        for (id, label) in indexed {
            labels[id] = label;
        }
        Ok(Self { labels })
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.labels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassPrediction {
    pub class: usize,
    pub label: String,
    pub confidence: f32,
}
