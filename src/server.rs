use std::{collections::HashMap, convert::Infallible, io::Cursor, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::header,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::{Result, SdkError},
    generation::GeneratedText,
    model::{
        AnyModel, ClassificationResult, DetectionResult, EmbeddingResult, GenerationOptions,
        LoadedModel, ModelKind, ModelLoader, ModelMetadata, ModelRegistry, SegmentClass,
        ZeroShotResult,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub loader: Arc<ModelLoader>,
    pub loaded: Arc<RwLock<HashMap<String, Arc<LoadedModel>>>>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<ModelRegistry>,
        loader: Arc<ModelLoader>,
    ) -> Self {
        Self {
            config,
            registry,
            loader,
            loaded: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn load(&self, id: &str) -> Result<Arc<LoadedModel>> {
        if let Some(model) = self.loaded.read().get(id) {
            return Ok(model.clone());
        }
        let model = self
            .registry
            .create(id, &self.loader, self.config.proxy_sessions)
            .await?;
        let model = Arc::new(model);
        self.loaded.write().insert(id.to_string(), model.clone());
        Ok(model)
    }

    fn model(&self, id: &str) -> Result<Arc<LoadedModel>> {
        self.loaded
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SdkError::ModelNotLoaded(id.to_string()))
    }

    fn generation_options(
        &self,
        max_tokens: Option<usize>,
        max_length: Option<usize>,
    ) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        GenerationOptions {
            max_tokens: max_tokens.or(Some(self.config.max_new_tokens)),
            max_length: max_length.or(defaults.max_length),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/models/loaded", get(loaded_models))
        .route("/models/:id/load", post(load_model))
        .route("/models/:id/generate", post(generate))
        .route("/models/:id/generate/stream", post(generate_stream))
        .route("/models/:id/embed", post(embed))
        .route("/models/:id/classify", post(classify))
        .route("/models/:id/zero-shot", post(zero_shot))
        .route("/models/:id/detect", post(detect))
        .route("/models/:id/segment", post(segment))
        .route("/models/:id/transform", post(transform))
        .route("/models/:id/caption", post(caption))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ListQuery {
    tags: Option<String>,
    #[serde(rename = "type")]
    kind: Option<ModelKind>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<ModelMetadata>> {
    let tags: Vec<&str> = query
        .tags
        .as_deref()
        .map(|raw| raw.split(',').map(str::trim).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    let models = state
        .registry
        .list(&tags, query.kind)
        .into_iter()
        .cloned()
        .collect();
    Json(models)
}

#[derive(Serialize)]
struct LoadedEntry {
    id: String,
    kind: ModelKind,
    load_seconds: f64,
}

async fn loaded_models(State(state): State<AppState>) -> Json<Vec<LoadedEntry>> {
    let mut entries: Vec<LoadedEntry> = state
        .loaded
        .read()
        .iter()
        .map(|(id, loaded)| LoadedEntry {
            id: id.clone(),
            kind: loaded.model.kind(),
            load_seconds: loaded.elapsed,
        })
        .collect();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(entries)
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LoadedEntry>> {
    let loaded = state.load(&id).await?;
    Ok(Json(LoadedEntry {
        id,
        kind: loaded.model.kind(),
        load_seconds: loaded.elapsed,
    }))
}

fn wrong_kind(id: &str, model: &AnyModel, route: &str) -> SdkError {
    SdkError::BadRequest(format!(
        "model {id} is a {:?} model and does not serve {route}",
        model.kind()
    ))
}

#[derive(Deserialize)]
struct GenerateRequest {
    inputs: Vec<String>,
    prefix: Option<String>,
    max_tokens: Option<usize>,
    max_length: Option<usize>,
}

async fn generate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GeneratedText>> {
    let loaded = state.model(&id)?;
    let AnyModel::Seq2Seq(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "generate"));
    };
    let options = state.generation_options(request.max_tokens, request.max_length);
    let generated = model
        .process(&request.inputs, request.prefix.as_deref(), options)
        .await?;
    Ok(Json(generated))
}

async fn generate_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let loaded = state.model(&id)?;
    let AnyModel::Seq2Seq(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "generate/stream"));
    };
    let options = state.generation_options(request.max_tokens, request.max_length);
    let deltas = model.process_stream(&request.inputs, request.prefix.as_deref(), options);

    let events = deltas
        .map(|step| {
            Ok::<_, Infallible>(match step {
                Ok(deltas) => Event::default()
                    .event("delta")
                    .data(serde_json::to_string(&deltas).unwrap_or_default()),
                Err(err) => {
                    warn!(error = %err, "generation stream failed");
                    Event::default().event("error").data(err.to_string())
                }
            })
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().event("done").data("[DONE]"))
        }));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct EmbedRequest {
    inputs: Vec<String>,
}

async fn embed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbeddingResult>> {
    let loaded = state.model(&id)?;
    let AnyModel::FeatureExtraction(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "embed"));
    };
    Ok(Json(model.process(&request.inputs).await?))
}

fn decode_image(body: &[u8]) -> Result<RgbImage> {
    if body.is_empty() {
        return Err(SdkError::BadRequest("request body must be an encoded image".into()));
    }
    Ok(image::load_from_memory(body)?.to_rgb8())
}

#[derive(Deserialize)]
struct ClassifyQuery {
    top: Option<usize>,
}

async fn classify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ClassifyQuery>,
    body: Bytes,
) -> Result<Json<ClassificationResult>> {
    let loaded = state.model(&id)?;
    let AnyModel::Classification(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "classify"));
    };
    let image = decode_image(&body)?;
    Ok(Json(model.process(&image, query.top.unwrap_or(5)).await?))
}

#[derive(Deserialize)]
struct ZeroShotQuery {
    classes: String,
}

async fn zero_shot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ZeroShotQuery>,
    body: Bytes,
) -> Result<Json<ZeroShotResult>> {
    let loaded = state.model(&id)?;
    let AnyModel::ZeroShotClassification(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "zero-shot"));
    };
    let classes: Vec<String> = query
        .classes
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let image = decode_image(&body)?;
    Ok(Json(model.process(&image, &classes).await?))
}

async fn detect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DetectionResult>> {
    let loaded = state.model(&id)?;
    let AnyModel::ObjectDetection(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "detect"));
    };
    let image = decode_image(&body)?;
    Ok(Json(model.process(&image).await?))
}

#[derive(Serialize)]
struct SegmentResponse {
    width: usize,
    height: usize,
    mask: Vec<i64>,
    classes: Vec<SegmentClass>,
    elapsed: f64,
}

async fn segment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SegmentResponse>> {
    let loaded = state.model(&id)?;
    let AnyModel::Segmentation(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "segment"));
    };
    let image = decode_image(&body)?;
    let result = model.process(&image).await?;
    let (height, width) = (result.mask.dims()[0], result.mask.dims()[1]);
    Ok(Json(SegmentResponse {
        width,
        height,
        mask: result.mask.into_data(),
        classes: result.classes,
        elapsed: result.elapsed,
    }))
}

async fn transform(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let loaded = state.model(&id)?;
    let AnyModel::Img2Img(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "transform"));
    };
    let image = decode_image(&body)?;
    let result = model.process(&image).await?;
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(result.image).write_to(&mut png, ImageFormat::Png)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png.into_inner()).into_response())
}

#[derive(Deserialize)]
struct CaptionQuery {
    prefix: Option<String>,
    max_tokens: Option<usize>,
}

async fn caption(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CaptionQuery>,
    body: Bytes,
) -> Result<Json<GeneratedText>> {
    let loaded = state.model(&id)?;
    let AnyModel::Img2Text(model) = &loaded.model else {
        return Err(wrong_kind(&id, &loaded.model, "caption"));
    };
    let image = decode_image(&body)?;
    let options = state.generation_options(query.max_tokens, None);
    let generated = model
        .process(std::slice::from_ref(&image), query.prefix.as_deref(), options)
        .await?;
    info!(model = %id, elapsed_s = generated.elapsed, "caption generated");
    Ok(Json(generated))
}
