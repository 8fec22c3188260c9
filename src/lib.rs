pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod model;
pub mod preprocess;
pub mod server;
pub mod session;
pub mod tensor;
pub mod tokenizer;

pub use config::{AppConfig, EvictionPolicy, SessionParameters};
pub use error::{Result, SdkError};
pub use model::{AnyModel, LoadedModel, ModelKind, ModelLoader, ModelMetadata, ModelRegistry};
pub use server::{AppState, build_router};
pub use session::{SessionController, SessionHandle};
