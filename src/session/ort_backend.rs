//! ONNX Runtime executor backend.

use std::borrow::Cow;

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
};
use ort::session::{Session as OrtSession, SessionInputValue, builder::GraphOptimizationLevel as OrtLevel};
use ort::value::Tensor as OrtTensor;
use tracing::{info, warn};

use super::{ExecutionMode, Executor, ExecutorFactory, ExecutorOptions, GraphOptimizationLevel};
use crate::error::{Result, SdkError};
use crate::tensor::{NamedTensors, Tensor, TensorValue};

fn ort_err(e: ort::Error) -> SdkError {
    SdkError::Inference(e.to_string())
}

pub struct OrtExecutorFactory;

/// Providers that fail to register at runtime fall back to cpu inside ort.
fn execution_provider(name: &str) -> Option<ExecutionProviderDispatch> {
    let provider = match name.trim().to_ascii_lowercase().as_str() {
        "cuda" => CUDAExecutionProvider::default().build(),
        "tensorrt" => TensorRTExecutionProvider::default().build(),
        "directml" => DirectMLExecutionProvider::default().build(),
        "coreml" => CoreMLExecutionProvider::default().build(),
        "cpu" => CPUExecutionProvider::default().build(),
        _ => return None,
    };
    Some(provider)
}

impl ExecutorFactory for OrtExecutorFactory {
    fn create(&self, model_bytes: Vec<u8>, options: &ExecutorOptions) -> Result<Box<dyn Executor>> {
        let level = match options.graph_optimization_level {
            GraphOptimizationLevel::All => OrtLevel::Level3,
        };
        let parallel = match options.execution_mode {
            ExecutionMode::Parallel => true,
        };
        let providers: Vec<ExecutionProviderDispatch> = options
            .execution_providers
            .iter()
            .filter_map(|name| {
                let provider = execution_provider(name);
                if provider.is_none() {
                    warn!(provider = %name, "unknown execution provider, skipping");
                }
                provider
            })
            .collect();

        let session = OrtSession::builder()
            .map_err(ort_err)?
            .with_execution_providers(providers)
            .map_err(ort_err)?
            .with_optimization_level(level)
            .map_err(ort_err)?
            .with_intra_threads(options.intra_op_threads)
            .map_err(ort_err)?
            .with_parallel_execution(parallel)
            .map_err(ort_err)?
            .commit_from_memory(&model_bytes)
            .map_err(ort_err)?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!(outputs = ?output_names, "onnx session created");

        Ok(Box::new(OrtExecutor {
            session,
            input_names,
            output_names,
        }))
    }
}

pub struct OrtExecutor {
    session: OrtSession,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

fn to_dims(dims: &[usize]) -> Vec<i64> {
    dims.iter().map(|&d| d as i64).collect()
}

fn from_dims(dims: &[i64]) -> Vec<usize> {
    dims.iter().map(|&d| d.max(0) as usize).collect()
}

impl Executor for OrtExecutor {
    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let mut feeds: Vec<(Cow<'static, str>, SessionInputValue<'static>)> =
            Vec::with_capacity(inputs.len());
        for (name, value) in inputs {
            let value: SessionInputValue<'static> = match value {
                TensorValue::Float32(t) => {
                    let dims = to_dims(t.dims());
                    OrtTensor::from_array((dims, t.into_data())).map_err(ort_err)?.into()
                }
                TensorValue::Int64(t) => {
                    let dims = to_dims(t.dims());
                    OrtTensor::from_array((dims, t.into_data())).map_err(ort_err)?.into()
                }
            };
            feeds.push((Cow::Owned(name), value));
        }

        let outputs = self.session.run(feeds).map_err(ort_err)?;
        let mut named = NamedTensors::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let Some(value) = outputs.get(name.as_str()) else {
                continue;
            };
            let tensor = if let Ok((dims, data)) = value.try_extract_raw_tensor::<f32>() {
                TensorValue::Float32(Tensor::new(from_dims(&dims), data.to_vec())?)
            } else {
                let (dims, data) = value.try_extract_raw_tensor::<i64>().map_err(ort_err)?;
                TensorValue::Int64(Tensor::new(from_dims(&dims), data.to_vec())?)
            };
            named.insert(name.clone(), tensor);
        }
        Ok(named)
    }

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }
}
