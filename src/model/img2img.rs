use std::{sync::Arc, time::Instant};

use image::{Rgb, RgbImage};

use crate::{
    error::{Result, SdkError},
    model::{ModelLoader, ModelMetadata},
    preprocess::PreprocessorConfig,
    session::{SessionHandle, resolve_input, resolve_output},
    tensor::{NamedTensors, Tensor, take_f32},
};

#[derive(Debug, Clone)]
pub struct Img2ImgResult {
    pub image: RgbImage,
    pub elapsed: f64,
}

/// Image-to-image model (super resolution, restoration) whose output is a
/// `[1, 3, H, W]` image in the 0..1 range.
pub struct Img2ImgModel {
    metadata: ModelMetadata,
    session: Arc<dyn SessionHandle>,
    preprocessor: PreprocessorConfig,
}

impl Img2ImgModel {
    pub async fn init(
        metadata: ModelMetadata,
        loader: &ModelLoader,
        proxy: bool,
    ) -> Result<(Self, f64)> {
        let start = Instant::now();
        loader.check_memory(&metadata)?;
        let preprocessor = loader.preprocessor(&metadata).await?;
        let session = loader.session(&metadata, "model", proxy).await?;
        Ok((
            Self {
                metadata,
                session,
                preprocessor,
            },
            start.elapsed().as_secs_f64(),
        ))
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub async fn process(&self, image: &RgbImage) -> Result<Img2ImgResult> {
        let start = Instant::now();
        let pixels = self.preprocessor.process(image)?.tensor;

        let input = resolve_input(self.session.as_ref(), "pixel_values").await?;
        let output = resolve_output(self.session.as_ref(), "reconstruction").await?;
        let mut feeds = NamedTensors::new();
        feeds.insert(input, pixels.into());
        let mut outputs = self.session.run(feeds).await?;
        let planes = take_f32(&mut outputs, &output)?;

        Ok(Img2ImgResult {
            image: planes_to_image(&planes)?,
            elapsed: start.elapsed().as_secs_f64(),
        })
    }
}

pub fn planes_to_image(planes: &Tensor<f32>) -> Result<RgbImage> {
    let [1, 3, height, width] = planes.dims()[..] else {
        return Err(SdkError::Shape(format!(
            "expected [1, 3, height, width] output, got {:?}",
            planes.dims()
        )));
    };
    let data = planes.data();
    let plane = height * width;
    let channel = |c: usize, i: usize| (data[c * plane + i].clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([channel(0, i), channel(1, i), channel(2, i)])
    }))
}
