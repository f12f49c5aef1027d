use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::EndpointParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
}

impl GenerationMode {
    /// Prefix used for saved-image filenames.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Self::TextToImage => "txt2img",
            Self::ImageToImage => "img2img",
        }
    }

    pub fn all() -> [GenerationMode; 2] {
        [Self::TextToImage, Self::ImageToImage]
    }
}

impl Default for GenerationMode {
    fn default() -> Self {
        Self::TextToImage
    }
}

/// Output size for text-to-image requests. Serialized as either a preset
/// name string or a `{width, height}` object, matching the service API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Preset(String),
    Custom { width: u32, height: u32 },
}

impl ImageSize {
    pub const PRESETS: [&'static str; 5] = [
        "square_hd",
        "landscape_4_3",
        "landscape_16_9",
        "portrait_4_3",
        "portrait_16_9",
    ];
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::Preset("landscape_4_3".into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("image-to-image requires a source image")]
    MissingImageSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextToImagePayload {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub num_images: u32,
    pub enable_safety_checker: bool,
    pub image_size: ImageSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageToImagePayload {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub image_url: String,
    pub strength: f64,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub num_images: u32,
    pub enable_safety_checker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// A validated request body. The two variants carry disjoint field sets, so
/// a text-to-image request can never leak `strength` or `image_url` and an
/// image-to-image request can never leak `image_size`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    TextToImage(TextToImagePayload),
    ImageToImage(ImageToImagePayload),
}

impl Payload {
    pub fn mode(&self) -> GenerationMode {
        match self {
            Self::TextToImage(_) => GenerationMode::TextToImage,
            Self::ImageToImage(_) => GenerationMode::ImageToImage,
        }
    }

    pub fn num_images(&self) -> u32 {
        match self {
            Self::TextToImage(p) => p.num_images,
            Self::ImageToImage(p) => p.num_images,
        }
    }
}

/// Raw, unvalidated request fields as they come off the UI controls.
#[derive(Debug, Clone, Default)]
pub struct PayloadDraft {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance_scale: f64,
    pub num_images: u32,
    pub enable_safety_checker: bool,
    /// Seed as entered, possibly empty or garbage. Unparsable text is
    /// dropped rather than failing the request.
    pub seed_text: String,
}

impl PayloadDraft {
    pub fn text_to_image(
        &self,
        size: ImageSize,
        params: &EndpointParams,
    ) -> Result<Payload, PayloadError> {
        let (prompt, negative_prompt) = self.prompts()?;

        Ok(Payload::TextToImage(TextToImagePayload {
            prompt,
            negative_prompt,
            num_inference_steps: self.steps.clamp(1, params.max_steps),
            guidance_scale: self.guidance_scale,
            num_images: self.num_images.clamp(1, 4),
            enable_safety_checker: self.enable_safety_checker,
            image_size: size,
            seed: parse_seed(&self.seed_text),
        }))
    }

    pub fn image_to_image(
        &self,
        image_url: Option<&str>,
        strength: f64,
        params: &EndpointParams,
    ) -> Result<Payload, PayloadError> {
        let (prompt, negative_prompt) = self.prompts()?;

        let image_url = match image_url {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(PayloadError::MissingImageSource),
        };

        let strength = if strength.is_finite() && strength > 0.0 {
            strength.min(1.0)
        } else {
            params.default_strength
        };

        Ok(Payload::ImageToImage(ImageToImagePayload {
            prompt,
            negative_prompt,
            image_url,
            strength,
            num_inference_steps: self.steps.clamp(1, params.max_steps),
            guidance_scale: self.guidance_scale,
            num_images: self.num_images.clamp(1, 4),
            enable_safety_checker: self.enable_safety_checker,
            seed: parse_seed(&self.seed_text),
        }))
    }

    fn prompts(&self) -> Result<(String, Option<String>), PayloadError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(PayloadError::EmptyPrompt);
        }

        // An empty negative prompt is represented by omitting the field,
        // not by sending an empty string.
        let negative = self.negative_prompt.trim();
        let negative = (!negative.is_empty()).then(|| negative.to_string());

        Ok((prompt.to_string(), negative))
    }
}

fn parse_seed(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}
