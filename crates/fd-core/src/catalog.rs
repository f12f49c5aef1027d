use crate::payload::GenerationMode;

/// Numeric constraints for one hosted endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointParams {
    pub max_steps: u32,
    pub default_steps: u32,
    pub default_guidance: f64,
    pub default_strength: f64,
    pub default_safety: bool,
}

/// Conservative fallback for endpoints the catalog does not know about.
/// The hosted service grows models faster than this table does, so an
/// unknown id is survivable, not fatal.
pub const FALLBACK_PARAMS: EndpointParams = EndpointParams {
    max_steps: 50,
    default_steps: 28,
    default_guidance: 3.5,
    default_strength: 0.95,
    default_safety: true,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelEntry {
    pub label: &'static str,
    pub endpoint: &'static str,
    pub mode: GenerationMode,
    pub params: EndpointParams,
}

const fn entry(
    label: &'static str,
    endpoint: &'static str,
    mode: GenerationMode,
    max_steps: u32,
    default_steps: u32,
    default_guidance: f64,
    default_strength: f64,
) -> ModelEntry {
    ModelEntry {
        label,
        endpoint,
        mode,
        params: EndpointParams {
            max_steps,
            default_steps,
            default_guidance,
            default_strength,
            default_safety: true,
        },
    }
}

// Declaration order is the order the UI shows models in. Keep it stable.
const ENTRIES: &[ModelEntry] = &[
    // text-to-image
    entry("FLUX.1 [dev] - balanced quality", "fal-ai/flux/dev", GenerationMode::TextToImage, 28, 28, 3.5, 0.95),
    entry("FLUX.1 [schnell] - fast generation", "fal-ai/flux/schnell", GenerationMode::TextToImage, 4, 4, 3.5, 0.95),
    entry("FLUX.1 Pro v1.1 - highest quality", "fal-ai/flux-pro/v1.1", GenerationMode::TextToImage, 25, 25, 3.5, 0.95),
    entry("FLUX.1 Pro Ultra - up to 2K", "fal-ai/flux-pro/v1.1-ultra", GenerationMode::TextToImage, 25, 25, 3.5, 0.95),
    entry("Recraft V3 - vector art", "fal-ai/recraft-v3", GenerationMode::TextToImage, 12, 12, 7.5, 0.95),
    entry("Stable Diffusion 3.5 Large - general purpose", "fal-ai/stable-diffusion-v35-large", GenerationMode::TextToImage, 50, 28, 7.5, 0.95),
    entry("Ideogram V3 - typography", "fal-ai/ideogram/v3", GenerationMode::TextToImage, 12, 12, 7.5, 0.95),
    entry("FLUX with LoRA - customization", "fal-ai/flux-lora", GenerationMode::TextToImage, 28, 28, 3.5, 0.95),
    entry("Fast SDXL - fast SDXL", "fal-ai/fast-sdxl", GenerationMode::TextToImage, 8, 5, 2.0, 0.95),
    entry("Qwen Image - text rendering", "fal-ai/qwen-image", GenerationMode::TextToImage, 20, 20, 7.5, 0.95),
    // image-to-image
    entry("FLUX.1 [dev] - quality transform", "fal-ai/flux/dev/image-to-image", GenerationMode::ImageToImage, 40, 40, 3.5, 0.95),
    entry("FLUX.1 [schnell] Redux - fast transform", "fal-ai/flux/schnell/image-to-image", GenerationMode::ImageToImage, 4, 4, 3.5, 0.95),
    entry("FLUX.1 Kontext [pro] - advanced editing", "fal-ai/flux-pro/kontext", GenerationMode::ImageToImage, 25, 25, 3.5, 0.8),
    entry("FLUX with LoRA - custom transform", "fal-ai/flux-lora/image-to-image", GenerationMode::ImageToImage, 28, 28, 3.5, 0.95),
    entry("Fast SDXL - fast SDXL transform", "fal-ai/fast-sdxl/image-to-image", GenerationMode::ImageToImage, 25, 25, 7.5, 0.95),
    entry("PhotoMaker - portrait photos", "fal-ai/photomaker", GenerationMode::ImageToImage, 50, 50, 5.0, 1.0),
];

/// Read-only catalog of the hosted generation models, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: &'static [ModelEntry],
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self { entries: ENTRIES }
    }

    /// Constraints for an endpoint. Unknown ids get [`FALLBACK_PARAMS`],
    /// never an error.
    pub fn params(&self, endpoint: &str) -> EndpointParams {
        self.entries
            .iter()
            .find(|e| e.endpoint == endpoint)
            .map(|e| e.params)
            .unwrap_or(FALLBACK_PARAMS)
    }

    /// Models for one mode, in declaration order.
    pub fn list_by_mode(&self, mode: GenerationMode) -> Vec<&'static ModelEntry> {
        self.entries.iter().filter(|e| e.mode == mode).collect()
    }

    /// Display label for an endpoint, falling back to the first catalog entry.
    pub fn label_for(&self, endpoint: &str) -> &'static str {
        self.entries
            .iter()
            .find(|e| e.endpoint == endpoint)
            .map(|e| e.label)
            .unwrap_or(self.entries[0].label)
    }

    /// Endpoint id for a display label, falling back to the default model.
    pub fn endpoint_for(&self, label: &str) -> &'static str {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| e.endpoint)
            .unwrap_or(Self::default_endpoint())
    }

    pub fn is_image_to_image(&self, endpoint: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.endpoint == endpoint && e.mode == GenerationMode::ImageToImage)
    }

    pub const fn default_endpoint() -> &'static str {
        "fal-ai/flux/dev"
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}
