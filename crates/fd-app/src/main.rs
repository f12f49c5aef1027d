mod error;
mod events;
mod job;
mod orchestrator;
mod remote;
mod settings;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde_json::{Map, Value, json};

use fd_core::{GenerationMode, ImageSize, ModelCatalog, PayloadDraft};

use crate::events::JobOutcome;
use crate::orchestrator::JobOrchestrator;
use crate::remote::{FalClient, image_data_url};
use crate::settings::SettingsStore;
use crate::storage::ImageStore;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let settings = SettingsStore::open("config.json");
    let catalog = ModelCatalog::new();
    debug!("loaded {} settings keys", settings.snapshot().len());

    let api_key = std::env::var("FAL_KEY").ok().or_else(|| {
        match settings.safe_get("api_key", Value::Null) {
            Value::String(key) => Some(key),
            _ => None,
        }
    });
    let Some(api_key) = api_key else {
        anyhow::bail!("no API key: set FAL_KEY or the api_key setting");
    };

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.is_empty() {
        settings.get_str("default_prompt").unwrap_or_default()
    } else {
        settings.set("default_prompt", prompt.clone());
        prompt
    };

    // FLUXDESK_IMAGE switches to image-to-image with that file as source
    let source_image = std::env::var("FLUXDESK_IMAGE").ok().map(PathBuf::from);
    let mode = if source_image.is_some() {
        GenerationMode::ImageToImage
    } else {
        GenerationMode::TextToImage
    };

    let endpoint = settings
        .get_str("default_model")
        .filter(|e| catalog.is_image_to_image(e) == (mode == GenerationMode::ImageToImage))
        .unwrap_or_else(|| {
            catalog.list_by_mode(mode)[0].endpoint.to_string()
        });
    let params = catalog.params(&endpoint);
    info!("using {} ({})", catalog.label_for(&endpoint), endpoint);

    let draft = PayloadDraft {
        prompt,
        negative_prompt: settings.get_str("default_negative_prompt").unwrap_or_default(),
        steps: settings
            .get_u64("default_inference_steps")
            .map(|s| s as u32)
            .unwrap_or(params.default_steps),
        guidance_scale: settings
            .get_f64("default_guidance_scale")
            .unwrap_or(params.default_guidance),
        num_images: settings
            .get_u64("default_num_images")
            .map(|n| n as u32)
            .unwrap_or(1),
        enable_safety_checker: settings
            .get_bool("enable_safety_checker")
            .unwrap_or(params.default_safety),
        seed_text: std::env::var("FLUXDESK_SEED").unwrap_or_default(),
    };

    let payload = match &source_image {
        Some(path) => {
            let url = image_data_url(path)?;
            let strength = settings
                .get_f64("default_strength")
                .unwrap_or(params.default_strength);
            draft
                .image_to_image(Some(&url), strength, &params)
                .map_err(crate::error::AppError::Payload)?
        }
        None => {
            let size = if settings.get_bool("default_use_custom_size").unwrap_or(false) {
                ImageSize::Custom {
                    width: settings.get_u64("default_custom_width").unwrap_or(1024) as u32,
                    height: settings.get_u64("default_custom_height").unwrap_or(768) as u32,
                }
            } else {
                ImageSize::Preset(
                    settings
                        .get_str("default_image_size")
                        .unwrap_or_else(|| "landscape_4_3".into()),
                )
            };
            draft
                .text_to_image(size, &params)
                .map_err(crate::error::AppError::Payload)?
        }
    };

    let remote = Arc::new(FalClient::new(api_key));
    let store = Arc::new(ImageStore::new("generated_images")?);
    info!("saving images to {}", store.output_dir().display());
    let mut orchestrator = JobOrchestrator::new(remote, store);

    let handle = orchestrator.submit(&endpoint, payload)?;
    info!("job {} submitted, waiting...", handle.id);

    let mut remembered = Map::new();
    remembered.insert("last_mode".into(), json!(mode));
    remembered.insert("default_model".into(), json!(endpoint));
    settings.update(remembered);
    settings.safe_set("default_guidance_scale", json!(draft.guidance_scale));

    // FLUXDESK_TIMEOUT (seconds) gives up on slow jobs
    let timeout = std::env::var("FLUXDESK_TIMEOUT")
        .ok()
        .and_then(|t| t.parse::<u64>().ok())
        .map(Duration::from_secs);
    let started = Instant::now();

    let outcome = loop {
        if let Some(outcome) = orchestrator.poll() {
            break Some(outcome);
        }
        if timeout.is_some_and(|limit| started.elapsed() > limit) {
            orchestrator.cancel();
            break None;
        }
        debug!("waiting on {:?}", orchestrator.active().map(|h| h.id));
        std::thread::sleep(Duration::from_millis(100));
    };

    match outcome {
        Some(JobOutcome::Finished {
            job_id,
            images,
            saved_files,
            seed,
        }) => {
            info!("job {} reconciled", job_id);
            match seed {
                Some(seed) => info!("got {} images (seed {})", images.len(), seed),
                None => info!("got {} images", images.len()),
            }
            info!("done, saved: {}", saved_files.join(", "));
        }
        Some(JobOutcome::Failed { job_id, error }) => {
            info!("job {} reconciled", job_id);
            error!("generation failed: {}", error);
        }
        None => {
            error!("job {} timed out and was cancelled", handle.id);
        }
    }

    if let Err(e) = settings.save_now() {
        error!("failed to save settings to {}: {}", settings.path().display(), e);
    }
    Ok(())
}
