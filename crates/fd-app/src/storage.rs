use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Local;
use log::info;

use fd_core::GenerationMode;

use crate::error::AppError;

/// Local directory that receives generated images under deterministic
/// filenames.
pub struct ImageStore {
    output_dir: PathBuf,
}

impl ImageStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `{txt2img|img2img}_{timestamp}_{index+1}.png`
    pub fn generation_filename(&self, mode: GenerationMode, index: usize) -> String {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        format!("{}_{}_{}.png", mode.file_prefix(), timestamp, index + 1)
    }

    /// Download one result image and write it into the output directory as
    /// PNG. The service normally returns https URLs but may inline small
    /// results as data URLs.
    pub fn save_from_url(&self, url: &str, filename: &str) -> Result<PathBuf, AppError> {
        let bytes = fetch_image_bytes(url)?;

        let image = image::load_from_memory(&bytes)
            .map_err(|e| AppError::MalformedResponse(format!("undecodable image: {}", e)))?;

        let path = self.output_dir.join(filename);
        image
            .save(&path)
            .map_err(|e| AppError::Persistence(std::io::Error::other(e)))?;

        info!("saved {}", path.display());
        Ok(path)
    }
}

fn fetch_image_bytes(url: &str) -> Result<Vec<u8>, AppError> {
    if let Some(rest) = url.strip_prefix("data:") {
        let encoded = rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| AppError::MalformedResponse("unsupported data url".into()))?;
        return BASE64
            .decode(encoded)
            .map_err(|e| AppError::MalformedResponse(format!("bad data url: {}", e)));
    }

    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| AppError::Remote(e.to_string()))?;
    let bytes = response.bytes().map_err(|e| AppError::Remote(e.to_string()))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png_data_url() -> String {
        let mut bytes = Vec::new();
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([255, 0, 0, 255]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        format!("data:image/png;base64,{}", BASE64.encode(bytes))
    }

    #[test]
    fn filename_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        let name = store.generation_filename(GenerationMode::TextToImage, 0);
        assert!(name.starts_with("txt2img_"));
        assert!(name.ends_with("_1.png"));

        let name = store.generation_filename(GenerationMode::ImageToImage, 2);
        assert!(name.starts_with("img2img_"));
        assert!(name.ends_with("_3.png"));
    }

    #[test]
    fn saves_data_url_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        let path = store
            .save_from_url(&tiny_png_data_url(), "txt2img_test_1.png")
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn garbage_data_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        let err = store
            .save_from_url("data:image/png;base64,!!!", "x.png")
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedResponse(_)));
    }
}
