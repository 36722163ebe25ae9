//! Attachment handling: download, attach when small enough, recompress
//! oversized images, and fall back to a link line for everything else.

use std::io::Cursor;
use std::time::Duration;

use image::ImageOutputFormat;
use log::{info, warn};

use crate::http::webhook::WebhookFile;

/// Discord's effective upload cap for bot webhooks (7.5 MB).
pub const MAX_UPLOAD_BYTES: usize = 7_500_000;

const JPEG_QUALITY_START: u8 = 85;
const JPEG_QUALITY_STEP: u8 = 15;
const JPEG_QUALITY_MIN: u8 = 10;
const RESIZE_START: u32 = 2048;
const MAX_COMPRESSION_ATTEMPTS: u32 = 8;

/// What became of one attachment url.
pub enum FetchedAttachment {
    File(WebhookFile),
    /// too large and not compressible: surface the link instead
    TooLarge(String),
}

pub struct AttachmentFetcher {
    client: reqwest::Client,
}

impl AttachmentFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Unable to build client!");
        Self { client }
    }

    /// Download one attachment and size it for upload. Download failures
    /// degrade to the link fallback rather than dropping the message.
    pub async fn fetch(&self, url: &str) -> FetchedAttachment {
        let bytes = match self.download(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("attachment download failed ({url}): {e}");
                return FetchedAttachment::TooLarge(url.to_string());
            }
        };
        let filename = filename_from_url(url);

        if bytes.len() <= MAX_UPLOAD_BYTES {
            return FetchedAttachment::File(WebhookFile { filename, bytes });
        }

        if !is_supported_image(&filename) {
            return FetchedAttachment::TooLarge(url.to_string());
        }

        info!("recompressing oversized image {filename} ({} bytes)", bytes.len());
        let url = url.to_string();
        let compressed = tokio::task::spawn_blocking(move || compress_image(&bytes)).await;
        match compressed {
            Ok(Some(bytes)) => FetchedAttachment::File(WebhookFile {
                filename: jpeg_filename(&filename),
                bytes,
            }),
            Ok(None) => FetchedAttachment::TooLarge(url),
            Err(e) => {
                warn!("compression task failed: {e}");
                FetchedAttachment::TooLarge(url)
            }
        }
    }

    async fn download(&self, url: &str) -> reqwest::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl Default for AttachmentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn filename_from_url(url: &str) -> String {
    url.split('/').last()
        .and_then(|last| last.split('?').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

fn is_supported_image(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    ["png", "jpg", "jpeg", "webp", "bmp"].iter().any(|ext| lower.ends_with(&format!(".{ext}")))
}

fn jpeg_filename(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.jpg"),
        None => format!("{filename}.jpg"),
    }
}

/// The quality/size ladder walked while compressing: quality drops first,
/// then the image is halved and the quality ladder restarts, up to the
/// attempt cap.
pub fn compression_plan() -> Vec<(u32, u8)> {
    let mut plan = Vec::new();
    let mut max_dimension = RESIZE_START;
    let mut quality = JPEG_QUALITY_START;
    for _ in 0..MAX_COMPRESSION_ATTEMPTS {
        plan.push((max_dimension, quality));
        if quality > JPEG_QUALITY_MIN + JPEG_QUALITY_STEP {
            quality -= JPEG_QUALITY_STEP;
        } else if quality > JPEG_QUALITY_MIN {
            quality = JPEG_QUALITY_MIN;
        } else {
            max_dimension /= 2;
            quality = JPEG_QUALITY_START;
        }
    }
    plan
}

/// Re-encode as JPEG, walking the plan until the output fits. `None` when no
/// step fits within the attempt budget.
fn compress_image(bytes: &[u8]) -> Option<Vec<u8>> {
    let image = image::load_from_memory(bytes).ok()?;
    for (max_dimension, quality) in compression_plan() {
        let resized = if image.width().max(image.height()) > max_dimension {
            image.resize(max_dimension, max_dimension, image::imageops::FilterType::Triangle)
        } else {
            image.clone()
        };
        let mut out = Cursor::new(Vec::new());
        if resized.to_rgb8()
            .write_to(&mut out, ImageOutputFormat::Jpeg(quality))
            .is_err()
        {
            continue;
        }
        let out = out.into_inner();
        if out.len() <= MAX_UPLOAD_BYTES {
            info!("compressed image to {} bytes (max dim {max_dimension}, quality {quality})", out.len());
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_come_from_the_url_path() {
        assert_eq!(filename_from_url("https://cdn.example/a/b/pic.png?ex=1"), "pic.png");
        assert_eq!(filename_from_url("https://cdn.example/"), "attachment");
    }

    #[test]
    fn supported_images() {
        assert!(is_supported_image("pic.PNG"));
        assert!(is_supported_image("pic.jpeg"));
        assert!(!is_supported_image("clip.mp4"));
        assert!(!is_supported_image("archive.zip"));
    }

    #[test]
    fn jpeg_filename_swaps_extension() {
        assert_eq!(jpeg_filename("pic.png"), "pic.jpg");
        assert_eq!(jpeg_filename("noext"), "noext.jpg");
    }

    #[test]
    fn plan_starts_high_quality_and_is_bounded() {
        let plan = compression_plan();
        assert_eq!(plan.len(), MAX_COMPRESSION_ATTEMPTS as usize);
        assert_eq!(plan[0], (2048, 85));
        // quality descends before any resize happens
        assert_eq!(plan[1], (2048, 70));
        assert!(plan.iter().all(|&(_, q)| q >= JPEG_QUALITY_MIN));
        // the ladder eventually halves the dimension
        assert!(plan.iter().any(|&(d, _)| d < RESIZE_START));
    }
}
