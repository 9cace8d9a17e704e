//! Placement of an assembled blob into hash-sharded storage.
//!
//! The finalizer names the file, works out its extension and mime type,
//! moves it under `ab/cd/<filename>` and, for raster images, renders a
//! thumbnail next to it under `thumbnails/`. The artifact record is written
//! last, so a failure anywhere before leaves it untouched.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat, ImageReader, imageops::FilterType};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use super::engine::Engine;
use super::error::Result;
use super::http::mime_essence;
use super::models::{Artifact, Transfer};
use super::store::Placement;
use crate::util::sanitize_filename;

const OCTET_STREAM: &str = "application/octet-stream";
const FALLBACK_EXTENSION: &str = "bin";
/// Bytes read from the head of a blob for signature sniffing
const SNIFF_LEN: u64 = 64;
const RANDOM_NAME_LEN: usize = 32;

/// Picks the stored extension: explicit hint, then content type, then magic
/// bytes, then the URL path, then `bin`
pub fn detect_extension(
    hint: Option<&str>,
    content_type: Option<&str>,
    head: &[u8],
    url: &str,
) -> String {
    if let Some(hint) = hint.and_then(normalize_extension) {
        return hint;
    }
    if let Some(ext) = content_type
        .and_then(mime_essence)
        .filter(|mime| mime != OCTET_STREAM)
        .and_then(|mime| extension_for_mime(&mime))
    {
        return ext;
    }
    if let Some(ext) = sniff_extension(head) {
        return ext.to_string();
    }
    url_extension(url).unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

fn extension_for_mime(mime: &str) -> Option<String> {
    // mime_guess lists extensions alphabetically, which picks odd ones for common types
    let preferred = match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "audio/mpeg" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "application/pdf" => Some("pdf"),
        "application/zip" => Some("zip"),
        "application/gzip" => Some("gz"),
        "text/plain" => Some("txt"),
        "text/html" => Some("html"),
        "application/json" => Some("json"),
        _ => None,
    };
    preferred
        .or_else(|| mime_guess::get_mime_extensions_str(mime).and_then(|exts| exts.first().copied()))
        .map(str::to_string)
}

/// Recognizes a format from the first bytes of a file
pub fn sniff_extension(head: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(head) {
        if let Some(ext) = format.extensions_str().first() {
            return Some(*ext);
        }
    }

    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "pdf"),
        (b"PK\x03\x04", "zip"),
        (b"\x1f\x8b", "gz"),
        (b"OggS", "ogg"),
        (b"ID3", "mp3"),
        (b"fLaC", "flac"),
    ];
    if let Some((_, ext)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*ext);
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some("mp4");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WAVE" {
        return Some("wav");
    }
    if head.starts_with(b"\x1a\x45\xdf\xa3") {
        // EBML header, the doctype tells WebM from Matroska
        let is_webm = head.windows(4).any(|w| w == b"webm");
        return Some(if is_webm { "webm" } else { "mkv" });
    }
    None
}

/// Extension of the last URL path segment, if it looks like one
fn url_extension(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    (ext.len() <= 5).then(|| normalize_extension(ext)).flatten()
}

/// Mime type to record: the server's content type unless it is missing or
/// generic, else a guess from the extension
pub fn resolve_mime(content_type: Option<&str>, extension: &str) -> String {
    content_type
        .and_then(mime_essence)
        .filter(|mime| mime != OCTET_STREAM)
        .unwrap_or_else(|| {
            mime_guess::from_ext(extension)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
}

fn stem_of(name: &str) -> Option<String> {
    let name = sanitize_filename(name);
    let stem = Path::new(&name).file_stem()?.to_str()?.trim();
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Stored filename: the artifact's own name, else the server's suggestion,
/// else a random name, with the detected extension
pub fn stored_filename(filename: Option<&str>, hint: Option<&str>, extension: &str) -> String {
    let stem = filename
        .and_then(stem_of)
        .or_else(|| hint.and_then(stem_of))
        .unwrap_or_else(|| {
            rand::rng()
                .sample_iter(&Alphanumeric)
                .take(RANDOM_NAME_LEN)
                .map(char::from)
                .collect()
        });
    sanitize_filename(&format!("{stem}.{extension}"))
}

/// Hex digest used for sharding. A valid hex hash on the artifact wins,
/// else the sha256 of the filename.
pub fn shard_hash(hash: Option<&str>, filename: &str) -> String {
    if let Some(hash) = hash {
        let hash = hash.trim().to_ascii_lowercase();
        if hash.len() >= 4 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return hash;
        }
    }
    hex::encode(Sha256::digest(filename.as_bytes()))
}

/// `name-suffix.ext`, for a stored filename already taken by another artifact
pub fn disambiguated(filename: &str, suffix: &str) -> String {
    let suffix = suffix.to_ascii_lowercase();
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{filename}-{suffix}"),
    }
}

/// `ab/cd/<filename>` for hash `abcd...`
pub fn sharded_path(hash: &str, filename: &str) -> String {
    format!("{}/{}/{}", &hash[0..2], &hash[2..4], filename)
}

fn is_thumbnailable(mime: &str) -> bool {
    mime.starts_with("image/")
        && !matches!(
            mime,
            "image/svg+xml" | "image/x-icon" | "image/vnd.microsoft.icon"
        )
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    tokio::fs::File::open(path)
        .await?
        .take(SNIFF_LEN)
        .read_to_end(&mut head)
        .await?;
    Ok(head)
}

/// Decodes an image and re-encodes it no wider than `max_width`. Images
/// with an alpha channel stay PNG, everything else becomes JPEG.
fn render_thumbnail(path: &Path, max_width: u32) -> Result<(Vec<u8>, &'static str)> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let image = if image.width() > max_width {
        image.resize(max_width, u32::MAX, FilterType::Triangle)
    } else {
        image
    };

    let mut out = Cursor::new(Vec::new());
    if image.color().has_alpha() {
        image.write_to(&mut out, ImageFormat::Png)?;
        Ok((out.into_inner(), "png"))
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut out, ImageFormat::Jpeg)?;
        Ok((out.into_inner(), "jpg"))
    }
}

impl Engine {
    /// Moves `blob` into storage and marks the transfer's artifact downloaded
    #[instrument(skip(self, transfer), fields(transfer = %transfer.key))]
    pub async fn finalize(&self, transfer: &Transfer, blob: &Path) -> Result<Artifact> {
        let artifact = Artifact::require(&self.db, &transfer.artifact).await?;
        let size = tokio::fs::metadata(blob).await?.len();
        let head = read_head(blob).await?;

        let extension = detect_extension(
            artifact.extension.as_deref(),
            transfer.content_type.as_deref(),
            &head,
            &transfer.url,
        );
        let mime_type = resolve_mime(transfer.content_type.as_deref(), &extension);
        let mut filename = stored_filename(
            artifact.filename.as_deref(),
            transfer.filename_hint.as_deref(),
            &extension,
        );
        let hash = shard_hash(artifact.hash.as_deref(), &filename);
        let mut rel = sharded_path(&hash, &filename);
        if artifact.path.as_deref() != Some(rel.as_str()) && self.storage.exists(&rel).await {
            filename = disambiguated(&filename, &artifact.key);
            debug!(taken = %rel, filename = %filename, "Stored filename taken, adding the artifact key");
            rel = sharded_path(&hash, &filename);
        }

        let dest = self.storage.move_into(blob, &rel).await?;
        debug!(dest = ?dest, "Blob moved into storage");

        let thumbnail_path = if is_thumbnailable(&mime_type) {
            self.store_thumbnail(dest, &hash, &filename).await
        } else {
            None
        };

        let placement = Placement {
            path: rel,
            filename,
            extension,
            mime_type,
            size,
            thumbnail_path,
        };
        let artifact = Artifact::mark_downloaded(&self.db, &artifact.key, placement).await?;
        info!(
            artifact = %artifact.key,
            path = ?artifact.path,
            mime = ?artifact.mime_type,
            size,
            "Artifact placed"
        );
        Ok(artifact)
    }

    /// Best effort, failures are logged and yield no thumbnail
    async fn store_thumbnail(&self, source: PathBuf, hash: &str, filename: &str) -> Option<String> {
        let width = self.settings.thumbnail_width;
        let rendered = tokio::task::spawn_blocking(move || render_thumbnail(&source, width)).await;
        let (bytes, ext) = match rendered {
            Ok(Ok(rendered)) => rendered,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not generate thumbnail");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Thumbnail task failed");
                return None;
            }
        };

        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        let rel = format!("thumbnails/{}", sharded_path(hash, &format!("{stem}.{ext}")));
        match self.storage.put(&rel, &bytes).await {
            Ok(_) => Some(rel),
            Err(e) => {
                warn!(error = %e, "Could not store thumbnail");
                None
            }
        }
    }
}
