//! Media type derivation for produced artifacts.

use crate::output::MediaKind;

/// Fallback when the artifact kind or extension is not recognized.
pub const OCTET_STREAM: &str = "application/octet-stream";

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi"];

/// Lowercased extension of `filename`, without the dot.
pub fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_video_extension(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Content type to serve an artifact with.
///
/// The declared kind picks the family; the extension picks the subtype.
/// Images and videos with an unknown extension fall back to
/// [`OCTET_STREAM`]. Text is always served as text.
pub fn media_type_for(kind: MediaKind, filename: &str) -> &'static str {
    let ext = extension(filename);
    let ext = ext.as_deref().unwrap_or("");

    match kind {
        MediaKind::Image => match ext {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "bmp" => "image/bmp",
            _ => OCTET_STREAM,
        },
        MediaKind::Video => match ext {
            "mp4" => "video/mp4",
            "webm" => "video/webm",
            "mov" => "video/quicktime",
            "mkv" => "video/x-matroska",
            "avi" => "video/x-msvideo",
            // Animated image containers.
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => OCTET_STREAM,
        },
        MediaKind::Text => match ext {
            "json" => "application/json",
            _ => TEXT_PLAIN,
        },
    }
}
