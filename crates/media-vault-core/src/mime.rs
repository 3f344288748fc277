use std::path::Path;

use crate::storage::models::MediaKind;

pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/aac",
    "audio/flac",
    "audio/mp4",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
];

const EXTENSIONS: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("webm", "video/webm"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("aac", "audio/aac"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

pub fn is_supported(mime_type: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime_type)
}

pub fn mime_from_file_name(file_name: &str) -> Option<&'static str> {
    let extension = Path::new(file_name)
        .extension()?
        .to_string_lossy()
        .to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
}

pub fn kind_of(mime_type: &str) -> Option<MediaKind> {
    match mime_type.split('/').next()? {
        "video" => Some(MediaKind::Video),
        "audio" => Some(MediaKind::Audio),
        "image" => Some(MediaKind::Image),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_extension_is_case_insensitive() {
        assert_eq!(mime_from_file_name("CLIP.MP4"), Some("video/mp4"));
        assert_eq!(mime_from_file_name("take 2.mov"), Some("video/quicktime"));
        assert_eq!(mime_from_file_name("notes.txt"), None);
        assert_eq!(mime_from_file_name("no_extension"), None);
    }

    #[test]
    fn test_every_mapped_extension_is_supported() {
        for (_, mime) in EXTENSIONS {
            assert!(is_supported(mime), "{} should be supported", mime);
            assert!(kind_of(mime).is_some());
        }
        assert!(!is_supported("application/pdf"));
    }
}
