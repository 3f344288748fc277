use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use super::decoder::{MediaDecoder, ProbeReport};
use super::{ExtractRequest, Extraction, Thumbnail};
use crate::error::{Error, Result};
use crate::storage::models::{MediaKind, MediaProperties};

/// Preferred position of the thumbnail frame, in seconds.
pub const THUMBNAIL_TIME: f64 = 1.0;
/// Distance kept from the end of the stream when clamping the frame position.
pub const END_MARGIN: f64 = 0.1;

/// Audio codecs the playback engine cannot decode.
pub const UNSUPPORTED_AUDIO_CODECS: &[&str] = &[
    "ac3", "eac3", "dts", "truehd", "mlp", "pcm_bluray", "pcm_dvd", "cook", "wmav1",
    "wmav2", "wmapro", "ra_144", "ra_288", "atrac3", "qdm2", "amr_nb", "amr_wb",
];

pub fn is_audio_codec_supported(codec: Option<&str>) -> bool {
    match codec {
        Some(codec) => !UNSUPPORTED_AUDIO_CODECS.contains(&codec.to_ascii_lowercase().as_str()),
        None => true,
    }
}

/// Frame rate from packet timestamps: sorted, de-duplicated, averaged over the window.
pub fn estimate_fps(pts: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = pts.iter().copied().filter(|t| t.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    if sorted.len() < 2 {
        return None;
    }
    let span = sorted[sorted.len() - 1] - sorted[0];
    if span <= 0.0 {
        return None;
    }
    let fps = (sorted.len() - 1) as f64 / span;
    Some((fps * 1000.0).round() / 1000.0)
}

pub fn clamp_thumbnail_time(preferred: f64, duration: Option<f64>) -> f64 {
    match duration {
        Some(duration) if duration.is_finite() => {
            preferred.min((duration - END_MARGIN).max(0.0)).max(0.0)
        }
        _ => preferred.max(0.0),
    }
}

/// Scale so the larger side equals `target`, keeping the aspect ratio.
pub fn fit_within(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (target, target);
    }
    if width >= height {
        let scaled = (height as f64 * target as f64 / width as f64).round() as u32;
        (target, scaled.max(1))
    } else {
        let scaled = (width as f64 * target as f64 / height as f64).round() as u32;
        (scaled.max(1), target)
    }
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut output = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut output, ImageFormat::Jpeg)?;
    Ok(output.into_inner())
}

pub fn thumbnail_from_image(image: &DynamicImage, target: u32) -> Result<Thumbnail> {
    let (width, height) = fit_within(image.width(), image.height(), target);
    let scaled = image.resize_exact(width, height, FilterType::Triangle);
    Ok(Thumbnail {
        image: encode_jpeg(&scaled)?,
        width,
        height,
    })
}

/// Waveform-style bars on a dark background; bar heights are arbitrary.
pub fn audio_placeholder(target: u32) -> Result<Thumbnail> {
    let width = target.max(16);
    let height = (width * 9 / 16).max(9);
    let seed = Uuid::new_v4();
    let levels = seed.as_bytes();
    let bar_count = levels.len() as u32;
    let slot = (width / bar_count).max(1);

    let image = RgbImage::from_fn(width, height, |x, y| {
        let bar = (x / slot).min(bar_count - 1) as usize;
        let inside_bar = x % slot < slot.saturating_sub(2).max(1);
        let level = 0.25 + (levels[bar] as f64 / 255.0) * 0.65;
        let half = (height as f64 * level / 2.0) as u32;
        let mid = height / 2;
        if inside_bar && y + half >= mid && y <= mid + half {
            Rgb([94, 129, 244])
        } else {
            Rgb([24, 26, 33])
        }
    });

    Ok(Thumbnail {
        image: encode_jpeg(&DynamicImage::ImageRgb8(image))?,
        width,
        height,
    })
}

/// Metadata and thumbnail for one file, in a single pass over it.
pub fn extract_media(
    decoder: &dyn MediaDecoder,
    request: &ExtractRequest,
    thumbnail_size: u32,
) -> Result<Extraction> {
    let kind = crate::mime::kind_of(&request.mime_type).ok_or_else(|| {
        Error::Validation(format!("unsupported media type '{}'", request.mime_type))
    })?;
    debug!("Extracting {} ({})", request.path.display(), kind.as_str());

    match kind {
        MediaKind::Video => extract_video(decoder, &request.path, thumbnail_size),
        MediaKind::Audio => extract_audio(decoder, &request.path, thumbnail_size),
        MediaKind::Image => extract_image(&request.path, thumbnail_size),
    }
}

fn base_properties(report: &ProbeReport) -> MediaProperties {
    let audio_codec = report.audio.as_ref().and_then(|a| a.codec.clone());
    MediaProperties {
        duration: report.duration,
        bitrate: report.bitrate,
        audio_codec_supported: is_audio_codec_supported(audio_codec.as_deref()),
        audio_codec,
        channels: report.audio.as_ref().and_then(|a| a.channels),
        sample_rate: report.audio.as_ref().and_then(|a| a.sample_rate),
        ..MediaProperties::default()
    }
}

fn extract_video(decoder: &dyn MediaDecoder, path: &Path, target: u32) -> Result<Extraction> {
    let report = decoder.probe(path)?;
    let video = report
        .video
        .clone()
        .ok_or_else(|| Error::Validation(format!("{} has no video stream", path.display())))?;

    let mut properties = base_properties(&report);
    properties.width = Some(video.width);
    properties.height = Some(video.height);
    properties.video_codec = video.codec.clone();
    properties.fps = estimate_fps(&report.video_packet_pts).or(video.avg_frame_rate);

    let at = clamp_thumbnail_time(THUMBNAIL_TIME, report.duration);
    let thumbnail = match decoder.frame_at(path, at) {
        Ok(frame) => Some(thumbnail_from_image(&frame, target)?),
        Err(err) => {
            warn!("No thumbnail for {} at {:.2}s: {}", path.display(), at, err);
            None
        }
    };

    Ok(Extraction {
        properties,
        thumbnail,
    })
}

fn extract_audio(decoder: &dyn MediaDecoder, path: &Path, target: u32) -> Result<Extraction> {
    let report = decoder.probe(path)?;
    if report.audio.is_none() {
        return Err(Error::Validation(format!(
            "{} has no audio stream",
            path.display()
        )));
    }
    Ok(Extraction {
        properties: base_properties(&report),
        thumbnail: Some(audio_placeholder(target)?),
    })
}

fn extract_image(path: &Path, target: u32) -> Result<Extraction> {
    let image = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    let properties = MediaProperties {
        width: Some(image.width()),
        height: Some(image.height()),
        ..MediaProperties::default()
    };
    Ok(Extraction {
        properties,
        thumbnail: Some(thumbnail_from_image(&image, target)?),
    })
}
