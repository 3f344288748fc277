use crate::config::ProxyConfig;

/// A source qualifies when its longer edge exceeds the threshold's longer edge.
pub fn is_eligible(width: u32, height: u32, config: &ProxyConfig) -> bool {
    let threshold = config.threshold_width.max(config.threshold_height);
    width.max(height) > threshold
}

/// Fit `width`×`height` inside the max box (rotated to match the source
/// orientation), never upscaling, rounded down to even numbers.
pub fn proxy_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let long = max_width.max(max_height) as u64;
    let short = max_width.min(max_height) as u64;
    let (box_w, box_h) = if width >= height {
        (long, short)
    } else {
        (short, long)
    };
    let (w, h) = (width.max(1) as u64, height.max(1) as u64);

    let (scaled_w, scaled_h) = if w <= box_w && h <= box_h {
        (w, h)
    } else if w * box_h >= h * box_w {
        (box_w, h * box_w / w)
    } else {
        (w * box_h / h, box_h)
    };

    (even_floor(scaled_w), even_floor(scaled_h))
}

fn even_floor(value: u64) -> u32 {
    ((value / 2 * 2).max(2)).min(u32::MAX as u64) as u32
}
