use std::io::Cursor;
use std::sync::LazyLock;

use ab_glyph::{FontRef, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::status::{LocationState, StatusSnapshot, SystemStatus};

const BAND_HEIGHT: u32 = 120;
const STRIPE_HEIGHT: u32 = 8;
const JPEG_QUALITY: u8 = 80;
const TEXT_LEFT: i32 = 10;
const HEADLINE_SCALE: f32 = 20.0;
const LINE_SCALE: f32 = 16.0;
const LINE_TOPS: [i32; 5] = [8, 32, 52, 72, 92];

static FONT: LazyLock<Option<FontRef<'static>>> = LazyLock::new(|| {
    FontRef::try_from_slice(include_bytes!("../assets/DejaVuSans.ttf")).ok()
});

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("overlay font could not be parsed")]
    Font,
}

/// Text shown over the live stream, top to bottom.
pub fn overlay_lines(snapshot: &StatusSnapshot, camera_id: &str, stale: bool) -> Vec<String> {
    let last_update = snapshot
        .last_update
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let location_updated = snapshot
        .location_updated_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    let mut status = format!(
        "Status: {} | Last Update: {}",
        snapshot.status.label(),
        last_update
    );
    if stale {
        status.push_str(" (stale)");
    }

    let mut location = format!("Location: {}", snapshot.location_label);
    if snapshot.location_state == LocationState::Unavailable {
        location.push_str(" (unavailable)");
    }

    vec![
        format!("Occupancy: {}/{}", snapshot.occupancy, snapshot.capacity),
        status,
        location,
        format!("Location Updated: {location_updated}"),
        format!("Camera: {camera_id}"),
    ]
}

fn status_color(status: SystemStatus, stale: bool) -> Rgb<u8> {
    if stale {
        return Rgb([128, 128, 128]);
    }
    match status {
        SystemStatus::Initializing => Rgb([33, 150, 243]),
        SystemStatus::Ok => Rgb([76, 175, 80]),
        SystemStatus::NearFull => Rgb([255, 193, 7]),
        SystemStatus::Full => Rgb([244, 67, 54]),
    }
}

/// Draw the status band and overlay text onto a frame and re-encode it.
pub fn annotate(
    jpeg: &[u8],
    snapshot: &StatusSnapshot,
    camera_id: &str,
    stale: bool,
) -> Result<Vec<u8>, OverlayError> {
    let font = FONT.as_ref().ok_or(OverlayError::Font)?;
    let mut frame = image::load_from_memory(jpeg)?.to_rgb8();
    let color = status_color(snapshot.status, stale);

    let width = frame.width();
    let band = BAND_HEIGHT.min(frame.height());
    let stripe = STRIPE_HEIGHT.min(band);
    if band > stripe {
        draw_filled_rect_mut(
            &mut frame,
            Rect::at(0, 0).of_size(width, band - stripe),
            Rgb([0, 0, 0]),
        );
    }
    if stripe > 0 {
        draw_filled_rect_mut(
            &mut frame,
            Rect::at(0, (band - stripe) as i32).of_size(width, stripe),
            color,
        );
    }

    for (i, (line, top)) in overlay_lines(snapshot, camera_id, stale)
        .iter()
        .zip(LINE_TOPS)
        .enumerate()
    {
        let (scale, fill) = if i == 0 {
            (HEADLINE_SCALE, color)
        } else {
            (LINE_SCALE, Rgb([255, 255, 255]))
        };
        draw_text_mut(&mut frame, fill, TEXT_LEFT, top, PxScale::from(scale), font, line);
    }

    let mut out = Cursor::new(Vec::with_capacity(jpeg.len()));
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&frame)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::testing::sample_jpeg;
    use chrono::{Local, TimeZone};

    fn reading(occupancy: u32) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::initial(40);
        snapshot.occupancy = occupancy;
        snapshot.status = SystemStatus::Ok;
        snapshot.last_update = Some(Local.with_ymd_and_hms(2024, 5, 1, 8, 30, 5).unwrap());
        snapshot.location_label = "Pune, IN".to_string();
        snapshot
    }

    #[test]
    fn lines_cover_reading_location_and_camera() {
        let mut snapshot = StatusSnapshot::initial(40);
        snapshot.occupancy = 35;
        snapshot.status = SystemStatus::NearFull;
        snapshot.last_update = Some(Local.with_ymd_and_hms(2024, 5, 1, 8, 30, 5).unwrap());
        snapshot.location_label = "Pune, IN".to_string();
        snapshot.location_state = LocationState::Unavailable;

        let lines = overlay_lines(&snapshot, "bus-3", true);

        assert_eq!(
            lines,
            vec![
                "Occupancy: 35/40".to_string(),
                "Status: NEAR FULL | Last Update: 08:30:05 (stale)".to_string(),
                "Location: Pune, IN (unavailable)".to_string(),
                "Location Updated: never".to_string(),
                "Camera: bus-3".to_string(),
            ]
        );
    }

    #[test]
    fn embedded_font_parses() {
        assert!(FONT.is_some());
    }

    #[test]
    fn annotate_keeps_dimensions_and_paints_band() {
        let jpeg = sample_jpeg(160, 200);
        let mut snapshot = reading(40);
        snapshot.status = SystemStatus::Full;

        let annotated = annotate(&jpeg, &snapshot, "bus-1", false).unwrap();

        let frame = image::load_from_memory(&annotated).unwrap().to_rgb8();
        assert_eq!(frame.dimensions(), (160, 200));
        let stripe = frame.get_pixel(80, BAND_HEIGHT - 4);
        assert!(
            i32::from(stripe[0]) - i32::from(stripe[2]) > 80,
            "stripe was {stripe:?}"
        );
    }

    #[test]
    fn annotate_draws_text_into_band() {
        let jpeg = sample_jpeg(320, 240);

        let annotated = annotate(&jpeg, &reading(10), "bus-1", false).unwrap();

        let frame = image::load_from_memory(&annotated).unwrap().to_rgb8();
        let lit = (0..320)
            .flat_map(|x| (30..110).map(move |y| (x, y)))
            .filter(|&(x, y)| frame.get_pixel(x, y).0.iter().all(|&c| c > 180))
            .count();
        assert!(lit > 50, "only {lit} text pixels in band");
    }

    #[test]
    fn frames_differ_between_readings() {
        let jpeg = sample_jpeg(320, 240);

        let ten = annotate(&jpeg, &reading(10), "bus-1", false).unwrap();
        let twenty_five = annotate(&jpeg, &reading(25), "bus-1", false).unwrap();
        let other_camera = annotate(&jpeg, &reading(10), "bus-2", false).unwrap();

        let ten_px = image::load_from_memory(&ten).unwrap().to_rgb8();
        let twenty_five_px = image::load_from_memory(&twenty_five).unwrap().to_rgb8();
        assert_ne!(ten_px.as_raw(), twenty_five_px.as_raw());
        assert_ne!(ten, other_camera);
    }

    #[test]
    fn annotate_rejects_garbage() {
        assert!(annotate(b"not a jpeg", &reading(1), "bus-1", false).is_err());
    }
}
