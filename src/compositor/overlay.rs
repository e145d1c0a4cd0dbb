//! Webcam inset drawing
//!
//! Pixel-level helpers for placing the webcam picture-in-picture in the
//! bottom-right corner of the composed surface.

use crate::capture::{Resolution, VideoFrame};

/// Inset width as a fraction of the surface width
pub const INSET_WIDTH_RATIO: f64 = 0.20;
/// Inset height relative to its width (4:3)
pub const INSET_ASPECT: f64 = 0.75;
pub const INSET_CORNER_RADIUS: i32 = 12;
pub const INSET_MARGIN: u32 = 20;
pub const INSET_BORDER_WIDTH: i32 = 2;
/// White at 50% opacity
pub const INSET_BORDER_RGBA: [u8; 4] = [255, 255, 255, 128];

/// Placement of the inset on the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsetRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl InsetRect {
    /// Bottom-right placement for a surface, or `None` when the surface is
    /// too small to hold it.
    pub fn for_surface(surface: Resolution) -> Option<Self> {
        let width = (surface.width as f64 * INSET_WIDTH_RATIO) as u32;
        let height = (width as f64 * INSET_ASPECT) as u32;
        if width == 0 || height == 0 {
            return None;
        }
        let x = surface.width.checked_sub(width + INSET_MARGIN)?;
        let y = surface.height.checked_sub(height + INSET_MARGIN)?;
        Some(Self { x, y, width, height })
    }
}

/// Check if a point is inside a rounded rectangle anchored at the origin
pub fn is_inside_rounded_rect(x: i32, y: i32, width: i32, height: i32, radius: i32) -> bool {
    if x < 0 || y < 0 || x >= width || y >= height {
        return false;
    }
    let radius = radius.min(width / 2).min(height / 2);
    let corner = |cx: i32, cy: i32| {
        let dx = x - cx;
        let dy = y - cy;
        dx * dx + dy * dy <= radius * radius
    };
    let left = x < radius;
    let right = x >= width - radius;
    let top = y < radius;
    let bottom = y >= height - radius;

    match (left, right, top, bottom) {
        (true, _, true, _) => corner(radius, radius),
        (_, true, true, _) => corner(width - radius - 1, radius),
        (true, _, _, true) => corner(radius, height - radius - 1),
        (_, true, _, true) => corner(width - radius - 1, height - radius - 1),
        _ => true,
    }
}

fn blend(dst: &mut [u8], src: [u8; 4]) {
    let alpha = src[3] as f32 / 255.0;
    for c in 0..3 {
        let out = src[c] as f32 * alpha + dst[c] as f32 * (1.0 - alpha);
        dst[c] = out.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = 255;
}

/// Draw the webcam frame into `rect` with nearest-neighbour scaling, rounded
/// corners and a translucent border.
pub fn draw_inset(surface: &mut VideoFrame, webcam: &VideoFrame, rect: InsetRect) {
    if webcam.width == 0 || webcam.height == 0 {
        return;
    }
    let w = rect.width as i32;
    let h = rect.height as i32;
    let inner_w = w - 2 * INSET_BORDER_WIDTH;
    let inner_h = h - 2 * INSET_BORDER_WIDTH;
    let inner_radius = (INSET_CORNER_RADIUS - INSET_BORDER_WIDTH).max(0);

    for dy in 0..rect.height {
        for dx in 0..rect.width {
            let (ix, iy) = (dx as i32, dy as i32);
            if !is_inside_rounded_rect(ix, iy, w, h, INSET_CORNER_RADIUS) {
                continue;
            }

            let sx = (dx as u64 * webcam.width as u64 / rect.width as u64) as u32;
            let sy = (dy as u64 * webcam.height as u64 / rect.height as u64) as u32;
            let src = webcam.pixel(sx.min(webcam.width - 1), sy.min(webcam.height - 1));

            let fx = rect.x + dx;
            let fy = rect.y + dy;
            if fx >= surface.width || fy >= surface.height {
                continue;
            }
            let idx = ((fy * surface.width + fx) * 4) as usize;
            let dst = &mut surface.data[idx..idx + 4];
            dst[0] = src[0];
            dst[1] = src[1];
            dst[2] = src[2];
            dst[3] = 255;

            let in_inner = is_inside_rounded_rect(
                ix - INSET_BORDER_WIDTH,
                iy - INSET_BORDER_WIDTH,
                inner_w,
                inner_h,
                inner_radius,
            );
            if !in_inner {
                blend(dst, INSET_BORDER_RGBA);
            }
        }
    }
}

/// Compose one output frame: the screen scaled to the surface, then the
/// inset when a webcam frame is supplied.
pub fn compose_frame(
    surface: Resolution,
    screen: Option<&VideoFrame>,
    webcam: Option<&VideoFrame>,
) -> VideoFrame {
    let mut out = match screen {
        Some(frame) if frame.resolution() == surface => frame.clone(),
        Some(frame) => scale_to(frame, surface),
        None => VideoFrame::black(surface),
    };

    if let (Some(webcam), Some(rect)) = (webcam, InsetRect::for_surface(surface)) {
        draw_inset(&mut out, webcam, rect);
    }
    out
}

fn scale_to(frame: &VideoFrame, target: Resolution) -> VideoFrame {
    let mut out = VideoFrame::black(target);
    out.timestamp_ms = frame.timestamp_ms;
    if frame.width == 0 || frame.height == 0 {
        return out;
    }
    for y in 0..target.height {
        let sy = (y as u64 * frame.height as u64 / target.height as u64) as u32;
        for x in 0..target.width {
            let sx = (x as u64 * frame.width as u64 / target.width as u64) as u32;
            let px = frame.pixel(sx, sy);
            let idx = ((y * target.width + x) * 4) as usize;
            out.data[idx..idx + 4].copy_from_slice(&px);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(res: Resolution, rgba: [u8; 4]) -> VideoFrame {
        let mut frame = VideoFrame::black(res);
        for px in frame.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        frame
    }

    #[test]
    fn test_inset_geometry_at_1080p() {
        let rect = InsetRect::for_surface(Resolution::new(1920, 1080)).unwrap();
        assert_eq!(rect.width, 384);
        assert_eq!(rect.height, 288);
        assert_eq!(rect.x, 1920 - 384 - 20);
        assert_eq!(rect.y, 1080 - 288 - 20);
    }

    #[test]
    fn test_inset_skipped_on_tiny_surface() {
        assert!(InsetRect::for_surface(Resolution::new(20, 10)).is_none());
    }

    #[test]
    fn test_rounded_corners_are_cut() {
        assert!(!is_inside_rounded_rect(0, 0, 100, 75, 12));
        assert!(!is_inside_rounded_rect(99, 74, 100, 75, 12));
        assert!(is_inside_rounded_rect(50, 0, 100, 75, 12));
        assert!(is_inside_rounded_rect(12, 12, 100, 75, 12));
        assert!(!is_inside_rounded_rect(100, 10, 100, 75, 12));
    }

    #[test]
    fn test_compose_draws_webcam_and_border() {
        let surface = Resolution::new(400, 300);
        let screen = solid(surface, [0, 0, 255, 255]);
        let webcam = solid(Resolution::new(32, 24), [255, 0, 0, 255]);

        let out = compose_frame(surface, Some(&screen), Some(&webcam));
        let rect = InsetRect::for_surface(surface).unwrap();

        // Centre of the inset shows the webcam
        let centre = out.pixel(rect.x + rect.width / 2, rect.y + rect.height / 2);
        assert_eq!(centre, [255, 0, 0, 255]);

        // Border pixel on the top edge is blended toward white
        let border = out.pixel(rect.x + rect.width / 2, rect.y);
        assert!(border[1] > 100 && border[2] > 100);

        // Corner pixel outside the rounding still shows the screen
        assert_eq!(out.pixel(rect.x, rect.y), [0, 0, 255, 255]);

        // Outside the inset is untouched
        assert_eq!(out.pixel(5, 5), [0, 0, 255, 255]);
    }

    #[test]
    fn test_compose_without_webcam_is_screen_only() {
        let surface = Resolution::new(64, 48);
        let screen = solid(Resolution::new(128, 96), [10, 20, 30, 255]);
        let out = compose_frame(surface, Some(&screen), None);
        assert_eq!(out.resolution(), surface);
        assert!(out.data.chunks_exact(4).all(|px| px == [10, 20, 30, 255]));
    }
}
