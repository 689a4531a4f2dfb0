// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Overlay window geometry: rectangles, rotations and the mapping from
//! display coordinates to the coordinates the overlay hardware scans in.

use crate::error::{OverlayError, Result};
use core::fmt;

/// Smallest overlay window edge the scaler accepts.
pub const MIN_WINDOW_SIZE: u32 = 16;

/// Rectangle in display or device coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of top-left corner
    pub x: i32,
    /// Y coordinate of top-left corner
    pub y: i32,
    /// Width of the rectangle in pixels
    pub width: u32,
    /// Height of the rectangle in pixels
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a rectangle from its edges, `None` if the edges are inverted.
    pub fn from_edges(left: u32, top: u32, right: u32, bottom: u32) -> Option<Self> {
        Some(Self {
            x: i32::try_from(left).ok()?,
            y: i32::try_from(top).ok()?,
            width: right.checked_sub(left)?,
            height: bottom.checked_sub(top)?,
        })
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Display (or input frame) dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Overlay rotation angles supported by the display pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    /// No rotation (0 degrees)
    #[default]
    Rotation0,
    /// Rotate 90 degrees clockwise
    Rotation90,
    /// Rotate 180 degrees
    Rotation180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotation270,
}

/// Transform code for a 90 degree rotation (flip-h | rot-90 bits).
pub const TRANSFORM_ROT_90: u32 = 0x04;
/// Transform code for a 180 degree rotation (flip-h | flip-v).
pub const TRANSFORM_ROT_180: u32 = 0x03;
/// Transform code for a 270 degree rotation (all three bits).
pub const TRANSFORM_ROT_270: u32 = 0x07;

impl Rotation {
    pub const fn degrees(self) -> i32 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => 90,
            Rotation::Rotation180 => 180,
            Rotation::Rotation270 => 270,
        }
    }

    pub const fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::Rotation0),
            90 => Some(Rotation::Rotation90),
            180 => Some(Rotation::Rotation180),
            270 => Some(Rotation::Rotation270),
            _ => None,
        }
    }

    /// Decodes a window-manager transform code.
    pub const fn from_transform(code: u32) -> Option<Self> {
        match code {
            0 => Some(Rotation::Rotation0),
            TRANSFORM_ROT_90 => Some(Rotation::Rotation90),
            TRANSFORM_ROT_180 => Some(Rotation::Rotation180),
            TRANSFORM_ROT_270 => Some(Rotation::Rotation270),
            _ => None,
        }
    }

    pub const fn transform(self) -> u32 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => TRANSFORM_ROT_90,
            Rotation::Rotation180 => TRANSFORM_ROT_180,
            Rotation::Rotation270 => TRANSFORM_ROT_270,
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// One copy of the control-side window state. Each overlay keeps a staged
/// copy, updated by the API, and a committed copy, last pushed to hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub position: Rect,
    pub colorkey: bool,
    pub rotation: Rotation,
}

fn check_min_size(rect: Rect) -> Result<()> {
    if rect.width < MIN_WINDOW_SIZE || rect.height < MIN_WINDOW_SIZE {
        return Err(OverlayError::InvalidArgument(format!(
            "window {rect} smaller than {MIN_WINDOW_SIZE}x{MIN_WINDOW_SIZE}"
        )));
    }
    Ok(())
}

/// Validates a requested window against the display.
///
/// Before the first commit (`lenient`) the window is pulled inside the
/// display; afterwards anything outside the display is rejected.
pub fn fit_window(rect: Rect, display: Size, lenient: bool) -> Result<Rect> {
    check_min_size(rect)?;

    if lenient {
        let mut r = rect;
        r.x = r.x.max(0);
        r.y = r.y.max(0);
        r.width = r.width.min(display.width);
        r.height = r.height.min(display.height);
        if r.right() > display.width as i64 {
            r.width = display.width.saturating_sub(r.x as u32);
        }
        if r.bottom() > display.height as i64 {
            r.height = display.height.saturating_sub(r.y as u32);
        }
        // clamping an offset at or past the display edge leaves nothing
        check_min_size(r)?;
        return Ok(r);
    }

    if rect.x < 0
        || rect.y < 0
        || rect.right() > display.width as i64
        || rect.bottom() > display.height as i64
    {
        return Err(OverlayError::Validation(rect.to_string()));
    }
    Ok(rect)
}

/// Rounds the window up to the scaler's 16 pixel granularity and shifts it
/// back by half the growth so it stays centred on the requested area, with
/// offsets kept even and non-negative.
pub fn align_for_scaler(rect: Rect) -> Rect {
    let grow_w = (MIN_WINDOW_SIZE - rect.width % MIN_WINDOW_SIZE) % MIN_WINDOW_SIZE;
    let grow_h = (MIN_WINDOW_SIZE - rect.height % MIN_WINDOW_SIZE) % MIN_WINDOW_SIZE;

    let recentre = |offset: i32, grow: u32| -> i32 {
        if offset == 0 {
            return 0;
        }
        let shifted = offset - (grow / 2) as i32;
        (shifted - shifted.rem_euclid(2)).max(0)
    };

    Rect {
        x: recentre(rect.x, grow_w),
        y: recentre(rect.y, grow_h),
        width: rect.width + grow_w,
        height: rect.height + grow_h,
    }
}

/// Maps a display-space window into the overlay's scan coordinates.
///
/// 90 and 270 degrees swap the axes, 180 degrees reflects the window through
/// the display centre.
pub fn to_device(rect: Rect, rotation: Rotation, display: Size) -> Rect {
    match rotation {
        Rotation::Rotation0 => rect,
        Rotation::Rotation90 | Rotation::Rotation270 => Rect {
            x: rect.y,
            y: rect.x,
            width: rect.height,
            height: rect.width,
        },
        Rotation::Rotation180 => Rect {
            x: (display.width as i64 - rect.x as i64 - rect.width as i64) as i32,
            y: (display.height as i64 - rect.y as i64 - rect.height as i64) as i32,
            width: rect.width,
            height: rect.height,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LCD: Size = Size::new(480, 800);

    #[test]
    fn lenient_clamps_negative_offset() {
        let r = fit_window(Rect::new(-10, 5, 100, 100), LCD, true).unwrap();
        assert_eq!(r, Rect::new(0, 5, 100, 100));
    }

    #[test]
    fn lenient_shrinks_to_display() {
        let r = fit_window(Rect::new(400, 0, 640, 900), LCD, true).unwrap();
        assert_eq!(r, Rect::new(400, 0, 80, 800));
    }

    #[test]
    fn strict_rejects_outside() {
        let err = fit_window(Rect::new(-10, 5, 100, 100), LCD, false).unwrap_err();
        assert!(matches!(err, OverlayError::Validation(_)));
        let err = fit_window(Rect::new(400, 0, 100, 100), LCD, false).unwrap_err();
        assert!(matches!(err, OverlayError::Validation(_)));
        assert!(fit_window(Rect::new(380, 700, 100, 100), LCD, false).is_ok());
    }

    #[test]
    fn lenient_rejects_window_clamped_below_minimum() {
        for x in [480, 600, 470] {
            let err = fit_window(Rect::new(x, 0, 100, 100), LCD, true).unwrap_err();
            assert!(matches!(err, OverlayError::InvalidArgument(_)));
        }
        let err = fit_window(Rect::new(0, 790, 100, 100), LCD, true).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidArgument(_)));
        // exactly the minimum left after clamping is accepted
        let r = fit_window(Rect::new(464, 0, 100, 100), LCD, true).unwrap();
        assert_eq!(r, Rect::new(464, 0, 16, 100));
    }

    #[test]
    fn undersized_window_rejected() {
        for lenient in [true, false] {
            let err = fit_window(Rect::new(0, 0, 15, 100), LCD, lenient).unwrap_err();
            assert!(matches!(err, OverlayError::InvalidArgument(_)));
        }
    }

    #[test]
    fn scaler_alignment() {
        // 100 -> 112 grows by 12, offsets pulled back by 6 and kept even
        let r = align_for_scaler(Rect::new(11, 20, 100, 100));
        assert_eq!(r, Rect::new(4, 14, 112, 112));

        // zero offsets stay put and aligned sizes are untouched
        let r = align_for_scaler(Rect::new(0, 0, 480, 800));
        assert_eq!(r, Rect::new(0, 0, 480, 800));

        // offsets never go negative
        let r = align_for_scaler(Rect::new(3, 1, 20, 20));
        assert_eq!(r, Rect::new(0, 0, 32, 32));
    }

    #[test]
    fn device_transform() {
        let r = Rect::new(10, 20, 100, 200);
        assert_eq!(to_device(r, Rotation::Rotation0, LCD), r);
        assert_eq!(
            to_device(r, Rotation::Rotation90, LCD),
            Rect::new(20, 10, 200, 100)
        );
        assert_eq!(
            to_device(r, Rotation::Rotation270, LCD),
            Rect::new(20, 10, 200, 100)
        );
        assert_eq!(
            to_device(r, Rotation::Rotation180, LCD),
            Rect::new(370, 580, 100, 200)
        );
    }

    #[test]
    fn transform_composition() {
        let display = Size::new(800, 800);
        for r in [
            Rect::new(0, 0, 800, 800),
            Rect::new(10, 20, 100, 200),
            Rect::new(650, 33, 150, 16),
        ] {
            let twice = to_device(
                to_device(r, Rotation::Rotation90, display),
                Rotation::Rotation90,
                display,
            );
            assert_eq!(twice, r);
            let reflected = to_device(twice, Rotation::Rotation180, display);
            assert_eq!(to_device(reflected, Rotation::Rotation180, display), r);
        }
    }

    #[test]
    fn transform_codes() {
        for rot in [
            Rotation::Rotation0,
            Rotation::Rotation90,
            Rotation::Rotation180,
            Rotation::Rotation270,
        ] {
            assert_eq!(Rotation::from_transform(rot.transform()), Some(rot));
            assert_eq!(Rotation::from_degrees(rot.degrees()), Some(rot));
        }
        assert_eq!(Rotation::from_transform(0x01), None);
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn edges() {
        assert_eq!(Rect::from_edges(8, 8, 648, 488), Some(Rect::new(8, 8, 640, 480)));
        assert_eq!(Rect::from_edges(10, 0, 5, 10), None);
    }
}
