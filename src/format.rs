// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;

/// Four character pixel format code, stored in V4L2 byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

/// YUYV 4:2:2 YUV packed format (the overlay's native video format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// UYVY 4:2:2 YUV packed format
pub const UYVY: FourCC = FourCC(*b"UYVY");

/// RGB 16-bit 5:6:5 format
pub const RGBP: FourCC = FourCC(*b"RGBP");

/// RGB 32-bit format (8 bits per channel, unused alpha)
pub const RGB4: FourCC = FourCC(*b"RGB4");

impl FourCC {
    /// Maps a legacy overlay HAL format code (the low 24 bits of the packed
    /// format word) to a pixel format.
    pub fn from_hal_code(code: u32) -> Option<Self> {
        match code {
            0x01 => Some(RGB4),
            0x04 => Some(RGBP),
            0x14 => Some(YUYV),
            0x1b => Some(UYVY),
            _ => None,
        }
    }

    /// Bytes per pixel for the packed formats the overlay accepts.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self.0 {
            [b'Y', b'U', b'Y', b'V'] | [b'U', b'Y', b'V', b'Y'] | [b'R', b'G', b'B', b'P'] => {
                Some(2)
            }
            [b'R', b'G', b'B', b'4'] => Some(4),
            _ => None,
        }
    }

    /// Size in bytes of one frame of `width` x `height` pixels.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let bpp = self.bytes_per_pixel()? as usize;
        Some(width as usize * height as usize * bpp)
    }
}

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        u32::from_le_bytes(value.0)
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_v4l2_codes() {
        assert_eq!(u32::from(YUYV), v4l2_overlay_sys::V4L2_PIX_FMT_YUYV);
        assert_eq!(u32::from(RGBP), v4l2_overlay_sys::V4L2_PIX_FMT_RGB565);
        assert_eq!(FourCC::from(v4l2_overlay_sys::V4L2_PIX_FMT_UYVY), UYVY);
    }

    #[test]
    fn hal_codes() {
        assert_eq!(FourCC::from_hal_code(0x14), Some(YUYV));
        assert_eq!(FourCC::from_hal_code(0x1b), Some(UYVY));
        assert_eq!(FourCC::from_hal_code(0x99), None);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(YUYV.frame_size(640, 480), Some(614400));
        assert_eq!(RGB4.frame_size(640, 480), Some(1228800));
        assert_eq!(FourCC(*b"NV12").frame_size(640, 480), None);
        assert_eq!(YUYV.to_string(), "YUYV");
    }
}
