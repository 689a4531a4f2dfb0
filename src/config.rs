// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{OverlayError, Result},
    geometry::{Rotation, Size},
};
use tracing::debug;

/// Runtime settings shared by the control and data sides.
///
/// Both processes must agree on these values; the demo binary builds them
/// from the same command line for both threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Display bounds used to validate overlay windows.
    pub display: Size,
    /// Buffers requested from the driver when an overlay is created.
    pub buffers: u32,
    /// Queue depth at which the data side starts the stream on its own.
    pub queue_threshold: u32,
    /// High-resolution playback mode selector.
    pub high_res: bool,
    /// Window forced by the high-resolution mode.
    pub high_res_size: Size,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            display: Size::new(480, 800),
            buffers: 6,
            queue_threshold: 3,
            high_res: false,
            high_res_size: Size::new(1280, 720),
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.display.width == 0 || self.display.height == 0 {
            return Err(OverlayError::InvalidArgument(
                "display size must be non-zero".to_string(),
            ));
        }
        if self.queue_threshold == 0 || self.queue_threshold > self.buffers {
            return Err(OverlayError::InvalidArgument(format!(
                "queue threshold {} must be within 1..={}",
                self.queue_threshold, self.buffers
            )));
        }
        Ok(())
    }
}

/// Which camera sensor feeds the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Camera {
    #[default]
    Back,
    Front,
}

/// Device and orientation flags supplied when an overlay is created.
///
/// The sensor and panel wiring fixes the rotation the pipe must use, so these
/// flags override whatever rotation the window manager asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceConfig {
    pub camera: Camera,
    /// Video-telephony mode.
    pub vt_mode: bool,
    /// Orientation check enabled (camera preview/recording).
    pub orientation_check: bool,
    pub crop_check: bool,
    pub vendor: bool,
}

const SOURCE_BIT: u32 = 24;
const MODE_BIT: u32 = 25;
const CHECK_BIT: u32 = 26;
const CROP_CHECK_BIT: u32 = 27;
const VENDOR_BIT: u32 = 28;
const FORMAT_MASK: u32 = 0x00ff_ffff;

fn bit(raw: u32, n: u32) -> bool {
    (raw >> n) & 1 == 1
}

impl SourceConfig {
    /// Splits a legacy packed format word into its pixel format code and the
    /// flags carried in bits 24 to 28.
    ///
    /// Without the orientation check bit, older callers signal
    /// video-telephony through bit 27 instead of bit 25.
    pub fn unpack(raw: u32) -> (u32, Self) {
        let orientation_check = bit(raw, CHECK_BIT);
        let camera = match bit(raw, SOURCE_BIT) {
            true => Camera::Front,
            false => Camera::Back,
        };
        let source = if orientation_check {
            Self {
                camera,
                vt_mode: bit(raw, MODE_BIT),
                orientation_check,
                crop_check: bit(raw, CROP_CHECK_BIT),
                vendor: bit(raw, VENDOR_BIT),
            }
        } else {
            Self {
                camera,
                vt_mode: bit(raw, CROP_CHECK_BIT),
                orientation_check,
                crop_check: false,
                vendor: bit(raw, VENDOR_BIT),
            }
        };
        debug!("unpacked format word {raw:#010x} into {source:?}");
        (raw & FORMAT_MASK, source)
    }

    /// Rotation the wiring forces regardless of the requested transform.
    pub fn rotation_override(&self) -> Option<Rotation> {
        if self.vt_mode {
            Some(Rotation::Rotation0)
        } else if self.camera == Camera::Front {
            Some(Rotation::Rotation270)
        } else {
            None
        }
    }

    /// Rotation and horizontal mirroring programmed when the pipe is opened.
    pub fn default_orientation(&self) -> (Rotation, bool) {
        let front = self.camera == Camera::Front;
        match (self.vt_mode, front) {
            (true, _) if self.orientation_check => (Rotation::Rotation0, front),
            (true, _) => (Rotation::Rotation0, true),
            (false, true) => (Rotation::Rotation270, true),
            (false, false) => (Rotation::Rotation90, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        OverlayConfig::default().validate().unwrap();
    }

    #[test]
    fn threshold_bounds() {
        let mut config = OverlayConfig {
            queue_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.queue_threshold = config.buffers + 1;
        assert!(config.validate().is_err());
        config.queue_threshold = config.buffers;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unpack_strips_flags() {
        let (code, source) = SourceConfig::unpack(0x14);
        assert_eq!(code, 0x14);
        assert_eq!(source, SourceConfig::default());

        let raw = 0x14 | 1 << 24 | 1 << 26 | 1 << 27 | 1 << 28;
        let (code, source) = SourceConfig::unpack(raw);
        assert_eq!(code, 0x14);
        assert_eq!(source.camera, Camera::Front);
        assert!(!source.vt_mode);
        assert!(source.orientation_check);
        assert!(source.crop_check);
        assert!(source.vendor);
    }

    #[test]
    fn unpack_legacy_vt_bit() {
        let (_, source) = SourceConfig::unpack(0x14 | 1 << 27);
        assert!(source.vt_mode);
        assert!(!source.crop_check);

        let (_, source) = SourceConfig::unpack(0x14 | 1 << 25);
        assert!(!source.vt_mode);
    }

    #[test]
    fn orientation_table() {
        let mut s = SourceConfig::default();
        assert_eq!(s.default_orientation(), (Rotation::Rotation90, false));
        assert_eq!(s.rotation_override(), None);

        s.camera = Camera::Front;
        assert_eq!(s.default_orientation(), (Rotation::Rotation270, true));
        assert_eq!(s.rotation_override(), Some(Rotation::Rotation270));

        s.vt_mode = true;
        assert_eq!(s.default_orientation(), (Rotation::Rotation0, true));
        assert_eq!(s.rotation_override(), Some(Rotation::Rotation0));

        s.orientation_check = true;
        s.camera = Camera::Back;
        assert_eq!(s.default_orientation(), (Rotation::Rotation0, false));
    }
}
