//! attend-hw: frame sources for the attendance capture loop.
//!
//! V4L2 webcam capture and image-directory playback behind one
//! [`FrameSource`] trait, plus the grayscale conversions they share.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraSettings, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CameraError, FrameSource, ImageDirSource};
