//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{CameraError, FrameSource};
use image::GrayImage;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP: f32 = 0.02;

/// A capture node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Formats the camera can decode to grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Grey,
    Y16,
    /// Motion-JPEG; every buffer is a complete JPEG.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Capture settings for [`Camera::open`].
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    /// Apply CLAHE to frames that are not dark.
    pub enhance: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            enhance: true,
        }
    }
}

/// An open V4L2 capture device. The stream is started on the first read
/// and both stream and device are released on drop.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    enhance: bool,
}

fn capture_caps(device: &Device) -> Option<v4l::capability::Capabilities> {
    let caps = device.query_caps().ok()?;
    caps.capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        .then_some(caps)
}

/// Ask for YUYV at the requested size and accept whatever decodable format
/// the driver settles on.
fn negotiate(device: &Device, settings: &CameraSettings) -> Result<v4l::format::Format, CameraError> {
    let mut requested = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
    requested.fourcc = FourCC::new(b"YUYV");
    requested.width = settings.width;
    requested.height = settings.height;
    device
        .set_format(&requested)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))
}

impl Camera {
    /// Open a capture device such as `/dev/video0`.
    pub fn open(device_path: &str, settings: &CameraSettings) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(16) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;
        let caps = capture_caps(&device).ok_or(CameraError::StreamingNotSupported)?;

        let format = negotiate(&device, settings)?;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "{} offers {}, need YUYV, MJPG, GREY or Y16",
                caps.card, format.fourcc
            ))
        })?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            stream: None,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            device,
            pixel_format,
            enhance: settings.enhance,
        })
    }

    fn decode(&self, buf: &[u8]) -> Result<GrayImage, CameraError> {
        let (w, h) = (self.width, self.height);
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, w, h),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, w, h),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, w, h),
            PixelFormat::Mjpeg => {
                return image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map(|img| img.to_luma8())
                    .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}")));
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Capture-capable nodes among `/dev/video0..15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let device = Device::with_path(&path).ok()?;
                let caps = capture_caps(&device)?;
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let (buf, meta) = CaptureStream::next(stream)
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let sequence = u64::from(meta.sequence);
        let data = buf.to_vec();

        let image = self.decode(&data)?;
        let mut frame = Frame::new(image, sequence);
        if frame.is_dark {
            tracing::debug!(seq = sequence, "dark frame");
        } else if self.enhance {
            frame::clahe_enhance(&mut frame.image, CLAHE_TILES, CLAHE_CLIP);
        }
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stream.take();
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"RGB3")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/does-not-exist", &CameraSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
