use image::RgbImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Frame requested from a stream that is not active")]
    InvalidHandle,
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

/// Which way the requested camera should point.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// Rear camera, pointed at the worksheet.
    Environment,
    User,
}

impl Default for CameraFacing {
    fn default() -> Self {
        CameraFacing::Environment
    }
}

/// Hardware seam for the capture manager. Implement for real cameras and mocks.
///
/// `open` and `close` bracket one live stream; `grab_frame` is only meaningful
/// between them.
pub trait CameraDevice {
    fn open(&mut self, facing: CameraFacing) -> Result<(), DeviceError>;
    fn grab_frame(&mut self) -> Result<RgbImage, DeviceError>;
    fn close(&mut self);
}

const ENVIRONMENT_HINTS: [&str; 3] = ["back", "rear", "environment"];
const USER_HINTS: [&str; 4] = ["front", "user", "facetime", "integrated"];

/// Picks the device index whose name best matches `facing`, falling back to the
/// first device. Returns `None` only when `names` is empty.
pub fn pick_device(names: &[String], facing: CameraFacing) -> Option<usize> {
    if names.is_empty() {
        return None;
    }

    let hints: &[&str] = match facing {
        CameraFacing::Environment => &ENVIRONMENT_HINTS,
        CameraFacing::User => &USER_HINTS,
    };

    let matched = names.iter().position(|name| {
        let lower = name.to_lowercase();
        hints.iter().any(|hint| lower.contains(hint))
    });

    Some(matched.unwrap_or(0))
}

/// Stand-in used when the crate is built without live camera support.
pub struct UnavailableCamera;

impl CameraDevice for UnavailableCamera {
    fn open(&mut self, _facing: CameraFacing) -> Result<(), DeviceError> {
        Err(DeviceError::DeviceUnavailable(
            "live capture support was not compiled in (enable the `camera` feature)".to_string(),
        ))
    }

    fn grab_frame(&mut self) -> Result<RgbImage, DeviceError> {
        Err(DeviceError::InvalidHandle)
    }

    fn close(&mut self) {}
}

#[cfg(feature = "camera")]
pub use native::NokhwaCamera;

#[cfg(feature = "camera")]
mod native {
    use super::{pick_device, CameraDevice, CameraFacing, DeviceError};
    use image::RgbImage;
    use log::{debug, info, warn};
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
    use nokhwa::Camera;

    pub struct NokhwaCamera {
        index_override: Option<u32>,
        camera: Option<Camera>,
    }

    impl NokhwaCamera {
        pub fn new(index_override: Option<u32>) -> Self {
            Self {
                index_override,
                camera: None,
            }
        }

        fn resolve_index(&self, facing: CameraFacing) -> Result<CameraIndex, DeviceError> {
            if let Some(index) = self.index_override {
                return Ok(CameraIndex::Index(index));
            }

            let devices = nokhwa::query(ApiBackend::Auto).map_err(|e| {
                DeviceError::DeviceUnavailable(format!("Failed to list cameras: {}", e))
            })?;
            let names: Vec<String> = devices.iter().map(|d| d.human_name()).collect();
            debug!("Found cameras: {:?}", names);

            let position = pick_device(&names, facing)
                .ok_or_else(|| DeviceError::DeviceUnavailable("no camera found".to_string()))?;
            Ok(devices[position].index().clone())
        }
    }

    impl CameraDevice for NokhwaCamera {
        fn open(&mut self, facing: CameraFacing) -> Result<(), DeviceError> {
            let index = self.resolve_index(facing)?;
            let requested =
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

            let mut camera = Camera::new(index, requested).map_err(|e| {
                DeviceError::DeviceUnavailable(format!("Failed to open camera: {}", e))
            })?;
            camera.open_stream().map_err(|e| {
                DeviceError::DeviceUnavailable(format!("Failed to start camera stream: {}", e))
            })?;

            info!("Opened camera: {}", camera.info().human_name());
            self.camera = Some(camera);
            Ok(())
        }

        fn grab_frame(&mut self) -> Result<RgbImage, DeviceError> {
            let camera = self.camera.as_mut().ok_or(DeviceError::InvalidHandle)?;

            let buffer = camera.frame().map_err(|e| {
                DeviceError::DeviceUnavailable(format!("Failed to read frame: {}", e))
            })?;
            let decoded = buffer.decode_image::<RgbFormat>().map_err(|e| {
                DeviceError::DeviceUnavailable(format!("Failed to decode frame: {}", e))
            })?;

            // Rebuild through our own `image` version; nokhwa may pin a different one.
            let (width, height) = (decoded.width(), decoded.height());
            RgbImage::from_raw(width, height, decoded.into_raw()).ok_or_else(|| {
                DeviceError::DeviceUnavailable("camera returned a truncated frame".to_string())
            })
        }

        fn close(&mut self) {
            if let Some(mut camera) = self.camera.take() {
                if let Err(e) = camera.stop_stream() {
                    warn!("Failed to stop camera stream cleanly: {}", e);
                }
            }
        }
    }
}

/// Device used by the application when nothing is injected.
#[cfg(feature = "camera")]
pub fn default_camera(index_override: Option<u32>) -> Box<dyn CameraDevice> {
    Box::new(NokhwaCamera::new(index_override))
}

#[cfg(not(feature = "camera"))]
pub fn default_camera(_index_override: Option<u32>) -> Box<dyn CameraDevice> {
    Box::new(UnavailableCamera)
}

impl<T: CameraDevice + ?Sized> CameraDevice for Box<T> {
    fn open(&mut self, facing: CameraFacing) -> Result<(), DeviceError> {
        (**self).open(facing)
    }

    fn grab_frame(&mut self) -> Result<RgbImage, DeviceError> {
        (**self).grab_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefers_rear_camera_for_environment() {
        let devices = names(&["FaceTime HD Camera", "USB Back Camera"]);
        assert_eq!(pick_device(&devices, CameraFacing::Environment), Some(1));
    }

    #[test]
    fn prefers_front_camera_for_user() {
        let devices = names(&["Rear Camera", "Integrated Webcam"]);
        assert_eq!(pick_device(&devices, CameraFacing::User), Some(1));
    }

    #[test]
    fn falls_back_to_first_device() {
        let devices = names(&["Logitech C920"]);
        assert_eq!(pick_device(&devices, CameraFacing::Environment), Some(0));
    }

    #[test]
    fn no_devices_means_no_pick() {
        assert_eq!(pick_device(&[], CameraFacing::Environment), None);
    }

    #[test]
    fn unavailable_camera_never_opens() {
        let mut camera = UnavailableCamera;
        assert!(matches!(
            camera.open(CameraFacing::Environment),
            Err(DeviceError::DeviceUnavailable(_))
        ));
    }
}
