// Re-export all camera components
pub mod device;
pub mod frame;

pub use device::{default_camera, pick_device, CameraDevice, CameraFacing, DeviceError};
pub use frame::{encode_jpeg, mime_for_path, EncodedImage, ImageSource};

/// Lossy quality used for still frames unless settings override it.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
