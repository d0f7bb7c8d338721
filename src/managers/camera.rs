use crate::camera_toolkit::{
    encode_jpeg, mime_for_path, CameraDevice, CameraFacing, DeviceError, EncodedImage,
    ImageSource,
};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Opaque token for one live stream. Only the manager that issued it can use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub facing: CameraFacing,
    pub jpeg_quality: u8,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Environment,
            jpeg_quality: crate::camera_toolkit::DEFAULT_JPEG_QUALITY,
        }
    }
}

/* ──────────────────────────────────────────────────────────────── */

/// Owns the camera device and hands out at most one live stream at a time.
pub struct CaptureDeviceManager<D: CameraDevice> {
    device: Mutex<D>,
    options: CaptureOptions,
    next_handle_id: AtomicU64,
    active: Mutex<Option<StreamHandle>>,
}

impl<D: CameraDevice> CaptureDeviceManager<D> {
    pub fn new(device: D, options: CaptureOptions) -> Self {
        Self {
            device: Mutex::new(device),
            options,
            next_handle_id: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    /* ---------- live stream life-cycle ------------------------------------- */

    pub fn start_live_capture(&self) -> Result<StreamHandle, DeviceError> {
        let mut active = lock(&self.active);
        if let Some(handle) = *active {
            return Err(DeviceError::DeviceUnavailable(format!(
                "camera already held by stream {}",
                handle.id()
            )));
        }

        let start_time = Instant::now();
        lock(&self.device).open(self.options.facing)?;

        let handle = StreamHandle(self.next_handle_id.fetch_add(1, Ordering::SeqCst));
        *active = Some(handle);
        info!(
            "Camera stream {} opened in {:?}",
            handle.id(),
            start_time.elapsed()
        );
        Ok(handle)
    }

    pub fn capture_frame(&self, handle: StreamHandle) -> Result<EncodedImage, DeviceError> {
        if *lock(&self.active) != Some(handle) {
            warn!("Frame requested from inactive stream {}", handle.id());
            return Err(DeviceError::InvalidHandle);
        }

        let frame = lock(&self.device).grab_frame()?;
        let still = encode_jpeg(&frame, self.options.jpeg_quality)?;
        debug!(
            "Captured {}x{} frame from stream {} ({} bytes)",
            frame.width(),
            frame.height(),
            handle.id(),
            still.len()
        );
        Ok(still)
    }

    /// Safe to call any number of times; unknown or released handles are ignored.
    pub fn release_stream(&self, handle: StreamHandle) {
        let mut active = lock(&self.active);
        if *active != Some(handle) {
            debug!("Stream {} already released", handle.id());
            return;
        }

        lock(&self.device).close();
        *active = None;
        info!("Camera stream {} released", handle.id());
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.active).is_some()
    }

    /* ---------- file import ------------------------------------------------- */

    pub fn import_from_file(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<EncodedImage, DeviceError> {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if !mime_type.starts_with("image/") {
            return Err(DeviceError::UnsupportedFormat(format!(
                "expected an image file, got '{}'",
                mime_type
            )));
        }
        if bytes.is_empty() {
            return Err(DeviceError::UnsupportedFormat(
                "image file is empty".to_string(),
            ));
        }

        debug!("Imported {} image ({} bytes)", mime_type, bytes.len());
        Ok(EncodedImage::new(bytes, mime_type, ImageSource::File))
    }

    pub async fn import_from_path(&self, path: &Path) -> Result<EncodedImage, DeviceError> {
        let mime_type = mime_for_path(path).ok_or_else(|| {
            DeviceError::UnsupportedFormat(format!("unrecognised file type: {}", path.display()))
        })?;
        // Reject before reading so large non-image files are never loaded.
        if !mime_type.starts_with("image/") {
            return Err(DeviceError::UnsupportedFormat(format!(
                "expected an image file, got '{}'",
                mime_type
            )));
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DeviceError::UnsupportedFormat(format!("Failed to read {}: {}", path.display(), e))
        })?;
        info!("Importing image file: {}", path.display());
        self.import_from_file(bytes, mime_type)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
