//! turnstile-hw: V4L2 camera capture and the RFID reader serial line.

pub mod camera;
pub mod capture;
pub mod frame;
pub mod serial;

pub use camera::{Camera, CameraError, PixelFormat};
pub use capture::{CaptureError, CaptureService, FrameSource, RetryPolicy};
pub use frame::Frame;
pub use serial::{CardReader, LineReader, LineSource, SerialError};
