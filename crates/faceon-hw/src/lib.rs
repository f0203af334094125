//! faceon-hw: frame input and output for the render loop.
//!
//! Provides V4L2-based camera capture (converted to BGR) and a raw BGRA
//! writer suitable for a FIFO or a v4l2loopback node.

pub mod camera;
pub mod frame;
pub mod sink;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;
pub use sink::{OutputSink, RawVideoSink, SinkError};
