//! DRM/KMS display management

pub mod device;
pub mod display;
pub mod framebuffer;
pub mod ioctl_helpers;
pub mod kms;
pub mod overlay;
#[cfg(test)]
pub mod testing;

pub use device::Device;
pub use display::{DisplayContext, DisplayError, DisplayResourceManager, PlaneAssignment};
pub use framebuffer::{AllocError, FrameBuffer, FrameBufferPool};
pub use kms::{DisplayMode, KmsDevice};
pub use overlay::{BufferSwapHandler, OverlayCompositor};
