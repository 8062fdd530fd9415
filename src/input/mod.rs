//! Input handling
//!
//! Raw evdev records from /dev/input/event* are translated with xkbcommon
//! and queued as key events for the application.

pub mod evdev;
pub mod events;
pub mod keyboard;
pub mod monitor;

pub use events::{AppEvent, EventQueue, KeyEvent};
pub use monitor::InputDeviceMonitor;
