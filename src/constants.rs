//! Global constants for kmsplay
//!
//! Consolidates timing defaults, kernel interface numbers and keymap
//! constants to eliminate magic numbers throughout the codebase.

#![allow(dead_code)]

// ============================================================================
// Timing Constants
// ============================================================================

/// Settle time after a waited-for device shows up via the monitor (ms).
/// The add event does not mean the driver behind it is ready yet.
pub const DEVICE_GRACE_MS: u64 = 1000;

/// Overlay auto-hide delay after a transient show (ms)
pub const OVERLAY_AUTO_HIDE_MS: u64 = 3000;

// ============================================================================
// Pixel Format
// ============================================================================

/// DRM_FORMAT_ARGB8888 ('A', 'R', '2', '4')
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b'A', b'R', b'2', b'4');

/// Bytes per ARGB8888 pixel
pub const BYTES_PER_PIXEL: u32 = 4;

/// Build a little-endian fourcc code
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

// ============================================================================
// Input Event Types (linux/input-event-codes.h)
// ============================================================================

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;

/// Vertical wheel
pub const REL_WHEEL: u16 = 0x08;

/// Key value: released
pub const KEY_VALUE_RELEASE: i32 = 0;
/// Key value: pressed
pub const KEY_VALUE_PRESS: i32 = 1;
/// Key value: auto-repeat
pub const KEY_VALUE_REPEAT: i32 = 2;

// ============================================================================
// XKB
// ============================================================================

/// evdev keycode -> xkb keycode offset
pub const EVDEV_XKB_OFFSET: u32 = 8;
