//! Raw evdev records
//!
//! `struct input_event` from linux/input.h, decoded field by field:
//! `{ timeval time; __u16 type; __u16 code; __s32 value; }`.

use std::mem::size_of;

use crate::constants::{
    EV_KEY, EV_REL, KEY_VALUE_PRESS, KEY_VALUE_RELEASE, KEY_VALUE_REPEAT,
};

const TIME_FIELD: usize = size_of::<libc::c_long>();

/// Size of one record on this platform (24 bytes on 64-bit)
pub const RECORD_SIZE: usize = 2 * TIME_FIELD + 2 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInputEvent {
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// Key transition carried by an EV_KEY value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released,
    Pressed,
    Repeated,
}

/// Coarse event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Key { code: u32, state: KeyState },
    Relative,
    Other,
}

fn read_long(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; TIME_FIELD];
    buf.copy_from_slice(&bytes[..TIME_FIELD]);
    libc::c_long::from_ne_bytes(buf) as i64
}

impl RawInputEvent {
    /// Decode one record. `bytes` must hold at least [`RECORD_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_SIZE {
            return None;
        }
        let at = 2 * TIME_FIELD;
        Some(Self {
            tv_sec: read_long(&bytes[..TIME_FIELD]),
            tv_usec: read_long(&bytes[TIME_FIELD..at]),
            kind: u16::from_ne_bytes([bytes[at], bytes[at + 1]]),
            code: u16::from_ne_bytes([bytes[at + 2], bytes[at + 3]]),
            value: i32::from_ne_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]]),
        })
    }

    /// Decode every whole record; a trailing partial record is dropped
    pub fn decode_all(bytes: &[u8]) -> impl Iterator<Item = RawInputEvent> + '_ {
        bytes.chunks_exact(RECORD_SIZE).filter_map(Self::decode)
    }

    /// Kernel timestamp in milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        (self.tv_sec as u64)
            .wrapping_mul(1000)
            .wrapping_add(self.tv_usec as u64 / 1000)
    }

    pub fn classify(&self) -> EventClass {
        match self.kind {
            EV_KEY => {
                let state = match self.value {
                    KEY_VALUE_RELEASE => KeyState::Released,
                    KEY_VALUE_PRESS => KeyState::Pressed,
                    KEY_VALUE_REPEAT => KeyState::Repeated,
                    _ => return EventClass::Other,
                };
                EventClass::Key {
                    code: u32::from(self.code),
                    state,
                }
            }
            EV_REL => EventClass::Relative,
            _ => EventClass::Other,
        }
    }

    /// Encode as the kernel would write it
    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        out.extend_from_slice(&(self.tv_sec as libc::c_long).to_ne_bytes());
        out.extend_from_slice(&(self.tv_usec as libc::c_long).to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.code.to_ne_bytes());
        out.extend_from_slice(&self.value.to_ne_bytes());
        out
    }
}
