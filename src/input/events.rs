//! Synthesized key events and the consumer queue

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;

bitflags! {
    /// Modifier state at the time of a key event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u8 {
        const CONTROL = 0b001;
        const ALT     = 0b010;
        const SHIFT   = 0b100;
    }
}

/// A translated key transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// evdev keycode (no xkb offset)
    pub keycode: u32,
    /// Keysym name, e.g. "a", "Return", "F1"
    pub symbolic_name: String,
    /// UTF-8 text the key produces; empty for non-printable keys
    pub text: String,
    pub modifiers: Modifiers,
    pub pressed: bool,
    /// Auto-repeat of a held key
    pub repeat: bool,
    /// Kernel event time in milliseconds
    pub timestamp: u64,
}

impl KeyEvent {
    pub fn ctrl(&self) -> bool {
        self.modifiers.contains(Modifiers::CONTROL)
    }

    pub fn alt(&self) -> bool {
        self.modifiers.contains(Modifiers::ALT)
    }

    pub fn shift(&self) -> bool {
        self.modifiers.contains(Modifiers::SHIFT)
    }
}

/// Events posted to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    KeyDown(KeyEvent),
    KeyUp(KeyEvent),
}

impl From<KeyEvent> for AppEvent {
    fn from(event: KeyEvent) -> Self {
        if event.pressed {
            AppEvent::KeyDown(event)
        } else {
            AppEvent::KeyUp(event)
        }
    }
}

/// FIFO shared between event-loop callbacks and the consumer
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    inner: Rc<RefCell<VecDeque<AppEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: AppEvent) {
        self.inner.borrow_mut().push_back(event);
    }

    pub fn pop(&self) -> Option<AppEvent> {
        self.inner.borrow_mut().pop_front()
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<AppEvent> {
        self.inner.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}
