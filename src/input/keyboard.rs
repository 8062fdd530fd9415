//! Keyboard translation via xkbcommon
//!
//! The keymap is compiled once; the xkb state then tracks every key
//! transition so that modifiers are always current.

use std::path::Path;

use log::{debug, info};
use thiserror::Error;
use xkbcommon::xkb;

use super::events::{KeyEvent, Modifiers};
use super::evdev::KeyState;
use crate::config::KeyboardConfig;
use crate::constants::EVDEV_XKB_OFFSET;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(
        "failed to compile xkb keymap (rules={rules:?}, model={model:?}, layout={layout:?}, variant={variant:?}, options={options:?})"
    )]
    Names {
        rules: String,
        model: String,
        layout: String,
        variant: String,
        options: Option<String>,
    },
    #[error("failed to read keymap file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compile keymap text from {0}")]
    Text(String),
}

pub struct KeymapTranslator {
    state: xkb::State,
    ctrl: xkb::ModIndex,
    alt: xkb::ModIndex,
    shift: xkb::ModIndex,
}

impl KeymapTranslator {
    /// Compile a keymap from RMLVO names. Empty strings select the library
    /// defaults.
    pub fn compile(
        rules: &str,
        model: &str,
        layout: &str,
        variant: &str,
        options: Option<&str>,
    ) -> Result<Self, CompileError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let options = options.filter(|o| !o.is_empty()).map(str::to_string);

        let keymap = xkb::Keymap::new_from_names(
            &context,
            rules,
            model,
            layout,
            variant,
            options.clone(),
            xkb::COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| CompileError::Names {
            rules: rules.to_string(),
            model: model.to_string(),
            layout: layout.to_string(),
            variant: variant.to_string(),
            options,
        })?;

        info!(
            "xkb keymap compiled (layout={})",
            if layout.is_empty() { "default" } else { layout }
        );
        Ok(Self::from_keymap(keymap))
    }

    /// Compile a keymap from its text form
    pub fn from_string(text: &str) -> Result<Self, CompileError> {
        Self::compile_text(text, "inline string")
    }

    /// Compile a keymap file in text format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CompileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CompileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let translator = Self::compile_text(&text, &path.display().to_string())?;
        info!("xkb keymap loaded from {}", path.display());
        Ok(translator)
    }

    /// Keymap file if configured, otherwise RMLVO names
    pub fn from_config(config: &KeyboardConfig) -> Result<Self, CompileError> {
        match config.keymap_file.as_deref() {
            Some(path) if !path.is_empty() => Self::from_file(path),
            _ => Self::compile(
                &config.xkb_rules,
                &config.xkb_model,
                &config.xkb_layout,
                &config.xkb_variant,
                Some(config.xkb_options.as_str()),
            ),
        }
    }

    fn compile_text(text: &str, origin: &str) -> Result<Self, CompileError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            text.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| CompileError::Text(origin.to_string()))?;
        Ok(Self::from_keymap(keymap))
    }

    fn from_keymap(keymap: xkb::Keymap) -> Self {
        let ctrl = keymap.mod_get_index(xkb::MOD_NAME_CTRL);
        let alt = keymap.mod_get_index(xkb::MOD_NAME_ALT);
        let shift = keymap.mod_get_index(xkb::MOD_NAME_SHIFT);
        debug!("xkb modifier indices: ctrl={}, alt={}, shift={}", ctrl, alt, shift);
        Self {
            state: xkb::State::new(&keymap),
            ctrl,
            alt,
            shift,
        }
    }

    /// Translate one raw key transition
    ///
    /// Press and release update the modifier state before the key is looked
    /// up; auto-repeat leaves it untouched.
    pub fn translate(&mut self, keycode: u32, key_state: KeyState, timestamp: u64) -> KeyEvent {
        let xkb_keycode = xkb::Keycode::new(keycode + EVDEV_XKB_OFFSET);

        match key_state {
            KeyState::Pressed => {
                self.state.update_key(xkb_keycode, xkb::KeyDirection::Down);
            }
            KeyState::Released => {
                self.state.update_key(xkb_keycode, xkb::KeyDirection::Up);
            }
            KeyState::Repeated => {}
        }

        let sym = self.state.key_get_one_sym(xkb_keycode);
        let event = KeyEvent {
            keycode,
            symbolic_name: xkb::keysym_get_name(sym),
            text: self.state.key_get_utf8(xkb_keycode),
            modifiers: self.modifiers(),
            pressed: key_state != KeyState::Released,
            repeat: key_state == KeyState::Repeated,
            timestamp,
        };
        debug!(
            "key {} {:?}: {} {:?} {:?}",
            keycode, key_state, event.symbolic_name, event.text, event.modifiers
        );
        event
    }

    /// Depressed and latched modifiers
    pub fn modifiers(&self) -> Modifiers {
        let mask = self
            .state
            .serialize_mods(xkb::STATE_MODS_DEPRESSED | xkb::STATE_MODS_LATCHED);
        let has = |index: xkb::ModIndex| index < 32 && mask & (1 << index) != 0;

        let mut mods = Modifiers::empty();
        mods.set(Modifiers::CONTROL, has(self.ctrl));
        mods.set(Modifiers::ALT, has(self.alt));
        mods.set(Modifiers::SHIFT, has(self.shift));
        mods
    }
}
