//! Configuration file management
//!
//! Loads TOML configuration files and provides application settings.
//! Default config path: ~/.config/kmsplay/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEVICE_GRACE_MS, OVERLAY_AUTO_HIDE_MS};
use crate::input::KeyEvent;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display settings
    pub display: DisplayConfig,
    /// Co-processor wait settings
    pub device_wait: DeviceWaitConfig,
    /// Keyboard layout settings
    pub keyboard: KeyboardConfig,
    /// Input device selection
    pub input: InputConfig,
    /// Overlay settings
    pub overlay: OverlayConfig,
    /// Keybind settings
    pub keybinds: KeybindConfig,
}

/// Display settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Mode-setting device (default: /dev/dri/card0)
    pub device: String,
    /// Show the overlay right after setup
    pub show_overlay_on_start: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device: "/dev/dri/card0".to_string(),
            show_overlay_on_start: true,
        }
    }
}

/// Wait for a platform device before touching the display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceWaitConfig {
    pub enabled: bool,
    /// udev subsystem to watch (default: "rpmsg")
    pub subsystem: String,
    /// Device path substring (empty = unused)
    pub devpath: String,
    /// Module alias substring (default: "dce", empty = unused)
    pub modalias: String,
    /// Settle time after the device appears (ms)
    pub grace_ms: u64,
    /// Give up after this many seconds (0 = wait forever)
    pub timeout_secs: u64,
}

impl Default for DeviceWaitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subsystem: "rpmsg".to_string(),
            devpath: String::new(),
            modalias: "dce".to_string(),
            grace_ms: DEVICE_GRACE_MS,
            timeout_secs: 0,
        }
    }
}

impl DeviceWaitConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Keyboard layout settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    /// XKB rules (empty = default)
    pub xkb_rules: String,
    /// XKB keyboard model (empty = default)
    pub xkb_model: String,
    /// XKB keyboard layout (e.g., "us", "de", empty = default)
    pub xkb_layout: String,
    /// XKB keyboard variant (empty = default)
    pub xkb_variant: String,
    /// XKB keyboard options (e.g., "ctrl:nocaps", empty = default)
    pub xkb_options: String,
    /// Text keymap file; replaces the names above when set
    pub keymap_file: Option<String>,
}

/// Input device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Only device nodes starting with this are opened
    pub devnode_prefix: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            devnode_prefix: "/dev/input/event".to_string(),
        }
    }
}

impl InputConfig {
    pub fn accepts(&self, devnode: &Path) -> bool {
        devnode.to_string_lossy().starts_with(&self.devnode_prefix)
    }
}

/// Overlay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Auto-hide delay after a transient show (ms, 0 = never hide)
    pub auto_hide_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            auto_hide_ms: OVERLAY_AUTO_HIDE_MS,
        }
    }
}

impl OverlayConfig {
    pub fn auto_hide(&self) -> Option<Duration> {
        (self.auto_hide_ms > 0).then(|| Duration::from_millis(self.auto_hide_ms))
    }
}

/// Keybind settings
/// Each keybind can be a single key ("ctrl+q") or multiple keys (["ctrl+q", "escape"])
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeybindConfig {
    /// Toggle overlay (default: "space")
    #[serde(deserialize_with = "deserialize_keybind")]
    pub toggle_overlay: Vec<String>,
    /// Quit (default: "ctrl+alt+end")
    #[serde(deserialize_with = "deserialize_keybind")]
    pub quit: Vec<String>,
}

impl Default for KeybindConfig {
    fn default() -> Self {
        Self {
            toggle_overlay: vec!["space".to_string()],
            quit: vec!["ctrl+alt+end".to_string()],
        }
    }
}

/// Keybind deserializer: accepts string or array
fn deserialize_keybind<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct KeybindVisitor;

    impl<'de> Visitor<'de> for KeybindVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![value.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut keys = Vec::new();
            while let Some(key) = seq.next_element::<String>()? {
                keys.push(key);
            }
            Ok(keys)
        }
    }

    deserializer.deserialize_any(KeybindVisitor)
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/kmsplay/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. KMSPLAY_CONFIG environment variable
        if let Ok(path) = std::env::var("KMSPLAY_CONFIG") {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/kmsplay/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("kmsplay").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config: /etc/kmsplay/config.toml
        let system_config = Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. KMSPLAY_CONFIG environment variable
    /// 2. ~/.config/kmsplay/config.toml (user config)
    /// 3. /etc/kmsplay/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

/// Parse multiple keybindings
#[derive(Debug, Clone, Default)]
pub struct ParsedKeybinds {
    pub bindings: Vec<ParsedKeybind>,
}

impl ParsedKeybinds {
    /// Parse from string array
    pub fn parse(keys: &[String]) -> Self {
        Self {
            bindings: keys.iter().map(|s| ParsedKeybind::parse(s)).collect(),
        }
    }

    /// Check if any keybind matches
    pub fn matches(&self, event: &KeyEvent) -> bool {
        self.bindings.iter().any(|kb| kb.matches(event))
    }
}

/// Parse keybind string
/// Example: "ctrl+alt+end" -> (ctrl: true, alt: true, key: "end")
#[derive(Debug, Clone, Default)]
pub struct ParsedKeybind {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    /// Lowercase keysym name
    pub key: String,
}

impl ParsedKeybind {
    pub fn parse(s: &str) -> Self {
        let lowercase = s.to_lowercase();
        let mut result = Self::default();

        // "+" on its own or after a separator ("ctrl++") is the plus key
        let body = if lowercase == "+" || lowercase.ends_with("++") {
            result.key = "plus".to_string();
            &lowercase[..lowercase.len() - 1]
        } else {
            lowercase.as_str()
        };

        for part in body.split('+') {
            match part.trim() {
                "" => {}
                "ctrl" | "control" => result.ctrl = true,
                "shift" => result.shift = true,
                "alt" => result.alt = true,
                other => result.key = canonical_key_name(other).to_string(),
            }
        }

        result
    }

    /// Check keysym name and exact modifier state
    pub fn matches(&self, event: &KeyEvent) -> bool {
        if self.ctrl != event.ctrl() || self.shift != event.shift() || self.alt != event.alt() {
            return false;
        }
        !self.key.is_empty() && event.symbolic_name.eq_ignore_ascii_case(&self.key)
    }
}

/// Map common spellings to keysym names (lowercase)
fn canonical_key_name(key: &str) -> &str {
    match key {
        "esc" => "escape",
        "enter" => "return",
        "del" => "delete",
        "ins" => "insert",
        "pageup" | "pgup" => "prior",
        "pagedown" | "pgdn" => "next",
        "-" => "minus",
        "=" => "equal",
        " " => "space",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::events::Modifiers;

    fn key(name: &str, modifiers: Modifiers) -> KeyEvent {
        KeyEvent {
            keycode: 0,
            symbolic_name: name.to_string(),
            text: String::new(),
            modifiers,
            pressed: true,
            repeat: false,
            timestamp: 0,
        }
    }

    #[test]
    fn test_parse_keybind() {
        let kb = ParsedKeybind::parse("Ctrl+Alt+End");
        assert!(kb.ctrl);
        assert!(kb.alt);
        assert!(!kb.shift);
        assert_eq!(kb.key, "end");

        assert_eq!(ParsedKeybind::parse("pageup").key, "prior");
    }

    #[test]
    fn test_parse_plus_key() {
        let zoom = ParsedKeybind::parse("ctrl++");
        assert!(zoom.ctrl);
        assert_eq!(zoom.key, "plus");
        assert!(zoom.matches(&key("plus", Modifiers::CONTROL)));

        let bare = ParsedKeybind::parse("+");
        assert!(!bare.ctrl);
        assert_eq!(bare.key, "plus");
    }

    #[test]
    fn test_keybind_needs_exact_modifiers() {
        let quit = ParsedKeybind::parse("ctrl+alt+end");
        assert!(quit.matches(&key("End", Modifiers::CONTROL | Modifiers::ALT)));
        assert!(!quit.matches(&key("End", Modifiers::CONTROL)));
        assert!(!quit.matches(&key(
            "End",
            Modifiers::CONTROL | Modifiers::ALT | Modifiers::SHIFT
        )));
        assert!(!quit.matches(&key("Home", Modifiers::CONTROL | Modifiers::ALT)));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.display.device, "/dev/dri/card0");
        assert_eq!(config.device_wait.modalias, "dce");
        assert!(config.device_wait.timeout().is_none());
        assert_eq!(config.overlay.auto_hide(), Some(Duration::from_millis(3000)));

        let toggle = ParsedKeybinds::parse(&config.keybinds.toggle_overlay);
        assert!(toggle.matches(&key("space", Modifiers::empty())));
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [device_wait]
            enabled = false
            timeout_secs = 5

            [keyboard]
            xkb_layout = "de"

            [overlay]
            auto_hide_ms = 0

            [keybinds]
            quit = ["ctrl+q", "escape"]
            "#,
        )
        .unwrap();

        assert!(!config.device_wait.enabled);
        assert_eq!(config.device_wait.subsystem, "rpmsg");
        assert_eq!(config.device_wait.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.keyboard.xkb_layout, "de");
        assert!(config.overlay.auto_hide().is_none());
        assert_eq!(config.keybinds.quit.len(), 2);
        assert_eq!(config.keybinds.toggle_overlay, vec!["space".to_string()]);
    }

    #[test]
    fn test_input_prefix() {
        let input = InputConfig::default();
        assert!(input.accepts(Path::new("/dev/input/event4")));
        assert!(!input.accepts(Path::new("/dev/input/mouse0")));
    }
}
