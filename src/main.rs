//! kmsplay - KMS overlay output and raw keyboard input for a console media player
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │      Device wait (udev, co-processor)    │
//! ├──────────────────────────────────────────┤
//! │  DRM/KMS: connector → CRTC → 2 planes    │
//! │    plane 0: video   plane 1: overlay     │
//! ├──────────────────────────────────────────┤
//! │  Event Loop (calloop)                    │
//! │    evdev → xkb → EventQueue → bindings   │
//! └──────────────────────────────────────────┘
//! ```

mod config;
mod constants;
mod drm;
mod input;
mod waiter;

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, LoopHandle};
use log::{debug, error, info, warn};

use config::{Config, ParsedKeybinds};
use drm::{BufferSwapHandler, Device, DisplayContext, OverlayCompositor};
use input::{AppEvent, EventQueue, InputDeviceMonitor, KeyEvent};
use waiter::DeviceWaiter;

/// Overlay contents drawn on start (translucent dark grey)
const OVERLAY_FILL: u32 = 0x8020_2020;

/// Upper bound for one event loop dispatch
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Event loop state
struct App {
    handle: LoopHandle<'static, App>,
    queue: EventQueue,
    overlay: OverlayCompositor<Device>,
    kb_toggle: ParsedKeybinds,
    kb_quit: ParsedKeybinds,
    auto_hide: Option<Duration>,
    running: bool,
}

fn overlay_of(app: &mut App) -> &mut OverlayCompositor<Device> {
    &mut app.overlay
}

impl App {
    /// Consume queued key events
    fn process_events(&mut self) {
        while let Some(event) = self.queue.pop() {
            match event {
                AppEvent::KeyDown(key) => self.handle_key_down(&key),
                AppEvent::KeyUp(key) => {
                    debug!("KeyUp {} (keycode {})", key.symbolic_name, key.keycode);
                }
            }
            if !self.running {
                break;
            }
        }
    }

    fn handle_key_down(&mut self, key: &KeyEvent) {
        if self.kb_quit.matches(key) {
            info!("Quit requested by {}", key.symbolic_name);
            self.running = false;
            return;
        }

        if self.kb_toggle.matches(key) {
            if key.repeat {
                return;
            }
            self.toggle_overlay();
            return;
        }

        debug!(
            "KeyDown {} {:?} mods={:?}{}",
            key.symbolic_name,
            key.text,
            key.modifiers,
            if key.repeat { " (repeat)" } else { "" }
        );
    }

    fn toggle_overlay(&mut self) {
        let result = match self.auto_hide {
            Some(timeout) if !self.overlay.is_visible() => {
                self.overlay
                    .show_transient(&self.handle, timeout, overlay_of)
            }
            _ => self.overlay.toggle(),
        };
        match result {
            Ok(()) => info!("Overlay {}", if self.overlay.is_visible() { "shown" } else { "hidden" }),
            Err(e) => warn!("Overlay toggle failed: {}", e),
        }
    }
}

/// Print help message
fn print_help() {
    println!(
        r#"kmsplay {} - KMS overlay output and keyboard input core

USAGE:
    kmsplay [OPTIONS]

OPTIONS:
    -h, --help              Print this help message
    -V, --version           Print version information
    -c, --config <PATH>     Use this config file instead of the search path

CONFIG SEARCH ORDER:
    $KMSPLAY_CONFIG
    ~/.config/kmsplay/config.toml
    /etc/kmsplay/config.toml

ENVIRONMENT:
    RUST_LOG                Log filter (default: info)"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Block until the co-processor device shows up (if enabled)
fn wait_for_coprocessor(config: &config::DeviceWaitConfig) {
    if !config.enabled {
        debug!("Device wait disabled");
        return;
    }

    let waiter = DeviceWaiter::new(config.grace()).with_timeout(config.timeout());
    info!(
        "Waiting for {} device (path={:?}, alias={:?})",
        config.subsystem, config.devpath, config.modalias
    );
    if waiter.wait_for_device(
        &config.subsystem,
        Some(config.devpath.as_str()),
        Some(config.modalias.as_str()),
    ) {
        info!("{} device ready", config.subsystem);
    } else {
        warn!("Continuing without {} device", config.subsystem);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Check command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --help
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // --version
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("kmsplay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    info!("kmsplay starting...");

    // --config <PATH> bypasses the search path
    let config_arg = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .map(|i| args.get(i + 1).context("--config needs a path"))
        .transpose()?;
    let cfg = match config_arg {
        Some(path) => Config::load_from_file(Path::new(path))?,
        None => Config::load(),
    };

    // Phase 1: co-processor
    wait_for_coprocessor(&cfg.device_wait);

    // Phase 2: display pipeline
    let device = Rc::new(
        Device::open(&cfg.display.device)
            .with_context(|| format!("Failed to open {}", cfg.display.device))?,
    );
    let mut display =
        DisplayContext::setup(Rc::clone(&device)).context("Failed to set up display")?;
    info!(
        "Display {}x{}@{} on CRTC {}, video plane {}",
        display.mode().width,
        display.mode().height,
        display.mode().vrefresh,
        display.crtc(),
        display.video_plane()
    );

    let mut overlay = OverlayCompositor::new(display.pool(), display.mode(), display.planes())
        .context("Failed to allocate overlay buffers")?;
    let first_frame = overlay.back_buffer_mut().map(|fb| {
        debug!(
            "Overlay buffer {}x{}, pitch {}",
            fb.width(),
            fb.height(),
            fb.pitch()
        );
        fb.fill(OVERLAY_FILL);
        fb.as_ptr()
    });
    if let Some(frame) = first_frame {
        overlay.on_buffer_swap_requested(frame);
        debug!("Overlay scan-out buffer: {}", overlay.current_buffer());
    }
    if cfg.display.show_overlay_on_start {
        if let Err(e) = overlay.show() {
            warn!("Initial overlay show failed: {}", e);
        }
    }

    // Phase 3: event loop and input
    let mut event_loop: EventLoop<'static, App> =
        EventLoop::try_new().context("Failed to create event loop")?;
    let handle = event_loop.handle();
    let queue = EventQueue::new();

    let mut monitor = InputDeviceMonitor::with_keymap(handle.clone(), &cfg.keyboard, queue.clone())
        .context("Failed to set up keyboard")?;
    let input_config = cfg.input.clone();
    monitor
        .start(move |node| input_config.accepts(node))
        .context("Failed to open input devices")?;
    for path in monitor.device_paths() {
        debug!("Input device: {}", path.display());
    }

    // SIGTERM (systemd stop) and SIGINT end the loop
    let signals = Signals::new(&[Signal::SIGTERM, Signal::SIGINT])
        .context("Failed to block termination signals")?;
    handle
        .insert_source(signals, |event, _, app: &mut App| {
            info!("Received {:?}, shutting down gracefully...", event.signal());
            app.running = false;
        })
        .map_err(|e| e.error)
        .context("Failed to register signal source")?;

    let mut app = App {
        handle,
        queue,
        overlay,
        kb_toggle: ParsedKeybinds::parse(&cfg.keybinds.toggle_overlay),
        kb_quit: ParsedKeybinds::parse(&cfg.keybinds.quit),
        auto_hide: cfg.overlay.auto_hide(),
        running: true,
    };

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
    info!("Ready ({} input device(s))", monitor.device_count());

    let mut input_lost = false;
    while app.running {
        if let Err(e) = event_loop.dispatch(Some(DISPATCH_TIMEOUT), &mut app) {
            error!("Event loop dispatch failed: {}", e);
            break;
        }
        app.process_events();

        if monitor.device_count() == 0 && !input_lost {
            warn!("All input devices are gone");
            input_lost = true;
        }
    }

    // Teardown: input, overlay plane, overlay buffers, background buffer
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
    monitor.stop();
    app.overlay.teardown();
    display.teardown();
    info!("kmsplay stopped");

    Ok(())
}
