//! Raw input devices on the event loop
//!
//! Every matching device node is opened non-blocking and registered as a
//! level-triggered calloop source. Readable sources are drained of whole
//! records; key records are translated and queued for the application.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use log::{debug, info, trace, warn};
use thiserror::Error;

use super::evdev::{EventClass, RawInputEvent, RECORD_SIZE};
use super::events::{AppEvent, EventQueue};
use super::keyboard::{CompileError, KeymapTranslator};
use crate::config::KeyboardConfig;

/// Records read per `read` call
const READ_BATCH: usize = 64;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Keymap(#[from] CompileError),
    #[error("failed to enumerate input devices: {0}")]
    Enumerate(#[source] io::Error),
    #[error("no input devices found")]
    NoDevices,
    #[error("none of {0} input device(s) could be opened")]
    NoneOpened(usize),
    #[error("failed to register {path} with the event loop: {source}")]
    Register {
        path: String,
        #[source]
        source: calloop::Error,
    },
}

struct Shared {
    translator: RefCell<KeymapTranslator>,
    queue: EventQueue,
    devices: RefCell<BTreeMap<PathBuf, RegistrationToken>>,
}

impl Shared {
    /// Read everything currently available. `Err` means the device is gone.
    fn drain(&self, file: &mut File) -> io::Result<()> {
        let mut buf = [0u8; RECORD_SIZE * READ_BATCH];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n % RECORD_SIZE != 0 {
                trace!("Dropping {} trailing byte(s)", n % RECORD_SIZE);
            }
            for event in RawInputEvent::decode_all(&buf[..n]) {
                self.dispatch(&event);
            }
        }
    }

    fn dispatch(&self, event: &RawInputEvent) {
        match event.classify() {
            EventClass::Key { code, state } => {
                let key = self
                    .translator
                    .borrow_mut()
                    .translate(code, state, event.timestamp_ms());
                self.queue.push(AppEvent::from(key));
            }
            EventClass::Relative => {
                trace!("Ignoring relative event code {} value {}", event.code, event.value);
            }
            EventClass::Other => {}
        }
    }

    fn forget(&self, path: &Path) {
        self.devices.borrow_mut().remove(path);
    }
}

pub struct InputDeviceMonitor<S: 'static> {
    handle: LoopHandle<'static, S>,
    shared: Rc<Shared>,
}

impl<S: 'static> InputDeviceMonitor<S> {
    pub fn new(handle: LoopHandle<'static, S>, translator: KeymapTranslator, queue: EventQueue) -> Self {
        Self {
            handle,
            shared: Rc::new(Shared {
                translator: RefCell::new(translator),
                queue,
                devices: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Compile the configured keymap and create the monitor
    pub fn with_keymap(
        handle: LoopHandle<'static, S>,
        keyboard: &KeyboardConfig,
        queue: EventQueue,
    ) -> Result<Self, SetupError> {
        let translator = KeymapTranslator::from_config(keyboard)?;
        Ok(Self::new(handle, translator, queue))
    }

    /// Open every input device node accepted by `predicate`
    ///
    /// Devices that fail to open are skipped. Fails if nothing matched or
    /// nothing could be opened.
    pub fn start<P>(&mut self, predicate: P) -> Result<usize, SetupError>
    where
        P: Fn(&Path) -> bool,
    {
        let nodes: Vec<PathBuf> = discover_device_nodes()
            .map_err(SetupError::Enumerate)?
            .into_iter()
            .filter(|p| predicate(p.as_path()))
            .collect();
        if nodes.is_empty() {
            return Err(SetupError::NoDevices);
        }

        let mut opened = 0;
        for path in &nodes {
            let file = match OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(f) => f,
                Err(e) => {
                    warn!("Cannot open input device {}: {}", path.display(), e);
                    continue;
                }
            };
            self.attach(path.clone(), file)?;
            opened += 1;
        }

        if opened == 0 {
            return Err(SetupError::NoneOpened(nodes.len()));
        }
        info!("Input: {} of {} device(s) opened", opened, nodes.len());
        Ok(opened)
    }

    /// Register an already opened, non-blocking device
    pub fn attach(&mut self, path: PathBuf, file: File) -> Result<(), SetupError> {
        let shared = Rc::clone(&self.shared);
        let source_path = path.clone();

        let token = self
            .handle
            .insert_source(
                Generic::new(file, Interest::READ, Mode::Level),
                move |readiness, source, _| {
                    if readiness.error {
                        warn!("Input device {} reported an error, closing", source_path.display());
                        shared.forget(&source_path);
                        return Ok(PostAction::Remove);
                    }
                    // SAFETY: the file is only read, never replaced or closed here
                    let file = unsafe { source.get_mut() };
                    match shared.drain(file) {
                        Ok(()) => Ok(PostAction::Continue),
                        Err(e) => {
                            warn!("Input device {} closed: {}", source_path.display(), e);
                            shared.forget(&source_path);
                            Ok(PostAction::Remove)
                        }
                    }
                },
            )
            .map_err(|e| SetupError::Register {
                path: path.display().to_string(),
                source: e.error,
            })?;

        debug!("Input device registered: {}", path.display());
        if let Some(old) = self.shared.devices.borrow_mut().insert(path, token) {
            self.handle.remove(old);
        }
        Ok(())
    }

    /// Unregister and close every device
    pub fn stop(&mut self) {
        let devices = std::mem::take(&mut *self.shared.devices.borrow_mut());
        let count = devices.len();
        for (_, token) in devices {
            self.handle.remove(token);
        }
        if count > 0 {
            info!("Input: {} device(s) closed", count);
        }
    }

    pub fn device_count(&self) -> usize {
        self.shared.devices.borrow().len()
    }

    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.shared.devices.borrow().keys().cloned().collect()
    }
}

impl<S: 'static> Drop for InputDeviceMonitor<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Device nodes of everything in the "input" subsystem
fn discover_device_nodes() -> io::Result<Vec<PathBuf>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("input")?;
    let nodes: Vec<PathBuf> = enumerator
        .scan_devices()?
        .filter_map(|d| d.devnode().map(Path::to_path_buf))
        .collect();
    for node in &nodes {
        debug!("Input device node: {}", node.display());
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{EV_KEY, EV_REL, EV_SYN, REL_WHEEL};
    use crate::input::keyboard::tests::{translator, KEY_A, KEY_LEFTCTRL};
    use calloop::EventLoop;
    use std::io::Write;
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn record(kind: u16, code: u16, value: i32) -> Vec<u8> {
        RawInputEvent {
            tv_sec: 12,
            tv_usec: 345_000,
            kind,
            code,
            value,
        }
        .encode()
    }

    /// Device stand-in: the monitor reads one end, the test writes the other
    fn fake_device() -> (File, UnixStream) {
        let (reader, writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        (File::from(OwnedFd::from(reader)), writer)
    }

    fn setup() -> (EventLoop<'static, ()>, InputDeviceMonitor<()>, EventQueue) {
        let event_loop = EventLoop::try_new().unwrap();
        let queue = EventQueue::new();
        let monitor = InputDeviceMonitor::new(event_loop.handle(), translator(), queue.clone());
        (event_loop, monitor, queue)
    }

    fn pump(event_loop: &mut EventLoop<'static, ()>) {
        event_loop
            .dispatch(Some(Duration::from_millis(20)), &mut ())
            .unwrap();
    }

    #[test]
    fn test_key_records_become_events() {
        let (mut event_loop, mut monitor, queue) = setup();
        let (file, mut writer) = fake_device();
        monitor.attach(PathBuf::from("/dev/input/event3"), file).unwrap();

        let mut bytes = record(EV_KEY, KEY_LEFTCTRL as u16, 1);
        bytes.extend(record(EV_SYN, 0, 0));
        bytes.extend(record(EV_REL, REL_WHEEL, -1));
        bytes.extend(record(EV_KEY, KEY_A as u16, 1));
        bytes.extend(record(EV_KEY, KEY_A as u16, 0));
        writer.write_all(&bytes).unwrap();
        pump(&mut event_loop);

        let events = queue.drain();
        assert_eq!(events.len(), 3);
        match &events[1] {
            AppEvent::KeyDown(key) => {
                assert_eq!(key.symbolic_name, "a");
                assert!(key.ctrl());
                assert_eq!(key.timestamp, 12_345);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[2], AppEvent::KeyUp(_)));
    }

    #[test]
    fn test_partial_record_discarded() {
        let (mut event_loop, mut monitor, queue) = setup();
        let (file, mut writer) = fake_device();
        monitor.attach(PathBuf::from("/dev/input/event3"), file).unwrap();

        let mut bytes = record(EV_KEY, KEY_A as u16, 1);
        bytes.extend_from_slice(&record(EV_KEY, KEY_A as u16, 0)[..RECORD_SIZE / 2]);
        writer.write_all(&bytes).unwrap();
        pump(&mut event_loop);

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AppEvent::KeyDown(_)));
        assert_eq!(monitor.device_count(), 1);
    }

    #[test]
    fn test_closed_device_is_removed() {
        let (mut event_loop, mut monitor, queue) = setup();
        let (first, writer) = fake_device();
        let (second, _keep) = fake_device();
        monitor.attach(PathBuf::from("/dev/input/event1"), first).unwrap();
        monitor.attach(PathBuf::from("/dev/input/event2"), second).unwrap();
        assert_eq!(monitor.device_count(), 2);

        drop(writer);
        pump(&mut event_loop);

        assert_eq!(monitor.device_paths(), vec![PathBuf::from("/dev/input/event2")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_unregisters_everything() {
        let (mut event_loop, mut monitor, queue) = setup();
        let (file, mut writer) = fake_device();
        monitor.attach(PathBuf::from("/dev/input/event3"), file).unwrap();

        monitor.stop();
        assert_eq!(monitor.device_count(), 0);

        // The read end is closed, so the write fails or goes nowhere
        let _ = writer.write_all(&record(EV_KEY, KEY_A as u16, 1));
        pump(&mut event_loop);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_keymap_failure_is_setup_error() {
        let event_loop: EventLoop<'static, ()> = EventLoop::try_new().unwrap();
        let keyboard = KeyboardConfig {
            keymap_file: Some("/nonexistent/keymap.xkb".to_string()),
            ..KeyboardConfig::default()
        };

        let result = InputDeviceMonitor::with_keymap(event_loop.handle(), &keyboard, EventQueue::new());
        assert!(matches!(
            result,
            Err(SetupError::Keymap(CompileError::Read { .. }))
        ));
    }

    #[test]
    #[ignore] // Requires readable /dev/input/event* nodes
    fn test_start_on_real_devices() {
        let (_event_loop, mut monitor, _queue) = setup();
        let opened = monitor
            .start(|p| p.to_string_lossy().starts_with("/dev/input/event"))
            .unwrap();
        assert_eq!(opened, monitor.device_count());
    }
}
