//! Blocking wait for a required platform device
//!
//! The udev monitor is opened before the existing devices are scanned, so a
//! device that appears in between is still reported by the monitor.

use std::ffi::OsStr;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("failed to create device monitor: {0}")]
    Monitor(#[source] io::Error),
    #[error("device monitor I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("device did not appear within {0:?}")]
    Timeout(Duration),
}

/// What the predicate looks at for one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub devpath: String,
    pub modalias: Option<String>,
}

/// One device change reported by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: String,
    pub device: DeviceRecord,
}

/// Device enumeration plus change notifications for one subsystem
pub trait DeviceSource {
    /// Devices present right now
    fn enumerate(&mut self) -> io::Result<Vec<DeviceRecord>>;

    /// Block until the next event. `Ok(None)` means `timeout` elapsed.
    fn next_event(&mut self, timeout: Option<Duration>) -> io::Result<Option<DeviceEvent>>;
}

/// Substring predicate: a device matches if either pattern is found
#[derive(Debug, Clone, Default)]
pub struct DeviceMatch {
    pub devpath: Option<String>,
    pub modalias: Option<String>,
}

impl DeviceMatch {
    /// Empty patterns are treated as absent
    pub fn new(devpath: Option<&str>, modalias: Option<&str>) -> Self {
        let pattern = |p: Option<&str>| p.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            devpath: pattern(devpath),
            modalias: pattern(modalias),
        }
    }

    pub fn matches(&self, device: &DeviceRecord) -> bool {
        let path_hit = self
            .devpath
            .as_deref()
            .is_some_and(|p| device.devpath.contains(p));
        let alias_hit = match (self.modalias.as_deref(), device.modalias.as_deref()) {
            (Some(p), Some(alias)) => alias.contains(p),
            _ => false,
        };
        path_hit || alias_hit
    }
}

/// How the device was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Already there at startup
    Present,
    /// Reported by the monitor; the grace period has been waited out
    Arrived,
}

pub struct DeviceWaiter {
    grace: Duration,
    timeout: Option<Duration>,
}

impl DeviceWaiter {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            timeout: None,
        }
    }

    /// Give up after `timeout`. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until a `subsystem` device whose path contains `path_substring`
    /// or whose module alias contains `alias_substring` exists
    ///
    /// Returns `false` if the udev monitor fails or the timeout runs out.
    pub fn wait_for_device(
        &self,
        subsystem: &str,
        path_substring: Option<&str>,
        alias_substring: Option<&str>,
    ) -> bool {
        let pattern = DeviceMatch::new(path_substring, alias_substring);
        let result =
            UdevSource::open(subsystem).and_then(|mut source| self.wait(&mut source, &pattern));
        match result {
            Ok(found) => {
                debug!("{} device found ({:?})", subsystem, found);
                true
            }
            Err(e) => {
                warn!("Waiting for {} device failed: {}", subsystem, e);
                false
            }
        }
    }

    pub fn wait<S: DeviceSource>(
        &self,
        source: &mut S,
        pattern: &DeviceMatch,
    ) -> Result<Discovery, WaitError> {
        // A failed scan is not fatal; the monitor still reports arrivals
        let present = source.enumerate().unwrap_or_else(|e| {
            warn!("Device scan failed, relying on the monitor: {}", e);
            Vec::new()
        });
        for device in &present {
            debug!("Present: {} ({:?})", device.devpath, device.modalias);
            if pattern.matches(device) {
                info!("Device already present: {}", device.devpath);
                return Ok(Discovery::Present);
            }
        }

        info!("Waiting for device {:?}", pattern);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(WaitError::Timeout(self.timeout.unwrap_or_default()));
                    }
                    Some(left)
                }
                None => None,
            };

            let Some(event) = source.next_event(remaining).map_err(WaitError::Io)? else {
                continue;
            };
            debug!("Device event: {} {}", event.action, event.device.devpath);
            if event.action == "add" && pattern.matches(&event.device) {
                info!(
                    "Device arrived: {}, settling for {:?}",
                    event.device.devpath, self.grace
                );
                thread::sleep(self.grace);
                return Ok(Discovery::Arrived);
            }
        }
    }
}

/// udev-backed [`DeviceSource`]
pub struct UdevSource {
    subsystem: String,
    socket: udev::MonitorSocket,
}

impl UdevSource {
    /// Start monitoring `subsystem`
    pub fn open(subsystem: &str) -> Result<Self, WaitError> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem(subsystem))
            .and_then(|b| b.listen())
            .map_err(WaitError::Monitor)?;

        debug!("udev monitor listening on subsystem {}", subsystem);
        Ok(Self {
            subsystem: subsystem.to_string(),
            socket,
        })
    }
}

fn record_of(device: &udev::Device) -> DeviceRecord {
    DeviceRecord {
        devpath: device.devpath().to_string_lossy().into_owned(),
        modalias: device
            .property_value("MODALIAS")
            .map(|v| v.to_string_lossy().into_owned()),
    }
}

impl DeviceSource for UdevSource {
    fn enumerate(&mut self) -> io::Result<Vec<DeviceRecord>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem(&self.subsystem)?;
        Ok(enumerator.scan_devices()?.map(|d| record_of(&d)).collect())
    }

    fn next_event(&mut self, timeout: Option<Duration>) -> io::Result<Option<DeviceEvent>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(event) = self.socket.iter().next() {
                let action = event
                    .action()
                    .map(OsStr::to_string_lossy)
                    .unwrap_or_default()
                    .into_owned();
                return Ok(Some(DeviceEvent {
                    action,
                    device: record_of(&event),
                }));
            }

            let timeout_ms = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.as_millis().clamp(1, i32::MAX as u128) as libc::c_int
                }
                None => -1,
            };

            // The socket outlives this borrow
            let fd = unsafe { BorrowedFd::borrow_raw(self.socket.as_raw_fd()) };
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!("poll on udev monitor failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed device list and event script
    struct ScriptedSource {
        present: Vec<DeviceRecord>,
        events: VecDeque<DeviceEvent>,
        delivered: usize,
        fail_next: bool,
        fail_scan: bool,
    }

    impl ScriptedSource {
        fn new(present: Vec<DeviceRecord>, events: Vec<DeviceEvent>) -> Self {
            Self {
                present,
                events: events.into(),
                delivered: 0,
                fail_next: false,
                fail_scan: false,
            }
        }
    }

    impl DeviceSource for ScriptedSource {
        fn enumerate(&mut self) -> io::Result<Vec<DeviceRecord>> {
            if self.fail_scan {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            Ok(self.present.clone())
        }

        fn next_event(&mut self, timeout: Option<Duration>) -> io::Result<Option<DeviceEvent>> {
            if self.fail_next {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            match self.events.pop_front() {
                Some(event) => {
                    self.delivered += 1;
                    Ok(Some(event))
                }
                None => {
                    if let Some(t) = timeout {
                        thread::sleep(t);
                    }
                    Ok(None)
                }
            }
        }
    }

    fn dce(devpath: &str) -> DeviceRecord {
        DeviceRecord {
            devpath: devpath.to_string(),
            modalias: Some("rpmsg:rpmsg-dce".to_string()),
        }
    }

    fn other(devpath: &str) -> DeviceRecord {
        DeviceRecord {
            devpath: devpath.to_string(),
            modalias: Some("rpmsg:rpmsg-client-sample".to_string()),
        }
    }

    fn event(action: &str, device: DeviceRecord) -> DeviceEvent {
        DeviceEvent {
            action: action.to_string(),
            device,
        }
    }

    #[test]
    fn test_match_by_path_or_alias() {
        let by_alias = DeviceMatch::new(None, Some("dce"));
        assert!(by_alias.matches(&dce("/devices/virtual/rpmsg0")));
        assert!(!by_alias.matches(&other("/devices/virtual/rpmsg1")));

        let by_path = DeviceMatch::new(Some("rpmsg1"), Some(""));
        assert!(by_path.matches(&other("/devices/virtual/rpmsg1")));
        assert!(by_path.modalias.is_none());

        let nothing = DeviceMatch::new(None, None);
        assert!(!nothing.matches(&dce("/devices/virtual/rpmsg0")));
    }

    #[test]
    fn test_present_device_returns_without_grace() {
        let mut source = ScriptedSource::new(vec![other("/a"), dce("/b")], Vec::new());
        let waiter = DeviceWaiter::new(Duration::from_secs(5));

        let start = Instant::now();
        let found = waiter.wait(&mut source, &DeviceMatch::new(None, Some("dce")));
        assert_eq!(found.unwrap(), Discovery::Present);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(source.delivered, 0);
    }

    #[test]
    fn test_arrival_waits_for_add_and_grace() {
        let mut source = ScriptedSource::new(
            Vec::new(),
            vec![
                event("add", other("/devices/virtual/rpmsg0")),
                event("change", dce("/devices/virtual/rpmsg1")),
                event("add", dce("/devices/virtual/rpmsg2")),
                event("add", dce("/devices/virtual/rpmsg3")),
            ],
        );
        let grace = Duration::from_millis(50);
        let waiter = DeviceWaiter::new(grace);

        let start = Instant::now();
        let found = waiter.wait(&mut source, &DeviceMatch::new(None, Some("dce")));
        assert_eq!(found.unwrap(), Discovery::Arrived);
        assert!(start.elapsed() >= grace);
        // Stopped at the first matching add
        assert_eq!(source.delivered, 3);
        assert_eq!(source.events.len(), 1);
    }

    #[test]
    fn test_failed_scan_still_waits_on_monitor() {
        let mut source = ScriptedSource::new(
            vec![dce("/devices/virtual/rpmsg0")],
            vec![event("add", dce("/devices/virtual/rpmsg1"))],
        );
        source.fail_scan = true;
        let waiter = DeviceWaiter::new(Duration::ZERO);

        let found = waiter.wait(&mut source, &DeviceMatch::new(None, Some("dce")));
        assert_eq!(found.unwrap(), Discovery::Arrived);
        assert_eq!(source.delivered, 1);
    }

    #[test]
    fn test_timeout() {
        let mut source = ScriptedSource::new(vec![other("/a")], Vec::new());
        let waiter = DeviceWaiter::new(Duration::ZERO).with_timeout(Some(Duration::from_millis(20)));

        let result = waiter.wait(&mut source, &DeviceMatch::new(None, Some("dce")));
        assert!(matches!(result, Err(WaitError::Timeout(_))));
    }

    #[test]
    fn test_monitor_error() {
        let mut source = ScriptedSource::new(Vec::new(), Vec::new());
        source.fail_next = true;
        let waiter = DeviceWaiter::new(Duration::ZERO);

        let result = waiter.wait(&mut source, &DeviceMatch::new(None, Some("dce")));
        assert!(matches!(result, Err(WaitError::Io(_))));
    }

    #[test]
    #[ignore] // Requires udev
    fn test_udev_enumerate() {
        let mut source = UdevSource::open("input").unwrap();
        for device in source.enumerate().unwrap() {
            println!("{} {:?}", device.devpath, device.modalias);
        }
    }
}
