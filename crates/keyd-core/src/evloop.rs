// Keyd Event Source
// Unified poll over device fds, the udev monitor, extra fds and the timer

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::device::{Device, DeviceEvent};

/// One event out of the unified source.
#[derive(Debug)]
pub enum Event {
    /// The previously requested delay expired.
    Timeout,
    /// A device identified by its fd produced a raw event. `timeleft` is
    /// the remaining millisecond count of any in-flight timeout.
    Device {
        fd: RawFd,
        ev: DeviceEvent,
        timeleft: u64,
    },
    /// A hotplugged device was opened; the handler decides whether to
    /// track it.
    DeviceAdded(Device),
    /// A tracked device disappeared (udev remove or poll error).
    DeviceRemoved { fd: RawFd },
    /// An externally registered descriptor is readable.
    FdActivity { fd: RawFd },
}

/// Blocking event source. Owns timer arming: the value the handler returns
/// for each event replaces any pending timeout, with 0 meaning "none".
pub struct EventLoop {
    monitor: udev::MonitorSocket,
    extra_fds: Vec<RawFd>,
    pending: VecDeque<Event>,
    deadline: Option<Instant>,
}

impl EventLoop {
    /// Create the source and queue a `DeviceAdded` for every input device
    /// already present.
    pub fn new() -> io::Result<Self> {
        let monitor = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("input"))
            .and_then(|b| b.listen())?;

        let mut pending = VecDeque::new();
        for (path, raw) in evdev::enumerate() {
            if let Some(dev) = Device::from_evdev(path, raw) {
                pending.push_back(Event::DeviceAdded(dev));
            }
        }

        Ok(Self {
            monitor,
            extra_fds: Vec::new(),
            pending,
            deadline: None,
        })
    }

    /// Register an external descriptor (the IPC socket) for readability
    /// notifications.
    pub fn add_fd(&mut self, fd: RawFd) {
        self.extra_fds.push(fd);
    }

    /// Block until the next event.
    ///
    /// `rearm` is `Some(ms)` to replace the pending timeout with a new one
    /// (0 disarms it) and `None` to leave it running. Returns `Ok(None)`
    /// when interrupted by a signal or when a poll cycle produced nothing
    /// usable; the caller just calls again.
    pub fn wait(&mut self, devices: &mut [Device], rearm: Option<u64>) -> io::Result<Option<Event>> {
        if let Some(ms) = rearm {
            self.deadline = if ms > 0 {
                Some(Instant::now() + Duration::from_millis(ms))
            } else {
                None
            };
        }

        if let Some(ev) = self.pop_pending() {
            return Ok(Some(ev));
        }

        // Poll set layout: monitor, extra fds, then one slot per device.
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.extra_fds.len() + devices.len());
        fds.push(pollfd(self.monitor.as_raw_fd()));
        for fd in &self.extra_fds {
            fds.push(pollfd(*fd));
        }
        let device_base = fds.len();
        for dev in devices.iter() {
            fds.push(pollfd(dev.fd()));
        }

        let timeout = match self.deadline {
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }
        if n == 0 {
            self.deadline = None;
            return Ok(Some(Event::Timeout));
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.drain_udev(devices);
        }

        for (i, fd) in self.extra_fds.iter().enumerate() {
            if fds[1 + i].revents & libc::POLLIN != 0 {
                self.pending.push_back(Event::FdActivity { fd: *fd });
            }
        }

        const GONE: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        for (i, dev) in devices.iter_mut().enumerate() {
            let revents = fds[device_base + i].revents;

            if revents & GONE != 0 {
                self.pending.push_back(Event::DeviceRemoved { fd: dev.fd() });
                continue;
            }

            if revents & libc::POLLIN != 0 {
                match dev.fetch() {
                    Ok(events) => {
                        let fd = dev.fd();
                        for ev in events {
                            self.pending.push_back(Event::Device {
                                fd,
                                ev,
                                timeleft: 0,
                            });
                        }
                    }
                    Err(e) => {
                        log::warn!("read failed on {}: {}", dev.name(), e);
                        self.pending.push_back(Event::DeviceRemoved { fd: dev.fd() });
                    }
                }
            }
        }

        Ok(self.pop_pending())
    }

    fn pop_pending(&mut self) -> Option<Event> {
        let mut ev = self.pending.pop_front()?;
        // timeleft reflects the deadline at delivery, not queueing, time.
        if let Event::Device { timeleft, .. } = &mut ev {
            *timeleft = self.remaining_ms();
        }
        Some(ev)
    }

    fn remaining_ms(&self) -> u64 {
        match self.deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => 0,
        }
    }

    fn drain_udev(&mut self, devices: &[Device]) {
        let mut added: Vec<std::path::PathBuf> = Vec::new();
        let mut removed: Vec<std::path::PathBuf> = Vec::new();

        for event in self.monitor.iter() {
            let Some(node) = event.devnode() else { continue };
            if !node.to_string_lossy().starts_with("/dev/input/event") {
                continue;
            }
            match event.event_type() {
                udev::EventType::Add => added.push(node.to_path_buf()),
                udev::EventType::Remove => removed.push(node.to_path_buf()),
                _ => {}
            }
        }

        for node in added {
            if devices.iter().any(|d| d.path() == node.as_path()) {
                continue;
            }
            if let Some(dev) = Device::open(&node) {
                self.pending.push_back(Event::DeviceAdded(dev));
            }
        }

        for node in removed {
            if let Some(dev) = devices.iter().find(|d| d.path() == node.as_path()) {
                self.pending.push_back(Event::DeviceRemoved { fd: dev.fd() });
            }
        }
    }
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}
