// Keyd Device Layer
// Physical input devices: identity, capabilities, exclusive grab

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use evdev::{AbsoluteAxisType, EventType, Key, RelativeAxisType};

use crate::key;

/// What a device can produce, derived from its evdev capability sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub keyboard: bool,
    pub mouse: bool,
    pub mouse_abs: bool,
}

impl Capabilities {
    pub fn pointer(&self) -> bool {
        self.mouse || self.mouse_abs
    }

    fn any(&self) -> bool {
        self.keyboard || self.mouse || self.mouse_abs
    }
}

/// A translated raw event from one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Key { code: u8, pressed: bool },
    MouseMove { dx: i32, dy: i32 },
    MouseMoveAbs { x: i32, y: i32 },
    MouseScroll { dx: i32, dy: i32 },
}

/// One physical input device.
///
/// Created on enumeration or hotplug, destroyed on removal. The binding to
/// a configuration entry (`assoc`) is managed exclusively by the daemon.
pub struct Device {
    path: PathBuf,
    name: String,
    vendor_id: u16,
    product_id: u16,
    caps: Capabilities,
    fd: RawFd,
    handle: Option<evdev::Device>,
    grabbed: bool,

    // Last seen absolute coordinates; evdev reports the axes separately.
    abs_x: i32,
    abs_y: i32,

    /// Index of the owning configuration entry, or `None` for ignored
    /// devices. Rebuilt on every reload.
    pub(crate) assoc: Option<usize>,
}

impl Device {
    /// Open a device node, returning `None` for devices with no useful
    /// capabilities (sensors, switches and the like).
    pub fn open(path: &Path) -> Option<Device> {
        match evdev::Device::open(path) {
            Ok(raw) => Self::from_evdev(path.to_path_buf(), raw),
            Err(e) => {
                log::debug!("could not open {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Wrap an already-open evdev handle.
    pub fn from_evdev(path: PathBuf, raw: evdev::Device) -> Option<Device> {
        let caps = detect_capabilities(&raw);
        if !caps.any() {
            return None;
        }

        let id = raw.input_id();
        let name = raw.name().unwrap_or("unknown device").to_string();
        let fd = raw.as_raw_fd();

        Some(Device {
            path,
            name,
            vendor_id: id.vendor(),
            product_id: id.product(),
            caps,
            fd,
            handle: Some(raw),
            grabbed: false,
            abs_x: 0,
            abs_y: 0,
            assoc: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Packed identity used by configuration matchers.
    pub fn id(&self) -> u32 {
        (self.vendor_id as u32) << 16 | self.product_id as u32
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Stable token identifying this device in event-source events.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    /// Take exclusive ownership of the device's events.
    pub fn grab(&mut self) -> io::Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            if !self.grabbed {
                // A leftover grab from a crashed instance would make the
                // real grab fail with EBUSY.
                let _ = handle.ungrab();
                handle.grab()?;
            }
        }
        self.grabbed = true;
        Ok(())
    }

    pub fn ungrab(&mut self) -> io::Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            if self.grabbed {
                handle.ungrab()?;
            }
        }
        self.grabbed = false;
        Ok(())
    }

    /// Drain and translate everything the device has pending.
    pub fn fetch(&mut self) -> io::Result<Vec<DeviceEvent>> {
        let handle = match self.handle.as_mut() {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for ev in handle.fetch_events()? {
            match ev.event_type() {
                EventType::KEY => {
                    let pressed = match ev.value() {
                        0 => false,
                        1 => true,
                        // Autorepeat is regenerated by the virtual device.
                        _ => continue,
                    };
                    match key::code_from_evdev(ev.code()) {
                        Some(code) => out.push(DeviceEvent::Key { code, pressed }),
                        None => log::debug!("{}: unmappable key code {}", self.name, ev.code()),
                    }
                }
                EventType::RELATIVE => {
                    let code = ev.code();
                    if code == RelativeAxisType::REL_X.0 {
                        out.push(DeviceEvent::MouseMove {
                            dx: ev.value(),
                            dy: 0,
                        });
                    } else if code == RelativeAxisType::REL_Y.0 {
                        out.push(DeviceEvent::MouseMove {
                            dx: 0,
                            dy: ev.value(),
                        });
                    } else if code == RelativeAxisType::REL_WHEEL.0 {
                        out.push(DeviceEvent::MouseScroll {
                            dx: 0,
                            dy: ev.value(),
                        });
                    } else if code == RelativeAxisType::REL_HWHEEL.0 {
                        out.push(DeviceEvent::MouseScroll {
                            dx: ev.value(),
                            dy: 0,
                        });
                    }
                }
                EventType::ABSOLUTE => {
                    let code = ev.code();
                    if code == AbsoluteAxisType::ABS_X.0 {
                        self.abs_x = ev.value();
                    } else if code == AbsoluteAxisType::ABS_Y.0 {
                        self.abs_y = ev.value();
                    } else {
                        continue;
                    }
                    out.push(DeviceEvent::MouseMoveAbs {
                        x: self.abs_x,
                        y: self.abs_y,
                    });
                }
                _ => {}
            }
        }

        Ok(out)
    }

    /// Detached device used by the daemon's unit tests.
    #[cfg(test)]
    pub(crate) fn synthetic(
        name: &str,
        vendor_id: u16,
        product_id: u16,
        caps: Capabilities,
        fd: RawFd,
    ) -> Device {
        Device {
            path: PathBuf::from(format!("/dev/input/{}", name.replace(' ', "-"))),
            name: name.to_string(),
            vendor_id,
            product_id,
            caps,
            fd,
            handle: None,
            grabbed: false,
            abs_x: 0,
            abs_y: 0,
            assoc: None,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("vendor_id", &self.vendor_id)
            .field("product_id", &self.product_id)
            .field("caps", &self.caps)
            .field("fd", &self.fd)
            .field("grabbed", &self.grabbed)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // A device left grabbed keeps its keys dead for the whole session,
        // so this must also run on panic unwinding.
        let _ = self.ungrab();
    }
}

// QWERTY row plus representative letter keys; a device that has all of
// them is treated as a keyboard.
const QWERTY_CODES: &[u16] = &[16, 17, 18, 19, 20, 21];
const A_Z_SPACE_CODES: &[u16] = &[57, 30, 44];

fn detect_capabilities(dev: &evdev::Device) -> Capabilities {
    let mut caps = Capabilities::default();

    if dev.supported_events().contains(EventType::KEY) {
        if let Some(keys) = dev.supported_keys() {
            let qwerty = QWERTY_CODES.iter().all(|c| keys.contains(Key::new(*c)));
            let az = A_Z_SPACE_CODES.iter().all(|c| keys.contains(Key::new(*c)));
            caps.keyboard = qwerty && az;

            if keys.contains(Key::BTN_LEFT) {
                caps.mouse = true;
            }
        }
    }

    if let Some(rel) = dev.supported_relative_axes() {
        if rel.contains(RelativeAxisType::REL_X) && rel.contains(RelativeAxisType::REL_Y) {
            caps.mouse = true;
        }
    }

    if let Some(abs) = dev.supported_absolute_axes() {
        if abs.contains(AbsoluteAxisType::ABS_X) && abs.contains(AbsoluteAxisType::ABS_Y) {
            caps.mouse_abs = true;
        }
    }

    caps
}
