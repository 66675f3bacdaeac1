// Keyd Virtual Sink
// Synthesized keyboard+mouse device and the keystate vector behind it

use std::io;

use crate::key;

/// Display name of the synthesized device. The daemon ignores device-add
/// events carrying this name; they are our own output looping back.
pub const VKBD_NAME: &str = "keyd virtual keyboard";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create virtual device: {0}")]
    DeviceCreation(String),
}

/// Raw transport under the virtual sink. The production implementation is
/// [`UinputBackend`]; tests substitute a recorder.
pub trait OutputBackend {
    fn emit_key(&mut self, code: u16, pressed: bool) -> io::Result<()>;
    fn emit_rel(&mut self, dx: i32, dy: i32) -> io::Result<()>;
    fn emit_abs(&mut self, x: i32, y: i32) -> io::Result<()>;
    fn emit_scroll(&mut self, dx: i32, dy: i32) -> io::Result<()>;
}

/// The single synthesized output device.
///
/// Tracks which codes are currently reported pressed so that `clear` can
/// release exactly what is down, no matter which keyboard put it there.
pub struct VirtualSink {
    keystate: [bool; 256],
    backend: Box<dyn OutputBackend>,
}

impl VirtualSink {
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self {
            keystate: [false; 256],
            backend,
        }
    }

    /// Record and forward one key transition. Repeated releases are
    /// harmless; the entry is simply overwritten.
    pub fn send_key(&mut self, code: u8, pressed: bool) {
        self.keystate[code as usize] = pressed;

        match key::evdev_from_code(code) {
            Some(ev_code) => {
                if let Err(e) = self.backend.emit_key(ev_code, pressed) {
                    log::warn!("virtual device write failed: {}", e);
                }
            }
            // Synthetic codes (the external mouse button) stop here.
            None => log::debug!("dropping synthetic code {:#x}", code),
        }
    }

    pub fn mouse_move(&mut self, dx: i32, dy: i32) {
        if let Err(e) = self.backend.emit_rel(dx, dy) {
            log::warn!("virtual device write failed: {}", e);
        }
    }

    pub fn mouse_move_abs(&mut self, x: i32, y: i32) {
        if let Err(e) = self.backend.emit_abs(x, y) {
            log::warn!("virtual device write failed: {}", e);
        }
    }

    pub fn mouse_scroll(&mut self, dx: i32, dy: i32) {
        if let Err(e) = self.backend.emit_scroll(dx, dy) {
            log::warn!("virtual device write failed: {}", e);
        }
    }

    /// Release every code currently reported pressed, exactly once each.
    pub fn clear(&mut self) {
        for code in 0..=255u8 {
            if self.keystate[code as usize] {
                self.send_key(code, false);
            }
        }
    }

    pub fn is_pressed(&self, code: u8) -> bool {
        self.keystate[code as usize]
    }

    pub fn any_pressed(&self) -> bool {
        self.keystate.iter().any(|&s| s)
    }
}

impl Drop for VirtualSink {
    fn drop(&mut self) {
        // Keys left pressed would otherwise stay stuck until the kernel
        // tears the uinput device down.
        self.clear();
    }
}

/// Uinput-backed output device.
pub struct UinputBackend {
    device: evdev::uinput::VirtualDevice,
}

impl UinputBackend {
    pub fn new() -> Result<Self, SinkError> {
        use evdev::uinput::VirtualDeviceBuilder;
        use evdev::{
            AbsInfo, AbsoluteAxisType, AttributeSet, Key, RelativeAxisType, UinputAbsSetup,
        };

        let mut keys = AttributeSet::new();
        for code in 0..=0xef_u16 {
            keys.insert(Key::new(code));
        }
        // Mouse buttons: BTN_LEFT..=BTN_TASK
        for code in 0x110..=0x117_u16 {
            keys.insert(Key::new(code));
        }

        let mut rel = AttributeSet::new();
        rel.insert(RelativeAxisType::REL_X);
        rel.insert(RelativeAxisType::REL_Y);
        rel.insert(RelativeAxisType::REL_WHEEL);
        rel.insert(RelativeAxisType::REL_HWHEEL);

        let abs_info = AbsInfo::new(0, 0, u16::MAX as i32, 0, 0, 0);
        let abs_x = UinputAbsSetup::new(AbsoluteAxisType::ABS_X, abs_info);
        let abs_y = UinputAbsSetup::new(AbsoluteAxisType::ABS_Y, abs_info);

        let device = VirtualDeviceBuilder::new()
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?
            .name(VKBD_NAME)
            .with_keys(&keys)
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?
            .with_relative_axes(&rel)
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?
            .with_absolute_axis(&abs_x)
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?
            .with_absolute_axis(&abs_y)
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?
            .build()
            .map_err(|e: io::Error| SinkError::DeviceCreation(e.to_string()))?;

        Ok(Self { device })
    }

    fn emit(&mut self, events: &[evdev::InputEvent]) -> io::Result<()> {
        self.device.emit(events)
    }
}

impl OutputBackend for UinputBackend {
    fn emit_key(&mut self, code: u16, pressed: bool) -> io::Result<()> {
        use evdev::{EventType, InputEvent};
        let key = InputEvent::new(EventType::KEY, code, pressed as i32);
        let syn = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        self.emit(&[key, syn])
    }

    fn emit_rel(&mut self, dx: i32, dy: i32) -> io::Result<()> {
        use evdev::{EventType, InputEvent, RelativeAxisType};
        let mut events = Vec::with_capacity(3);
        if dx != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_X.0,
                dx,
            ));
        }
        if dy != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_Y.0,
                dy,
            ));
        }
        events.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        self.emit(&events)
    }

    fn emit_abs(&mut self, x: i32, y: i32) -> io::Result<()> {
        use evdev::{AbsoluteAxisType, EventType, InputEvent};
        self.emit(&[
            InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_X.0, x),
            InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_Y.0, y),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        ])
    }

    fn emit_scroll(&mut self, dx: i32, dy: i32) -> io::Result<()> {
        use evdev::{EventType, InputEvent, RelativeAxisType};
        let mut events = Vec::with_capacity(3);
        if dx != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_HWHEEL.0,
                dx,
            ));
        }
        if dy != 0 {
            events.push(InputEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_WHEEL.0,
                dy,
            ));
        }
        events.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        self.emit(&events)
    }
}
