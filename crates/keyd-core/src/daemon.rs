// Keyd Daemon Core
// Device table, configuration registry, and the central event dispatcher

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{Config, ConfigError};
use crate::device::{Device, DeviceEvent};
use crate::evloop::{Event, EventLoop};
use crate::ipc::{self, IpcError, IpcServer, ListenerSet, Request};
use crate::key;
use crate::keyboard::Keyboard;
use crate::vkbd::{VirtualSink, VKBD_NAME};

/// Directory scanned for `*.conf` files.
pub const CONFIG_DIR: &str = "/etc/keyd";

/// The IPC socket path.
pub const SOCKET_PATH: &str = "/run/keyd.sock";

/// Upper bound on tracked devices.
pub const MAX_DEVICES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed configuration together with the keyboard built from it. The
/// entry exclusively owns its keyboard.
pub struct ConfigEntry {
    pub config: Config,
    pub kbd: Keyboard,
}

/// Ordered collection of loaded configurations, most recently loaded
/// first, so that the last loaded file wins equal-rank matches.
pub struct Registry {
    entries: Vec<ConfigEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Replace the registry contents with the `.conf` files found in
    /// `dir`. Subdirectories and other extensions are skipped; a parse
    /// failure aborts the load and is fatal to the daemon.
    pub fn load(
        &mut self,
        dir: &Path,
        make_kbd: &dyn Fn(&Config) -> Keyboard,
    ) -> Result<(), ConfigError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("conf") {
                paths.push(path);
            }
        }
        // Directory order is arbitrary; sort so reloads are reproducible.
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            log::info!("CONFIG: parsing {}", path.display());
            let config = Config::parse(&path)?;
            let kbd = make_kbd(&config);
            entries.insert(0, ConfigEntry { config, kbd });
        }

        self.entries = entries;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_mut(&mut self, idx: usize) -> Option<&mut ConfigEntry> {
        self.entries.get_mut(idx)
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ConfigEntry> {
        self.entries.iter_mut()
    }

    /// Find the entry with the strictly greatest match rank for a device
    /// id. Ties go to the entry encountered first, i.e. the one loaded
    /// last.
    pub fn lookup(&self, id: u32) -> (u8, Option<usize>) {
        let mut rank = 0;
        let mut found = None;

        for (idx, ent) in self.entries.iter().enumerate() {
            let r = ent.config.check_match(id);
            if r > rank {
                rank = r;
                found = Some(idx);
            }
        }

        (rank, found)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The daemon context: every process-wide singleton of the original
/// design, owned in one place and mutated only from the event loop.
pub struct Daemon {
    config_dir: PathBuf,
    sink: Rc<RefCell<VirtualSink>>,
    listeners: Rc<RefCell<ListenerSet>>,
    registry: Registry,
    devices: Vec<Device>,
    /// The keyboard most recently handed a key event; timer ticks are
    /// attributed to it.
    last_kbd: Option<usize>,
    ipc: IpcServer,
}

impl Daemon {
    /// Build the context and perform the initial configuration load.
    pub fn new(config_dir: &Path, sink: VirtualSink, ipc: IpcServer) -> Result<Self, DaemonError> {
        let mut daemon = Self {
            config_dir: config_dir.to_path_buf(),
            sink: Rc::new(RefCell::new(sink)),
            listeners: Rc::new(RefCell::new(ListenerSet::new())),
            registry: Registry::new(),
            devices: Vec::new(),
            last_kbd: None,
            ipc,
        };
        daemon.reload()?;
        Ok(daemon)
    }

    /// Drive the event source until the shutdown flag is raised or a
    /// fatal error surfaces.
    pub fn run(&mut self, evloop: &mut EventLoop, shutdown: &AtomicBool) -> Result<(), DaemonError> {
        evloop.add_fd(self.ipc.as_raw_fd());

        let mut rearm: Option<u64> = Some(0);
        while !shutdown.load(Ordering::SeqCst) {
            match evloop.wait(&mut self.devices, rearm)? {
                Some(ev) => rearm = Some(self.handle_event(ev)?),
                None => rearm = None,
            }
        }
        Ok(())
    }

    fn keyboard_for(
        config: &Config,
        sink: &Rc<RefCell<VirtualSink>>,
        listeners: &Rc<RefCell<ListenerSet>>,
    ) -> Keyboard {
        let sink = Rc::clone(sink);
        let listeners = Rc::clone(listeners);
        Keyboard::new(
            config,
            Box::new(move |code, pressed| sink.borrow_mut().send_key(code, pressed)),
            Box::new(move |name, active| listeners.borrow_mut().broadcast(name, active)),
        )
    }

    /// Rebuild the registry from disk, re-bind every device, and clear
    /// the sink so keys left pressed by the outgoing keyboards are
    /// released.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.registry.clear();
        self.last_kbd = None;

        let sink = Rc::clone(&self.sink);
        let listeners = Rc::clone(&self.listeners);
        self.registry.load(&self.config_dir, &|config| {
            Self::keyboard_for(config, &sink, &listeners)
        })?;

        for idx in 0..self.devices.len() {
            self.bind_device(idx);
        }

        self.sink.borrow_mut().clear();
        Ok(())
    }

    /// Decide grab/ignore for one device and point it at the matching
    /// keyboard.
    fn bind_device(&mut self, idx: usize) {
        let id = self.devices[idx].id();
        let caps = self.devices[idx].capabilities();
        let (rank, ent) = self.registry.lookup(id);

        let bound = (rank >= 1 && caps.keyboard) || (rank == 2 && caps.pointer());

        let dev = &mut self.devices[idx];
        if !bound {
            dev.assoc = None;
            let _ = dev.ungrab();
            log::info!(
                "DEVICE: ignoring {:04x}:{:04x}  ({})",
                dev.vendor_id(),
                dev.product_id(),
                dev.name()
            );
            return;
        }

        if let Err(e) = dev.grab() {
            log::warn!("failed to grab {}: {}", dev.path().display(), e);
            dev.assoc = None;
            return;
        }

        dev.assoc = ent;
        if let Some(ent) = ent {
            if let Some(entry) = self.registry.entry_mut(ent) {
                log::info!(
                    "DEVICE: match    {:04x}:{:04x}  {}\t({})",
                    self.devices[idx].vendor_id(),
                    self.devices[idx].product_id(),
                    entry.config.path.display(),
                    self.devices[idx].name()
                );
            }
        }
    }

    fn add_device(&mut self, dev: Device) {
        if self.devices.len() == MAX_DEVICES {
            log::warn!("device table full, ignoring {}", dev.name());
            return;
        }
        self.devices.push(dev);
        self.bind_device(self.devices.len() - 1);
    }

    fn remove_device(&mut self, fd: RawFd) {
        if let Some(idx) = self.devices.iter().position(|d| d.fd() == fd) {
            let dev = self.devices.remove(idx);
            log::info!(
                "DEVICE: removed  {:04x}:{:04x}  ({})",
                dev.vendor_id(),
                dev.product_id(),
                dev.name()
            );
        }
    }

    /// The single dispatch point. Returns the delay in milliseconds until
    /// the next synthetic timeout, 0 for none.
    pub fn handle_event(&mut self, ev: Event) -> Result<u64, DaemonError> {
        match ev {
            Event::Timeout => Ok(self.tick()),
            Event::Device { fd, ev, timeleft } => self.device_event(fd, ev, timeleft),
            Event::DeviceAdded(dev) => {
                if dev.name() != VKBD_NAME {
                    self.add_device(dev);
                }
                Ok(0)
            }
            Event::DeviceRemoved { fd } => {
                self.remove_device(fd);
                Ok(0)
            }
            Event::FdActivity { fd } => {
                if fd == self.ipc.as_raw_fd() {
                    match self.ipc.accept() {
                        Ok(con) => self.handle_client(con)?,
                        Err(e) => log::warn!("IPC accept failed: {}", e),
                    }
                }
                Ok(0)
            }
        }
    }

    fn tick(&mut self) -> u64 {
        match self.last_kbd.and_then(|k| self.registry.entry_mut(k)) {
            Some(entry) => entry.kbd.process_key_event(0, false),
            None => 0,
        }
    }

    fn device_event(&mut self, fd: RawFd, ev: DeviceEvent, timeleft: u64) -> Result<u64, DaemonError> {
        let Some(idx) = self.devices.iter().position(|d| d.fd() == fd) else {
            return Ok(timeleft);
        };
        let Some(ent) = self.devices[idx].assoc else {
            return Ok(timeleft);
        };

        match ev {
            DeviceEvent::Key { code, pressed } => {
                self.last_kbd = Some(ent);
                match self.registry.entry_mut(ent) {
                    Some(entry) => Ok(entry.kbd.process_key_event(code, pressed)),
                    None => Ok(timeleft),
                }
            }
            DeviceEvent::MouseMove { dx, dy } => {
                self.sink.borrow_mut().mouse_move(dx, dy);
                Ok(timeleft)
            }
            DeviceEvent::MouseMoveAbs { x, y } => {
                self.sink.borrow_mut().mouse_move_abs(x, y);
                Ok(timeleft)
            }
            DeviceEvent::MouseScroll { dx, dy } => {
                // Scroll counts as a button press so oneshot and similar
                // transient keyboard state is cleared.
                self.last_kbd = Some(ent);
                if let Some(entry) = self.registry.entry_mut(ent) {
                    entry.kbd.process_key_event(key::EXTERNAL_MOUSE_BUTTON, true);
                    entry.kbd.process_key_event(key::EXTERNAL_MOUSE_BUTTON, false);
                }
                self.sink.borrow_mut().mouse_scroll(dx, dy);
                Ok(timeleft)
            }
        }
    }

    /// Handle one freshly accepted IPC connection, synchronously.
    pub fn handle_client(&mut self, mut con: UnixStream) -> Result<(), DaemonError> {
        let request = match ipc::read_request(&mut con) {
            Ok(req) => req,
            Err(IpcError::Io(e)) => {
                log::warn!("dropping malformed IPC connection: {}", e);
                return Ok(());
            }
            Err(IpcError::UnknownType(_)) => {
                ipc::send_fail(con, "Unknown command");
                return Ok(());
            }
            Err(e) => {
                ipc::send_fail(con, &e.to_string());
                return Ok(());
            }
        };

        match request {
            Request::Reload => {
                self.reload()?;
                ipc::send_success(con);
            }
            Request::Bind(expr) => {
                let mut accepted = false;
                let mut last_err = String::from("no configuration accepted the binding");

                for entry in self.registry.entries_mut() {
                    match entry.kbd.eval(&expr) {
                        Ok(()) => accepted = true,
                        Err(e) => last_err = e.to_string(),
                    }
                }

                if accepted {
                    ipc::send_success(con);
                } else {
                    ipc::send_fail(con, &last_err);
                }
            }
            Request::LayerListen => {
                self.listeners.borrow_mut().add(con);
            }
        }

        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn sink(&self) -> Rc<RefCell<VirtualSink>> {
        Rc::clone(&self.sink)
    }
}
