// Keyd Core Library
// Event loop, device pipeline and IPC for the keyd remapping daemon

pub mod config;
pub mod daemon;
pub mod device;
pub mod evloop;
pub mod ipc;
pub mod key;
pub mod keyboard;
pub mod vkbd;

pub use config::{Action, Config, ConfigError};
pub use daemon::{ConfigEntry, Daemon, DaemonError, Registry, CONFIG_DIR, MAX_DEVICES, SOCKET_PATH};
pub use device::{Capabilities, Device, DeviceEvent};
pub use evloop::{Event, EventLoop};
pub use ipc::{
    IpcError, IpcServer, ListenerSet, Reply, Request, MAX_IPC_MESSAGE_SIZE, MAX_LISTENERS,
};
pub use keyboard::{Keyboard, KeyboardError};
pub use vkbd::{OutputBackend, SinkError, UinputBackend, VirtualSink, VKBD_NAME};
