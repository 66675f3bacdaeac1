// Keyd Daemon Binary
// Startup, privilege tuning and the shutdown flag around the core loop

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;

use keyd_core::{Daemon, EventLoop, IpcServer, UinputBackend, VirtualSink, CONFIG_DIR, SOCKET_PATH};

/// Key remapping daemon
#[derive(Parser, Debug)]
#[command(name = "keyd")]
#[command(about = "Key remapping daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    // Bind the IPC socket first; it doubles as the single-instance lock.
    let ipc = IpcServer::create(Path::new(SOCKET_PATH))?;

    let backend = UinputBackend::new()?;
    let sink = VirtualSink::new(Box::new(backend));

    let mut evloop = EventLoop::new()?;

    // Lower input-to-output latency where permitted; not being allowed to
    // is fine.
    if unsafe { libc::nice(-20) } == -1 {
        log::warn!("failed to raise scheduling priority: {}", std::io::Error::last_os_error());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut daemon = Daemon::new(Path::new(CONFIG_DIR), sink, ipc)?;
    daemon.run(&mut evloop, &shutdown)?;

    log::info!("shutting down");
    Ok(())
}
