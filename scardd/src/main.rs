// Copyright 2023 Gravitational, Inc
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::{error, info, warn};
use scardd::config::{load_reader_conf, DEFAULT_READER_CONF};
use scardd::hotplug::{self, DriverDatabase};
use scardd::readers::AddReaderError;
use scardd::server::{bind_socket, Daemon};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

const DEFAULT_SOCKET: &str = "/var/run/pcscd/pcscd.comm";

fn main() {
    init_logging();

    // Writes to a vanished client must surface as errors, not kill us.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let daemon = Daemon::new();
    let shutdown = daemon.shutdown_flag();
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGQUIT,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, shutdown.clone()) {
            error!("cannot register signal {}: {}", signal, e);
            std::process::exit(1);
        }
    }
    // SIGHUP is explicitly ignored; nothing watches this flag.
    let sighup = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, sighup);

    let conf_path = std::env::var_os("PCSCLITE_READER_CONF")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_READER_CONF));
    let readers = match load_reader_conf(&conf_path) {
        Ok(readers) => readers,
        Err(e) => {
            warn!("cannot read {}: {}", conf_path.display(), e);
            Vec::new()
        }
    };
    for reader in readers {
        match daemon.registry.add(
            &reader.friendly_name,
            &reader.device_name,
            &reader.library_path,
            reader.channel_id,
        ) {
            Ok(()) => {}
            Err(AddReaderError::Fatal(e)) => {
                error!("driver for {} unusable: {}", reader.friendly_name, e.0);
                std::process::exit(1);
            }
            Err(AddReaderError::Status(status)) => {
                warn!("reader {} not started: {:?}", reader.friendly_name, status);
            }
        }
    }

    let drop_dir = std::env::var_os(hotplug::DROPDIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(hotplug::DEFAULT_DROPDIR));
    let database = DriverDatabase::load(&drop_dir);
    // The OS-specific discovery source feeds this channel; the daemon
    // core only consumes the abstract event stream.
    let (_hotplug_tx, hotplug_rx) = mpsc::channel();
    let ingest = hotplug::spawn_ingest(daemon.registry.clone(), database, hotplug_rx);

    let socket_path = std::env::var_os("PCSCLITE_CSOCK_NAME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
    let listener = match bind_socket(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on {}: {}", socket_path.display(), e);
            std::process::exit(1);
        }
    };
    info!("listening on {}", socket_path.display());

    if let Err(e) = daemon.serve(listener) {
        error!("server loop failed: {}", e);
    }

    drop(_hotplug_tx);
    let _ = ingest.join();
    remove_socket(&socket_path);
    info!("scardd exiting");
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("cannot remove {}: {}", path.display(), e);
        }
    }
}

/// `PCSCLITE_DEBUG` picks the verbosity (0=debug .. 4=off); an explicit
/// `RUST_LOG` wins when present.
fn init_logging() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = std::env::var("PCSCLITE_DEBUG")
            .ok()
            .and_then(|v| v.trim().parse::<u8>().ok())
            .unwrap_or(1);
        builder.filter_level(match level {
            0 => log::LevelFilter::Debug,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Error,
            _ => log::LevelFilter::Off,
        });
    }
    builder.init();
}
