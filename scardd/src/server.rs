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

//! The client-server transport: a local stream-socket listener, one
//! dispatcher thread per client, request demarshalling and response
//! marshalling. Requests from a single client are handled strictly in
//! send order; cross-client synchronization happens further down at the
//! slot and registry level.

use crate::atr::Protocols;
use crate::cards::{CardService, Disposition, ShareMode};
use crate::contexts::ContextTable;
use crate::errors::Status;
use crate::ifd::IoHeader;
use crate::readers::Registry;
use crate::state::{ReaderStateBits, StateTable, WaitOutcome};
use crate::wire::{self, Command, Encode, Header, Payload};
use crate::{
    MAX_BUFFER_SIZE, MAX_BUFFER_SIZE_EXTENDED, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
    TIMEOUT_INFINITE,
};
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How many times a blocked response write is retried before the client
/// is abandoned.
const WRITE_RETRIES: u32 = 5;

pub struct Daemon {
    pub registry: Arc<Registry>,
    pub state: Arc<StateTable>,
    pub contexts: Arc<ContextTable>,
    pub cards: Arc<CardService>,
    shutdown: Arc<AtomicBool>,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<Mutex<UnixStream>>>>,
}

impl Daemon {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(StateTable::new());
        let registry = Registry::new(state.clone());
        let contexts = ContextTable::new();
        let cards = CardService::new(registry.clone(), contexts.clone());
        Arc::new(Self {
            registry,
            state,
            contexts,
            cards,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Accepts clients until the shutdown flag is raised, then drains:
    /// event workers stop, drivers unload, lingering clients are cut off.
    pub fn serve(self: &Arc<Self>, listener: UnixListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let mut dispatchers = Vec::new();
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    log_peer_credentials(&stream);
                    let daemon = self.clone();
                    let session = self.next_session.fetch_add(1, Ordering::SeqCst);
                    let handle = thread::Builder::new()
                        .name(format!("client {}", session))
                        .spawn(move || ClientSession::run(daemon, session, stream))?;
                    dispatchers.push(handle);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        info!("draining: no new clients accepted");
        self.drain();
        for handle in dispatchers {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Stops event workers, unloads drivers and severs every client so
    /// dispatchers run to completion.
    pub fn drain(&self) {
        self.registry.shutdown();
        let sessions: Vec<Arc<Mutex<UnixStream>>> =
            self.sessions.lock().values().cloned().collect();
        for stream in sessions {
            let _ = stream.lock().shutdown(std::net::Shutdown::Both);
        }
        self.state.kick();
    }
}

/// Binds the listening socket with the canonical `0660` permissions,
/// replacing any stale socket file left from an earlier run.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket path contains NUL"))?;
    if unsafe { libc::chmod(cpath.as_ptr(), 0o660) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(listener)
}

fn log_peer_credentials(stream: &UnixStream) {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        info!(
            "client connected: pid {} uid {} gid {}",
            cred.pid, cred.uid, cred.gid
        );
    } else {
        debug!("SO_PEERCRED unavailable: {}", io::Error::last_os_error());
    }
}

struct ClientSession {
    daemon: Arc<Daemon>,
    id: u64,
    reader: UnixStream,
    writer: Arc<Mutex<UnixStream>>,
}

impl ClientSession {
    fn run(daemon: Arc<Daemon>, id: u64, stream: UnixStream) {
        let writer = match stream.try_clone() {
            Ok(clone) => Arc::new(Mutex::new(clone)),
            Err(e) => {
                error!("cannot clone client stream: {}", e);
                return;
            }
        };
        daemon.sessions.lock().insert(id, writer.clone());
        let session = ClientSession {
            daemon,
            id,
            reader: stream,
            writer,
        };
        session.serve();
    }

    fn serve(mut self) {
        match self.handshake() {
            Ok(true) => loop {
                let (header, mut payload) = match wire::read_message(&mut self.reader) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("client {} gone: {}", self.id, e);
                        break;
                    }
                };
                if let Err(e) = self.dispatch(&header, &mut payload) {
                    warn!("client {} protocol violation: {}", self.id, e);
                    break;
                }
            },
            Ok(false) => debug!("client {} rejected at version handshake", self.id),
            Err(e) => debug!("client {} handshake failed: {}", self.id, e),
        }
        self.cleanup();
    }

    /// The first message on every connection is the version handshake. A
    /// major mismatch is answered and the client dropped.
    fn handshake(&mut self) -> io::Result<bool> {
        let (header, mut payload) = wire::read_message(&mut self.reader)?;
        if Command::from_u32(header.command) != Some(Command::CMD_VERSION) {
            return Err(protocol_violation("expected CMD_VERSION first"));
        }
        let theirs = wire::VersionStruct::decode(&mut payload)?;
        debug!(
            "client {} speaks protocol {}.{}",
            self.id, theirs.major, theirs.minor
        );
        let compatible = theirs.major == PROTOCOL_VERSION_MAJOR;
        let reply = wire::VersionStruct {
            major: PROTOCOL_VERSION_MAJOR,
            minor: PROTOCOL_VERSION_MINOR,
            rv: if compatible {
                Status::SCARD_S_SUCCESS.rv()
            } else {
                Status::SCARD_E_NO_SERVICE.rv()
            },
        };
        self.respond(&header, &reply)?;
        Ok(compatible)
    }

    fn cleanup(&self) {
        // A waiter that never completed is answered nothing; the socket
        // is gone anyway. Contexts cascade: locks released, sharing
        // returned, driver-side disconnect with leave.
        let _ = self.daemon.state.take_waiter(self.id);
        for (context, handles) in self.daemon.contexts.release_session(self.id) {
            debug!(
                "client {} died: releasing context {:#x} with {} handles",
                self.id,
                context,
                handles.len()
            );
            self.daemon.cards.release_handles(&handles);
        }
        self.daemon.state.kick();
        self.daemon.sessions.lock().remove(&self.id);
        info!("client {} disconnected", self.id);
    }

    fn dispatch(&mut self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let command = Command::from_u32(header.command)
            .ok_or_else(|| protocol_violation("unknown command tag"))?;
        trace!("client {} -> {:?}", self.id, command);
        match command {
            Command::ESTABLISH_CONTEXT => self.handle_establish_context(header, payload),
            Command::RELEASE_CONTEXT => self.handle_release_context(header, payload),
            Command::LIST_READERS => self.handle_list_readers(header, payload),
            Command::CONNECT => self.handle_connect(header, payload),
            Command::RECONNECT => self.handle_reconnect(header, payload),
            Command::DISCONNECT => self.handle_disconnect(header, payload),
            Command::BEGIN_TRANSACTION => self.handle_begin_transaction(header, payload),
            Command::END_TRANSACTION => self.handle_end_transaction(header, payload),
            Command::TRANSMIT => self.handle_transmit(header, payload),
            Command::CONTROL => self.handle_control(header, payload),
            Command::STATUS => self.handle_status(header, payload),
            Command::GET_STATUS_CHANGE => self.handle_get_status_change(header, payload),
            Command::CANCEL => self.handle_cancel(header, payload),
            Command::CANCEL_TRANSACTION => self.handle_cancel_transaction(header, payload),
            Command::GET_ATTRIB => self.handle_attrib(header, payload, false),
            Command::SET_ATTRIB => self.handle_attrib(header, payload, true),
            Command::CMD_VERSION => Err(protocol_violation("repeated CMD_VERSION")),
            Command::CMD_GET_READERS_STATE => self.handle_get_readers_state(header),
            Command::CMD_WAIT_READER_STATE_CHANGE => self.handle_wait_state_change(header),
            Command::CMD_STOP_WAITING_READER_STATE_CHANGE => {
                self.handle_stop_waiting(header)
            }
        }
    }

    fn handle_establish_context(
        &self,
        header: &Header,
        payload: &mut Payload,
    ) -> io::Result<()> {
        let mut req = wire::EstablishStruct::decode(payload)?;
        // USER, TERMINAL, SYSTEM and GLOBAL scopes are all served by the
        // same local daemon.
        if req.scope > 3 {
            req.context = 0;
            req.rv = Status::SCARD_E_INVALID_VALUE.rv();
        } else {
            req.context = self.daemon.contexts.establish(self.id);
            req.rv = Status::SCARD_S_SUCCESS.rv();
        }
        self.respond(header, &req)
    }

    fn handle_release_context(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::ReleaseStruct::decode(payload)?;
        req.rv = match self.daemon.contexts.release(self.id, req.context) {
            Ok(handles) => {
                self.daemon.cards.release_handles(&handles);
                // Unblock any wait this context still has running.
                self.daemon.state.kick();
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_list_readers(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let _req = wire::ListReadersStruct::decode(payload)?;
        let names = self.daemon.state.reader_names();
        let reply = wire::ListReadersStruct {
            readers_len: 0,
            rv: Status::SCARD_S_SUCCESS.rv(),
            readers: wire::encode_multistring(&names),
        };
        self.respond(header, &reply)
    }

    fn handle_connect(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::ConnectStruct::decode(payload)?;
        req.rv = match self.connect_outcome(&req) {
            Ok((handle, protocol)) => {
                req.handle = handle;
                req.active_protocol = protocol;
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => {
                req.handle = 0;
                req.active_protocol = 0;
                status.rv()
            }
        };
        self.respond(header, &req)
    }

    fn connect_outcome(&self, req: &wire::ConnectStruct) -> Result<(u32, u32), Status> {
        if !self.daemon.contexts.owns(self.id, req.context) {
            return Err(Status::SCARD_E_INVALID_HANDLE);
        }
        let mode =
            ShareMode::from_u32(req.share_mode).ok_or(Status::SCARD_E_INVALID_VALUE)?;
        let preferred = Protocols::from_bits_truncate(req.preferred_protocols);
        self.daemon
            .cards
            .connect(req.context, &req.reader, mode, preferred)
    }

    fn handle_reconnect(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::ReconnectStruct::decode(payload)?;
        req.rv = match self.reconnect_outcome(&req) {
            Ok(protocol) => {
                req.active_protocol = protocol;
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn reconnect_outcome(&self, req: &wire::ReconnectStruct) -> Result<u32, Status> {
        self.check_handle(req.handle)?;
        let mode =
            ShareMode::from_u32(req.share_mode).ok_or(Status::SCARD_E_INVALID_VALUE)?;
        let init =
            Disposition::from_u32(req.initialization).ok_or(Status::SCARD_E_INVALID_VALUE)?;
        let preferred = Protocols::from_bits_truncate(req.preferred_protocols);
        self.daemon.cards.reconnect(req.handle, mode, preferred, init)
    }

    fn handle_disconnect(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::DisconnectStruct::decode(payload)?;
        req.rv = match self.check_handle(req.handle).and_then(|_| {
            let disposition =
                Disposition::from_u32(req.disposition).ok_or(Status::SCARD_E_INVALID_VALUE)?;
            self.daemon.cards.disconnect(req.handle, disposition)
        }) {
            Ok(()) => Status::SCARD_S_SUCCESS.rv(),
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_begin_transaction(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::HandleStruct::decode(payload)?;
        req.rv = match self
            .check_handle(req.handle)
            .and_then(|_| self.daemon.cards.begin_transaction(req.handle))
        {
            Ok(()) => Status::SCARD_S_SUCCESS.rv(),
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_end_transaction(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::EndStruct::decode(payload)?;
        req.rv = match self.check_handle(req.handle).and_then(|_| {
            let disposition =
                Disposition::from_u32(req.disposition).ok_or(Status::SCARD_E_INVALID_VALUE)?;
            self.daemon.cards.end_transaction(req.handle, disposition)
        }) {
            Ok(()) => Status::SCARD_S_SUCCESS.rv(),
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_cancel_transaction(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::HandleStruct::decode(payload)?;
        req.rv = match self
            .check_handle(req.handle)
            .and_then(|_| self.daemon.cards.cancel_transaction(req.handle))
        {
            Ok(()) => Status::SCARD_S_SUCCESS.rv(),
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_transmit(&mut self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::TransmitStruct::decode(payload)?;
        if req.send_length as usize > MAX_BUFFER_SIZE_EXTENDED {
            // Nothing was sent beyond the record and no driver call is
            // issued; the claim itself is a protocol violation.
            req.rv = Status::SCARD_E_INSUFFICIENT_BUFFER.rv();
            self.respond(header, &req)?;
            return Err(protocol_violation("transmit length beyond extended limit"));
        }
        let apdu = if req.send_length as usize <= MAX_BUFFER_SIZE {
            std::mem::take(&mut req.send_buffer)
        } else {
            self.read_run(req.send_length as usize)?
        };

        let outcome = self
            .check_handle(req.handle)
            .and_then(|_| {
                self.daemon.cards.transmit(
                    req.handle,
                    IoHeader {
                        protocol: req.send_pci_protocol,
                        length: req.send_pci_length,
                    },
                    &apdu,
                    req.recv_length as usize,
                )
            });

        req.send_buffer = Vec::new();
        req.send_length = 0;
        match outcome {
            Ok((recv_pci, response)) => {
                req.rv = Status::SCARD_S_SUCCESS.rv();
                req.recv_pci_protocol = recv_pci.protocol;
                req.recv_pci_length = recv_pci.length;
                req.recv_length = response.len() as u32;
                if response.len() <= MAX_BUFFER_SIZE {
                    req.recv_buffer = response;
                    self.respond(header, &req)
                } else {
                    req.recv_buffer = Vec::new();
                    self.respond_with_run(header, &req, &response)
                }
            }
            Err(status) => {
                req.rv = status.rv();
                req.recv_length = 0;
                req.recv_buffer = Vec::new();
                self.respond(header, &req)
            }
        }
    }

    fn handle_control(&mut self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::ControlStruct::decode(payload)?;
        if req.send_length as usize > MAX_BUFFER_SIZE_EXTENDED {
            req.rv = Status::SCARD_E_INSUFFICIENT_BUFFER.rv();
            self.respond(header, &req)?;
            return Err(protocol_violation("control length beyond extended limit"));
        }
        let data = if req.send_length as usize <= MAX_BUFFER_SIZE {
            std::mem::take(&mut req.send_buffer)
        } else {
            self.read_run(req.send_length as usize)?
        };

        let outcome = self.check_handle(req.handle).and_then(|_| {
            self.daemon.cards.control(
                req.handle,
                req.control_code,
                &data,
                req.recv_length as usize,
            )
        });

        req.send_buffer = Vec::new();
        req.send_length = 0;
        match outcome {
            Ok(response) => {
                req.rv = Status::SCARD_S_SUCCESS.rv();
                req.recv_length = response.len() as u32;
                if response.len() <= MAX_BUFFER_SIZE {
                    req.recv_buffer = response;
                    self.respond(header, &req)
                } else {
                    req.recv_buffer = Vec::new();
                    self.respond_with_run(header, &req, &response)
                }
            }
            Err(status) => {
                req.rv = status.rv();
                req.recv_length = 0;
                req.recv_buffer = Vec::new();
                self.respond(header, &req)
            }
        }
    }

    fn handle_status(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::StatusStruct::decode(payload)?;
        req.rv = match self
            .check_handle(req.handle)
            .and_then(|_| self.daemon.cards.status(req.handle))
        {
            Ok((name, state, protocol, atr)) => {
                req.reader = name;
                req.state = state;
                req.protocol = protocol;
                req.atr = atr;
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_attrib(
        &self,
        header: &Header,
        payload: &mut Payload,
        set: bool,
    ) -> io::Result<()> {
        let mut req = wire::AttribStruct::decode(payload)?;
        req.rv = match self.check_handle(req.handle).and_then(|_| {
            if set {
                let len = (req.attr_len as usize).min(req.attr_value.len());
                self.daemon
                    .cards
                    .set_attrib(req.handle, req.attr_id, &req.attr_value[..len])
                    .map(|_| Vec::new())
            } else {
                self.daemon.cards.get_attrib(req.handle, req.attr_id)
            }
        }) {
            Ok(value) => {
                if !set {
                    req.attr_len = value.len() as u32;
                    req.attr_value = value;
                }
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_cancel(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::CancelStruct::decode(payload)?;
        req.rv = match self.daemon.contexts.cancel(req.context) {
            Ok(()) => {
                self.daemon.state.kick();
                Status::SCARD_S_SUCCESS.rv()
            }
            Err(status) => status.rv(),
        };
        self.respond(header, &req)
    }

    fn handle_get_status_change(&self, header: &Header, payload: &mut Payload) -> io::Result<()> {
        let mut req = wire::GetStatusChangeStruct::decode(payload)?;
        if !self.daemon.contexts.owns(self.id, req.context) {
            req.rv = Status::SCARD_E_INVALID_HANDLE.rv();
            return self.respond(header, &req);
        }
        let cancel_flag = match self.daemon.contexts.cancel_flag(req.context) {
            Ok(flag) => flag,
            Err(status) => {
                req.rv = status.rv();
                return self.respond(header, &req);
            }
        };

        let deadline = match req.timeout {
            TIMEOUT_INFINITE => None,
            ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
        };

        let mut generation = self.daemon.state.generation();
        let status = loop {
            let changed = self.evaluate_reader_states(&mut req.states);
            if changed || req.timeout == 0 {
                break Status::SCARD_S_SUCCESS;
            }
            match self.daemon.state.wait(generation, deadline, &cancel_flag) {
                WaitOutcome::Changed(next) => generation = next,
                WaitOutcome::Timeout => break Status::SCARD_E_TIMEOUT,
                WaitOutcome::Cancelled => break Status::SCARD_E_CANCELLED,
            }
        };
        req.rv = status.rv();
        self.respond(header, &req)
    }

    /// Fills each entry's `event_state` from the published table and
    /// reports whether any entry changed relative to what the client
    /// already knows.
    fn evaluate_reader_states(&self, states: &mut [wire::ReaderStateEntry]) -> bool {
        let mut any_changed = false;
        for entry in states.iter_mut() {
            let client = ReaderStateBits::from_bits_truncate(entry.current_state);
            if client.contains(ReaderStateBits::IGNORE) {
                entry.event_state = ReaderStateBits::IGNORE.bits();
                continue;
            }
            match self.daemon.state.find_by_name(&entry.reader) {
                Some(row) => {
                    let mut bits = row.event_bits();
                    let changed = bits.bits() != entry.current_state
                        || row.counter != entry.counter;
                    if changed {
                        bits |= ReaderStateBits::CHANGED;
                        any_changed = true;
                    }
                    entry.event_state = bits.bits();
                    entry.counter = row.counter;
                    entry.atr = row.atr;
                }
                None => {
                    let mut bits = ReaderStateBits::UNKNOWN;
                    if !client.contains(ReaderStateBits::UNKNOWN) {
                        bits |= ReaderStateBits::CHANGED;
                        any_changed = true;
                    }
                    entry.event_state = bits.bits();
                    entry.atr = Vec::new();
                }
            }
        }
        any_changed
    }

    fn handle_get_readers_state(&self, header: &Header) -> io::Result<()> {
        let records = self
            .daemon
            .state
            .snapshot()
            .into_iter()
            .map(|row| match row {
                Some(row) => wire::ReaderStateRecord {
                    reader: row.name,
                    state: row.flags.bits(),
                    counter: row.counter,
                    sharing: row.sharing,
                    protocol: row.protocol,
                    atr: row.atr,
                },
                None => wire::ReaderStateRecord::empty(),
            })
            .collect();
        let reply = wire::ReadersStateStruct {
            rv: Status::SCARD_S_SUCCESS.rv(),
            records,
        };
        self.respond(header, &reply)
    }

    /// No immediate reply: the completion is parked and delivered by the
    /// next state change, or flushed by the STOP companion command.
    fn handle_wait_state_change(&self, header: &Header) -> io::Result<()> {
        let writer = self.writer.clone();
        let reply_header = header.clone();
        let registered = self.daemon.state.add_waiter(
            self.id,
            Box::new(move |rv| {
                let reply = wire::WaitReaderStateChangeStruct { timeout: 0, rv };
                if let Ok(body) = reply.encode() {
                    let mut writer = writer.lock();
                    if let Err(e) = wire::write_message(&mut *writer, &reply_header, &body) {
                        debug!("state-change wakeup not delivered: {}", e);
                    }
                }
            }),
        );
        if registered {
            Ok(())
        } else {
            Err(protocol_violation("wait already pending"))
        }
    }

    fn handle_stop_waiting(&self, header: &Header) -> io::Result<()> {
        if let Some(complete) = self.daemon.state.take_waiter(self.id) {
            complete(Status::SCARD_E_TIMEOUT.rv());
        } else {
            debug!("client {} stopped a wait it never started", self.id);
        }
        let reply = wire::WaitReaderStateChangeStruct {
            timeout: 0,
            rv: Status::SCARD_S_SUCCESS.rv(),
        };
        self.respond(header, &reply)
    }

    /// A handle is only usable over the connection whose context owns it.
    fn check_handle(&self, handle: u32) -> Result<(), Status> {
        let card = self.daemon.cards.get(handle)?;
        if self.daemon.contexts.owns(self.id, card.context) {
            Ok(())
        } else {
            Err(Status::SCARD_E_INVALID_HANDLE)
        }
    }

    /// Reads a raw byte run following a request record.
    fn read_run(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    fn respond(&self, header: &Header, body: &dyn Encode) -> io::Result<()> {
        self.send_record(header, &body.encode()?, None)
    }

    fn respond_with_run(
        &self,
        header: &Header,
        body: &dyn Encode,
        run: &[u8],
    ) -> io::Result<()> {
        self.send_record(header, &body.encode()?, Some(run))
    }

    /// Sends one response record (plus optional trailing run) with a
    /// bounded retry; a persistently blocked client is abandoned.
    fn send_record(&self, header: &Header, body: &[u8], run: Option<&[u8]>) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let mut attempts = 0;
        loop {
            let outcome = wire::write_message(&mut *writer, header, body).and_then(|_| {
                if let Some(run) = run {
                    writer.write_all(run)?;
                }
                writer.flush()
            });
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < WRITE_RETRIES => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn protocol_violation(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifd::fake::FakeDriver;
    use std::os::unix::net::UnixStream;

    fn daemon_with_reader() -> (Arc<Daemon>, crate::ifd::fake::FakeHandle) {
        let daemon = Daemon::new();
        let (binding, card) = FakeDriver::new();
        daemon
            .registry
            .add_with_binding("Unit", "", 0, binding)
            .map_err(|e| e.status())
            .unwrap();
        (daemon, card)
    }

    fn start_session(daemon: &Arc<Daemon>) -> UnixStream {
        let (client, server) = UnixStream::pair().unwrap();
        let daemon = daemon.clone();
        let session = daemon.next_session.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || ClientSession::run(daemon, session, server));
        client
    }

    fn call(
        stream: &mut UnixStream,
        command: Command,
        body: &dyn Encode,
    ) -> (Header, Payload) {
        let header = Header::new(command as u32, 1);
        wire::write_message(stream, &header, &body.encode().unwrap()).unwrap();
        wire::read_message(stream).unwrap()
    }

    fn shake_hands(stream: &mut UnixStream) {
        let (_, mut payload) = call(
            stream,
            Command::CMD_VERSION,
            &wire::VersionStruct {
                major: PROTOCOL_VERSION_MAJOR,
                minor: PROTOCOL_VERSION_MINOR,
                rv: 0,
            },
        );
        let reply = wire::VersionStruct::decode(&mut payload).unwrap();
        assert_eq!(reply.rv, Status::SCARD_S_SUCCESS.rv());
    }

    #[test]
    fn version_major_mismatch_disconnects_the_client() {
        let (daemon, _card) = daemon_with_reader();
        let mut client = start_session(&daemon);
        let (_, mut payload) = call(
            &mut client,
            Command::CMD_VERSION,
            &wire::VersionStruct {
                major: PROTOCOL_VERSION_MAJOR + 1,
                minor: 0,
                rv: 0,
            },
        );
        let reply = wire::VersionStruct::decode(&mut payload).unwrap();
        assert_eq!(reply.rv, Status::SCARD_E_NO_SERVICE.rv());
        assert_eq!(reply.major, PROTOCOL_VERSION_MAJOR);
        // The server hangs up after the rejection.
        assert!(wire::read_message(&mut client).is_err());
        daemon.registry.shutdown();
    }

    #[test]
    fn establish_then_list_readers() {
        let (daemon, _card) = daemon_with_reader();
        let mut client = start_session(&daemon);
        shake_hands(&mut client);

        let (_, mut payload) = call(
            &mut client,
            Command::ESTABLISH_CONTEXT,
            &wire::EstablishStruct {
                scope: 2,
                context: 0,
                rv: 0,
            },
        );
        let established = wire::EstablishStruct::decode(&mut payload).unwrap();
        assert_eq!(established.rv, Status::SCARD_S_SUCCESS.rv());
        assert_ne!(established.context, 0);

        let (_, mut payload) = call(
            &mut client,
            Command::LIST_READERS,
            &wire::ListReadersStruct {
                readers_len: 0,
                rv: 0,
                readers: vec![],
            },
        );
        let listed = wire::ListReadersStruct::decode(&mut payload).unwrap();
        assert_eq!(listed.rv, Status::SCARD_S_SUCCESS.rv());
        assert_eq!(
            wire::decode_multistring(&listed.readers),
            vec!["Unit 0 0".to_string()]
        );
        daemon.registry.shutdown();
    }

    #[test]
    fn foreign_context_is_an_invalid_handle() {
        let (daemon, _card) = daemon_with_reader();
        let mut alice = start_session(&daemon);
        let mut mallory = start_session(&daemon);
        shake_hands(&mut alice);
        shake_hands(&mut mallory);

        let (_, mut payload) = call(
            &mut alice,
            Command::ESTABLISH_CONTEXT,
            &wire::EstablishStruct {
                scope: 2,
                context: 0,
                rv: 0,
            },
        );
        let context = wire::EstablishStruct::decode(&mut payload).unwrap().context;

        let (_, mut payload) = call(
            &mut mallory,
            Command::CONNECT,
            &wire::ConnectStruct {
                context,
                reader: "Unit 0 0".to_string(),
                share_mode: ShareMode::Shared as u32,
                preferred_protocols: Protocols::ANY.bits(),
                handle: 0,
                active_protocol: 0,
                rv: 0,
            },
        );
        let reply = wire::ConnectStruct::decode(&mut payload).unwrap();
        assert_eq!(reply.rv, Status::SCARD_E_INVALID_HANDLE.rv());
        daemon.registry.shutdown();
    }

    #[test]
    fn get_readers_state_dumps_every_row() {
        let (daemon, _card) = daemon_with_reader();
        let mut client = start_session(&daemon);
        shake_hands(&mut client);

        let (_, mut payload) = call(
            &mut client,
            Command::CMD_GET_READERS_STATE,
            &wire::WaitReaderStateChangeStruct { timeout: 0, rv: 0 },
        );
        let dump = wire::ReadersStateStruct::decode(&mut payload).unwrap();
        assert_eq!(dump.records.len(), crate::MAX_READERS);
        assert_eq!(dump.records[0].reader, "Unit 0 0");
        assert!(dump.records[1].reader.is_empty());
        daemon.registry.shutdown();
    }

    #[test]
    fn wait_reader_state_change_completes_on_change() {
        let (daemon, card) = daemon_with_reader();
        let mut client = start_session(&daemon);
        shake_hands(&mut client);

        let header = Header::new(Command::CMD_WAIT_READER_STATE_CHANGE as u32, 1);
        wire::write_message(
            &mut client,
            &header,
            &wire::WaitReaderStateChangeStruct { timeout: 0, rv: 0 }
                .encode()
                .unwrap(),
        )
        .unwrap();

        // No reply yet; the card insertion completes the wait.
        card.insert_card(0, &[0x3B, 0x00]);
        let (reply_header, mut payload) = wire::read_message(&mut client).unwrap();
        assert_eq!(
            reply_header.command,
            Command::CMD_WAIT_READER_STATE_CHANGE as u32
        );
        let reply = wire::WaitReaderStateChangeStruct::decode(&mut payload).unwrap();
        assert_eq!(reply.rv, Status::SCARD_S_SUCCESS.rv());
        daemon.registry.shutdown();
    }

    #[test]
    fn stop_waiting_flushes_a_pending_wait() {
        let (daemon, _card) = daemon_with_reader();
        let mut client = start_session(&daemon);
        shake_hands(&mut client);

        let header = Header::new(Command::CMD_WAIT_READER_STATE_CHANGE as u32, 1);
        wire::write_message(
            &mut client,
            &header,
            &wire::WaitReaderStateChangeStruct { timeout: 0, rv: 0 }
                .encode()
                .unwrap(),
        )
        .unwrap();

        let stop = Header::new(Command::CMD_STOP_WAITING_READER_STATE_CHANGE as u32, 2);
        wire::write_message(
            &mut client,
            &stop,
            &wire::WaitReaderStateChangeStruct { timeout: 0, rv: 0 }
                .encode()
                .unwrap(),
        )
        .unwrap();

        // First the flushed wait, then the STOP ack.
        let (first, mut payload) = wire::read_message(&mut client).unwrap();
        assert_eq!(first.command, Command::CMD_WAIT_READER_STATE_CHANGE as u32);
        assert_eq!(
            wire::WaitReaderStateChangeStruct::decode(&mut payload)
                .unwrap()
                .rv,
            Status::SCARD_E_TIMEOUT.rv()
        );
        let (second, mut payload) = wire::read_message(&mut client).unwrap();
        assert_eq!(
            second.command,
            Command::CMD_STOP_WAITING_READER_STATE_CHANGE as u32
        );
        assert_eq!(
            wire::WaitReaderStateChangeStruct::decode(&mut payload)
                .unwrap()
                .rv,
            Status::SCARD_S_SUCCESS.rv()
        );
        daemon.registry.shutdown();
    }

    #[test]
    fn client_death_releases_contexts_and_handles() {
        let (daemon, card) = daemon_with_reader();
        card.insert_card(0, &[0x3B, 0x00]);
        {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !daemon
                .state
                .find_by_name("Unit 0 0")
                .map(|row| row.card_present())
                .unwrap_or(false)
            {
                assert!(Instant::now() < deadline);
                thread::sleep(Duration::from_millis(20));
            }
        }

        let mut client = start_session(&daemon);
        shake_hands(&mut client);
        let (_, mut payload) = call(
            &mut client,
            Command::ESTABLISH_CONTEXT,
            &wire::EstablishStruct {
                scope: 2,
                context: 0,
                rv: 0,
            },
        );
        let context = wire::EstablishStruct::decode(&mut payload).unwrap().context;
        let (_, mut payload) = call(
            &mut client,
            Command::CONNECT,
            &wire::ConnectStruct {
                context,
                reader: "Unit 0 0".to_string(),
                share_mode: ShareMode::Exclusive as u32,
                preferred_protocols: Protocols::ANY.bits(),
                handle: 0,
                active_protocol: 0,
                rv: 0,
            },
        );
        let reply = wire::ConnectStruct::decode(&mut payload).unwrap();
        assert_eq!(reply.rv, Status::SCARD_S_SUCCESS.rv());
        assert!(daemon.state.find_by_name("Unit 0 0").unwrap().sharing < 0);

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(5);
        while daemon.state.find_by_name("Unit 0 0").unwrap().sharing != 0 {
            assert!(Instant::now() < deadline, "cascade never ran");
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!daemon.contexts.exists(context));
        daemon.registry.shutdown();
    }
}
