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

//! On-the-wire message layout for the client-server protocol.
//!
//! Every message is a fixed-size record: a 40-byte header followed by a
//! [`MAX_MESSAGE_SIZE`] data area holding the command-specific struct.
//! The protocol is local-only, so multi-byte integers travel in native
//! byte order. Short transmit/control payloads ride inside the record's
//! embedded buffers; anything larger (up to `MAX_BUFFER_SIZE_EXTENDED`)
//! follows the record as a raw byte run sized by the struct's length
//! field. Reader names occupy a fixed 128-byte NUL-padded field.

use crate::{MAX_ATR_SIZE, MAX_BUFFER_SIZE, MAX_READERNAME, MAX_READERS};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use std::io::{self, Cursor, Read, Write};

/// Size of the per-message data area.
pub const MAX_MESSAGE_SIZE: usize = 4096;
pub const MSG_KEY_LEN: usize = 16;
pub const HEADER_SIZE: usize = 24 + MSG_KEY_LEN;

/// Cap on reader-state entries in one GetStatusChange call.
pub const MAX_READER_STATES: usize = MAX_READERS;

pub type Payload = Cursor<Vec<u8>>;

#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum Command {
    ESTABLISH_CONTEXT = 0x01,
    RELEASE_CONTEXT = 0x02,
    LIST_READERS = 0x03,
    CONNECT = 0x04,
    RECONNECT = 0x05,
    DISCONNECT = 0x06,
    BEGIN_TRANSACTION = 0x07,
    END_TRANSACTION = 0x08,
    TRANSMIT = 0x09,
    CONTROL = 0x0A,
    STATUS = 0x0B,
    GET_STATUS_CHANGE = 0x0C,
    CANCEL = 0x0D,
    CANCEL_TRANSACTION = 0x0E,
    GET_ATTRIB = 0x0F,
    SET_ATTRIB = 0x10,
    CMD_VERSION = 0xF1,
    CMD_GET_READERS_STATE = 0xF2,
    CMD_WAIT_READER_STATE_CHANGE = 0xF3,
    CMD_STOP_WAITING_READER_STATE_CHANGE = 0xF4,
}

/// Fixed message header preceding every data area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub mtype: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub command: u32,
    pub request_id: u32,
    pub date: u32,
    pub key: [u8; MSG_KEY_LEN],
}

impl Header {
    pub fn new(command: u32, request_id: u32) -> Self {
        Self {
            mtype: 0,
            user_id: 0,
            group_id: 0,
            command,
            request_id,
            date: 0,
            key: [0; MSG_KEY_LEN],
        }
    }

    pub fn encode(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u32::<NativeEndian>(self.mtype)?;
        w.write_u32::<NativeEndian>(self.user_id)?;
        w.write_u32::<NativeEndian>(self.group_id)?;
        w.write_u32::<NativeEndian>(self.command)?;
        w.write_u32::<NativeEndian>(self.request_id)?;
        w.write_u32::<NativeEndian>(self.date)?;
        w.write_all(&self.key)?;
        Ok(())
    }

    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let mtype = payload.read_u32::<NativeEndian>()?;
        let user_id = payload.read_u32::<NativeEndian>()?;
        let group_id = payload.read_u32::<NativeEndian>()?;
        let command = payload.read_u32::<NativeEndian>()?;
        let request_id = payload.read_u32::<NativeEndian>()?;
        let date = payload.read_u32::<NativeEndian>()?;
        let mut key = [0u8; MSG_KEY_LEN];
        payload.read_exact(&mut key)?;
        Ok(Self {
            mtype,
            user_id,
            group_id,
            command,
            request_id,
            date,
            key,
        })
    }
}

/// Anything that can land in a message data area.
pub trait Encode {
    fn encode(&self) -> io::Result<Vec<u8>>;
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn write_name(w: &mut dyn Write, name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= MAX_READERNAME {
        return Err(invalid_data("reader name too long"));
    }
    w.write_all(bytes)?;
    w.write_all(&vec![0u8; MAX_READERNAME - bytes.len()])?;
    Ok(())
}

fn read_name(payload: &mut Payload) -> io::Result<String> {
    let mut buf = [0u8; MAX_READERNAME];
    payload.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(MAX_READERNAME);
    String::from_utf8(buf[..end].to_vec()).map_err(|_| invalid_data("reader name is not UTF-8"))
}

fn write_atr(w: &mut dyn Write, atr: &[u8]) -> io::Result<()> {
    if atr.len() > MAX_ATR_SIZE {
        return Err(invalid_data("ATR too long"));
    }
    w.write_u32::<NativeEndian>(atr.len() as u32)?;
    w.write_all(atr)?;
    w.write_all(&vec![0u8; MAX_ATR_SIZE - atr.len()])?;
    Ok(())
}

fn read_atr(payload: &mut Payload) -> io::Result<Vec<u8>> {
    let len = payload.read_u32::<NativeEndian>()? as usize;
    let mut buf = [0u8; MAX_ATR_SIZE];
    payload.read_exact(&mut buf)?;
    if len > MAX_ATR_SIZE {
        return Err(invalid_data("ATR length out of range"));
    }
    Ok(buf[..len].to_vec())
}

fn write_buffer(w: &mut dyn Write, data: &[u8]) -> io::Result<()> {
    // The embedded buffer carries short payloads; longer ones travel as a
    // trailing run and leave the buffer zeroed.
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];
    if data.len() <= MAX_BUFFER_SIZE {
        buf[..data.len()].copy_from_slice(data);
    }
    w.write_all(&buf)
}

fn read_buffer(payload: &mut Payload, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];
    payload.read_exact(&mut buf)?;
    if len <= MAX_BUFFER_SIZE {
        buf.truncate(len);
        Ok(buf)
    } else {
        // Caller fetches the trailing run instead.
        Ok(Vec::new())
    }
}

/// A reader multistring: NUL-terminated names, closed by one extra NUL.
pub fn encode_multistring(names: &[String]) -> Vec<u8> {
    let mut buf = vec![];
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf.push(0);
    buf
}

pub fn decode_multistring(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStruct {
    pub major: u32,
    pub minor: u32,
    pub rv: u32,
}

impl VersionStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            major: payload.read_u32::<NativeEndian>()?,
            minor: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for VersionStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.major)?;
        w.write_u32::<NativeEndian>(self.minor)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishStruct {
    pub scope: u32,
    pub context: u32,
    pub rv: u32,
}

impl EstablishStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            scope: payload.read_u32::<NativeEndian>()?,
            context: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for EstablishStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.scope)?;
        w.write_u32::<NativeEndian>(self.context)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseStruct {
    pub context: u32,
    pub rv: u32,
}

impl ReleaseStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            context: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for ReleaseStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.context)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectStruct {
    pub context: u32,
    pub reader: String,
    pub share_mode: u32,
    pub preferred_protocols: u32,
    pub handle: u32,
    pub active_protocol: u32,
    pub rv: u32,
}

impl ConnectStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let context = payload.read_u32::<NativeEndian>()?;
        let reader = read_name(payload)?;
        Ok(Self {
            context,
            reader,
            share_mode: payload.read_u32::<NativeEndian>()?,
            preferred_protocols: payload.read_u32::<NativeEndian>()?,
            handle: payload.read_u32::<NativeEndian>()?,
            active_protocol: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for ConnectStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.context)?;
        write_name(&mut w, &self.reader)?;
        w.write_u32::<NativeEndian>(self.share_mode)?;
        w.write_u32::<NativeEndian>(self.preferred_protocols)?;
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.active_protocol)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectStruct {
    pub handle: u32,
    pub share_mode: u32,
    pub preferred_protocols: u32,
    pub initialization: u32,
    pub active_protocol: u32,
    pub rv: u32,
}

impl ReconnectStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            handle: payload.read_u32::<NativeEndian>()?,
            share_mode: payload.read_u32::<NativeEndian>()?,
            preferred_protocols: payload.read_u32::<NativeEndian>()?,
            initialization: payload.read_u32::<NativeEndian>()?,
            active_protocol: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for ReconnectStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.share_mode)?;
        w.write_u32::<NativeEndian>(self.preferred_protocols)?;
        w.write_u32::<NativeEndian>(self.initialization)?;
        w.write_u32::<NativeEndian>(self.active_protocol)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectStruct {
    pub handle: u32,
    pub disposition: u32,
    pub rv: u32,
}

impl DisconnectStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            handle: payload.read_u32::<NativeEndian>()?,
            disposition: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for DisconnectStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.disposition)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

/// BEGIN_TRANSACTION and CANCEL_TRANSACTION requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleStruct {
    pub handle: u32,
    pub rv: u32,
}

impl HandleStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            handle: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for HandleStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndStruct {
    pub handle: u32,
    pub disposition: u32,
    pub rv: u32,
}

impl EndStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            handle: payload.read_u32::<NativeEndian>()?,
            disposition: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for EndStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.disposition)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelStruct {
    pub context: u32,
    pub rv: u32,
}

impl CancelStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            context: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for CancelStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.context)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusStruct {
    pub handle: u32,
    pub reader: String,
    pub state: u32,
    pub protocol: u32,
    pub atr: Vec<u8>,
    pub rv: u32,
}

impl StatusStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let handle = payload.read_u32::<NativeEndian>()?;
        let reader = read_name(payload)?;
        let state = payload.read_u32::<NativeEndian>()?;
        let protocol = payload.read_u32::<NativeEndian>()?;
        let atr = read_atr(payload)?;
        let rv = payload.read_u32::<NativeEndian>()?;
        Ok(Self {
            handle,
            reader,
            state,
            protocol,
            atr,
            rv,
        })
    }
}

impl Encode for StatusStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        write_name(&mut w, &self.reader)?;
        w.write_u32::<NativeEndian>(self.state)?;
        w.write_u32::<NativeEndian>(self.protocol)?;
        write_atr(&mut w, &self.atr)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitStruct {
    pub handle: u32,
    pub send_pci_protocol: u32,
    pub send_pci_length: u32,
    pub send_length: u32,
    pub recv_pci_protocol: u32,
    pub recv_pci_length: u32,
    /// On requests: the caller's receive capacity. On responses: the
    /// actual response length.
    pub recv_length: u32,
    pub rv: u32,
    /// Data when `send_length <= MAX_BUFFER_SIZE`; larger payloads travel
    /// as a trailing run.
    pub send_buffer: Vec<u8>,
    pub recv_buffer: Vec<u8>,
}

impl TransmitStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let handle = payload.read_u32::<NativeEndian>()?;
        let send_pci_protocol = payload.read_u32::<NativeEndian>()?;
        let send_pci_length = payload.read_u32::<NativeEndian>()?;
        let send_length = payload.read_u32::<NativeEndian>()?;
        let recv_pci_protocol = payload.read_u32::<NativeEndian>()?;
        let recv_pci_length = payload.read_u32::<NativeEndian>()?;
        let recv_length = payload.read_u32::<NativeEndian>()?;
        let rv = payload.read_u32::<NativeEndian>()?;
        let send_buffer = read_buffer(payload, send_length as usize)?;
        let recv_buffer = read_buffer(payload, recv_length as usize)?;
        Ok(Self {
            handle,
            send_pci_protocol,
            send_pci_length,
            send_length,
            recv_pci_protocol,
            recv_pci_length,
            recv_length,
            rv,
            send_buffer,
            recv_buffer,
        })
    }
}

impl Encode for TransmitStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.send_pci_protocol)?;
        w.write_u32::<NativeEndian>(self.send_pci_length)?;
        w.write_u32::<NativeEndian>(self.send_length)?;
        w.write_u32::<NativeEndian>(self.recv_pci_protocol)?;
        w.write_u32::<NativeEndian>(self.recv_pci_length)?;
        w.write_u32::<NativeEndian>(self.recv_length)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        write_buffer(&mut w, &self.send_buffer)?;
        write_buffer(&mut w, &self.recv_buffer)?;
        Ok(w)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStruct {
    pub handle: u32,
    pub control_code: u32,
    pub send_length: u32,
    pub recv_length: u32,
    pub rv: u32,
    pub send_buffer: Vec<u8>,
    pub recv_buffer: Vec<u8>,
}

impl ControlStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let handle = payload.read_u32::<NativeEndian>()?;
        let control_code = payload.read_u32::<NativeEndian>()?;
        let send_length = payload.read_u32::<NativeEndian>()?;
        let recv_length = payload.read_u32::<NativeEndian>()?;
        let rv = payload.read_u32::<NativeEndian>()?;
        let send_buffer = read_buffer(payload, send_length as usize)?;
        let recv_buffer = read_buffer(payload, recv_length as usize)?;
        Ok(Self {
            handle,
            control_code,
            send_length,
            recv_length,
            rv,
            send_buffer,
            recv_buffer,
        })
    }
}

impl Encode for ControlStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.control_code)?;
        w.write_u32::<NativeEndian>(self.send_length)?;
        w.write_u32::<NativeEndian>(self.recv_length)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        write_buffer(&mut w, &self.send_buffer)?;
        write_buffer(&mut w, &self.recv_buffer)?;
        Ok(w)
    }
}

/// GET_ATTRIB and SET_ATTRIB share one shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttribStruct {
    pub handle: u32,
    pub attr_id: u32,
    pub attr_len: u32,
    pub rv: u32,
    pub attr_value: Vec<u8>,
}

impl AttribStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let handle = payload.read_u32::<NativeEndian>()?;
        let attr_id = payload.read_u32::<NativeEndian>()?;
        let attr_len = payload.read_u32::<NativeEndian>()?;
        let rv = payload.read_u32::<NativeEndian>()?;
        let attr_value = read_buffer(payload, attr_len as usize)?;
        Ok(Self {
            handle,
            attr_id,
            attr_len,
            rv,
            attr_value,
        })
    }
}

impl Encode for AttribStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.handle)?;
        w.write_u32::<NativeEndian>(self.attr_id)?;
        w.write_u32::<NativeEndian>(self.attr_len)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        write_buffer(&mut w, &self.attr_value)?;
        Ok(w)
    }
}

/// LIST_READERS: the response carries a multistring of reader names
/// inside the record, after the fixed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReadersStruct {
    pub readers_len: u32,
    pub rv: u32,
    pub readers: Vec<u8>,
}

impl ListReadersStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let readers_len = payload.read_u32::<NativeEndian>()?;
        let rv = payload.read_u32::<NativeEndian>()?;
        if readers_len as usize > MAX_MESSAGE_SIZE - 8 {
            return Err(invalid_data("readers multistring too long"));
        }
        let mut readers = vec![0u8; readers_len as usize];
        payload.read_exact(&mut readers)?;
        Ok(Self {
            readers_len,
            rv,
            readers,
        })
    }
}

impl Encode for ListReadersStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.readers.len() as u32)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        w.write_all(&self.readers)?;
        Ok(w)
    }
}

/// One entry of a GET_STATUS_CHANGE call or return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStateEntry {
    pub reader: String,
    pub current_state: u32,
    pub event_state: u32,
    /// The slot's state counter as last witnessed by the client.
    pub counter: u32,
    pub atr: Vec<u8>,
}

impl ReaderStateEntry {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let reader = read_name(payload)?;
        let current_state = payload.read_u32::<NativeEndian>()?;
        let event_state = payload.read_u32::<NativeEndian>()?;
        let counter = payload.read_u32::<NativeEndian>()?;
        let atr = read_atr(payload)?;
        Ok(Self {
            reader,
            current_state,
            event_state,
            counter,
            atr,
        })
    }

    pub fn encode(&self, w: &mut Vec<u8>) -> io::Result<()> {
        write_name(w, &self.reader)?;
        w.write_u32::<NativeEndian>(self.current_state)?;
        w.write_u32::<NativeEndian>(self.event_state)?;
        w.write_u32::<NativeEndian>(self.counter)?;
        write_atr(w, &self.atr)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStatusChangeStruct {
    pub context: u32,
    pub timeout: u32,
    pub rv: u32,
    pub states: Vec<ReaderStateEntry>,
}

impl GetStatusChangeStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let context = payload.read_u32::<NativeEndian>()?;
        let timeout = payload.read_u32::<NativeEndian>()?;
        let rv = payload.read_u32::<NativeEndian>()?;
        let count = payload.read_u32::<NativeEndian>()? as usize;
        if count > MAX_READER_STATES {
            return Err(invalid_data("too many reader states"));
        }
        let mut states = Vec::with_capacity(count);
        for _ in 0..count {
            states.push(ReaderStateEntry::decode(payload)?);
        }
        Ok(Self {
            context,
            timeout,
            rv,
            states,
        })
    }
}

impl Encode for GetStatusChangeStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        if self.states.len() > MAX_READER_STATES {
            return Err(invalid_data("too many reader states"));
        }
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.context)?;
        w.write_u32::<NativeEndian>(self.timeout)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        w.write_u32::<NativeEndian>(self.states.len() as u32)?;
        for state in &self.states {
            state.encode(&mut w)?;
        }
        Ok(w)
    }
}

/// One row of the CMD_GET_READERS_STATE dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStateRecord {
    pub reader: String,
    pub state: u32,
    pub counter: u32,
    pub sharing: i32,
    pub protocol: u32,
    pub atr: Vec<u8>,
}

impl ReaderStateRecord {
    pub fn empty() -> Self {
        Self {
            reader: String::new(),
            state: 0,
            counter: 0,
            sharing: 0,
            protocol: 0,
            atr: Vec::new(),
        }
    }

    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let reader = read_name(payload)?;
        let state = payload.read_u32::<NativeEndian>()?;
        let counter = payload.read_u32::<NativeEndian>()?;
        let sharing = payload.read_i32::<NativeEndian>()?;
        let protocol = payload.read_u32::<NativeEndian>()?;
        let atr = read_atr(payload)?;
        Ok(Self {
            reader,
            state,
            counter,
            sharing,
            protocol,
            atr,
        })
    }

    pub fn encode(&self, w: &mut Vec<u8>) -> io::Result<()> {
        write_name(w, &self.reader)?;
        w.write_u32::<NativeEndian>(self.state)?;
        w.write_u32::<NativeEndian>(self.counter)?;
        w.write_i32::<NativeEndian>(self.sharing)?;
        w.write_u32::<NativeEndian>(self.protocol)?;
        write_atr(w, &self.atr)?;
        Ok(())
    }
}

/// The CMD_GET_READERS_STATE response: the whole fixed-capacity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadersStateStruct {
    pub rv: u32,
    pub records: Vec<ReaderStateRecord>,
}

impl ReadersStateStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        let rv = payload.read_u32::<NativeEndian>()?;
        let mut records = Vec::with_capacity(MAX_READERS);
        for _ in 0..MAX_READERS {
            records.push(ReaderStateRecord::decode(payload)?);
        }
        Ok(Self { rv, records })
    }
}

impl Encode for ReadersStateStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        if self.records.len() != MAX_READERS {
            return Err(invalid_data("reader state dump must cover every slot"));
        }
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.rv)?;
        for record in &self.records {
            record.encode(&mut w)?;
        }
        Ok(w)
    }
}

/// Replies to CMD_WAIT_READER_STATE_CHANGE and its STOP companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReaderStateChangeStruct {
    pub timeout: u32,
    pub rv: u32,
}

impl WaitReaderStateChangeStruct {
    pub fn decode(payload: &mut Payload) -> io::Result<Self> {
        Ok(Self {
            timeout: payload.read_u32::<NativeEndian>()?,
            rv: payload.read_u32::<NativeEndian>()?,
        })
    }
}

impl Encode for WaitReaderStateChangeStruct {
    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut w = vec![];
        w.write_u32::<NativeEndian>(self.timeout)?;
        w.write_u32::<NativeEndian>(self.rv)?;
        Ok(w)
    }
}

/// Reads one fixed-size record: header plus data area.
pub fn read_message(stream: &mut dyn Read) -> io::Result<(Header, Payload)> {
    let mut raw = vec![0u8; HEADER_SIZE + MAX_MESSAGE_SIZE];
    stream.read_exact(&mut raw)?;
    let mut payload = Cursor::new(raw);
    let header = Header::decode(&mut payload)?;
    Ok((header, payload))
}

/// Writes one fixed-size record. `body` must fit the data area; it is
/// zero-padded to [`MAX_MESSAGE_SIZE`].
pub fn write_message(
    stream: &mut dyn Write,
    header: &Header,
    body: &[u8],
) -> io::Result<()> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(invalid_data("message body exceeds the data area"));
    }
    let mut raw = Vec::with_capacity(HEADER_SIZE + MAX_MESSAGE_SIZE);
    header.encode(&mut raw)?;
    raw.extend_from_slice(body);
    raw.resize(HEADER_SIZE + MAX_MESSAGE_SIZE, 0);
    stream.write_all(&raw)
}
