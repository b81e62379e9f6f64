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

//! scardd is a user-space resource manager for smart card readers. It
//! arbitrates access to readers between unrelated client processes over a
//! local stream socket: clients establish contexts, enumerate readers,
//! connect to inserted cards, exchange APDUs and watch insertion/removal
//! events, while the daemon drives vendor IFD handler drivers and enforces
//! the exclusive/shared sharing disciplines.

#[macro_use]
extern crate log;

pub mod atr;
pub mod cards;
pub mod config;
pub mod contexts;
pub mod errors;
pub mod events;
pub mod hotplug;
pub mod ifd;
pub mod readers;
pub mod server;
pub mod state;
pub mod wire;

/// Maximum length of a reader display name, including the NUL padding the
/// wire format carries.
pub const MAX_READERNAME: usize = 128;

/// Maximum length of an Answer-To-Reset.
pub const MAX_ATR_SIZE: usize = 33;

/// Size of the short-APDU buffers embedded in wire records.
pub const MAX_BUFFER_SIZE: usize = 264;

/// Hard ceiling on a transmit/control payload (extended APDU plus the
/// protocol overhead). Requests beyond this are refused before any driver
/// call is made.
pub const MAX_BUFFER_SIZE_EXTENDED: usize = 65544;

/// Capacity of the reader slot table.
pub const MAX_READERS: usize = 16;

/// How long an event worker sleeps between presence polls.
pub const STATUS_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(400);

/// Ceiling on how long `begin_transaction` waits for another handle to drop
/// the transaction lock before giving up with a sharing violation.
pub const TRANSACTION_WAIT: std::time::Duration = std::time::Duration::from_millis(150);

/// Wire protocol version, negotiated by the first message on every client
/// connection. A major mismatch is fatal for the client.
pub const PROTOCOL_VERSION_MAJOR: u32 = 4;
pub const PROTOCOL_VERSION_MINOR: u32 = 2;

/// Timeout sentinel for `GetStatusChange`.
pub const TIMEOUT_INFINITE: u32 = 0xffff_ffff;
