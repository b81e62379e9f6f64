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

//! The static reader configuration file: one stanza per non-hotplug
//! reader with `FRIENDLYNAME`, `DEVICENAME`, `LIBPATH` and `CHANNELID`.
//! A missing file is not an error, the daemon just starts with no static
//! readers.

use std::io;
use std::path::Path;

pub const DEFAULT_READER_CONF: &str = "/etc/reader.conf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialReader {
    pub friendly_name: String,
    pub device_name: String,
    pub library_path: String,
    pub channel_id: u32,
}

/// Loads the configuration file. `NotFound` yields an empty set; other
/// I/O failures are real errors.
pub fn load_reader_conf(path: &Path) -> io::Result<Vec<SerialReader>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_reader_conf(&text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no reader configuration at {}", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// A stanza starts at `FRIENDLYNAME`; it is complete once all four keys
/// have been seen. Incomplete stanzas are dropped with a warning.
pub fn parse_reader_conf(text: &str) -> Vec<SerialReader> {
    let mut readers = Vec::new();
    let mut current = PartialReader::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => {
                warn!("ignoring malformed config line: {}", line);
                continue;
            }
        };
        match key {
            "FRIENDLYNAME" => {
                current.flush(&mut readers);
                current.friendly_name = Some(unquote(value).to_string());
            }
            "DEVICENAME" => current.device_name = Some(unquote(value).to_string()),
            "LIBPATH" => current.library_path = Some(unquote(value).to_string()),
            "CHANNELID" => match parse_channel(value) {
                Some(channel) => current.channel_id = Some(channel),
                None => warn!("bad CHANNELID: {}", value),
            },
            other => debug!("ignoring unknown config key {}", other),
        }
    }
    current.flush(&mut readers);
    readers
}

#[derive(Default)]
struct PartialReader {
    friendly_name: Option<String>,
    device_name: Option<String>,
    library_path: Option<String>,
    channel_id: Option<u32>,
}

impl PartialReader {
    fn flush(&mut self, readers: &mut Vec<SerialReader>) {
        let stanza = std::mem::take(self);
        match (
            stanza.friendly_name,
            stanza.device_name,
            stanza.library_path,
            stanza.channel_id,
        ) {
            (Some(friendly_name), Some(device_name), Some(library_path), Some(channel_id)) => {
                readers.push(SerialReader {
                    friendly_name,
                    device_name,
                    library_path,
                    channel_id,
                });
            }
            (None, None, None, None) => {}
            (Some(name), ..) => warn!("incomplete reader stanza for {}", name),
            _ => warn!("reader stanza without FRIENDLYNAME"),
        }
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_channel(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_two_reader_file() {
        let text = r#"
# A serial reader on the first port.
FRIENDLYNAME "GemPC Twin"
DEVICENAME /dev/ttyS0
LIBPATH /usr/lib/pcsc/drivers/serial/libgtwin.so
CHANNELID 0x0103F8

FRIENDLYNAME "Dumb Reader"
DEVICENAME /dev/ttyS1
LIBPATH /usr/lib/pcsc/drivers/serial/libdumb.so
CHANNELID 0x0102F8
"#;
        let readers = parse_reader_conf(text);
        assert_eq!(readers.len(), 2);
        assert_eq!(readers[0].friendly_name, "GemPC Twin");
        assert_eq!(readers[0].device_name, "/dev/ttyS0");
        assert_eq!(readers[0].channel_id, 0x0103F8);
        assert_eq!(readers[1].friendly_name, "Dumb Reader");
        assert_eq!(readers[1].channel_id, 0x0102F8);
    }

    #[test]
    fn incomplete_stanzas_are_dropped() {
        let text = r#"
FRIENDLYNAME "No Library"
DEVICENAME /dev/ttyS0
CHANNELID 1

FRIENDLYNAME "Complete"
DEVICENAME /dev/ttyS1
LIBPATH /lib/drv.so
CHANNELID 2
"#;
        let readers = parse_reader_conf(text);
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].friendly_name, "Complete");
    }

    #[test]
    fn decimal_channel_ids_are_accepted() {
        let text = "FRIENDLYNAME \"R\"\nDEVICENAME /dev/null\nLIBPATH /lib/d.so\nCHANNELID 42\n";
        assert_eq!(parse_reader_conf(text)[0].channel_id, 42);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert!(parse_reader_conf("# nothing here\n\n   \n").is_empty());
    }

    #[test]
    fn missing_file_yields_no_readers() {
        let readers = load_reader_conf(Path::new("/nonexistent/reader.conf")).unwrap();
        assert!(readers.is_empty());
    }
}
