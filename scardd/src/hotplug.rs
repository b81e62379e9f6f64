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

//! Hotplug ingest. The OS-specific discovery source (libudev and friends)
//! lives outside the core; what arrives here is an abstract stream of
//! "reader appeared / reader vanished" events. They are matched against a
//! database of driver bundles and turned into registry add/remove calls.

use crate::readers::{AddReaderError, Registry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

/// Channel ids for hotplugged readers start here; static config readers
/// use the channel from their stanza.
pub const HOTPLUG_BASE_CHANNEL: u32 = 0x20_0000;

/// Environment override for the bundle drop directory.
pub const DROPDIR_ENV: &str = "PCSCLITE_HP_DROPDIR";
pub const DEFAULT_DROPDIR: &str = "/usr/lib/pcsc/drivers";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub interface_name: Option<String>,
    /// Stable per-device path (e.g. `/dev/bus/usb/003/004`), the key for
    /// the matching remove event.
    pub bus_path: String,
}

/// One `(vendor, product)` entry declared by a driver bundle.
#[derive(Debug, Clone)]
pub struct BundleDriver {
    pub vendor_id: u16,
    pub product_id: u16,
    pub friendly_name: String,
    pub library_path: PathBuf,
    /// Class drivers cover whole device classes; a vendor-specific match
    /// always wins over them.
    pub class_driver: bool,
}

#[derive(Debug, Default)]
pub struct DriverDatabase {
    drivers: Vec<BundleDriver>,
}

impl DriverDatabase {
    /// Scans `<drop_dir>/*.bundle/Contents/Info.plist`. Unreadable or
    /// malformed bundles are skipped; an absent drop directory yields an
    /// empty database.
    pub fn load(drop_dir: &Path) -> Self {
        let mut drivers = Vec::new();
        let entries = match std::fs::read_dir(drop_dir) {
            Ok(entries) => entries,
            Err(e) => {
                info!("no driver bundles in {}: {}", drop_dir.display(), e);
                return Self { drivers };
            }
        };
        for entry in entries.flatten() {
            let bundle = entry.path();
            if bundle.extension().and_then(|e| e.to_str()) != Some("bundle") {
                continue;
            }
            let plist = bundle.join("Contents").join("Info.plist");
            match std::fs::read_to_string(&plist) {
                Ok(text) => drivers.extend(parse_bundle(&bundle, &text)),
                Err(e) => warn!("skipping {}: {}", plist.display(), e),
            }
        }
        info!("driver database holds {} entries", drivers.len());
        Self { drivers }
    }

    pub fn from_drivers(drivers: Vec<BundleDriver>) -> Self {
        Self { drivers }
    }

    /// The driver responsible for a device. A vendor-specific entry beats
    /// a class driver.
    pub fn matching(&self, vendor_id: u16, product_id: u16) -> Option<&BundleDriver> {
        let hits = || {
            self.drivers
                .iter()
                .filter(move |d| d.vendor_id == vendor_id && d.product_id == product_id)
        };
        hits()
            .find(|d| !d.class_driver)
            .or_else(|| hits().find(|d| d.class_driver))
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

/// Expands one bundle's plist into per-device driver entries. Vendor and
/// product lists are parallel arrays; friendly names may be shorter and
/// fall back to the last one given.
fn parse_bundle(bundle: &Path, plist: &str) -> Vec<BundleDriver> {
    let executable = match plist_values(plist, "CFBundleExecutable").into_iter().next() {
        Some(name) => name,
        None => {
            warn!("{}: no CFBundleExecutable", bundle.display());
            return Vec::new();
        }
    };
    let library_path = bundle
        .join("Contents")
        .join(std::env::consts::OS)
        .join(&executable);
    let class_driver = plist_values(plist, "CFBundleName")
        .first()
        .map(|name| name.contains("Class"))
        .unwrap_or(false);

    let vendors = plist_values(plist, "ifdVendorID");
    let products = plist_values(plist, "ifdProductID");
    let names = plist_values(plist, "ifdFriendlyName");
    if vendors.len() != products.len() {
        warn!(
            "{}: vendor/product lists differ in length",
            bundle.display()
        );
        return Vec::new();
    }

    let mut drivers = Vec::with_capacity(vendors.len());
    for (i, (vendor, product)) in vendors.iter().zip(products.iter()).enumerate() {
        let (vendor_id, product_id) = match (parse_hex16(vendor), parse_hex16(product)) {
            (Some(v), Some(p)) => (v, p),
            _ => {
                warn!("{}: bad id pair {} / {}", bundle.display(), vendor, product);
                continue;
            }
        };
        let friendly_name = names
            .get(i)
            .or_else(|| names.last())
            .cloned()
            .unwrap_or_else(|| executable.clone());
        drivers.push(BundleDriver {
            vendor_id,
            product_id,
            friendly_name,
            library_path: library_path.clone(),
            class_driver,
        });
    }
    drivers
}

fn parse_hex16(text: &str) -> Option<u16> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).ok()
}

/// Pulls the string value(s) following `<key>name</key>`: either a single
/// `<string>` or an `<array>` of them. This is the entire subset of plist
/// the bundles use.
fn plist_values(plist: &str, name: &str) -> Vec<String> {
    let marker = format!("<key>{}</key>", name);
    let rest = match plist.find(&marker) {
        Some(at) => &plist[at + marker.len()..],
        None => return Vec::new(),
    };
    let next_key = rest.find("<key>").unwrap_or(rest.len());
    let scope = &rest[..next_key];
    if let Some(array_start) = scope.find("<array>") {
        let array = match scope[array_start..].find("</array>") {
            Some(end) => &scope[array_start..array_start + end],
            None => return Vec::new(),
        };
        collect_strings(array)
    } else {
        collect_strings(scope).into_iter().take(1).collect()
    }
}

fn collect_strings(scope: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = scope;
    while let Some(start) = rest.find("<string>") {
        let tail = &rest[start + "<string>".len()..];
        match tail.find("</string>") {
            Some(end) => {
                values.push(tail[..end].trim().to_string());
                rest = &tail[end..];
            }
            None => break,
        }
    }
    values
}

/// Consumes discovery events until the sender goes away, driving registry
/// add/remove.
pub fn spawn_ingest(
    registry: Arc<Registry>,
    database: DriverDatabase,
    events: Receiver<HotplugEvent>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("hotplug".to_string())
        .spawn(move || run(registry, database, events))
        .expect("spawning the hotplug thread cannot fail")
}

fn run(registry: Arc<Registry>, database: DriverDatabase, events: Receiver<HotplugEvent>) {
    // bus_path -> (reader name, channel) as registered at add time.
    let mut plugged: HashMap<String, (String, u32)> = HashMap::new();
    let mut next_channel = HOTPLUG_BASE_CHANNEL;

    for event in events {
        match event.action {
            HotplugAction::Add => {
                let driver = match database.matching(event.vendor_id, event.product_id) {
                    Some(driver) => driver,
                    None => {
                        debug!(
                            "no driver for {:04x}:{:04x} at {}",
                            event.vendor_id, event.product_id, event.bus_path
                        );
                        continue;
                    }
                };
                let name = display_name(driver, &event);
                let channel = next_channel;
                next_channel += 1;
                match registry.add(
                    &name,
                    &event.bus_path,
                    &driver.library_path.to_string_lossy(),
                    channel,
                ) {
                    Ok(()) => {
                        plugged.insert(event.bus_path.clone(), (name, channel));
                    }
                    Err(AddReaderError::Fatal(e)) => {
                        // Startup driver failures abort the daemon; a bad
                        // hotplugged bundle only loses that device.
                        error!("hotplug driver rejected: {}", e.0);
                    }
                    Err(AddReaderError::Status(status)) => {
                        warn!("cannot add {}: {:?}", name, status);
                    }
                }
            }
            HotplugAction::Remove => match plugged.remove(&event.bus_path) {
                Some((name, channel)) => {
                    if let Err(e) = registry.remove(&name, channel) {
                        warn!("cannot remove {}: {:?}", name, e);
                    }
                }
                None => debug!("remove for unknown device {}", event.bus_path),
            },
        }
    }
    debug!("hotplug source closed");
}

/// Appends the interface name and serial when present, so two identical
/// readers stay distinguishable.
fn display_name(driver: &BundleDriver, event: &HotplugEvent) -> String {
    let mut name = driver.friendly_name.clone();
    if let Some(interface) = &event.interface_name {
        name = format!("{} [{}]", name, interface);
    }
    if let Some(serial) = &event.serial {
        name = format!("{} ({})", name, serial);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateTable;
    use std::sync::mpsc;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>libccid.so</string>
    <key>CFBundleName</key>
    <string>CCID Class driver</string>
    <key>ifdVendorID</key>
    <array>
        <string>0x04E6</string>
        <string>0x08E6</string>
    </array>
    <key>ifdProductID</key>
    <array>
        <string>0x5115</string>
        <string>0x3437</string>
    </array>
    <key>ifdFriendlyName</key>
    <array>
        <string>SCM SCR 3310</string>
        <string>Gemalto PC Twin Reader</string>
    </array>
</dict>
</plist>
"#;

    #[test]
    fn bundle_parsing_yields_one_entry_per_device() {
        let drivers = parse_bundle(Path::new("/drop/ccid.bundle"), PLIST);
        assert_eq!(drivers.len(), 2);
        assert_eq!(drivers[0].vendor_id, 0x04E6);
        assert_eq!(drivers[0].product_id, 0x5115);
        assert_eq!(drivers[0].friendly_name, "SCM SCR 3310");
        assert!(drivers[0].class_driver);
        assert_eq!(drivers[1].friendly_name, "Gemalto PC Twin Reader");
        assert!(drivers[1]
            .library_path
            .ends_with(format!("Contents/{}/libccid.so", std::env::consts::OS)));
    }

    #[test]
    fn database_loads_from_drop_directory() {
        let drop = tempfile::tempdir().unwrap();
        let contents = drop.path().join("ccid.bundle").join("Contents");
        std::fs::create_dir_all(&contents).unwrap();
        std::fs::write(contents.join("Info.plist"), PLIST).unwrap();
        // Non-bundle clutter is ignored.
        std::fs::write(drop.path().join("README"), "not a bundle").unwrap();

        let database = DriverDatabase::load(drop.path());
        assert!(database.matching(0x04E6, 0x5115).is_some());
        assert!(database.matching(0x1234, 0x5678).is_none());
    }

    #[test]
    fn missing_drop_directory_is_an_empty_database() {
        let database = DriverDatabase::load(Path::new("/nonexistent/dropdir"));
        assert!(database.is_empty());
    }

    #[test]
    fn vendor_specific_driver_beats_class_driver() {
        let class = BundleDriver {
            vendor_id: 0x04E6,
            product_id: 0x5115,
            friendly_name: "Class".to_string(),
            library_path: PathBuf::from("/class.so"),
            class_driver: true,
        };
        let vendor = BundleDriver {
            vendor_id: 0x04E6,
            product_id: 0x5115,
            friendly_name: "Vendor".to_string(),
            library_path: PathBuf::from("/vendor.so"),
            class_driver: false,
        };
        let database = DriverDatabase::from_drivers(vec![class, vendor]);
        assert_eq!(
            database.matching(0x04E6, 0x5115).unwrap().friendly_name,
            "Vendor"
        );
    }

    #[test]
    fn display_name_appends_interface_and_serial() {
        let driver = BundleDriver {
            vendor_id: 0,
            product_id: 0,
            friendly_name: "Reader".to_string(),
            library_path: PathBuf::new(),
            class_driver: false,
        };
        let mut event = HotplugEvent {
            action: HotplugAction::Add,
            vendor_id: 0,
            product_id: 0,
            serial: None,
            interface_name: None,
            bus_path: "usb:1".to_string(),
        };
        assert_eq!(display_name(&driver, &event), "Reader");
        event.interface_name = Some("Keyboard".to_string());
        event.serial = Some("12345".to_string());
        assert_eq!(display_name(&driver, &event), "Reader [Keyboard] (12345)");
    }

    #[test]
    fn unmatched_and_unloadable_devices_are_skipped() {
        let registry = Registry::new(Arc::new(StateTable::new()));
        let database = DriverDatabase::from_drivers(vec![BundleDriver {
            vendor_id: 0x04E6,
            product_id: 0x5115,
            friendly_name: "Ghost".to_string(),
            library_path: PathBuf::from("/nonexistent/driver.so"),
            class_driver: false,
        }]);
        let (tx, rx) = mpsc::channel();
        let worker = spawn_ingest(registry.clone(), database, rx);

        // Unknown device: no driver in the database.
        tx.send(HotplugEvent {
            action: HotplugAction::Add,
            vendor_id: 0x1111,
            product_id: 0x2222,
            serial: None,
            interface_name: None,
            bus_path: "usb:a".to_string(),
        })
        .unwrap();
        // Known device whose driver cannot be loaded.
        tx.send(HotplugEvent {
            action: HotplugAction::Add,
            vendor_id: 0x04E6,
            product_id: 0x5115,
            serial: None,
            interface_name: None,
            bus_path: "usb:b".to_string(),
        })
        .unwrap();
        // Remove for a device that never registered.
        tx.send(HotplugEvent {
            action: HotplugAction::Remove,
            vendor_id: 0x04E6,
            product_id: 0x5115,
            serial: None,
            interface_name: None,
            bus_path: "usb:b".to_string(),
        })
        .unwrap();
        drop(tx);
        worker.join().unwrap();

        assert!(registry.reader_names().is_empty());
    }
}
