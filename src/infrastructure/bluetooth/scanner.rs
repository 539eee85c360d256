//! BLE Scanner Module
//!
//! Tracks scan sessions for the binding: which devices were already reported
//! during the current session, and which devices have been seen at all (so a
//! later `connect` can resolve them).

use crate::domain::models::{DeviceDescriptor, DeviceModel};
use crate::infrastructure::bluetooth::protocol;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub struct BleScanner {
    scanning: bool,
    filter_names: bool,
    /// Macs reported during the current scan session
    reported: HashSet<String>,
    /// Every device seen since the binding started
    seen: HashMap<String, DeviceDescriptor>,
}

impl BleScanner {
    /// Create a new scanner
    ///
    /// # Arguments
    /// * `filter_names` - Drop advertisers whose name does not look like a ring
    pub fn new(filter_names: bool) -> Self {
        Self {
            scanning: false,
            filter_names,
            reported: HashSet::new(),
            seen: HashMap::new(),
        }
    }

    /// Start a new scan session
    pub fn begin(&mut self) {
        info!("Starting BLE scan session");
        self.reported.clear();
        self.scanning = true;
    }

    pub fn end(&mut self) {
        if self.scanning {
            info!("Stopping BLE scan session");
        }
        self.scanning = false;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record an advertisement. Returns the descriptor when it should be
    /// reported, i.e. it passes the name filter and was not reported yet in
    /// this session.
    pub fn on_discovered(
        &mut self,
        mac: &str,
        name: Option<&str>,
        model: DeviceModel,
    ) -> Option<DeviceDescriptor> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(protocol::UNKNOWN_DEVICE_NAME);

        if self.filter_names && !protocol::matches_ring_name(name) {
            return None;
        }

        // Keep a previously learned model when the advertisement carries none
        let model = match self.seen.get(mac) {
            Some(existing) if model == 0 => existing.model,
            _ => model,
        };
        let device = DeviceDescriptor::new(mac, name, model);
        self.seen.insert(mac.to_string(), device.clone());

        if !self.reported.insert(mac.to_string()) {
            debug!(mac, "Duplicate advertisement ignored");
            return None;
        }
        Some(device)
    }

    pub fn lookup(&self, mac: &str) -> Option<&DeviceDescriptor> {
        self.seen.get(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_within_session_only() {
        let mut scanner = BleScanner::new(false);
        scanner.begin();
        assert!(scanner.on_discovered("AA", Some("O2Ring 0001"), 1).is_some());
        assert!(scanner.on_discovered("AA", Some("O2Ring 0001"), 1).is_none());
        assert!(scanner.on_discovered("BB", None, 1).is_some());

        scanner.end();
        scanner.begin();
        assert!(scanner.on_discovered("AA", Some("O2Ring 0001"), 1).is_some());
    }

    #[test]
    fn test_name_filter_and_lookup() {
        let mut scanner = BleScanner::new(true);
        scanner.begin();
        assert!(scanner.on_discovered("CC", Some("Heart Strap"), 0).is_none());
        assert!(scanner.on_discovered("DD", None, 0).is_none());

        let ring = scanner.on_discovered("EE", Some("O2Ring 9F3C"), 7).unwrap();
        assert_eq!(ring.name, "O2Ring 9F3C");
        assert_eq!(scanner.lookup("EE").map(|d| d.model), Some(7));
        assert!(scanner.lookup("CC").is_none());

        // Model learned earlier survives a model-less advertisement
        scanner.begin();
        let again = scanner.on_discovered("EE", Some("O2Ring 9F3C"), 0).unwrap();
        assert_eq!(again.model, 7);
    }
}
