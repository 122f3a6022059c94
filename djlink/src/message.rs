//! Library event types (spec.md §6 "outputs"): device-found, device-lost,
//! per-port update, master-changed, and the error event the CLI boundary
//! emits per spec.md §7. These are what [`crate::DjLink::next`] yields and
//! what `djlink-cli` serializes as JSONL.

use serde::Serialize;

use crate::device::{DeviceAnnouncement, DeviceUpdate};

/// One event delivered to API callers, carrying enough to drive a JSONL
/// CLI directly without any further lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    DeviceFound(DeviceAnnouncement),
    DeviceLost(DeviceAnnouncement),
    Update(DeviceUpdate),
    /// Fired exactly once per tempo-master transition (spec.md §4.5 Phase
    /// E); `device_num` is `None` when the pointer goes null.
    MasterChanged { device_num: Option<u8> },
    /// A background-thread failure that was caught and logged rather than
    /// propagated (spec.md §7 "user-visible failure behavior").
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceAddress;
    use std::net::Ipv4Addr;

    #[test]
    fn test_master_changed_serializes_tag() {
        let event = Event::MasterChanged { device_num: Some(2) };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"master-changed\""));
    }

    #[test]
    fn test_device_found_roundtrips_through_json() {
        let event = Event::DeviceFound(DeviceAnnouncement {
            name: "CDJ-2000NXS2".to_string(),
            address: DeviceAddress {
                device_num: 2,
                ip_addr: Ipv4Addr::new(10, 0, 0, 2),
                mac_addr: [0, 1, 2, 3, 4, 5],
            },
            device_type: 1,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("device-found"));
        assert!(json.contains("10.0.0.2"));
    }
}
