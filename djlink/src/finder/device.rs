//! Device Finder (spec.md §4.3): listens on UDP 50000, maintains the live
//! device set, ages out silent entries, and fans out found/lost events.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;

use crate::device::{DeviceAddress, DeviceAnnouncement, DEFAULT_EVICTION_TIMEOUT};
use crate::proto::{self, Packet};
use crate::Result;

/// Found/lost fan-out event. Cloned to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Found(DeviceAnnouncement),
    Lost(DeviceAnnouncement),
}

struct Entry {
    announcement: DeviceAnnouncement,
    last_seen: Instant,
}

type DeviceKey = (Ipv4Addr, u8);

struct Shared {
    devices: Mutex<HashMap<DeviceKey, Entry>>,
    ignored: Mutex<Vec<Ipv4Addr>>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

/// Handle to a running Device Finder. Cloning gives another subscriber;
/// dropping the handle does not stop the finder (call [`DeviceFinder::stop`]).
#[derive(Clone)]
pub struct DeviceFinder {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
}

impl DeviceFinder {
    /// Binds the announcement-port socket and spawns the receive/aging
    /// loop. `ignored_addresses` seeds the drop list (spec.md §3 "device
    /// set invariant").
    pub async fn start(ignored_addresses: Vec<Ipv4Addr>) -> Result<(DeviceFinder, tokio::task::JoinHandle<()>)> {
        let socket = UdpSocket::bind(("0.0.0.0", proto::ANNOUNCEMENT_PORT)).await?;
        socket.set_broadcast(true)?;

        let (events_tx, _) = broadcast::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            devices: Mutex::new(HashMap::new()),
            ignored: Mutex::new(ignored_addresses),
            events_tx,
        });

        let finder = DeviceFinder {
            shared: shared.clone(),
            stop_tx,
        };

        let handle = tokio::spawn(run(socket, shared, stop_rx));

        Ok((finder, handle))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events_tx.subscribe()
    }

    pub async fn ignore(&self, addr: Ipv4Addr) {
        self.shared.ignored.lock().await.push(addr);
    }

    /// Stops the receive loop; remaining devices are each reported lost.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn devices(&self) -> Vec<DeviceAnnouncement> {
        self.shared
            .devices
            .lock()
            .await
            .values()
            .map(|e| e.announcement.clone())
            .collect()
    }
}

async fn run(socket: UdpSocket, shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let mut buf = [0u8; 2048];
    let mut aging = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    flush(&shared).await;
                    return;
                }
            }
            _ = aging.tick() => {
                age_out(&shared, DEFAULT_EVICTION_TIMEOUT).await;
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(target: "djlink", "device finder recv error: {}", e);
                        continue;
                    }
                };
                handle_packet(&shared, &buf[..len], from.ip()).await;
            }
        }
    }
}

async fn handle_packet(shared: &Arc<Shared>, data: &[u8], from: std::net::IpAddr) {
    let std::net::IpAddr::V4(from) = from else {
        return;
    };

    if shared.ignored.lock().await.contains(&from) {
        return;
    }

    let pkt = match Packet::parse(data, proto::ANNOUNCEMENT_PORT) {
        Ok(p) => p,
        Err(_) => return,
    };

    let raw = match pkt {
        Packet::DeviceHello(p) | Packet::DeviceKeepAlive(p) => p,
        _ => return,
    };

    let announcement = DeviceAnnouncement::from_packet(&raw);
    for logical in fan_out(&announcement) {
        upsert(shared, logical).await;
    }
}

/// Opus Quad / XDJ-AZ report one physical address but four logical device
/// numbers (spec.md §3); every other device fans out to itself.
fn fan_out(announcement: &DeviceAnnouncement) -> Vec<DeviceAnnouncement> {
    match crate::device::opus_logical_numbers(announcement) {
        Some(numbers) => numbers
            .iter()
            .map(|&n| {
                let mut a = announcement.clone();
                a.address.device_num = n;
                a
            })
            .collect(),
        None => vec![announcement.clone()],
    }
}

async fn upsert(shared: &Arc<Shared>, announcement: DeviceAnnouncement) {
    let key = (announcement.address.ip_addr, announcement.address.device_num);
    let mut devices = shared.devices.lock().await;
    let is_new = !devices.contains_key(&key);
    devices.insert(
        key,
        Entry {
            announcement: announcement.clone(),
            last_seen: Instant::now(),
        },
    );
    drop(devices);

    if is_new {
        debug!(target: "djlink", "device found: {} ({:?})", announcement.name, key);
        let _ = shared.events_tx.send(DeviceEvent::Found(announcement));
    }
}

async fn age_out(shared: &Arc<Shared>, timeout: Duration) {
    let now = Instant::now();
    let mut lost = Vec::new();
    {
        let mut devices = shared.devices.lock().await;
        devices.retain(|_, entry| {
            let alive = now.duration_since(entry.last_seen) < timeout;
            if !alive {
                lost.push(entry.announcement.clone());
            }
            alive
        });
    }
    for announcement in lost {
        debug!(target: "djlink", "device lost: {}", announcement.name);
        let _ = shared.events_tx.send(DeviceEvent::Lost(announcement));
    }
}

async fn flush(shared: &Arc<Shared>) {
    let remaining: Vec<_> = {
        let mut devices = shared.devices.lock().await;
        devices.drain().map(|(_, e)| e.announcement).collect()
    };
    for announcement in remaining {
        let _ = shared.events_tx.send(DeviceEvent::Lost(announcement));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_opus_quad_produces_four_numbers() {
        let announcement = DeviceAnnouncement {
            name: "OPUS-QUAD".to_string(),
            address: DeviceAddress {
                device_num: 1,
                ip_addr: Ipv4Addr::new(10, 0, 0, 5),
                mac_addr: [0; 6],
            },
            device_type: 1,
        };
        let fanned = fan_out(&announcement);
        let numbers: Vec<u8> = fanned.iter().map(|a| a.address.device_num).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fan_out_regular_cdj_is_single_entry() {
        let announcement = DeviceAnnouncement {
            name: "CDJ-2000NXS2".to_string(),
            address: DeviceAddress {
                device_num: 2,
                ip_addr: Ipv4Addr::new(10, 0, 0, 2),
                mac_addr: [0; 6],
            },
            device_type: 1,
        };
        assert_eq!(fan_out(&announcement).len(), 1);
    }
}
