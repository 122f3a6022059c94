//! Beat Finder (spec.md §4.4): listens on UDP 50001 and dispatches beat,
//! on-air, fader-start, sync-control, master-handoff, and precise-position
//! packets to a single broadcast channel of typed events.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch, Mutex};

use crate::device::DeviceUpdate;
use crate::proto::{self, ChannelsOnAirPacket, FaderStartPacket, MasterHandoffRequestPacket, MasterHandoffResponsePacket, Packet, PrecisePositionPacket, SyncControlPacket};
use crate::Result;

/// One dispatched event from the beat port. `BeatFinder::start` delivers
/// these to every subscriber; dispatch for sync/on-air/handoff completes
/// the listener API spec.md §9's Open Questions flags as incomplete in
/// the source.
#[derive(Debug, Clone, PartialEq)]
pub enum BeatEvent {
    Beat(DeviceUpdate),
    ChannelsOnAir(ChannelsOnAirPacket),
    FaderStart(FaderStartPacket),
    SyncControl(SyncControlPacket),
    MasterHandoffRequest(MasterHandoffRequestPacket),
    MasterHandoffResponse(MasterHandoffResponsePacket),
    PrecisePosition(PrecisePositionPacket),
}

pub struct BeatFinder {
    events_tx: broadcast::Sender<BeatEvent>,
    ignored: Arc<Mutex<Vec<Ipv4Addr>>>,
    stop_tx: watch::Sender<bool>,
}

impl BeatFinder {
    pub async fn start(
        ignored_addresses: Vec<Ipv4Addr>,
    ) -> Result<(BeatFinder, tokio::task::JoinHandle<()>)> {
        let socket = UdpSocket::bind(("0.0.0.0", proto::BEAT_PORT)).await?;
        socket.set_broadcast(true)?;

        let (events_tx, _) = broadcast::channel(256);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ignored = Arc::new(Mutex::new(ignored_addresses));

        let finder = BeatFinder {
            events_tx: events_tx.clone(),
            ignored: ignored.clone(),
            stop_tx,
        };

        let handle = tokio::spawn(run(socket, events_tx, ignored, stop_rx));

        Ok((finder, handle))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BeatEvent> {
        self.events_tx.subscribe()
    }

    pub async fn ignore(&self, addr: Ipv4Addr) {
        self.ignored.lock().await.push(addr);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn run(
    socket: UdpSocket,
    events_tx: broadcast::Sender<BeatEvent>,
    ignored: Arc<Mutex<Vec<Ipv4Addr>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(target: "djlink", "beat finder recv error: {}", e);
                        continue;
                    }
                };
                let std::net::IpAddr::V4(from) = from.ip() else { continue };
                if ignored.lock().await.contains(&from) {
                    continue;
                }
                if let Some(event) = dispatch(&buf[..len]) {
                    let _ = events_tx.send(event);
                }
            }
        }
    }
}

fn dispatch(data: &[u8]) -> Option<BeatEvent> {
    let pkt = Packet::parse(data, proto::BEAT_PORT).ok()?;
    Some(match pkt {
        Packet::Beat(b) => BeatEvent::Beat(DeviceUpdate::from_beat(&b)),
        Packet::ChannelsOnAir(p) => BeatEvent::ChannelsOnAir(p),
        Packet::FaderStart(p) => BeatEvent::FaderStart(p),
        Packet::SyncControl(p) => BeatEvent::SyncControl(p),
        Packet::MasterHandoffRequest(p) => BeatEvent::MasterHandoffRequest(p),
        Packet::MasterHandoffResponse(p) => BeatEvent::MasterHandoffResponse(p),
        Packet::PrecisePosition(p) => BeatEvent::PrecisePosition(p),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::BeatPacket;

    #[test]
    fn test_dispatch_beat_packet() {
        let pkt = BeatPacket {
            name: "CDJ-2000NXS2".to_string(),
            device_num: 2,
            next_beat: 500,
            second_beat: 1000,
            next_bar: 2000,
            fourth_beat: 1500,
            second_bar: 4000,
            eighth_beat: 3500,
            pitch: 0x100000,
            bpm_x100: 12800,
            beat_within_bar: 1,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        match dispatch(&buf) {
            Some(BeatEvent::Beat(DeviceUpdate::Beat { device_num, .. })) => {
                assert_eq!(device_num, 2);
            }
            other => panic!("unexpected dispatch result: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_unknown_returns_none() {
        let buf = [0u8; 11];
        assert!(dispatch(&buf).is_none());
    }
}
