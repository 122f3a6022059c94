//! Virtual Rekordbox (spec.md §4.6): an Opus-compatibility participant.
//! Opus Quad / XDJ-AZ hardware only exposes track metadata as a PSSI
//! (song-structure) blob over the status port, addressed to a rekordbox
//! device number rather than over the dbserver protocol. This module
//! claims a number in the high range, requests PSSI data whenever a
//! watched player's track changes, and matches the reassembled blob's
//! content hash against a caller-supplied archive index.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch, Mutex};

use crate::finder::device::DeviceFinder;
use crate::player::{select_interface, Player};
use crate::proto::{self, DeviceAnnouncePacket, OpusMetadataRequestPacket, Packet};
use crate::{DjLinkError, Result};

/// One entry from a caller-supplied analysis archive: the PSSI fingerprint
/// it was built from, mapped back to the archive's own rekordbox track id
/// and the USB slot it was loaded from (spec.md §4.6/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub pssi_sha1: [u8; 20],
    pub archive_rekordbox_id: u32,
    pub usb_slot: u8,
}

/// High-range device numbers reserved for rekordbox-identity participants
/// (spec.md §4.6). Claimed by simplified self-assignment, no mixer
/// arbitration.
pub const HIGH_RANGE_START: u8 = 0x13;
pub const HIGH_RANGE_END: u8 = 0x26;

struct Reassembly {
    total: u16,
    parts: HashMap<u16, Vec<u8>>,
}

struct State {
    device_num: u8,
    archive_by_hash: HashMap<[u8; 20], ArchiveEntry>,
    player_match: HashMap<u8, (u8, u32)>,
    last_rekordbox_id: HashMap<u8, u32>,
    reassembly: HashMap<u8, Reassembly>,
    last_nonzero_flags: HashMap<u8, u8>,
}

pub struct VirtualRekordbox {
    state: Arc<Mutex<State>>,
    stop_tx: watch::Sender<bool>,
}

impl VirtualRekordbox {
    /// Waits for at least one device to be visible, claims a high-range
    /// device number, and starts the identity-keepalive and PSSI-matching
    /// loops. Returns [`DjLinkError::NoDevicesVisible`] if nothing answers
    /// within the poll window (spec.md §9).
    pub async fn start(
        name: &str,
        device_finder: &DeviceFinder,
        player: &Player,
        archive_index: Vec<ArchiveEntry>,
    ) -> Result<(VirtualRekordbox, Vec<tokio::task::JoinHandle<()>>)> {
        let anchor = wait_for_devices(device_finder).await?;
        let interface = select_interface(anchor, None).await?;

        let used: Vec<u8> = device_finder
            .devices()
            .await
            .into_iter()
            .map(|d| d.address.device_num)
            .collect();
        let device_num = (HIGH_RANGE_START..=HIGH_RANGE_END)
            .find(|n| !used.contains(n))
            .ok_or_else(|| {
                DjLinkError::ProtocolError("no free rekordbox device number".to_string())
            })?;

        let archive_by_hash = archive_index.into_iter().map(|e| (e.pssi_sha1, e)).collect();

        let state = Arc::new(Mutex::new(State {
            device_num,
            archive_by_hash,
            player_match: HashMap::new(),
            last_rekordbox_id: HashMap::new(),
            reassembly: HashMap::new(),
            last_nonzero_flags: HashMap::new(),
        }));

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let announce_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        announce_socket.set_broadcast(true)?;
        let broadcast_addr =
            SocketAddr::new(interface.broadcast_addr.into(), proto::ANNOUNCEMENT_PORT);

        handles.push(tokio::spawn(identity_loop(
            announce_socket,
            broadcast_addr,
            name.to_string(),
            device_num,
            interface.mac_addr,
            interface.ip_addr.octets(),
            stop_rx.clone(),
        )));

        let request_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        handles.push(tokio::spawn(pssi_loop(
            request_socket,
            state.clone(),
            player.subscribe_status_packets(),
            device_num,
            stop_rx.clone(),
        )));

        Ok((VirtualRekordbox { state, stop_tx }, handles))
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn device_num(&self) -> u8 {
        self.state.lock().await.device_num
    }

    /// `findDeviceSqlRekordboxIdForPlayer` (spec.md §8 end-to-end
    /// scenario): the archive-side rekordbox id matched by content hash.
    pub async fn rekordbox_id_for_player(&self, player: u8) -> Option<u32> {
        self.state
            .lock()
            .await
            .player_match
            .get(&player)
            .map(|(_, id)| *id)
    }

    /// `findMatchedTrackSourceSlotForPlayer`: the USB slot the matched
    /// archive was loaded from.
    pub async fn matched_slot_for_player(&self, player: u8) -> Option<u8> {
        self.state
            .lock()
            .await
            .player_match
            .get(&player)
            .map(|(slot, _)| *slot)
    }
}

async fn wait_for_devices(device_finder: &DeviceFinder) -> Result<Ipv4Addr> {
    for _ in 0..20 {
        if let Some(d) = device_finder.devices().await.into_iter().next() {
            return Ok(d.address.ip_addr);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Err(DjLinkError::NoDevicesVisible)
}

async fn identity_loop(
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    name: String,
    device_num: u8,
    mac_addr: [u8; 6],
    ip_addr: [u8; 4],
    mut stop_rx: watch::Receiver<bool>,
) {
    let pkt = DeviceAnnouncePacket {
        name,
        device_num,
        device_type: 2,
        mac_addr,
        ip_addr,
        peers_seen: 0,
        unknown_35: 1,
        hello: false,
    };
    let mut buf = Vec::new();
    if pkt.write(&mut buf).is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(1500));
    loop {
        tokio::select! {
            _ = stop_rx.changed() => { if *stop_rx.borrow() { return; } }
            _ = ticker.tick() => {
                let _ = socket.send_to(&buf, broadcast_addr).await;
            }
        }
    }
}

async fn pssi_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<State>>,
    mut events: broadcast::Receiver<(Ipv4Addr, Packet)>,
    our_device_num: u8,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => { if *stop_rx.borrow() { return; } }
            event = events.recv() => {
                let (from_ip, pkt) = match event {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                };
                handle_status_packet(&socket, &state, our_device_num, from_ip, pkt).await;
            }
        }
    }
}

async fn handle_status_packet(
    socket: &UdpSocket,
    state: &Arc<Mutex<State>>,
    our_device_num: u8,
    from_ip: Ipv4Addr,
    pkt: Packet,
) {
    match pkt {
        Packet::CdjStatus(cdj) => {
            // Opus hardware sporadically reports an all-zero status-flag
            // byte; fall back to the last nonzero observation for that
            // player rather than treat the packet as "nothing playing".
            let mut st = state.lock().await;
            let flags_bits = cdj.flags.bits();
            if flags_bits != 0 {
                st.last_nonzero_flags.insert(cdj.device_num, flags_bits);
            }

            if cdj.rekordbox_id == 0 {
                return;
            }
            let changed = st.last_rekordbox_id.get(&cdj.device_num) != Some(&cdj.rekordbox_id);
            if !changed {
                return;
            }
            st.last_rekordbox_id.insert(cdj.device_num, cdj.rekordbox_id);
            drop(st);

            let req = OpusMetadataRequestPacket {
                requester_device_num: our_device_num,
                target_device_num: cdj.device_num,
                rekordbox_id: cdj.rekordbox_id,
            };
            let mut buf = Vec::new();
            if req.write(&mut buf).is_ok() {
                let addr = SocketAddr::new(from_ip.into(), proto::STATUS_PORT);
                let _ = socket.send_to(&buf, addr).await;
            }
        }
        Packet::OpusMetadataFragment(frag) => {
            let mut st = state.lock().await;
            let entry = st
                .reassembly
                .entry(frag.from_device_num)
                .or_insert_with(|| Reassembly {
                    total: frag.fragment_count,
                    parts: HashMap::new(),
                });
            entry.total = frag.fragment_count;
            entry.parts.insert(frag.fragment_num, frag.data);

            if entry.parts.len() as u16 == entry.total {
                let reassembly = st.reassembly.remove(&frag.from_device_num).unwrap();
                let mut blob = Vec::new();
                for i in 0..reassembly.total {
                    if let Some(part) = reassembly.parts.get(&i) {
                        blob.extend_from_slice(part);
                    }
                }
                while blob.last() == Some(&0) {
                    blob.pop();
                }

                let mut hasher = Sha1::new();
                hasher.update(&blob);
                let digest: [u8; 20] = hasher.finalize().into();

                match st.archive_by_hash.get(&digest) {
                    Some(entry) => {
                        st.player_match.insert(
                            frag.from_device_num,
                            (entry.usb_slot, entry.archive_rekordbox_id),
                        );
                        debug!(
                            target: "djlink",
                            "matched PSSI for player {} to archive track {}",
                            frag.from_device_num, entry.archive_rekordbox_id
                        );
                    }
                    None => {
                        warn!(
                            target: "djlink",
                            "no archive match for player {}'s PSSI fingerprint",
                            frag.from_device_num
                        );
                        st.player_match.remove(&frag.from_device_num);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_range_bounds() {
        assert_eq!(HIGH_RANGE_START, 0x13);
        assert_eq!(HIGH_RANGE_END, 0x26);
        assert!(HIGH_RANGE_END < 0x27);
    }

    #[tokio::test]
    async fn test_fragment_reassembly_trims_trailing_zeros_and_hashes() {
        let state = Arc::new(Mutex::new(State {
            device_num: 0x13,
            archive_by_hash: HashMap::new(),
            player_match: HashMap::new(),
            last_rekordbox_id: HashMap::new(),
            reassembly: HashMap::new(),
            last_nonzero_flags: HashMap::new(),
        }));
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();

        let mut payload = b"PSSI-CONTENT".to_vec();
        payload.extend_from_slice(&[0u8; 4]);

        let frag = Packet::OpusMetadataFragment(proto::OpusMetadataFragmentPacket {
            from_device_num: 1,
            fragment_num: 0,
            fragment_count: 1,
            data: payload,
        });
        handle_status_packet(&socket, &state, 0x13, Ipv4Addr::new(10, 0, 0, 1), frag).await;

        let st = state.lock().await;
        assert!(st.reassembly.is_empty());
        assert!(st.player_match.get(&1).is_none());
    }
}
