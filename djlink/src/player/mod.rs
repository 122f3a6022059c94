//! Virtual Player (spec.md §4.5): the participant that appears on the
//! network as a DJ-Link device. `start()` runs phases A-D in order and
//! returns a handle once the device number has been claimed; phase E
//! (master handoff) is driven by [`handoff::Handoff`] from inside the
//! status-receive loop.

pub mod claim;
pub mod handoff;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::device::DeviceUpdate;
use crate::finder::beat::{BeatEvent, BeatFinder};
use crate::finder::device::DeviceFinder;
use crate::message::Event;
use crate::metronome::Metronome;
use crate::proto::{self, BeatPacket, CdjStatusPacket, MasterHandoffRequestPacket, MasterHandoffResponsePacket, Packet, PlayState, StatusFlags};
use crate::safety;
use crate::{Config, DjLinkError, Result};

use self::handoff::{Action as HandoffAction, Handoff};

const BEAT_AVOIDANCE_WINDOW_MS: f64 = 5.0;
const MASTER_EPSILON: f64 = 0.0001;

/// Everything mutated after the device number is claimed (spec.md §3
/// "Virtual player state").
struct State {
    device_num: u8,
    master: bool,
    synced: bool,
    on_air: bool,
    tempo: f64,
    playing: bool,
    stopped_at_beat: u64,
    packet_counter: u32,
    handoff: Handoff,
    updates: HashMap<(Ipv4Addr, u8), DeviceUpdate>,
    tempo_master: Option<u8>,
    next_beat_sent: u64,
}

/// Interface facts discovered in Phase A.
#[derive(Debug, Clone)]
pub(crate) struct InterfaceInfo {
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) mac_addr: [u8; 6],
    pub(crate) broadcast_addr: Ipv4Addr,
}

pub struct Player {
    state: Arc<Mutex<State>>,
    metronome: Arc<Mutex<Metronome>>,
    claim_socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    name: String,
    stop_tx: watch::Sender<bool>,
    status_tx: broadcast::Sender<(Ipv4Addr, Packet)>,
}

impl Player {
    /// Runs phases A and B and spawns the phase C/D background tasks.
    /// `events_tx` receives every emitted [`Event`].
    pub async fn start(
        config: &Config,
        device_finder: &DeviceFinder,
        beat_finder: &BeatFinder,
        events_tx: mpsc::Sender<Event>,
    ) -> Result<(Player, Vec<JoinHandle<()>>)> {
        if config.send_status && config.device_num != 0 && !(1..=4).contains(&config.device_num) {
            return Err(DjLinkError::InvalidArgument(format!(
                "device number {} requested with status-sending enabled, but only 1..4 can send status",
                config.device_num
            )));
        }

        let anchor = wait_for_anchor(device_finder).await?;
        let interface = select_interface(anchor, config.interface_name.as_deref()).await?;

        let claim_socket = Arc::new(UdpSocket::bind(("0.0.0.0", proto::ANNOUNCEMENT_PORT)).await?);
        claim_socket.set_broadcast(true)?;
        let broadcast_addr = SocketAddr::new(interface.broadcast_addr.into(), proto::ANNOUNCEMENT_PORT);

        let device_num = claim_number(&claim_socket, broadcast_addr, config, &interface).await?;
        info!(target: "djlink", "virtual player claimed device number {}", device_num);

        let state = Arc::new(Mutex::new(State {
            device_num,
            master: false,
            synced: false,
            on_air: false,
            tempo: 120.0,
            playing: false,
            stopped_at_beat: 0,
            packet_counter: 0,
            handoff: Handoff::new(),
            updates: HashMap::new(),
            tempo_master: None,
            next_beat_sent: 0,
        }));
        let metronome = Arc::new(Mutex::new(Metronome::new(120.0, 0.0)));
        let started_at = Instant::now();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(256);

        let mut handles = Vec::new();

        handles.push(tokio::spawn(announce_loop(
            claim_socket.clone(),
            broadcast_addr,
            config.name.clone(),
            device_num,
            interface.mac_addr,
            interface.ip_addr.octets(),
            Duration::from_millis(config.announce_interval_ms),
            stop_rx.clone(),
        )));

        handles.push(
            status_receive_loop(
                state.clone(),
                events_tx.clone(),
                status_tx.clone(),
                stop_rx.clone(),
            )
            .await?,
        );

        handles.push(tokio::spawn(handoff_event_loop(
            beat_finder.subscribe(),
            state.clone(),
            claim_socket.clone(),
            broadcast_addr,
            config.send_status,
            stop_rx.clone(),
        )));

        let status_sending = config.send_status && (1..=4).contains(&device_num);
        if status_sending {
            let status_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
            status_socket.set_broadcast(true)?;

            handles.push(tokio::spawn(status_send_loop(
                status_socket,
                state.clone(),
                metronome.clone(),
                device_finder.clone(),
                config.name.clone(),
                stop_rx.clone(),
            )));

            handles.push(tokio::spawn(beat_send_loop(
                claim_socket.clone(),
                state.clone(),
                metronome.clone(),
                SocketAddr::new(interface.broadcast_addr.into(), proto::BEAT_PORT),
                config.name.clone(),
                started_at,
                stop_rx.clone(),
            )));
        }

        Ok((
            Player {
                state,
                metronome,
                claim_socket,
                broadcast_addr,
                name: config.name.clone(),
                stop_tx,
                status_tx,
            },
            handles,
        ))
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Every packet observed on the status port, raw. Used by
    /// [`crate::rekordbox::VirtualRekordbox`] to watch for PSSI
    /// request/fragment traffic and by the track-position cache to watch
    /// for precise-position packets, without a second bind on port 50002.
    pub fn subscribe_status_packets(&self) -> broadcast::Receiver<(Ipv4Addr, Packet)> {
        self.status_tx.subscribe()
    }

    pub async fn device_num(&self) -> u8 {
        self.state.lock().await.device_num
    }

    pub async fn tempo_master(&self) -> Option<u8> {
        self.state.lock().await.tempo_master
    }

    /// API `becomeTempoMaster()` (spec.md §4.5 Phase E).
    pub async fn become_tempo_master(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state.tempo_master;
        match state.handoff.request_master(current) {
            HandoffAction::SendHandoffRequest { to } => {
                drop(state);
                self.send_handoff_request(to).await?;
            }
            HandoffAction::BecomeMasterLocally => {
                state.master = true;
                state.tempo_master = Some(state.device_num);
            }
            HandoffAction::SendHandoffResponse { .. } => unreachable!(),
        }
        Ok(())
    }

    async fn send_handoff_request(&self, to: u8) -> Result<()> {
        let device_num = self.device_num().await;
        let pkt = MasterHandoffRequestPacket {
            from_device_num: device_num,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf)?;
        let addr = SocketAddr::new(self.broadcast_addr.ip(), proto::BEAT_PORT);
        self.claim_socket.send_to(&buf, addr).await?;
        let _ = to;
        Ok(())
    }
}

async fn wait_for_anchor(device_finder: &DeviceFinder) -> Result<Ipv4Addr> {
    let deadline = Instant::now() + Duration::from_secs(100);
    loop {
        if let Some(d) = device_finder.devices().await.into_iter().next() {
            return Ok(d.address.ip_addr);
        }
        if Instant::now() >= deadline {
            return Err(DjLinkError::NoDevicesVisible);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Phase A: discover the local interface by opening a transient UDP
/// socket connected to the anchor device and reading back the local
/// address, then matching it against the host's interfaces for MAC and
/// broadcast address.
pub(crate) async fn select_interface(
    anchor: Ipv4Addr,
    interface_name: Option<&str>,
) -> Result<InterfaceInfo> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect((anchor, proto::STATUS_PORT)).await?;
    let local_addr = probe.local_addr()?;
    let ip_addr = match local_addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => {
            return Err(DjLinkError::ProtocolError("no IPv4 local address".to_string()))
        }
    };

    let interfaces = NetworkInterface::show()
        .map_err(|e| DjLinkError::ProtocolError(format!("interface enumeration failed: {}", e)))?;

    let iface = interfaces
        .iter()
        .find(|i| {
            interface_name.map(|n| n == i.name).unwrap_or(true)
                && i.addr.iter().any(|a| a.ip() == std::net::IpAddr::V4(ip_addr))
        })
        .ok_or_else(|| DjLinkError::ProtocolError("no matching local interface".to_string()))?;

    let netmask = iface
        .addr
        .iter()
        .find_map(|a| a.netmask())
        .unwrap_or(std::net::IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)));
    let broadcast_addr = match netmask {
        std::net::IpAddr::V4(mask) => {
            let ip_bits = u32::from(ip_addr);
            let mask_bits = u32::from(mask);
            Ipv4Addr::from(ip_bits | !mask_bits)
        }
        _ => Ipv4Addr::new(255, 255, 255, 255),
    };

    let mac_addr = mac_address::mac_address_by_name(&iface.name)
        .ok()
        .flatten()
        .map(|m| m.bytes())
        .unwrap_or([0u8; 6]);

    Ok(InterfaceInfo {
        ip_addr,
        mac_addr,
        broadcast_addr,
    })
}

async fn claim_number(
    socket: &UdpSocket,
    broadcast_addr: SocketAddr,
    config: &Config,
    interface: &InterfaceInfo,
) -> Result<u8> {
    let mut candidate = if config.device_num == 0 {
        let base = claim::self_assignment_base(config.prefer_cdj_slot);
        claim::self_assign(socket, base).await?
    } else {
        config.device_num
    };

    loop {
        match claim::claim_once(
            socket,
            broadcast_addr,
            &config.name,
            interface.mac_addr,
            interface.ip_addr.octets(),
            candidate,
        )
        .await?
        {
            claim::ClaimOutcome::Claimed(n) => return Ok(n),
            claim::ClaimOutcome::Defended => {
                warn!(target: "djlink", "device number {} defended, retrying", candidate);
                let base = claim::self_assignment_base(config.prefer_cdj_slot);
                candidate = claim::self_assign(socket, base).await?;
            }
        }
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    name: String,
    device_num: u8,
    mac_addr: [u8; 6],
    ip_addr: [u8; 4],
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let pkt = proto::DeviceAnnouncePacket {
        name,
        device_num,
        device_type: 1,
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

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() { return; }
            }
            _ = ticker.tick() => {
                let _ = socket.send_to(&buf, broadcast_addr).await;
            }
        }
    }
}

async fn status_receive_loop(
    state: Arc<Mutex<State>>,
    events_tx: mpsc::Sender<Event>,
    status_tx: broadcast::Sender<(Ipv4Addr, Packet)>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", proto::STATUS_PORT)).await?;
    Ok(tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() { return; }
                }
                recv = socket.recv_from(&mut buf) => {
                    let (len, from) = match recv {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let std::net::IpAddr::V4(from_ip) = from.ip() else { continue };
                    if let Ok(pkt) = Packet::parse(&buf[..len], proto::STATUS_PORT) {
                        let _ = status_tx.send((from_ip, pkt.clone()));
                        process_update(&state, &events_tx, from_ip, pkt).await;
                    }
                }
            }
        }
    }))
}

/// `processUpdate` (spec.md §4.5 Phase C): bookkeeping on every status
/// packet, tempo-master tracking with an epsilon comparison, and handoff
/// state transitions.
async fn process_update(
    state: &Arc<Mutex<State>>,
    events_tx: &mpsc::Sender<Event>,
    from_ip: Ipv4Addr,
    pkt: Packet,
) {
    let update = match &pkt {
        Packet::CdjStatus(p) => Some(DeviceUpdate::from_cdj_status(p)),
        Packet::MixerStatus(p) => Some(DeviceUpdate::from_mixer_status(p)),
        _ => None,
    };
    let Some(update) = update else { return };

    let mut st = state.lock().await;
    let key = (from_ip, update.device_num());
    st.updates.insert(key, update.clone());

    let our_num = st.device_num;

    if let Packet::CdjStatus(ref cdj) = pkt {
        let peer_num = cdj.device_num;
        if cdj.flags.contains(StatusFlags::MASTER) {
            if cdj.handoff_target != 0xff && cdj.handoff_target == our_num {
                if st.handoff.on_peer_status_yielding_to_us(peer_num) {
                    st.tempo_master = Some(our_num);
                    st.master = true;
                    drop(st);
                    let _ = events_tx
                        .send(Event::MasterChanged {
                            device_num: Some(our_num),
                        })
                        .await;
                    return;
                }
            }
            if st.handoff.on_peer_asserts_master(peer_num) {
                st.master = false;
            }
            // A peer yielding to a third device keeps its MASTER flag set until
            // the handoff completes; the pointer must not move until its
            // handoff_target clears.
            if cdj.handoff_target == 0xff && st.tempo_master != Some(peer_num) {
                st.tempo_master = Some(peer_num);
                let device_num = Some(peer_num);
                drop(st);
                let _ = events_tx.send(Event::MasterChanged { device_num }).await;
                let _ = events_tx.send(Event::Update(update.sanitized())).await;
                return;
            }
        }
    }

    let bpm = update.effective_tempo().unwrap_or(st.tempo);
    if (bpm - st.tempo).abs() > MASTER_EPSILON {
        st.tempo = safety::sanitize_bpm(bpm);
    }
    drop(st);

    let _ = events_tx.send(Event::Update(update.sanitized())).await;
}

/// Listens for `MASTER_HANDOFF_REQUEST`/`MASTER_HANDOFF_RESPONSE` on the
/// beat port and drives [`Handoff`]'s Phase E transitions (spec.md §4.5).
async fn handoff_event_loop(
    mut events: tokio::sync::broadcast::Receiver<BeatEvent>,
    state: Arc<Mutex<State>>,
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    status_sending_enabled: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() { return; }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                };
                match event {
                    BeatEvent::MasterHandoffRequest(req) => {
                        let mut st = state.lock().await;
                        let our_num = st.device_num;
                        let action = st.handoff.on_handoff_request(
                            req.from_device_num,
                            our_num,
                            status_sending_enabled,
                        );
                        drop(st);
                        if let Some(HandoffAction::SendHandoffResponse { yielded, .. }) = action {
                            let pkt = MasterHandoffResponsePacket {
                                from_device_num: our_num,
                                yielded,
                            };
                            let mut buf = Vec::new();
                            if pkt.write(&mut buf).is_ok() {
                                let addr = SocketAddr::new(broadcast_addr.ip(), proto::BEAT_PORT);
                                let _ = socket.send_to(&buf, addr).await;
                            }
                        }
                    }
                    BeatEvent::MasterHandoffResponse(resp) => {
                        let mut st = state.lock().await;
                        st.handoff
                            .on_handoff_response(resp.from_device_num, resp.yielded);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn now_ms(started_at: Instant) -> f64 {
    started_at.elapsed().as_secs_f64() * 1000.0
}

/// Sleeps 2ms if we're within the beat-avoidance window of a beat
/// boundary, so a status packet never lands on top of a beat packet.
async fn beat_avoidance_delay(metronome: &Arc<Mutex<Metronome>>, started_at: Instant) {
    let now = now_ms(started_at);
    let close = {
        let m = metronome.lock().await;
        let snap = m.snapshot(now);
        snap.phase * m.beat_interval_ms() < BEAT_AVOIDANCE_WINDOW_MS
    };
    if close {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn build_status_packet(st: &State, name: &str) -> CdjStatusPacket {
    let mut flags = StatusFlags::empty();
    if st.playing {
        flags |= StatusFlags::PLAYING;
    }
    if st.master {
        flags |= StatusFlags::MASTER;
    }
    if st.synced {
        flags |= StatusFlags::SYNCED;
    }
    if st.on_air {
        flags |= StatusFlags::ON_AIR;
    }

    CdjStatusPacket {
        name: name.to_string(),
        device_num: st.device_num,
        track_device: 0,
        track_slot: 0,
        track_type: 0,
        rekordbox_id: 0,
        play_state: if st.playing {
            PlayState::Playing
        } else {
            PlayState::Cued
        },
        flags,
        pitch: 0x100000,
        bpm_x100: (st.tempo * 100.0).round() as u16,
        beat: st.stopped_at_beat as u32,
        beat_within_bar: 1,
        handoff_target: st.handoff.pending_handoff_target().unwrap_or(0xff),
        firmware_ver: "1.00".to_string(),
        reserved: vec![0; 40],
    }
}

/// Phase D status thread: a ~203-byte CDJ-status packet every 200ms to
/// every currently-known device, with a beat-avoidance pre-check and a
/// monotonically incrementing packet counter.
async fn status_send_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<State>>,
    metronome: Arc<Mutex<Metronome>>,
    device_finder: DeviceFinder,
    name: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let started_at = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() { return; }
            }
            _ = ticker.tick() => {
                beat_avoidance_delay(&metronome, started_at).await;

                let targets: Vec<Ipv4Addr> = device_finder
                    .devices()
                    .await
                    .into_iter()
                    .map(|d| d.address.ip_addr)
                    .collect();
                if targets.is_empty() {
                    continue;
                }

                let mut st = state.lock().await;
                st.packet_counter = st.packet_counter.wrapping_add(1);
                let pkt = build_status_packet(&st, &name);
                drop(st);

                let mut buf = Vec::new();
                if pkt.write(&mut buf).is_err() {
                    continue;
                }
                for ip in targets {
                    let addr = SocketAddr::new(ip.into(), proto::STATUS_PORT);
                    let _ = socket.send_to(&buf, addr).await;
                }
            }
        }
    }
}

/// Beat-sender subtask started alongside status-sending: samples the
/// metronome each loop and broadcasts a Beat packet within 10ms past a
/// beat boundary not yet sent this cycle; otherwise sleeps until just
/// before the next boundary. Goes idle (no sends) while not playing.
async fn beat_send_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<State>>,
    metronome: Arc<Mutex<Metronome>>,
    broadcast_addr: SocketAddr,
    name: String,
    started_at: Instant,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }

        let (playing, device_num, next_beat_sent) = {
            let st = state.lock().await;
            (st.playing, st.device_num, st.next_beat_sent)
        };
        if !playing {
            tokio::select! {
                _ = stop_rx.changed() => { if *stop_rx.borrow() { return; } }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            continue;
        }

        let now = now_ms(started_at);
        let (beat_num, beat_start, beat_within_bar, bpm) = {
            let m = metronome.lock().await;
            let snap = m.snapshot(now);
            let beat_start = m.time_of_beat(snap.beat);
            (
                snap.beat,
                beat_start,
                ((snap.beat.saturating_sub(1)) % 4 + 1) as u8,
                m.tempo_bpm(),
            )
        };

        let ms_past_beat = now - beat_start;
        if (0.0..10.0).contains(&ms_past_beat) && beat_num > next_beat_sent {
            state.lock().await.next_beat_sent = beat_num;

            let pkt = BeatPacket {
                name: name.clone(),
                device_num,
                next_beat: 0,
                second_beat: 0,
                next_bar: 0,
                fourth_beat: 0,
                second_bar: 0,
                eighth_beat: 0,
                pitch: 0x100000,
                bpm_x100: (bpm * 100.0).round() as u16,
                beat_within_bar,
            };
            let mut buf = Vec::new();
            if pkt.write(&mut buf).is_ok() {
                let _ = socket.send_to(&buf, broadcast_addr).await;
            }
            continue;
        }

        let next_beat_time = {
            let m = metronome.lock().await;
            m.time_of_beat(beat_num + 1)
        };
        let sleep_ms = (next_beat_time - now - 5.0).max(1.0);
        tokio::select! {
            _ = stop_rx.changed() => { if *stop_rx.borrow() { return; } }
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms as u64)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_info_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<InterfaceInfo>();
    }

    #[test]
    fn test_build_status_packet_reflects_state() {
        let st = State {
            device_num: 2,
            master: true,
            synced: true,
            on_air: false,
            tempo: 128.0,
            playing: true,
            stopped_at_beat: 0,
            packet_counter: 4,
            handoff: Handoff::new(),
            updates: HashMap::new(),
            tempo_master: Some(2),
            next_beat_sent: 0,
        };
        let pkt = build_status_packet(&st, "djlink-cli");
        assert_eq!(pkt.device_num, 2);
        assert!(pkt.flags.contains(StatusFlags::MASTER));
        assert!(pkt.flags.contains(StatusFlags::PLAYING));
        assert_eq!(pkt.bpm_x100, 12800);
        assert_eq!(pkt.handoff_target, 0xff);
    }

    fn cdj_status_asserting_master(device_num: u8, handoff_target: u8) -> CdjStatusPacket {
        CdjStatusPacket {
            name: "CDJ-2000NXS2".to_string(),
            device_num,
            track_device: 0,
            track_slot: 0,
            track_type: 0,
            rekordbox_id: 0,
            play_state: PlayState::Playing,
            flags: StatusFlags::MASTER | StatusFlags::PLAYING,
            pitch: 0x100000,
            bpm_x100: 12800,
            beat: 1,
            beat_within_bar: 1,
            handoff_target,
            firmware_ver: "1.00".to_string(),
            reserved: vec![0; 40],
        }
    }

    #[tokio::test]
    async fn test_master_pointer_unchanged_when_peer_yields_to_third_device() {
        let state = Arc::new(Mutex::new(State {
            device_num: 1,
            master: false,
            synced: false,
            on_air: false,
            tempo: 120.0,
            playing: false,
            stopped_at_beat: 0,
            packet_counter: 0,
            handoff: Handoff::new(),
            updates: HashMap::new(),
            tempo_master: Some(2),
            next_beat_sent: 0,
        }));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        // Peer 2 still asserts MASTER but is yielding to peer 3, not to us.
        let pkt = Packet::CdjStatus(cdj_status_asserting_master(2, 3));
        process_update(&state, &events_tx, Ipv4Addr::new(10, 0, 0, 2), pkt).await;

        assert_eq!(state.lock().await.tempo_master, Some(2));
        let event = events_rx.try_recv().expect("an Update event still fires");
        assert!(matches!(event, Event::Update(_)));
        assert!(events_rx.try_recv().is_err(), "no MasterChanged event");
    }

    #[tokio::test]
    async fn test_master_pointer_updates_when_peer_yields_to_nobody() {
        let state = Arc::new(Mutex::new(State {
            device_num: 1,
            master: false,
            synced: false,
            on_air: false,
            tempo: 120.0,
            playing: false,
            stopped_at_beat: 0,
            packet_counter: 0,
            handoff: Handoff::new(),
            updates: HashMap::new(),
            tempo_master: None,
            next_beat_sent: 0,
        }));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let pkt = Packet::CdjStatus(cdj_status_asserting_master(2, 0xff));
        process_update(&state, &events_tx, Ipv4Addr::new(10, 0, 0, 2), pkt).await;

        assert_eq!(state.lock().await.tempo_master, Some(2));
        let first = events_rx.try_recv().unwrap();
        assert!(matches!(first, Event::MasterChanged { device_num: Some(2) }));
    }
}
