//! DJ-Link UDP packet codec.
//!
//! Every packet starts with the ten byte magic below. The byte that follows
//! is a packet-type discriminator whose meaning depends on which of the
//! three ports (50000/50001/50002) it arrived on; [`classify`] is the single
//! lookup table callers use to interpret it. Numbers are big-endian unless
//! noted; strings are fixed-length ASCII with trailing zero padding.

use std::{convert::TryInto, io::Write};

use anyhow::anyhow;
use bitflags::bitflags;
use byteorder::{BigEndian, WriteBytesExt};
use nom::{
    bytes::complete::{tag, take},
    combinator::rest,
    error::context,
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use nom_locate::LocatedSpan;
use pretty_hex::pretty_hex;

use crate::{DjLinkError, Result};

type Span<'a> = LocatedSpan<&'a [u8]>;

pub const HEADER: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

pub const ANNOUNCEMENT_PORT: u16 = 50000;
pub const BEAT_PORT: u16 = 50001;
pub const STATUS_PORT: u16 = 50002;

pub const DEVICE_ANNOUNCEMENT_SIZE: usize = 54;
pub const CDJ_STATUS_MIN_SIZE: usize = 204;
pub const MIXER_STATUS_SIZE: usize = 56;
pub const BEAT_SIZE: usize = 96;
pub const PRECISE_POSITION_SIZE: usize = 60;
/// Body length of the mixer-bound `AssignmentRequestPacket` (mac + preference);
/// the mixer's `DeviceNumberAssignPacket` reply shares the 0x03 type byte but
/// is shorter, so [`Packet::parse`] uses this threshold to tell them apart.
pub const ASSIGNMENT_REQUEST_SIZE: usize = 43;

/// Packet-type discriminator byte, scoped to the port it was received on.
/// `PlayerIdentity` (0x0a) is shared by the device-hello, CDJ-status, and
/// mixer-status wire formats; callers distinguish them by length, mirroring
/// how the real devices reuse the byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    DeviceNumClaim1,
    DeviceNumberWillAssign,
    DeviceNumClaim2,
    AssignmentRequest,
    DeviceNumClaim3,
    DeviceNumberInUse,
    DeviceKeepAlive,
    PlayerIdentity,
    Beat,
    ChannelsOnAir,
    FaderStart,
    SyncControl,
    MasterHandoffRequest,
    MasterHandoffResponse,
    PrecisePosition,
    OpusMetadataRequest,
    OpusMetadataFragment,
}

/// `(port, type-byte) -> PacketKind`. Unknown combinations return `None`
/// and the caller drops the packet without further parsing.
pub fn classify(port: u16, type_byte: u8) -> Option<PacketKind> {
    use PacketKind::*;
    match (port, type_byte) {
        (ANNOUNCEMENT_PORT, 0x00) => Some(DeviceNumClaim1),
        (ANNOUNCEMENT_PORT, 0x01) => Some(DeviceNumberWillAssign),
        (ANNOUNCEMENT_PORT, 0x02) => Some(DeviceNumClaim2),
        (ANNOUNCEMENT_PORT, 0x03) => Some(AssignmentRequest),
        (ANNOUNCEMENT_PORT, 0x04) => Some(DeviceNumClaim3),
        (ANNOUNCEMENT_PORT, 0x08) => Some(DeviceNumberInUse),
        (ANNOUNCEMENT_PORT, 0x06) => Some(DeviceKeepAlive),
        (ANNOUNCEMENT_PORT, 0x0a) => Some(PlayerIdentity),
        (BEAT_PORT, 0x28) => Some(Beat),
        (BEAT_PORT, 0x29) => Some(ChannelsOnAir),
        (BEAT_PORT, 0x2a) => Some(FaderStart),
        (BEAT_PORT, 0x2b) => Some(SyncControl),
        (BEAT_PORT, 0x2c) => Some(MasterHandoffRequest),
        (BEAT_PORT, 0x2d) => Some(MasterHandoffResponse),
        (BEAT_PORT, 0x0b) => Some(PrecisePosition),
        (STATUS_PORT, 0x0a) => Some(PlayerIdentity),
        (STATUS_PORT, 0x34) => Some(OpusMetadataRequest),
        (STATUS_PORT, 0x35) => Some(OpusMetadataFragment),
        _ => None,
    }
}

fn header(i: Span) -> IResult<Span, ()> {
    let (i, _) = tag(HEADER)(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw_name) = take(20usize)(i)?;
    let name = String::from_utf8_lossy(&raw_name);
    Ok((i, name.trim_end_matches('\0').into()))
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, mac_addr) = take(6usize)(i)?;
    Ok((i, (*mac_addr.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, ip_addr) = take(4usize)(i)?;
    Ok((i, (*ip_addr.fragment()).try_into().unwrap()))
}

fn write_device_name(w: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let mut name_buf = [0u8; 20];
    let bytes = name.as_bytes();
    let n = bytes.len().min(20);
    name_buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&name_buf)
}

fn write_packet_header(w: &mut dyn Write, pkt_type: u8, sub: u8) -> std::io::Result<()> {
    w.write_all(HEADER)?;
    w.write_u8(pkt_type)?;
    w.write_u8(sub)
}

bitflags! {
    /// The CDJ/mixer status-flag byte (offset 0x27 on mixer status, 0x89 on
    /// CDJ status). Bit positions per spec.md §3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const BPM_ONLY_SYNC = 0x02;
        const ON_AIR        = 0x08;
        const SYNCED        = 0x10;
        const MASTER        = 0x20;
        const PLAYING       = 0x40;
    }
}

/// Closed enum for the CDJ play-state byte (offset 0x7b).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    NoTrack,
    Loading,
    Playing,
    Looping,
    Paused,
    Cued,
    Cueing,
    Searching,
    SpunDown,
    Ended,
    Unknown(u8),
}

impl PlayState {
    fn from_byte(b: u8) -> PlayState {
        use PlayState::*;
        match b {
            0x00 => NoTrack,
            0x02 => Loading,
            0x03 => Playing,
            0x04 => Looping,
            0x05 => Paused,
            0x06 => Cued,
            0x07 => Cueing,
            0x08 => Searching,
            0x09 => SpunDown,
            0x0e => Ended,
            other => Unknown(other),
        }
    }

    fn to_byte(self) -> u8 {
        use PlayState::*;
        match self {
            NoTrack => 0x00,
            Loading => 0x02,
            Playing => 0x03,
            Looping => 0x04,
            Paused => 0x05,
            Cued => 0x06,
            Cueing => 0x07,
            Searching => 0x08,
            SpunDown => 0x09,
            Ended => 0x0e,
            Unknown(b) => b,
        }
    }
}

/// 1..4 base device/player number space, plus the named mixer/lighting/
/// rekordbox-mobile ranges from spec.md §3. Only used for documentation
/// at call sites; the wire encoding is always a plain `u8`.
pub const CDJ_SLOT_RANGE: std::ops::RangeInclusive<u8> = 1..=4;
pub const MIXER_SLOT_RANGE: std::ops::RangeInclusive<u8> = 5..=15;
pub const LIGHTING_SLOT_RANGE: std::ops::RangeInclusive<u8> = 17..=31;
pub const REKORDBOX_MOBILE_BASE: u8 = 40;

/// Fixed translation table for Opus Quad / XDJ-AZ hardware: one physical
/// address reports four logical virtual-player numbers.
pub const OPUS_LOGICAL_NUMBERS: [u8; 4] = [1, 2, 3, 4];

pub fn is_device_library_plus(name: &str) -> bool {
    name == "OPUS-QUAD" || name == "XDJ-AZ"
}

/// 54-byte device-hello / keep-alive record (spec.md §3 "Device
/// Announcement"). Both wire packets share this shape; `hello` selects
/// which packet-type byte is written.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAnnouncePacket {
    pub name: String,
    pub device_num: u8,
    pub device_type: u8,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
    pub peers_seen: u8,
    pub unknown_35: u8,
    pub hello: bool,
}

impl DeviceAnnouncePacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let pkt_type = if self.hello { 0x0a } else { 0x06 };
        write_packet_header(w, pkt_type, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?; // protocol version
        w.write_u16::<BigEndian>(0x36)?; // packet length, 54 bytes total

        w.write_u8(self.device_num)?;
        w.write_u8(self.device_type)?;
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(&[self.peers_seen, 0x00, 0x00, 0x00, 0x01, self.unknown_35])?;

        Ok(())
    }

    pub fn parse(i: Span, hello: bool) -> IResult<Span, Packet> {
        let type_byte = if hello { 0x0a } else { 0x06 };
        let (i, _) = header(i)?;
        let (i, _) = tag(&[type_byte, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, device_type) = be_u8(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, peers_seen) = be_u8(i)?;
        let (i, _) = tag(&[0x00, 0x00, 0x00, 0x01][..])(i)?;
        let (i, unknown_35) = be_u8(i)?;

        Ok((
            i,
            if hello {
                Packet::DeviceHello(DeviceAnnouncePacket {
                    name,
                    device_num,
                    device_type,
                    mac_addr,
                    ip_addr,
                    peers_seen,
                    unknown_35,
                    hello: true,
                })
            } else {
                Packet::DeviceKeepAlive(DeviceAnnouncePacket {
                    name,
                    device_num,
                    device_type,
                    mac_addr,
                    ip_addr,
                    peers_seen,
                    unknown_35,
                    hello: false,
                })
            },
        ))
    }
}

/// Stage-1 device-number claim packet (spec.md §4.5 Phase B).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumClaim1Packet {
    pub name: String,
    pub pkt_num: u8,
    pub mac_addr: [u8; 6],
}

impl DeviceNumClaim1Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x00, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x2c)?;
        w.write_u8(self.pkt_num)?;
        w.write_u8(0x01)?;
        w.write_all(&self.mac_addr)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x00, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, pkt_num) = be_u8(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, mac_addr) = mac_addr(i)?;

        Ok((
            i,
            Packet::DeviceNumClaim1(DeviceNumClaim1Packet {
                name,
                pkt_num,
                mac_addr,
            }),
        ))
    }
}

/// Mixer-driven assignment offer, sent between claim stages 1 and 2.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumberWillAssignPacket {
    pub name: String,
    pub mac_addr: [u8; 6],
}

impl DeviceNumberWillAssignPacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x01, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x26)?;
        w.write_all(&self.mac_addr)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x01, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        Ok((
            i,
            Packet::DeviceNumberWillAssign(DeviceNumberWillAssignPacket { name, mac_addr }),
        ))
    }
}

/// Our reply to a `DeviceNumberWillAssign`, requesting assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRequestPacket {
    pub name: String,
    pub mac_addr: [u8; 6],
    pub preference: u8,
}

impl AssignmentRequestPacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x03, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x27)?;
        w.write_all(&self.mac_addr)?;
        w.write_u8(self.preference)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x03, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, preference) = be_u8(i)?;
        Ok((
            i,
            Packet::AssignmentRequest(AssignmentRequestPacket {
                name,
                mac_addr,
                preference,
            }),
        ))
    }
}

/// The mixer's reply to an `AssignmentRequestPacket`, naming the device
/// number it picked for us. Shares `AssignmentRequest`'s type byte (0x03)
/// but a shorter body with no mac/preference tail, so [`Packet::parse`]
/// tells the two apart by length rather than by tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumberAssignPacket {
    pub name: String,
    pub device_num: u8,
}

impl DeviceNumberAssignPacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x03, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x25)?;
        w.write_u8(self.device_num)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x03, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;
        Ok((
            i,
            Packet::DeviceNumberAssign(DeviceNumberAssignPacket { name, device_num }),
        ))
    }
}

/// Stage-2 device-number claim packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumClaim2Packet {
    pub name: String,
    pub ip_addr: [u8; 4],
    pub mac_addr: [u8; 6],
    pub device_num: u8,
    pub pkt_num: u8,
    pub auto_assign: bool,
}

impl DeviceNumClaim2Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x02, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x32)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(&self.mac_addr)?;
        w.write_u8(self.device_num)?;
        w.write_u8(self.pkt_num)?;
        w.write_u8(0x01)?;
        w.write_u8(if self.auto_assign { 0x01 } else { 0x02 })?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x02, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, pkt_num) = be_u8(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, auto) = be_u8(i)?;

        Ok((
            i,
            Packet::DeviceNumClaim2(DeviceNumClaim2Packet {
                name,
                ip_addr,
                mac_addr,
                device_num,
                pkt_num,
                auto_assign: auto == 0x01,
            }),
        ))
    }
}

/// Stage-3 (final) device-number claim packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumClaim3Packet {
    pub name: String,
    pub device_num: u8,
    pub pkt_num: u8,
}

impl DeviceNumClaim3Packet {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x04, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x26)?;
        w.write_u8(self.device_num)?;
        w.write_u8(self.pkt_num)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x04, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, pkt_num) = be_u8(i)?;

        Ok((
            i,
            Packet::DeviceNumClaim3(DeviceNumClaim3Packet {
                name,
                device_num,
                pkt_num,
            }),
        ))
    }
}

/// Number-defense broadcast: "the number you are claiming is already mine".
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNumberInUsePacket {
    pub name: String,
    pub device_num: u8,
}

impl DeviceNumberInUsePacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x08, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?;
        w.write_u16::<BigEndian>(0x25)?;
        w.write_u8(self.device_num)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x08, 0x00][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;

        Ok((
            i,
            Packet::DeviceNumberInUse(DeviceNumberInUsePacket { name, device_num }),
        ))
    }
}

/// CDJ status packet, >=204 bytes (spec.md §3). Field offsets follow the
/// real captured layout; several bytes whose purpose isn't load-bearing for
/// this port are kept as opaque reserved fields rather than invented names.
#[derive(Debug, Clone, PartialEq)]
pub struct CdjStatusPacket {
    pub name: String,
    pub device_num: u8,
    pub track_device: u8,
    pub track_slot: u8,
    pub track_type: u8,
    pub rekordbox_id: u32,
    pub play_state: PlayState,
    pub flags: StatusFlags,
    pub pitch: u32,
    pub bpm_x100: u16,
    pub beat: u32,
    pub beat_within_bar: u8,
    pub handoff_target: u8,
    pub firmware_ver: String,
    pub reserved: Vec<u8>,
}

impl CdjStatusPacket {
    pub fn effective_tempo(&self) -> f64 {
        (self.bpm_x100 as f64 / 100.0) * (self.pitch as f64 / 1_048_576.0)
    }

    /// Emits a status packet in our own voice, per spec.md §4.5 Phase D:
    /// fields this player doesn't track (media slots, USB/SD activity) go
    /// out as their neutral/absent values rather than invented data.
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x0a, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_u8(0x01)?;
        w.write_u8(0x02)?; // unknown_10
        w.write_u8(self.device_num)?;
        w.write_u16::<BigEndian>(CDJ_STATUS_MIN_SIZE as u16)?;
        w.write_u8(self.device_num)?; // device_num2
        w.write_u8(0x00)?;
        w.write_u8(0x00)?; // unknown_16

        w.write_u8(0x01)?; // active
        w.write_u8(self.track_device)?;
        w.write_u8(self.track_slot)?;
        w.write_u8(self.track_type)?;

        w.write_u8(0x00)?;
        w.write_u32::<BigEndian>(self.rekordbox_id)?;
        w.write_all(&[0x00, 0x00])?;
        w.write_u16::<BigEndian>(0)?; // track_num
        w.write_all(&[0x00, 0x00, 0x00])?;
        w.write_u8(0x00)?; // d_l

        w.write_all(&[0u8; 14])?; // unknown_38
        w.write_u16::<BigEndian>(0)?; // d_n
        w.write_all(&[0u8; 32])?; // unknown_48
        w.write_all(&[0x01, 0x00])?;

        w.write_u8(0x00)?; // usb_activity
        w.write_u8(0x00)?; // sd_activity
        w.write_all(&[0x00, 0x00, 0x00])?;
        w.write_u8(0x00)?; // u_l

        w.write_all(&[0x00, 0x00, 0x00])?;
        w.write_u8(0x00)?; // s_l
        w.write_u8(0x00)?;
        w.write_u8(0x01)?; // link_available

        w.write_all(&[0x00, 0x00])?;
        w.write_u8(0x00)?; // unknown_78
        w.write_all(&[0x00, 0x00])?;
        w.write_u8(self.play_state.to_byte())?;

        let mut fw_buf = [0u8; 4];
        let fw_bytes = self.firmware_ver.as_bytes();
        let n = fw_bytes.len().min(4);
        fw_buf[..n].copy_from_slice(&fw_bytes[..n]);
        w.write_all(&fw_buf)?;

        w.write_all(&[0x00, 0x00, 0x00, 0x00])?;
        w.write_u32::<BigEndian>(0)?; // sync_n
        w.write_u8(0x00)?;
        w.write_u8(self.flags.bits())?;
        w.write_u8(0x00)?; // unknown_8b
        w.write_u8(0x00)?; // unknown_8c
        w.write_u32::<BigEndian>(self.pitch)?;

        w.write_u16::<BigEndian>(0)?; // m_v
        w.write_u16::<BigEndian>(self.bpm_x100)?;
        w.write_u32::<BigEndian>(0)?; // unknown_94
        w.write_u32::<BigEndian>(self.pitch)?; // pitch_2
        w.write_u8(0x00)?;
        w.write_u8(0x00)?; // p_3
        w.write_u8(0x00)?; // m_m
        w.write_u8(self.handoff_target)?;

        w.write_u32::<BigEndian>(self.beat)?;
        w.write_u16::<BigEndian>(0)?; // cue
        w.write_u8(self.beat_within_bar)?;
        w.write_all(&self.reserved)?;

        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = context("packet type", tag(&[0x0a][..]))(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _unknown_10) = be_u8(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _pkt_len) = be_u16(i)?;
        let (i, _device_num2) = be_u8(i)?;
        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, _unknown_16) = be_u8(i)?;

        let (i, _active) = be_u8(i)?;
        let (i, track_device) = be_u8(i)?;
        let (i, track_slot) = be_u8(i)?;
        let (i, track_type) = be_u8(i)?;

        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, rekordbox_id) = be_u32(i)?;
        let (i, _) = tag(&[0x00, 0x00][..])(i)?;
        let (i, _track_num) = be_u16(i)?;
        let (i, _) = tag(&[0x00, 0x00, 0x00][..])(i)?;
        let (i, _d_l) = be_u8(i)?;

        let (i, _unknown_38) = take(14usize)(i)?;
        let (i, _d_n) = be_u16(i)?;
        let (i, _unknown_48) = take(32usize)(i)?;
        let (i, _) = tag(&[0x01, 0x00][..])(i)?;

        let (i, _usb_activity) = be_u8(i)?;
        let (i, _sd_activity) = be_u8(i)?;
        let (i, _) = tag(&[0x00, 0x00, 0x00][..])(i)?;
        let (i, _u_l) = be_u8(i)?;

        let (i, _) = tag(&[0x00, 0x00, 0x00][..])(i)?;
        let (i, _s_l) = be_u8(i)?;
        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, _link_available) = be_u8(i)?;

        let (i, _) = tag(&[0x00, 0x00][..])(i)?;
        let (i, _unknown_78) = be_u8(i)?;
        let (i, _) = tag(&[0x00, 0x00][..])(i)?;
        let (i, play_state_byte) = be_u8(i)?;
        let (i, firmware_ver_raw) = take(4usize)(i)?;
        let firmware_ver = String::from_utf8_lossy(*firmware_ver_raw.fragment())
            .trim_end_matches('\0')
            .to_string();

        let (i, _) = tag(&[0x00, 0x00, 0x00, 0x00][..])(i)?;
        let (i, _sync_n) = be_u32(i)?;
        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, flags_byte) = be_u8(i)?;
        let (i, _unknown_8b) = be_u8(i)?;
        let (i, _unknown_8c) = be_u8(i)?;
        let (i, pitch) = be_u32(i)?;

        let (i, _m_v) = be_u16(i)?;
        let (i, bpm_x100) = be_u16(i)?;
        let (i, _unknown_94) = be_u32(i)?;
        let (i, _pitch_2) = be_u32(i)?;
        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, _p_3) = be_u8(i)?;
        let (i, _m_m) = be_u8(i)?;
        let (i, handoff_target) = be_u8(i)?;

        let (i, beat) = be_u32(i)?;
        let (i, _cue) = be_u16(i)?;
        let (i, beat_within_bar) = be_u8(i)?;
        let (i, reserved_tail) = rest(i)?;

        Ok((
            i,
            Packet::CdjStatus(CdjStatusPacket {
                name,
                device_num,
                track_device,
                track_slot,
                track_type,
                rekordbox_id,
                play_state: PlayState::from_byte(play_state_byte),
                flags: StatusFlags::from_bits_truncate(flags_byte),
                pitch,
                bpm_x100,
                beat,
                beat_within_bar,
                handoff_target,
                firmware_ver,
                reserved: reserved_tail.fragment().to_vec(),
            }),
        ))
    }
}

/// Mixer status packet, 56 bytes (spec.md §3). Mixers report neutral pitch
/// and a meaningless beat-within-bar.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerStatusPacket {
    pub name: String,
    pub device_num: u8,
    pub flags: StatusFlags,
    pub bpm_x100: u16,
}

impl MixerStatusPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = context("packet type", tag(&[0x0a][..]))(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _unknown_10) = be_u8(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _pkt_len) = be_u16(i)?;
        let (i, _device_num2) = be_u8(i)?;
        let (i, _) = tag(&[0x00][..])(i)?;
        let (i, _unknown_16) = be_u8(i)?;
        let (i, flags_byte) = be_u8(i)?;
        let (i, _unknown_28) = take(6usize)(i)?;
        let (i, bpm_x100) = be_u16(i)?;
        let (i, _unknown_30) = take(8usize)(i)?;

        Ok((
            i,
            Packet::MixerStatus(MixerStatusPacket {
                name,
                device_num,
                flags: StatusFlags::from_bits_truncate(flags_byte),
                bpm_x100,
            }),
        ))
    }
}

/// 96-byte beat packet (spec.md §3). The eight "time-until" fields are
/// forward-looking millisecond offsets; `0xffffffff` means "not before end
/// of track" per spec.md §3.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatPacket {
    pub name: String,
    pub device_num: u8,
    pub next_beat: u32,
    pub second_beat: u32,
    pub next_bar: u32,
    pub fourth_beat: u32,
    pub second_bar: u32,
    pub eighth_beat: u32,
    pub pitch: u32,
    pub bpm_x100: u16,
    pub beat_within_bar: u8,
}

impl BeatPacket {
    pub const TIME_UNKNOWN: u32 = 0xffffffff;

    pub fn effective_tempo(&self) -> f64 {
        (self.bpm_x100 as f64 / 100.0) * (self.pitch as f64 / 1_048_576.0)
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x28, 0x00)?;
        write_device_name(w, &self.name)?;
        w.write_all(&[0x01, 0x00])?;
        w.write_u8(self.device_num)?;
        w.write_u16::<BigEndian>(0x3c)?;
        w.write_u32::<BigEndian>(self.next_beat)?;
        w.write_u32::<BigEndian>(self.second_beat)?;
        w.write_u32::<BigEndian>(self.next_bar)?;
        w.write_u32::<BigEndian>(self.fourth_beat)?;
        w.write_u32::<BigEndian>(self.second_bar)?;
        w.write_u32::<BigEndian>(self.eighth_beat)?;
        w.write_all(&[0xff; 24])?;
        w.write_u32::<BigEndian>(self.pitch)?;
        w.write_all(&[0x00, 0x00])?;
        w.write_u16::<BigEndian>(self.bpm_x100)?;
        w.write_u8(self.beat_within_bar)?;
        w.write_all(&[0x00, 0x00])?;
        w.write_u8(self.device_num)?;
        Ok(())
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x28][..])(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = tag(&[0x01, 0x00][..])(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, _) = be_u16(i)?;
        let (i, next_beat) = be_u32(i)?;
        let (i, second_beat) = be_u32(i)?;
        let (i, next_bar) = be_u32(i)?;
        let (i, fourth_beat) = be_u32(i)?;
        let (i, second_bar) = be_u32(i)?;
        let (i, eighth_beat) = be_u32(i)?;
        let (i, _) = take(24usize)(i)?;
        let (i, pitch) = be_u32(i)?;
        let (i, _) = take(2usize)(i)?;
        let (i, bpm_x100) = be_u16(i)?;
        let (i, beat_within_bar) = be_u8(i)?;
        let (i, _) = take(2usize)(i)?;
        let (i, _device_num_repeat) = be_u8(i)?;

        Ok((
            i,
            Packet::Beat(BeatPacket {
                name,
                device_num,
                next_beat,
                second_beat,
                next_bar,
                fourth_beat,
                second_bar,
                eighth_beat,
                pitch,
                bpm_x100,
                beat_within_bar,
            }),
        ))
    }
}

/// Set of channels currently on-air, as reported by the mixer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelsOnAirPacket {
    pub channels: Vec<u8>,
}

impl ChannelsOnAirPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x29, 0x00][..])(i)?;
        let (i, _name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, count) = be_u8(i)?;
        let (i, raw) = take(count as usize)(i)?;
        let channels: Vec<u8> = raw
            .fragment()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0)
            .map(|(idx, _)| idx as u8 + 1)
            .collect();
        Ok((i, Packet::ChannelsOnAir(ChannelsOnAirPacket { channels })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaderStartCommand {
    Start,
    Stop,
    Ignore,
}

impl FaderStartCommand {
    fn from_byte(b: u8) -> FaderStartCommand {
        match b {
            0 => FaderStartCommand::Start,
            1 => FaderStartCommand::Stop,
            _ => FaderStartCommand::Ignore,
        }
    }
}

/// Four channel-slot fader-start command, spec.md §4.4.
#[derive(Debug, Clone, PartialEq)]
pub struct FaderStartPacket {
    pub channels: [FaderStartCommand; 4],
}

impl FaderStartPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x2a, 0x00][..])(i)?;
        let (i, _name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, c1) = be_u8(i)?;
        let (i, c2) = be_u8(i)?;
        let (i, c3) = be_u8(i)?;
        let (i, c4) = be_u8(i)?;
        Ok((
            i,
            Packet::FaderStart(FaderStartPacket {
                channels: [
                    FaderStartCommand::from_byte(c1),
                    FaderStartCommand::from_byte(c2),
                    FaderStartCommand::from_byte(c3),
                    FaderStartCommand::from_byte(c4),
                ],
            }),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    BecomeMaster,
    SyncOn,
    SyncOff,
}

/// Target device + command, spec.md §4.4.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncControlPacket {
    pub target_device_num: u8,
    pub command: SyncCommand,
}

impl SyncControlPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x2b, 0x00][..])(i)?;
        let (i, _name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, target_device_num) = be_u8(i)?;
        let (i, command_byte) = be_u8(i)?;
        let command = match command_byte {
            0x01 => SyncCommand::BecomeMaster,
            0x10 => SyncCommand::SyncOn,
            0x20 => SyncCommand::SyncOff,
            _ => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    i,
                    nom::error::ErrorKind::Tag,
                )))
            }
        };
        Ok((
            i,
            Packet::SyncControl(SyncControlPacket {
                target_device_num,
                command,
            }),
        ))
    }
}

/// Tempo-master handoff request: "I'd like to become master".
#[derive(Debug, Clone, PartialEq)]
pub struct MasterHandoffRequestPacket {
    pub from_device_num: u8,
}

impl MasterHandoffRequestPacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x2c, 0x00)?;
        w.write_u8(self.from_device_num)
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x2c, 0x00][..])(i)?;
        let (i, from_device_num) = be_u8(i)?;
        Ok((
            i,
            Packet::MasterHandoffRequest(MasterHandoffRequestPacket { from_device_num }),
        ))
    }
}

/// Reply to a handoff request.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterHandoffResponsePacket {
    pub from_device_num: u8,
    pub yielded: bool,
}

impl MasterHandoffResponsePacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x2d, 0x00)?;
        w.write_u8(self.from_device_num)?;
        w.write_u8(if self.yielded { 0x01 } else { 0x00 })
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x2d, 0x00][..])(i)?;
        let (i, from_device_num) = be_u8(i)?;
        let (i, yielded_byte) = be_u8(i)?;
        Ok((
            i,
            Packet::MasterHandoffResponse(MasterHandoffResponsePacket {
                from_device_num,
                yielded: yielded_byte == 0x01,
            }),
        ))
    }
}

/// CDJ-3000+ precise-position packet, 60 bytes (spec.md §4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct PrecisePositionPacket {
    pub device_num: u8,
    pub track_length_seconds: u32,
    pub playback_position_ms: u32,
    pub pitch_percent_x100: i32,
    pub bpm_x1000: u32,
    pub beat: u32,
}

impl PrecisePositionPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x0b, 0x00][..])(i)?;
        let (i, _name) = device_name(i)?;
        let (i, _) = tag(&[0x01][..])(i)?;
        let (i, _proto_ver) = be_u8(i)?;
        let (i, _len) = be_u16(i)?;
        let (i, device_num) = be_u8(i)?;
        let (i, track_length_seconds) = be_u32(i)?;
        let (i, playback_position_ms) = be_u32(i)?;
        let (i, pitch_raw) = be_u32(i)?;
        let (i, bpm_x1000) = be_u32(i)?;
        let (i, beat) = be_u32(i)?;
        let (i, _pad) = take(PRECISE_POSITION_SIZE.saturating_sub(29))(i)?;

        // Signed percentage, two's-complement widened per spec.md §4.4.
        let pitch_percent_x100 = pitch_raw as i32;

        Ok((
            i,
            Packet::PrecisePosition(PrecisePositionPacket {
                device_num,
                track_length_seconds,
                playback_position_ms,
                pitch_percent_x100,
                bpm_x1000,
                beat,
            }),
        ))
    }
}

/// Opus compatibility: request for a PSSI (song-structure) blob.
#[derive(Debug, Clone, PartialEq)]
pub struct OpusMetadataRequestPacket {
    pub requester_device_num: u8,
    pub target_device_num: u8,
    pub rekordbox_id: u32,
}

impl OpusMetadataRequestPacket {
    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write_packet_header(w, 0x34, 0x00)?;
        w.write_u8(self.requester_device_num)?;
        w.write_u8(self.target_device_num)?;
        w.write_u32::<BigEndian>(self.rekordbox_id)
    }

    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x34, 0x00][..])(i)?;
        let (i, requester_device_num) = be_u8(i)?;
        let (i, target_device_num) = be_u8(i)?;
        let (i, rekordbox_id) = be_u32(i)?;
        Ok((
            i,
            Packet::OpusMetadataRequest(OpusMetadataRequestPacket {
                requester_device_num,
                target_device_num,
                rekordbox_id,
            }),
        ))
    }
}

/// One fragment of a PSSI reply, spec.md §4.6. Fragments carry a running
/// packet number and a total-count so the receiver can tell when the
/// reassembly is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct OpusMetadataFragmentPacket {
    pub from_device_num: u8,
    pub fragment_num: u16,
    pub fragment_count: u16,
    pub data: Vec<u8>,
}

impl OpusMetadataFragmentPacket {
    pub fn parse(i: Span) -> IResult<Span, Packet> {
        let (i, _) = header(i)?;
        let (i, _) = tag(&[0x35, 0x00][..])(i)?;
        let (i, from_device_num) = be_u8(i)?;
        let (i, fragment_num) = be_u16(i)?;
        let (i, fragment_count) = be_u16(i)?;
        let (i, len) = be_u16(i)?;
        let (i, data) = take(len as usize)(i)?;
        Ok((
            i,
            Packet::OpusMetadataFragment(OpusMetadataFragmentPacket {
                from_device_num,
                fragment_num,
                fragment_count,
                data: data.fragment().to_vec(),
            }),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    DeviceHello(DeviceAnnouncePacket),
    DeviceKeepAlive(DeviceAnnouncePacket),
    DeviceNumClaim1(DeviceNumClaim1Packet),
    DeviceNumberWillAssign(DeviceNumberWillAssignPacket),
    AssignmentRequest(AssignmentRequestPacket),
    DeviceNumberAssign(DeviceNumberAssignPacket),
    DeviceNumClaim2(DeviceNumClaim2Packet),
    DeviceNumClaim3(DeviceNumClaim3Packet),
    DeviceNumberInUse(DeviceNumberInUsePacket),
    CdjStatus(CdjStatusPacket),
    MixerStatus(MixerStatusPacket),
    Beat(BeatPacket),
    ChannelsOnAir(ChannelsOnAirPacket),
    FaderStart(FaderStartPacket),
    SyncControl(SyncControlPacket),
    MasterHandoffRequest(MasterHandoffRequestPacket),
    MasterHandoffResponse(MasterHandoffResponsePacket),
    PrecisePosition(PrecisePositionPacket),
    OpusMetadataRequest(OpusMetadataRequestPacket),
    OpusMetadataFragment(OpusMetadataFragmentPacket),
}

impl Packet {
    /// Parses a packet received on `port`. Validates the magic first;
    /// unrecognized (port, type) combinations and malformed bodies are
    /// reported as errors for the caller to log-and-drop, per spec.md §7.
    pub fn parse(data: &[u8], port: u16) -> Result<Packet> {
        if data.len() < 11 || !data.starts_with(HEADER) {
            return Err(DjLinkError::PacketTooShort {
                expected: 11,
                actual: data.len(),
            });
        }
        let type_byte = data[0x0a];
        let kind = match classify(port, type_byte) {
            Some(k) => k,
            None => {
                return Err(DjLinkError::UnknownPacketType { port, type_byte });
            }
        };

        let result = match kind {
            PacketKind::DeviceNumClaim1 => DeviceNumClaim1Packet::parse(Span::new(data)),
            PacketKind::DeviceNumberWillAssign => {
                DeviceNumberWillAssignPacket::parse(Span::new(data))
            }
            PacketKind::DeviceNumClaim2 => DeviceNumClaim2Packet::parse(Span::new(data)),
            // Same type byte, two shapes: the mixer's short assign-reply
            // (device_num only) vs. our own longer request (mac + preference).
            PacketKind::AssignmentRequest => {
                if data.len() >= ASSIGNMENT_REQUEST_SIZE {
                    AssignmentRequestPacket::parse(Span::new(data))
                } else {
                    DeviceNumberAssignPacket::parse(Span::new(data))
                }
            }
            PacketKind::DeviceNumClaim3 => DeviceNumClaim3Packet::parse(Span::new(data)),
            PacketKind::DeviceNumberInUse => DeviceNumberInUsePacket::parse(Span::new(data)),
            PacketKind::DeviceKeepAlive => DeviceAnnouncePacket::parse(Span::new(data), false),
            PacketKind::PlayerIdentity => {
                if data.len() < 0x0c {
                    return Err(DjLinkError::PacketTooShort {
                        expected: 0x0c,
                        actual: data.len(),
                    });
                }
                if data[0x0b] == 0x00 {
                    if data.len() != DEVICE_ANNOUNCEMENT_SIZE {
                        return Err(DjLinkError::PacketTooShort {
                            expected: DEVICE_ANNOUNCEMENT_SIZE,
                            actual: data.len(),
                        });
                    }
                    DeviceAnnouncePacket::parse(Span::new(data), true)
                } else if data.len() >= CDJ_STATUS_MIN_SIZE {
                    CdjStatusPacket::parse(Span::new(data))
                } else if data.len() == MIXER_STATUS_SIZE {
                    MixerStatusPacket::parse(Span::new(data))
                } else {
                    return Err(DjLinkError::PacketTooShort {
                        expected: MIXER_STATUS_SIZE,
                        actual: data.len(),
                    });
                }
            }
            PacketKind::Beat => {
                if data.len() != BEAT_SIZE {
                    return Err(DjLinkError::PacketTooShort {
                        expected: BEAT_SIZE,
                        actual: data.len(),
                    });
                }
                BeatPacket::parse(Span::new(data))
            }
            PacketKind::ChannelsOnAir => ChannelsOnAirPacket::parse(Span::new(data)),
            PacketKind::FaderStart => FaderStartPacket::parse(Span::new(data)),
            PacketKind::SyncControl => SyncControlPacket::parse(Span::new(data)),
            PacketKind::MasterHandoffRequest => {
                MasterHandoffRequestPacket::parse(Span::new(data))
            }
            PacketKind::MasterHandoffResponse => {
                MasterHandoffResponsePacket::parse(Span::new(data))
            }
            PacketKind::PrecisePosition => {
                if data.len() != PRECISE_POSITION_SIZE {
                    return Err(DjLinkError::PacketTooShort {
                        expected: PRECISE_POSITION_SIZE,
                        actual: data.len(),
                    });
                }
                PrecisePositionPacket::parse(Span::new(data))
            }
            PacketKind::OpusMetadataRequest => OpusMetadataRequestPacket::parse(Span::new(data)),
            PacketKind::OpusMetadataFragment => {
                OpusMetadataFragmentPacket::parse(Span::new(data))
            }
        };

        match result {
            Ok((rest, pkt)) => {
                if !rest.fragment().is_empty() {
                    return Err(anyhow!(
                        "packet has {} extra trailing bytes",
                        rest.fragment().len()
                    )
                    .into());
                }
                Ok(pkt)
            }
            Err(e) => {
                #[cfg(feature = "save_bad_packets")]
                {
                    if let Ok(timestamp) = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis())
                    {
                        let path = format!("./bad-packets/bad-packet-{}.bin", timestamp);
                        let _ = std::fs::write(&path, data);
                    }
                }
                #[cfg(feature = "log_bad_packets")]
                log::debug!(target: "djlink", "bad packet dump:\n{}", pretty_hex(&data));
                #[cfg(not(feature = "log_bad_packets"))]
                let _ = pretty_hex::<&[u8]>;

                match e {
                    nom::Err::Error(e) | nom::Err::Failure(e) => Err(DjLinkError::ParseError {
                        kind: kind_name(kind),
                        pos: e.input.location_offset(),
                    }),
                    nom::Err::Incomplete(_) => Err(DjLinkError::PacketTooShort {
                        expected: data.len() + 1,
                        actual: data.len(),
                    }),
                }
            }
        }
    }
}

fn kind_name(kind: PacketKind) -> &'static str {
    match kind {
        PacketKind::DeviceNumClaim1 => "DeviceNumClaim1",
        PacketKind::DeviceNumberWillAssign => "DeviceNumberWillAssign",
        PacketKind::DeviceNumClaim2 => "DeviceNumClaim2",
        PacketKind::AssignmentRequest => "AssignmentRequest",
        PacketKind::DeviceNumClaim3 => "DeviceNumClaim3",
        PacketKind::DeviceNumberInUse => "DeviceNumberInUse",
        PacketKind::DeviceKeepAlive => "DeviceKeepAlive",
        PacketKind::PlayerIdentity => "PlayerIdentity",
        PacketKind::Beat => "Beat",
        PacketKind::ChannelsOnAir => "ChannelsOnAir",
        PacketKind::FaderStart => "FaderStart",
        PacketKind::SyncControl => "SyncControl",
        PacketKind::MasterHandoffRequest => "MasterHandoffRequest",
        PacketKind::MasterHandoffResponse => "MasterHandoffResponse",
        PacketKind::PrecisePosition => "PrecisePosition",
        PacketKind::OpusMetadataRequest => "OpusMetadataRequest",
        PacketKind::OpusMetadataFragment => "OpusMetadataFragment",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_announce(hello: bool) -> DeviceAnnouncePacket {
        DeviceAnnouncePacket {
            name: "CDJ-2000NXS2".to_string(),
            device_num: 2,
            device_type: 1,
            mac_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            ip_addr: [10, 0, 0, 2],
            peers_seen: 1,
            unknown_35: 1,
            hello,
        }
    }

    #[test]
    fn test_keep_alive_roundtrip() {
        let pkt = roundtrip_announce(false);
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), DEVICE_ANNOUNCEMENT_SIZE);

        let parsed = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap();
        assert_eq!(parsed, Packet::DeviceKeepAlive(pkt));
    }

    #[test]
    fn test_hello_roundtrip() {
        let pkt = roundtrip_announce(true);
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), DEVICE_ANNOUNCEMENT_SIZE);

        let parsed = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap();
        assert_eq!(parsed, Packet::DeviceHello(pkt));
    }

    #[test]
    fn test_packet_too_short() {
        let buf = [0u8; 10];
        let err = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap_err();
        assert!(matches!(err, DjLinkError::PacketTooShort { .. }));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut buf = vec![0xffu8; DEVICE_ANNOUNCEMENT_SIZE];
        buf[0] = 0x00;
        let err = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap_err();
        assert!(matches!(err, DjLinkError::PacketTooShort { .. }));
    }

    #[test]
    fn test_assignment_request_roundtrip() {
        let pkt = AssignmentRequestPacket {
            name: "djlink".to_string(),
            mac_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            preference: 1,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), ASSIGNMENT_REQUEST_SIZE);

        let parsed = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap();
        assert_eq!(parsed, Packet::AssignmentRequest(pkt));
    }

    #[test]
    fn test_device_number_assign_roundtrip() {
        let pkt = DeviceNumberAssignPacket {
            name: "DJM-900NXS2".to_string(),
            device_num: 3,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert!(buf.len() < ASSIGNMENT_REQUEST_SIZE);

        let parsed = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap();
        assert_eq!(parsed, Packet::DeviceNumberAssign(pkt));
    }

    #[test]
    fn test_beat_roundtrip_and_effective_tempo() {
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
            beat_within_bar: 3,
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert_eq!(buf.len(), BEAT_SIZE);

        let parsed = Packet::parse(&buf, BEAT_PORT).unwrap();
        match &parsed {
            Packet::Beat(b) => {
                assert_eq!(b.beat_within_bar, 3);
                assert!((b.effective_tempo() - 128.0).abs() < 1e-9);
            }
            _ => panic!("expected beat packet"),
        }
        assert_eq!(parsed, Packet::Beat(pkt));
    }

    #[test]
    fn test_claim1_roundtrip() {
        let pkt = DeviceNumClaim1Packet {
            name: "djlink-cli".to_string(),
            pkt_num: 2,
            mac_addr: [1, 2, 3, 4, 5, 6],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        let parsed = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap();
        assert_eq!(parsed, Packet::DeviceNumClaim1(pkt));
    }

    #[test]
    fn test_sync_control_parse() {
        let mut buf = Vec::new();
        buf.extend_from_slice(HEADER);
        buf.extend_from_slice(&[0x2b, 0x00]);
        buf.extend_from_slice(&[0u8; 20]); // name
        buf.push(0x01);
        buf.push(0x02);
        buf.extend_from_slice(&[0x00, 0x00]); // len
        buf.push(4); // target device
        buf.push(0x10); // sync on

        let parsed = Packet::parse(&buf, BEAT_PORT).unwrap();
        assert_eq!(
            parsed,
            Packet::SyncControl(SyncControlPacket {
                target_device_num: 4,
                command: SyncCommand::SyncOn,
            })
        );
    }

    #[test]
    fn test_cdj_status_roundtrip() {
        let pkt = CdjStatusPacket {
            name: "CDJ-3000".to_string(),
            device_num: 2,
            track_device: 2,
            track_slot: 2,
            track_type: 1,
            rekordbox_id: 42,
            play_state: PlayState::Playing,
            flags: StatusFlags::MASTER | StatusFlags::PLAYING,
            pitch: 0x100000,
            bpm_x100: 12800,
            beat: 17,
            beat_within_bar: 1,
            handoff_target: 0,
            firmware_ver: "1.00".to_string(),
            reserved: vec![0; 40],
        };
        let mut buf = Vec::new();
        pkt.write(&mut buf).unwrap();
        assert!(buf.len() >= CDJ_STATUS_MIN_SIZE);

        let parsed = Packet::parse(&buf, STATUS_PORT).unwrap();
        assert_eq!(parsed, Packet::CdjStatus(pkt));
    }

    #[test]
    fn test_unknown_type_dropped() {
        let mut buf = vec![0u8; 20];
        buf[..10].copy_from_slice(HEADER);
        buf[10] = 0x7f; // never a known type on this port
        let err = Packet::parse(&buf, ANNOUNCEMENT_PORT).unwrap_err();
        assert!(matches!(err, DjLinkError::UnknownPacketType { .. }));
    }
}
