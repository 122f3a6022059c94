//! Device-set data model: addresses, announcements, and per-port updates
//! (spec.md §3). This module holds plain data; the finders and player own
//! the behavior that produces and consumes it.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;

use crate::proto::{self, PlayState, StatusFlags};
use crate::safety;

/// A physical (IP, MAC) pair plus the logical number it currently claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceAddress {
    pub device_num: u8,
    pub ip_addr: Ipv4Addr,
    pub mac_addr: [u8; 6],
}

/// The 54-byte presence record seen on port 50000 (spec.md §3). Carries
/// enough to key and age entries in the device set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAnnouncement {
    pub name: String,
    pub address: DeviceAddress,
    pub device_type: u8,
}

impl DeviceAnnouncement {
    pub(crate) fn from_packet(pkt: &proto::DeviceAnnouncePacket) -> DeviceAnnouncement {
        DeviceAnnouncement {
            name: pkt.name.clone(),
            address: DeviceAddress {
                device_num: pkt.device_num,
                ip_addr: Ipv4Addr::from(pkt.ip_addr),
                mac_addr: pkt.mac_addr,
            },
            device_type: pkt.device_type,
        }
    }
}

/// Reference to the track loaded on a player's deck, spec.md §3 "track
/// reference".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackReference {
    pub track_device: u8,
    pub track_slot: u8,
    pub track_type: u8,
    pub rekordbox_id: u32,
}

impl TrackReference {
    pub fn is_empty(&self) -> bool {
        self.rekordbox_id == 0
    }
}

/// Per-variant device update, spec.md §3 "Device Update". One value is
/// produced per status packet received on port 50002 / beat packet on
/// port 50001.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceUpdate {
    Beat {
        device_num: u8,
        bpm: f64,
        pitch_percent: f64,
        beat_within_bar: u8,
    },
    CdjStatus {
        device_num: u8,
        track: TrackReference,
        play_state: PlayStateView,
        playing: bool,
        master: bool,
        synced: bool,
        on_air: bool,
        bpm: f64,
        pitch_percent: f64,
        beat_within_bar: u8,
        handoff_target: Option<u8>,
    },
    MixerStatus {
        device_num: u8,
        master: bool,
        on_air: bool,
        bpm: f64,
    },
}

impl DeviceUpdate {
    pub fn device_num(&self) -> u8 {
        match self {
            DeviceUpdate::Beat { device_num, .. } => *device_num,
            DeviceUpdate::CdjStatus { device_num, .. } => *device_num,
            DeviceUpdate::MixerStatus { device_num, .. } => *device_num,
        }
    }

    pub fn is_master(&self) -> bool {
        match self {
            DeviceUpdate::Beat { .. } => false,
            DeviceUpdate::CdjStatus { master, .. } => *master,
            DeviceUpdate::MixerStatus { master, .. } => *master,
        }
    }

    pub fn effective_tempo(&self) -> Option<f64> {
        match self {
            DeviceUpdate::Beat { bpm, pitch_percent, .. } => {
                Some(bpm * (1.0 + pitch_percent / 100.0))
            }
            DeviceUpdate::CdjStatus {
                bpm, pitch_percent, ..
            } => Some(bpm * (1.0 + pitch_percent / 100.0)),
            DeviceUpdate::MixerStatus { bpm, .. } => Some(*bpm),
        }
    }

    /// Clamps every field the safety layer covers (spec.md §6): the
    /// rightmost stop before an update reaches `Event::Update` and, from
    /// there, JSONL/CLI/GUI emission. Fields the safety layer doesn't
    /// cover (flags, track reference, play state) pass through unchanged.
    pub fn sanitized(&self) -> DeviceUpdate {
        match self.clone() {
            DeviceUpdate::Beat {
                device_num,
                bpm,
                pitch_percent,
                beat_within_bar,
            } => DeviceUpdate::Beat {
                device_num: safety::sanitize_device_number(device_num),
                bpm: safety::sanitize_bpm(bpm),
                pitch_percent: safety::sanitize_pitch_percent(pitch_percent),
                beat_within_bar: safety::sanitize_beat_within_bar(beat_within_bar),
            },
            DeviceUpdate::CdjStatus {
                device_num,
                track,
                play_state,
                playing,
                master,
                synced,
                on_air,
                bpm,
                pitch_percent,
                beat_within_bar,
                handoff_target,
            } => DeviceUpdate::CdjStatus {
                device_num: safety::sanitize_device_number(device_num),
                track,
                play_state,
                playing,
                master,
                synced,
                on_air,
                bpm: safety::sanitize_bpm(bpm),
                pitch_percent: safety::sanitize_pitch_percent(pitch_percent),
                beat_within_bar: safety::sanitize_beat_within_bar(beat_within_bar),
                handoff_target,
            },
            DeviceUpdate::MixerStatus {
                device_num,
                master,
                on_air,
                bpm,
            } => DeviceUpdate::MixerStatus {
                device_num: safety::sanitize_device_number(device_num),
                master,
                on_air,
                bpm: safety::sanitize_bpm(bpm),
            },
        }
    }

    pub(crate) fn from_cdj_status(pkt: &proto::CdjStatusPacket) -> DeviceUpdate {
        DeviceUpdate::CdjStatus {
            device_num: pkt.device_num,
            track: TrackReference {
                track_device: pkt.track_device,
                track_slot: pkt.track_slot,
                track_type: pkt.track_type,
                rekordbox_id: pkt.rekordbox_id,
            },
            play_state: PlayStateView::from(pkt.play_state),
            playing: pkt.flags.contains(StatusFlags::PLAYING),
            master: pkt.flags.contains(StatusFlags::MASTER),
            synced: pkt.flags.contains(StatusFlags::SYNCED),
            on_air: pkt.flags.contains(StatusFlags::ON_AIR),
            bpm: pkt.bpm_x100 as f64 / 100.0,
            pitch_percent: pitch_raw_to_percent(pkt.pitch),
            beat_within_bar: pkt.beat_within_bar,
            handoff_target: if pkt.handoff_target == 0xff {
                None
            } else {
                Some(pkt.handoff_target)
            },
        }
    }

    pub(crate) fn from_mixer_status(pkt: &proto::MixerStatusPacket) -> DeviceUpdate {
        DeviceUpdate::MixerStatus {
            device_num: pkt.device_num,
            master: pkt.flags.contains(StatusFlags::MASTER),
            on_air: pkt.flags.contains(StatusFlags::ON_AIR),
            bpm: pkt.bpm_x100 as f64 / 100.0,
        }
    }

    pub(crate) fn from_beat(pkt: &proto::BeatPacket) -> DeviceUpdate {
        DeviceUpdate::Beat {
            device_num: pkt.device_num,
            bpm: pkt.bpm_x100 as f64 / 100.0,
            pitch_percent: pitch_raw_to_percent(pkt.pitch),
            beat_within_bar: pkt.beat_within_bar,
        }
    }
}

/// 32-bit fixed-point pitch, neutral at `0x100000` (1.0), to a signed
/// percentage (spec.md §3 "effective tempo formula").
fn pitch_raw_to_percent(raw: u32) -> f64 {
    (raw as f64 / 1_048_576.0 - 1.0) * 100.0
}

/// Serializable mirror of [`PlayState`] (the wire type isn't `Serialize`
/// since it is purely an internal codec concern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayStateView {
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
    Unknown,
}

impl From<PlayState> for PlayStateView {
    fn from(s: PlayState) -> PlayStateView {
        match s {
            PlayState::NoTrack => PlayStateView::NoTrack,
            PlayState::Loading => PlayStateView::Loading,
            PlayState::Playing => PlayStateView::Playing,
            PlayState::Looping => PlayStateView::Looping,
            PlayState::Paused => PlayStateView::Paused,
            PlayState::Cued => PlayStateView::Cued,
            PlayState::Cueing => PlayStateView::Cueing,
            PlayState::Searching => PlayStateView::Searching,
            PlayState::SpunDown => PlayStateView::SpunDown,
            PlayState::Ended => PlayStateView::Ended,
            PlayState::Unknown(_) => PlayStateView::Unknown,
        }
    }
}

/// How long a device entry survives without a fresh announcement before
/// the Device Finder evicts it (spec.md §4.3's "device set invariant").
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a physical Opus Quad / XDJ-AZ address onto the four logical
/// virtual-player numbers it reports as, per spec.md §3.
pub fn opus_logical_numbers(announcement: &DeviceAnnouncement) -> Option<[u8; 4]> {
    if proto::is_device_library_plus(&announcement.name) {
        Some(proto::OPUS_LOGICAL_NUMBERS)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_raw_to_percent_neutral() {
        assert!((pitch_raw_to_percent(0x100000) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_effective_tempo() {
        let update = DeviceUpdate::CdjStatus {
            device_num: 2,
            track: TrackReference {
                track_device: 2,
                track_slot: 1,
                track_type: 1,
                rekordbox_id: 42,
            },
            play_state: PlayStateView::Playing,
            playing: true,
            master: false,
            synced: false,
            on_air: true,
            bpm: 128.0,
            pitch_percent: 2.0,
            beat_within_bar: 1,
            handoff_target: None,
        };
        assert!((update.effective_tempo().unwrap() - 130.56).abs() < 1e-9);
    }

    #[test]
    fn test_sanitized_clamps_out_of_range_fields() {
        let update = DeviceUpdate::Beat {
            device_num: 200,
            bpm: 900.0,
            pitch_percent: f64::NAN,
            beat_within_bar: 9,
        };
        match update.sanitized() {
            DeviceUpdate::Beat {
                device_num,
                bpm,
                pitch_percent,
                beat_within_bar,
            } => {
                assert_eq!(device_num, 1);
                assert_eq!(bpm, 300.0);
                assert_eq!(pitch_percent, 0.0);
                assert_eq!(beat_within_bar, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_track_reference_is_empty() {
        let t = TrackReference {
            track_device: 0,
            track_slot: 0,
            track_type: 0,
            rekordbox_id: 0,
        };
        assert!(t.is_empty());
    }
}
