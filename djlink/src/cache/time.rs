//! Time Finder (spec.md §4.9): turns discrete beat/status/precise-position
//! events into a continuous interpolated play position per deck.
//!
//! Beat-grid lookups (exact track-millisecond for a given beat number) need
//! the ANLZ beat-grid file, which spec.md places out of scope (§1); beat
//! events are therefore always handled by interpolation here rather than
//! grid lookup, and `grid` is always `false` on emitted updates. Precise-
//! position packets (spec.md §4.4) carry an exact millisecond figure
//! already and are used as ground truth whenever they arrive.

use std::collections::HashMap;

use crate::proto::PrecisePositionPacket;

const SLACK_MS_PLAYING: f64 = 50.0;
const SLACK_MS_STOPPED: f64 = 0.0;
const PITCH_EPSILON_BEAT: f64 = 1e-6;
const PITCH_EPSILON_MIXED_ORIGIN: f64 = 1e-3;

/// One emitted play-position sample (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPositionUpdate {
    pub timestamp_ms: f64,
    pub milliseconds: u32,
    pub beat: u32,
    pub playing: bool,
    pub pitch: f64,
    pub reverse: bool,
    /// Looked up from a beat grid rather than interpolated. Always `false`
    /// here — see module docs.
    pub grid: bool,
    /// Came from a precise-position packet.
    pub precise: bool,
    /// Came from a beat packet.
    pub from_beat: bool,
}

impl TrackPositionUpdate {
    fn interpolate(&self, now_ms: f64) -> u32 {
        let delta = now_ms - self.timestamp_ms;
        let direction = if self.reverse { -1.0 } else { 1.0 };
        let moved = delta * self.pitch * direction;
        (self.milliseconds as f64 + moved).max(0.0).round() as u32
    }
}

#[derive(Default)]
pub struct TimeFinder {
    decks: HashMap<u8, TrackPositionUpdate>,
}

impl TimeFinder {
    pub fn new() -> TimeFinder {
        TimeFinder::default()
    }

    /// A precise-position packet is ground truth. Re-emits only if the
    /// actual position disagrees with what interpolation from the last
    /// update would have predicted by more than `slack`, or pitch moved
    /// more than the mixed-origin epsilon (spec.md §4.9).
    pub fn on_precise_position(
        &mut self,
        device_num: u8,
        now_ms: f64,
        playing: bool,
        pkt: &PrecisePositionPacket,
    ) -> Option<TrackPositionUpdate> {
        let pitch = pkt.pitch_percent_x100 as f64 / 10000.0 + 1.0;
        let reverse = pitch < 0.0;

        let slack = if playing { SLACK_MS_PLAYING } else { SLACK_MS_STOPPED };
        let should_emit = match self.decks.get(&device_num) {
            Some(prev) => {
                let predicted = prev.interpolate(now_ms);
                let drift = (predicted as f64 - pkt.playback_position_ms as f64).abs();
                let pitch_jump = (pitch - prev.pitch).abs();
                drift > slack || pitch_jump > PITCH_EPSILON_MIXED_ORIGIN
            }
            None => true,
        };

        let update = TrackPositionUpdate {
            timestamp_ms: now_ms,
            milliseconds: pkt.playback_position_ms,
            beat: pkt.beat,
            playing,
            pitch,
            reverse,
            grid: false,
            precise: true,
            from_beat: false,
        };
        self.decks.insert(device_num, update);

        if should_emit {
            Some(update)
        } else {
            None
        }
    }

    /// A beat packet advances the deck by interpolation (no beat grid to
    /// look up an exact millisecond). Beat-origin updates always forward
    /// to "track-position-beat" listeners per spec.md §4.9, regardless of
    /// the slack comparison that gates precise-position re-emits.
    pub fn on_beat(
        &mut self,
        device_num: u8,
        now_ms: f64,
        beat: u32,
        bpm: f64,
        pitch: f64,
        playing: bool,
        reverse: bool,
    ) -> TrackPositionUpdate {
        let milliseconds = match self.decks.get(&device_num) {
            Some(prev) => prev.interpolate(now_ms),
            None => 0,
        };
        let _ = bpm;

        let update = TrackPositionUpdate {
            timestamp_ms: now_ms,
            milliseconds,
            beat,
            playing,
            pitch,
            reverse,
            grid: false,
            precise: false,
            from_beat: true,
        };
        self.decks.insert(device_num, update);
        update
    }

    /// The interpolated position right now, without a new wire event.
    pub fn position_now(&self, device_num: u8, now_ms: f64) -> Option<u32> {
        self.decks.get(&device_num).map(|u| u.interpolate(now_ms))
    }

    /// A device-lost event: forget the deck's position entirely.
    pub fn forget(&mut self, device_num: u8) {
        self.decks.remove(&device_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn precise_pkt(ms: u32, beat: u32) -> PrecisePositionPacket {
        PrecisePositionPacket {
            device_num: 1,
            track_length_seconds: 300,
            playback_position_ms: ms,
            pitch_percent_x100: 0,
            bpm_x1000: 128_000,
            beat,
        }
    }

    #[test]
    fn test_first_precise_position_always_emits() {
        let mut finder = TimeFinder::new();
        let update = finder.on_precise_position(1, 0.0, true, &precise_pkt(1000, 4));
        assert!(update.is_some());
        assert_eq!(update.unwrap().milliseconds, 1000);
    }

    #[test]
    fn test_small_drift_within_slack_suppresses_reemit() {
        let mut finder = TimeFinder::new();
        finder.on_precise_position(1, 0.0, true, &precise_pkt(1000, 4));
        // 500ms later at 1.0x pitch we'd predict 1500ms; report 1520ms (20ms drift).
        let update = finder.on_precise_position(1, 500.0, true, &precise_pkt(1520, 4));
        assert!(update.is_none());
    }

    #[test]
    fn test_large_drift_forces_reemit() {
        let mut finder = TimeFinder::new();
        finder.on_precise_position(1, 0.0, true, &precise_pkt(1000, 4));
        let update = finder.on_precise_position(1, 500.0, true, &precise_pkt(2000, 4));
        assert!(update.is_some());
    }

    #[test]
    fn test_beat_interpolates_from_last_precise_position() {
        let mut finder = TimeFinder::new();
        finder.on_precise_position(1, 0.0, true, &precise_pkt(1000, 4));
        let update = finder.on_beat(1, 500.0, 5, 128.0, 1.0, true, false);
        assert_eq!(update.milliseconds, 1500);
        assert!(update.from_beat);
        assert!(!update.grid);
    }

    #[test]
    fn test_forget_clears_deck_state() {
        let mut finder = TimeFinder::new();
        finder.on_precise_position(1, 0.0, true, &precise_pkt(1000, 4));
        finder.forget(1);
        assert_eq!(finder.position_now(1, 100.0), None);
    }
}
