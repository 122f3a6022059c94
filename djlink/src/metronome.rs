//! Pure time -> (beat, phase) conversion (spec.md §4.2). Holds no clock of
//! its own; callers pass in whatever timestamp they're tracking (typically
//! milliseconds since the virtual player started).

/// A beat number (1-indexed) and fractional position within that beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSnapshot {
    pub beat: u64,
    pub phase: f64,
}

/// Maps time to beat position at a given tempo, with an adjustable origin
/// so tempo changes and beat jumps don't cause a discontinuity in phase.
#[derive(Debug, Clone, Copy)]
pub struct Metronome {
    tempo_bpm: f64,
    start_ms: f64,
}

impl Metronome {
    pub fn new(tempo_bpm: f64, start_ms: f64) -> Metronome {
        Metronome { tempo_bpm, start_ms }
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn beat_interval_ms(&self) -> f64 {
        60_000.0 / self.tempo_bpm
    }

    /// Fractional beat count since the origin; beat 1 begins at
    /// `position == 0.0`.
    fn position(&self, now_ms: f64) -> f64 {
        (now_ms - self.start_ms) / self.beat_interval_ms()
    }

    pub fn snapshot(&self, now_ms: f64) -> BeatSnapshot {
        let position = self.position(now_ms);
        let beat_index = position.floor();
        BeatSnapshot {
            beat: beat_index as i64 as u64 + 1,
            phase: position - beat_index,
        }
    }

    /// Changes tempo while preserving the current phase at `now_ms`, so the
    /// beat that's currently sounding keeps sounding.
    pub fn set_tempo(&mut self, new_tempo_bpm: f64, now_ms: f64) {
        let position = self.position(now_ms);
        self.tempo_bpm = new_tempo_bpm;
        let new_interval = self.beat_interval_ms();
        self.start_ms = now_ms - position * new_interval;
    }

    /// Realigns the origin so `beat` starts exactly at `now_ms`.
    pub fn jump_to_beat(&mut self, beat: u64, now_ms: f64) {
        let interval = self.beat_interval_ms();
        self.start_ms = now_ms - (beat.saturating_sub(1)) as f64 * interval;
    }

    /// Shifts the origin by `delta_ms` without touching tempo.
    pub fn adjust_start(&mut self, delta_ms: f64) {
        self.start_ms += delta_ms;
    }

    /// The timestamp at which `beat` begins.
    pub fn time_of_beat(&self, beat: u64) -> f64 {
        self.start_ms + (beat.saturating_sub(1)) as f64 * self.beat_interval_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_at_120_bpm() {
        let m = Metronome::new(120.0, 0.0);
        assert_eq!(m.snapshot(0.0).beat, 1);
        assert_eq!(m.snapshot(500.0).beat, 2);
        assert_eq!(m.snapshot(2000.0).beat, 5);
    }

    #[test]
    fn test_set_tempo_preserves_phase() {
        let mut m = Metronome::new(120.0, 0.0);
        assert!((m.snapshot(250.0).phase - 0.5).abs() < 1e-9);
        m.set_tempo(60.0, 250.0);
        assert!((m.snapshot(250.0).phase - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_jump_to_beat() {
        let mut m = Metronome::new(120.0, 0.0);
        m.jump_to_beat(8, 1000.0);
        let snap = m.snapshot(1000.0);
        assert_eq!(snap.beat, 8);
        assert!(snap.phase.abs() < 1e-9);
    }

    #[test]
    fn test_time_of_beat_roundtrip() {
        let m = Metronome::new(120.0, 0.0);
        let t = m.time_of_beat(5);
        assert_eq!(m.snapshot(t).beat, 5);
    }
}
