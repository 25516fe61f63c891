//! Sliding-window HLS media playlist.

use std::collections::VecDeque;
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub uri: String,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub struct MediaPlaylist {
    window_size: usize,
    capacity: usize,
    media_sequence: u64,
    segments: VecDeque<SegmentEntry>,
}

impl MediaPlaylist {
    /// `window_size` is clamped to `capacity`; both are at least 1.
    pub fn new(window_size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let window_size = window_size.clamp(1, capacity);
        Self {
            window_size,
            capacity,
            media_sequence: 0,
            segments: VecDeque::with_capacity(window_size),
        }
    }

    /// Append a segment, evicting the oldest once the window is full.
    pub fn slide(&mut self, uri: String, duration_secs: f64) {
        if self.segments.len() == self.window_size {
            self.segments.pop_front();
            self.media_sequence += 1;
        }
        self.segments.push_back(SegmentEntry { uri, duration_secs });
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.uri.as_str())
    }

    pub fn encode(&self) -> String {
        let target = self
            .segments
            .iter()
            .map(|s| s.duration_secs.ceil() as u64)
            .max()
            .unwrap_or(10);
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);
        for segment in &self.segments {
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
            out.push_str(&segment.uri);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_clamped_to_capacity() {
        let mut playlist = MediaPlaylist::new(10, 3);
        assert_eq!(playlist.capacity(), 3);
        for i in 0..10 {
            playlist.slide(format!("s{i}.ts"), 2.0);
            assert!(playlist.len() <= 3);
        }
    }

    #[test]
    fn slide_evicts_oldest_and_advances_sequence() {
        let mut playlist = MediaPlaylist::new(3, 5);
        for i in 0..5 {
            playlist.slide(format!("seg{i}.ts"), 2.0);
        }
        assert_eq!(playlist.len(), 3);
        let uris: Vec<_> = playlist.uris().collect();
        assert_eq!(uris, ["seg2.ts", "seg3.ts", "seg4.ts"]);

        let encoded = playlist.encode();
        assert!(encoded.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(encoded.contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
        assert!(encoded.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(encoded.contains("#EXTINF:2.000,\nseg4.ts\n"));
        assert!(!encoded.contains("seg0.ts"));
    }

    #[test]
    fn target_duration_rounds_up() {
        let mut playlist = MediaPlaylist::new(3, 3);
        playlist.slide("a.ts".into(), 2.4);
        playlist.slide("b.ts".into(), 1.2);
        assert!(playlist.encode().contains("#EXT-X-TARGETDURATION:3\n"));
    }
}
