//! Per-stream rolling text buffer of the last N seconds of finalized
//! transcript text.

#[derive(Debug, Clone)]
struct Entry {
    text: String,
    end_s: f64,
}

/// Sliding window keyed on the latest observed end time. A late
/// out-of-order token never rewinds the eviction horizon.
pub struct SlidingWindow {
    window_s: f64,
    entries: Vec<Entry>,
    latest_end_s: f64,
}

impl SlidingWindow {
    pub const DEFAULT_WINDOW_SECONDS: f64 = 10.0;

    pub fn new(window_s: f64) -> Self {
        Self {
            window_s,
            entries: Vec::new(),
            latest_end_s: 0.0,
        }
    }

    /// Adds a finalized fragment and returns the current window text.
    pub fn append(&mut self, text: &str, _start_s: f64, end_s: f64) -> String {
        self.entries.push(Entry {
            text: text.to_string(),
            end_s,
        });
        self.latest_end_s = self.latest_end_s.max(end_s);
        let cutoff = self.latest_end_s - self.window_s;
        self.entries.retain(|e| e.end_s >= cutoff);
        self.text()
    }

    /// Space-joined text of all fragments currently in the window.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| !e.text.is_empty())
            .map(|e| e.text.as_str())
            .collect();
        parts.join(" ")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.latest_end_s = 0.0;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_SECONDS)
    }
}
