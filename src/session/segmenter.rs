//! Splits a streamed reply into speakable chunks.
//!
//! Deltas are buffered until the buffer ends (ignoring trailing whitespace)
//! with a boundary marker; the buffer is then flushed as one chunk.
//! Chunks are never altered, so concatenating every emitted chunk
//! reproduces the full reply.

/// Sentence punctuation and pause markers that end a chunk.
pub const BOUNDARY_MARKERS: &[&str] = &[".", "!", "?", ";", ":", "—", "–", " -"];

#[derive(Debug, Default)]
pub struct Segmenter {
    buffer: String,
    full: String,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta. Returns a chunk when the buffer reaches a boundary.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.full.push_str(delta);
        self.buffer.push_str(delta);

        let tail = self.buffer.trim_end();
        if !tail.is_empty() && BOUNDARY_MARKERS.iter().any(|m| tail.ends_with(m)) {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// End of stream: the remaining buffer (possibly empty) and the full text.
    pub fn finish(self) -> (String, String) {
        (self.buffer, self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(deltas: &[&str]) -> (Vec<String>, String, String) {
        let mut seg = Segmenter::new();
        let chunks: Vec<String> = deltas.iter().filter_map(|d| seg.push(d)).collect();
        let (rest, full) = seg.finish();
        (chunks, rest, full)
    }

    #[test]
    fn flushes_at_sentence_ends() {
        let (chunks, rest, full) = run(&["Oh no", ", that sounds", " urgent. ", "Can I get", " your address?"]);
        assert_eq!(chunks, vec!["Oh no, that sounds urgent. ", "Can I get your address?"]);
        assert_eq!(rest, "");
        assert_eq!(full, "Oh no, that sounds urgent. Can I get your address?");
    }

    #[test]
    fn no_boundary_is_one_final_chunk() {
        let (chunks, rest, full) = run(&["Sure", " thing", " mate"]);
        assert!(chunks.is_empty());
        assert_eq!(rest, "Sure thing mate");
        assert_eq!(full, rest);
    }

    #[test]
    fn dash_is_a_pause() {
        let (chunks, rest, _) = run(&["Absolutely —", " what's", " the address"]);
        assert_eq!(chunks, vec!["Absolutely —"]);
        assert_eq!(rest, " what's the address");
    }

    #[test]
    fn hyphenated_words_do_not_split() {
        let (chunks, _, _) = run(&["on-", "site visit"]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn concatenation_round_trips() {
        let cases: &[&[&str]] = &[
            &["A. B! C? D; E", "", " — f -", " g"],
            &["", "", ""],
            &["...", "!!", " ", "x"],
            &["one delta with no markers"],
        ];
        for deltas in cases {
            let (chunks, rest, full) = run(deltas);
            assert_eq!(chunks.concat() + &rest, deltas.concat());
            assert_eq!(full, deltas.concat());
        }
    }
}
