//! Incremental sentence segmentation for streamed LLM output
//!
//! Tokens arrive in arbitrary chunk boundaries. The segmenter emits complete
//! sentences (split on `.`, `?`, `!`, `…` followed by whitespace, or at end of
//! stream) as soon as they are available, while holding back anything inside a
//! `<signals>…</signals>` block so structured observations never reach TTS.
//! The raw accumulated text, blocks included, stays available for the phase
//! controller.

const OPEN_TAG: &str = "<signals>";
const CLOSE_TAG: &str = "</signals>";

fn is_terminator(ch: char) -> bool {
    matches!(ch, '.' | '?' | '!' | '…')
}

/// Streaming splitter with signal-block filtering
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    /// Full raw text including signal blocks
    raw: String,
    /// Spoken text awaiting a sentence boundary
    pending: String,
    /// Unclassified tail: either inside a block or a possible partial tag
    scan: String,
    in_block: bool,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one streamed chunk, returning any sentences completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.raw.push_str(chunk);
        self.scan.push_str(chunk);
        self.drain_scan();
        self.take_complete_sentences()
    }

    /// Flush at end of stream, returning the trailing partial sentence if any
    pub fn finish(&mut self) -> Vec<String> {
        // An unterminated block is malformed; its content is never spoken.
        if !self.in_block {
            let tail = std::mem::take(&mut self.scan);
            self.pending.push_str(&tail);
        }
        self.scan.clear();
        self.in_block = false;

        let mut sentences = self.take_complete_sentences();
        let tail = std::mem::take(&mut self.pending);
        let tail = tail.trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
        sentences
    }

    /// Everything fed so far, signal blocks included
    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    /// Move classified text out of `scan` into `pending`, stripping blocks
    fn drain_scan(&mut self) {
        loop {
            if self.in_block {
                match self.scan.find(CLOSE_TAG) {
                    Some(idx) => {
                        // Block content is dropped from speech; raw keeps it.
                        self.scan.drain(..idx + CLOSE_TAG.len());
                        self.in_block = false;
                    }
                    None => return,
                }
            } else {
                match self.scan.find(OPEN_TAG) {
                    Some(idx) => {
                        let spoken: String = self.scan.drain(..idx).collect();
                        self.pending.push_str(&spoken);
                        self.scan.drain(..OPEN_TAG.len());
                        self.in_block = true;
                    }
                    None => {
                        let keep = partial_tag_suffix(&self.scan);
                        let split = self.scan.len() - keep;
                        let spoken: String = self.scan.drain(..split).collect();
                        self.pending.push_str(&spoken);
                        return;
                    }
                }
            }
        }
    }

    /// Emit every `terminator + whitespace` bounded sentence in `pending`
    fn take_complete_sentences(&mut self) -> Vec<String> {
        let mut sentences = Vec::new();
        loop {
            let mut boundary = None;
            let mut chars = self.pending.char_indices().peekable();
            while let Some((idx, ch)) = chars.next() {
                if !is_terminator(ch) {
                    continue;
                }
                // Extend through runs like "?!" before requiring whitespace
                let mut end = idx + ch.len_utf8();
                while let Some((next_idx, next_ch)) = chars.peek().copied() {
                    if is_terminator(next_ch) {
                        end = next_idx + next_ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some((_, next_ch)) = chars.peek() {
                    if next_ch.is_whitespace() {
                        boundary = Some(end);
                        break;
                    }
                }
            }
            match boundary {
                Some(end) => {
                    let sentence: String = self.pending.drain(..end).collect();
                    let rest = self.pending.trim_start().to_string();
                    self.pending = rest;
                    let sentence = sentence.trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence.to_string());
                    }
                }
                None => return sentences,
            }
        }
    }
}

/// Length of the longest suffix that could still grow into `<signals>`
fn partial_tag_suffix(text: &str) -> usize {
    let max = OPEN_TAG.len().min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        let suffix = &text[text.len() - len..];
        if OPEN_TAG.starts_with(suffix) {
            return len;
        }
    }
    0
}
