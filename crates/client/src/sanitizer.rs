//! Boundary-aware repair of terminal control sequences.
//!
//! Shell output is scanned for DEC private-mode sequences (`ESC [ ? Pm h|l`)
//! that leave the renderer in a state it cannot resume from: leaving the
//! alternate screen, disabling auto-wrap, or (heuristically) a full-screen
//! program handing control back to the shell. A hit that is not already
//! followed by an auto-wrap enable appends [`FORCE_AUTOWRAP`] to the
//! forwarded text and asks the caller to resend the terminal geometry so the
//! remote side redraws. Running sanitized output through a fresh sanitizer
//! therefore changes nothing.
//!
//! Column-mode toggles (`?3h` / `?3l`) are removed from the forwarded text
//! entirely.
//!
//! A sequence can be split across two deliveries. An unfinished
//! `ESC [ ? Pm` prefix at the end of a chunk is held back and forwarded with
//! the next one, once it is known what it becomes. The last few raw bytes of
//! each chunk are also kept as a tail and scanned together with the next
//! one. Only sequences that end inside the new text count, so a marker is
//! reported exactly once.

/// Appended to any chunk that triggered a detection.
pub const FORCE_AUTOWRAP: &str = "\x1b[?7h";

/// Raw bytes carried between calls, and the longest prefix held back.
pub const TAIL_LIMIT: usize = 31;

const ESC: u8 = 0x1b;

/// Alternate-screen modes; resetting any of them leaves the alternate screen.
const ALT_SCREEN_MODES: [u16; 3] = [47, 1047, 1049];

const AUTOWRAP_MODE: u16 = 7;
const COLUMN_MODE: u16 = 3;
const BRACKETED_PASTE_MODE: u16 = 2004;
const FOCUS_REPORTING_MODE: u16 = 1004;
const CURSOR_VISIBLE_MODE: u16 = 25;

/// Tunable detection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizerPolicy {
    /// Treat bracketed-paste disable, focus-reporting disable and
    /// cursor-visibility enable as a full-screen program returning control.
    pub detect_control_return: bool,
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self {
            detect_control_return: true,
        }
    }
}

/// Result of sanitizing one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedChunk {
    /// Text to hand to the renderer.
    pub text: String,
    /// The caller should resend the terminal geometry shortly.
    pub requires_recovery: bool,
}

/// A complete `ESC [ ? Pm h|l` sequence within the scanned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PrivateMode {
    start: usize,
    end: usize,
    params: Vec<u16>,
    set: bool,
}

/// Per-stream sanitizer state. Dropping it and starting a fresh one is
/// always safe.
#[derive(Debug, Clone, Default)]
pub struct StreamSanitizer {
    policy: SanitizerPolicy,
    tail: String,
    held: String,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SanitizerPolicy) -> Self {
        Self {
            policy,
            tail: String::new(),
            held: String::new(),
        }
    }

    pub fn policy(&self) -> SanitizerPolicy {
        self.policy
    }

    /// Raw text kept from previous chunks.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Unfinished sequence prefix not yet forwarded.
    pub fn held(&self) -> &str {
        &self.held
    }

    /// Forgets the carried tail and drops any held prefix.
    pub fn reset(&mut self) {
        self.tail.clear();
        self.held.clear();
    }

    /// Sanitizes one chunk of shell output.
    pub fn process(&mut self, chunk: &str) -> SanitizedChunk {
        let mut input = std::mem::take(&mut self.held);
        input.push_str(chunk);

        let boundary = self.tail.len();
        let mut scan = std::mem::take(&mut self.tail);
        scan.push_str(&input);

        let mut strip = Vec::new();
        let mut last_trigger = None;
        let mut last_autowrap = None;

        for seq in scan_private_modes(scan.as_bytes()) {
            if seq.end <= boundary {
                continue;
            }

            if seq.params.contains(&COLUMN_MODE) && seq.start >= boundary {
                strip.push((seq.start - boundary, seq.end - boundary));
            }

            if self.triggers_recovery(&seq) {
                last_trigger = Some(seq.start);
            }
            if seq.set && seq.params.contains(&AUTOWRAP_MODE) {
                last_autowrap = Some(seq.start);
            }
        }

        // Already repaired when auto-wrap comes back on after the last hit.
        let requires_recovery = match (last_trigger, last_autowrap) {
            (Some(trigger), Some(autowrap)) => autowrap < trigger,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let forwarded = unfinished_prefix(&input).unwrap_or(input.len());
        let mut text = remove_ranges(&input[..forwarded], merge_ranges(strip));
        if requires_recovery {
            tracing::debug!("Terminal state reset detected, forcing auto-wrap");
            text.push_str(FORCE_AUTOWRAP);
        }

        self.held = input[forwarded..].to_string();
        self.tail = tail_of(&scan[..scan.len() - self.held.len()]);

        SanitizedChunk {
            text,
            requires_recovery,
        }
    }

    fn triggers_recovery(&self, seq: &PrivateMode) -> bool {
        seq.params.iter().any(|&mode| {
            if seq.set {
                self.policy.detect_control_return && mode == CURSOR_VISIBLE_MODE
            } else {
                ALT_SCREEN_MODES.contains(&mode)
                    || mode == AUTOWRAP_MODE
                    || (self.policy.detect_control_return
                        && (mode == BRACKETED_PASTE_MODE || mode == FOCUS_REPORTING_MODE))
            }
        })
    }
}

/// Finds every complete DEC private-mode set/reset sequence in `buf`.
fn scan_private_modes(buf: &[u8]) -> Vec<PrivateMode> {
    let mut found = Vec::new();
    let mut i = 0;

    while i + 2 < buf.len() {
        if buf[i] != ESC || buf[i + 1] != b'[' || buf[i + 2] != b'?' {
            i += 1;
            continue;
        }

        let start = i;
        let mut j = i + 3;
        while j < buf.len() && (buf[j].is_ascii_digit() || buf[j] == b';') {
            j += 1;
        }

        match buf.get(j) {
            Some(&final_byte @ (b'h' | b'l')) => {
                found.push(PrivateMode {
                    start,
                    end: j + 1,
                    params: parse_params(&buf[start + 3..j]),
                    set: final_byte == b'h',
                });
                i = j + 1;
            }
            // Incomplete or a different sequence; resume after the introducer.
            _ => i = start + 1,
        }
    }

    found
}

/// Start of an unfinished `ESC [ ? Pm` prefix ending `text`, if it fits in
/// [`TAIL_LIMIT`] bytes.
fn unfinished_prefix(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let window = bytes.len().saturating_sub(TAIL_LIMIT);
    let start = window + bytes[window..].iter().rposition(|&b| b == ESC)?;

    let unfinished = match &bytes[start + 1..] {
        [] | [b'['] => true,
        [b'[', b'?', params @ ..] => params.iter().all(|&b| b.is_ascii_digit() || b == b';'),
        _ => false,
    };
    unfinished.then_some(start)
}

fn parse_params(raw: &[u8]) -> Vec<u16> {
    raw.split(|&b| b == b';')
        .filter_map(|p| std::str::from_utf8(p).ok()?.parse().ok())
        .collect()
}

/// Sorts and coalesces overlapping or touching byte ranges.
fn merge_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());

    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    merged
}

/// Copies `text` without the given sorted, disjoint byte ranges. Ranges
/// always sit on ASCII bytes, so every cut is a char boundary.
fn remove_ranges(text: &str, ranges: Vec<(usize, usize)>) -> String {
    if ranges.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for (start, end) in ranges {
        out.push_str(&text[pos..start]);
        pos = end;
    }
    out.push_str(&text[pos..]);
    out
}

/// The last `TAIL_LIMIT` bytes of `text`, shortened to a char boundary.
fn tail_of(text: &str) -> String {
    let mut cut = text.len().saturating_sub(TAIL_LIMIT);
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}
