/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of rexec-gate
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Recovers logical input lines from a raw terminal byte stream: strips ANSI
//! CSI sequences, applies backspace/DEL in place, and flushes a line on
//! `\n`, `\r`, or when the bound is exceeded. Never interprets shell syntax.

const ESC: u8 = 0x1b;
const CSI_FINAL_RANGE: std::ops::RangeInclusive<u8> = 0x40..=0x7e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    SawEsc,
    InCsi,
}

pub struct CommandExtractor {
    buffer: Vec<u8>,
    bound: usize,
    state: ScanState,
}

/// Outcome of feeding a chunk of bytes to the extractor: zero or more
/// completed lines, in the order they were recovered.
pub struct ExtractedLine {
    pub text: String,
    pub truncated: bool,
}

impl CommandExtractor {
    pub fn new(bound: usize) -> Self {
        CommandExtractor {
            buffer: Vec::new(),
            bound,
            state: ScanState::Normal,
        }
    }

    /// Feed raw bytes, returning every line completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ExtractedLine> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match self.state {
                ScanState::Normal => match byte {
                    ESC => self.state = ScanState::SawEsc,
                    b'\n' | b'\r' => {
                        if let Some(line) = self.flush(false) {
                            lines.push(line);
                        }
                    }
                    0x08 | 0x7f => {
                        self.buffer.pop();
                    }
                    _ => {
                        self.buffer.push(byte);
                        if self.buffer.len() >= self.bound {
                            if let Some(line) = self.flush(true) {
                                lines.push(line);
                            }
                        }
                    }
                },
                ScanState::SawEsc => {
                    self.state = if byte == b'[' {
                        ScanState::InCsi
                    } else {
                        ScanState::Normal
                    };
                }
                ScanState::InCsi => {
                    if CSI_FINAL_RANGE.contains(&byte) {
                        self.state = ScanState::Normal;
                    }
                }
            }
        }
        lines
    }

    /// Emit any residue buffered at stream close.
    pub fn finish(&mut self) -> Option<ExtractedLine> {
        self.flush(false)
    }

    fn flush(&mut self, truncated: bool) -> Option<ExtractedLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(ExtractedLine { text, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: Vec<ExtractedLine>) -> Vec<String> {
        lines.into_iter().map(|l| l.text).collect()
    }

    #[test]
    fn plain_line_on_newline() {
        let mut extractor = CommandExtractor::new(2000);
        let lines = extractor.feed(b"whoami\n");
        assert_eq!(texts(lines), vec!["whoami"]);
    }

    #[test]
    fn cr_also_flushes() {
        let mut extractor = CommandExtractor::new(2000);
        let lines = extractor.feed(b"ls -la\r");
        assert_eq!(texts(lines), vec!["ls -la"]);
    }

    #[test]
    fn strips_csi_sequences() {
        let mut extractor = CommandExtractor::new(2000);
        // cursor-left (ESC [ D) injected between keystrokes by a raw-mode echo
        let lines = extractor.feed(b"ec\x1b[Dho\n");
        assert_eq!(texts(lines), vec!["echo"]);
    }

    #[test]
    fn lone_esc_is_discarded() {
        let mut extractor = CommandExtractor::new(2000);
        let lines = extractor.feed(b"a\x1bb\n");
        assert_eq!(texts(lines), vec!["ab"]);
    }

    #[test]
    fn backspace_removes_preceding_byte() {
        let mut extractor = CommandExtractor::new(2000);
        let lines = extractor.feed(b"lsz\x08\n");
        assert_eq!(texts(lines), vec!["ls"]);
    }

    #[test]
    fn overflow_emits_truncated_and_continues() {
        let mut extractor = CommandExtractor::new(4);
        let lines = extractor.feed(b"abcdefgh\n");
        assert_eq!(texts(lines), vec!["abcd", "efgh"]);
    }

    #[test]
    fn residue_on_close() {
        let mut extractor = CommandExtractor::new(2000);
        extractor.feed(b"no-newline");
        let residue = extractor.finish().unwrap();
        assert_eq!(residue.text, "no-newline");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut extractor = CommandExtractor::new(2000);
        let lines = extractor.feed(&[0xff, 0xfe, b'\n']);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains('\u{fffd}'));
    }

    #[test]
    fn idempotent_replay_produces_same_lines() {
        let input: &[u8] = b"echo hi\nls -la\r\x1b[31mred\x1b[0m\n";
        let mut a = CommandExtractor::new(2000);
        let mut b = CommandExtractor::new(2000);
        assert_eq!(texts(a.feed(input)), texts(b.feed(input)));
    }
}
