//! Line framer
//!
//! Reassembles arbitrary read chunks into complete newline-terminated lines.

/// Longest partial line kept between chunks before it is discarded as noise
pub const MAX_PARTIAL_LINE: usize = 4096;

/// Splits incoming text on `\n`, keeping the trailing fragment for the next chunk
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: String,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes, without terminators.
    /// Empty lines are dropped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.partial.len() > MAX_PARTIAL_LINE {
            tracing::warn!(
                "Discarding {} bytes of unterminated input",
                self.partial.len()
            );
            self.partial.clear();
        }

        lines
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> &str {
        &self.partial
    }

    /// Drop any partial line (on reconnect)
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push("<Idle|MPos:0.000,").is_empty());
        assert_eq!(framer.pending(), "<Idle|MPos:0.000,");
        let lines = framer.push("0.000,0.000>\r\nok\nerr");
        assert_eq!(lines, vec!["<Idle|MPos:0.000,0.000,0.000>", "ok"]);
        assert_eq!(framer.pending(), "err");
        assert_eq!(framer.push("or:9\n"), vec!["error:9"]);
    }

    #[test]
    fn test_blank_lines_dropped() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push("\n\r\nok\n\n"), vec!["ok"]);
    }

    #[test]
    fn test_runaway_partial_discarded() {
        let mut framer = LineFramer::new();
        framer.push(&"x".repeat(MAX_PARTIAL_LINE + 1));
        assert!(framer.pending().is_empty());
        assert_eq!(framer.push("ok\n"), vec!["ok"]);
    }
}
