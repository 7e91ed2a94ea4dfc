/// Accumulates raw response bytes and yields complete newline-terminated
/// lines, so SSE parsing never sees a line split across two network chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Next complete line, without its trailing newline. `None` until the
    /// buffered tail gains a newline.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.find('\n')?;
        let rest = self.buffer.split_off(newline + 1);
        let mut line = std::mem::replace(&mut self.buffer, rest);
        line.truncate(newline);
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }
}

/// SSE payload of a line, if it is a data line. Only `data: ` lines carry
/// content; comments, `event:` fields, and blank separators are ignored.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}

/// The OpenAI end-of-stream sentinel.
pub const DONE_SENTINEL: &str = "[DONE]";
