//! Byte-to-line accumulation for sockets and core pipes.

/// Accumulates raw bytes from a file descriptor and emits complete
/// `\n`-terminated lines.  `\r` bytes are dropped on input, so DOS line
/// endings look like plain `\n` to everything downstream.  Trailing bytes
/// without a newline are held until more data arrives; they are discarded
/// when the buffer is dropped at EOF.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    /// Lines keep their trailing `\n`.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' {
                continue;
            }
            self.partial.push(b);
            if b == b'\n' {
                lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                self.partial.clear();
            }
        }
        lines
    }

    /// Bytes of an incomplete line currently held.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
