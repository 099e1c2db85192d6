//! Response framing for the QEMU human monitor.

/// Prompt printed by the QEMU monitor when it is ready for the next command.
pub const MONITOR_PROMPT: &[u8] = b"(qemu) ";

/// Accumulates monitor output until a response is complete.
///
/// A response is complete once the accumulated bytes end with
/// [`MONITOR_PROMPT`]. The prompt may arrive split across reads, so bytes are
/// fed incrementally and only the whole buffer is tested.
#[derive(Debug, Default)]
pub struct PromptFramer {
    buffer: Vec<u8>,
}

impl PromptFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the monitor.
    ///
    /// Returns the framed response (prompt stripped) once the buffer ends with
    /// the prompt, and resets for the next exchange.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        if !self.buffer.ends_with(MONITOR_PROMPT) {
            return None;
        }
        let mut response = std::mem::take(&mut self.buffer);
        let len = strip_prompt(&response).len();
        response.truncate(len);
        Some(response)
    }

    /// Bytes received so far for the current exchange.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Remove every trailing prompt from `raw`.
///
/// Several prompts can arrive back to back (for example the greeting banner
/// followed by an echoed empty line); none of them may leak into a response.
pub fn strip_prompt(raw: &[u8]) -> &[u8] {
    let mut end = raw;
    while let Some(stripped) = end.strip_suffix(MONITOR_PROMPT) {
        end = stripped;
    }
    end
}
