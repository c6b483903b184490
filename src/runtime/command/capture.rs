// SPDX-License-Identifier: MIT

//! Bounded, UTF-8 aware capture of a child's output stream

/// Keeps the most recent `limit` bytes of a stream as text.
///
/// Chunks may split multi-byte characters; the incomplete tail is carried
/// over to the next push.
#[derive(Debug)]
pub(crate) struct CaptureBuffer {
    text: String,
    pending: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            pending: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        self.enforce_limit();
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.text
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.text.push_str(&rest);
            self.pending.clear();
            self.enforce_limit();
        }
        self.text
    }

    fn enforce_limit(&mut self) {
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }
}
