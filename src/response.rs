//! Reassembly of control-channel notifications into JSON responses.
//!
//! The headset answers `s`, `v6` and friends with a JSON object split across
//! several 20-byte notifications.  Byte 0 of each notification is the number
//! of content bytes that follow; everything after that is stale padding left
//! over from earlier messages and must not be read.
//!
//! ```text
//! [15]{"ap":"headset"  ← 15 content bytes, 4 bytes padding
//! [ 4],"sp             ← 4 content bytes, 15 bytes padding
//! ```

use std::collections::VecDeque;

use serde_json::Value;

use crate::error::{MuseError, Result};
use crate::types::ControlResponse;

/// Fragments one response may span before it is abandoned.
pub const MAX_RESPONSE_FRAGMENTS: usize = 8;

/// Take the declared content of one control notification, dropping padding.
///
/// Returns an empty string for empty or zero-length fragments.
pub fn fragment_content(bytes: &[u8]) -> String {
    let Some(&len) = bytes.first() else {
        return String::new();
    };
    let end = (1 + len as usize).min(bytes.len());
    String::from_utf8_lossy(&bytes[1..end]).into_owned()
}

/// Incrementally assembles control fragments into complete JSON objects.
///
/// One assembler belongs to one link.  Text before the first `{` is dropped so
/// residue from an interrupted response cannot corrupt the next one.  Braces
/// inside JSON strings do not count towards nesting, and a `{` after a closing
/// brace in the same fragment starts the next response.
///
/// ```
/// # use muse_s_link::response::ResponseAssembler;
/// let mut asm = ResponseAssembler::new();
/// assert!(asm.push(b"\x0a{\"fw\":\"1.2").unwrap().is_none());
/// let resp = asm.push(b"\x05.13\"}").unwrap().unwrap();
/// assert_eq!(resp.fields["fw"], "1.2.13");
/// ```
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buffer: String,
    /// Brace nesting depth.  Becomes 1 on `{`, returns to 0 on the matching `}`.
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Fragments contributing to the object currently open.
    fragments: usize,
    /// Results completed by the last fragment and not yet handed out.
    ready: VecDeque<Result<ControlResponse>>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no partial or completed response is buffered.
    pub fn is_empty(&self) -> bool {
        self.depth == 0 && self.buffer.is_empty() && self.ready.is_empty()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.fragments = 0;
    }

    /// Feed one raw 20-byte control notification.
    ///
    /// Returns the first response this fragment completes.  When one fragment
    /// closes more than one object the rest are available from
    /// [`ResponseAssembler::take_ready`].  On error the partial buffer is
    /// discarded.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<ControlResponse>> {
        self.scan(&fragment_content(fragment));
        self.take_ready().transpose()
    }

    /// Next further result completed by the last fragment.
    pub fn take_ready(&mut self) -> Option<Result<ControlResponse>> {
        self.ready.pop_front()
    }

    fn scan(&mut self, content: &str) {
        let mut counted = false;
        for ch in content.chars() {
            if self.depth == 0 && ch != '{' {
                // stray text between objects
                continue;
            }
            if !counted {
                self.fragments += 1;
                counted = true;
                if self.fragments > MAX_RESPONSE_FRAGMENTS {
                    let fragments = self.fragments;
                    self.reset();
                    self.ready.push_back(Err(MuseError::ResponseTooLarge { fragments }));
                    return;
                }
            }
            self.buffer.push(ch);
            if self.in_string {
                match ch {
                    _ if self.escaped => self.escaped = false,
                    '\\' => self.escaped = true,
                    '"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let raw = std::mem::take(&mut self.buffer);
                        self.reset();
                        counted = false;
                        self.ready.push_back(parse_object(raw));
                    }
                }
                _ => {}
            }
        }
    }
}

fn parse_object(raw: String) -> Result<ControlResponse> {
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(fields)) => Ok(ControlResponse { raw, fields }),
        Ok(_) => Err(MuseError::InvalidResponse(raw)),
        Err(e) => Err(MuseError::InvalidResponse(format!("{e} | raw: {raw}"))),
    }
}
