//! Wire message framing.
//!
//! Every message starts with an 8-byte header: a 32-bit little-endian word count of the body,
//! a type byte, a flags byte, and 16 bits of type-specific extra. The body is `words * 8`
//! bytes of typed fields. Bodies up to 4 KiB live in an inline buffer; larger bodies move to a
//! heap allocation, and the heap pointer being set is what marks the heap buffer as active.

use crate::server::error::Error;

/// The size of the message header, always 8 bytes.
pub const HEADER_LEN: usize = 8;

/// The size in bytes of a single word in the message body.
pub const WORD_SIZE: usize = 8;

/// Length of the inline message body buffer. Bodies exceeding this use a heap allocation.
pub const BUF_LEN: usize = 4096;

/// Maximum accepted body size in bytes. Anything larger is a protocol error; a word count in
/// the gigaword range can never be valid.
pub const MAX_BODY_LEN: usize = 1 << 20;

/// A framed wire message being encoded or decoded.
pub struct Message {
    /// Code identifying the message type.
    mtype: u8,
    /// Type-specific flags.
    flags: u8,
    /// Extra space for type-specific data.
    extra: u16,
    /// Number of 64-bit words in the body.
    words: u32,

    /// Pre-allocated body buffer, enough for most cases.
    body1: Box<[u8; BUF_LEN]>,
    /// Dynamically allocated buffer for bodies exceeding `body1`.
    body2: Option<Vec<u8>>,
    /// Read or write position within the active body buffer.
    offset: usize,
    /// Body length in bytes while decoding.
    end: usize,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Self {
            mtype: 0,
            flags: 0,
            extra: 0,
            words: 0,
            body1: Box::new([0; BUF_LEN]),
            body2: None,
            offset: 0,
            end: 0,
        }
    }

    /// Discard the heap buffer, if any, and reset all offsets so the object can be re-used.
    pub fn reset(&mut self) {
        self.mtype = 0;
        self.flags = 0;
        self.extra = 0;
        self.words = 0;
        self.body2 = None;
        self.offset = 0;
        self.end = 0;
    }

    pub fn mtype(&self) -> u8 {
        self.mtype
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn words(&self) -> u32 {
        self.words
    }

    /// The number of unread body bytes while decoding. Zero after the last field of a
    /// well-formed message has been read.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.offset)
    }

    fn active(&self) -> &[u8] {
        match &self.body2 {
            Some(buf) => buf,
            None => &self.body1[..],
        }
    }

    fn active_mut(&mut self) -> &mut [u8] {
        match &mut self.body2 {
            Some(buf) => buf,
            None => &mut self.body1[..],
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Receive path.

    /// Parse and validate a received message header.
    pub fn header_recv(&mut self, buf: &[u8; HEADER_LEN]) -> Result<(), Error> {
        let words = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if words == 0 {
            return Err(Error::Protocol("empty message body".into()));
        }
        let len = words as usize * WORD_SIZE;
        if len > MAX_BODY_LEN {
            return Err(Error::Protocol("message body too large".into()));
        }
        self.words = words;
        self.mtype = buf[4];
        self.flags = buf[5];
        self.extra = u16::from_le_bytes([buf[6], buf[7]]);
        self.offset = 0;
        self.end = len;
        Ok(())
    }

    /// Return the buffer to be filled with the message body, sized `words * 8`.
    ///
    /// The heap buffer is allocated here when the body exceeds the inline buffer.
    pub fn body_recv_start(&mut self) -> &mut [u8] {
        let len = self.end;
        if len > BUF_LEN {
            self.body2 = Some(vec![0; len]);
        }
        &mut self.active_mut()[..len]
    }

    fn advance(&mut self, n: usize) -> Result<usize, Error> {
        let at = self.offset;
        if at + n > self.end {
            return Err(Error::Eom);
        }
        self.offset += n;
        Ok(at)
    }

    fn align(&mut self, n: usize) {
        let rem = self.offset % n;
        if rem != 0 {
            self.offset += n - rem;
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        let at = self.advance(1)?;
        Ok(self.active()[at])
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        self.align(4);
        let at = self.advance(4)?;
        let buf = &self.active()[at..at + 4];
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        self.align(8);
        let at = self.advance(8)?;
        let mut raw = [0; 8];
        raw.copy_from_slice(&self.active()[at..at + 8]);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_i64(&mut self) -> Result<i64, Error> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a NUL-terminated text field, consuming through the padding to the next word
    /// boundary.
    pub fn get_text(&mut self) -> Result<String, Error> {
        if self.offset >= self.end {
            return Err(Error::Eom);
        }
        let body = self.active();
        let nul = body[self.offset..self.end]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Parse("no string found".into()))?;
        let raw = body[self.offset..self.offset + nul].to_vec();
        self.offset += nul + 1;
        self.align(WORD_SIZE);
        if self.offset > self.end {
            return Err(Error::Eom);
        }
        String::from_utf8(raw).map_err(|_| Error::Parse("string is not valid utf-8".into()))
    }

    /// Read a list of texts terminated by an extra NUL byte.
    pub fn get_text_list(&mut self) -> Result<Vec<String>, Error> {
        let mut list = Vec::new();
        loop {
            if self.offset >= self.end {
                return Err(Error::Parse("text list not terminated".into()));
            }
            if self.active()[self.offset] == 0 {
                self.offset += 1;
                self.align(WORD_SIZE);
                return Ok(list);
            }
            list.push(self.get_text()?);
        }
    }

    /// Read a length-prefixed blob field, padded to the next word boundary.
    pub fn get_blob(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.get_u64()? as usize;
        let at = self.advance(len)?;
        let raw = self.active()[at..at + len].to_vec();
        self.align(WORD_SIZE);
        if self.offset > self.end {
            return Err(Error::Eom);
        }
        Ok(raw)
    }

    //////////////////////////////////////////////////////////////////////////////////////////
    // Send path.

    /// Set the header of an outgoing message. The word count is computed at flush time.
    pub fn header_put(&mut self, mtype: u8, flags: u8) {
        self.mtype = mtype;
        self.flags = flags;
    }

    /// Ensure capacity for `n` more bytes, switching over to the heap buffer as needed.
    fn reserve(&mut self, n: usize) -> Result<(), Error> {
        let needed = self.offset + n;
        if needed > MAX_BODY_LEN {
            return Err(Error::Protocol("message body too large".into()));
        }
        match &mut self.body2 {
            Some(buf) => {
                if needed > buf.len() {
                    buf.resize(needed.next_power_of_two(), 0);
                }
            }
            None => {
                if needed > BUF_LEN {
                    let mut buf = vec![0; needed.next_power_of_two()];
                    buf[..self.offset].copy_from_slice(&self.body1[..self.offset]);
                    self.body2 = Some(buf);
                }
            }
        }
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.reserve(bytes.len())?;
        let at = self.offset;
        self.active_mut()[at..at + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
        Ok(())
    }

    fn pad_to(&mut self, n: usize) -> Result<(), Error> {
        let rem = self.offset % n;
        if rem != 0 {
            let pad = n - rem;
            self.reserve(pad)?;
            let at = self.offset;
            for b in &mut self.active_mut()[at..at + pad] {
                *b = 0;
            }
            self.offset += pad;
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_bytes(&[value])
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.pad_to(4)?;
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), Error> {
        self.pad_to(8)?;
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<(), Error> {
        self.put_u64(value as u64)
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), Error> {
        self.put_u64(value.to_bits())
    }

    /// Write a NUL-terminated text field, padded forward to the next word boundary.
    pub fn put_text(&mut self, text: &str) -> Result<(), Error> {
        self.put_bytes(text.as_bytes())?;
        self.put_u8(0)?;
        self.pad_to(WORD_SIZE)
    }

    /// Write a list of texts terminated by an extra NUL byte, padded.
    pub fn put_text_list(&mut self, list: &[String]) -> Result<(), Error> {
        for text in list {
            self.put_bytes(text.as_bytes())?;
            self.put_u8(0)?;
        }
        self.put_u8(0)?;
        self.pad_to(WORD_SIZE)
    }

    /// Write a length-prefixed blob field, padded to the next word boundary.
    pub fn put_blob(&mut self, blob: &[u8]) -> Result<(), Error> {
        self.put_u64(blob.len() as u64)?;
        self.put_bytes(blob)?;
        self.pad_to(WORD_SIZE)
    }

    /// Pad the write cursor forward to the next word boundary with zero bytes.
    pub fn pad_word(&mut self) -> Result<(), Error> {
        self.pad_to(WORD_SIZE)
    }

    /// Advance the read cursor to the next word boundary.
    pub fn align_word(&mut self) {
        self.align(WORD_SIZE);
    }

    /// Finish encoding: pad the body to a word boundary, fix up the word count, and return
    /// the wire header. The body is available through [`Message::body`].
    pub fn send_start(&mut self) -> Result<[u8; HEADER_LEN], Error> {
        self.pad_to(WORD_SIZE)?;
        self.words = (self.offset / WORD_SIZE) as u32;
        self.end = self.offset;

        let mut header = [0; HEADER_LEN];
        header[..4].copy_from_slice(&self.words.to_le_bytes());
        header[4] = self.mtype;
        header[5] = self.flags;
        header[6..8].copy_from_slice(&self.extra.to_le_bytes());
        Ok(header)
    }

    /// The encoded body, valid after [`Message::send_start`].
    pub fn body(&self) -> &[u8] {
        &self.active()[..self.end]
    }

    /// Rewind the cursor to the start of the body for decoding, keeping the body contents.
    ///
    /// Used by tests to feed an encoded message back through the receive path.
    pub fn rewind(&mut self) {
        self.end = self.words as usize * WORD_SIZE;
        self.offset = 0;
    }
}
