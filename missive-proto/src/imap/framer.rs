/*
 * The inbound byte pipeline of one IMAP connection.
 *
 * Raw socket bytes optionally pass a raw-DEFLATE inflater (COMPRESS), then
 * a cleartext buffer that is cut into whole wire commands: CRLF-terminated
 * lines with `{N}`/`{N+}` literals captured verbatim, CRLF processing
 * suspended for exactly N bytes. A buffer boundary in the middle of a CRLF
 * or a literal never splits a frame.
 *
 * Engaging compression is a state transition of this framer, not a
 * pointer swap: cleartext bytes already buffered at swap time stay in
 * front of the newly inflated ones, and a framer in the Closing state
 * refuses the swap with a typed error.
 */

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use thiserror::Error;

/// Ceiling for announced literals; a client announcing more is dropped.
const MAX_LITERAL: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("line exceeds the maximum allowed length")]
    LineTooLong,
    #[error("announced literal is too large")]
    LiteralTooLarge,
    #[error("session is closing")]
    Closing,
    #[error("corrupt deflate stream")]
    Inflate,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// One complete wire command: line(s) and inlined literal bytes.
    Command(Vec<u8>),
    /// A synchronizing literal was announced; the session must transmit
    /// its continuation ACK, then call [`ImapFramer::acked`].
    AckRequired { size: u64 },
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Line,
    AwaitAck { size: usize },
    Literal { remaining: usize },
    Closing,
}

pub struct ImapFramer {
    clear: Vec<u8>,
    cmd: Vec<u8>,
    mode: Mode,
    inflate: Option<Decompress>,
    max_line: usize,
}

impl ImapFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            clear: Vec::new(),
            cmd: Vec::new(),
            mode: Mode::Line,
            inflate: None,
            max_line,
        }
    }

    /// Feed raw socket bytes, inflating when compression is engaged.
    pub fn push_raw(&mut self, mut input: &[u8]) -> Result<(), FramerError> {
        match &mut self.inflate {
            None => self.clear.extend_from_slice(input),
            Some(z) => {
                while !input.is_empty() {
                    let mut out: Vec<u8> = Vec::with_capacity(16 * 1024);
                    let consumed_before = z.total_in();
                    let status = z
                        .decompress_vec(input, &mut out, FlushDecompress::None)
                        .or(Err(FramerError::Inflate))?;
                    let consumed = (z.total_in() - consumed_before) as usize;
                    input = &input[consumed..];
                    self.clear.extend_from_slice(&out);
                    if matches!(status, Status::StreamEnd) {
                        break;
                    }
                    if consumed == 0 && out.is_empty() {
                        // inflater wants more input
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Pull the next frame out of the buffered cleartext, if complete.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramerError> {
        loop {
            match self.mode {
                Mode::Closing => return Ok(None),
                Mode::AwaitAck { .. } => return Ok(None),
                Mode::Literal { remaining } => {
                    if self.clear.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.clear.len());
                    self.cmd.extend_from_slice(&self.clear[..take]);
                    self.clear.drain(..take);
                    if take == remaining {
                        self.mode = Mode::Line;
                    } else {
                        self.mode = Mode::Literal {
                            remaining: remaining - take,
                        };
                        return Ok(None);
                    }
                }
                Mode::Line => {
                    let eol = match find_crlf(&self.clear) {
                        Some(pos) => pos,
                        None => {
                            if self.clear.len() > self.max_line {
                                return Err(FramerError::LineTooLong);
                            }
                            return Ok(None);
                        }
                    };
                    if eol + 2 > self.max_line {
                        return Err(FramerError::LineTooLong);
                    }
                    let line: Vec<u8> = self.clear.drain(..eol + 2).collect();
                    self.cmd.extend_from_slice(&line);
                    match literal_announcement(&line) {
                        Some((size, _)) if size > MAX_LITERAL => {
                            return Err(FramerError::LiteralTooLarge)
                        }
                        Some((size, true)) => {
                            // non-synchronizing: bytes follow immediately
                            self.mode = Mode::Literal {
                                remaining: size as usize,
                            };
                        }
                        Some((size, false)) => {
                            self.mode = Mode::AwaitAck {
                                size: size as usize,
                            };
                            return Ok(Some(Frame::AckRequired { size }));
                        }
                        None => {
                            return Ok(Some(Frame::Command(std::mem::take(&mut self.cmd))));
                        }
                    }
                }
            }
        }
    }

    /// The continuation ACK for a synchronizing literal went out; start
    /// capturing the announced bytes.
    pub fn acked(&mut self) {
        if let Mode::AwaitAck { size } = self.mode {
            self.mode = Mode::Literal { remaining: size };
        }
    }

    /// Engage inbound decompression. Cleartext already buffered stays
    /// ahead of the inflated stream. Refused while closing.
    pub fn enable_inflate(&mut self) -> Result<(), FramerError> {
        if matches!(self.mode, Mode::Closing) {
            return Err(FramerError::Closing);
        }
        self.inflate = Some(Decompress::new(false));
        Ok(())
    }

    pub fn inflate_active(&self) -> bool {
        self.inflate.is_some()
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Enter the terminal sub-state: no more frames, no more pipeline
    /// reconfiguration.
    pub fn set_closing(&mut self) {
        self.mode = Mode::Closing;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Trailing `{N}` / `{N+}` on a line, if any.
fn literal_announcement(line: &[u8]) -> Option<(u64, bool)> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let inner = &line[open + 1..];
    let (digits, plus) = match inner.strip_suffix(b"+") {
        Some(digits) => (digits, true),
        None => (inner, false),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let size = std::str::from_utf8(digits).ok()?.parse::<u64>().ok()?;
    Some((size, plus))
}

/// The outbound counterpart: pass-through until DEFLATE is engaged, then
/// raw deflate with a sync flush per write so the peer can always make
/// progress.
#[derive(Default)]
pub struct OutboundPipe {
    deflate: Option<Compress>,
}

impl OutboundPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_deflate(&mut self) {
        self.deflate = Some(Compress::new(Compression::default(), false));
    }

    pub fn deflate_active(&self) -> bool {
        self.deflate.is_some()
    }

    pub fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, FramerError> {
        let z = match &mut self.deflate {
            None => return Ok(input.to_vec()),
            Some(z) => z,
        };
        let mut out: Vec<u8> = Vec::with_capacity(input.len() + 64);
        let mut remaining = input;
        loop {
            let consumed_before = z.total_in();
            let mut chunk: Vec<u8> = Vec::with_capacity(remaining.len() + 64);
            z.compress_vec(remaining, &mut chunk, FlushCompress::Sync)
                .or(Err(FramerError::Inflate))?;
            let consumed = (z.total_in() - consumed_before) as usize;
            out.extend_from_slice(&chunk);
            remaining = &remaining[consumed..];
            if remaining.is_empty() && !out.is_empty() {
                return Ok(out);
            }
            if consumed == 0 && chunk.is_empty() {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(framer: &mut ImapFramer) -> Vec<Frame> {
        let mut out = vec![];
        while let Some(frame) = framer.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn crlf_split_across_pushes_does_not_split_a_frame() {
        let mut framer = ImapFramer::new(1024);
        framer.push_raw(b"a1 NOOP\r").unwrap();
        assert_eq!(frames(&mut framer), vec![]);
        framer.push_raw(b"\na2 CAPA").unwrap();
        assert_eq!(
            frames(&mut framer),
            vec![Frame::Command(b"a1 NOOP\r\n".to_vec())]
        );
        framer.push_raw(b"BILITY\r\n").unwrap();
        assert_eq!(
            frames(&mut framer),
            vec![Frame::Command(b"a2 CAPABILITY\r\n".to_vec())]
        );
    }

    #[test]
    fn synchronizing_literal_waits_for_the_ack() {
        let mut framer = ImapFramer::new(1024);
        framer.push_raw(b"a1 LOGIN {5}\r\nalice pw\r\n").unwrap();
        assert_eq!(
            framer.next_frame().unwrap(),
            Some(Frame::AckRequired { size: 5 })
        );
        // nothing is delivered before the ACK is sent
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.acked();
        assert_eq!(
            framer.next_frame().unwrap(),
            Some(Frame::Command(b"a1 LOGIN {5}\r\nalice pw\r\n".to_vec()))
        );
    }

    #[test]
    fn non_synchronizing_literal_flows_through() {
        let mut framer = ImapFramer::new(1024);
        framer.push_raw(b"a1 LOGIN {5+}\r\nali").unwrap();
        assert_eq!(frames(&mut framer), vec![]);
        framer.push_raw(b"ce secret\r\n").unwrap();
        assert_eq!(
            frames(&mut framer),
            vec![Frame::Command(b"a1 LOGIN {5+}\r\nalice secret\r\n".to_vec())]
        );
    }

    #[test]
    fn literal_bytes_are_captured_verbatim() {
        let mut framer = ImapFramer::new(1024);
        // the literal contains CRLF and a fake literal announcement
        framer
            .push_raw(b"a1 APPEND INBOX {14+}\r\nX\r\nY{3}\r\nZ\r\n00\r\n")
            .unwrap();
        assert_eq!(
            frames(&mut framer),
            vec![Frame::Command(
                b"a1 APPEND INBOX {14+}\r\nX\r\nY{3}\r\nZ\r\n00\r\n".to_vec()
            )]
        );
    }

    #[test]
    fn overlong_line_is_fatal() {
        let mut framer = ImapFramer::new(16);
        framer.push_raw(b"a1 LIST \"\" aaaaaaaaaaaaaaaaaaaa\r\n").unwrap();
        assert_eq!(framer.next_frame(), Err(FramerError::LineTooLong));
    }

    #[test]
    fn deflate_swap_preserves_buffered_cleartext() {
        let mut framer = ImapFramer::new(1024);
        // a pipelined command sits in the buffer when compression starts
        framer.push_raw(b"a1 NOOP\r\na2 CAPA").unwrap();
        framer.enable_inflate().unwrap();

        let mut pipe = OutboundPipe::new();
        pipe.enable_deflate();
        let compressed = pipe.process(b"BILITY\r\na3 NOOP\r\n").unwrap();
        framer.push_raw(&compressed).unwrap();

        assert_eq!(frames(&mut framer), vec![
            Frame::Command(b"a1 NOOP\r\n".to_vec()),
            Frame::Command(b"a2 CAPABILITY\r\n".to_vec()),
            Frame::Command(b"a3 NOOP\r\n".to_vec()),
        ]);
    }

    #[test]
    fn deflate_roundtrip_across_many_writes() {
        let mut pipe = OutboundPipe::new();
        pipe.enable_deflate();
        let mut framer = ImapFramer::new(1024);
        framer.enable_inflate().unwrap();

        for i in 0..50 {
            let line = format!("t{} NOOP\r\n", i);
            let compressed = pipe.process(line.as_bytes()).unwrap();
            framer.push_raw(&compressed).unwrap();
        }
        let got = frames(&mut framer);
        assert_eq!(got.len(), 50);
        assert_eq!(got[49], Frame::Command(b"t49 NOOP\r\n".to_vec()));
    }

    #[test]
    fn closing_framer_refuses_compression() {
        let mut framer = ImapFramer::new(1024);
        framer.set_closing();
        assert_eq!(framer.enable_inflate(), Err(FramerError::Closing));
        assert!(!framer.inflate_active());
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn oversized_literal_announcement_is_rejected() {
        let mut framer = ImapFramer::new(1024);
        framer.push_raw(b"a1 APPEND INBOX {999999999999}\r\n").unwrap();
        assert_eq!(framer.next_frame(), Err(FramerError::LiteralTooLarge));
    }
}
