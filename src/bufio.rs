//! Dual-direction buffered I/O
//!
//! [`BufStream`] attaches a read buffer and a write buffer to any backend
//! implementing [`RawStream`], and implements the canonical read-by-format
//! and write-with-translation protocols shared by files, pipes, sockets and
//! shared memory:
//!
//! * `Line` reads up to but not including `\n`, returning the unterminated
//!   tail at end of stream and `None` once the stream is exhausted.
//! * `Number` skips leading whitespace and parses the longest numeric
//!   prefix, never scanning past the buffered region.
//! * `All` drains the stream to one byte string (possibly empty).
//! * `Count(n)` reads at most `n` bytes, `None` at end of stream.
//!
//! Text mode (CRLF platforms only) translates CRLF to LF as bytes are
//! buffered and expands LF to CRLF on output. A CR arriving as the last byte
//! of a refill is held back until the next byte decides whether it belongs
//! to a CRLF pair; see `translate_pending`.

use crate::buffer::Buffer;
use crate::status::{Status, StatusCode};
use memchr::memchr;

/// Whether the platform's native line separator is CRLF. Text mode is forced
/// off everywhere else.
pub const NATIVE_CRLF: bool = cfg!(windows);

/// Write buffering stops growing at this size and flushes instead.
const WRITE_BUFFER_SIZE: usize = 4096;

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// A byte-stream backend: the unbuffered edge of a file, pipe, socket or
/// memory region.
pub trait RawStream {
    /// Read into `dst`. `Ok(0)` means end of stream, not an error.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, Status>;

    /// Write from `src`, returning the number of bytes accepted.
    fn write(&mut self, src: &[u8]) -> Result<usize, Status>;

    /// Push backend-level buffers to their destination. Most backends have
    /// none.
    fn flush(&mut self) -> Result<(), Status> {
        Ok(())
    }

    /// Reposition the stream. Backends without positions report `ESPIPE`.
    fn seek(&mut self, _whence: Whence, _offset: i64) -> Result<u64, Status> {
        Err(Status::new(StatusCode::Spipe, "stream is not seekable"))
    }
}

/// Backend for buffers that alias a fixed memory region: there is nothing to
/// refill from or flush to.
#[derive(Debug, Default)]
pub(crate) struct NullStream;

impl RawStream for NullStream {
    fn read(&mut self, _dst: &mut [u8]) -> Result<usize, Status> {
        Ok(0)
    }

    fn write(&mut self, _src: &[u8]) -> Result<usize, Status> {
        Ok(0)
    }
}

/// One value produced by a read format.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOut {
    Nil,
    Str(Vec<u8>),
    Num(f64),
}

/// A read format specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFormat {
    Line,
    Number,
    All,
    Count(usize),
}

impl ReadFormat {
    /// Parse the conventional format strings `"*l"`, `"*n"`, `"*a"`.
    pub fn parse(spec: &str) -> Result<ReadFormat, Status> {
        match spec.trim_start_matches('*') {
            "l" => Ok(ReadFormat::Line),
            "n" => Ok(ReadFormat::Number),
            "a" => Ok(ReadFormat::All),
            other => Err(Status::invalid(format!("bad read format '{other}'"))),
        }
    }
}

/// Buffered reader/writer pair over one backend.
#[derive(Debug)]
pub struct BufStream<B> {
    backend: B,
    rd: Buffer,
    wr: Buffer,
    text_mode: bool,
    /// Backend reported end of stream.
    eof: bool,
    /// Bytes of the pending read region already searched for `\n`.
    scan: usize,
    /// Text mode: the pending region ends with an untranslated CR whose
    /// successor has not arrived yet.
    cr_hold: bool,
}

impl<B: RawStream> BufStream<B> {
    /// Managed buffers over `backend`. `text_mode` only takes effect on
    /// CRLF platforms.
    pub fn new(backend: B, text_mode: bool) -> BufStream<B> {
        BufStream::with_buffers(backend, text_mode, Buffer::managed(), Buffer::managed())
    }

    /// Install caller-provided buffers. Used for fixed views over foreign
    /// memory, where text mode is disallowed because translation cannot
    /// grow the buffer.
    pub fn with_buffers(backend: B, text_mode: bool, rd: Buffer, wr: Buffer) -> BufStream<B> {
        debug_assert!(!(text_mode && (rd.is_foreign() || wr.is_foreign())));
        BufStream {
            backend,
            rd,
            wr,
            text_mode,
            eof: false,
            scan: 0,
            cr_hold: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub(crate) fn rd_mut(&mut self) -> &mut Buffer {
        &mut self.rd
    }

    pub(crate) fn wr_mut(&mut self) -> &mut Buffer {
        &mut self.wr
    }

    pub(crate) fn set_eof(&mut self, eof: bool) {
        self.eof = eof;
    }

    /// End of the deliverable pending region: a held CR is buffered but not
    /// yet readable.
    fn deliverable_end(&self) -> usize {
        self.rd.limit() - usize::from(self.cr_hold)
    }

    fn deliverable(&self) -> usize {
        self.deliverable_end() - self.rd.index()
    }

    /// Translate CRLF to LF in place over `data[start..limit]`, possibly
    /// holding back a trailing CR until the next refill or end of stream.
    fn translate_pending(&mut self, start: usize) {
        let index = self.rd.index();
        let limit = self.rd.limit();
        debug_assert!(start >= index);
        let region = &mut self.rd.pending_mut()[start - index..];
        let mut out = 0;
        let mut i = 0;
        while i < region.len() {
            if region[i] == b'\r' && i + 1 < region.len() && region[i + 1] == b'\n' {
                i += 1; // drop the CR, keep the LF
                continue;
            }
            region[out] = region[i];
            out += 1;
            i += 1;
        }
        let dropped = region.len() - out;
        let ends_with_cr = out > 0 && region[out - 1] == b'\r';
        self.rd.set_limit(limit - dropped);
        self.cr_hold = ends_with_cr && !self.eof;
    }

    /// Pull bytes from the backend until the deliverable region grows or the
    /// stream ends. Returns whether it grew; `false` means nothing more will
    /// ever arrive. Loops past refills whose only effect is holding back a
    /// boundary CR.
    fn fill(&mut self) -> Result<bool, Status> {
        let before = self.deliverable();
        loop {
            if self.eof {
                // A CR held at the boundary becomes deliverable once the
                // stream ends: it cannot start a CRLF pair any more.
                self.cr_hold = false;
                return Ok(self.deliverable() > before);
            }
            if self.rd.space() == 0 {
                self.rd.compact();
                if self.rd.space() == 0 {
                    self.rd.ensure_space(1)?;
                }
            }
            let translate_from = self.rd.limit() - usize::from(self.cr_hold);
            let n = self.backend.read(self.rd.free_mut())?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.rd.produce(n);
            if self.text_mode {
                self.translate_pending(translate_from);
            }
            if self.deliverable() > before {
                return Ok(true);
            }
        }
    }

    /// Read one line, excluding the terminator. `None` once the stream is
    /// exhausted; an unterminated tail is returned as a final line.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, Status> {
        loop {
            let index = self.rd.index();
            let dend = self.deliverable_end();
            if let Some(at) = memchr(b'\n', &self.rd.pending()[self.scan..dend - index]) {
                let line = self.rd.pending()[..self.scan + at].to_vec();
                self.rd.consume(self.scan + at + 1);
                self.scan = 0;
                return Ok(Some(line));
            }
            self.scan = dend - index;
            if !self.fill()? {
                self.scan = 0;
                if self.deliverable() == 0 {
                    return Ok(None);
                }
                let tail = self.take_deliverable();
                return Ok(Some(tail));
            }
        }
    }

    /// Read everything to end of stream. Empty once exhausted.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Status> {
        while self.fill()? {}
        self.scan = 0;
        Ok(self.take_deliverable())
    }

    /// Read at most `count` bytes. `None` at end of stream with nothing
    /// read.
    pub fn read_count(&mut self, count: usize) -> Result<Option<Vec<u8>>, Status> {
        self.scan = 0;
        let mut out = Vec::new();
        loop {
            if self.deliverable() == 0 && !self.fill()? {
                break;
            }
            let take = (count - out.len()).min(self.deliverable());
            out.extend_from_slice(&self.rd.pending()[..take]);
            self.rd.consume(take);
            if out.len() == count {
                break;
            }
        }
        if out.is_empty() && self.deliverable() == 0 && self.eof {
            return Ok(None);
        }
        Ok(Some(out))
    }

    /// Skip whitespace and parse the longest numeric prefix. `None` when the
    /// next bytes do not form a number.
    pub fn read_number(&mut self) -> Result<Option<f64>, Status> {
        // Skip leading whitespace, refilling as needed.
        loop {
            while self.deliverable() > 0 && self.rd.pending()[0].is_ascii_whitespace() {
                self.rd.consume(1);
            }
            if self.deliverable() > 0 {
                break;
            }
            if !self.fill()? {
                self.scan = 0;
                return Ok(None);
            }
        }
        // Grow the window until the numeric prefix stops short of its end,
        // so the scan can never be cut off by a buffer boundary.
        let len = loop {
            let window = &self.rd.pending()[..self.deliverable()];
            let len = number_prefix(window);
            if len < window.len() || self.eof {
                break len;
            }
            if !self.fill()? {
                break number_prefix(&self.rd.pending()[..self.deliverable()]);
            }
        };
        self.scan = 0;
        if len == 0 {
            return Ok(None);
        }
        let text = std::str::from_utf8(&self.rd.pending()[..len])
            .expect("numeric prefix is ASCII");
        let value = parse_number(text);
        self.rd.consume(len);
        match value {
            Some(value) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Dispatch one format specifier.
    pub fn read_format(&mut self, format: ReadFormat) -> Result<ReadOut, Status> {
        match format {
            ReadFormat::Line => Ok(match self.read_line()? {
                Some(line) => ReadOut::Str(line),
                None => ReadOut::Nil,
            }),
            ReadFormat::Number => Ok(match self.read_number()? {
                Some(n) => ReadOut::Num(n),
                None => ReadOut::Nil,
            }),
            ReadFormat::All => Ok(ReadOut::Str(self.read_all()?)),
            ReadFormat::Count(n) => Ok(match self.read_count(n)? {
                Some(bytes) => ReadOut::Str(bytes),
                None => ReadOut::Nil,
            }),
        }
    }

    fn take_deliverable(&mut self) -> Vec<u8> {
        let n = self.deliverable();
        let out = self.rd.pending()[..n].to_vec();
        self.rd.consume(n);
        out
    }

    /// Append bytes to the write buffer, flushing whenever it fills. In text
    /// mode every LF is expanded to CRLF.
    pub fn write(&mut self, src: &[u8]) -> Result<(), Status> {
        if !self.text_mode {
            return self.append(src);
        }
        let mut last = 0;
        for nl in memchr::memchr_iter(b'\n', src) {
            self.append(&src[last..nl])?;
            self.append(b"\r\n")?;
            last = nl + 1;
        }
        self.append(&src[last..])
    }

    fn append(&mut self, mut src: &[u8]) -> Result<(), Status> {
        while !src.is_empty() {
            if self.wr.space() == 0 && self.wr.size() < WRITE_BUFFER_SIZE {
                self.wr
                    .ensure_space((WRITE_BUFFER_SIZE - self.wr.size()).min(src.len()))
                    .ok();
            }
            if self.wr.space() == 0 {
                // One flush attempt before reporting the buffer full.
                self.flush_pending()?;
                if self.wr.space() == 0 {
                    return Err(Status::new(
                        StatusCode::Nospc,
                        "write buffer is full and cannot be flushed",
                    ));
                }
            }
            let n = self.wr.space().min(src.len());
            self.wr.free_mut()[..n].copy_from_slice(&src[..n]);
            self.wr.produce(n);
            src = &src[n..];
        }
        Ok(())
    }

    /// Drain the write buffer into the backend. For buffers aliasing foreign
    /// memory the data is already in place and the cursor is left alone.
    pub fn flush_pending(&mut self) -> Result<(), Status> {
        if self.wr.is_foreign() {
            return Ok(());
        }
        while self.wr.available() > 0 {
            let n = self.backend.write(self.wr.pending())?;
            if n == 0 {
                return Err(Status::new(
                    StatusCode::Incomplete,
                    "backend accepted no bytes",
                ));
            }
            self.wr.consume(n);
        }
        self.wr.reset();
        Ok(())
    }

    /// Flush buffered writes through the backend.
    pub fn flush(&mut self) -> Result<(), Status> {
        self.flush_pending()?;
        self.backend.flush()
    }

    /// Reposition the stream. The write buffer is flushed first; the read
    /// window is kept when the target lands inside it, otherwise the buffer
    /// is dropped and the backend repositioned.
    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64, Status> {
        self.flush_pending()?;
        if whence == Whence::End {
            let pos = self.backend.seek(Whence::End, offset)?;
            self.invalidate_read();
            return Ok(pos);
        }
        let raw = self.backend.seek(Whence::Cur, 0)?;
        let buffered = self.rd.available() as u64;
        let logical = raw - buffered;
        let target = match whence {
            Whence::Set => offset,
            Whence::Cur => logical as i64 + offset,
            Whence::End => unreachable!(),
        };
        if target < 0 {
            return Err(Status::invalid("seek before start of stream"));
        }
        let target = target as u64;
        // The buffer spans file range [raw - limit, raw). Text mode breaks
        // the byte-offset correspondence, so only binary windows are reused.
        let window_start = raw - self.rd.limit() as u64;
        if !self.text_mode && target >= window_start && target <= raw {
            self.rd.set_index((target - window_start) as usize);
            self.scan = 0;
            return Ok(target);
        }
        let pos = self.backend.seek(Whence::Set, target as i64)?;
        self.invalidate_read();
        Ok(pos)
    }

    fn invalidate_read(&mut self) {
        self.rd.reset();
        self.scan = 0;
        self.eof = false;
        self.cr_hold = false;
    }
}

/// Length of the longest prefix of `bytes` that forms a valid number:
/// optional sign, then either `0x` hex digits or decimal digits with an
/// optional fraction and exponent. The scan never looks past `bytes`.
fn number_prefix(bytes: &[u8]) -> usize {
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    // Hexadecimal.
    if bytes.len() >= i + 2 && bytes[i] == b'0' && (bytes[i + 1] | 0x20) == b'x' {
        let mut j = i + 2;
        while j < bytes.len() && bytes[j].is_ascii_hexdigit() {
            j += 1;
        }
        if j > i + 2 {
            return j;
        }
        // "0x" with no digits: the prefix "0" still parses as decimal.
    }
    let int_digits = count_digits(&bytes[i..]);
    i += int_digits;
    let mut frac_digits = 0;
    if i < bytes.len() && bytes[i] == b'.' {
        frac_digits = count_digits(&bytes[i + 1..]);
        if int_digits + frac_digits > 0 {
            i += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return 0;
    }
    // Exponent is only part of the number when at least one digit follows.
    if i < bytes.len() && (bytes[i] | 0x20) == b'e' {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_digits = count_digits(&bytes[j..]);
        if exp_digits > 0 {
            i = j + exp_digits;
        }
    }
    i
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

fn parse_number(text: &str) -> Option<f64> {
    let (sign, rest) = match text.as_bytes().first() {
        Some(b'-') => (-1.0, &text[1..]),
        Some(b'+') => (1.0, &text[1..]),
        _ => (1.0, text),
    };
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return u64::from_str_radix(hex, 16).ok().map(|v| sign * v as f64);
        }
    }
    text.parse::<f64>().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    /// Backend over an in-memory byte string that hands out at most `chunk`
    /// bytes per read, to force refills at awkward boundaries.
    struct ChunkSource {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        written: Vec<u8>,
    }

    impl ChunkSource {
        fn new(data: &[u8], chunk: usize) -> ChunkSource {
            ChunkSource {
                data: data.to_vec(),
                pos: 0,
                chunk,
                written: Vec::new(),
            }
        }
    }

    impl RawStream for ChunkSource {
        fn read(&mut self, dst: &mut [u8]) -> Result<usize, Status> {
            let n = dst.len().min(self.chunk).min(self.data.len() - self.pos);
            dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, src: &[u8]) -> Result<usize, Status> {
            self.written.extend_from_slice(src);
            Ok(src.len())
        }

        fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64, Status> {
            let base = match whence {
                Whence::Set => 0,
                Whence::Cur => self.pos as i64,
                Whence::End => self.data.len() as i64,
            };
            let target = base + offset;
            assert!(target >= 0);
            self.pos = (target as usize).min(self.data.len());
            Ok(self.pos as u64)
        }
    }

    #[test]
    fn lines_across_refill_boundaries() {
        let mut data = Vec::new();
        for _ in 0..513 {
            data.extend_from_slice(b"A\nB\n");
        }
        let mut stream = BufStream::new(ChunkSource::new(&data, 7), false);
        for i in 0..1026 {
            let line = stream.read_line().unwrap().unwrap();
            let expect: &[u8] = if i % 2 == 0 { b"A" } else { b"B" };
            assert_eq!(line, expect, "line {i}");
        }
        assert_eq!(stream.read_line().unwrap(), None);
    }

    #[test]
    fn unterminated_tail_is_a_line() {
        let mut stream = BufStream::new(ChunkSource::new(b"one\ntwo", 3), false);
        assert_eq!(stream.read_line().unwrap().unwrap(), b"one");
        assert_eq!(stream.read_line().unwrap().unwrap(), b"two");
        assert_eq!(stream.read_line().unwrap(), None);
    }

    #[test]
    fn text_mode_strips_crlf_on_read() {
        let mut stream = BufStream::new(ChunkSource::new(b"a\r\nb\r\nc", 4), true);
        assert_eq!(stream.read_line().unwrap().unwrap(), b"a");
        assert_eq!(stream.read_line().unwrap().unwrap(), b"b");
        assert_eq!(stream.read_line().unwrap().unwrap(), b"c");
        assert_eq!(stream.read_line().unwrap(), None);
    }

    #[test]
    fn cr_split_across_refill_boundary() {
        // Chunk size 2 over "x\r\ny": one refill ends exactly on the CR.
        let mut stream = BufStream::new(ChunkSource::new(b"x\r\ny", 2), true);
        assert_eq!(stream.read_all().unwrap(), b"x\ny");
    }

    #[test]
    fn lone_cr_at_end_of_stream_is_kept() {
        let mut stream = BufStream::new(ChunkSource::new(b"x\r", 1), true);
        assert_eq!(stream.read_all().unwrap(), b"x\r");
    }

    #[test]
    fn binary_mode_keeps_cr() {
        let mut stream = BufStream::new(ChunkSource::new(b"a\r\nb", 64), false);
        assert_eq!(stream.read_line().unwrap().unwrap(), b"a\r");
        assert_eq!(stream.read_line().unwrap().unwrap(), b"b");
    }

    #[test]
    fn count_reads_stop_at_eof() {
        let mut stream = BufStream::new(ChunkSource::new(b"abcdef", 2), false);
        assert_eq!(stream.read_count(4).unwrap().unwrap(), b"abcd");
        assert_eq!(stream.read_count(4).unwrap().unwrap(), b"ef");
        assert_eq!(stream.read_count(4).unwrap(), None);
    }

    #[test]
    fn read_all_may_be_empty() {
        let mut stream = BufStream::new(ChunkSource::new(b"", 8), false);
        assert_eq!(stream.read_all().unwrap(), b"");
        assert_eq!(stream.read_line().unwrap(), None);
    }

    #[test]
    fn numbers_with_junk_and_boundaries() {
        let mut stream = BufStream::new(ChunkSource::new(b"  42 -3.5e2 0x1F tail", 3), false);
        assert_eq!(stream.read_number().unwrap(), Some(42.0));
        assert_eq!(stream.read_number().unwrap(), Some(-350.0));
        assert_eq!(stream.read_number().unwrap(), Some(31.0));
        assert_eq!(stream.read_number().unwrap(), None);
        assert_eq!(stream.read_all().unwrap(), b"tail");
    }

    #[test]
    fn number_prefix_is_longest_valid() {
        assert_eq!(number_prefix(b"12.5e+3x"), 7);
        assert_eq!(number_prefix(b"12e"), 2);
        assert_eq!(number_prefix(b"0xGG"), 1);
        assert_eq!(number_prefix(b".5"), 2);
        assert_eq!(number_prefix(b"-.5"), 3);
        assert_eq!(number_prefix(b"."), 0);
        assert_eq!(number_prefix(b"x"), 0);
        assert_eq!(number_prefix(b""), 0);
    }

    #[test]
    fn text_mode_write_expands_lf() {
        let mut stream = BufStream::new(ChunkSource::new(b"", 8), true);
        stream.write(b"hello\nworld").unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.backend().written, b"hello\r\nworld");
    }

    #[test]
    fn write_flushes_when_buffer_fills() {
        let mut stream = BufStream::new(ChunkSource::new(b"", 8), false);
        let big = vec![b'z'; WRITE_BUFFER_SIZE * 2 + 17];
        stream.write(&big).unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.backend().written, big);
    }

    #[test]
    fn seek_inside_the_buffered_window_keeps_it() {
        let mut stream = BufStream::new(ChunkSource::new(b"0123456789", 64), false);
        assert_eq!(stream.read_count(4).unwrap().unwrap(), b"0123");
        // The whole stream is buffered; stepping back lands inside the
        // window without touching the backend position.
        assert_eq!(stream.seek(Whence::Set, 1).unwrap(), 1);
        assert_eq!(stream.read_count(3).unwrap().unwrap(), b"123");
        assert_eq!(stream.seek(Whence::Cur, -2).unwrap(), 2);
        assert_eq!(stream.read_count(2).unwrap().unwrap(), b"23");
    }

    #[test]
    fn seek_to_end_invalidates_the_window() {
        let mut stream = BufStream::new(ChunkSource::new(b"0123456789", 64), false);
        assert_eq!(stream.read_count(4).unwrap().unwrap(), b"0123");
        assert_eq!(stream.seek(Whence::End, -2).unwrap(), 8);
        assert_eq!(stream.read_all().unwrap(), b"89");
    }

    #[test]
    fn format_dispatch() {
        let mut stream = BufStream::new(ChunkSource::new(b"7 rest", 64), false);
        assert_eq!(stream.read_format(ReadFormat::Number).unwrap(), ReadOut::Num(7.0));
        assert_eq!(
            stream.read_format(ReadFormat::All).unwrap(),
            ReadOut::Str(b" rest".to_vec())
        );
        assert_eq!(stream.read_format(ReadFormat::Line).unwrap(), ReadOut::Nil);
    }
}
