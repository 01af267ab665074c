use crossbeam_channel::{Receiver, RecvTimeoutError};
use regex::Regex;
use std::io::{self, BufRead, BufReader, Read};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Timed out after {waited:?} waiting for pattern '{pattern}'")]
    Timeout { pattern: String, waited: Duration },
    #[error("Device output closed before pattern '{pattern}' was seen")]
    Closed { pattern: String },
    #[error("Invalid expectation pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Failed to read device output: {0}")]
    Io(#[from] io::Error),
}

/// Capture groups of one satisfied expectation. Group 0 is the whole match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captures {
    groups: Vec<Option<String>>,
}

impl Captures {
    pub fn new(groups: Vec<Option<String>>) -> Self {
        Self { groups }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    pub fn whole(&self) -> &str {
        self.get(0).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Text output of one running device (hardware behind a serial console, or
/// an emulator).
///
/// Expectations consume output: once a pattern matched, nothing up to the
/// end of that match can satisfy a later expectation.
pub trait DeviceSession {
    /// Blocks until the unconsumed output contains a match of `pattern`.
    fn expect_pattern(&mut self, pattern: &Regex) -> Result<Captures, SessionError>;

    fn expect_exact(&mut self, text: &str) -> Result<(), SessionError> {
        let pattern = Regex::new(&regex::escape(text))?;
        self.expect_pattern(&pattern).map(|_| ())
    }
}

type Line = io::Result<Vec<u8>>;

/// Lines buffered between the reader thread and the session.
const LINE_BACKLOG: usize = 1024;

/// `DeviceSession` over any byte stream: a captured log, or stdin piped
/// from a serial terminal or emulator.
///
/// A reader thread forwards the stream line by line. Partial lines are only
/// delivered at end of stream, so a capture never sees half a line.
pub struct StreamSession {
    lines: Receiver<Line>,
    transcript: String,
    consumed: usize,
    closed: bool,
    timeout: Duration,
}

impl StreamSession {
    pub fn spawn<R: Read + Send + 'static>(source: R, timeout: Duration) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<Line>(LINE_BACKLOG);

        thread::Builder::new()
            .name("device-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(source);
                loop {
                    let mut line = Vec::new();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if tx.send(Ok(line)).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            lines: rx,
            transcript: String::new(),
            consumed: 0,
            closed: false,
            timeout,
        })
    }

    /// Everything received so far, consumed or not.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Takes what the device has already sent without waiting, at most one
    /// backlog's worth so a device that never stops talking cannot pin us here.
    pub fn drain_available(&mut self) {
        for _ in 0..LINE_BACKLOG {
            match self.lines.try_recv() {
                Ok(Ok(bytes)) => self.push_line(&bytes),
                Ok(Err(e)) => {
                    warn!("Device output read failed: {}", e);
                    self.closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn push_line(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        trace!("device: {}", text.trim_end());
        self.transcript.push_str(&text);
    }

    fn try_match(&mut self, pattern: &Regex) -> Option<Captures> {
        let pending = &self.transcript[self.consumed..];
        let caps = pattern.captures(pending)?;
        let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let groups = caps
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect();
        self.consumed += end;
        Some(Captures::new(groups))
    }
}

impl DeviceSession for StreamSession {
    fn expect_pattern(&mut self, pattern: &Regex) -> Result<Captures, SessionError> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            if let Some(caps) = self.try_match(pattern) {
                debug!("Matched '{}': {:?}", pattern.as_str(), caps.whole());
                return Ok(caps);
            }

            if self.closed {
                return Err(SessionError::Closed {
                    pattern: pattern.as_str().to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout {
                    pattern: pattern.as_str().to_string(),
                    waited: started.elapsed(),
                });
            }

            match self.lines.recv_timeout(deadline - now) {
                Ok(Ok(bytes)) => {
                    self.push_line(&bytes);
                    // Match once per batch, not once per line.
                    self.drain_available();
                }
                Ok(Err(e)) => {
                    self.closed = true;
                    return Err(SessionError::Io(e));
                }
                Err(RecvTimeoutError::Disconnected) => self.closed = true,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::Timeout {
                        pattern: pattern.as_str().to_string(),
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn session(text: &str) -> StreamSession {
        StreamSession::spawn(Cursor::new(text.as_bytes().to_vec()), Duration::from_secs(5)).unwrap()
    }

    /// A source that never produces data and never ends.
    struct Silent(crossbeam_channel::Receiver<()>);

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    /// A crash-looping device: boot banners forever, never the greeting.
    struct Chatty;

    impl Read for Chatty {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let line = b"rst:0xc (SW_CPU_RESET),boot:0x13 (SPI_FAST_FLASH_BOOT)\n";
            let n = line.len().min(buf.len());
            buf[..n].copy_from_slice(&line[..n]);
            Ok(n)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "uart gone"))
        }
    }

    #[test]
    fn test_expect_exact_finds_greeting() {
        let mut s = session("I (31) boot: ESP-IDF v5.1\nHello world!\n");
        assert!(s.expect_exact("Hello world!").is_ok());
    }

    #[test]
    fn test_expect_pattern_returns_groups() {
        let mut s = session("ELF file SHA256:  2cf24dba5f\n");
        let re = Regex::new(r"ELF file SHA256:\s+([a-f0-9]+)").unwrap();
        let caps = s.expect_pattern(&re).unwrap();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps.get(1), Some("2cf24dba5f"));
        assert_eq!(caps.whole(), "ELF file SHA256:  2cf24dba5f");
    }

    #[test]
    fn test_consumed_output_is_not_matched_again() {
        let mut s = session("Hello world!\nbye\n");
        s.expect_exact("Hello world!").unwrap();
        let err = s.expect_exact("Hello world!").unwrap_err();
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[test]
    fn test_expectations_follow_output_order() {
        let mut s = session("first\nsecond\n");
        s.expect_exact("second").unwrap();
        assert!(s.expect_exact("first").is_err());
    }

    #[test]
    fn test_final_line_without_newline_is_delivered() {
        let mut s = session("booting\nHello world!");
        assert!(s.expect_exact("Hello world!").is_ok());
    }

    #[test]
    fn test_literal_text_is_escaped() {
        let mut s = session("value (x+1)\n");
        assert!(s.expect_exact("(x+1)").is_ok());
    }

    #[test]
    fn test_silent_device_times_out() {
        let (_keep_open, rx) = crossbeam_channel::bounded::<()>(0);
        let mut s = StreamSession::spawn(Silent(rx), Duration::from_millis(50)).unwrap();
        let err = s.expect_exact("Hello world!").unwrap_err();
        match err {
            SessionError::Timeout { pattern, waited } => {
                assert_eq!(pattern, "Hello world!");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_endless_output_still_times_out() {
        let mut s = StreamSession::spawn(Chatty, Duration::from_millis(100)).unwrap();
        let started = Instant::now();
        let err = s.expect_exact("Hello world!").unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(s.transcript().contains("SW_CPU_RESET"));
    }

    #[test]
    fn test_drain_records_read_error() {
        let mut s = StreamSession::spawn(Broken, Duration::from_secs(5)).unwrap();
        // Wait for the reader thread to hit the error.
        std::thread::sleep(Duration::from_millis(100));
        s.drain_available();
        let err = s.expect_exact("anything").unwrap_err();
        assert!(matches!(err, SessionError::Closed { .. }));
    }

    #[test]
    fn test_read_error_is_reported() {
        let mut s = StreamSession::spawn(Broken, Duration::from_secs(5)).unwrap();
        let err = s.expect_exact("anything").unwrap_err();
        match err {
            SessionError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transcript_keeps_all_output() {
        let mut s = session("a\nHello world!\nb\n");
        s.expect_exact("Hello world!").unwrap();
        assert!(s.expect_exact("never").is_err());
        assert_eq!(s.transcript(), "a\nHello world!\nb\n");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let bytes = b"\xffHello world!\n".to_vec();
        let mut s = StreamSession::spawn(Cursor::new(bytes), Duration::from_secs(5)).unwrap();
        assert!(s.expect_exact("Hello world!").is_ok());
        assert!(s.transcript().starts_with('\u{FFFD}'));
    }
}
