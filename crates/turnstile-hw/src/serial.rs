//! RFID reader serial line.
//!
//! The reader (an Arduino with an MFRC522) prints one ASCII line per event.
//! The tty is put in raw mode with a 1 s inter-byte read timeout
//! (`VMIN = 0`, `VTIME = 10`) so that a reader with nothing to say lets the
//! caller regain control once a second.

use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices,
};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;

/// Read timeout in deciseconds.
const READ_TIMEOUT_DS: u8 = 10;

/// Longest line accepted from the reader, terminator excluded.
pub const MAX_LINE_BYTES: usize = 1024;

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("cannot open serial port {port}: {source}; check that the reader is plugged in and that this user may access it (e.g. member of the dialout group)")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot configure serial port {port}: {source}")]
    Configure {
        port: String,
        #[source]
        source: nix::Error,
    },
    #[error("unsupported baud rate {0} (use 9600, 19200, 38400, 57600 or 115200)")]
    UnsupportedBaud(u32),
    #[error("serial read failed: {0}")]
    Read(#[from] std::io::Error),
}

/// A source of text lines that may time out.
pub trait LineSource {
    /// `Ok(Some(line))` for a complete line without its terminator,
    /// `Ok(None)` when nothing complete arrived before the timeout.
    fn next_line(&mut self) -> Result<Option<String>, SerialError>;
}

/// Line assembler over a reader whose reads may return early.
///
/// Bytes of an unfinished line are kept across calls; invalid UTF-8 is
/// replaced rather than rejected. A line longer than [`MAX_LINE_BYTES`] is
/// malformed and dropped up to and including its newline.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
    discarding: bool,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            discarding: false,
        }
    }
}

impl<R: BufRead> LineSource for LineReader<R> {
    fn next_line(&mut self) -> Result<Option<String>, SerialError> {
        let room = (MAX_LINE_BYTES + 1).saturating_sub(self.pending.len()) as u64;
        (&mut self.inner)
            .take(room)
            .read_until(b'\n', &mut self.pending)?;

        if self.pending.last() != Some(&b'\n') {
            if self.pending.len() > MAX_LINE_BYTES {
                if !self.discarding {
                    tracing::warn!(limit = MAX_LINE_BYTES, "serial line too long, discarding");
                }
                self.pending.clear();
                self.discarding = true;
            }
            return Ok(None);
        }

        let raw = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.discarding) {
            // Tail of an overlong line.
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        Ok(Some(line))
    }
}

/// An open, configured card reader tty.
pub struct CardReader {
    lines: LineReader<BufReader<File>>,
}

impl CardReader {
    /// Open `port` at `baud`, raw 8N1. Failure here is fatal for the listener.
    pub fn open(port: &str, baud: u32) -> Result<Self, SerialError> {
        let speed = baud_rate(baud)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::fcntl::OFlag::O_NOCTTY.bits())
            .open(port)
            .map_err(|source| SerialError::Open {
                port: port.to_string(),
                source,
            })?;

        let configure_err = |source| SerialError::Configure {
            port: port.to_string(),
            source,
        };
        let mut tio = termios::tcgetattr(&file).map_err(configure_err)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, speed).map_err(configure_err)?;
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = READ_TIMEOUT_DS;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(configure_err)?;
        // Drop whatever the reader printed before we were listening.
        termios::tcflush(&file, FlushArg::TCIFLUSH).map_err(configure_err)?;

        tracing::info!(port, baud, "connected to card reader");

        Ok(Self {
            lines: LineReader::new(BufReader::new(file)),
        })
    }
}

impl LineSource for CardReader {
    fn next_line(&mut self) -> Result<Option<String>, SerialError> {
        self.lines.next_line()
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, SerialError> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(SerialError::UnsupportedBaud(other)),
    })
}
