//! Byte-duplex serial port access for the T=0 link.
//!
//! The engines talk to the line through the [`BytePort`] trait so the same
//! state machines drive real hardware and scripted test ports. [`TtyPort`] is
//! the hardware implementation: a character device opened 8E2 with the
//! crate's timing discipline, and an echo drain on every write because the
//! TX and RX lines of these readers are physically tied.

use std::{
    io::{ErrorKind, Read, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::Mutex;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::{Error, Result, shared::to_hex};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(100);
/// Inter-byte timeout once a PPS has raised the bit rate.
pub const POST_PPS_INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(10);

// Granularity at which blocking reads observe `cancel_read`.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Line settings for opening a [`TtyPort`]. Parity, data and stop bits are
/// fixed by ISO 7816-3 (8E2) and are not configurable.
#[derive(Clone, Debug)]
pub struct PortConfig {
    pub baud: u32,
    pub read_timeout: Duration,
    pub inter_byte_timeout: Duration,
    /// Whether TX is looped back onto RX (tied lines). When set, every write
    /// drains and verifies its own echo before any card byte is read.
    pub echo: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            baud: 9_600,
            read_timeout: DEFAULT_READ_TIMEOUT,
            inter_byte_timeout: DEFAULT_INTER_BYTE_TIMEOUT,
            echo: true,
        }
    }
}

/// Half-duplex byte port as the T=0 engines see it.
///
/// All methods take `&self`: the virtual-card role shares one port between
/// its dispatch thread and the WXT heartbeat thread. Implementations must
/// make [`BytePort::write`] atomic against concurrent writers, including the
/// echo drain, so a heartbeat NULL can never land inside a response frame.
pub trait BytePort: Send + Sync {
    /// Write the buffer and, on tied-line ports, drain and verify the echo.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Read one byte, waiting up to the port's read timeout. `None` on
    /// timeout or after [`BytePort::cancel_read`].
    fn read_byte(&self) -> Result<Option<u8>>;

    /// Read up to `n` bytes. The first byte is awaited up to the read
    /// timeout, the rest up to the inter-byte timeout each; returns what
    /// arrived before the line went quiet.
    fn read_bytes(&self, n: usize) -> Result<Vec<u8>>;

    /// Read up to `max` trailing bytes with every byte (including the first)
    /// bounded by the inter-byte timeout. Used to drain a frame of unknown
    /// length once its fixed part has been consumed.
    fn read_trailing(&self, max: usize) -> Result<Vec<u8>>;

    /// Discard anything already buffered on the receive side.
    fn reset_input(&self) -> Result<()>;

    fn set_rts(&self, level: bool) -> Result<()>;
    fn set_dtr(&self, level: bool) -> Result<()>;
    fn set_baud(&self, baud: u32) -> Result<()>;
    fn set_inter_byte_timeout(&self, timeout: Duration);

    /// Make a pending (or the next) blocking read return empty within a
    /// bounded time. One-shot: consumed by the read that observes it.
    fn cancel_read(&self);
}

/// Serial character device (RS-232 style reader) speaking 8E2.
pub struct TtyPort {
    io: Mutex<Box<dyn SerialPort>>,
    inter_byte_timeout: Mutex<Duration>,
    read_timeout: Duration,
    echo: bool,
    cancel: AtomicBool,
}

impl TtyPort {
    /// Open `device` with the 8E2 framing ISO 7816-3 prescribes.
    pub fn open(device: &str, config: &PortConfig) -> Result<Self> {
        if !Path::new(device).exists() {
            return Err(Error::Reader(format!(
                "device file {device} does not exist"
            )));
        }
        let io = serialport::new(device, config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .timeout(POLL_SLICE)
            .open()?;
        Ok(Self {
            io: Mutex::new(io),
            inter_byte_timeout: Mutex::new(config.inter_byte_timeout),
            read_timeout: config.read_timeout,
            echo: config.echo,
            cancel: AtomicBool::new(false),
        })
    }

    fn inter_byte(&self) -> Duration {
        *self.inter_byte_timeout.lock()
    }

    /// Wait up to `window` for one byte on the locked handle, polling in
    /// slices so a cancel is honored promptly. The echo drain inside a write
    /// must not eat a cancel aimed at the dispatch read, so only reads pass
    /// `honor_cancel`.
    fn read_within(
        &self,
        io: &mut Box<dyn SerialPort>,
        window: Duration,
        honor_cancel: bool,
    ) -> Result<Option<u8>> {
        let deadline = Instant::now() + window;
        let mut byte = [0u8; 1];
        loop {
            if honor_cancel && self.cancel.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            io.set_timeout(POLL_SLICE.min(deadline - now))?;
            match io.read(&mut byte) {
                Ok(n) if n > 0 => return Ok(Some(byte[0])),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read up to `n` bytes on the locked handle; `first` bounds the wait for
    /// the initial byte, the inter-byte timeout bounds the rest.
    fn fill(
        &self,
        io: &mut Box<dyn SerialPort>,
        n: usize,
        first: Duration,
        honor_cancel: bool,
    ) -> Result<Vec<u8>> {
        let inter = self.inter_byte();
        let mut out = Vec::with_capacity(n);
        let mut window = first;
        while out.len() < n {
            match self.read_within(io, window, honor_cancel)? {
                Some(b) => out.push(b),
                None => break,
            }
            window = inter;
        }
        Ok(out)
    }
}

impl BytePort for TtyPort {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock();
        debug!("tx [{}]: {}", data.len(), to_hex(data));
        io.write_all(data)?;
        io.flush()?;
        if self.echo {
            let echo = self.fill(&mut io, data.len(), self.read_timeout, false)?;
            if echo != data {
                return Err(Error::Protocol(format!(
                    "bad echo (expected {}, got {})",
                    to_hex(data),
                    to_hex(&echo)
                )));
            }
        }
        Ok(())
    }

    fn read_byte(&self) -> Result<Option<u8>> {
        let mut io = self.io.lock();
        let b = self.read_within(&mut io, self.read_timeout, true)?;
        match b {
            Some(b) => debug!("rx_byte: {b:02x}"),
            None => debug!("rx_byte: (nil)"),
        }
        Ok(b)
    }

    fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let mut io = self.io.lock();
        let out = self.fill(&mut io, n, self.read_timeout, true)?;
        debug!("rx [{}/{}]: {}", out.len(), n, to_hex(&out));
        Ok(out)
    }

    fn read_trailing(&self, max: usize) -> Result<Vec<u8>> {
        let mut io = self.io.lock();
        let inter = self.inter_byte();
        let out = self.fill(&mut io, max, inter, true)?;
        if !out.is_empty() {
            debug!("rx trailing [{}]: {}", out.len(), to_hex(&out));
        }
        Ok(out)
    }

    fn reset_input(&self) -> Result<()> {
        self.io.lock().clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_rts(&self, level: bool) -> Result<()> {
        self.io.lock().write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&self, level: bool) -> Result<()> {
        self.io.lock().write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_baud(&self, baud: u32) -> Result<()> {
        self.io.lock().set_baud_rate(baud)?;
        Ok(())
    }

    fn set_inter_byte_timeout(&self, timeout: Duration) {
        *self.inter_byte_timeout.lock() = timeout;
    }

    fn cancel_read(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}
