//! ISO/IEC 7816-3 T=0 transport for serial smart-card readers, with a
//! virtual-card role for the same link and Bluetooth rSAP message framing.

pub mod card;
pub mod classify;
pub mod link;
pub mod port;
pub mod reader;
pub mod rsap;
pub mod shared;

use thiserror::Error;

pub use crate::{
    card::{CardApplication, VirtualCard},
    classify::{Classification, Profile},
    link::LinkParams,
    port::{BytePort, PortConfig, TtyPort},
    reader::Reader,
    rsap::SapClient,
};

/// Command header length: CLA, INS, P1, P2, P3.
pub const HEADER_LEN: usize = 5;
/// A PPS exchange frame: PPSS, PPS0, PPS1, PCK.
pub const PPS_LEN: usize = 4;
/// Trailing status word length: SW1, SW2.
pub const SW_LEN: usize = 2;

/// TS for direct convention; also the first byte of every ATR we accept.
pub const ATR_BYTE: u8 = 0x3b;
/// PPSS, the initial byte of a PPS request.
pub const PPS_BYTE: u8 = 0xff;
/// NULL procedure byte, used as a waiting-time extension.
pub const WXT_BYTE: u8 = 0x60;
/// GET RESPONSE, the instruction the terminal uses to fetch deferred data.
pub const GET_RESPONSE_INS: u8 = 0xc0;

/// Largest frame either side can produce in one T=0 cycle.
pub const BUF_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum Error {
    /// A reset produced no TS byte, or polling for a card timed out.
    #[error("no card detected")]
    NoCard,
    /// The counterpart violated ISO 7816-3 framing or the SAP message rules.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The reader device or SIM access server is unusable.
    #[error("reader error: {0}")]
    Reader(String),
    /// An operation was issued before the exchange it depends on (e.g. PPS
    /// before any ATR was captured).
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),
    /// Reset pin specs must match `^[+-](rts|dtr)$`.
    #[error("invalid reset pin spec {0:?}")]
    InvalidResetPin(String),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
