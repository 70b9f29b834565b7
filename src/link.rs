//! ISO 7816-3 link parameters: clock-rate and bit-rate tables, the captured
//! ATR, and the PPS negotiation math deriving baud rate and waiting time.

use std::time::Duration;

use log::info;

use crate::{ATR_BYTE, Error, PPS_BYTE, PPS_LEN, Result, shared::xor_checksum};

pub const DEFAULT_FI: usize = 0;
pub const DEFAULT_DI: usize = 1;
pub const DEFAULT_WI: u32 = 10;

/// ISO 7816-3 table 7: clock rate conversion integer Fi, indexed by FI.
/// `None` entries are reserved and fail any computation referencing them.
const CLOCK_RATE_CONVERSION: [Option<u32>; 16] = [
    Some(372),
    Some(372),
    Some(558),
    Some(744),
    Some(1116),
    Some(1488),
    Some(1860),
    None,
    None,
    Some(512),
    Some(768),
    Some(1024),
    Some(1536),
    Some(2048),
    None,
    None,
];

/// ISO 7816-3 table 8: baud rate adjustment integer Di, indexed by DI.
const BIT_RATE_ADJUSTMENT: [Option<u32>; 16] = [
    None,
    Some(1),
    Some(2),
    Some(4),
    Some(8),
    Some(16),
    Some(32),
    None,
    Some(12),
    Some(20),
    None,
    None,
    None,
    None,
    None,
    None,
];

/// Link state shared by both T=0 roles: the card clock, the current F/D/WI
/// selection, and the last captured ATR.
pub struct LinkParams {
    clk: u32,
    fi: usize,
    di: usize,
    wi: u32,
    atr: Option<Vec<u8>>,
    ta1: Option<u8>,
}

impl LinkParams {
    /// Start at the mandatory initial rate (FI=0, DI=1) for a card clocked
    /// at `clk` Hz.
    pub fn new(clk: u32) -> Self {
        Self {
            clk,
            fi: DEFAULT_FI,
            di: DEFAULT_DI,
            wi: DEFAULT_WI,
            atr: None,
            ta1: None,
        }
    }

    /// The card clock a given initial baud rate implies: clk = baud · F · D
    /// at the default indices.
    pub fn clock_for_baud(baud: u32) -> u32 {
        // Neither default table entry is reserved.
        let f = CLOCK_RATE_CONVERSION[DEFAULT_FI].unwrap();
        let d = BIT_RATE_ADJUSTMENT[DEFAULT_DI].unwrap();
        baud * f * d
    }

    fn f(&self) -> Result<u32> {
        CLOCK_RATE_CONVERSION[self.fi]
            .ok_or_else(|| Error::Protocol(format!("FI {} is reserved", self.fi)))
    }

    fn d(&self) -> Result<u32> {
        BIT_RATE_ADJUSTMENT[self.di]
            .ok_or_else(|| Error::Protocol(format!("DI {} is reserved", self.di)))
    }

    /// Serial baud rate for the current F/D selection: round(clk / F · D).
    pub fn baud(&self) -> Result<u32> {
        let (f, d) = (self.f()?, self.d()?);
        Ok((self.clk as f64 / f as f64 * d as f64).round() as u32)
    }

    /// One elementary time unit in seconds: F / (clk · D).
    pub fn work_etu(&self) -> Result<f64> {
        let (f, d) = (self.f()?, self.d()?);
        Ok(f as f64 / (self.clk as f64 * d as f64))
    }

    /// The T=0 waiting time: 960 · D · WI work etus.
    pub fn waiting_time(&self) -> Result<Duration> {
        let d = self.d()?;
        let seconds = 960.0 * d as f64 * self.wi as f64 * self.work_etu()?;
        Ok(Duration::from_secs_f64(seconds))
    }

    /// Override the waiting time integer (WI, from TC2 when the card sends
    /// one; 10 otherwise).
    pub fn set_wi(&mut self, wi: u32) {
        self.wi = wi;
    }

    /// Drop back to the initial F/D selection, as both sides do on reset.
    pub fn reset_rate(&mut self) {
        self.fi = DEFAULT_FI;
        self.di = DEFAULT_DI;
    }

    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    /// TA1 from the captured ATR, when the card sent one.
    pub fn ta1(&self) -> Option<u8> {
        self.ta1
    }

    /// Store a freshly captured ATR. The sequence must open with TS for
    /// direct convention; TA1 is extracted from the interface bytes when the
    /// T0 presence bit announces it.
    pub fn atr_received(&mut self, atr: &[u8]) -> Result<()> {
        if atr.first() != Some(&ATR_BYTE) {
            return Err(Error::Protocol(format!(
                "bad ATR header (expected {ATR_BYTE:#04x}, got {:?})",
                atr.first()
            )));
        }
        let t0 = *atr.get(1).ok_or_else(|| {
            Error::Protocol("ATR ends before the format byte T0".into())
        })?;
        // TA1 is the first interface byte, directly after T0 when present.
        self.ta1 = if t0 & 0x10 != 0 { atr.get(2).copied() } else { None };
        self.atr = Some(atr.to_vec());
        Ok(())
    }

    /// Apply an accepted PPS frame: adopt FI/DI from PPS1 and return the
    /// baud rate the line must switch to.
    pub fn pps_sent(&mut self, pps: &[u8]) -> Result<u32> {
        if pps.first() != Some(&PPS_BYTE) {
            return Err(Error::Protocol(format!(
                "bad PPS header (expected {PPS_BYTE:#04x}, got {:?})",
                pps.first()
            )));
        }
        let fidi = *pps.get(2).ok_or_else(|| {
            Error::Protocol("PPS frame ends before PPS1".into())
        })?;
        self.fi = (fidi >> 4) as usize;
        self.di = (fidi & 0x0f) as usize;

        let baud = self.baud()?;
        info!(
            "update F/D: {}/{} -> new baudrate: {baud}",
            self.f()?,
            self.d()?
        );
        Ok(baud)
    }

    /// Build the PPS request offering the card's own TA1 back to it (i.e.
    /// accept the fastest rate the ATR advertised).
    pub fn pps_proposal(&self) -> Result<[u8; PPS_LEN]> {
        if self.atr.is_none() {
            return Err(Error::NotInitialized(
                "ATR not received yet, cannot build a PPS request",
            ));
        }
        let ta1 = self.ta1.ok_or_else(|| {
            Error::Protocol("ATR carries no TA1, nothing to negotiate".into())
        })?;
        let mut pps = [PPS_BYTE, 0x10, ta1, 0];
        pps[3] = xor_checksum(&pps[..3]);
        Ok(pps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATR: &[u8] = &[
        0x3b, 0x9f, 0x96, 0x80, 0x1f, 0xc6, 0x80, 0x31, 0xe0, 0x73, 0xfe, 0x21,
        0x1b, 0x66, 0xd0, 0x02, 0x21, 0xab, 0x11, 0x18, 0x03, 0x82,
    ];
    const CLK: u32 = 3_571_200;

    #[test]
    fn initial_rate() {
        let link = LinkParams::new(CLK);
        // 3571200 / 372 * 1
        assert_eq!(link.baud().unwrap(), 9_600);
        assert_eq!(LinkParams::clock_for_baud(9_600), CLK);
    }

    #[test]
    fn atr_capture_extracts_ta1() {
        let mut link = LinkParams::new(CLK);
        link.atr_received(ATR).unwrap();
        assert_eq!(link.atr().unwrap(), ATR);
        assert_eq!(link.ta1(), Some(0x96));
    }

    #[test]
    fn atr_without_ta1() {
        let mut link = LinkParams::new(CLK);
        // T0 = 0x25: TB1 present, TA1 absent, 5 historical bytes.
        link.atr_received(&[0x3b, 0x25, 0x00, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(link.ta1(), None);
        assert!(link.pps_proposal().is_err());
    }

    #[test]
    fn rejects_inverse_convention() {
        let mut link = LinkParams::new(CLK);
        assert!(matches!(
            link.atr_received(&[0x3f, 0x20]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn pps_proposal_from_atr() {
        let mut link = LinkParams::new(CLK);
        link.atr_received(ATR).unwrap();
        assert_eq!(link.pps_proposal().unwrap(), [0xff, 0x10, 0x96, 0x79]);
    }

    #[test]
    fn pps_proposal_needs_atr() {
        let link = LinkParams::new(CLK);
        assert!(matches!(
            link.pps_proposal(),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn pps_accept_updates_rate() {
        let mut link = LinkParams::new(CLK);
        link.atr_received(ATR).unwrap();
        let baud = link.pps_sent(&[0xff, 0x10, 0x96, 0x79]).unwrap();
        // FI=9 -> F=512, DI=6 -> D=32.
        assert_eq!(baud, (CLK as f64 * 32.0 / 512.0).round() as u32);
        assert_eq!(baud, link.baud().unwrap());
    }

    #[test]
    fn pps_rejects_bad_header() {
        let mut link = LinkParams::new(CLK);
        assert!(matches!(
            link.pps_sent(&[0x3b, 0x10, 0x96, 0x79]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn reserved_indices_fail() {
        let mut link = LinkParams::new(CLK);
        // FI=7 is reserved.
        link.pps_sent(&[0xff, 0x10, 0x71, 0x00]).unwrap_err();
        assert!(link.baud().is_err());
        assert!(link.waiting_time().is_err());
    }

    #[test]
    fn waiting_time_formula() {
        let mut link = LinkParams::new(CLK);
        link.atr_received(ATR).unwrap();
        // Initial rate: 960 * 1 * 10 * 372 / clk.
        let expected = 960.0 * 10.0 * 372.0 / CLK as f64;
        let wt = link.waiting_time().unwrap().as_secs_f64();
        assert!((wt - expected).abs() < 1e-9);

        // After PPS the D factor cancels against the shorter etu, leaving
        // 960 * WI * F / clk.
        link.pps_sent(&[0xff, 0x10, 0x96, 0x79]).unwrap();
        let expected = 960.0 * 10.0 * 512.0 / CLK as f64;
        let wt = link.waiting_time().unwrap().as_secs_f64();
        assert!((wt - expected).abs() < 1e-9);
    }

    #[test]
    fn rate_reset() {
        let mut link = LinkParams::new(CLK);
        link.atr_received(ATR).unwrap();
        link.pps_sent(&[0xff, 0x10, 0x96, 0x79]).unwrap();
        link.reset_rate();
        assert_eq!(link.baud().unwrap(), 9_600);
    }
}
