//! Reader-role T=0 engine: drives a physical card behind a serial reader
//! through reset, ATR capture, PPS negotiation and APDU exchange.

use std::{
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info};

use crate::{
    ATR_BYTE, BUF_SIZE, Error, PPS_LEN, Result, SW_LEN, WXT_BYTE,
    classify::Profile,
    link::LinkParams,
    port::{BytePort, POST_PPS_INTER_BYTE_TIMEOUT, PortConfig, TtyPort},
    shared::{from_hex, to_hex},
};

/// How long the reset line is held asserted.
const RESET_HOLD: Duration = Duration::from_millis(100);
/// Card poll cadence in [`Reader::wait_for_card`].
const CARD_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Half-inserted cards produce garbage; tolerate this many protocol errors
/// in a row while polling before giving up.
const MAX_POLL_PROTOCOL_ERRORS: u32 = 2;

/// Which modem control line resets the card, and at what level. Parsed from
/// a two-character spec: `+` drives level 0, `-` drives level 1, the suffix
/// names the line (`"-rts"`, `"+dtr"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetPin {
    line: ResetLine,
    /// Line level that asserts reset.
    active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResetLine {
    Rts,
    Dtr,
}

impl ResetPin {
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || Error::InvalidResetPin(spec.to_string());
        let (polarity, line) = spec.split_at_checked(1).ok_or_else(bad)?;
        let active = match polarity {
            "+" => false,
            "-" => true,
            _ => return Err(bad()),
        };
        let line = match line {
            "rts" => ResetLine::Rts,
            "dtr" => ResetLine::Dtr,
            _ => return Err(bad()),
        };
        Ok(Self { line, active })
    }

    fn apply<P: BytePort>(&self, port: &P, asserted: bool) -> Result<()> {
        let level = if asserted { self.active } else { !self.active };
        match self.line {
            ResetLine::Rts => port.set_rts(level),
            ResetLine::Dtr => port.set_dtr(level),
        }
    }
}

/// A serial smart-card reader speaking T=0.
pub struct Reader<P: BytePort> {
    port: P,
    link: LinkParams,
    profile: &'static Profile,
    reset_pin: ResetPin,
}

impl Reader<TtyPort> {
    /// Open `device` at `baudrate` (the initial, pre-PPS rate) with the
    /// given reset pin spec, e.g. `"-rts"`.
    pub fn open(device: &str, baudrate: u32, reset_pin: &str) -> Result<Self> {
        let reset_pin = ResetPin::parse(reset_pin)?;
        let port = TtyPort::open(
            device,
            &PortConfig {
                baud: baudrate,
                ..PortConfig::default()
            },
        )?;
        Ok(Self::with_port(
            port,
            LinkParams::clock_for_baud(baudrate),
            reset_pin,
        ))
    }
}

impl<P: BytePort> Reader<P> {
    /// Build a reader on an already opened port. `clk` is the card clock in
    /// Hz; the classifier starts on the default profile.
    pub fn with_port(port: P, clk: u32, reset_pin: ResetPin) -> Self {
        Self {
            port,
            link: LinkParams::new(clk),
            profile: Profile::standard(),
            reset_pin,
        }
    }

    /// Switch the APDU classifier to another built-in profile.
    pub fn select_profile(&mut self, name: &str) -> Result<()> {
        self.profile = Profile::named(name)
            .ok_or_else(|| Error::Protocol(format!("unknown profile ({name})")))?;
        Ok(())
    }

    /// The ATR captured by the last successful reset.
    pub fn atr(&self) -> Option<&[u8]> {
        self.link.atr()
    }

    /// Reset the card and capture its ATR, then negotiate the bit rate when
    /// `do_pps` is set.
    pub fn connect(&mut self, do_pps: bool) -> Result<()> {
        self.reset_card()?;
        if do_pps {
            self.send_pps()?;
        }
        Ok(())
    }

    /// Pulse the reset line and collect the ATR.
    ///
    /// An empty line is [`Error::NoCard`]; a TS other than 0x3b (direct
    /// convention) is [`Error::Protocol`]. Repeated TS bytes are consumed as
    /// line noise before T0 is read.
    pub fn reset_card(&mut self) -> Result<()> {
        // Any previous negotiation is void once reset is asserted.
        self.link.reset_rate();
        self.port.set_baud(self.link.baud()?)?;

        self.reset_pin.apply(&self.port, true)?;
        thread::sleep(RESET_HOLD);
        self.port.reset_input()?;
        self.reset_pin.apply(&self.port, false)?;

        let Some(ts) = self.port.read_byte()? else {
            return Err(Error::NoCard);
        };
        if ts != ATR_BYTE {
            return Err(Error::Protocol(format!(
                "bad TS {ts:#04x}, expected direct convention ({ATR_BYTE:#04x})"
            )));
        }
        debug!("TS: {ts:#04x} direct convention");

        let mut b = ts;
        while b == ATR_BYTE {
            b = self.port.read_byte()?.ok_or_else(|| {
                Error::Protocol("ATR ends before the format byte T0".into())
            })?;
        }
        let t0 = b;
        debug!("T0: {t0:#04x}");
        let mut atr = vec![ATR_BYTE, t0];

        // TA1/TB1/TC1/TD1, announced by the high nibble of T0.
        for i in 0..4 {
            if t0 & (0x10 << i) != 0 {
                let b = self.port.read_byte()?.ok_or_else(|| {
                    Error::Protocol("ATR truncated in the interface bytes".into())
                })?;
                debug!("T{}1 = {b:#04x}", char::from(b'A' + i));
                atr.push(b);
            }
        }

        for _ in 0..(t0 & 0x0f) {
            let b = self.port.read_byte()?.ok_or_else(|| {
                Error::Protocol("ATR truncated in the historical bytes".into())
            })?;
            debug!("historical = {b:#04x}");
            atr.push(b);
        }

        // TCK and anything else the card appends.
        atr.extend(self.port.read_trailing(BUF_SIZE)?);

        self.link.atr_received(&atr)?;
        info!("ATR: {}", to_hex(&atr));
        Ok(())
    }

    /// Propose the rate from the card's own TA1 and apply it once the card
    /// echoes the request back.
    pub fn send_pps(&mut self) -> Result<()> {
        let request = self.link.pps_proposal()?;
        // The modem echo of the request is drained by the write itself; what
        // follows on the line is the card's answer.
        self.port.write(&request)?;
        let response = self.port.read_bytes(PPS_LEN)?;
        if response != request {
            return Err(Error::Protocol(format!(
                "bad PPS response (expected {}, got {})",
                to_hex(&request),
                to_hex(&response)
            )));
        }
        let baud = self.link.pps_sent(&request)?;
        self.port.set_baud(baud)?;
        self.port
            .set_inter_byte_timeout(POST_PPS_INTER_BYTE_TIMEOUT);
        info!("PPS: {}", to_hex(&response));
        Ok(())
    }

    /// Poll for a card until one resets cleanly. With `new_card_only`, an
    /// already inserted card is ignored and the call waits for a removal
    /// followed by a new insertion.
    pub fn wait_for_card(
        &mut self,
        timeout: Option<Duration>,
        new_card_only: bool,
    ) -> Result<()> {
        let mut existing = false;
        match self.reset_card() {
            Ok(()) => {
                if !new_card_only {
                    return Ok(());
                }
                existing = true;
            }
            Err(Error::NoCard) => {}
            Err(e) => return Err(e),
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut protocol_errors = 0u32;
        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::NoCard);
                }
            }
            thread::sleep(CARD_POLL_INTERVAL);
            match self.reset_card() {
                Ok(()) => {
                    if !existing {
                        return Ok(());
                    }
                    protocol_errors = 0;
                }
                Err(Error::NoCard) => {
                    existing = false;
                    protocol_errors = 0;
                }
                Err(Error::Protocol(msg)) => {
                    if existing {
                        existing = false;
                    } else {
                        protocol_errors += 1;
                        if protocol_errors > MAX_POLL_PROTOCOL_ERRORS {
                            return Err(Error::Protocol(msg));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exchange one APDU and split the response into data and status word.
    pub fn send_apdu_raw(&mut self, pdu: &[u8]) -> Result<(Vec<u8>, [u8; SW_LEN])> {
        let response = self.tx_apdu(pdu)?;
        if response.len() < SW_LEN {
            return Err(Error::Protocol(format!(
                "short card response ({} bytes)",
                response.len()
            )));
        }
        let (data, sw) = response.split_at(response.len() - SW_LEN);
        Ok((data.to_vec(), [sw[0], sw[1]]))
    }

    /// [`Reader::send_apdu_raw`] over hex strings, for callers holding APDUs in
    /// text form.
    pub fn send_apdu_hex(&mut self, pdu: &str) -> Result<(String, String)> {
        let (data, sw) = self.send_apdu_raw(&from_hex(pdu)?)?;
        Ok((to_hex(&data), to_hex(&sw)))
    }

    /// Transmit a command APDU per its classified case and collect the full
    /// response frame (data plus SW).
    fn tx_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        let [cla, ins, p1, p2, p3, data @ ..] = apdu else {
            return Err(Error::Protocol(format!(
                "APDU shorter than a T=0 header ({} bytes)",
                apdu.len()
            )));
        };
        let header = [*cla, *ins, *p1, *p2, *p3];
        self.port.write(&header)?;
        debug!("header: {}", to_hex(&header));

        let class = self.profile.classify(&header);
        info!("{} -> case {}", class.name, class.case);

        let ins = *ins;
        let mut le = SW_LEN;
        match class.case {
            // P3 == 0, no Lc/Le: only the status word comes back.
            1 => self.rx_card_response(le, Some(ins)),
            // P3 == Le.
            2 => {
                le += if *p3 == 0 { 256 } else { *p3 as usize };
                self.rx_card_response(le, Some(ins))
            }
            // P3 == Lc; case 4 fetches its response via GET RESPONSE later.
            3 | 4 => {
                let proc = self.rx_card_response(1, None)?;
                let Some(&first) = proc.first() else {
                    return Err(Error::Protocol(
                        "no procedure byte after the command header".into(),
                    ));
                };
                if first != ins {
                    // SW1 instead of the procedure byte: the card aborted
                    // before wanting any data.
                    let sw2 = self.rx_card_response(1, None)?;
                    return Ok([proc, sw2].concat());
                }
                if *p3 > 0 && !data.is_empty() {
                    self.port.write(data)?;
                    debug!("data: {}", to_hex(data));
                }
                self.rx_card_response(le, Some(ins))
            }
            _ => {
                error!("cannot determine case for apdu ({})", to_hex(apdu));
                self.rx_card_response(le, Some(ins))
            }
        }
    }

    /// Read an `n`-byte response frame. Leading NULL (waiting-time
    /// extension) bytes and repeats of the procedure byte are discarded;
    /// the first other byte starts the frame, whose remainder is bounded by
    /// the inter-byte timeout.
    fn rx_card_response(&mut self, n: usize, proc: Option<u8>) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        loop {
            let Some(b) = self.port.read_byte()? else {
                return Ok(Vec::new());
            };
            if b == WXT_BYTE {
                info!("received wxt");
                continue;
            }
            if Some(b) == proc {
                debug!("received procedure byte repeat");
                continue;
            }
            let mut frame = vec![b];
            frame.extend(self.port.read_bytes(n - 1)?);
            return Ok(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::script::ScriptPort;

    const ATR: &[u8] = &[
        0x3b, 0x9f, 0x96, 0x80, 0x1f, 0xc6, 0x80, 0x31, 0xe0, 0x73, 0xfe, 0x21,
        0x1b, 0x66, 0xd0, 0x02, 0x21, 0xab, 0x11, 0x18, 0x03, 0x82,
    ];

    fn reader_on(port: ScriptPort) -> Reader<ScriptPort> {
        Reader::with_port(port, 3_571_200, ResetPin::parse("-rts").unwrap())
    }

    #[test]
    fn reset_pin_parsing() {
        assert!(ResetPin::parse("-rts").is_ok());
        assert!(ResetPin::parse("+dtr").is_ok());
        for bad in ["rts", "-cts", "*dtr", "", "-", "-dtrx"] {
            assert!(
                matches!(ResetPin::parse(bad), Err(Error::InvalidResetPin(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn reset_parses_atr() {
        let port = ScriptPort::new();
        port.feed(ATR);
        let mut reader = reader_on(port);
        reader.reset_card().unwrap();
        assert_eq!(reader.atr().unwrap(), ATR);
        // Scenario: the stored TA1 feeds the PPS proposal.
        assert_eq!(reader.link.pps_proposal().unwrap(), [0xff, 0x10, 0x96, 0x79]);
    }

    #[test]
    fn reset_tolerates_repeated_ts() {
        let port = ScriptPort::new();
        port.feed(&[0x3b, 0x3b]);
        port.feed(ATR);
        let mut reader = reader_on(port);
        reader.reset_card().unwrap();
        assert_eq!(reader.atr().unwrap(), ATR);
    }

    #[test]
    fn reset_without_card() {
        let mut reader = reader_on(ScriptPort::new());
        assert!(matches!(reader.reset_card(), Err(Error::NoCard)));
    }

    #[test]
    fn reset_rejects_bad_ts() {
        let port = ScriptPort::new();
        port.feed(&[0x3f, 0x20, 0x00]);
        let mut reader = reader_on(port);
        assert!(matches!(reader.reset_card(), Err(Error::Protocol(_))));
    }

    #[test]
    fn reset_repeatability() {
        let port = ScriptPort::new();
        port.feed(ATR);
        let mut reader = reader_on(port);
        reader.reset_card().unwrap();
        let first = reader.atr().unwrap().to_vec();
        reader.port.feed(ATR);
        reader.reset_card().unwrap();
        assert_eq!(reader.atr().unwrap(), first);
    }

    #[test]
    fn pps_exchange() {
        let port = ScriptPort::new();
        port.feed(ATR);
        // The card accepts by repeating the request.
        port.feed(&[0xff, 0x10, 0x96, 0x79]);
        let mut reader = reader_on(port);
        reader.connect(true).unwrap();
        let writes = reader.port.writes();
        assert_eq!(writes, vec![vec![0xff, 0x10, 0x96, 0x79]]);
    }

    #[test]
    fn pps_mismatch_is_protocol_error() {
        let port = ScriptPort::new();
        port.feed(ATR);
        port.feed(&[0xff, 0x10, 0x11, 0xfe]);
        let mut reader = reader_on(port);
        assert!(matches!(reader.connect(true), Err(Error::Protocol(_))));
    }

    #[test]
    fn case_1_exchange() {
        let port = ScriptPort::new();
        port.feed(ATR);
        port.feed(&[0x90, 0x00]);
        let mut reader = reader_on(port);
        reader.connect(false).unwrap();
        // GSM INVALIDATE: case 1.
        let (data, sw) = reader.send_apdu_raw(&[0xa0, 0x04, 0x00, 0x00, 0x00]).unwrap();
        assert!(data.is_empty());
        assert_eq!(sw, [0x90, 0x00]);
    }

    #[test]
    fn case_2_filters_nulls_and_proc_bytes() {
        let port = ScriptPort::new();
        port.feed(ATR);
        // WXT, procedure repeat, then 4 data bytes and the SW.
        port.feed(&[0x60, 0xb0, 0xde, 0xad, 0xbe, 0xef, 0x90, 0x00]);
        let mut reader = reader_on(port);
        reader.connect(false).unwrap();
        let (data, sw) = reader.send_apdu_raw(&[0xa0, 0xb0, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(data, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(sw, [0x90, 0x00]);
        // The header went out as one frame; no data phase for case 2.
        assert_eq!(reader.port.writes(), vec![vec![0xa0, 0xb0, 0x00, 0x00, 0x04]]);
    }

    #[test]
    fn case_3_sends_data_after_proc() {
        let port = ScriptPort::new();
        port.feed(ATR);
        // Procedure byte (INS), then the SW.
        port.feed(&[0xd6, 0x90, 0x00]);
        let mut reader = reader_on(port);
        reader.connect(false).unwrap();
        let (data, sw) = reader
            .send_apdu_raw(&[0xa0, 0xd6, 0x00, 0x00, 0x02, 0xca, 0xfe])
            .unwrap();
        assert!(data.is_empty());
        assert_eq!(sw, [0x90, 0x00]);
        assert_eq!(
            reader.port.writes(),
            vec![vec![0xa0, 0xd6, 0x00, 0x00, 0x02], vec![0xca, 0xfe]]
        );
    }

    #[test]
    fn case_3_card_abort_short_circuit() {
        let port = ScriptPort::new();
        port.feed(ATR);
        // SW1 instead of the procedure byte: no data phase.
        port.feed(&[0x6a, 0x82]);
        let mut reader = reader_on(port);
        reader.connect(false).unwrap();
        let (data, sw) = reader
            .send_apdu_raw(&[0xa0, 0xd6, 0x00, 0x00, 0x02, 0xca, 0xfe])
            .unwrap();
        assert!(data.is_empty());
        assert_eq!(sw, [0x6a, 0x82]);
        // Only the header was written.
        assert_eq!(reader.port.writes().len(), 1);
    }

    #[test]
    fn hex_entry_point() {
        let port = ScriptPort::new();
        port.feed(ATR);
        port.feed(&[0xab, 0xcd, 0x90, 0x00]);
        let mut reader = reader_on(port);
        reader.connect(false).unwrap();
        let (data, sw) = reader.send_apdu_hex("a0 b0 00 00 02").unwrap();
        assert_eq!(data, "abcd");
        assert_eq!(sw, "9000");
    }
}
