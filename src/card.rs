//! Virtual-card T=0 engine: answers a modem's reset with an ATR, accepts an
//! optional PPS, and dispatches inbound APDUs to a pluggable application
//! while a heartbeat thread keeps the counterpart waiting.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    BUF_SIZE, Error, GET_RESPONSE_INS, HEADER_LEN, PPS_LEN, Result, SW_LEN,
    WXT_BYTE,
    classify::{Classification, Profile},
    link::LinkParams,
    port::{
        BytePort, DEFAULT_INTER_BYTE_TIMEOUT, POST_PPS_INTER_BYTE_TIMEOUT,
        PortConfig, TtyPort,
    },
    shared::to_hex,
};

/// ATR whose TA1 (0x01) advertises no rate above the initial one, so the
/// modem skips PPS.
pub const ATR_SLOW: &[u8] = &[
    0x3b, 0x9f, 0x01, 0x80, 0x1f, 0xc6, 0x80, 0x31, 0xe0, 0x73, 0xfe, 0x21,
    0x1b, 0x66, 0xd0, 0x02, 0x21, 0xab, 0x11, 0x18, 0x03, 0x15,
];

/// ATR offering a faster rate via TA1 = 0x96; modems will usually answer
/// with a PPS selecting it.
pub const ATR_OFFER_PPS: &[u8] = &[
    0x3b, 0x9f, 0x96, 0x80, 0x1f, 0xc6, 0x80, 0x31, 0xe0, 0x73, 0xfe, 0x21,
    0x1b, 0x66, 0xd0, 0x02, 0x21, 0xab, 0x11, 0x18, 0x03, 0x82,
];

/// The modem has long since powered us; waiting minutes for the next command
/// is normal.
pub const DEFAULT_CARD_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Consecutive failed sessions before the run loop gives up.
const MAX_RESTARTS: u32 = 5;

/// The application behind the virtual card: the part that owns reset
/// detection and actually answers APDUs.
pub trait CardApplication: Send {
    /// Block until the counterpart asserts reset (however the integration
    /// detects that), then return.
    fn wait_for_reset(&mut self) -> Result<()>;

    /// Compute the full response (data plus status word) for one command
    /// APDU. Runs on the dispatch thread; heartbeats cover its runtime.
    fn handle_apdu(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;
}

/// Emulates a card on a serial link, forwarding APDUs to `A`.
pub struct VirtualCard<P: BytePort + 'static, A: CardApplication> {
    port: Arc<P>,
    link: LinkParams,
    profile: &'static Profile,
    app: A,
    alive: Arc<AtomicBool>,
    get_response_cache: Option<Vec<u8>>,
    do_pps: bool,
}

/// Cloneable handle that stops a running [`VirtualCard`] from another
/// thread.
pub struct StopHandle<P: BytePort> {
    alive: Arc<AtomicBool>,
    port: Arc<P>,
}

impl<P: BytePort> Clone for StopHandle<P> {
    fn clone(&self) -> Self {
        Self {
            alive: Arc::clone(&self.alive),
            port: Arc::clone(&self.port),
        }
    }
}

impl<P: BytePort> StopHandle<P> {
    /// Clear the alive flag and interrupt a pending read; the run loop exits
    /// without restarting.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.port.cancel_read();
    }
}

impl<A: CardApplication> VirtualCard<TtyPort, A> {
    /// Open `device` for the virtual-card role: initial baud derived from
    /// `clock`, long read timeout, PPS offered on the first reset when
    /// `do_pps` is set.
    pub fn open(
        device: &str,
        clock: u32,
        timeout: Duration,
        do_pps: bool,
        app: A,
    ) -> Result<Self> {
        let link = LinkParams::new(clock);
        let port = TtyPort::open(
            device,
            &PortConfig {
                baud: link.baud()?,
                read_timeout: timeout,
                ..PortConfig::default()
            },
        )?;
        Ok(Self::with_port(port, clock, do_pps, app))
    }
}

impl<P: BytePort + 'static, A: CardApplication> VirtualCard<P, A> {
    pub fn with_port(port: P, clock: u32, do_pps: bool, app: A) -> Self {
        Self {
            port: Arc::new(port),
            link: LinkParams::new(clock),
            profile: Profile::standard(),
            app,
            alive: Arc::new(AtomicBool::new(false)),
            get_response_cache: None,
            do_pps,
        }
    }

    /// Switch the APDU classifier to another built-in profile.
    pub fn select_profile(&mut self, name: &str) -> Result<()> {
        self.profile = Profile::named(name)
            .ok_or_else(|| Error::Protocol(format!("unknown profile ({name})")))?;
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle<P> {
        StopHandle {
            alive: Arc::clone(&self.alive),
            port: Arc::clone(&self.port),
        }
    }

    /// Lifecycle loop: wait for reset, answer with ATR (and PPS on the first
    /// round), run the APDU dispatch loop. A failed session returns to
    /// waiting for the next reset until [`StopHandle::stop`] is called or
    /// [`MAX_RESTARTS`] consecutive sessions fail.
    pub fn run(&mut self) -> Result<()> {
        self.alive.store(true, Ordering::SeqCst);
        let mut first = true;
        let mut failures = 0u32;
        while self.alive.load(Ordering::SeqCst) {
            match self.run_session(self.do_pps && first) {
                Ok(()) => break,
                Err(e) => {
                    first = false;
                    if !self.alive.load(Ordering::SeqCst) {
                        break;
                    }
                    failures += 1;
                    if failures > MAX_RESTARTS {
                        error!("giving up after {failures} failed sessions: {e}");
                        self.alive.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                    warn!(
                        "session failed: {e}; waiting for the next reset \
                         ({failures}/{MAX_RESTARTS})"
                    );
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        info!("leaving apdu loop");
        Ok(())
    }

    /// Spawn [`VirtualCard::run`] on its own thread.
    pub fn spawn(
        mut self,
    ) -> Result<(StopHandle<P>, thread::JoinHandle<Result<()>>)>
    where
        P: 'static,
        A: 'static,
    {
        let handle = self.stop_handle();
        let join = thread::Builder::new()
            .name("virtual-card".into())
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    fn run_session(&mut self, do_pps: bool) -> Result<()> {
        // A fresh reset voids any negotiated rate and cached response.
        self.link.reset_rate();
        self.port.set_baud(self.link.baud()?)?;
        self.port.set_inter_byte_timeout(DEFAULT_INTER_BYTE_TIMEOUT);
        self.get_response_cache = None;

        self.app.wait_for_reset()?;
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send_atr(do_pps)?;
        self.run_apdu_loop()
    }

    /// Answer the reset: transmit our ATR and, when offering a faster rate,
    /// accept the modem's PPS by echoing it back and switching rate.
    fn send_atr(&mut self, do_pps: bool) -> Result<()> {
        self.port.reset_input()?;
        let atr = if do_pps { ATR_OFFER_PPS } else { ATR_SLOW };
        self.port.write(atr)?;
        self.link.atr_received(atr)?;
        if do_pps {
            let request = self.port.read_bytes(PPS_LEN)?;
            if request.len() < PPS_LEN {
                return Err(Error::Protocol(format!(
                    "truncated PPS request ({} bytes)",
                    request.len()
                )));
            }
            self.port.write(&request)?;
            let baud = self.link.pps_sent(&request)?;
            self.port.set_baud(baud)?;
            self.port
                .set_inter_byte_timeout(POST_PPS_INTER_BYTE_TIMEOUT);
        }
        Ok(())
    }

    fn run_apdu_loop(&mut self) -> Result<()> {
        if self.link.atr().is_none() {
            return Err(Error::NotInitialized(
                "ATR not sent yet, cannot enter the apdu loop",
            ));
        }
        while self.alive.load(Ordering::SeqCst) {
            let Some((apdu, class, expected)) = self.rx_apdu()? else {
                break;
            };
            self.dispatch(&apdu, class, expected)?;
        }
        Ok(())
    }

    /// Receive one command APDU. Returns the assembled APDU, its
    /// classification, and the expected response length including the status
    /// word; `None` when the read was cancelled by a stop request.
    fn rx_apdu(&mut self) -> Result<Option<(Vec<u8>, Classification, usize)>> {
        let header = self.port.read_bytes(HEADER_LEN)?;
        if header.is_empty() && !self.alive.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if header.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "truncated command header ({} bytes)",
                header.len()
            )));
        }
        debug!("header: {}", to_hex(&header));
        let hdr = [header[0], header[1], header[2], header[3], header[4]];
        let (ins, p3) = (hdr[1], hdr[4]);

        let class = self.profile.classify(&hdr);
        info!("{} -> case {}", class.name, class.case);

        let mut apdu = header;
        let mut le = SW_LEN;
        match class.case {
            // P3 == 0, no Lc/Le.
            1 => {}
            // P3 == Le.
            2 => le += if p3 == 0 { 256 } else { p3 as usize },
            // P3 == Lc: acknowledge with the procedure byte, then take the
            // command data. Case 4 fetches its response via GET RESPONSE.
            3 | 4 => {
                if p3 > 0 {
                    self.port.write(&[ins])?;
                    let data = self.port.read_bytes(p3 as usize)?;
                    if data.len() < p3 as usize {
                        return Err(Error::Protocol(format!(
                            "truncated command data ({}/{} bytes)",
                            data.len(),
                            p3
                        )));
                    }
                    debug!("data: {}", to_hex(&data));
                    apdu.extend_from_slice(&data);
                }
            }
            _ => {
                error!("cannot determine case for apdu ({})", to_hex(&apdu));
                // Unknown shape: take whatever else the modem pushes so the
                // line stays in sync, and promise only a status word back.
                let extra = self.port.read_trailing(BUF_SIZE)?;
                apdu.extend_from_slice(&extra);
            }
        }
        Ok(Some((apdu, class, le)))
    }

    /// Hand the APDU to the application and transmit a response, working
    /// around T=0's inability to return data and SW in one cycle: an
    /// over-long response is cached and announced with SW 61xx, an
    /// under-long one with 6Cxx, and a following GET RESPONSE replays the
    /// cache.
    fn dispatch(
        &mut self,
        apdu: &[u8],
        class: Classification,
        expected: usize,
    ) -> Result<()> {
        let ins = apdu[1];

        if ins == GET_RESPONSE_INS {
            if let Some(cached) = self.get_response_cache.clone() {
                info!("replaying cached response [{}]", cached.len());
                return self.tx_response(&cached, ins, class.case == 2);
            }
        } else {
            self.get_response_cache = None;
        }

        let response = self.handle_apdu_with_wxt(apdu)?;
        if response.len() == expected {
            self.tx_response(&response, ins, class.case == 2)
        } else if response.len() < SW_LEN {
            error!(
                "application response shorter than a status word ({} bytes)",
                response.len()
            );
            self.tx_response(&response, ins, class.case == 2)
        } else if response.len() > expected {
            // More data available than the modem asked for.
            let hint = (response.len() - SW_LEN) as u8;
            self.get_response_cache = Some(response);
            self.tx_response(&[0x61, hint], ins, false)
        } else {
            // Wrong Le; tell the modem the correct length.
            let hint = (response.len() - SW_LEN) as u8;
            self.get_response_cache = Some(response);
            self.tx_response(&[0x6c, hint], ins, false)
        }
    }

    /// Transmit a response frame. Case-2 responses that carry data get the
    /// procedure byte prepended; the modem expects that echo before data.
    fn tx_response(&self, response: &[u8], ins: u8, case_2: bool) -> Result<()> {
        if case_2 && response.len() > SW_LEN {
            let mut framed = Vec::with_capacity(response.len() + 1);
            framed.push(ins);
            framed.extend_from_slice(response);
            self.port.write(&framed)
        } else {
            self.port.write(response)
        }
    }

    /// Run the application handler with the WXT heartbeat covering it. The
    /// ticker is stopped (and joined) before the response goes out, so a
    /// NULL can never land inside the response frame.
    fn handle_apdu_with_wxt(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        let period = self.link.waiting_time()? / 2;
        let ticker = WxtTicker::start(Arc::clone(&self.port), period);
        info!("forward apdu [{}]: {}", apdu.len(), to_hex(apdu));
        let result = self.app.handle_apdu(apdu);
        ticker.stop();
        match &result {
            Ok(response) => info!("application response: {}", to_hex(response)),
            Err(e) => error!("apdu handler failed: {e}"),
        }
        result
    }
}

/// Cancellable heartbeat: writes one NULL byte every `period` until stopped.
/// The stop event is observed during the sleep, not after it.
struct WxtTicker {
    stop_tx: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WxtTicker {
    fn start<P: BytePort + 'static>(port: Arc<P>, period: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let join = thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        // A failed heartbeat must not take down the dispatch.
                        match port.write(&[WXT_BYTE]) {
                            Ok(()) => info!("half waiting time exceeded, wxt sent"),
                            Err(e) => warn!("wxt write failed: {e}"),
                        }
                    }
                    _ => break,
                }
            }
        });
        Self {
            stop_tx,
            join: Some(join),
        }
    }

    /// Signal the ticker and wait for it to finish, guaranteeing no NULL is
    /// written after this returns.
    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WxtTicker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
