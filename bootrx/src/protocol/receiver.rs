//! Transfer receiver: the bootloader's transport state machine.
//!
//! A single-threaded, run-to-completion polling loop built from an explicit
//! state-transition function. Each [`step`] performs one bounded action
//! (one poll, one frame, one trailer) and never blocks longer than one
//! timeout interval; [`run`] loops until the machine asks for a device
//! reset, which is the only terminal exit.
//!
//! [`step`]: Receiver::step
//! [`run`]: Receiver::run

use crate::config::{BootConfig, ConfirmPolicy};
use crate::crypto::CryptoService;
use crate::error::{Error, FaultClass, Result};
use crate::flash::{self, FlashDriver, StagedFlash};
use crate::image::{self, ContentFlags, ImageProperties, ParserContext};
use crate::port::TransferPort;
use crate::protocol::xmodem::{Accept, DATA_SIZE, FRAME_SIZE, PacketCodec, control};
use crate::timer::DelayTimer;
use log::{debug, info, warn};
use std::time::Duration;

const TRANSFER_INIT_STR: &[u8] = b"\r\nbegin upload\r\n";
const TRANSFER_COMPLETE_STR: &[u8] = b"\r\nSerial upload complete\r\n";
const TRANSFER_ABORTED_STR: &[u8] = b"\r\nSerial upload aborted\r\n";
const BLOCK_ERROR_STR: &[u8] = b"\r\nblock error 0x";
const FILE_ERROR_STR: &[u8] = b"\r\nfile error 0x";
const BOOT_ERROR_STR: &[u8] = b"\r\nFailed to boot\r\n";
const CONFIRM_ERASE_STR: &[u8] = b"\r\nAre you sure? (y/n) > ";
const ERASE_DONE_STR: &[u8] = b"\r\nstorage erased\r\n";
const ERASE_FAILED_STR: &[u8] = b"\r\nerase failed\r\n";

/// Protocol states of the receiver.
///
/// There is no terminal state in normal operation: `Complete` and `Boot`
/// always lead back to `Menu`/`Idle`. The true terminal exit is a device
/// reset, surfaced as the [`ResetReason`] returned by [`Receiver::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Print the command menu.
    Menu,
    /// Poll for a single command byte.
    Idle,
    /// Re-arm parser state for a fresh transfer.
    InitTransfer,
    /// Send ready bytes until the sender starts transmitting.
    WaitForData,
    /// Receive and parse transfer frames.
    ReceiveData,
    /// Report the transfer outcome.
    Complete,
    /// Activate verified content.
    Boot,
    /// Arm the two-step erase confirmation.
    ConfirmErase,
    /// Erase storage, preserving the configured token ranges.
    Erase,
}

/// Why the receiver wants the device reset (the terminal exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// No input arrived within the idle-timeout budget.
    IdleTimeout,
    /// Jump into the verified application image.
    EnterApplication,
    /// A loader upgrade was committed.
    LoaderUpgrade,
    /// A sub-processor upgrade was committed.
    SubprocUpgrade,
}

/// What one received frame amounted to.
enum FrameEvent {
    /// A fresh in-order data frame.
    Data([u8; DATA_SIZE]),
    /// Resend of the last acknowledged frame.
    Duplicate,
    /// End of transmission.
    Eot,
    /// The sender cancelled the transfer.
    PeerCancel,
}

/// The transfer receiver.
///
/// Generic over its four external collaborators: the transport driver `P`,
/// the flash driver `F`, the countdown timer `T` and the crypto capability
/// `C`. All transfer state is owned here and lent to the parser one frame
/// at a time.
pub struct Receiver<P, F, T, C>
where
    P: TransferPort,
    F: FlashDriver,
    T: DelayTimer,
    C: CryptoService,
{
    port: P,
    flash: F,
    timer: T,
    crypto: C,
    config: BootConfig,
    state: State,
    codec: PacketCodec,
    props: ImageProperties,
    ctx: ParserContext,
    staged: StagedFlash,
    pending_confirm: bool,
    idle_budget: Option<u32>,
    packet_budget: u32,
    fault: Option<Error>,
    transfer_done: bool,
}

impl<P, F, T, C> Receiver<P, F, T, C>
where
    P: TransferPort,
    F: FlashDriver,
    T: DelayTimer,
    C: CryptoService,
{
    /// Create a receiver in the `Menu` state.
    pub fn new(port: P, flash: F, timer: T, crypto: C, config: BootConfig) -> Result<Self> {
        config.validate()?;
        let staged = StagedFlash::new(&config);
        let idle_budget = config.idle_timeout;
        let packet_budget = config.packet_retry_budget;
        Ok(Self {
            port,
            flash,
            timer,
            crypto,
            config,
            state: State::Menu,
            codec: PacketCodec::new(),
            props: ImageProperties::default(),
            ctx: ParserContext::new(),
            staged,
            pending_confirm: false,
            idle_budget,
            packet_budget,
            fault: None,
            transfer_done: false,
        })
    }

    /// Current protocol state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Properties accumulated by the most recent transfer.
    pub fn props(&self) -> &ImageProperties {
        &self.props
    }

    /// The flash driver.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Consume the receiver, returning the port and flash driver.
    pub fn into_parts(self) -> (P, F) {
        (self.port, self.flash)
    }

    /// Run until the machine requests a device reset.
    pub fn run(&mut self) -> Result<ResetReason> {
        loop {
            if let Some(reason) = self.step()? {
                info!("terminal exit: {reason:?}");
                return Ok(reason);
            }
        }
    }

    /// Perform one bounded state-machine action.
    ///
    /// Returns `Some(reason)` when the device should reset.
    pub fn step(&mut self) -> Result<Option<ResetReason>> {
        if crate::interrupt_requested() {
            return Err(Error::Interrupted);
        }
        match self.state {
            State::Menu => self.on_menu(),
            State::Idle => self.on_idle(),
            State::InitTransfer => self.on_init_transfer(),
            State::WaitForData => self.on_wait_for_data(),
            State::ReceiveData => self.on_receive_data(),
            State::Complete => self.on_complete(),
            State::Boot => self.on_boot(),
            State::ConfirmErase => self.on_confirm_erase(),
            State::Erase => self.on_erase(),
        }
    }

    fn on_menu(&mut self) -> Result<Option<ResetReason>> {
        let v = self.config.loader_version;
        let banner = format!(
            "\r\nbootrx loader v{}.{:02}.{:02}\r\n\
             1. upload image\r\n\
             2. run\r\n\
             3. info\r\n\
             4. erase storage\r\n\
             > ",
            v >> 24,
            (v >> 16) & 0xFF,
            v & 0xFFFF
        );
        self.port.send(banner.as_bytes())?;
        debug!("menu");
        self.state = State::Idle;
        Ok(None)
    }

    fn on_idle(&mut self) -> Result<Option<ResetReason>> {
        let mut byte = [0u8; 1];
        let n = self.port.recv(&mut byte, Duration::from_millis(1000))?;

        if n == 0 {
            if let Some(budget) = self.idle_budget.as_mut() {
                *budget -= 1;
                if *budget == 0 {
                    return Ok(Some(ResetReason::IdleTimeout));
                }
            }
            return Ok(None);
        }

        // Any input re-arms both budgets.
        self.idle_budget = self.config.idle_timeout;
        self.packet_budget = self.config.packet_retry_budget;

        match byte[0] {
            b'1' => {
                self.clear_pending_confirm();
                self.state = State::InitTransfer;
            },
            b'2' => {
                self.clear_pending_confirm();
                self.state = State::Boot;
            },
            b'4' => {
                self.port.send(CONFIRM_ERASE_STR)?;
                self.state = State::ConfirmErase;
            },
            b'y' if self.pending_confirm => {
                self.state = State::Erase;
            },
            _ => {
                // '3' and anything unrecognized re-shows the menu.
                self.clear_pending_confirm();
                self.state = State::Menu;
            },
        }
        Ok(None)
    }

    fn clear_pending_confirm(&mut self) {
        if self.config.confirm_policy == ConfirmPolicy::ClearOnOtherCommand {
            self.pending_confirm = false;
        }
    }

    fn on_init_transfer(&mut self) -> Result<Option<ResetReason>> {
        self.port.send(TRANSFER_INIT_STR)?;

        self.props.reset();
        self.ctx.reset();
        self.crypto.reset();
        self.staged = StagedFlash::new(&self.config);
        self.fault = None;
        self.transfer_done = false;

        // Give premature input a moment to arrive, then discard it so stale
        // bytes cannot corrupt the new transfer.
        self.timer.sleep(5);
        if self.port.rx_available()? > 0 {
            self.port.discard_input()?;
        }

        self.codec.reset();
        self.state = State::WaitForData;
        Ok(None)
    }

    fn on_wait_for_data(&mut self) -> Result<Option<ResetReason>> {
        self.send_response(control::C)?;
        if self.poll_rx(1000)? {
            self.state = State::ReceiveData;
        } else {
            self.packet_budget -= 1;
            if self.packet_budget == 0 {
                debug!("no sender response, cancelling");
                self.send_response(control::CAN)?;
                self.state = State::Menu;
            }
        }
        Ok(None)
    }

    fn on_receive_data(&mut self) -> Result<Option<ResetReason>> {
        match self.receive_frame() {
            Ok(FrameEvent::Data(payload)) => {
                let parsed = image::feed(
                    &mut self.ctx,
                    &mut self.props,
                    &mut self.crypto,
                    &mut self.staged,
                    &mut self.flash,
                    &payload,
                );
                match parsed {
                    Ok(_) => self.send_response(control::ACK)?,
                    Err(e) => {
                        // Parse failures are never retried within a transfer.
                        warn!("parse failed: {e}");
                        self.fault = Some(e);
                        self.send_response(control::CAN)?;
                        self.state = State::Complete;
                    },
                }
            },
            Ok(FrameEvent::Duplicate) => {
                // Idempotent resend: acknowledge without reprocessing.
                self.send_response(control::ACK)?;
            },
            Ok(FrameEvent::Eot) => {
                self.transfer_done = true;
                if self.props.completed && self.props.verified {
                    self.send_response(control::ACK)?;
                } else {
                    debug!("verification failed at end of transfer");
                    if self.fault.is_none() {
                        self.fault = Some(self.ctx.take_verify_fault().unwrap_or_else(|| {
                            Error::Malformed("container incomplete at end of transfer".into())
                        }));
                    }
                    self.send_response(control::CAN)?;
                }
                self.state = State::Complete;
            },
            Ok(FrameEvent::PeerCancel) => {
                self.fault = Some(Error::Cancelled);
                self.state = State::Complete;
            },
            Err(e) if e.is_retryable() => {
                self.packet_budget = self.packet_budget.saturating_sub(1);
                if self.packet_budget == 0 {
                    warn!("retry budget exhausted: {e}");
                    self.fault = Some(e);
                    self.send_response(control::CAN)?;
                    self.state = State::Complete;
                } else {
                    debug!("recoverable frame fault: {e}");
                    self.send_response(control::NAK)?;
                }
            },
            Err(e) => {
                warn!("fatal frame fault: {e}");
                self.fault = Some(e);
                self.send_response(control::CAN)?;
                self.state = State::Complete;
            },
        }
        Ok(None)
    }

    fn on_complete(&mut self) -> Result<Option<ResetReason>> {
        self.port.discard_input()?;
        self.timer.sleep(10);

        let success = self.transfer_done
            && self.fault.is_none()
            && self.props.completed
            && self.props.verified;
        if success {
            info!("transfer complete");
            self.port.send(TRANSFER_COMPLETE_STR)?;
        } else {
            self.port.send(TRANSFER_ABORTED_STR)?;
            let (trailer, code) = match &self.fault {
                Some(e) if e.class() == FaultClass::Transport => (BLOCK_ERROR_STR, e.status_code()),
                Some(e) => (FILE_ERROR_STR, e.status_code()),
                None => (FILE_ERROR_STR, 0x00),
            };
            self.port.send(trailer)?;
            self.port.send(&[
                nibble_to_hex(code >> 4),
                nibble_to_hex(code & 0x0F),
                b'\r',
                b'\n',
            ])?;
        }
        self.fault = None;
        self.state = State::Menu;
        Ok(None)
    }

    fn on_boot(&mut self) -> Result<Option<ResetReason>> {
        self.state = State::Menu;

        if !(self.props.completed && self.props.verified) {
            // Never commit or activate anything unverified.
            warn!("boot refused: image not verified");
            self.port.send(BOOT_ERROR_STR)?;
            return Ok(None);
        }

        if self.props.contents.contains(ContentFlags::SUBPROC) {
            if self.props.subproc_version > self.config.subproc_version {
                match flash::commit_staged(
                    &mut self.flash,
                    self.config.upgrade_region,
                    self.config.subproc_region,
                    self.props.subproc_upgrade_size,
                    self.config.page_size,
                ) {
                    Ok(()) => return Ok(Some(ResetReason::SubprocUpgrade)),
                    Err(e) => warn!("sub-processor commit failed: {e}"),
                }
            } else {
                warn!(
                    "sub-processor upgrade {:#010x} not newer than {:#010x}",
                    self.props.subproc_version, self.config.subproc_version
                );
            }
            self.port.send(BOOT_ERROR_STR)?;
            return Ok(None);
        }

        if self.props.contents.contains(ContentFlags::LOADER) {
            if self.props.loader_version > self.config.loader_version {
                match flash::commit_staged(
                    &mut self.flash,
                    self.config.upgrade_region,
                    self.config.loader_region,
                    self.props.loader_upgrade_size,
                    self.config.page_size,
                ) {
                    Ok(()) => return Ok(Some(ResetReason::LoaderUpgrade)),
                    Err(e) => warn!("loader commit failed: {e}"),
                }
            } else {
                warn!(
                    "loader upgrade {:#010x} not newer than {:#010x}",
                    self.props.loader_version, self.config.loader_version
                );
            }
            self.port.send(BOOT_ERROR_STR)?;
            return Ok(None);
        }

        if self.props.contents.contains(ContentFlags::APPLICATION) {
            // Nothing staged to commit: enter the verified image.
            return Ok(Some(ResetReason::EnterApplication));
        }

        // Verified but empty image.
        warn!("boot refused: image carries no content");
        self.port.send(BOOT_ERROR_STR)?;
        Ok(None)
    }

    fn on_confirm_erase(&mut self) -> Result<Option<ResetReason>> {
        self.pending_confirm = true;
        self.state = State::Idle;
        Ok(None)
    }

    fn on_erase(&mut self) -> Result<Option<ResetReason>> {
        match flash::erase_storage(&mut self.flash, &self.config.erase, self.config.page_size) {
            Ok(()) => {
                info!("storage erased");
                self.port.send(ERASE_DONE_STR)?;
            },
            Err(e) => {
                warn!("erase failed: {e}");
                self.port.send(ERASE_FAILED_STR)?;
            },
        }
        self.pending_confirm = false;
        self.state = State::Menu;
        Ok(None)
    }

    /// Wait up to `ms` for any inbound byte, polling the countdown timer.
    fn poll_rx(&mut self, ms: u32) -> Result<bool> {
        self.timer.start(ms);
        loop {
            if self.port.rx_available()? > 0 {
                return Ok(true);
            }
            if self.timer.expired() {
                return Ok(false);
            }
            self.timer.sleep(1);
        }
    }

    /// Send a protocol response byte; cancel goes out three times to defeat
    /// transmission noise.
    fn send_response(&mut self, byte: u8) -> Result<()> {
        if byte == control::CAN {
            self.port.send(&[byte, byte, byte])
        } else {
            self.port.send_byte(byte)
        }
    }

    /// Read one frame: single control byte fast path, or a full data frame
    /// with a longer timeout for the body.
    fn receive_frame(&mut self) -> Result<FrameEvent> {
        if !self.poll_rx(3000)? {
            return Err(Error::Timeout("no frame within interval".into()));
        }

        let mut header = [0u8; 1];
        let n = self.port.recv(&mut header, Duration::from_millis(1000))?;
        if n == 0 {
            return Err(Error::Timeout("frame header read timed out".into()));
        }

        match header[0] {
            control::SOH => {
                let mut frame = [0u8; FRAME_SIZE];
                frame[0] = control::SOH;
                let got = self
                    .port
                    .recv(&mut frame[1..], Duration::from_millis(3000))?;
                if got != FRAME_SIZE - 1 {
                    return Err(Error::ShortRead {
                        expected: FRAME_SIZE - 1,
                        got,
                    });
                }
                match self.codec.accept(&frame)? {
                    Accept::Fresh => {
                        let mut payload = [0u8; DATA_SIZE];
                        payload.copy_from_slice(&frame[3..3 + DATA_SIZE]);
                        Ok(FrameEvent::Data(payload))
                    },
                    Accept::Duplicate => Ok(FrameEvent::Duplicate),
                }
            },
            control::EOT => Ok(FrameEvent::Eot),
            control::CAN => Ok(FrameEvent::PeerCancel),
            other => Err(Error::BadFrameHeader(other)),
        }
    }
}

fn nibble_to_hex(nibble: u8) -> u8 {
    if nibble > 9 {
        nibble - 10 + b'A'
    } else {
        nibble + b'0'
    }
}
