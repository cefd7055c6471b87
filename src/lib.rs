//! PicoRV32 ISP Serial Bootloader.
//!
//! Flashes a Verilog hex image through the resident bootloader: handshake,
//! then per 4 KiB sector an erase followed by write / program of each 256 byte
//! page, then a reset.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod image;
pub mod planner;
pub mod protocol;

pub use image::{ImageError, ProgramImage, FLASH_BASE};
use planner::Layout;
pub use protocol::{Command, Phase};
use protocol::*;

/// Duplex byte channel to the bootloader
pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {}

impl <T, E> SerialPort<E> for T where T: Write<u8, Error=E> + Read<u8, Error=E> {}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Connected,
    Erasing,
    Writing,
    Programming,
    Resetting,
    Done,
    Failed,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader not detected after {attempts} attempts")]
    DeviceNotDetected { attempts: u32 },

    #[error("timeout awaiting {phase} response")]
    ResponseTimeout { phase: Phase },

    #[error("checksum mismatch at 0x{address:06x} (expected 0x{expected:02x}, received 0x{received:02x})")]
    ChecksumMismatch { address: usize, expected: u8, received: u8 },

    #[error("image is empty")]
    EmptyImage,
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each bootloader response, 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10000"))]
    pub response_timeout_ms: u32,

    /// Timeout for a single read attempt
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10"))]
    pub read_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Number of handshake probes before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub handshake_attempts: u32,

    /// Period between handshake probes
    #[cfg_attr(feature = "structopt", structopt(long, default_value="100"))]
    pub handshake_interval_ms: u32,

    /// Page retransmissions on checksum mismatch before failing
    #[cfg_attr(feature = "structopt", structopt(long, default_value="3"))]
    pub checksum_retries: u32,

    /// Only log checksum mismatches and keep waiting for the correct echo
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub lenient_checksum: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            read_timeout_ms: 10,
            poll_delay_ms: 1,
            handshake_attempts: 100,
            handshake_interval_ms: 100,
            checksum_retries: 3,
            lenient_checksum: false,
        }
    }
}

/// Progress events emitted while flashing
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Progress {
    /// Erasing a sector (zero based)
    Erasing { sector: usize, sectors: usize },
    /// Finished programming a page (zero based)
    Programmed { page: usize, pages: usize, address: usize },
}

/// Outcome of a successful flash
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Summary {
    pub sectors: usize,
    pub pages: usize,
    pub bytes: usize,
    pub checksum_mismatches: usize,
    pub retransmits: usize,
}

/// Position of the session within the image
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Cursor {
    /// Byte offset of the current page, advances by a full page per program
    pub address: usize,
    pub sector: usize,
    pub page: usize,
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl <P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self{state: State::Init, options, port, delay, _err: PhantomData}
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Flash an image without progress reporting
    pub fn run(&mut self, image: &ProgramImage) -> Result<Summary, Error<E>> {
        self.flash(image, |_| ())
    }

    /// Flash an image, connecting first if required
    pub fn flash<F>(&mut self, image: &ProgramImage, mut progress: F) -> Result<Summary, Error<E>>
    where
        F: FnMut(Progress),
    {
        let r = self.flash_inner(image, &mut progress);
        if r.is_err() {
            self.state = State::Failed;
        }
        r
    }

    fn flash_inner<F>(&mut self, image: &ProgramImage, progress: &mut F) -> Result<Summary, Error<E>>
    where
        F: FnMut(Progress),
    {
        if image.is_empty() {
            return Err(Error::EmptyImage);
        }

        if self.state != State::Connected {
            self.init()?;
        }

        let layout = Layout::new(image.len());
        info!("Flashing {} bytes: {} sectors, {} pages", layout.len, layout.sectors, layout.pages);

        let mut summary = Summary{ sectors: layout.sectors, pages: layout.pages, bytes: layout.len, ..Default::default() };
        let mut cursor = Cursor::default();

        for sector in 0..layout.sectors {
            cursor.sector = sector;
            progress(Progress::Erasing{ sector, sectors: layout.sectors });

            self.erase_sector(&cursor)?;

            for page in 0..layout.pages_in(sector) {
                cursor.page = page;

                self.write_page(image, &layout, &cursor, &mut summary)?;
                self.program_page(&cursor)?;

                progress(Progress::Programmed{
                    page: sector * planner::PAGES_PER_SECTOR + page,
                    pages: layout.pages,
                    address: cursor.address,
                });

                cursor.address += planner::PAGE_SIZE;
            }
        }

        self.reset()?;

        self.state = State::Done;
        info!("Flashing complete");

        Ok(summary)
    }

    /// Detect the bootloader, returning the number of probes used
    pub fn init(&mut self) -> Result<u32, Error<E>> {
        debug!("Probing for bootloader");

        for attempt in 1..=self.options.handshake_attempts {
            self.drain()?;

            self.write_all(&[ISP_PROBE, ISP_PROBE])?;
            block!(self.port.flush())?;

            let r = self.read_byte(self.options.read_timeout_ms)?;

            if r == Some(ISP_READY) {
                debug!("Bootloader responded after {} probes", attempt);
                self.state = State::Connected;
                return Ok(attempt);
            }

            if let Some(v) = r {
                trace!("Ignoring probe response: 0x{:02x}", v);
            }

            self.delay.delay_ms(self.options.handshake_interval_ms);
        }

        error!("Bootloader not detected");
        self.state = State::Failed;

        Err(Error::DeviceNotDetected{ attempts: self.options.handshake_attempts })
    }

    /// Erase the sector the cursor points at
    pub fn erase_sector(&mut self, cursor: &Cursor) -> Result<(), Error<E>> {
        self.state = State::Erasing;

        let addr = planner::sector_address(cursor.address);
        debug!("Erasing sector {} at {:02x?}", cursor.sector, addr);

        self.command(Command::Erase, Phase::EraseRequest, true)?;

        self.write_all(&addr)?;
        self.await_ack(Phase::EraseComplete, ERASE_DONE, None)?;

        Ok(())
    }

    /// Load the page at the cursor into the bootloader buffer
    fn write_page(&mut self, image: &ProgramImage, layout: &Layout, cursor: &Cursor, summary: &mut Summary) -> Result<(), Error<E>> {
        self.state = State::Writing;

        let data = image.chunk(cursor.address, layout.chunk_len(cursor.address));
        let sum = planner::checksum(data);

        debug!("Writing {} bytes from 0x{:06x} (checksum 0x{:02x})", data.len(), cursor.address, sum);

        let mut retries = 0;

        loop {
            self.command(Command::Write, Phase::WriteRequest, false)?;

            block!(self.port.write((data.len() - 1) as u8))?;
            self.write_all(data)?;

            match self.await_checksum(sum, summary)? {
                None => return Ok(()),
                Some(_) if retries < self.options.checksum_retries => {
                    retries += 1;
                    summary.retransmits += 1;
                    warn!("Retransmitting page at 0x{:06x} (attempt {})", cursor.address, retries + 1);
                },
                Some(received) => {
                    error!("Page at 0x{:06x} rejected after {} retransmits", cursor.address, retries);
                    return Err(Error::ChecksumMismatch{ address: cursor.address, expected: sum, received });
                }
            }
        }
    }

    /// Program the bootloader buffer into the page at the cursor
    fn program_page(&mut self, cursor: &Cursor) -> Result<(), Error<E>> {
        self.state = State::Programming;

        let addr = planner::page_address(cursor.address);
        debug!("Programming page {} of sector {} at {:02x?}", cursor.page, cursor.sector, addr);

        self.command(Command::Program, Phase::ProgramRequest, false)?;

        self.write_all(&addr)?;
        self.await_ack(Phase::ProgramComplete, PROGRAM_DONE, None)?;

        Ok(())
    }

    /// Restart the target, any response is discarded
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.state = State::Resetting;

        debug!("Resetting target");

        block!(self.port.write(Command::Reset as u8))?;
        block!(self.port.flush())?;

        if let Some(v) = self.read_byte(self.options.read_timeout_ms)? {
            trace!("Discarding reset response: 0x{:02x}", v);
        }

        Ok(())
    }

    /// Send a command and wait until the bootloader accepts it
    fn command(&mut self, command: Command, phase: Phase, resend: bool) -> Result<(), Error<E>> {
        let c = command as u8;
        block!(self.port.write(c))?;

        match command.ready() {
            Some(ack) => self.await_ack(phase, ack, if resend { Some(c) } else { None }),
            None => Ok(()),
        }
    }

    /// Wait for the checksum echo of a write frame.
    ///
    /// Returns the mismatching byte when the frame should be retransmitted.
    fn await_checksum(&mut self, expected: u8, summary: &mut Summary) -> Result<Option<u8>, Error<E>> {
        let mut waited = 0;

        loop {
            match self.read_byte(self.options.read_timeout_ms)? {
                Some(v) if v == expected => return Ok(None),
                Some(v) => {
                    warn!("Bad checksum 0x{:02x} (expected 0x{:02x})", v, expected);
                    summary.checksum_mismatches += 1;

                    if !self.options.lenient_checksum {
                        return Ok(Some(v));
                    }

                    waited += self.options.poll_delay_ms.max(1);
                    self.check_timeout(Phase::Checksum, waited)?;
                },
                None => {
                    waited += self.options.read_timeout_ms.max(1);
                    self.check_timeout(Phase::Checksum, waited)?;
                },
            }
        }
    }

    /// Wait for a specific acknowledgement byte, other bytes are skipped.
    ///
    /// When `resend` is set it is written again after a run of empty reads.
    fn await_ack(&mut self, phase: Phase, expected: u8, resend: Option<u8>) -> Result<(), Error<E>> {
        let mut waited = 0;
        let mut empty = 0;

        loop {
            match self.read_byte(self.options.read_timeout_ms)? {
                Some(v) if v == expected => {
                    trace!("Received {} ack", phase);
                    return Ok(());
                },
                Some(v) => {
                    debug!("Received unexpected value: 0x{:02x} awaiting {}", v, phase);

                    waited += self.options.poll_delay_ms.max(1);
                    self.check_timeout(phase, waited)?;
                    empty = 0;
                },
                None => {
                    waited += self.options.read_timeout_ms.max(1);
                    self.check_timeout(phase, waited)?;

                    empty += 1;
                    if let Some(c) = resend {
                        if empty >= ERASE_RESEND_READS {
                            warn!("No {} response, resending 0x{:02x}", phase, c);
                            block!(self.port.write(c))?;
                            empty = 0;
                        }
                    }
                },
            }
        }
    }

    fn check_timeout(&self, phase: Phase, waited: u32) -> Result<(), Error<E>> {
        let limit = self.options.response_timeout_ms;
        if limit != 0 && waited >= limit {
            error!("Receive timeout awaiting {}", phase);
            return Err(Error::ResponseTimeout{ phase });
        }
        Ok(())
    }

    /// Read a single byte, polling for up to `timeout_ms`
    fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            if t >= timeout_ms {
                return Ok(None);
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);
        }
    }

    /// Discard stale input
    fn drain(&mut self) -> Result<(), Error<E>> {
        for _ in 0..DRAIN_LIMIT {
            match self.port.read() {
                Ok(v) => trace!("Discarding stale byte: 0x{:02x}", v),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }
}
