
/// Probe byte, sent twice to detect the bootloader
pub const ISP_PROBE: u8 = 0x55;

/// Bootloader reply to a probe
pub const ISP_READY: u8 = 0x56;

pub const ERASE_READY: u8 = 0x31;
pub const ERASE_DONE: u8 = 0x32;

pub const WRITE_READY: u8 = 0x11;

pub const PROGRAM_READY: u8 = 0x41;
pub const PROGRAM_DONE: u8 = 0x42;

/// Consecutive empty reads after which an erase command is resent
pub const ERASE_RESEND_READS: u32 = 10;

/// Stale bytes discarded before each handshake probe at most
pub const DRAIN_LIMIT: usize = 4096;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Loads up to 256 bytes into the bootloader page buffer, acked with the payload checksum.
    Write = 0x10,

    /// Erases the 4 KiB sector at the following 3-byte address.
    Erase = 0x30,

    /// Programs the page buffer into flash at the following 3-byte address.
    Program = 0x40,

    /// Leaves the bootloader and restarts the target, no ack.
    Reset = 0xF0,
}

impl Command {
    /// Acknowledgement the bootloader sends once it accepts the command
    pub fn ready(&self) -> Option<u8> {
        match self {
            Command::Write => Some(WRITE_READY),
            Command::Erase => Some(ERASE_READY),
            Command::Program => Some(PROGRAM_READY),
            Command::Reset => None,
        }
    }
}

/// Protocol step an acknowledgement is awaited for
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Phase {
    EraseRequest,
    EraseComplete,
    WriteRequest,
    Checksum,
    ProgramRequest,
    ProgramComplete,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Phase::EraseRequest => "erase request",
            Phase::EraseComplete => "erase complete",
            Phase::WriteRequest => "write request",
            Phase::Checksum => "write checksum",
            Phase::ProgramRequest => "program request",
            Phase::ProgramComplete => "program complete",
        };
        f.write_str(s)
    }
}
