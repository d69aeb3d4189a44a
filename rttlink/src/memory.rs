//! Access to target memory through a debug probe.
//!
//! A [`Transport`] knows how to open the probe; every successful [`Transport::open`] yields a
//! [`Connection`] that is closed again at the end of the same poll tick. The raw read primitive
//! only supports word aligned transactions, so everything above it goes through [`MemoryExt`],
//! which widens arbitrary requests to aligned ones and extracts the requested bytes.

use crate::Error;
use std::ops::Range;

#[cfg(any(test, feature = "test"))]
pub mod mock;

/// Alignment in bytes required by [`Connection::read_aligned`].
pub const ALIGNMENT: u32 = 4;

/// The mode a debug probe reports it is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeMode {
    /// Firmware update mode.
    Dfu,
    /// USB mass storage mode.
    MassStorage,
    /// SWD/JTAG debug mode. Target memory is only accessible in this mode.
    Debug,
    /// Single wire interface module mode.
    Swim,
    /// The probe answered with a mode that is not known.
    Unknown,
}

/// Opens connections to a debug probe.
pub trait Transport {
    /// The connection type handed out by [`Transport::open`].
    type Connection: Connection;

    /// Opens the probe and attaches to the target.
    ///
    /// Returns [`Error::ProbeNotFound`] when no probe is available and
    /// [`Error::TargetNotDetected`] when the probe cannot reach a target.
    fn open(&mut self) -> Result<Self::Connection, Error>;
}

/// An open debug probe handle.
pub trait Connection {
    /// Returns the mode the probe currently is in.
    fn current_mode(&mut self) -> Result<ProbeMode, Error>;

    /// Switches the probe into debug mode.
    fn enter_debug_mode(&mut self) -> Result<(), Error>;

    /// Lets the target core run.
    fn run(&mut self) -> Result<(), Error>;

    /// The RAM regions of the target, in the order they are scanned. No regions, or only empty
    /// ones, means no usable RAM was detected.
    ///
    /// Ranges are 64 bit so that a region ending at the top of the 32 bit address space can be
    /// represented.
    fn ram(&self) -> Vec<Range<u64>>;

    /// Regions that are safe to read, used when following pointers such as channel names.
    fn readable_regions(&self) -> Vec<Range<u64>> {
        self.ram()
    }

    /// Reads `data.len()` bytes starting at `address`.
    ///
    /// Both `address` and `data.len()` must be multiples of [`ALIGNMENT`]. Use [`MemoryExt::read`]
    /// for arbitrary ranges.
    fn read_aligned(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error>;

    /// Writes `data` byte by byte starting at `address`.
    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;

    /// Closes the connection.
    fn close(self) -> Result<(), Error>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

/// Unaligned memory access on top of a [`Connection`].
pub trait MemoryExt: Connection {
    /// Reads `data.len()` bytes starting at `address`, with no alignment requirements.
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let aligned = aligned_range(address, data.len())?;

        if aligned.start == u64::from(address) && aligned.end - aligned.start == data.len() as u64 {
            return self.read_aligned(address, data);
        }

        let mut buffer = vec![0u8; (aligned.end - aligned.start) as usize];
        self.read_aligned(aligned.start as u32, &mut buffer)?;

        let offset = (u64::from(address) - aligned.start) as usize;
        data.copy_from_slice(&buffer[offset..offset + data.len()]);

        Ok(())
    }

    /// Reads a little endian 32 bit value from `address`.
    fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes a little endian 32 bit value to `address` in one transaction.
    fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.write_8(address, &value.to_le_bytes())
    }
}

impl<C: Connection + ?Sized> MemoryExt for C {}

/// Returns `true` if `address..address + len` lies entirely inside one of `regions`.
pub fn region_contains(regions: &[Range<u64>], address: u32, len: u64) -> bool {
    let start = u64::from(address);
    let end = start + len;

    regions
        .iter()
        .any(|region| region.start <= start && end <= region.end)
}

/// Widens `address..address + len` to word boundaries.
///
/// The range is computed in 64 bits so that requests touching the top of the 32 bit address space
/// are rejected instead of wrapping around.
fn aligned_range(address: u32, len: usize) -> Result<Range<u64>, Error> {
    let alignment = u64::from(ALIGNMENT);
    let start = u64::from(address);
    let end = start + len as u64;

    if end > u64::from(u32::MAX) + 1 {
        return Err(Error::MemoryRead(format!(
            "{len} bytes at {address:#010x}, which is past the end of the address space"
        )));
    }

    let aligned_start = start - start % alignment;
    let aligned_end = end.div_ceil(alignment) * alignment;

    Ok(aligned_start..aligned_end)
}
