use crate::channel::{ChannelDescriptor, Direction, DownChannel, UpChannel};
use crate::memory::{region_contains, Connection, MemoryExt};
use crate::Error;
use scroll::{Pread, LE};
use std::borrow::Cow;
use std::ops::Range;

/// The RTT control block as found in target memory, together with the host side mirror of its
/// channel descriptors.
///
/// A control block is only valid for as long as the target keeps running the same firmware. The
/// session drops it on any link failure and rescans, because a reflashed or reset target may place
/// the block somewhere else.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    ptr: u32,
    up_channels: Vec<UpChannel>,
    down_channels: Vec<DownChannel>,
}

// ControlBlock must follow this data layout when reading/writing memory in order to be compatible
// with the official RTT implementation.
//
// struct ControlBlock {
//     char id[16]; // Used to find/validate the control block.
//     // Maximum number of up (target to host) channels in following array
//     unsigned int max_up_channels;
//     // Maximum number of down (host to target) channels in following array.
//     unsigned int max_down_channels;
//     RttChannel up_channels[max_up_channels]; // Array of up (target to host) channels.
//     RttChannel down_channels[max_down_channels]; // array of down (host to target) channels.
// }

impl ControlBlock {
    /// The identifier the control block starts with.
    pub const RTT_ID: [u8; 16] = *b"SEGGER RTT\0\0\0\0\0\0";

    /// Size of the header in front of the channel arrays.
    pub const HEADER_SIZE: usize = Self::O_CHANNEL_ARRAYS;

    /// Channel counts above this are treated as a coincidental match on the ID.
    pub const MAX_CHANNELS: usize = 255;

    // Offsets of fields in target memory in bytes
    const O_ID: usize = 0;
    const O_MAX_UP_CHANNELS: usize = 16;
    const O_MAX_DOWN_CHANNELS: usize = 20;
    const O_CHANNEL_ARRAYS: usize = 24;

    /// Scans `size` bytes of RAM starting at `base` and returns the first control block found.
    ///
    /// The whole region is read once and searched on the host. Every offset that leaves room for
    /// the 16 byte ID is a candidate; candidates with implausible channel counts, or whose block
    /// or buffers lie outside target memory, are skipped. Returns
    /// [`Error::ControlBlockNotFound`] if there is no valid control block in the region, which is
    /// expected while the target has not initialized RTT yet.
    pub fn locate<C: Connection>(
        connection: &mut C,
        base: u32,
        size: u32,
    ) -> Result<ControlBlock, Error> {
        if (size as usize) < Self::RTT_ID.len() {
            return Err(Error::ControlBlockNotFound);
        }

        let regions = known_memory(connection);

        let mut mem = vec![0u8; size as usize];
        connection.read(base, &mut mem)?;

        for offset in 0..=(mem.len() - Self::RTT_ID.len()) {
            if mem[offset..offset + Self::RTT_ID.len()] != Self::RTT_ID {
                continue;
            }

            let ptr = base + offset as u32;

            match Self::from_snapshot(connection, &regions, ptr, &mem[offset..]) {
                Ok(control_block) => return Ok(control_block),
                Err(Error::ControlBlockCorrupted(reason)) => {
                    tracing::debug!("Skipping RTT ID match at {:#010x}: {}", ptr, reason);
                }
                Err(Error::MemoryRead(what)) => {
                    tracing::debug!(
                        "Skipping RTT ID match at {:#010x}, failed to read {}",
                        ptr,
                        what
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::ControlBlockNotFound)
    }

    /// Attempts to find the control block in the given region of target memory.
    ///
    /// With [`ScanRegion::Ram`] every RAM region the connection reports is scanned in order and
    /// the first control block found wins.
    pub fn attach_region<C: Connection>(
        connection: &mut C,
        region: &ScanRegion,
    ) -> Result<ControlBlock, Error> {
        let ranges = match region {
            ScanRegion::Exact(addr) => {
                tracing::debug!("Looking for control block at exact address {:#010x}", addr);

                let regions = known_memory(connection);
                return Self::from_snapshot(connection, &regions, *addr, &[]);
            }
            ScanRegion::Ram => {
                let ram = connection.ram();
                tracing::debug!("Scanning RAM {:#x?}", ram);
                ram
            }
            ScanRegion::Range(range) => {
                tracing::debug!("Scanning region {:#010x}..{:#010x}", range.start, range.end);
                vec![u64::from(range.start)..u64::from(range.end)]
            }
        };

        for range in ranges {
            // Regions above the 32 bit address space cannot hold a control block.
            let Ok(base) = u32::try_from(range.start) else {
                continue;
            };
            let end = range.end.min(1 << 32);
            let size = u32::try_from(end.saturating_sub(range.start)).unwrap_or(u32::MAX);

            match Self::locate(connection, base, size) {
                Err(Error::ControlBlockNotFound) => continue,
                result => return result,
            }
        }

        Err(Error::ControlBlockNotFound)
    }

    /// Builds a control block at `ptr` from memory read in advance, reading from the target
    /// whatever part of the block the snapshot does not cover.
    fn from_snapshot<C: Connection>(
        connection: &mut C,
        regions: &[Range<u64>],
        ptr: u32,
        mem: &[u8],
    ) -> Result<ControlBlock, Error> {
        let header = Self::snapshot_or_read(connection, regions, ptr, mem, Self::HEADER_SIZE)?;
        let (max_up_channels, max_down_channels) = Self::parse_header(ptr, &header)?;

        let cb_len = Self::len_for(max_up_channels, max_down_channels);
        let mem = Self::snapshot_or_read(connection, regions, ptr, mem, cb_len)?;

        Self::from_bytes(regions, ptr, &mem, max_up_channels, max_down_channels)
    }

    /// Returns the first `len` bytes at `ptr`, from the snapshot if it is long enough.
    ///
    /// Bytes past the snapshot are only read from the target if they lie inside `regions`.
    fn snapshot_or_read<'a, C: Connection>(
        connection: &mut C,
        regions: &[Range<u64>],
        ptr: u32,
        mem: &'a [u8],
        len: usize,
    ) -> Result<Cow<'a, [u8]>, Error> {
        if mem.len() >= len {
            return Ok(Cow::Borrowed(&mem[..len]));
        }

        if !region_contains(regions, ptr, len as u64) {
            return Err(Error::ControlBlockCorrupted(format!(
                "{} bytes at {:#010x} extend past target memory",
                len, ptr
            )));
        }

        let mut buf = vec![0u8; len];
        connection.read(ptr, &mut buf)?;
        Ok(Cow::Owned(buf))
    }

    /// Validates the ID and returns the channel counts.
    fn parse_header(ptr: u32, mem: &[u8]) -> Result<(usize, usize), Error> {
        let rtt_id = &mem[Self::O_ID..Self::O_ID + Self::RTT_ID.len()];
        if rtt_id != Self::RTT_ID {
            tracing::trace!(
                "Expected control block to start with RTT ID: {:?}\n. Got instead: {:?}",
                String::from_utf8_lossy(&Self::RTT_ID),
                String::from_utf8_lossy(rtt_id)
            );
            return Err(Error::ControlBlockNotFound);
        }

        let count = |offset| -> Result<usize, Error> {
            mem.pread_with::<u32>(offset, LE)
                .map(|count| count as usize)
                .map_err(|_| Error::MemoryRead("RTT control block header".to_string()))
        };

        let max_up_channels = count(Self::O_MAX_UP_CHANNELS)?;
        let max_down_channels = count(Self::O_MAX_DOWN_CHANNELS)?;

        if max_up_channels > Self::MAX_CHANNELS || max_down_channels > Self::MAX_CHANNELS {
            return Err(Error::ControlBlockCorrupted(format!(
                "Nonsensical array sizes at {:08x}: max_up_channels={} max_down_channels={}",
                ptr, max_up_channels, max_down_channels
            )));
        }

        Ok((max_up_channels, max_down_channels))
    }

    fn len_for(max_up_channels: usize, max_down_channels: usize) -> usize {
        Self::O_CHANNEL_ARRAYS + (max_up_channels + max_down_channels) * ChannelDescriptor::SIZE
    }

    fn from_bytes(
        regions: &[Range<u64>],
        ptr: u32,
        mem: &[u8],
        max_up_channels: usize,
        max_down_channels: usize,
    ) -> Result<ControlBlock, Error> {
        let descriptor = |direction, number, index: usize| {
            let offset = Self::O_CHANNEL_ARRAYS + index * ChannelDescriptor::SIZE;
            ChannelDescriptor::parse(
                number,
                direction,
                ptr + offset as u32,
                &mem[offset..offset + ChannelDescriptor::SIZE],
            )
        };

        let up_channels = (0..max_up_channels)
            .map(|i| descriptor(Direction::Up, i, i).map(UpChannel))
            .collect::<Result<Vec<_>, _>>()?;

        let down_channels = (0..max_down_channels)
            .map(|i| descriptor(Direction::Down, i, max_up_channels + i).map(DownChannel))
            .collect::<Result<Vec<_>, _>>()?;

        for channel in up_channels.iter().map(UpChannel::descriptor).chain(
            down_channels.iter().map(DownChannel::descriptor),
        ) {
            if !channel.is_initialized() {
                tracing::debug!(
                    "Buffer for {} channel {} not initialized",
                    channel.direction(),
                    channel.number()
                );
                continue;
            }

            if !region_contains(
                regions,
                channel.buffer_ptr(),
                u64::from(channel.buffer_size()),
            ) {
                return Err(Error::ControlBlockCorrupted(format!(
                    "buffer of {} channel {} at {:#010x} with size {} lies outside target memory",
                    channel.direction(),
                    channel.number(),
                    channel.buffer_ptr(),
                    channel.buffer_size()
                )));
            }
        }

        Ok(ControlBlock {
            ptr,
            up_channels,
            down_channels,
        })
    }

    /// Re-reads the control block from target memory and updates the descriptor mirror.
    ///
    /// Fails with [`Error::ControlBlockNotFound`] if the ID is gone and with
    /// [`Error::ControlBlockCorrupted`] if the channel layout changed or a buffer moved outside
    /// target memory, in which case the block has to be located again.
    pub fn refresh<C: Connection>(&mut self, connection: &mut C) -> Result<(), Error> {
        let mut mem = vec![0u8; self.size()];
        connection.read(self.ptr, &mut mem)?;

        let counts = Self::parse_header(self.ptr, &mem)?;
        if counts != (self.up_channels.len(), self.down_channels.len()) {
            return Err(Error::ControlBlockCorrupted(format!(
                "channel counts at {:#010x} changed from {:?} to {:?}",
                self.ptr,
                (self.up_channels.len(), self.down_channels.len()),
                counts
            )));
        }

        let regions = known_memory(connection);
        *self = Self::from_bytes(&regions, self.ptr, &mem, counts.0, counts.1)?;

        Ok(())
    }

    /// Returns the memory address of the control block in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Size of the control block in target memory in bytes.
    pub fn size(&self) -> usize {
        Self::len_for(self.up_channels.len(), self.down_channels.len())
    }

    /// Address range occupied by the control block.
    pub fn range(&self) -> Range<u32> {
        self.ptr..self.ptr + self.size() as u32
    }

    /// All up channel slots, including uninitialized ones.
    pub fn up_channels(&self) -> &[UpChannel] {
        &self.up_channels
    }

    /// All down channel slots, including uninitialized ones.
    pub fn down_channels(&self) -> &[DownChannel] {
        &self.down_channels
    }

    /// Returns the up channel with the given number if the target has initialized it.
    pub fn up_channel(&mut self, number: usize) -> Option<&mut UpChannel> {
        self.up_channels
            .get_mut(number)
            .filter(|channel| channel.descriptor().is_initialized())
    }

    /// Returns the down channel with the given number if the target has initialized it.
    pub fn down_channel(&mut self, number: usize) -> Option<&mut DownChannel> {
        self.down_channels
            .get_mut(number)
            .filter(|channel| channel.descriptor().is_initialized())
    }
}

/// Memory the control block and its buffers may live in.
fn known_memory<C: Connection>(connection: &C) -> Vec<Range<u64>> {
    let mut regions = connection.ram();
    regions.extend(connection.readable_regions());
    regions
}

/// Used to specify which memory regions to scan for the RTT control block.
///
/// Whatever the scan region, a control block is only accepted if it and all of its buffers lie in
/// the RAM or readable regions the connection reports.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanRegion {
    /// Scans the RAM regions reported by the connection. This is the default and should always
    /// work, however if your device has a lot of RAM, scanning all of it is slow.
    #[default]
    Ram,

    /// Limit scanning to these memory addresses in target memory. It is up to the user to ensure
    /// that reading from this range will not read from undefined memory.
    Range(Range<u32>),

    /// Tries to find the control block starting at this exact address.
    Exact(u32),
}
