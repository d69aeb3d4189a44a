use crate::memory::{Connection, MemoryExt};
use crate::Error;
use scroll::{Pread, LE};
use std::cmp::min;
use std::ops::Range;

/// Direction of an RTT channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Target to host.
    Up,
    /// Host to target.
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Host side mirror of one channel descriptor in target memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDescriptor {
    number: usize,
    direction: Direction,
    ptr: u32,
    name_ptr: u32,
    buffer_ptr: u32,
    size: u32,
    write: u32,
    read: u32,
    flags: u32,
}

// Channels must follow this data layout when reading/writing memory in order to be compatible with
// the official RTT implementation.
//
// struct Channel {
//     const char *name; // Name of channel, pointer to null-terminated string. Optional.
//     char *buffer; // Pointer to buffer data
//     unsigned int size; // Size of data buffer. The actual capacity is one byte less.
//     unsigned int write; // Offset in data buffer of next byte to write.
//     unsigned int read; // Offset in data buffer of next byte to read.
//     // The low 2 bits of flags are used for blocking/non blocking modes, the rest are ignored.
//     unsigned int flags;
// }

impl ChannelDescriptor {
    /// Size of the descriptor in target memory in bytes.
    pub const SIZE: usize = 24;

    // Offsets of fields in target memory in bytes
    const O_NAME: usize = 0;
    const O_BUFFER_PTR: usize = 4;
    const O_SIZE: usize = 8;
    const O_WRITE: usize = 12;
    const O_READ: usize = 16;
    const O_FLAGS: usize = 20;

    /// Parses a descriptor located at `ptr` from its raw bytes.
    pub(crate) fn parse(
        number: usize,
        direction: Direction,
        ptr: u32,
        mem: &[u8],
    ) -> Result<ChannelDescriptor, Error> {
        let field = |offset: usize| -> Result<u32, Error> {
            mem.pread_with::<u32>(offset, LE)
                .map_err(|_| Error::MemoryRead(format!("RTT {direction} channel {number}")))
        };

        Ok(ChannelDescriptor {
            number,
            direction,
            ptr,
            name_ptr: field(Self::O_NAME)?,
            buffer_ptr: field(Self::O_BUFFER_PTR)?,
            size: field(Self::O_SIZE)?,
            write: field(Self::O_WRITE)?,
            read: field(Self::O_READ)?,
            flags: field(Self::O_FLAGS)?,
        })
    }

    /// Returns the number of the channel.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Returns the direction of the channel.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Address of the descriptor in target memory.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Address of the ring buffer in target memory.
    pub fn buffer_ptr(&self) -> u32 {
        self.buffer_ptr
    }

    /// Returns the buffer size in bytes. Note that the usable size is one byte less due to how the
    /// ring buffer is implemented.
    pub fn buffer_size(&self) -> u32 {
        self.size
    }

    /// Write offset as of the last refresh.
    pub fn write_offset(&self) -> u32 {
        self.write
    }

    /// Read offset as of the last refresh.
    pub fn read_offset(&self) -> u32 {
        self.read
    }

    /// Returns the channel mode encoded in the flags, or `None` if the flags hold an invalid mode.
    pub fn mode(&self) -> Option<ChannelMode> {
        ChannelMode::from_flags(self.flags)
    }

    /// Returns `false` if the target has not set up a buffer for this channel.
    pub fn is_initialized(&self) -> bool {
        self.buffer_ptr != 0 && self.size != 0
    }

    /// Reads the name of the channel from target memory.
    ///
    /// Returns `None` if the channel has no name, or the name pointer does not point into readable
    /// memory.
    pub fn read_name<C: Connection>(&self, connection: &mut C) -> Result<Option<String>, Error> {
        if self.name_ptr == 0 {
            return Ok(None);
        }

        let regions = connection.readable_regions();
        read_c_string(connection, &regions, self.name_ptr)
    }

    fn validate_offsets(&self, write: u32, read: u32) -> Result<(), Error> {
        let check = |which, value| {
            if value >= self.size {
                Err(Error::ControlBlockCorrupted(format!(
                    "{} pointer is {} while buffer size is {} for {} channel {}",
                    which, value, self.size, self.direction, self.number,
                )))
            } else {
                Ok(())
            }
        };

        check("write", write)?;
        check("read", read)
    }

    /// Re-reads the write and read offsets from target memory.
    fn read_pointers<C: Connection>(&self, connection: &mut C) -> Result<(u32, u32), Error> {
        let mut block = [0u8; 8];
        connection.read(self.ptr + Self::O_WRITE as u32, &mut block)?;

        let write: u32 = block.pread_with(0, LE).map_err(|_| self.pointer_error())?;
        let read: u32 = block.pread_with(4, LE).map_err(|_| self.pointer_error())?;

        self.validate_offsets(write, read)?;

        Ok((write, read))
    }

    fn pointer_error(&self) -> Error {
        Error::MemoryRead(format!(
            "RTT {} channel {} pointers",
            self.direction, self.number
        ))
    }

    /// Target address of `offset` inside the ring buffer.
    fn buffer_address(&self, offset: u32) -> Result<u32, Error> {
        self.buffer_ptr.checked_add(offset).ok_or_else(|| {
            Error::ControlBlockCorrupted(format!(
                "buffer of {} channel {} at {:#010x} wraps the address space",
                self.direction, self.number, self.buffer_ptr
            ))
        })
    }
}

/// Number of bytes that can be read in one run starting at `read`.
fn readable_contiguous(size: u32, write: u32, read: u32) -> u32 {
    if read > write {
        size - read
    } else {
        write - read
    }
}

/// Number of bytes that can be written in one run starting at `write`.
///
/// One byte always stays free so that `write == read` means empty.
fn writable_contiguous(size: u32, write: u32, read: u32) -> u32 {
    if read > write {
        read - write - 1
    } else if read == 0 {
        size - write - 1
    } else {
        size - write
    }
}

/// RTT up (target to host) channel.
#[derive(Clone, Debug)]
pub struct UpChannel(pub(crate) ChannelDescriptor);

impl UpChannel {
    /// Returns the number of the channel.
    pub fn number(&self) -> usize {
        self.0.number
    }

    /// Returns the descriptor as last seen in target memory.
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.0
    }

    /// Reads all bytes currently available in the channel, appends them to `buf` and returns how
    /// many bytes were read.
    ///
    /// The new read offset is written back to the target before this returns, so once bytes are
    /// handed out the target is already free to overwrite their space. This method does not block
    /// waiting for data; reading zero bytes is not an error.
    pub fn read<C: Connection>(
        &mut self,
        connection: &mut C,
        buf: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        let start = buf.len();

        let result = self.read_inner(connection, buf);
        if result.is_err() {
            buf.truncate(start);
        }

        result
    }

    fn read_inner<C: Connection>(
        &mut self,
        connection: &mut C,
        buf: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        let (write, mut read) = self.0.read_pointers(connection)?;

        let mut total = 0;

        // Tail of the buffer first, then the head after wrapping (maximum of two iterations)
        loop {
            let count = readable_contiguous(self.0.size, write, read) as usize;
            if count == 0 {
                break;
            }

            let offset = buf.len();
            buf.resize(offset + count, 0);
            connection.read(self.0.buffer_address(read)?, &mut buf[offset..])?;

            total += count;
            read += count as u32;

            if read >= self.0.size {
                // Wrap around to start
                read = 0;
            }
        }

        if total > 0 {
            // Write read pointer back to target if something was read
            connection.write_word_32(self.0.ptr + ChannelDescriptor::O_READ as u32, read)?;
        }

        self.0.write = write;
        self.0.read = read;

        Ok(total)
    }
}

/// RTT down (host to target) channel.
#[derive(Clone, Debug)]
pub struct DownChannel(pub(crate) ChannelDescriptor);

impl DownChannel {
    /// Returns the number of the channel.
    pub fn number(&self) -> usize {
        self.0.number
    }

    /// Returns the descriptor as last seen in target memory.
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.0
    }

    /// Writes as much of `buf` as fits into the channel buffer and returns the number of bytes
    /// written.
    ///
    /// This method will not block waiting for space to become available. Whatever does not fit
    /// is not written; the caller decides whether to keep it.
    pub fn write<C: Connection>(
        &mut self,
        connection: &mut C,
        mut buf: &[u8],
    ) -> Result<usize, Error> {
        let (mut write, read) = self.0.read_pointers(connection)?;

        let mut total = 0;

        // Room up to the end of the buffer first, then up to the read pointer after wrapping
        // (maximum of two iterations)
        while !buf.is_empty() {
            let count = min(writable_contiguous(self.0.size, write, read) as usize, buf.len());
            if count == 0 {
                break;
            }

            connection.write_8(self.0.buffer_address(write)?, &buf[..count])?;

            total += count;
            write += count as u32;

            if write >= self.0.size {
                // Wrap around to start
                write = 0;
            }

            buf = &buf[count..];
        }

        if total > 0 {
            // Write write pointer back to target
            connection.write_word_32(self.0.ptr + ChannelDescriptor::O_WRITE as u32, write)?;
        }

        self.0.write = write;
        self.0.read = read;

        Ok(total)
    }
}

/// Reads a null-terminated string from target memory. Lossy UTF-8 decoding is used.
fn read_c_string<C: Connection>(
    connection: &mut C,
    regions: &[Range<u64>],
    ptr: u32,
) -> Result<Option<String>, Error> {
    // Find out which memory range contains the pointer
    let Some(range) = regions.iter().find(|r| r.contains(&u64::from(ptr))) else {
        return Ok(None);
    };

    // Read up to 128 bytes not going past the end of the region
    let mut bytes = vec![0u8; min(128, range.end - u64::from(ptr)) as usize];
    connection.read(ptr, &mut bytes)?;

    let name = bytes
        .iter()
        .position(|&b| b == 0)
        .map(|p| String::from_utf8_lossy(&bytes[..p]).into_owned());

    tracing::trace!("Channel name at {:#010x}: {:?}", ptr, name);

    Ok(name)
}

/// Specifies what to do when a channel doesn't have enough buffer space for a complete write on the
/// target side.
#[derive(Clone, Copy, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ChannelMode {
    /// Skip writing the data completely if it doesn't fit in its entirety.
    NoBlockSkip = 0,

    /// Write as much as possible of the data and ignore the rest.
    NoBlockTrim = 1,

    /// Block (spin) if the buffer is full.
    BlockIfFull = 2,
}

impl ChannelMode {
    fn from_flags(flags: u32) -> Option<ChannelMode> {
        match flags & 0x3 {
            0 => Some(ChannelMode::NoBlockSkip),
            1 => Some(ChannelMode::NoBlockTrim),
            2 => Some(ChannelMode::BlockIfFull),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::mock::{MockTarget, Transaction};
    use test_case::test_case;

    const BASE: u32 = 0x2000_0000;
    const DESCRIPTOR: u32 = BASE + 0x40;
    const BUFFER: u32 = BASE + 0x100;

    /// Target with one descriptor at `DESCRIPTOR` describing a buffer of `size` bytes at `BUFFER`.
    /// The buffer is filled with `0, 1, 2, ...` so every byte's position is recognizable.
    fn target_with_buffer(size: u32, write: u32, read: u32) -> MockTarget {
        let target = MockTarget::new(BASE, 0x200);
        let fields = [0x0800_1000, BUFFER, size, write, read, 1];
        let bytes: Vec<u8> = fields.iter().flat_map(|f: &u32| f.to_le_bytes()).collect();
        target.write_memory(DESCRIPTOR, &bytes);
        let contents: Vec<u8> = (0..size as u8).collect();
        target.write_memory(BUFFER, &contents);
        target
    }

    fn descriptor(target: &MockTarget, direction: Direction) -> ChannelDescriptor {
        let mem = target.memory(DESCRIPTOR, ChannelDescriptor::SIZE);
        ChannelDescriptor::parse(0, direction, DESCRIPTOR, &mem).unwrap()
    }

    #[test]
    fn parses_descriptor_fields() {
        let target = target_with_buffer(10, 3, 7);
        let descriptor = descriptor(&target, Direction::Up);

        assert_eq!(descriptor.buffer_ptr(), BUFFER);
        assert_eq!(descriptor.buffer_size(), 10);
        assert_eq!(descriptor.write_offset(), 3);
        assert_eq!(descriptor.read_offset(), 7);
        assert_eq!(descriptor.mode(), Some(ChannelMode::NoBlockTrim));
        assert!(descriptor.is_initialized());
    }

    #[test]
    fn short_descriptor_is_a_read_error() {
        let result = ChannelDescriptor::parse(2, Direction::Down, DESCRIPTOR, &[0u8; 10]);
        assert!(matches!(result, Err(Error::MemoryRead(_))));
    }

    #[test_case(10, 7, 2 => vec![2, 3, 4, 5, 6]; "contiguous")]
    #[test_case(10, 3, 7 => vec![7, 8, 9, 0, 1, 2]; "wrapped tail then head")]
    #[test_case(10, 0, 4 => vec![4, 5, 6, 7, 8, 9]; "wrapped with nothing at head")]
    #[test_case(10, 5, 5 => Vec::<u8>::new(); "empty")]
    #[test_case(10, 9, 0 => vec![0, 1, 2, 3, 4, 5, 6, 7, 8]; "full")]
    fn read_drains_available_bytes(size: u32, write: u32, read: u32) -> Vec<u8> {
        let target = target_with_buffer(size, write, read);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));

        let mut buf = Vec::new();
        let count = channel.read(&mut target.connect(), &mut buf).unwrap();

        assert_eq!(count, buf.len());
        assert_eq!(target.offsets(DESCRIPTOR), (write, write));
        assert_eq!(channel.descriptor().read_offset(), write);
        buf
    }

    #[test]
    fn read_writes_back_read_offset_once() {
        let target = target_with_buffer(10, 3, 7);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));

        let mut buf = Vec::new();
        channel.read(&mut target.connect(), &mut buf).unwrap();

        let writes: Vec<_> = target
            .transactions()
            .into_iter()
            .filter(|t| matches!(t, Transaction::Write { .. }))
            .collect();

        assert_eq!(
            writes,
            vec![Transaction::Write {
                address: DESCRIPTOR + 16,
                data: vec![3, 0, 0, 0],
            }]
        );
    }

    #[test]
    fn empty_read_does_not_touch_target() {
        let target = target_with_buffer(10, 4, 4);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));

        let mut buf = vec![0xAA];
        let count = channel.read(&mut target.connect(), &mut buf).unwrap();

        assert_eq!(count, 0);
        assert_eq!(buf, vec![0xAA]);
        assert!(target
            .transactions()
            .iter()
            .all(|t| matches!(t, Transaction::Read { .. })));
    }

    #[test]
    fn read_sees_offsets_advanced_by_target() {
        let target = target_with_buffer(10, 0, 0);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));

        // The target produced data after the descriptor was mirrored.
        target.set_offsets(DESCRIPTOR, 4, 0);

        let mut buf = Vec::new();
        channel.read(&mut target.connect(), &mut buf).unwrap();

        assert_eq!(buf, vec![0, 1, 2, 3]);
    }

    #[test]
    fn corrupted_offsets_are_rejected() {
        let target = target_with_buffer(10, 12, 0);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));

        let mut buf = Vec::new();
        let result = channel.read(&mut target.connect(), &mut buf);

        assert!(matches!(result, Err(Error::ControlBlockCorrupted(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn failed_read_leaves_output_untouched() {
        let target = target_with_buffer(10, 3, 7);
        let mut channel = UpChannel(descriptor(&target, Direction::Up));
        // Pointer read and first segment succeed, second segment fails.
        target.fail_after(Some(2));

        let mut buf = vec![0x55];
        let result = channel.read(&mut target.connect(), &mut buf);

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(buf, vec![0x55]);
        assert_eq!(target.offsets(DESCRIPTOR), (3, 7));
    }

    #[test]
    fn write_splits_around_wrap_and_drops_excess() {
        let target = target_with_buffer(10, 8, 2);
        let mut channel = DownChannel(descriptor(&target, Direction::Down));

        let written = channel
            .write(&mut target.connect(), &[0xA0, 0xA1, 0xA2, 0xA3, 0xA4])
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(target.memory(BUFFER + 8, 2), vec![0xA0, 0xA1]);
        assert_eq!(target.memory(BUFFER, 2), vec![0xA2, 1]);
        assert_eq!(target.offsets(DESCRIPTOR), (1, 2));
    }

    #[test_case(10, 0, 0, 20 => (9, 9); "empty buffer with read at start")]
    #[test_case(10, 4, 4, 20 => (9, 3); "empty buffer mid way")]
    #[test_case(10, 2, 6, 20 => (3, 5); "write behind read")]
    #[test_case(10, 5, 6, 3 => (0, 5); "full")]
    #[test_case(10, 1, 1, 0 => (0, 1); "nothing to write")]
    #[test_case(10, 3, 1, 4 => (4, 7); "fits before end")]
    fn write_keeps_one_byte_free(size: u32, write: u32, read: u32, len: usize) -> (usize, u32) {
        let target = target_with_buffer(size, write, read);
        let mut channel = DownChannel(descriptor(&target, Direction::Down));

        let data = vec![0xEE; len];
        let written = channel.write(&mut target.connect(), &data).unwrap();
        let (new_write, new_read) = target.offsets(DESCRIPTOR);

        assert_eq!(new_read, read);
        if written > 0 {
            assert_ne!(new_write, new_read);
        }

        (written, new_write)
    }

    #[test]
    fn full_write_commits_offset_in_one_transaction() {
        let target = target_with_buffer(10, 8, 2);
        let mut channel = DownChannel(descriptor(&target, Direction::Down));

        channel.write(&mut target.connect(), &[1, 2, 3]).unwrap();

        let transactions = target.transactions();
        assert_eq!(
            transactions.last(),
            Some(&Transaction::Write {
                address: DESCRIPTOR + 12,
                data: vec![1, 0, 0, 0],
            })
        );
    }

    #[test]
    fn reads_channel_name_from_readable_region() {
        let target = target_with_buffer(10, 0, 0);
        let name_ptr = BASE + 0x180;
        target.write_memory(name_ptr, b"Terminal\0");
        target.write_memory(DESCRIPTOR, &name_ptr.to_le_bytes());

        let descriptor = descriptor(&target, Direction::Up);
        let name = descriptor.read_name(&mut target.connect()).unwrap();

        assert_eq!(name.as_deref(), Some("Terminal"));
    }

    #[test]
    fn name_outside_readable_memory_is_none() {
        let target = target_with_buffer(10, 0, 0);
        // The default name pointer points at flash, which the mock does not expose.
        let descriptor = descriptor(&target, Direction::Up);

        assert_eq!(descriptor.read_name(&mut target.connect()).unwrap(), None);
    }

    #[test_case(0 => Some(ChannelMode::NoBlockSkip))]
    #[test_case(1 => Some(ChannelMode::NoBlockTrim))]
    #[test_case(0x102 => Some(ChannelMode::BlockIfFull))]
    #[test_case(3 => None)]
    fn decodes_mode_from_low_flag_bits(flags: u32) -> Option<ChannelMode> {
        ChannelMode::from_flags(flags)
    }
}
