//! A simulated target for exercising the RTT host without hardware.
//!
//! [`MockTarget`] owns a block of target memory and implements [`Transport`]. It enforces the
//! alignment rules of the raw read primitive, records every memory transaction and can be told to
//! disappear or to fail transactions. It also plays the firmware side of RTT: it can lay out a
//! control block and produce into up channels or consume from down channels directly in memory.

use super::{Connection, ProbeMode, Transport, ALIGNMENT};
use crate::{ChannelDescriptor, ControlBlock, Error};
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// A memory transaction performed by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    /// Aligned read of `len` bytes.
    Read { address: u32, len: usize },
    /// Byte write.
    Write { address: u32, data: Vec<u8> },
}

#[derive(Debug)]
struct MockState {
    base: u32,
    memory: Vec<u8>,
    ram: Vec<Range<u64>>,
    present: bool,
    mode: ProbeMode,
    running: bool,
    fail_after: Option<usize>,
    transactions: Vec<Transaction>,
    opened: usize,
    open_connections: usize,
}

/// A simulated target behind a simulated probe.
///
/// Clones share the same memory, so a test can keep one handle to act as the firmware while the
/// session under test owns another as its transport.
#[derive(Clone, Debug)]
pub struct MockTarget {
    state: Arc<Mutex<MockState>>,
}

impl MockTarget {
    /// Creates a target with `size` bytes of zeroed RAM at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self::from_memory(base, vec![0; size])
    }

    /// Creates a target whose memory is filled with a pattern where each byte is equal to its own
    /// offset plus one (wrapping, and never zero). Writes that clobber adjacent memory stand out.
    pub fn with_pattern(base: u32, size: usize) -> Self {
        Self::from_memory(base, (0..size).map(|i| (i % 255) as u8 + 1).collect())
    }

    fn from_memory(base: u32, memory: Vec<u8>) -> Self {
        assert_eq!(base % ALIGNMENT, 0, "mock memory must start word aligned");
        let ram = vec![u64::from(base)..u64::from(base) + memory.len() as u64];

        Self {
            state: Arc::new(Mutex::new(MockState {
                base,
                memory,
                ram,
                present: true,
                mode: ProbeMode::Debug,
                running: true,
                fail_after: None,
                transactions: Vec::new(),
                opened: 0,
                open_connections: 0,
            })),
        }
    }

    /// Opens a connection, panicking if the probe is not present.
    pub fn connect(&self) -> MockConnection {
        self.clone()
            .open()
            .expect("mock probe should be present when connecting")
    }

    /// Makes the probe appear or disappear.
    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    /// Changes how much RAM the target reports. The backing memory is not resized, so this can be
    /// used to report less RAM than is actually readable.
    pub fn set_reported_ram(&self, size: u32) {
        let mut state = self.state.lock();
        let base = u64::from(state.base);
        state.ram = vec![base..base + u64::from(size)];
    }

    /// Reports several RAM regions instead of one covering the whole backing memory.
    pub fn set_ram_regions(&self, regions: Vec<Range<u64>>) {
        self.state.lock().ram = regions;
    }

    /// Sets the mode the probe reports on the next connection.
    pub fn set_mode(&self, mode: ProbeMode) {
        self.state.lock().mode = mode;
    }

    /// Returns the mode the probe is in.
    pub fn mode(&self) -> ProbeMode {
        self.state.lock().mode
    }

    /// Halts the simulated core.
    pub fn halt(&self) {
        self.state.lock().running = false;
    }

    /// Returns `true` if the simulated core is running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Lets the next `count` transactions succeed and fails every one after that, until reset
    /// with `None`.
    pub fn fail_after(&self, count: Option<usize>) {
        self.state.lock().fail_after = count;
    }

    /// Returns all transactions recorded so far.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }

    /// Forgets the recorded transactions.
    pub fn clear_transactions(&self) {
        self.state.lock().transactions.clear();
    }

    /// Number of successful [`Transport::open`] calls.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Number of connections that have been opened and not dropped yet.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Reads memory directly, bypassing the transaction log.
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let range = state
            .offsets(address, len)
            .expect("mock memory access out of range");
        state.memory[range].to_vec()
    }

    /// Writes memory directly, bypassing the transaction log.
    pub fn write_memory(&self, address: u32, data: &[u8]) {
        let mut state = self.state.lock();
        let range = state
            .offsets(address, data.len())
            .expect("mock memory access out of range");
        state.memory[range].copy_from_slice(data);
    }

    fn read_u32(&self, address: u32) -> u32 {
        let bytes = self.memory(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_u32(&self, address: u32, value: u32) {
        self.write_memory(address, &value.to_le_bytes());
    }

    /// Lays out a control block at `address` the way the target firmware initializes it.
    ///
    /// `up` and `down` hold `(buffer address, buffer size)` per channel. A buffer address of 0
    /// leaves the channel uninitialized. All offsets start at 0, flags are zero.
    pub fn install_control_block(&self, address: u32, up: &[(u32, u32)], down: &[(u32, u32)]) {
        let mut block = Vec::with_capacity(
            ControlBlock::HEADER_SIZE + (up.len() + down.len()) * ChannelDescriptor::SIZE,
        );
        block.extend_from_slice(&ControlBlock::RTT_ID);
        block.extend_from_slice(&(up.len() as u32).to_le_bytes());
        block.extend_from_slice(&(down.len() as u32).to_le_bytes());

        for (buffer, size) in up.iter().chain(down) {
            for field in [0, *buffer, *size, 0, 0, 0] {
                block.extend_from_slice(&u32::to_le_bytes(field));
            }
        }

        self.write_memory(address, &block);
    }

    /// Sets the write and read offsets of the descriptor at `descriptor` directly.
    pub fn set_offsets(&self, descriptor: u32, write: u32, read: u32) {
        self.write_u32(descriptor + 12, write);
        self.write_u32(descriptor + 16, read);
    }

    /// Returns the `(write, read)` offsets of the descriptor at `descriptor`.
    pub fn offsets(&self, descriptor: u32) -> (u32, u32) {
        (
            self.read_u32(descriptor + 12),
            self.read_u32(descriptor + 16),
        )
    }

    /// Firmware side write into the up channel described at `descriptor`.
    ///
    /// Writes as much of `data` as fits and returns the number of bytes written, like a
    /// non-blocking trimming RTT write on the target.
    pub fn target_write(&self, descriptor: u32, data: &[u8]) -> usize {
        let buffer = self.read_u32(descriptor + 4);
        let size = self.read_u32(descriptor + 8);
        let (mut write, read) = self.offsets(descriptor);

        let mut written = 0;
        for byte in data {
            let next = (write + 1) % size;
            if next == read {
                break;
            }
            self.write_memory(buffer + write, &[*byte]);
            write = next;
            written += 1;
        }

        self.write_u32(descriptor + 12, write);
        written
    }

    /// Firmware side read of everything pending in the down channel described at `descriptor`.
    pub fn target_read(&self, descriptor: u32) -> Vec<u8> {
        let buffer = self.read_u32(descriptor + 4);
        let size = self.read_u32(descriptor + 8);
        let (write, mut read) = self.offsets(descriptor);

        let mut data = Vec::new();
        while read != write {
            data.extend(self.memory(buffer + read, 1));
            read = (read + 1) % size;
        }

        self.write_u32(descriptor + 16, read);
        data
    }
}

impl MockState {
    fn offsets(&self, address: u32, len: usize) -> Option<Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.memory.len()).then_some(start..end)
    }

    fn transaction(&mut self, transaction: Transaction) -> Result<(), Error> {
        if !self.present {
            return Err(Error::transport("mock probe disconnected"));
        }

        match self.fail_after {
            Some(0) => return Err(Error::transport("mock transaction failure")),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }

        self.transactions.push(transaction);
        Ok(())
    }
}

impl Transport for MockTarget {
    type Connection = MockConnection;

    fn open(&mut self) -> Result<MockConnection, Error> {
        let mut state = self.state.lock();

        if !state.present {
            return Err(Error::ProbeNotFound);
        }

        state.opened += 1;
        state.open_connections += 1;

        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }
}

/// An open connection to a [`MockTarget`].
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl Connection for MockConnection {
    fn current_mode(&mut self) -> Result<ProbeMode, Error> {
        Ok(self.state.lock().mode)
    }

    fn enter_debug_mode(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.mode = ProbeMode::Debug;
        state.running = false;
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        self.state.lock().running = true;
        Ok(())
    }

    fn ram(&self) -> Vec<Range<u64>> {
        self.state.lock().ram.clone()
    }

    fn read_aligned(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        if address % ALIGNMENT != 0 || data.len() as u32 % ALIGNMENT != 0 {
            return Err(Error::MemoryRead(format!(
                "{} bytes at unaligned address {address:#010x}",
                data.len()
            )));
        }

        let mut state = self.state.lock();
        let range = state
            .offsets(address, data.len())
            .ok_or_else(|| Error::transport(format!("read fault at {address:#010x}")))?;

        state.transaction(Transaction::Read {
            address,
            len: data.len(),
        })?;
        data.copy_from_slice(&state.memory[range]);

        Ok(())
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        let range = state
            .offsets(address, data.len())
            .ok_or_else(|| Error::transport(format!("write fault at {address:#010x}")))?;

        state.transaction(Transaction::Write {
            address,
            data: data.to_vec(),
        })?;
        state.memory[range].copy_from_slice(data);

        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.state.lock().open_connections -= 1;
    }
}
