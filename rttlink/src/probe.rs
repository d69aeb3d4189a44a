//! [`Transport`] implementation on top of `probe-rs`.

use crate::memory::{Connection, ProbeMode, Transport};
use crate::Error;
use probe_rs::config::{MemoryRegion, TargetSelector};
use probe_rs::probe::list::Lister;
use probe_rs::probe::{DebugProbeInfo, WireProtocol};
use probe_rs::{MemoryInterface, Permissions, Session};
use std::ops::Range;

/// Opens a debug probe through `probe-rs` and attaches to the target behind it.
#[derive(Debug, Clone, Default)]
pub struct ProbeRsTransport {
    /// Index into the list of connected probes. Ignored if `serial` is set.
    pub probe_index: usize,
    /// Serial number of the probe to use.
    pub serial: Option<String>,
    /// Target chip name. The chip is auto-detected if unset.
    pub chip: Option<String>,
    pub protocol: Option<WireProtocol>,
    /// Wire speed in kHz.
    pub speed: Option<u32>,
    /// Overrides the RAM region taken from the target's memory map.
    pub ram: Option<Range<u32>>,
    pub core: usize,
}

impl ProbeRsTransport {
    fn select<'a>(&self, probes: &'a [DebugProbeInfo]) -> Option<&'a DebugProbeInfo> {
        match &self.serial {
            Some(serial) => probes
                .iter()
                .find(|probe| probe.serial_number.as_deref() == Some(serial.as_str())),
            None => probes.get(self.probe_index),
        }
    }
}

impl Transport for ProbeRsTransport {
    type Connection = ProbeRsConnection;

    fn open(&mut self) -> Result<ProbeRsConnection, Error> {
        let probes = Lister::new().list_all();
        let info = self.select(&probes).ok_or(Error::ProbeNotFound)?;

        let mut probe = info.open().map_err(|error| {
            tracing::debug!("Failed to open probe {}: {}", info.identifier, error);
            Error::ProbeNotFound
        })?;

        if let Some(protocol) = self.protocol {
            probe.select_protocol(protocol).map_err(Error::transport)?;
        }

        if let Some(speed) = self.speed {
            let actual = probe.set_speed(speed).map_err(Error::transport)?;
            if actual != speed {
                tracing::debug!("Requested {} kHz, probe runs at {} kHz", speed, actual);
            }
        }

        let target = self
            .chip
            .clone()
            .map(TargetSelector::Unspecified)
            .unwrap_or(TargetSelector::Auto);

        let session = probe
            .attach(target, Permissions::default())
            .map_err(|error| {
                tracing::debug!("Failed to attach to target: {}", error);
                Error::TargetNotDetected
            })?;

        let memory_map = &session.target().memory_map;

        let ram = match &self.ram {
            Some(ram) => vec![u64::from(ram.start)..u64::from(ram.end)],
            None => memory_map
                .iter()
                .filter_map(|region| match region {
                    MemoryRegion::Ram(ram) => to_address_space(&ram.range),
                    _ => None,
                })
                .collect(),
        };

        let regions = memory_map
            .iter()
            .filter_map(|region| match region {
                MemoryRegion::Ram(ram) => to_address_space(&ram.range),
                MemoryRegion::Nvm(nvm) => to_address_space(&nvm.range),
                MemoryRegion::Generic(_) => None,
            })
            .collect();

        Ok(ProbeRsConnection {
            session,
            core: self.core,
            ram,
            regions,
        })
    }
}

/// Clamps a memory map range to the 32 bit address space RTT lives in. Regions starting above it
/// are dropped.
fn to_address_space(range: &Range<u64>) -> Option<Range<u64>> {
    const END: u64 = 1 << 32;

    (range.start < END).then(|| range.start..range.end.min(END))
}

/// A `probe-rs` session attached to the target.
pub struct ProbeRsConnection {
    session: Session,
    core: usize,
    ram: Vec<Range<u64>>,
    regions: Vec<Range<u64>>,
}

impl std::fmt::Debug for ProbeRsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRsConnection")
            .field("core", &self.core)
            .field("ram", &self.ram)
            .finish_non_exhaustive()
    }
}

impl Connection for ProbeRsConnection {
    fn current_mode(&mut self) -> Result<ProbeMode, Error> {
        // probe-rs only hands out sessions that are attached in debug mode.
        Ok(ProbeMode::Debug)
    }

    fn enter_debug_mode(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let mut core = self.session.core(self.core)?;

        if core.core_halted()? {
            core.run()?;
        }

        Ok(())
    }

    fn ram(&self) -> Vec<Range<u64>> {
        self.ram.clone()
    }

    fn readable_regions(&self) -> Vec<Range<u64>> {
        self.regions.clone()
    }

    fn read_aligned(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        let mut words = vec![0u32; data.len() / 4];
        self.session
            .core(self.core)?
            .read_32(u64::from(address), &mut words)?;

        for (chunk, word) in data.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        Ok(())
    }

    fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.session
            .core(self.core)?
            .write_8(u64::from(address), data)?;

        Ok(())
    }
}

impl From<probe_rs::Error> for Error {
    fn from(error: probe_rs::Error) -> Self {
        Error::transport(error)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_map_ranges_are_clamped() {
        assert_eq!(
            to_address_space(&(0x2000_0000..0x2002_0000)),
            Some(0x2000_0000..0x2002_0000)
        );
        assert_eq!(
            to_address_space(&(0xFFFF_0000..0x1_0000_0000)),
            Some(0xFFFF_0000..0x1_0000_0000)
        );
        assert_eq!(
            to_address_space(&(0xFFFF_0000..0x1_0001_0000)),
            Some(0xFFFF_0000..0x1_0000_0000)
        );
        assert_eq!(to_address_space(&(0x1_0000_0000..0x1_0001_0000)), None);
    }
}
