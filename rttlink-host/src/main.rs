mod config;
mod logging;

use anyhow::Context;
use clap::Parser;
use probe_rs::probe::{list::Lister, DebugProbeInfo, WireProtocol};
use rttlink::{
    CancellationToken, ChannelInfo, InputBridge, OutboundQueue, ScanRegion, Session,
};
use signal_hook::consts::signal;
use std::io::prelude::*;
use std::io::{stdin, stdout};
use std::path::PathBuf;
use std::thread;

use crate::config::{Config, Configs};
use crate::logging::LevelFilter;

fn parse_scan_region(
    mut src: &str,
) -> Result<ScanRegion, Box<dyn std::error::Error + Send + Sync + 'static>> {
    src = src.trim();
    if src.is_empty() || src == "ram" {
        return Ok(ScanRegion::Ram);
    }

    let parts = src
        .split("..")
        .map(|p| {
            if let Some(hex) = p.strip_prefix("0x").or_else(|| p.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16)
            } else {
                p.parse()
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    match *parts.as_slice() {
        [addr] => Ok(ScanRegion::Exact(addr)),
        [start, end] if start < end => Ok(ScanRegion::Range(start..end)),
        [_, _] => Err("Invalid range: start must be below end".into()),
        _ => Err("Invalid range: multiple '..'s".into()),
    }
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rttlink",
    version,
    about = "Streams RTT (real-time transfer) channels between a microcontroller and stdin/stdout."
)]
struct Opts {
    /// Index of the probe to use, see `--list-probes`.
    #[clap(short, long)]
    probe: Option<usize>,

    /// Serial number of the probe to use.
    #[clap(long)]
    serial: Option<String>,

    /// Target chip type. Leave unspecified to auto-detect.
    #[clap(short, long)]
    chip: Option<String>,

    /// Wire protocol to talk to the target with.
    #[clap(long)]
    protocol: Option<WireProtocol>,

    /// Wire speed in kHz.
    #[clap(long)]
    speed: Option<u32>,

    /// Number of the up channel to print.
    #[clap(short, long)]
    up: Option<usize>,

    /// Number of the down channel that receives stdin.
    #[clap(short, long)]
    down: Option<usize>,

    /// Memory region to scan for the control block. You can specify either an exact starting
    /// address '0x1000' or a range such as '0x0000..0x1000'. Both decimal and hex are accepted.
    #[clap(long, value_parser = parse_scan_region)]
    scan_region: Option<ScanRegion>,

    /// List RTT channels and exit.
    #[clap(short, long)]
    list: bool,

    /// List available probes and exit.
    #[clap(long)]
    list_probes: bool,

    #[clap(long, value_enum)]
    log_level: Option<LevelFilter>,

    /// Additional TOML config file, merged on top of the config files in the working directory.
    #[clap(long, env = "RTTLINK_CONFIG")]
    config: Option<PathBuf>,
}

impl Opts {
    /// Command line flags take precedence over every config layer.
    fn apply(&self, config: &mut Config) {
        if let Some(index) = self.probe {
            config.probe.index = index;
        }
        if let Some(serial) = &self.serial {
            config.probe.serial = Some(serial.clone());
        }
        if let Some(chip) = &self.chip {
            config.probe.chip = Some(chip.clone());
        }
        if let Some(protocol) = self.protocol {
            config.probe.protocol = Some(protocol);
        }
        if let Some(speed) = self.speed {
            config.probe.speed = Some(speed);
        }
        if let Some(up) = self.up {
            config.rtt.up_channel = up;
        }
        if let Some(down) = self.down {
            config.rtt.down_channel = down;
        }
        if let Some(scan_region) = &self.scan_region {
            config.rtt.scan_region = scan_region.clone();
        }
        if let Some(log_level) = self.log_level {
            config.general.log_level = Some(log_level);
        }
    }
}

fn main() {
    let opts = Opts::parse();

    if let Err(error) = run(opts) {
        eprintln!("Error: {error:?}");
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> anyhow::Result<()> {
    let mut configs = Configs::new(&std::env::current_dir()?);
    if let Some(path) = &opts.config {
        configs.merge(path.clone())?;
    }

    let mut config = configs.extract()?;
    opts.apply(&mut config);

    logging::setup_logging(config.general.log_level);

    if opts.list_probes {
        list_probes(stdout(), &Lister::new().list_all())?;
        return Ok(());
    }

    let queue = OutboundQueue::new(config.rtt.queue_capacity);
    let input = queue.bridge();

    let cancel = CancellationToken::new();
    // A second Ctrl-C while shutting down terminates the process.
    signal_hook::flag::register_conditional_default(signal::SIGINT, cancel.flag())
        .context("Failed to install the Ctrl-C handler")?;
    signal_hook::flag::register(signal::SIGINT, cancel.flag())
        .context("Failed to install the Ctrl-C handler")?;

    let mut session = Session::new(config.probe.transport(), config.rtt, queue, cancel);

    if opts.list {
        let channels = session
            .list_channels()
            .context("Failed to read the RTT channels")?;

        let mut out = stdout().lock();
        writeln!(out, "Up channels:")?;
        list_channels(&mut out, &channels.up)?;
        writeln!(out, "Down channels:")?;
        list_channels(&mut out, &channels.down)?;

        return Ok(());
    }

    spawn_stdin_reader(input);

    tracing::info!("Waiting for the target, press Ctrl-C to exit");

    session.run(&mut stdout().lock())?;

    tracing::debug!("Shut down");

    Ok(())
}

fn list_probes(mut stream: impl Write, probes: &[DebugProbeInfo]) -> std::io::Result<()> {
    if probes.is_empty() {
        writeln!(stream, "No debug probes were found.")?;
        return Ok(());
    }

    writeln!(stream, "Available probes:")?;

    for (i, probe) in probes.iter().enumerate() {
        writeln!(
            stream,
            "  {}: {} {}",
            i,
            probe.identifier,
            probe
                .serial_number
                .as_deref()
                .unwrap_or("(no serial number)")
        )?;
    }

    Ok(())
}

fn list_channels(mut stream: impl Write, channels: &[ChannelInfo]) -> std::io::Result<()> {
    if channels.is_empty() {
        writeln!(stream, "  (none)")?;
        return Ok(());
    }

    for channel in channels {
        if !channel.initialized {
            writeln!(stream, "  {}: (not initialized)", channel.number)?;
            continue;
        }

        let mode = match channel.mode {
            Some(mode) => format!("{mode:?}"),
            None => String::from("invalid mode"),
        };

        writeln!(
            stream,
            "  {}: {} (buffer size {}, {})",
            channel.number,
            channel.name.as_deref().unwrap_or("(no name)"),
            channel.buffer_size,
            mode,
        )?;
    }

    Ok(())
}

/// Forwards stdin to the down channel queue until stdin is closed.
fn spawn_stdin_reader(input: InputBridge) {
    thread::spawn(move || {
        let mut buf = [0u8; 1024];

        loop {
            match stdin().read(&mut buf[..]) {
                Ok(0) => {
                    tracing::debug!("stdin closed, input disabled");
                    break;
                }
                Ok(count) => {
                    input.push(&buf[..count]);
                }
                Err(err) => {
                    tracing::warn!("Error reading from stdin, input disabled: {}", err);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rttlink::{ChannelMode, Direction};

    #[test]
    fn scan_region_from_command_line() {
        assert_eq!(parse_scan_region("").unwrap(), ScanRegion::Ram);
        assert_eq!(parse_scan_region("ram").unwrap(), ScanRegion::Ram);
        assert_eq!(
            parse_scan_region("0x20000000").unwrap(),
            ScanRegion::Exact(0x2000_0000)
        );
        assert_eq!(
            parse_scan_region("4096..0x2000").unwrap(),
            ScanRegion::Range(4096..0x2000)
        );
        assert!(parse_scan_region("0x2000..0x1000").is_err());
        assert!(parse_scan_region("1..2..3").is_err());
        assert!(parse_scan_region("0xnope").is_err());
    }

    #[test]
    fn flags_override_config() {
        let opts = Opts::parse_from([
            "rttlink",
            "--up",
            "1",
            "--chip",
            "STM32F411RETx",
            "--scan-region",
            "0x20000000..0x20001000",
        ]);
        let mut config = Configs::new(std::path::Path::new("/nonexistent"))
            .extract()
            .unwrap();

        opts.apply(&mut config);

        assert_eq!(config.rtt.up_channel, 1);
        assert_eq!(config.rtt.down_channel, 0);
        assert_eq!(config.probe.chip.as_deref(), Some("STM32F411RETx"));
        assert_eq!(
            config.rtt.scan_region,
            ScanRegion::Range(0x2000_0000..0x2000_1000)
        );
    }

    #[test]
    fn channel_listing() {
        let channels = [
            ChannelInfo {
                direction: Direction::Up,
                number: 0,
                name: Some(String::from("Terminal")),
                buffer_size: 1024,
                mode: Some(ChannelMode::NoBlockTrim),
                initialized: true,
            },
            ChannelInfo {
                direction: Direction::Up,
                number: 1,
                name: None,
                buffer_size: 0,
                mode: Some(ChannelMode::NoBlockSkip),
                initialized: false,
            },
        ];

        let mut out = Vec::new();
        list_channels(&mut out, &channels).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "  0: Terminal (buffer size 1024, NoBlockTrim)\n  1: (not initialized)\n"
        );
    }
}
