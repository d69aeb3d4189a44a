use crate::channel::{ChannelDescriptor, ChannelMode, Direction, DownChannel, UpChannel};
use crate::config::SessionConfig;
use crate::control_block::ControlBlock;
use crate::memory::{Connection, ProbeMode, Transport};
use crate::queue::{InputBridge, OutboundQueue};
use crate::Error;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a [`Session`] stands between two ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No probe or no target. The next tick tries to connect.
    Disconnected,
    /// A connection is being opened.
    Connecting,
    /// Connected, but the control block address is unknown.
    Locating,
    /// Connected and the control block address is known.
    Streaming,
    /// Cancelled. The session does nothing anymore.
    Shutdown,
}

/// Cooperative cancellation flag, checked by the session once per tick.
///
/// Clones share the flag. [`CancellationToken::flag`] exposes the underlying atomic so it can be
/// handed to a signal handler.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the session to shut down at the start of its next tick.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The shared flag. Setting it to `true` is the same as calling [`CancellationToken::cancel`].
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Description of one channel slot of a control block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub direction: Direction,
    pub number: usize,
    pub name: Option<String>,
    pub buffer_size: u32,
    pub mode: Option<ChannelMode>,
    /// `false` if the target has not set up a buffer for the channel yet.
    pub initialized: bool,
}

impl ChannelInfo {
    fn read<C: Connection>(
        descriptor: &ChannelDescriptor,
        connection: &mut C,
    ) -> Result<ChannelInfo, Error> {
        let initialized = descriptor.is_initialized();

        Ok(ChannelInfo {
            direction: descriptor.direction(),
            number: descriptor.number(),
            name: if initialized {
                descriptor.read_name(connection)?
            } else {
                None
            },
            buffer_size: descriptor.buffer_size(),
            mode: descriptor.mode(),
            initialized,
        })
    }
}

/// All channels of a control block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelList {
    pub up: Vec<ChannelInfo>,
    pub down: Vec<ChannelInfo>,
}

/// Drives the connect, locate and stream cycle against one transport.
///
/// Every [`Session::tick`] opens a connection, does the work the current state allows and closes
/// the connection again. There is no other way to notice a target that went away, as the
/// transport reports no link state. Any transport failure invalidates the control block address.
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    queue: OutboundQueue,
    cancel: CancellationToken,
    state: SessionState,
    control_block: Option<ControlBlock>,
    up_buffer: Vec<u8>,
}

impl<T: Transport> Session<T> {
    /// Creates a disconnected session. Bytes pushed into `queue` are sent to the configured down
    /// channel, the session stops once `cancel` is cancelled.
    pub fn new(
        transport: T,
        config: SessionConfig,
        queue: OutboundQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            config,
            queue,
            cancel,
            state: SessionState::Disconnected,
            control_block: None,
            up_buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The control block located in the current epoch, if any.
    pub fn control_block(&self) -> Option<&ControlBlock> {
        self.control_block.as_ref()
    }

    /// Returns another producer handle for the outbound queue.
    pub fn input(&self) -> InputBridge {
        self.queue.bridge()
    }

    /// Runs one connect, locate and stream cycle and returns the state the session ended up in.
    ///
    /// Data read from the up channel is written to `sink`. Failures of the probe link are not
    /// returned but handled by moving to [`SessionState::Disconnected`]. The only errors are
    /// [`Error::Output`] if `sink` fails and [`Error::ShutdownRequested`] if the session has
    /// already shut down.
    pub fn tick(&mut self, sink: &mut impl Write) -> Result<SessionState, Error> {
        if self.state == SessionState::Shutdown {
            return Err(Error::ShutdownRequested);
        }

        if self.cancel.is_cancelled() {
            self.shutdown();
            return Ok(self.state);
        }

        let previous = self.state;
        let result = self.tick_inner(sink);

        if self.state != previous {
            tracing::debug!("Session state {:?} -> {:?}", previous, self.state);
        }

        result.map(|()| self.state)
    }

    fn tick_inner(&mut self, sink: &mut impl Write) -> Result<(), Error> {
        self.state = SessionState::Connecting;

        let mut connection = match self.connect() {
            Ok(connection) => connection,
            Err(error) => {
                self.lose_link(&error);
                return Ok(());
            }
        };

        let result = self.service(&mut connection, sink);
        let result = result.and(connection.close());

        match result {
            Ok(()) => Ok(()),
            Err(Error::Output(error)) => Err(Error::Output(error)),
            Err(error) if error.is_link_failure() => {
                self.lose_link(&error);
                Ok(())
            }
            Err(Error::ControlBlockNotFound) => {
                self.invalidate(&Error::ControlBlockNotFound);
                self.state = SessionState::Locating;
                Ok(())
            }
            Err(error) => {
                tracing::warn!("{}", error);
                self.invalidate(&error);
                self.state = SessionState::Locating;
                Ok(())
            }
        }
    }

    /// Calls [`Session::tick`] until the session is cancelled, sleeping between ticks as
    /// configured.
    pub fn run(&mut self, sink: &mut impl Write) -> Result<(), Error> {
        loop {
            let state = self.tick(sink)?;

            if state == SessionState::Shutdown {
                return Ok(());
            }

            std::thread::sleep(self.config.interval_for(state));
        }
    }

    /// Releases the control block mirror, discards queued input and moves to
    /// [`SessionState::Shutdown`]. Connections never outlive a tick, so none is open here.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Shutdown {
            return;
        }

        self.control_block = None;
        self.up_buffer = Vec::new();

        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!("Discarded {} queued bytes on shutdown", discarded);
        }

        tracing::debug!("Session state {:?} -> {:?}", self.state, SessionState::Shutdown);
        self.state = SessionState::Shutdown;
    }

    /// Connects, locates the control block and describes all of its channels.
    ///
    /// This does not touch the state of the session.
    pub fn list_channels(&mut self) -> Result<ChannelList, Error> {
        let mut connection = self.connect()?;
        let control_block = ControlBlock::attach_region(&mut connection, &self.config.scan_region)?;

        let mut list = ChannelList::default();

        for descriptor in control_block.up_channels().iter().map(UpChannel::descriptor) {
            list.up.push(ChannelInfo::read(descriptor, &mut connection)?);
        }

        for descriptor in control_block
            .down_channels()
            .iter()
            .map(DownChannel::descriptor)
        {
            list.down.push(ChannelInfo::read(descriptor, &mut connection)?);
        }

        connection.close()?;

        Ok(list)
    }

    fn connect(&mut self) -> Result<T::Connection, Error> {
        let mut connection = self.transport.open()?;

        let mode = connection.current_mode()?;
        if mode != ProbeMode::Debug {
            tracing::debug!("Probe is in {:?} mode, switching to debug mode", mode);
            connection.enter_debug_mode()?;
            connection.run()?;
        }

        if connection.ram().iter().all(|region| region.is_empty()) {
            return Err(Error::TargetNotDetected);
        }

        Ok(connection)
    }

    fn service<C: Connection>(
        &mut self,
        connection: &mut C,
        sink: &mut impl Write,
    ) -> Result<(), Error> {
        let control_block = match self.control_block.as_mut() {
            Some(control_block) => {
                control_block.refresh(connection)?;
                control_block
            }
            None => {
                self.state = SessionState::Locating;

                let control_block =
                    ControlBlock::attach_region(connection, &self.config.scan_region)?;
                tracing::info!("RTT control block found at {:#010x}", control_block.ptr());

                self.control_block.insert(control_block)
            }
        };

        self.state = SessionState::Streaming;

        if let Some(channel) = control_block.up_channel(self.config.up_channel) {
            self.up_buffer.clear();

            if channel.read(connection, &mut self.up_buffer)? > 0 {
                sink.write_all(&self.up_buffer)?;
                sink.flush()?;
            }
        }

        if let Some(channel) = control_block.down_channel(self.config.down_channel) {
            let pending = self.queue.take();

            if !pending.is_empty() {
                let written = channel.write(connection, &pending)?;

                if written < pending.len() {
                    tracing::debug!(
                        "Down channel {} is full, dropped {} bytes",
                        channel.number(),
                        pending.len() - written
                    );
                }
            }
        }

        Ok(())
    }

    fn lose_link(&mut self, error: &Error) {
        tracing::debug!("Target unavailable: {}", error);
        self.invalidate(error);
        self.state = SessionState::Disconnected;
    }

    /// Forgets the control block address. Input queued for the old block is discarded.
    fn invalidate(&mut self, reason: &Error) {
        let Some(control_block) = self.control_block.take() else {
            return;
        };

        self.up_buffer = Vec::new();

        tracing::info!(
            "Lost RTT control block at {:#010x}: {}",
            control_block.ptr(),
            reason
        );

        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!("Discarded {} queued bytes", discarded);
        }
    }
}
