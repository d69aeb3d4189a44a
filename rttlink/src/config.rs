use crate::control_block::ScanRegion;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of a polling [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Sleep between ticks while a target is connected, in ms.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Sleep between ticks while no probe or target is detected, in ms.
    #[serde(with = "duration_ms")]
    pub idle_interval: Duration,
    /// Up channel whose data is streamed to the output.
    pub up_channel: usize,
    /// Down channel that receives queued input.
    pub down_channel: usize,
    /// Maximum number of bytes waiting for the down channel.
    pub queue_capacity: usize,
    /// Where to look for the control block.
    pub scan_region: ScanRegion,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            idle_interval: Duration::from_millis(500),
            up_channel: 0,
            down_channel: 0,
            queue_capacity: 1024,
            scan_region: ScanRegion::Ram,
        }
    }
}

impl SessionConfig {
    /// How long to sleep after a tick that ended in `state`.
    pub fn interval_for(&self, state: SessionState) -> Duration {
        match state {
            SessionState::Disconnected | SessionState::Connecting => self.idle_interval,
            SessionState::Locating | SessionState::Streaming => self.poll_interval,
            SessionState::Shutdown => Duration::ZERO,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
