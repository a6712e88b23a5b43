// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod forwarder;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

pub use forwarder::{
    DEFAULT_FORWARD_TIMEOUT, ForwardError, TransactionForwarder, is_no_sequencer_message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencerMode {
    #[default]
    Inactive,
    Active,
    Paused,
    Forwarding,
}

impl fmt::Display for SequencerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Forwarding => "forwarding",
        };
        f.write_str(name)
    }
}

impl FromStr for SequencerMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "forwarding" => Ok(Self::Forwarding),
            other => Err(format!("unknown sequencer mode: {other}")),
        }
    }
}

/// Mode and forwarder as observed together.
#[derive(Debug, Clone, Default)]
pub struct SequencerSnapshot {
    pub mode: SequencerMode,
    pub forwarder: Option<Arc<TransactionForwarder>>,
}

impl SequencerSnapshot {
    pub fn is_active(&self) -> bool {
        self.mode == SequencerMode::Active
    }
}

#[derive(Debug)]
pub struct SequencerState {
    current: Mutex<SequencerSnapshot>,
    forward_timeout: Duration,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self::new(DEFAULT_FORWARD_TIMEOUT)
    }
}

impl SequencerState {
    pub fn new(forward_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(SequencerSnapshot::default()),
            forward_timeout,
        }
    }

    pub fn snapshot(&self) -> SequencerSnapshot {
        self.lock().clone()
    }

    pub fn mode(&self) -> SequencerMode {
        self.lock().mode
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    pub fn forwarder(&self) -> Option<Arc<TransactionForwarder>> {
        self.lock().forwarder.clone()
    }

    pub fn activate(&self) {
        self.replace(SequencerMode::Active, None);
        info!("sequencer activated");
    }

    pub fn pause(&self) {
        self.replace(SequencerMode::Paused, None);
        info!("sequencer paused");
    }

    /// Switches to forwarding. Re-targeting the current URL keeps the existing forwarder.
    pub fn forward_to(&self, url: &str) -> Result<(), ForwardError> {
        let mut current = self.lock();
        if let Some(existing) = &current.forwarder {
            if existing.primary_target() == url {
                warn!(url, "forward target unchanged");
                current.mode = SequencerMode::Forwarding;
                return Ok(());
            }
        }

        let forwarder = Arc::new(TransactionForwarder::new(url, self.forward_timeout)?);
        let previous = std::mem::replace(
            &mut *current,
            SequencerSnapshot {
                mode: SequencerMode::Forwarding,
                forwarder: Some(forwarder),
            },
        );
        drop(current);

        if let Some(previous) = previous.forwarder {
            previous.disable();
        }
        info!(url, "sequencer forwarding");
        Ok(())
    }

    fn replace(&self, mode: SequencerMode, forwarder: Option<Arc<TransactionForwarder>>) {
        let previous = std::mem::replace(&mut *self.lock(), SequencerSnapshot { mode, forwarder });
        if let Some(previous) = previous.forwarder {
            previous.disable();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SequencerSnapshot> {
        self.current.lock().expect("sequencer state mutex poisoned")
    }
}
