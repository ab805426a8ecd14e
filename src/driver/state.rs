use core::fmt;

use serde::Serialize;

use crate::chain::HandshakeState;
use crate::error::{HarnessError, Phase, Result};

/// Lifecycle of a packet as observed on the two chains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketState {
    /// Committed on the source chain.
    Sent,
    /// Received on the destination chain, commitment still on the source.
    Relayed,
    Acknowledged,
    TimedOut,
}

impl PacketState {
    /// Derives the state from whether the source chain still holds the packet
    /// commitment and whether the destination chain holds a receipt.
    ///
    /// The source deletes the commitment on both acknowledgement and timeout;
    /// the receipt tells the two apart.
    pub fn classify(commitment: bool, receipt: bool) -> Self {
        match (commitment, receipt) {
            (true, false) => PacketState::Sent,
            (true, true) => PacketState::Relayed,
            (false, true) => PacketState::Acknowledged,
            (false, false) => PacketState::TimedOut,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PacketState::Acknowledged | PacketState::TimedOut)
    }
}

impl fmt::Display for PacketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketState::Sent => "SENT",
            PacketState::Relayed => "RELAYED",
            PacketState::Acknowledged => "ACKNOWLEDGED",
            PacketState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Follows one handshake object across polls and rejects regressions.
#[derive(Clone, Debug)]
pub struct HandshakeTracker {
    phase: Phase,
    object: String,
    last: Option<HandshakeState>,
}

impl HandshakeTracker {
    pub fn new(phase: Phase, object: impl Into<String>) -> Self {
        Self {
            phase,
            object: object.into(),
            last: None,
        }
    }

    /// Records an observed state. Returns `Ok(true)` once the object is OPEN.
    pub fn observe(&mut self, state: HandshakeState) -> Result<bool> {
        if state == HandshakeState::Closed {
            return Err(HarnessError::assertion(
                self.phase,
                format!("{} to open", self.object),
                state,
            ));
        }

        if let Some(last) = self.last {
            if state.rank() < last.rank() {
                return Err(HarnessError::assertion(
                    self.phase,
                    format!("{} to progress from {last}", self.object),
                    format!("regression to {state}"),
                ));
            }
        }

        self.last = Some(state);
        Ok(state == HandshakeState::Open)
    }

    pub fn last(&self) -> Option<HandshakeState> {
        self.last
    }
}
