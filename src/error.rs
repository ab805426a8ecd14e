use core::fmt;

use thiserror::Error;

/// The protocol phase a conformance run was in when something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provision,
    Construct,
    ChainsRunning,
    RelayerReady,
    ClientHandshake,
    ConnectionHandshake,
    ChannelHandshake,
    SendPacket,
    RelayPacket,
    AcknowledgePacket,
    TimeoutPacket,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Provision => "provision",
            Phase::Construct => "construct",
            Phase::ChainsRunning => "chains-running",
            Phase::RelayerReady => "relayer-ready",
            Phase::ClientHandshake => "client-handshake",
            Phase::ConnectionHandshake => "connection-handshake",
            Phase::ChannelHandshake => "channel-handshake",
            Phase::SendPacket => "send-packet",
            Phase::RelayPacket => "relay-packet",
            Phase::AcknowledgePacket => "acknowledge-packet",
            Phase::TimeoutPacket => "timeout-packet",
            Phase::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Reasons a relayer handle could not be built.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("relayer image {image} is not available")]
    ImageUnavailable {
        image: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to configure relayer: {0:#}")]
    Configure(#[source] anyhow::Error),
    #[error("failed to launch relayer: {0:#}")]
    Launch(#[source] anyhow::Error),
}

/// Every way a conformance run can fail. Each variant terminates the run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("provisioning chain {chain}: {source:#}")]
    Provisioning {
        chain: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("constructing relayer: {0}")]
    Construction(#[from] ConstructionError),

    #[error(
        "[{phase}] liveness bound exceeded after {attempts} attempts waiting for {waiting_for}; last observed: {last_observed}"
    )]
    LivenessBoundExceeded {
        phase: Phase,
        waiting_for: String,
        attempts: u32,
        last_observed: String,
    },

    #[error("[{phase}] expected {expected}, observed {actual}")]
    ProtocolAssertion {
        phase: Phase,
        expected: String,
        actual: String,
    },

    #[error("[{phase}] relayer process exited with status {code:?}: {detail}")]
    ProcessExit {
        phase: Phase,
        code: Option<i64>,
        detail: String,
    },
}

impl HarnessError {
    pub fn provisioning(chain: impl Into<String>, source: anyhow::Error) -> Self {
        HarnessError::Provisioning {
            chain: chain.into(),
            source,
        }
    }

    pub fn assertion(
        phase: Phase,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        HarnessError::ProtocolAssertion {
            phase,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// The phase the failure is attributed to, for reporting.
    pub fn phase(&self) -> Phase {
        match self {
            HarnessError::Provisioning { .. } => Phase::Provision,
            HarnessError::Construction(_) => Phase::Construct,
            HarnessError::LivenessBoundExceeded { phase, .. } => *phase,
            HarnessError::ProtocolAssertion { phase, .. } => *phase,
            HarnessError::ProcessExit { phase, .. } => *phase,
        }
    }

    /// True when a bounded wait ran out, as opposed to an observed violation.
    pub fn is_liveness(&self) -> bool {
        matches!(self, HarnessError::LivenessBoundExceeded { .. })
    }
}

pub type Result<T, E = HarnessError> = core::result::Result<T, E>;
