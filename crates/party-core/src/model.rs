//! Shared data model: samples, prediction shares, status values, and the
//! closed batch-size enumeration the inference binary is compiled for.

use serde::{Deserialize, Serialize};

/// `12 + 187*8 + 16` bytes: nonce || ciphertext || tag.
pub const SAMPLE_LEN: usize = 12 + 187 * 8 + 16;

/// One encrypted time-series sample as received from Obelisk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample(pub Vec<u8>);

impl Sample {
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() == SAMPLE_LEN {
            Some(Self(bytes))
        } else {
            None
        }
    }

    pub fn nonce(&self) -> &[u8] {
        &self.0[..12]
    }

    pub fn ciphertext_and_tag(&self) -> &[u8] {
        &self.0[12..]
    }
}

/// Replicated share of one `(x_i, x_{i+1})` pair over Z/2^64Z.
pub type RingSharePair = (u64, u64);

/// Exactly 5 pairs — reconstructs via `sum(shares) mod 2^64 / 2^8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionShare(pub [RingSharePair; 5]);

impl PredictionShare {
    pub fn from_vec(v: Vec<RingSharePair>) -> Option<Self> {
        let arr: [RingSharePair; 5] = v.try_into().ok()?;
        Some(Self(arr))
    }
}

/// The closed enumeration of batch sizes the inference binary is compiled
/// for; any other flattened request size is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchSize {
    One = 1,
    Two = 2,
    Four = 4,
    SixtyFour = 64,
    OneTwentyEight = 128,
}

impl BatchSize {
    pub fn from_count(n: usize) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            64 => Some(Self::SixtyFour),
            128 => Some(Self::OneTwentyEight),
            _ => None,
        }
    }

    pub fn as_usize(self) -> usize {
        self as usize
    }

    /// Program name suffix, e.g. `heartbeat_inference_demo_batched_64`.
    pub fn program_suffix(self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Two => "2",
            Self::Four => "4",
            Self::SixtyFour => "64",
            Self::OneTwentyEight => "128",
        }
    }
}

/// Status column values. `Sent` is a legacy intermediate value no longer
/// written by this implementation but still read for backward
/// compatibility; it projects to `RUNNING` like `StartingComputation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisStatus {
    Queuing,
    StartingComputation,
    Sent,
    Completed,
    Error { code: u16, message: String },
}

impl AnalysisStatus {
    pub fn encode(&self) -> String {
        match self {
            Self::Queuing => "Queuing".to_string(),
            Self::StartingComputation => "Starting computation".to_string(),
            Self::Sent => "Sent".to_string(),
            Self::Completed => "Completed".to_string(),
            Self::Error { code, message } => format!("ERROR:{code}:{message}"),
        }
    }

    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("ERROR:") {
            let mut parts = rest.splitn(2, ':');
            let code = parts.next().and_then(|s| s.parse().ok()).unwrap_or(500);
            let message = parts.next().unwrap_or_default().to_string();
            return Self::Error { code, message };
        }
        if raw.starts_with("Starting computation") {
            return Self::StartingComputation;
        }
        if raw.starts_with("Sent") {
            return Self::Sent;
        }
        if raw.starts_with("Queuing") {
            return Self::Queuing;
        }
        if raw.starts_with("Completed") {
            return Self::Completed;
        }
        // Empty/unknown: caller projects this to FAILED.
        Self::Error {
            code: 500,
            message: "Troubleshooting required".to_string(),
        }
    }
}

/// The projection a `GET /status/<id>` handler returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum StatusProjection {
    #[serde(rename = "QUEUING")]
    Queuing,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed { details: String },
}

impl StatusProjection {
    pub fn from_status(status: &AnalysisStatus) -> Self {
        match status {
            AnalysisStatus::Queuing => Self::Queuing,
            AnalysisStatus::StartingComputation | AnalysisStatus::Sent => Self::Running,
            AnalysisStatus::Completed => Self::Completed,
            AnalysisStatus::Error { message, .. } => Self::Failed {
                details: message.clone(),
            },
        }
    }
}

impl StatusProjection {
    /// The HTTP code surfaced to the caller: an `ERROR:<code>:…` status
    /// carries its own code, everything else is 200.
    pub fn http_code_for(status: &AnalysisStatus) -> u16 {
        match status {
            AnalysisStatus::Error { code, .. } => *code,
            _ => 200,
        }
    }
}
