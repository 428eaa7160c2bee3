use thiserror::Error;

/// A sensor or relay node could not be reached or answered with something
/// other than the agreed contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommunicationError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl CommunicationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request_failed",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "bad_status",
            Self::Malformed { .. } => "malformed_response",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Request { url, .. }
            | Self::Timeout { url }
            | Self::Status { url, .. }
            | Self::Malformed { url, .. } => url,
        }
    }
}

/// Configuration or persisted data for a single zone is unusable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid period {id}: {reason}")]
    InvalidPeriod { id: String, reason: String },

    #[error("period {new} overlaps existing period {existing}")]
    Overlap { new: String, existing: String },

    #[error("invalid temperature {0}")]
    InvalidTemperature(f64),

    #[error("malformed zone record: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => "empty_field",
            Self::InvalidPeriod { .. } => "invalid_period",
            Self::Overlap { .. } => "overlap",
            Self::InvalidTemperature(_) => "invalid_temperature",
            Self::Malformed(_) => "malformed_record",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn communication_error_exposes_url_and_kind() {
        let err = CommunicationError::Status {
            url: "http://10.0.0.4/status?pin=1".to_string(),
            status: 503,
        };

        assert_eq!(err.kind(), "bad_status");
        assert_eq!(err.url(), "http://10.0.0.4/status?pin=1");
        assert_eq!(
            err.to_string(),
            "http://10.0.0.4/status?pin=1 responded with status 503"
        );
    }
}
