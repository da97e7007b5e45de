use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SessionBusy,
    AgentFailure,
    TransportDisconnect,
    CatalogUnavailable,
    BrokerTimeout,
    BrokerDisconnect,
    LiveDataDisabled,
    RuntimeUnavailable,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:edge-relay:error:invalid_request",
            Self::SessionBusy => "urn:edge-relay:error:session_busy",
            Self::AgentFailure => "urn:edge-relay:error:agent_failure",
            Self::TransportDisconnect => "urn:edge-relay:error:transport_disconnect",
            Self::CatalogUnavailable => "urn:edge-relay:error:catalog_unavailable",
            Self::BrokerTimeout => "urn:edge-relay:error:broker_timeout",
            Self::BrokerDisconnect => "urn:edge-relay:error:broker_disconnect",
            Self::LiveDataDisabled => "urn:edge-relay:error:live_data_disabled",
            Self::RuntimeUnavailable => "urn:edge-relay:error:runtime_unavailable",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SessionBusy => "Session Busy",
            Self::AgentFailure => "Agent Failure",
            Self::TransportDisconnect => "Transport Disconnect",
            Self::CatalogUnavailable => "Catalog Unavailable",
            Self::BrokerTimeout => "Broker Timeout",
            Self::BrokerDisconnect => "Broker Disconnect",
            Self::LiveDataDisabled => "Live Data Disabled",
            Self::RuntimeUnavailable => "Runtime Unavailable",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SessionBusy => 409,
            Self::AgentFailure => 502,
            // Never actually sent: the caller is gone by definition.
            Self::TransportDisconnect => 499,
            Self::CatalogUnavailable => 503,
            Self::BrokerTimeout => 504,
            Self::BrokerDisconnect => 502,
            Self::LiveDataDisabled => 409,
            Self::RuntimeUnavailable => 503,
        }
    }
}

/// RFC 7807 problem document returned on every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("a query is already in flight for session {session_id}")]
    SessionBusy { session_id: String },
    #[error("agent runtime failed: {message}")]
    AgentFailure { message: String },
    #[error("caller disconnected mid-stream")]
    TransportDisconnect,
    #[error("tool catalog unavailable: {message}")]
    CatalogUnavailable { message: String },
    #[error("no message received on {topic} before the timeout")]
    BrokerTimeout { topic: String },
    #[error("broker connection lost on {topic}")]
    BrokerDisconnect { topic: String },
    #[error("live data collection is disabled")]
    LiveDataDisabled,
    #[error("agent runtime unavailable: {message}")]
    RuntimeUnavailable { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionBusy { .. } => ErrorType::SessionBusy,
            Self::AgentFailure { .. } => ErrorType::AgentFailure,
            Self::TransportDisconnect => ErrorType::TransportDisconnect,
            Self::CatalogUnavailable { .. } => ErrorType::CatalogUnavailable,
            Self::BrokerTimeout { .. } => ErrorType::BrokerTimeout,
            Self::BrokerDisconnect { .. } => ErrorType::BrokerDisconnect,
            Self::LiveDataDisabled => ErrorType::LiveDataDisabled,
            Self::RuntimeUnavailable { .. } => ErrorType::RuntimeUnavailable,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SessionBusy { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::BrokerTimeout { topic } | Self::BrokerDisconnect { topic } => {
                extensions.insert("topic".to_string(), Value::String(topic.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_urn_and_status() {
        let err = RelayError::SessionBusy {
            session_id: "abc".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.type_, "urn:edge-relay:error:session_busy");
        assert_eq!(problem.status, 409);
        assert_eq!(
            problem.extensions.get("sessionId"),
            Some(&Value::String("abc".to_string()))
        );
    }

    #[test]
    fn broker_errors_name_the_topic() {
        let err = RelayError::BrokerTimeout {
            topic: "plant/line1/temp".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 504);
        assert_eq!(
            problem.extensions.get("topic"),
            Some(&Value::String("plant/line1/temp".to_string()))
        );
    }
}
