use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidToken,
    TrialPlansExceeded,
    TrialMessagesExceeded,
    TrialActionNotAllowed,
    ContinueNoMessages,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialPlansExceeded {
    pub max_plans: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialMessagesExceeded {
    pub max_replies: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingError {
    #[serde(default)]
    pub has_billing_permission: bool,
    #[serde(default)]
    pub is_insufficient_credits: bool,
}

/// Structured server error. Every non-2xx response decodes into one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{status} Error: {msg}")]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: ApiErrorType,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_plans_exceeded_error: Option<TrialPlansExceeded>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_messages_exceeded_error: Option<TrialMessagesExceeded>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_error: Option<BillingError>,
}

impl ApiError {
    pub fn new(error_type: ApiErrorType, status: u16, msg: impl Into<String>) -> Self {
        Self {
            error_type,
            status,
            msg: msg.into(),
            trial_plans_exceeded_error: None,
            trial_messages_exceeded_error: None,
            billing_error: None,
        }
    }

    pub fn other(status: u16, msg: impl Into<String>) -> Self {
        Self::new(ApiErrorType::Other, status, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::other(404, msg)
    }

    /// Decodes a response body, falling back to the raw text when the server
    /// did not send a structured error.
    pub fn from_response(status: u16, body: &str) -> Self {
        if let Ok(mut parsed) = serde_json::from_str::<ApiError>(body)
            && !parsed.msg.is_empty()
        {
            if parsed.status == 0 {
                parsed.status = status;
            }
            return parsed;
        }
        let msg = body.trim();
        let msg = if msg.is_empty() {
            "request failed".to_string()
        } else {
            msg.chars().take(500).collect()
        };
        let error_type = if status == 401 {
            ApiErrorType::InvalidToken
        } else {
            ApiErrorType::Other
        };
        Self::new(error_type, status, msg)
    }

    pub fn is_invalid_token(&self) -> bool {
        self.error_type == ApiErrorType::InvalidToken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_errors_decode_with_payloads() {
        let body = r#"{"type":"trial_plans_exceeded","status":403,"msg":"limit","trialPlansExceededError":{"maxPlans":10}}"#;
        let err = ApiError::from_response(403, body);
        assert_eq!(err.error_type, ApiErrorType::TrialPlansExceeded);
        assert_eq!(err.trial_plans_exceeded_error.as_ref().map(|e| e.max_plans), Some(10));
        assert_eq!(err.to_string(), "403 Error: limit");
    }

    #[test]
    fn unknown_types_and_plain_bodies_fall_back_to_other() {
        let err = ApiError::from_response(500, r#"{"type":"mystery","status":500,"msg":"x"}"#);
        assert_eq!(err.error_type, ApiErrorType::Other);
        let plain = ApiError::from_response(502, "bad gateway");
        assert_eq!(plain.msg, "bad gateway");
        assert_eq!(plain.status, 502);
        assert!(ApiError::from_response(401, "").is_invalid_token());
    }
}
