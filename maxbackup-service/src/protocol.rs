//! Wire types for the IPC conversation.
//!
//! One conversation is: one [`PipeRequest`], then zero or more non-final
//! [`PipeResponse`]s, then exactly one final response. Field names accept
//! camelCase and PascalCase spellings.

use serde::{Deserialize, Serialize};

use maxbackup_core::ValidationError;

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeRequest {
    #[serde(alias = "Action", alias = "ACTION")]
    pub action: String,
    #[serde(alias = "Sid", alias = "SID")]
    pub sid: String,
    #[serde(
        rename = "configPath",
        alias = "ConfigPath",
        alias = "configpath",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub config_path: Option<String>,
}

/// Actions the service recognizes; matching is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Register,
    Unregister,
    Status,
}

impl RequestAction {
    pub fn parse(action: &str) -> Option<Self> {
        if action.eq_ignore_ascii_case("register") {
            Some(Self::Register)
        } else if action.eq_ignore_ascii_case("unregister") {
            Some(Self::Unregister)
        } else if action.eq_ignore_ascii_case("status") {
            Some(Self::Status)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Info,
    Success,
    Error,
    Verbose,
}

/// A service response. Exactly one response per conversation has
/// `is_final = true` and it is the last one sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(rename = "isFinal", alias = "is_final")]
    pub is_final: bool,
    #[serde(
        rename = "validationErrors",
        alias = "validation_errors",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub validation_errors: Option<Vec<ValidationError>>,
}

impl PipeResponse {
    /// Non-final progress message.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Info,
            message: message.into(),
            is_final: false,
            validation_errors: None,
        }
    }

    /// Final informational response (e.g. status of an unknown user).
    pub fn info_final(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Info,
            message: message.into(),
            is_final: true,
            validation_errors: None,
        }
    }

    /// Non-final detail message.
    pub fn verbose(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Verbose,
            message: message.into(),
            is_final: false,
            validation_errors: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            is_final: true,
            validation_errors: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            is_final: true,
            validation_errors: None,
        }
    }

    pub fn error_with_validation(
        message: impl Into<String>,
        errors: Vec<ValidationError>,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            is_final: true,
            validation_errors: Some(errors),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parsing_is_case_insensitive() {
        assert_eq!(RequestAction::parse("REGISTER"), Some(RequestAction::Register));
        assert_eq!(RequestAction::parse("register"), Some(RequestAction::Register));
        assert_eq!(RequestAction::parse("Status"), Some(RequestAction::Status));
        assert_eq!(
            RequestAction::parse("unREGISTER"),
            Some(RequestAction::Unregister)
        );
        assert_eq!(RequestAction::parse("FOO"), None);
    }

    #[test]
    fn request_accepts_pascal_case_fields() {
        let request: PipeRequest = serde_json::from_str(
            r#"{"Action":"STATUS","Sid":"S-1-5-21-X","ConfigPath":"/u/x/cfg.json"}"#,
        )
        .expect("deserialize");
        assert_eq!(request.action, "STATUS");
        assert_eq!(request.sid, "S-1-5-21-X");
        assert_eq!(request.config_path.as_deref(), Some("/u/x/cfg.json"));
    }

    #[test]
    fn request_config_path_is_optional() {
        let request: PipeRequest =
            serde_json::from_str(r#"{"action":"STATUS","sid":"S-1"}"#).expect("deserialize");
        assert!(request.config_path.is_none());
    }

    #[test]
    fn response_wire_field_names() {
        let response = PipeResponse::success("done");
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains("\"status\":\"Success\""));
        assert!(json.contains("\"isFinal\":true"));
        assert!(
            !json.contains("validationErrors"),
            "absent errors are omitted"
        );
    }

    #[test]
    fn validation_errors_roundtrip() {
        let response = PipeResponse::error_with_validation(
            "configuration validation failed",
            vec![ValidationError {
                job: None,
                field: "JSON".to_string(),
                error: "Invalid JSON: expected object".to_string(),
            }],
        );
        let json = serde_json::to_string(&response).expect("serialize");
        let back: PipeResponse = serde_json::from_str(&json).expect("deserialize");
        let errors = back.validation_errors.expect("errors");
        assert_eq!(errors[0].field, "JSON");
        assert!(back.is_final);
    }

    #[test]
    fn verbose_status_deserializes() {
        let response: PipeResponse = serde_json::from_str(
            r#"{"status":"Verbose","message":"detail","isFinal":false}"#,
        )
        .expect("deserialize");
        assert_eq!(response.status, ResponseStatus::Verbose);
        assert!(!response.is_final);
    }

    #[test]
    fn constructors_mark_exactly_the_final_ones_final() {
        assert!(!PipeResponse::info("x").is_final);
        assert!(!PipeResponse::verbose("x").is_final);
        assert!(PipeResponse::info_final("x").is_final);
        assert!(PipeResponse::success("x").is_final);
        assert!(PipeResponse::error("x").is_final);
    }
}
