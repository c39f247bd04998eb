//! Message renderings for display

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use wsinspect_common::MessageBody;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown format '{0}', expected one of PLAIN, JSON, BASE64, HEXADECIMAL")]
    Unknown(String),
}

/// How message payloads are shown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageFormat {
    #[default]
    Plain,
    Json,
    Base64,
    Hexadecimal,
}

impl MessageFormat {
    pub const ALL: [MessageFormat; 4] = [
        MessageFormat::Plain,
        MessageFormat::Json,
        MessageFormat::Base64,
        MessageFormat::Hexadecimal,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MessageFormat::Plain => "Plain",
            MessageFormat::Json => "JSON",
            MessageFormat::Base64 => "Base64",
            MessageFormat::Hexadecimal => "Hexadecimal",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageFormat::Plain => "PLAIN",
            MessageFormat::Json => "JSON",
            MessageFormat::Base64 => "BASE64",
            MessageFormat::Hexadecimal => "HEXADECIMAL",
        }
    }

    /// Render a payload, failing when it does not fit the format
    pub fn render(&self, body: &MessageBody) -> Result<String, FormatError> {
        let bytes = body.as_bytes();
        match self {
            MessageFormat::Plain => match body {
                MessageBody::Text(text) => Ok(text.clone()),
                _ => Ok(std::str::from_utf8(bytes)?.to_owned()),
            },
            MessageFormat::Json => {
                let value: serde_json::Value = serde_json::from_slice(bytes)?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
            MessageFormat::Base64 => Ok(STANDARD.encode(bytes)),
            MessageFormat::Hexadecimal => Ok(hex::encode(bytes)),
        }
    }

    /// Render a payload, showing a failure as `<error>`
    pub fn render_or_placeholder(&self, body: &MessageBody) -> String {
        self.render(body).unwrap_or_else(|e| format!("<{}>", e))
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MessageFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageFormat::ALL
            .into_iter()
            .find(|format| {
                format.name().eq_ignore_ascii_case(s) || format.label().eq_ignore_ascii_case(s)
            })
            .or_else(|| s.eq_ignore_ascii_case("hex").then_some(MessageFormat::Hexadecimal))
            .ok_or_else(|| FormatError::Unknown(s.to_string()))
    }
}
