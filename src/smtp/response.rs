//! SMTP response handling

use crate::smtp::error::SmtpError;

/// Represents an SMTP response that can be sent to a client
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpResponse {
    /// The SMTP response code (e.g., "250", "354", "500")
    pub code: String,
    /// The human-readable message
    pub message: String,
    /// Continuation lines for EHLO responses
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    /// Create a new SMTP response
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            multiline: None,
        }
    }

    /// Create a new multiline SMTP response
    pub fn new_multiline(code: &str, message: &str, lines: Vec<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.to_owned(),
            multiline: Some(lines),
        }
    }

    /// Create a success response (250 OK)
    pub fn ok() -> Self {
        Self::new("250", "OK")
    }

    /// Create a greeting response (220)
    pub fn greeting(hostname: &str) -> Self {
        Self::new("220", &format!("{hostname} SMTP service ready"))
    }

    /// Create a HELO response (250)
    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new("250", &format!("{hostname} Hello {client_domain}"))
    }

    /// Create an EHLO response (250) listing the supported extensions
    pub fn ehlo(hostname: &str, client_domain: &str) -> Self {
        Self::new_multiline(
            "250",
            &format!("{hostname} Hello {client_domain}"),
            vec!["HELP".to_owned()],
        )
    }

    /// Create a DATA intermediate response (354)
    pub fn data_start() -> Self {
        Self::new("354", "Start mail input; end with <CRLF>.<CRLF>")
    }

    /// Create a QUIT response (221)
    pub fn quit() -> Self {
        Self::new("221", "Bye")
    }

    pub fn help() -> Self {
        Self::new("214", "No help available")
    }

    pub fn cannot_verify() -> Self {
        Self::new(
            "252",
            "Cannot VRFY user, but will accept message and attempt delivery",
        )
    }

    /// Create an error response from a protocol error
    pub fn from_error(error: &SmtpError) -> Self {
        Self::new(error.to_response_code(), &error.to_response_message())
    }

    /// Format the response for sending over the wire
    pub fn format(&self) -> String {
        if let Some(ref lines) = self.multiline {
            let mut result = format!("{}-{}\r\n", self.code, self.message);
            for (i, line) in lines.iter().enumerate() {
                if i == lines.len() - 1 {
                    // Last line uses space instead of dash
                    result.push_str(&format!("{} {}\r\n", self.code, line));
                } else {
                    result.push_str(&format!("{}-{}\r\n", self.code, line));
                }
            }
            result
        } else {
            format!("{} {}\r\n", self.code, self.message)
        }
    }

    /// Check if this is a success response (2xx)
    pub fn is_success(&self) -> bool {
        self.code.starts_with('2')
    }

    /// Check if this is an error response (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.code.starts_with('4') || self.code.starts_with('5')
    }
}
