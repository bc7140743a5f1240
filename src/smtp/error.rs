//! Error types for the SMTP server

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid command")]
    InvalidCommand,

    #[error("Invalid state for command")]
    InvalidState(String),

    #[error("Invalid syntax")]
    InvalidSyntax(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Message index {index} out of range ({count} messages stored)")]
    IndexOutOfRange { index: usize, count: usize },
}

/// Maps SMTP errors to appropriate response codes
impl SmtpError {
    pub fn to_response_code(&self) -> &'static str {
        match self {
            SmtpError::InvalidCommand => "500",
            SmtpError::InvalidState(_) => "503",
            SmtpError::InvalidSyntax(_) => "501",
            SmtpError::Bind { .. }
            | SmtpError::Io(_)
            | SmtpError::ConnectionClosed
            | SmtpError::IndexOutOfRange { .. } => "421",
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::InvalidCommand => "Syntax error, command unrecognized".to_string(),
            SmtpError::InvalidState(msg) => format!("Bad sequence of commands: {msg}"),
            SmtpError::InvalidSyntax(msg) => format!("Syntax error: {msg}"),
            SmtpError::Bind { .. }
            | SmtpError::Io(_)
            | SmtpError::ConnectionClosed
            | SmtpError::IndexOutOfRange { .. } => "Service not available".to_string(),
        }
    }
}
