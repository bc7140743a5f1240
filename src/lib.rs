//! # trapmail
//!
//! trapmail is an SMTP server that runs inside your tests.
//!
//! Point the code under test at it, send mail through any SMTP client, and
//! assert on what arrived.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//!
//! let server = trapmail::start(0).unwrap();
//! let port = server.port();
//!
//! // Application sends email to 127.0.0.1:{port}
//! // ...
//!
//! // Wait for the expected number of messages, then inspect them
//! let count = server.anticipate_message_count_for(1, Duration::from_millis(100));
//! if count > 0 {
//!     let message = server.get_message(0).unwrap();
//!     println!("Subject: {:?}", message.get_first_header_value("Subject"));
//!     println!("{}", message.get_body());
//! }
//!
//! server.stop();
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the sender
//! - `MAIL FROM` - Specify the sender's address
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the email content
//! - `RSET` - Reset the current transaction
//! - `NOOP`, `HELP`, `VRFY`, `EXPN` - Accepted, no effect
//! - `QUIT` - Close connection
//!
//! ## Threading
//!
//! By default connections are served one at a time on the accept thread.
//! [`ServerHandle::set_threaded`] switches to one thread per connection so
//! several clients can send at once. Messages from one connection keep
//! their order; across connections the order is whatever the race produced.
//!
//! ## Waiting for mail
//!
//! [`ServerHandle::anticipate_message_count_for`] blocks until the count is
//! reached or the timeout expires. It does not fail on timeout: check the
//! returned count (or [`ServerHandle::get_email_count`]) afterwards.
//!
//! ## Notes
//!
//! - Runs in-memory only. Email persistence is not supported.
//! - SMTP authentication is not supported.
//! - SSL/TLS connection is not supported.
//! - Mail is never relayed.
//! - No line length limits are enforced.

mod smtp;

pub use smtp::{
    ConnectionDispatcher, MailMessage, MessageBuilder, MessageStore, SerialDispatcher,
    ServerConfig, ServerHandle, SmtpError, SmtpResponse, SmtpServer, SmtpSession, SmtpState,
    ThreadPerConnection,
};

/// Start a server with default settings on `127.0.0.1:port`
pub fn start(port: u16) -> Result<ServerHandle, SmtpError> {
    SmtpServer::default().start(port)
}
