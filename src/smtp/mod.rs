//! SMTP server implementation

pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod response;
pub mod server;
pub mod session;
pub mod store;

pub use config::ServerConfig;
pub use dispatch::{ConnectionDispatcher, SerialDispatcher, ThreadPerConnection};
pub use error::SmtpError;
pub use message::{MailMessage, MessageBuilder};
pub use response::SmtpResponse;
pub use server::{ServerHandle, SmtpServer};
pub use session::{SmtpSession, SmtpState};
pub use store::MessageStore;
