//! Implementation of SMTP commands

use log::debug;

use crate::smtp::error::SmtpError;
use crate::smtp::message::MailMessage;
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{DataLine, SmtpSession, split_terminator};

/// What the connection should do after one line has been processed
#[derive(Debug, Default)]
pub struct LineOutcome {
    /// Reply to send, if the line calls for one
    pub response: Option<SmtpResponse>,
    /// Message completed by this line
    pub message: Option<MailMessage>,
}

/// Handles SMTP commands and returns appropriate responses
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str) -> Self {
        Self { hostname }
    }

    /// Process one raw line (terminator included) read from the client
    ///
    /// Protocol errors are turned into negative replies here and never
    /// escape to the caller.
    pub fn process_line(&self, raw_line: &str, session: &mut SmtpSession) -> LineOutcome {
        let (line, terminator) = split_terminator(raw_line);

        if session.in_data_mode() {
            return match session.add_data_line(line, terminator) {
                Ok(DataLine::Continue) => LineOutcome::default(),
                Ok(DataLine::Complete(message)) => LineOutcome {
                    response: Some(SmtpResponse::ok()),
                    message: Some(message),
                },
                Err(e) => {
                    session.reset();
                    LineOutcome {
                        response: Some(SmtpResponse::from_error(&e)),
                        message: None,
                    }
                }
            };
        }

        let command = line.trim();
        if command.is_empty() {
            return LineOutcome::default();
        }

        let response = self
            .process_command(command, session)
            .unwrap_or_else(|e| SmtpResponse::from_error(&e));
        LineOutcome {
            response: Some(response),
            message: None,
        }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let (verb, args) = match command_line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (command_line, ""),
        };

        let cmd = verb.to_uppercase();
        debug!("Command {cmd} in state {:?}", session.state);

        match cmd.as_str() {
            "HELO" => self.handle_helo(args, session, false),
            "EHLO" => self.handle_helo(args, session, true),
            "MAIL" => self.handle_mail(args, session),
            "RCPT" => self.handle_rcpt(args, session),
            "DATA" => self.handle_data(args, session),
            "RSET" => self.handle_rset(session),
            "NOOP" => Ok(SmtpResponse::ok()),
            "QUIT" => self.handle_quit(session),
            "VRFY" | "EXPN" => Ok(SmtpResponse::cannot_verify()),
            "HELP" => Ok(SmtpResponse::help()),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    /// Handle HELO and EHLO commands
    fn handle_helo(
        &self,
        args: &str,
        session: &mut SmtpSession,
        extended: bool,
    ) -> Result<SmtpResponse, SmtpError> {
        let Some(client_domain) = args.split_whitespace().next() else {
            return Err(SmtpError::InvalidSyntax(
                "HELO requires domain argument".to_string(),
            ));
        };

        session.set_client_domain(client_domain.to_string());

        if extended {
            Ok(SmtpResponse::ehlo(self.hostname, client_domain))
        } else {
            Ok(SmtpResponse::helo(self.hostname, client_domain))
        }
    }

    /// Handle MAIL command
    fn handle_mail(&self, args: &str, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        let path = strip_keyword(args, "FROM:").ok_or_else(|| {
            SmtpError::InvalidSyntax("MAIL command must be 'MAIL FROM:<address>'".to_string())
        })?;

        // The null reverse-path `<>` is allowed
        let addr = parse_path(path)?;
        session.set_sender(addr);

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command
    fn handle_rcpt(&self, args: &str, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        let path = strip_keyword(args, "TO:").ok_or_else(|| {
            SmtpError::InvalidSyntax("RCPT command must be 'RCPT TO:<address>'".to_string())
        })?;

        let addr = parse_path(path)?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        debug!(
            "Recipient {addr:?} accepted, {} before it",
            session.recipient_count()
        );
        session.add_recipient(addr);

        Ok(SmtpResponse::ok())
    }

    /// Handle DATA command
    fn handle_data(&self, args: &str, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if !args.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.start_data_mode()?;

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        session.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command
    fn handle_quit(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        session.quit();
        Ok(SmtpResponse::quit())
    }
}

/// Strip a case-insensitive keyword such as `FROM:` from the front of `args`
fn strip_keyword<'s>(args: &'s str, keyword: &str) -> Option<&'s str> {
    let head = args.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &args[keyword.len()..])
}

/// Extract the address from a path, ignoring any ESMTP parameters after it
fn parse_path(path: &str) -> Result<String, SmtpError> {
    let path = path.trim_start();

    if let Some(inner) = path.strip_prefix('<') {
        let end = inner.find('>').ok_or_else(|| {
            SmtpError::InvalidSyntax("Address must be enclosed in angle brackets".to_string())
        })?;
        return Ok(inner[..end].to_string());
    }

    match path.split_whitespace().next() {
        Some(addr) => Ok(addr.to_string()),
        None => Err(SmtpError::InvalidSyntax("Address is missing".to_string())),
    }
}
