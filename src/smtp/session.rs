//! SMTP session state management

use log::{debug, trace};

use crate::smtp::error::SmtpError;
use crate::smtp::message::{MailMessage, MessageBuilder};

/// Represents the current state of an SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Connection accepted, greeting not sent yet
    Connect,
    /// Greeting sent - waiting for HELO or EHLO
    Greeted,
    /// Client identified - ready for MAIL command
    Mail,
    /// MAIL FROM received - ready for RCPT commands, or DATA once a
    /// recipient is known
    Rcpt,
    /// DATA accepted - reading the header block
    DataHeaders,
    /// Blank line seen - reading the body
    DataBody,
    /// QUIT received - the connection is about to close
    Quit,
}

/// Result of feeding one line of the DATA section to the session
#[derive(Debug)]
pub enum DataLine {
    /// The line was recorded; more data is expected
    Continue,
    /// The terminating `.` arrived and the message is complete
    Complete(MailMessage),
}

/// Manages the state and data for a single SMTP session
#[derive(Debug)]
pub struct SmtpSession {
    /// Current state of the session
    pub state: SmtpState,
    /// Sender address from MAIL FROM command
    pub from: Option<String>,
    /// List of recipients from RCPT TO commands
    pub to: Vec<String>,
    /// Client domain from HELO or EHLO command
    pub client_domain: Option<String>,
    builder: Option<MessageBuilder>,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new() -> Self {
        Self {
            state: SmtpState::Connect,
            from: None,
            to: Vec::new(),
            client_domain: None,
            builder: None,
        }
    }

    /// Record that the greeting has been sent
    pub fn greet(&mut self) {
        if self.state == SmtpState::Connect {
            self.transition(SmtpState::Greeted);
        }
    }

    /// Whether lines are currently routed to the DATA section
    pub fn in_data_mode(&self) -> bool {
        matches!(self.state, SmtpState::DataHeaders | SmtpState::DataBody)
    }

    /// Between transactions, with nothing the client would lose by a hang-up
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            SmtpState::Connect | SmtpState::Greeted | SmtpState::Mail
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == SmtpState::Quit
    }

    /// Clear the current transaction, keeping the client identification
    pub fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.builder = None;
        if self.client_domain.is_some() {
            self.transition(SmtpState::Mail);
        } else if self.state != SmtpState::Connect {
            self.transition(SmtpState::Greeted);
        }
    }

    /// Set the client domain from HELO or EHLO, discarding any transaction
    pub fn set_client_domain(&mut self, domain: String) {
        self.client_domain = Some(domain);
        self.reset();
    }

    /// Set the sender address and open a transaction
    pub fn set_sender(&mut self, sender: String) {
        self.from = Some(sender);
        self.to.clear();
        self.transition(SmtpState::Rcpt);
    }

    /// Add a recipient address
    pub fn add_recipient(&mut self, recipient: String) {
        self.to.push(recipient);
        self.transition(SmtpState::Rcpt);
    }

    /// Start data collection mode
    pub fn start_data_mode(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::Rcpt || self.to.is_empty() {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        let from = self.from.clone().unwrap_or_default();
        self.builder = Some(MessageBuilder::new(from, self.to.clone()));
        self.transition(SmtpState::DataHeaders);
        Ok(())
    }

    /// Feed one line of the DATA section, already stripped of `terminator`
    pub fn add_data_line(&mut self, line: &str, terminator: &str) -> Result<DataLine, SmtpError> {
        if line == "." {
            return self.finish_data_collection().map(DataLine::Complete);
        }

        let builder = self.builder.as_mut().ok_or_else(|| {
            SmtpError::InvalidState("Not in data collection mode".to_string())
        })?;

        // A leading dot was doubled by the client
        let line = line.strip_prefix('.').unwrap_or(line);

        match self.state {
            SmtpState::DataHeaders if line.is_empty() => {
                self.transition(SmtpState::DataBody);
            }
            SmtpState::DataHeaders => builder.add_header_line(line),
            SmtpState::DataBody => builder.add_body_line(line, terminator),
            _ => {
                return Err(SmtpError::InvalidState(
                    "Not in data collection mode".to_string(),
                ));
            }
        }
        Ok(DataLine::Continue)
    }

    /// Finish data collection and create a message
    pub fn finish_data_collection(&mut self) -> Result<MailMessage, SmtpError> {
        if !self.in_data_mode() {
            return Err(SmtpError::InvalidState(
                "Not in data collection mode".to_string(),
            ));
        }

        let builder = self.builder.take().ok_or_else(|| {
            SmtpError::InvalidState("Not in data collection mode".to_string())
        })?;
        debug!(
            "Message complete: {} header(s), {} body bytes",
            builder.header_count(),
            builder.body_len()
        );
        let message = builder.build();

        self.from = None;
        self.to.clear();
        self.transition(SmtpState::Mail);
        Ok(message)
    }

    pub fn quit(&mut self) {
        self.builder = None;
        self.transition(SmtpState::Quit);
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        if self.in_data_mode() || self.is_closed() {
            return false;
        }

        match command.to_uppercase().as_str() {
            "HELO" | "EHLO" => true, // Can be sent at any time
            "MAIL" => self.state == SmtpState::Mail,
            "RCPT" => self.state == SmtpState::Rcpt,
            "DATA" => self.state == SmtpState::Rcpt && !self.to.is_empty(),
            "RSET" | "NOOP" | "QUIT" | "VRFY" | "EXPN" | "HELP" => true,
            _ => false,
        }
    }

    /// Get the current recipient count
    pub fn recipient_count(&self) -> usize {
        self.to.len()
    }

    fn transition(&mut self, next: SmtpState) {
        if self.state != next {
            debug!("Session state {:?} -> {:?}", self.state, next);
        } else {
            trace!("Session state stays {:?}", next);
        }
        self.state = next;
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a raw line into its content and the terminator it carried
///
/// Both CRLF and a bare LF are accepted; a line cut short by the end of
/// the stream has an empty terminator.
pub fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_in_data_mode() -> SmtpSession {
        let mut session = SmtpSession::new();
        session.greet();
        session.set_client_domain("client.local".to_string());
        session.set_sender("sender@example.com".to_string());
        session.add_recipient("recipient@example.com".to_string());
        session.start_data_mode().unwrap();
        session
    }

    fn feed(session: &mut SmtpSession, data: &str) -> Option<MailMessage> {
        for raw in data.split_inclusive('\n') {
            let (line, terminator) = split_terminator(raw);
            if let DataLine::Complete(message) = session.add_data_line(line, terminator).unwrap() {
                return Some(message);
            }
        }
        None
    }

    #[test]
    fn test_new_session() {
        let session = SmtpSession::new();
        assert_eq!(session.state, SmtpState::Connect);
        assert!(session.from.is_none());
        assert!(session.to.is_empty());
        assert!(!session.in_data_mode());
        assert!(session.client_domain.is_none());
    }

    #[test]
    fn test_greeting_and_helo() {
        let mut session = SmtpSession::new();
        session.greet();
        assert_eq!(session.state, SmtpState::Greeted);

        session.set_client_domain("client.local".to_string());
        assert_eq!(session.state, SmtpState::Mail);
        assert_eq!(session.client_domain, Some("client.local".to_string()));
    }

    #[test]
    fn test_transaction_states() {
        let mut session = SmtpSession::new();
        session.greet();
        session.set_client_domain("client.local".to_string());

        session.set_sender("sender@example.com".to_string());
        assert_eq!(session.state, SmtpState::Rcpt);
        assert!(session.start_data_mode().is_err());

        session.add_recipient("a@example.com".to_string());
        session.add_recipient("b@example.com".to_string());
        assert_eq!(session.state, SmtpState::Rcpt);
        assert_eq!(session.recipient_count(), 2);

        session.start_data_mode().unwrap();
        assert_eq!(session.state, SmtpState::DataHeaders);
        assert!(session.in_data_mode());
    }

    #[test]
    fn test_data_collection() {
        let mut session = session_in_data_mode();

        let message = feed(&mut session, "Subject: Test\r\n\r\nTest body\r\n.\r\n").unwrap();
        assert_eq!(message.sender(), "sender@example.com");
        assert_eq!(message.recipients(), ["recipient@example.com"]);
        assert_eq!(message.get_subject(), Some("Test"));
        assert_eq!(message.get_body(), "Test body");

        // Ready for the next transaction on the same connection
        assert_eq!(session.state, SmtpState::Mail);
        assert!(session.from.is_none());
        assert!(session.to.is_empty());
    }

    #[test]
    fn test_header_to_body_transition() {
        let mut session = session_in_data_mode();
        feed(&mut session, "Subject: Test\r\n");
        assert_eq!(session.state, SmtpState::DataHeaders);
        feed(&mut session, "\r\n");
        assert_eq!(session.state, SmtpState::DataBody);
    }

    #[test]
    fn test_dot_unstuffing() {
        let mut session = session_in_data_mode();

        let message = feed(
            &mut session,
            "Subject: Dots\r\n\r\nbefore\r\n..\r\n...leading\r\nafter\r\n.\r\n",
        )
        .unwrap();
        assert_eq!(message.get_body(), "before\r\n.\r\n..leading\r\nafter");
    }

    #[test]
    fn test_terminator_inside_header_block() {
        let mut session = session_in_data_mode();
        let message = feed(&mut session, "Subject: No body\r\n.\r\n").unwrap();
        assert_eq!(message.get_subject(), Some("No body"));
        assert_eq!(message.get_body(), "");
    }

    #[test]
    fn test_bare_lf_terminators() {
        let mut session = session_in_data_mode();
        let message = feed(&mut session, "Subject: LF\n\nline one\nline two\n.\n").unwrap();
        assert_eq!(message.get_body(), "line one\nline two");
    }

    #[test]
    fn test_long_lines_are_not_truncated() {
        let mut session = session_in_data_mode();
        let subject = "X".repeat(5000);
        let body_line = "y".repeat(20_000);

        let message = feed(
            &mut session,
            &format!("Subject: {subject}\r\n\r\n{body_line}\r\n.\r\n"),
        )
        .unwrap();
        assert_eq!(message.get_subject(), Some(subject.as_str()));
        assert_eq!(message.get_body(), body_line);
    }

    #[test]
    fn test_data_line_outside_data_mode() {
        let mut session = SmtpSession::new();
        assert!(session.add_data_line("hello", "\r\n").is_err());
        assert!(session.finish_data_collection().is_err());
    }

    #[test]
    fn test_can_execute_command() {
        let mut session = SmtpSession::new();
        session.greet();

        assert!(session.can_execute_command("HELO"));
        assert!(session.can_execute_command("ehlo"));
        assert!(session.can_execute_command("NOOP"));
        assert!(session.can_execute_command("QUIT"));
        assert!(!session.can_execute_command("MAIL"));
        assert!(!session.can_execute_command("RCPT"));
        assert!(!session.can_execute_command("DATA"));

        session.set_client_domain("client.local".to_string());
        assert!(session.can_execute_command("MAIL"));
        assert!(!session.can_execute_command("RCPT"));

        session.set_sender("sender@example.com".to_string());
        assert!(session.can_execute_command("RCPT"));
        assert!(!session.can_execute_command("DATA"));

        session.add_recipient("recipient@example.com".to_string());
        assert!(session.can_execute_command("DATA"));
        assert!(session.can_execute_command("RCPT"));

        session.start_data_mode().unwrap();
        assert!(!session.can_execute_command("QUIT"));
    }

    #[test]
    fn test_reset() {
        let mut session = session_in_data_mode();
        session.reset();

        assert_eq!(session.state, SmtpState::Mail);
        assert!(session.from.is_none());
        assert!(session.to.is_empty());
        assert!(!session.in_data_mode());
        assert_eq!(session.client_domain, Some("client.local".to_string()));
    }

    #[test]
    fn test_reset_before_helo() {
        let mut session = SmtpSession::new();
        session.greet();
        session.reset();
        assert_eq!(session.state, SmtpState::Greeted);
    }

    #[test]
    fn test_idle_only_between_transactions() {
        let mut session = SmtpSession::new();
        session.greet();
        assert!(session.is_idle());

        session.set_client_domain("client.local".to_string());
        assert!(session.is_idle());

        session.set_sender("sender@example.com".to_string());
        assert!(!session.is_idle());
        session.add_recipient("recipient@example.com".to_string());
        assert!(!session.is_idle());
        session.start_data_mode().unwrap();
        assert!(!session.is_idle());

        feed(&mut session, "Subject: Done\r\n\r\nbody\r\n.\r\n");
        assert!(session.is_idle());

        session.quit();
        assert!(!session.is_idle());
    }

    #[test]
    fn test_quit_discards_partial_message() {
        let mut session = session_in_data_mode();
        feed(&mut session, "Subject: Unfinished\r\n");
        session.quit();
        assert!(session.is_closed());
        assert!(session.finish_data_collection().is_err());
    }

    #[test]
    fn test_split_terminator() {
        assert_eq!(split_terminator("HELO x\r\n"), ("HELO x", "\r\n"));
        assert_eq!(split_terminator("HELO x\n"), ("HELO x", "\n"));
        assert_eq!(split_terminator("HELO x"), ("HELO x", ""));
        assert_eq!(split_terminator("bare\rcr\r\n"), ("bare\rcr", "\r\n"));
    }
}
