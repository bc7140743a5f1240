//! Captured messages and the line-by-line builder that produces them

use std::fmt;
use std::time::SystemTime;

use log::debug;

/// A message accepted by the server
///
/// Header names are matched case-insensitively. A header that appears more
/// than once keeps every value, in the order received.
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    sender: String,
    recipients: Vec<String>,
    headers: Vec<(String, Vec<String>)>,
    body: String,
    received_at: SystemTime,
}

impl MailMessage {
    /// The reverse-path given with `MAIL FROM`; empty for the null sender
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// The forward-paths given with `RCPT TO`, in order
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Check if this message was addressed to a specific recipient
    pub fn has_recipient(&self, recipient: &str) -> bool {
        self.recipients.iter().any(|addr| addr == recipient)
    }

    /// When the server finished receiving the message
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Header names in the order they first appeared
    pub fn get_header_names(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(name, _)| name.as_str())
    }

    /// All values of a header, empty if the header is absent
    pub fn get_header_values(&self, name: &str) -> &[String] {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_first_header_value(&self, name: &str) -> Option<&str> {
        self.get_header_values(name).first().map(String::as_str)
    }

    pub fn get_subject(&self) -> Option<&str> {
        self.get_first_header_value("Subject")
    }

    /// The message body, byte for byte as sent after dot-unstuffing
    ///
    /// Input is decoded as UTF-8; bytes that are not valid UTF-8 (an
    /// 8-bit body in another charset, say) come back as U+FFFD.
    pub fn get_body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for MailMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, values) in &self.headers {
            for value in values {
                writeln!(f, "{name}: {value}")?;
            }
        }
        writeln!(f)?;
        f.write_str(&self.body)
    }
}

/// Accumulates the DATA section of one transaction
///
/// The session decides whether a line belongs to the header block or the
/// body; the builder only records it. Body lines are joined with the
/// terminator each one arrived with, and the terminator of the last line
/// (the one before the closing `.`) is dropped.
#[derive(Debug)]
pub struct MessageBuilder {
    sender: String,
    recipients: Vec<String>,
    headers: Vec<(String, Vec<String>)>,
    last_header: Option<usize>,
    body: String,
    pending_terminator: Option<String>,
}

impl MessageBuilder {
    pub fn new(sender: String, recipients: Vec<String>) -> Self {
        Self {
            sender,
            recipients,
            headers: Vec::new(),
            last_header: None,
            body: String::new(),
            pending_terminator: None,
        }
    }

    /// Record a line from the header block
    ///
    /// `Name: value` starts a header; a line beginning with a space or tab
    /// continues the previous one. Anything else is ignored.
    pub fn add_header_line(&mut self, line: &str) {
        if line.starts_with([' ', '\t']) {
            match self.last_header_value() {
                Some(value) => value.push_str(line),
                None => debug!("Ignoring continuation line before any header"),
            }
            return;
        }

        match line.split_once(':') {
            Some((name, value)) if is_header_name(name) => {
                self.add_header(name, value.trim());
            }
            _ => debug!("Ignoring malformed header line: {line:?}"),
        }
    }

    /// Record a body line together with the terminator it arrived with
    pub fn add_body_line(&mut self, line: &str, terminator: &str) {
        if let Some(previous) = self.pending_terminator.take() {
            self.body.push_str(&previous);
        }
        self.body.push_str(line);
        self.pending_terminator = Some(terminator.to_owned());
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Freeze the accumulated data into a message
    pub fn build(self) -> MailMessage {
        MailMessage {
            sender: self.sender,
            recipients: self.recipients,
            headers: self.headers,
            body: self.body,
            received_at: SystemTime::now(),
        }
    }

    fn add_header(&mut self, name: &str, value: &str) {
        let index = match self
            .headers
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.headers.push((name.to_owned(), Vec::new()));
                self.headers.len() - 1
            }
        };
        self.headers[index].1.push(value.to_owned());
        self.last_header = Some(index);
    }

    fn last_header_value(&mut self) -> Option<&mut String> {
        let index = self.last_header?;
        self.headers.get_mut(index)?.1.last_mut()
    }
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic())
}
