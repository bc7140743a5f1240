//! Serving a single client connection

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::config::ServerConfig;
use crate::smtp::error::SmtpError;
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;
use crate::smtp::store::MessageStore;

/// State shared by the server handle, the accept loop and every handler
#[derive(Debug)]
pub struct ServerContext {
    pub hostname: String,
    pub poll_interval: Duration,
    pub store: Arc<MessageStore>,
    running: AtomicBool,
    threaded: AtomicBool,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, store: Arc<MessageStore>) -> Self {
        Self {
            hostname: config.hostname.clone(),
            poll_interval: config.poll_interval,
            store,
            running: AtomicBool::new(true),
            threaded: AtomicBool::new(config.threaded),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded.load(Ordering::SeqCst)
    }

    pub fn set_threaded(&self, threaded: bool) {
        self.threaded.store(threaded, Ordering::SeqCst);
    }
}

/// Run one SMTP dialogue to completion, logging rather than returning errors
pub fn serve(stream: TcpStream, context: &ServerContext) {
    let log_prefix = match stream.peer_addr() {
        Ok(addr) => format!("[{addr}]"),
        Err(_) => "[unknown]".to_string(),
    };
    debug!("{log_prefix} Connection accepted");

    match handle_client(stream, context, &log_prefix) {
        Ok(()) => debug!("{log_prefix} Connection closed"),
        Err(SmtpError::ConnectionClosed) => {
            warn!("{log_prefix} Client disconnected during DATA, message discarded")
        }
        Err(e) => warn!("{log_prefix} Error handling client: {e}"),
    }
}

fn handle_client(
    mut stream: TcpStream,
    context: &ServerContext,
    log_prefix: &str,
) -> Result<(), SmtpError> {
    stream.set_read_timeout(Some(context.poll_interval))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let command_handler = SmtpCommandHandler::new(&context.hostname);
    let mut session = SmtpSession::new();

    send_response(&mut stream, &SmtpResponse::greeting(&context.hostname))?;
    session.greet();

    let mut line_buffer = Vec::new();
    loop {
        match reader.read_until(b'\n', &mut line_buffer) {
            Ok(0) => {
                // Peer closed the connection
                if session.in_data_mode() {
                    return Err(SmtpError::ConnectionClosed);
                }
                return Ok(());
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&line_buffer).into_owned();
                line_buffer.clear();
                trace!("{log_prefix} C: {line:?}");

                let outcome = command_handler.process_line(&line, &mut session);

                // Store before replying so a client that saw 250 can rely on it
                if let Some(message) = outcome.message {
                    info!(
                        "{log_prefix} Accepted message from {:?} for {} recipient(s), {} body bytes",
                        message.sender(),
                        message.recipients().len(),
                        message.get_body().len()
                    );
                    context.store.append(message);
                }

                if let Some(response) = outcome.response {
                    if response.is_error() {
                        debug!("{log_prefix} Rejected: {}", response.format().trim_end());
                    }
                    send_response(&mut stream, &response)?;
                }

                if session.is_closed() {
                    return Ok(());
                }
            }
            Err(e) if is_poll_timeout(&e) => {
                // Only idle connections are closed on shutdown; a partly
                // read command or an open transaction is allowed to finish
                if !context.is_running() && line_buffer.is_empty() && session.is_idle() {
                    info!("{log_prefix} Closing idle connection, server stopping");
                    let closing = SmtpResponse::new(
                        "421",
                        &format!("{} Service closing transmission channel", context.hostname),
                    );
                    let _ = send_response(&mut stream, &closing);
                    return Ok(());
                }
            }
            Err(e) => {
                if session.in_data_mode() {
                    warn!("{log_prefix} Read failed during DATA, message discarded");
                }
                return Err(SmtpError::Io(e));
            }
        }
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Send a response to the client
fn send_response(stream: &mut TcpStream, response: &SmtpResponse) -> Result<(), SmtpError> {
    stream.write_all(response.format().as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn context() -> Arc<ServerContext> {
        let config = ServerConfig {
            hostname: "test.local".to_string(),
            poll_interval: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::new(&config, Arc::new(MessageStore::new())))
    }

    /// Serve exactly one connection on a background thread
    fn serve_once(context: Arc<ServerContext>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, &context);
        });
        (addr, handle)
    }

    fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_complete_dialogue_stores_message() {
        let context = context();
        let (addr, handle) = serve_once(Arc::clone(&context));

        let mut stream = TcpStream::connect(&addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        assert_eq!(read_reply(&mut reader), "220 test.local SMTP service ready\r\n");

        stream
            .write_all(
                b"HELO client.local\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\nDATA\r\n",
            )
            .unwrap();
        assert!(read_reply(&mut reader).starts_with("250"));
        assert!(read_reply(&mut reader).starts_with("250"));
        assert!(read_reply(&mut reader).starts_with("250"));
        assert!(read_reply(&mut reader).starts_with("354"));

        stream
            .write_all(b"Subject: Hi\r\n\r\nHello\r\n.\r\nQUIT\r\n")
            .unwrap();
        assert_eq!(read_reply(&mut reader), "250 OK\r\n");
        assert_eq!(read_reply(&mut reader), "221 Bye\r\n");

        handle.join().unwrap();
        assert_eq!(context.store.count(), 1);
        assert_eq!(context.store.get(0).unwrap().get_body(), "Hello");
    }

    #[test]
    fn test_disconnect_during_data_discards_message() {
        let context = context();
        let (addr, handle) = serve_once(Arc::clone(&context));

        let mut stream = TcpStream::connect(&addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        read_reply(&mut reader);

        stream
            .write_all(
                b"HELO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\nDATA\r\nSubject: Lost\r\n\r\nPartial\r\n",
            )
            .unwrap();
        for _ in 0..4 {
            read_reply(&mut reader);
        }
        drop(reader);
        drop(stream);

        handle.join().unwrap();
        assert_eq!(context.store.count(), 0);
    }

    #[test]
    fn test_idle_connection_closed_on_shutdown() {
        let context = context();
        let (addr, handle) = serve_once(Arc::clone(&context));

        let stream = TcpStream::connect(&addr).unwrap();
        let mut reader = BufReader::new(stream);
        assert!(read_reply(&mut reader).starts_with("220"));

        context.shut_down();
        assert!(read_reply(&mut reader).starts_with("421"));
        handle.join().unwrap();
    }

    #[test]
    fn test_message_in_progress_finishes_after_shutdown() {
        let context = context();
        let (addr, handle) = serve_once(Arc::clone(&context));

        let mut stream = TcpStream::connect(&addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        read_reply(&mut reader);
        stream
            .write_all(b"HELO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\nDATA\r\n")
            .unwrap();
        for _ in 0..4 {
            read_reply(&mut reader);
        }

        context.shut_down();
        thread::sleep(Duration::from_millis(100));

        stream.write_all(b"Subject: Late\r\n\r\nStill here\r\n.\r\n").unwrap();
        assert_eq!(read_reply(&mut reader), "250 OK\r\n");

        // Idle again, so the server hangs up
        assert!(read_reply(&mut reader).starts_with("421"));
        handle.join().unwrap();
        assert_eq!(context.store.count(), 1);
    }

    #[test]
    fn test_open_transaction_finishes_after_shutdown() {
        let context = context();
        let (addr, handle) = serve_once(Arc::clone(&context));

        let mut stream = TcpStream::connect(&addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        read_reply(&mut reader);
        stream
            .write_all(b"HELO c\r\nMAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\n")
            .unwrap();
        for _ in 0..3 {
            assert!(read_reply(&mut reader).starts_with("250"));
        }

        // Several poll intervals pass between RCPT and DATA
        context.shut_down();
        thread::sleep(Duration::from_millis(200));

        stream.write_all(b"DATA\r\n").unwrap();
        assert!(read_reply(&mut reader).starts_with("354"));
        stream
            .write_all(b"Subject: Paused\r\n\r\nStill delivered\r\n.\r\n")
            .unwrap();
        assert_eq!(read_reply(&mut reader), "250 OK\r\n");

        assert!(read_reply(&mut reader).starts_with("421"));
        handle.join().unwrap();
        assert_eq!(context.store.count(), 1);
        assert_eq!(context.store.get(0).unwrap().get_subject(), Some("Paused"));
    }

    #[test]
    fn test_threaded_flag() {
        let context = context();
        assert!(!context.is_threaded());
        context.set_threaded(true);
        assert!(context.is_threaded());
        assert!(context.is_running());
    }
}
