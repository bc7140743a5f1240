//! SMTP server implementation

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::smtp::config::ServerConfig;
use crate::smtp::connection::ServerContext;
use crate::smtp::dispatch::{ConnectionDispatcher, SerialDispatcher, ThreadPerConnection};
use crate::smtp::error::SmtpError;
use crate::smtp::message::MailMessage;
use crate::smtp::store::MessageStore;

/// Configures and starts an SMTP server
#[derive(Debug, Clone, Default)]
pub struct SmtpServer {
    config: ServerConfig,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(hostname: &str) -> Self {
        Self {
            config: ServerConfig {
                hostname: hostname.to_owned(),
                ..ServerConfig::default()
            },
        }
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Serve each connection on its own thread from the start
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.config.threaded = threaded;
        self
    }

    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind to `port` and start accepting connections in the background
    ///
    /// Port 0 picks a free port; see [`ServerHandle::local_addr`]. The
    /// listener is ready when this returns.
    pub fn start(self, port: u16) -> Result<ServerHandle, SmtpError> {
        let addr = SocketAddr::new(self.config.bind_address, port);
        let listener = TcpListener::bind(addr).map_err(|source| SmtpError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.start_with_listener(listener)
    }

    /// Start accepting connections on an existing listener
    pub fn start_with_listener(self, listener: TcpListener) -> Result<ServerHandle, SmtpError> {
        let local_addr = listener.local_addr()?;
        let store = Arc::new(MessageStore::new());
        let context = Arc::new(ServerContext::new(&self.config, store));

        let accept_context = Arc::clone(&context);
        let accept_thread = thread::Builder::new()
            .name("trapmail-accept".to_owned())
            .spawn(move || accept_loop(listener, &accept_context))?;

        info!("SMTP server listening on {local_addr}");

        Ok(ServerHandle {
            context,
            local_addr,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }
}

/// Accept connections until the server is stopped
fn accept_loop(listener: TcpListener, context: &Arc<ServerContext>) {
    let mut serial = SerialDispatcher;
    let mut concurrent = ThreadPerConnection::new();

    for stream in listener.incoming() {
        // Anything accepted after stop() is the wake-up connection, or a
        // client that lost the race with it
        if !context.is_running() {
            debug!("Accept loop observed shutdown");
            break;
        }

        match stream {
            Ok(stream) => {
                let dispatcher: &mut dyn ConnectionDispatcher = if context.is_threaded() {
                    &mut concurrent
                } else {
                    &mut serial
                };
                dispatcher.dispatch(stream, context);
            }
            Err(e) => warn!("Error accepting connection: {e}"),
        }
    }

    concurrent.finish();
}

/// A running server
///
/// Dropping the handle stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    context: Arc<ServerContext>,
    local_addr: SocketAddr,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// The address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Switch between serving connections one at a time and one thread per
    /// connection; applies to connections accepted from now on
    pub fn set_threaded(&self, threaded: bool) {
        self.context.set_threaded(threaded);
    }

    pub fn is_threaded(&self) -> bool {
        self.context.is_threaded()
    }

    /// The store shared with the connection handlers
    pub fn store(&self) -> Arc<MessageStore> {
        Arc::clone(&self.context.store)
    }

    pub fn get_email_count(&self) -> usize {
        self.context.store.count()
    }

    pub fn get_message(&self, index: usize) -> Result<MailMessage, SmtpError> {
        self.context.store.get(index)
    }

    pub fn get_messages(&self) -> Vec<MailMessage> {
        self.context.store.messages()
    }

    pub fn clear_messages(&self) {
        self.context.store.clear();
    }

    /// Wait up to `timeout` for `count` messages to have arrived
    ///
    /// Returns the number of stored messages, which is below `count` if the
    /// timeout expired first.
    pub fn anticipate_message_count_for(&self, count: usize, timeout: Duration) -> usize {
        self.context.store.wait_for_count(count, timeout)
    }

    /// Stop accepting connections and wait for the ones in progress
    ///
    /// Idle connections are closed; a message being transferred is allowed
    /// to complete. Calling this more than once is harmless.
    pub fn stop(&self) {
        let mut accept_thread = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = accept_thread.take() else {
            return;
        };

        self.context.shut_down();
        self.wake_accept_loop();

        if handle.join().is_err() {
            error!("SMTP accept loop panicked");
        }
        self.context.store.close();
        info!("SMTP server on {} stopped", self.local_addr);
    }

    /// Unblock the pending accept() with a throwaway connection
    fn wake_accept_loop(&self) {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            let loopback = match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }

        if let Err(e) = TcpStream::connect_timeout(&addr, Duration::from_secs(5)) {
            warn!("Could not wake accept loop on {addr}: {e}");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
