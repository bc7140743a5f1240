//! Strategies for serving accepted connections

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::smtp::connection::{ServerContext, serve};

/// Decides where an accepted connection is served
pub trait ConnectionDispatcher {
    /// Hand over a freshly accepted connection
    fn dispatch(&mut self, stream: TcpStream, context: &Arc<ServerContext>);

    /// Wait for every connection dispatched so far to finish
    fn finish(&mut self) {}
}

/// Serves the connection on the calling thread; later connections wait in
/// the listen backlog until it is done
#[derive(Debug, Default)]
pub struct SerialDispatcher;

impl ConnectionDispatcher for SerialDispatcher {
    fn dispatch(&mut self, stream: TcpStream, context: &Arc<ServerContext>) {
        serve(stream, context);
    }
}

/// Serves every connection on a thread of its own
#[derive(Debug, Default)]
pub struct ThreadPerConnection {
    workers: Vec<JoinHandle<()>>,
    next_id: u64,
}

impl ThreadPerConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers that have not been joined yet
    pub fn active_workers(&mut self) -> usize {
        self.reap_finished();
        self.workers.len()
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|w| w.is_finished());
        self.workers = running;
        for worker in finished {
            join_worker(worker);
        }
    }
}

impl ConnectionDispatcher for ThreadPerConnection {
    fn dispatch(&mut self, stream: TcpStream, context: &Arc<ServerContext>) {
        let name = format!("trapmail-conn-{}", self.next_id);
        self.next_id += 1;
        debug!(
            "Spawning {name}, {} other worker(s) active",
            self.active_workers()
        );

        let context = Arc::clone(context);
        match thread::Builder::new()
            .name(name)
            .spawn(move || serve(stream, &context))
        {
            Ok(worker) => self.workers.push(worker),
            Err(e) => warn!("Failed to spawn connection worker: {e}"),
        }
    }

    fn finish(&mut self) {
        if !self.workers.is_empty() {
            debug!("Waiting for {} connection worker(s)", self.workers.len());
        }
        for worker in self.workers.drain(..) {
            join_worker(worker);
        }
    }
}

fn join_worker(worker: JoinHandle<()>) {
    let name = worker.thread().name().unwrap_or("unnamed").to_owned();
    if worker.join().is_err() {
        error!("Connection worker {name} panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::config::ServerConfig;
    use crate::smtp::store::MessageStore;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn context() -> Arc<ServerContext> {
        let config = ServerConfig {
            poll_interval: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::new(&config, Arc::new(MessageStore::new())))
    }

    #[test]
    fn test_thread_per_connection_serves_concurrently() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let context = context();
        let mut dispatcher = ThreadPerConnection::new();

        // Two clients connected at once, both greeted before either quits
        let first = TcpStream::connect(addr).unwrap();
        let second = TcpStream::connect(addr).unwrap();
        for _ in 0..2 {
            let (stream, _) = listener.accept().unwrap();
            dispatcher.dispatch(stream, &context);
        }

        for mut client in [first, second] {
            let mut reader = BufReader::new(client.try_clone().unwrap());
            let mut greeting = String::new();
            reader.read_line(&mut greeting).unwrap();
            assert!(greeting.starts_with("220"));

            client.write_all(b"QUIT\r\n").unwrap();
            let mut bye = String::new();
            reader.read_line(&mut bye).unwrap();
            assert!(bye.starts_with("221"));
        }

        dispatcher.finish();
        assert_eq!(dispatcher.active_workers(), 0);
    }
}
