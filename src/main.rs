use std::net::IpAddr;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use trapmail::SmtpServer;

/// Run a capturing SMTP server until interrupted
#[derive(Debug, Parser, PartialEq)]
#[command(about, version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 2525)]
    port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Name announced in the greeting
    #[arg(long, default_value = "trapmail.local")]
    hostname: String,

    /// Serve each connection on its own thread
    #[arg(short, long)]
    threaded: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let server = SmtpServer::new(&args.hostname)
        .bind_address(args.bind)
        .threaded(args.threaded);

    let handle = match server.start(args.port) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start server: {e}");
            process::exit(1);
        }
    };

    let mut seen = 0;
    loop {
        let count = handle.anticipate_message_count_for(seen + 1, Duration::from_secs(60));
        for index in seen..count {
            if let Ok(message) = handle.get_message(index) {
                info!(
                    "Received email #{} from: {} to: {:?}",
                    index + 1,
                    message.sender(),
                    message.recipients()
                );
                if let Some(subject) = message.get_subject() {
                    info!("  Subject: {subject}");
                }
            }
        }
        seen = seen.max(count);
    }
}
