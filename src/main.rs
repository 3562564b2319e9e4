use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use rtsp_inspect::client::{SessionOptions, TransportPreference};
use rtsp_inspect::probe;
use rtsp_inspect::report::LogReporter;

/// Connects to an RTSP server, logs its session description and every
/// received RTP packet header as JSON.
#[derive(Parser)]
#[command(name = "rtsp-inspect", version)]
struct Args {
    /// RTSP URL, optionally with `user:password@` credentials.
    url: String,

    /// Lower transport: auto tries UDP and falls back to TCP.
    #[arg(long, default_value_t = TransportPreference::Auto)]
    transport: TransportPreference,

    /// Only accept UDP media from the server ports named in the SETUP reply.
    #[arg(long)]
    no_any_port: bool,

    /// Seconds to wait for connecting and for each RTSP response.
    #[arg(long, default_value_t = 5)]
    read_timeout: u64,

    /// Seconds to wait for each RTSP request to be written.
    #[arg(long, default_value_t = 5)]
    write_timeout: u64,

    /// Packets buffered between the receivers and the reporter.
    #[arg(long, default_value_t = 512)]
    queue_size: usize,

    /// User-Agent header to send instead of the crate name and version.
    #[arg(long)]
    user_agent: Option<String>,
}

impl Args {
    fn session_options(&self) -> SessionOptions {
        let options = SessionOptions::default()
            .transport(self.transport)
            .any_port(!self.no_any_port)
            .read_timeout(Duration::from_secs(self.read_timeout))
            .write_timeout(Duration::from_secs(self.write_timeout))
            .queue_size(self.queue_size);
        match self.user_agent {
            Some(ref ua) => options.user_agent(ua.clone()),
            None => options,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Interrupted");
        on_signal.cancel();
    });

    match probe::run(
        &args.url,
        args.session_options(),
        Arc::new(LogReporter),
        shutdown,
    )
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
