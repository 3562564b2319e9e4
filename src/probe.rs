//! The probe sequence: connect, describe, set up every media, play, then
//! report packets until shut down.
//!
//! Only a bad URL or a failed connection end the probe early. Failures of the
//! later steps are logged and the sequence continues, so the process stays up
//! until `shutdown` is cancelled. Cancelling during any step stops the probe
//! right away.

use std::future::Future;
use std::sync::Arc;

use log::{error, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::{self, Client, SessionOptions};
use crate::report::Reporter;
use crate::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Cannot parse RTSP URL: {0}")]
    MalformedUrl(#[source] Error),

    #[error("Error connecting to server: {0}")]
    Connect(#[source] Error),
}

/// Runs `step` unless `shutdown` is cancelled first.
async fn unless_shutdown<F: Future>(shutdown: &CancellationToken, step: F) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        r = step => Some(r),
    }
}

pub async fn run(
    url: &str,
    mut options: SessionOptions,
    reporter: Arc<dyn Reporter>,
    shutdown: CancellationToken,
) -> Result<(), FatalError> {
    let (url, creds) = client::parse_url(url).map_err(FatalError::MalformedUrl)?;
    if creds.is_some() {
        options = options.creds(creds);
    }

    let mut client = match unless_shutdown(&shutdown, Client::connect(&url, options)).await {
        Some(r) => r.map_err(FatalError::Connect)?,
        None => {
            info!("Interrupted while connecting");
            return Ok(());
        }
    };
    info!("Connected to {}", client.ctx());

    let description = match unless_shutdown(&shutdown, client.describe(&url)).await {
        Some(Ok(d)) => {
            reporter.description(&d);
            Some(d)
        }
        Some(Err(e)) => {
            error!("Error during DESCRIBE: {}", e);
            None
        }
        None => return interrupted(client, "DESCRIBE").await,
    };

    match unless_shutdown(&shutdown, client.setup_all(description.as_ref())).await {
        Some(Ok(())) => {}
        Some(Err(e)) => error!("Error setting up medias: {}", e),
        None => return interrupted(client, "SETUP").await,
    }

    let packets = reporter.clone();
    client.on_packet_rtp_any(move |media, pkt| packets.packet(media, pkt));

    match unless_shutdown(&shutdown, client.play()).await {
        Some(Ok(())) => {}
        Some(Err(e)) => error!("Error during PLAY: {}", e),
        None => return interrupted(client, "PLAY").await,
    }

    info!("Streaming... Press Ctrl+C to exit.");
    shutdown.cancelled().await;
    info!("Shutting down");
    client.close().await;
    Ok(())
}

async fn interrupted(client: Client, step: &str) -> Result<(), FatalError> {
    info!("Interrupted during {}", step);
    client.close().await;
    Ok(())
}
