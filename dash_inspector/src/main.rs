use std::sync::mpsc::{self, Sender};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use dash_proto::{decode_event, MAX_FRAME_LEN};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, trace, warn};

mod app;
mod interpolate;
mod ui;

use app::{channel, FeedMessage, InspectorApp};

#[derive(Clone)]
struct ChannelWriter {
    sender: Sender<String>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(text) = String::from_utf8(buf.to_vec()) {
            let _ = self.sender.send(text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal dashboard for the warehouse relay", long_about = None)]
struct Cli {
    /// Address of the relay's dashboard push channel.
    #[arg(long, default_value = "127.0.0.1:3000")]
    endpoint: String,
    /// Milliseconds between animation frames.
    #[arg(long, default_value_t = 33)]
    frame_ms: u64,
    /// Seconds to wait before reconnecting after a dropped connection.
    #[arg(long, default_value_t = 2)]
    reconnect_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let (log_tx, log_rx) = mpsc::channel::<String>();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .with_writer(move || ChannelWriter {
            sender: log_tx.clone(),
        })
        .init();

    let cli = Cli::parse();
    info!("Connecting to relay at {}", cli.endpoint);

    let (sender, receiver) = channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let frame_interval = Duration::from_millis(cli.frame_ms.max(1));
    let reconnect = Duration::from_secs(cli.reconnect_secs);

    let _ui_handle = std::thread::spawn(move || -> color_eyre::Result<()> {
        let app = InspectorApp::new(receiver, shutdown_tx, log_rx, frame_interval)?;
        app.run()
    });

    loop {
        if shutdown_rx.try_recv().is_ok() {
            info!("Inspector requested shutdown");
            break;
        }
        match TcpStream::connect(&cli.endpoint).await {
            Ok(mut stream) => {
                info!("Connected. Press q to exit.");
                if let Err(err) = pump_events(&mut stream, &sender).await {
                    warn!("Connection error: {}", err);
                }
                if sender.send(FeedMessage::Disconnected).is_err() {
                    break;
                }
                info!("Reconnecting in {} seconds...", reconnect.as_secs());
                tokio::time::sleep(reconnect).await;
            }
            Err(err) => {
                warn!("Failed to connect: {}", err);
                tokio::time::sleep(reconnect).await;
            }
        }
    }

    Ok(())
}

async fn pump_events(stream: &mut TcpStream, sender: &UnboundedSender<FeedMessage>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    loop {
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(eyre!("frame of {len} bytes exceeds limit"));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        let event = decode_event(&payload)?;
        trace!(event = event.name(), "relay.event");
        if sender.send(FeedMessage::Event(event)).is_err() {
            break;
        }
    }
    Ok(())
}
