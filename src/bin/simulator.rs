use clap::{App, Arg};
use satlink::endpoint::MAX_FRAME_SIZE;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "8080";
const DEFAULT_PERIOD_MS: &str = "1000";
const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 256;

/// Length-prefixed frame counter packet used when no frames are given:
/// a 2-byte id of 1 followed by a 4-byte sequence number.
fn counter_frame(sequence: u32) -> Vec<u8> {
    let mut frame = vec![0x00, 0x01];
    frame.extend_from_slice(&sequence.to_be_bytes());
    frame
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("satlink-simulator")
        .version("0.1.0")
        .about("TCP telemetry source and command sink speaking length-prefixed frames")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("period")
                .long("period")
                .value_name("MS")
                .help("Telemetry period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_PERIOD_MS),
        )
        .arg(
            Arg::with_name("frame")
                .long("frame")
                .value_name("HEX")
                .help("Telemetry frame to cycle through (repeatable)")
                .takes_value(true)
                .multiple(true),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let period: u64 = matches.value_of("period").unwrap_or(DEFAULT_PERIOD_MS).parse()?;
    let frames = matches
        .values_of("frame")
        .map(|values| values.map(hex::decode).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let (telemetry_tx, _) = broadcast::channel::<Vec<u8>>(TELEMETRY_BROADCAST_BUFFER_SIZE);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("TCP server listening on port {}", port);
    let server_tx = telemetry_tx.clone();
    let server = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New client connected: {}", addr);
                    let rx = server_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, rx).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("Client {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    });

    let mut interval = time::interval(Duration::from_millis(period.max(1)));
    let mut sequence: u32 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let frame = if frames.is_empty() {
            counter_frame(sequence)
        } else {
            frames[sequence as usize % frames.len()].clone()
        };
        sequence = sequence.wrapping_add(1);
        // No subscribers simply means no client is connected yet
        if telemetry_tx.send(frame).is_ok() {
            info!("Telemetry frame {} sent", sequence);
        }
    }

    server.abort();
    info!("Simulator stopped");
    Ok(())
}

async fn write_frame(writer: &Mutex<OwnedWriteHalf>, frame: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn handle_client(
    stream: TcpStream,
    mut telemetry_rx: broadcast::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let telemetry_writer = Arc::clone(&writer);
    let telemetry_task = tokio::spawn(async move {
        loop {
            match telemetry_rx.recv().await {
                Ok(frame) => {
                    if let Err(e) = write_frame(&telemetry_writer, &frame).await {
                        warn!("Failed to send telemetry: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client lagging, skipped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Commands arrive with the same framing
    loop {
        let length = match reader.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                telemetry_task.abort();
                return Err(e.into());
            }
        };
        if length > MAX_FRAME_SIZE {
            telemetry_task.abort();
            return Err(format!("Command frame of {length} bytes exceeds {MAX_FRAME_SIZE}").into());
        }
        let mut command = vec![0u8; length];
        reader.read_exact(&mut command).await?;
        info!("Received command ({} bytes): {}", length, hex::encode_upper(&command));
    }

    telemetry_task.abort();
    Ok(())
}
