//! Serial transport to the radio: HDLC-framed spinel over a UART.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::hdlc::{self, HdlcDecoder};
use super::SpinelInterface;
use shared::Error;

const RX_BUFFER_SIZE: usize = 2048;
const TX_QUEUE_DEPTH: usize = 64;
const RX_QUEUE_DEPTH: usize = 256;

/// How long a read blocks before the reader checks for cancellation.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Queues encoded frames for the writer thread.
pub struct HdlcInterface {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SpinelInterface for HdlcInterface {
    fn send_frame(&mut self, frame: &[u8]) -> shared::Result<()> {
        self.tx.try_send(hdlc::encode(frame)).map_err(|e| match e {
            TrySendError::Full(_) => Error::NoBufs,
            TrySendError::Closed(_) => Error::Failed("radio writer stopped".to_string()),
        })
    }
}

pub struct RadioDevice {
    pub interface: HdlcInterface,
    /// Decoded spinel frames from the radio
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Open the radio UART in raw 8N1 mode and start its reader and writer
/// threads.
///
/// The reader stops on `cancel`; the writer drains its queue and stops once
/// the `HdlcInterface` is dropped.
pub fn open(path: &Path, baudrate: u32, cancel: CancellationToken) -> Result<RadioDevice> {
    let reader = serialport::new(path.to_string_lossy(), baudrate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL_INTERVAL)
        .open()
        .with_context(|| format!("Failed to open radio device {} at {} baud", path.display(), baudrate))?;

    // Drop whatever the radio printed before we attached
    if let Err(e) = reader.clear(ClearBuffer::Input) {
        tracing::warn!("Failed to flush radio input: {}", e);
    }

    let mut writer = reader
        .try_clone()
        .with_context(|| format!("Failed to clone radio device {}", path.display()))?;
    writer
        .set_timeout(WRITE_TIMEOUT)
        .context("Failed to set radio write timeout")?;

    let (frame_tx, frames) = mpsc::channel(RX_QUEUE_DEPTH);
    let (tx, tx_rx) = mpsc::channel(TX_QUEUE_DEPTH);

    let reader_task = tokio::task::spawn_blocking(move || run_reader(reader, frame_tx, cancel));
    let writer_task = tokio::task::spawn_blocking(move || run_writer(writer, tx_rx));

    tracing::info!("Opened radio device {} at {} baud", path.display(), baudrate);

    Ok(RadioDevice {
        interface: HdlcInterface { tx },
        frames,
        tasks: vec![reader_task, writer_task],
    })
}

fn run_reader(mut port: Box<dyn SerialPort>, frame_tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    let mut decoder = HdlcDecoder::new();
    let mut buf = [0u8; RX_BUFFER_SIZE];

    while !cancel.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => {
                tracing::warn!("Radio device closed");
                return;
            }
            Ok(n) => {
                for frame in decoder.decode(&buf[..n]) {
                    if frame_tx.blocking_send(frame).is_err() {
                        tracing::debug!("Frame receiver dropped, stopping reader");
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                tracing::error!("Radio read error: {}", e);
                return;
            }
        }
    }

    tracing::info!("Radio reader shutting down");
}

fn run_writer(mut port: Box<dyn SerialPort>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
            tracing::error!("Radio write error: {}", e);
            return;
        }
    }

    tracing::info!("Radio writer shutting down");
}
