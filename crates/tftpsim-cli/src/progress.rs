//! Transfer progress display driven by transfer events.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tftpsim_core::{Direction, EventSink, Message, TransferEvent};

/// Transfer progress tracker
///
/// Counts each data block once, so retransmissions do not inflate the
/// byte count.
pub struct TransferProgress {
    bar: ProgressBar,
    direction: Direction,
    state: Mutex<Counted>,
}

#[derive(Default)]
struct Counted {
    last_block: Option<u16>,
    bytes: u64,
}

impl TransferProgress {
    /// Progress for an upload of known size
    #[must_use]
    pub fn upload(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Sending: {filename}"));
        Self::with_bar(bar, Direction::Send)
    }

    /// Progress for a download of unknown size
    #[must_use]
    pub fn download(filename: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg} {bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("Receiving: {filename}"));
        Self::with_bar(bar, Direction::Receive)
    }

    #[cfg(test)]
    #[must_use]
    pub fn hidden(direction: Direction) -> Self {
        Self::with_bar(ProgressBar::hidden(), direction)
    }

    fn with_bar(bar: ProgressBar, direction: Direction) -> Self {
        Self {
            bar,
            direction,
            state: Mutex::new(Counted::default()),
        }
    }

    #[cfg(test)]
    pub fn bytes(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).bytes
    }

    fn count(&self, block: u16, payload: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_block == Some(block) {
            return;
        }
        state.last_block = Some(block);
        state.bytes += payload.len() as u64;
        self.bar.set_position(state.bytes);
    }
}

impl EventSink for TransferProgress {
    fn emit(&self, event: &TransferEvent) {
        match (event, self.direction) {
            (
                TransferEvent::MessageSent {
                    message: Message::Data { block, payload },
                    ..
                },
                Direction::Send,
            )
            | (
                TransferEvent::MessageReceived {
                    message: Message::Data { block, payload },
                    ..
                },
                Direction::Receive,
            ) => self.count(*block, payload),
            (TransferEvent::Timeout { attempts_remaining }, _) => {
                self.bar
                    .set_message(format!("timed out, {attempts_remaining} attempts left"));
            }
            (TransferEvent::UnknownTid { actual, .. }, _) => {
                self.bar
                    .println(format!("ignored datagram from unknown transfer ID {actual}"));
            }
            (TransferEvent::Completed(summary), _) => {
                let secs = summary.elapsed.as_secs_f64();
                let speed = if secs > 0.0 {
                    summary.bytes as f64 / secs
                } else {
                    summary.bytes as f64
                };
                self.bar.finish_with_message(format!(
                    "{}: {} in {} blocks, {} ({})",
                    summary.filename,
                    format_bytes(summary.bytes),
                    summary.blocks,
                    format_duration(summary.elapsed),
                    format_speed(speed)
                ));
            }
            (TransferEvent::Failed { filename, error }, _) => {
                self.bar.abandon_with_message(format!("{filename}: {error}"));
            }
            _ => {}
        }
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format speed in human-readable format (bytes/sec)
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
