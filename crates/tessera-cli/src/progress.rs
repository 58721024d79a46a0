//! Terminal output: spinners, event lines and human-readable sizes.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tessera_core::node::{ControllerState, SyncEvent};

/// Spinner shown while a long local operation runs
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    /// Start a spinner with a message
    #[must_use]
    pub fn new(msg: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(msg.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Progress bar for chunk transfers of one folder
pub struct TransferBar {
    bar: ProgressBar,
}

impl TransferBar {
    /// Create a bar for `folder`
    #[must_use]
    pub fn new(folder: &str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{wide_bar:.cyan/blue}] {pos}/{len} chunks")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("folder {folder}"));
        Self { bar }
    }

    /// Reflect a `TransferProgress` event
    pub fn update(&self, completed: u64, remaining: usize, bytes: u64) {
        self.bar.set_length(completed + remaining as u64);
        self.bar.set_position(completed);
        if remaining == 0 {
            self.bar
                .finish_with_message(format!("transferred {}", format_bytes(bytes)));
        }
    }
}

/// One line describing an event, or `None` for events shown elsewhere
#[must_use]
pub fn describe(event: &SyncEvent) -> Option<String> {
    let line = match event {
        SyncEvent::FolderStateChanged { folder_id, state } => {
            let name = format!("{state:?}").to_lowercase();
            let name = match state {
                ControllerState::Degraded => style(name).red().bold().to_string(),
                ControllerState::Idle => style(name).green().to_string(),
                _ => style(name).dim().to_string(),
            };
            format!("{} {}", folder_id.short(), name)
        }
        SyncEvent::PeerJoined {
            folder_id,
            peer_id,
            addr,
        } => format!(
            "{} {} {} at {}",
            folder_id.short(),
            style("peer joined").green(),
            peer_id.short(),
            addr
        ),
        SyncEvent::PeerLeft {
            folder_id,
            peer_id,
            reason,
        } => format!(
            "{} {} {} ({})",
            folder_id.short(),
            style("peer left").yellow(),
            peer_id.short(),
            reason
        ),
        SyncEvent::TransferProgress { .. } => return None,
        SyncEvent::ConflictDetected {
            folder_id,
            path,
            conflict_path,
            ..
        } => format!(
            "{} {} {} -> {}",
            folder_id.short(),
            style("conflict").magenta().bold(),
            path,
            conflict_path
        ),
        SyncEvent::ChunkUnavailable { folder_id, digest } => format!(
            "{} {} {}",
            folder_id.short(),
            style("chunk unavailable").yellow(),
            digest.short()
        ),
        SyncEvent::FileUpdated {
            folder_id,
            path,
            deleted,
        } => {
            let verb = if *deleted { "deleted" } else { "updated" };
            format!("{} {} {}", folder_id.short(), style(verb).cyan(), path)
        }
        SyncEvent::Error {
            folder_id,
            kind,
            message,
        } => {
            let scope = folder_id.as_ref().map_or_else(|| "node".to_string(), |f| f.short());
            format!(
                "{} {} {}",
                scope,
                style(format!("{kind:?} error").to_lowercase()).red(),
                message
            )
        }
    };
    Some(line)
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
