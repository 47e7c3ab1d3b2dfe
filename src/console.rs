//! Terminal host: notices on stdout, progress bars, updater handoff.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use netupdate_core::{HostBridge, HostNotice, NoticeKind, ProgressSink, UpdateError, UpdaterLaunch};
use tracing::{info, warn};

/// [`HostBridge`] for the command line.
#[derive(Debug, Default)]
pub(crate) struct ConsoleHost {
    quit_requested: AtomicBool,
}

impl ConsoleHost {
    /// Whether a notice asked the process to quit.
    pub(crate) fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::SeqCst)
    }
}

impl HostBridge for ConsoleHost {
    fn publish_notice(&self, notice: &HostNotice) {
        match notice.kind {
            NoticeKind::Error => warn!(title = %notice.title, "{}", notice.message),
            NoticeKind::Maintenance | NoticeKind::Info => {
                info!(title = %notice.title, "{}", notice.message);
            }
        }
        println!("{}: {}", notice.title, notice.message);
    }

    fn request_quit_after_acknowledgement(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
    }

    fn launch_updater_and_exit(&self, launch: &UpdaterLaunch) -> Result<(), UpdateError> {
        launch.spawn()?;
        info!("external updater started, exiting");
        std::process::exit(0);
    }
}

/// Byte-count progress bar, hidden when quiet or not attached to a terminal.
pub(crate) fn byte_progress(enabled: bool, label: &str) -> ProgressBar {
    if !enabled || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {bytes} ({bytes_per_sec}) {msg}") {
        bar.set_style(style);
    }
    bar.set_message(label.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// Forwards cumulative byte counts into a progress bar.
pub(crate) fn progress_sink(bar: &ProgressBar) -> ProgressSink {
    let bar = bar.clone();
    ProgressSink::new(move |bytes| bar.set_position(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_host_records_quit_request() {
        let host = ConsoleHost::default();
        assert!(!host.quit_requested());
        host.request_quit_after_acknowledgement();
        assert!(host.quit_requested());
    }

    #[test]
    fn test_disabled_progress_is_hidden() {
        let bar = byte_progress(false, "x");
        assert!(bar.is_hidden());
        progress_sink(&bar).report(42);
        assert_eq!(bar.position(), 42);
    }
}
