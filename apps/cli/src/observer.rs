//! Terminal progress reporting.

use bleota_core::{OtaEvent, OtaObserver, TracingObserver};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Drives a progress bar from sector ACKs and logs everything else through tracing.
pub struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl OtaObserver for CliObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::Progress {
                acked_sectors,
                total_sectors,
                bytes_sent,
                total_bytes,
            } => {
                self.bar.set_length(*total_bytes as u64);
                self.bar.set_position(*bytes_sent as u64);
                self.bar
                    .set_message(format!("{acked_sectors}/{total_sectors} sectors"));
            }
            OtaEvent::Complete => {
                self.bar.finish_with_message("done");
                TracingObserver.on_event(event);
            }
            OtaEvent::Error { code, .. } => {
                self.bar.abandon_with_message(format!("failed (code {code})"));
                TracingObserver.on_event(event);
            }
            other => self.bar.suspend(|| TracingObserver.on_event(other)),
        }
    }
}
