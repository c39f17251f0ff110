//! Progress bars for the flash engine

use flashy_mtd::{FlashProgress, FlashStats};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                    phase
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl FlashProgress for IndicatifProgress {
    fn erasing(&mut self, blocks_to_erase: usize, bytes_to_erase: u64) {
        self.create_spinner(format!(
            "Erasing {} blocks ({} bytes)...",
            blocks_to_erase, bytes_to_erase
        ));
    }

    fn erase_progress(&mut self, blocks_erased: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_message(format!("Erased {} blocks...", blocks_erased));
        }
    }

    fn writing(&mut self, bytes_to_write: u64) {
        self.finish("Erase complete");
        self.create_bar(bytes_to_write, "Writing");
    }

    fn write_progress(&mut self, bytes_written: u64) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_written);
        }
    }

    fn verifying(&mut self, bytes_to_verify: u64) {
        self.finish("Write complete");
        self.create_spinner(format!("Verifying {} bytes...", bytes_to_verify));
    }

    fn complete(&mut self, stats: &FlashStats) {
        self.finish("Verify complete");
        println!(
            "{} blocks erased ({} bytes), {} bytes written, {} bytes verified",
            stats.blocks_erased, stats.bytes_erased, stats.bytes_written, stats.bytes_verified
        );
    }
}
