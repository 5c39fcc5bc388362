//! 📊 progress.rs: "Are we there yet?", asked by every reindex since the dawn of cron.
//!
//! Two things live here:
//! - [`ProgressMetrics`]: a terminal progress bar over the record file, with a small
//!   comfy-table of rates underneath. Fed by the record source as lines go by.
//! - [`summary_table`]: the end-of-run report, one table, no borders, all the numbers.
//!
//! ⚠️ Watching the bar will not make the cluster faster. We checked.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::session::RunSummary;

const MIB: u64 = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 📦 Bytes, scaled to the size of the whole file so the units stay put while it runs.
fn format_bytes(bytes: u64, file_size: u64) -> String {
    if file_size >= 512 * MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if file_size >= MIB {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// 🔢 1234567 → "1,234,567". Eyes everywhere say thank you.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📊 Records read, bytes read, and how fast, over a sliding 5-second window.
pub(crate) struct ProgressMetrics {
    source_name: String,
    total_size: u64,
    total_bytes: u64,
    total_records: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar has no Debug; the counters are what anyone wants anyway
        f.debug_struct("ProgressMetrics")
            .field("source_name", &self.source_name)
            .field("total_size", &self.total_size)
            .field("total_bytes", &self.total_bytes)
            .field("total_records", &self.total_records)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 `total_size` of 0 means "unknown", the bar then never shows a percentage.
    pub(crate) fn new(source_name: String, total_size: u64) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        // -- 🎨 the template is a constant; if it ever fails to parse we keep indicatif's default look
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            progress_bar.set_style(style.progress_chars("=>-"));
        }

        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));

        Self {
            source_name,
            total_size,
            total_bytes: 0,
            total_records: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    pub(crate) fn update(&mut self, bytes_read: u64, records_read: u64) {
        self.total_bytes += bytes_read;
        self.total_records += records_read;
        let (records_per_sec, mib_per_sec) = self.calculate_rates();
        self.render(records_per_sec, mib_per_sec);
        self.progress_bar.set_position(self.total_bytes);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn calculate_rates(&mut self) -> (f64, f64) {
        let now = Instant::now();
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > RATE_WINDOW {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples
            .push_back((now, self.total_bytes, self.total_records));

        if let Some(&(oldest_time, oldest_bytes, oldest_records)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.total_bytes.saturating_sub(oldest_bytes);
                let records_delta = self.total_records.saturating_sub(oldest_records);
                return (
                    records_delta as f64 / elapsed,
                    (bytes_delta as f64 / elapsed) / MIB as f64,
                );
            }
        }
        (0.0, 0.0)
    }

    fn render(&self, records_per_sec: f64, mib_per_sec: f64) {
        let percent = if self.total_size > 0 {
            (self.total_bytes as f64 / self.total_size as f64) * 100.0
        } else {
            0.0
        };
        let elapsed = self.start_time.elapsed();
        let remaining = if percent > 0.0 {
            // 🔮 linear extrapolation: the future looks like the past, until it does not
            let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
            let remaining_secs = total_estimated - elapsed.as_secs_f64();
            if remaining_secs > 0.0 {
                format_duration(Duration::from_secs_f64(remaining_secs))
            } else {
                "--:--".to_string()
            }
        } else {
            "--:--".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Records/s", format_number(records_per_sec as u64))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Records", format_number(self.total_records))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {}",
                format_bytes(self.total_bytes, self.total_size),
                format_bytes(self.total_size, self.total_size)
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", remaining)).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("records: {}\n{}", self.source_name, table));
    }
}

/// 🧾 The end-of-run report as a borderless two-column table.
pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let rows: Vec<(&str, String)> = vec![
        ("index", summary.concrete_index_name.clone()),
        ("alias", summary.alias_name.clone().unwrap_or_else(|| "-".to_string())),
        ("created", yes_no(summary.index_created).to_string()),
        ("succeeded", format_number(summary.counters.succeeded)),
        ("failed", format_number(summary.counters.failed)),
        ("deleted", format_number(summary.counters.deleted)),
        ("drained", yes_no(summary.drained).to_string()),
        ("alias switch", summary.switch.clone()),
    ];
    for (label, value) in rows {
        table.add_row(vec![
            Cell::new(label).set_alignment(CellAlignment::Right),
            Cell::new(value),
        ]);
    }
    table
}
