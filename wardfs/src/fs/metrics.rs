use std::sync::atomic::{AtomicU64, Ordering};

use comfy_table::{presets::UTF8_FULL, Cell, Table};
use num_format::{Locale, ToFormattedString};

/// Operation counters, bumped with relaxed ordering on the hot path.
#[derive(Debug, Default)]
pub struct FileSystemStats {
    pub files_created: AtomicU64,
    pub files_deleted: AtomicU64,
    pub directories_created: AtomicU64,
    pub directories_deleted: AtomicU64,
    pub entries_copied: AtomicU64,
    pub entries_moved: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_operations: AtomicU64,
    pub write_operations: AtomicU64,
    pub archive_entries_written: AtomicU64,
    pub total_operations: AtomicU64,
}

impl FileSystemStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders a human-readable counter table.
    pub fn report(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Metric", "Count"]);

        let rows: [(&str, u64); 12] = [
            ("Total operations", self.total_operations.load(Ordering::Relaxed)),
            ("Files created", self.files_created.load(Ordering::Relaxed)),
            ("Files deleted", self.files_deleted.load(Ordering::Relaxed)),
            (
                "Directories created",
                self.directories_created.load(Ordering::Relaxed),
            ),
            (
                "Directories deleted",
                self.directories_deleted.load(Ordering::Relaxed),
            ),
            ("Entries copied", self.entries_copied.load(Ordering::Relaxed)),
            ("Entries moved", self.entries_moved.load(Ordering::Relaxed)),
            ("Read operations", self.read_operations.load(Ordering::Relaxed)),
            ("Write operations", self.write_operations.load(Ordering::Relaxed)),
            ("Bytes read", self.bytes_read.load(Ordering::Relaxed)),
            ("Bytes written", self.bytes_written.load(Ordering::Relaxed)),
            (
                "Archive entries written",
                self.archive_entries_written.load(Ordering::Relaxed),
            ),
        ];
        for (name, value) in rows {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(value.to_formatted_string(&Locale::en)),
            ]);
        }

        table.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_formats_counters() {
        let stats = FileSystemStats::new();
        stats.bytes_written.fetch_add(1_234_567, Ordering::Relaxed);
        stats.record_operation();

        let report = stats.report();
        assert!(report.contains("Bytes written"));
        assert!(report.contains("1,234,567"));
        assert!(report.contains("Total operations"));
    }
}
