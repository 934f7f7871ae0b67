//! `UsageRecord` and CSV row formatting for `logs/usage.csv`.

pub const USAGE_CSV_HEADER: &str = "timestamp,cpu_percent,memory_bytes,disk_bytes,gpu_percent,gpu_memory_bytes";

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub timestamp: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_bytes: Option<u64>,
}

impl UsageRecord {
    /// Render one CSV data row. GPU columns are blank (not "null") when
    /// absent; numeric float fields carry two-decimal precision.
    pub fn to_csv_row(&self) -> String {
        let gpu_percent = self
            .gpu_percent
            .map(|v| format!("{v:.2}"))
            .unwrap_or_default();
        let gpu_memory_bytes = self
            .gpu_memory_bytes
            .map(|v| v.to_string())
            .unwrap_or_default();
        format!(
            "{},{:.2},{},{},{},{}",
            self.timestamp, self.cpu_percent, self.memory_bytes, self.disk_bytes, gpu_percent, gpu_memory_bytes
        )
    }
}

/// Append `record` to the usage CSV at `path`, writing the header first if
/// the file doesn't exist yet. Best-effort: sampler failures must never
/// propagate up and kill the job (spec §4.7), so callers should log and
/// swallow any error this returns rather than failing the executor.
pub fn append_usage_record(path: &std::path::Path, record: &UsageRecord) -> crate::error::BarnResult<()> {
    let needs_header = !path.exists();
    if needs_header {
        crate::state_io::append_line(path, USAGE_CSV_HEADER)?;
    }
    crate::state_io::append_line(path, &record.to_csv_row())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_row_blanks_missing_gpu_columns() {
        let r = UsageRecord {
            timestamp: "2024-01-01T00:00:00Z".into(),
            cpu_percent: 12.5,
            memory_bytes: 1024,
            disk_bytes: 2048,
            gpu_percent: None,
            gpu_memory_bytes: None,
        };
        assert_eq!(
            r.to_csv_row(),
            "2024-01-01T00:00:00Z,12.50,1024,2048,,"
        );
    }

    #[test]
    fn csv_row_includes_gpu_columns_when_present() {
        let r = UsageRecord {
            timestamp: "2024-01-01T00:00:00Z".into(),
            cpu_percent: 0.0,
            memory_bytes: 0,
            disk_bytes: 0,
            gpu_percent: Some(3.333),
            gpu_memory_bytes: Some(512),
        };
        assert_eq!(r.to_csv_row(), "2024-01-01T00:00:00Z,0.00,0,0,3.33,512");
    }

    #[test]
    fn append_writes_header_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.csv");
        let r = UsageRecord {
            timestamp: "t".into(),
            cpu_percent: 1.0,
            memory_bytes: 1,
            disk_bytes: 1,
            gpu_percent: None,
            gpu_memory_bytes: None,
        };
        append_usage_record(&path, &r).unwrap();
        append_usage_record(&path, &r).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(USAGE_CSV_HEADER).count(), 1);
        assert_eq!(content.lines().count(), 3);
    }
}
