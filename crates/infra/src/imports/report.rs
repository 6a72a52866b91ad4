use serde::Serialize;

use crate::jobs::JobOutcome;

/// A row that could not be imported. `row` is the 1-based line in the file
/// (the header is line 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    /// SKU or invoice number the row refers to, when known.
    pub key: Option<String>,
    pub message: String,
}

impl RowError {
    pub fn new(row: usize, key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            row,
            key: key.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Per-job import tally; serialized into the job's `result_log`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub success_count: usize,
    pub skipped_count: usize,
    pub error_rows: Vec<RowError>,
}

impl ImportReport {
    pub fn with_errors(error_rows: Vec<RowError>) -> Self {
        Self {
            error_rows,
            ..Default::default()
        }
    }

    pub fn error(&mut self, row: usize, key: Option<&str>, message: impl Into<String>) {
        self.error_rows.push(RowError::new(row, key, message));
    }

    pub fn into_outcome(mut self, label: &str, unit: &str) -> JobOutcome {
        self.error_rows.sort_by_key(|e| e.row);
        let summary = format!(
            "{label}: {} {unit} imported, {} skipped, {} row errors",
            self.success_count,
            self.skipped_count,
            self.error_rows.len()
        );
        let log = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        JobOutcome::new(summary).with_log(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_summarises_counts_and_sorts_errors() {
        let mut report = ImportReport::with_errors(vec![RowError::new(7, Some("X"), "unknown SKU")]);
        report.success_count = 3;
        report.skipped_count = 1;
        report.error(4, None, "malformed quantity");

        let outcome = report.into_outcome("SALES_A", "invoices");
        assert_eq!(outcome.summary, "SALES_A: 3 invoices imported, 1 skipped, 2 row errors");
        let log = outcome.log.unwrap();
        assert_eq!(log["error_rows"][0]["row"], 4);
        assert_eq!(log["error_rows"][1]["key"], "X");
    }
}
