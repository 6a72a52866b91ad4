//! Import file parsing.
//!
//! Handlers only see the normalized structures defined here. `CsvImportParser`
//! reads the canonical CSV layout (with a few header aliases); marketplace
//! spreadsheets are expected to be converted to it upstream.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::jobs::{JobError, JobType};

use super::report::RowError;

/// Marketplace channel a sales file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SalesChannel {
    A,
    B,
}

impl SalesChannel {
    /// Tag stored on picking lists created from this channel.
    pub fn source(&self) -> &'static str {
        match self {
            SalesChannel::A => "SALES_A",
            SalesChannel::B => "SALES_B",
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            SalesChannel::A => JobType::ImportSalesA,
            SalesChannel::B => JobType::ImportSalesB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesLine {
    pub row: usize,
    pub sku: String,
    pub quantity: i64,
}

/// One invoice with its lines, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesOrder {
    pub invoice_no: String,
    pub lines: Vec<SalesLine>,
}

impl SalesOrder {
    pub fn first_row(&self) -> usize {
        self.lines.first().map(|l| l.row).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalesImport {
    pub orders: Vec<SalesOrder>,
    pub row_errors: Vec<RowError>,
}

/// Desired changes for one SKU. Stock fields and catalog fields are independent;
/// a row may carry either or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockAdjustment {
    pub row: usize,
    pub sku: String,
    pub location_code: Option<String>,
    /// Counted quantity at `location_code`.
    pub quantity: Option<i64>,
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjustmentImport {
    pub adjustments: Vec<StockAdjustment>,
    pub row_errors: Vec<RowError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub row: usize,
    pub employee_code: String,
    pub date: NaiveDate,
    pub clock_in: Option<NaiveTime>,
    pub clock_out: Option<NaiveTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendanceImport {
    pub records: Vec<AttendanceRecord>,
    pub row_errors: Vec<RowError>,
}

/// Turns raw file contents into normalized import structures.
///
/// A whole-file problem (unreadable header, wrong encoding) is an `Err`;
/// problems with individual rows go into `row_errors`.
pub trait ImportParser: Send + Sync {
    fn parse_sales(&self, channel: SalesChannel, content: &[u8]) -> Result<SalesImport, JobError>;

    fn parse_adjustments(&self, content: &[u8]) -> Result<AdjustmentImport, JobError>;

    fn parse_attendance(&self, content: &[u8]) -> Result<AttendanceImport, JobError>;
}

// =============================================================================
// CSV ROW TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct CsvSalesRow {
    #[serde(alias = "invoice", alias = "invoice_number", alias = "order_id", alias = "order_number")]
    invoice_no: String,
    #[serde(alias = "seller_sku", alias = "product_sku")]
    sku: String,
    #[serde(alias = "qty", alias = "quantity_sold")]
    quantity: String,
}

#[derive(Debug, Deserialize)]
struct CsvAdjustmentRow {
    #[serde(alias = "product_sku")]
    sku: String,
    #[serde(default, alias = "location_code", alias = "bin")]
    location: Option<String>,
    #[serde(default, alias = "qty", alias = "count")]
    quantity: Option<String>,
    #[serde(default, alias = "product_name")]
    name: Option<String>,
    #[serde(default, alias = "unit_price")]
    price: Option<String>,
    #[serde(default, alias = "is_active")]
    active: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CsvAttendanceRow {
    #[serde(alias = "employee", alias = "employee_id")]
    employee_code: String,
    #[serde(alias = "day")]
    date: String,
    #[serde(default, alias = "in", alias = "check_in")]
    clock_in: Option<String>,
    #[serde(default, alias = "out", alias = "check_out")]
    clock_out: Option<String>,
}

/// Parser for the canonical CSV layout.
#[derive(Debug, Clone, Copy)]
pub struct CsvImportParser {
    delimiter: u8,
}

impl Default for CsvImportParser {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvImportParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn reader<'a>(&self, content: &'a [u8]) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content)
    }

    /// Deserialize every row, handing `(line, row)` to `f`; rows that do not
    /// deserialize become row errors.
    fn each_row<R, F>(&self, content: &[u8], errors: &mut Vec<RowError>, mut f: F) -> Result<(), JobError>
    where
        R: serde::de::DeserializeOwned,
        F: FnMut(usize, R),
    {
        let mut reader = self.reader(content);
        reader
            .headers()
            .map_err(|e| JobError::Header(e.to_string()))?;

        for (idx, result) in reader.deserialize::<R>().enumerate() {
            let row_num = idx + 2;
            match result {
                Ok(row) => f(row_num, row),
                Err(e) => errors.push(RowError::new(row_num, None, e.to_string())),
            }
        }
        Ok(())
    }
}

impl ImportParser for CsvImportParser {
    fn parse_sales(&self, _channel: SalesChannel, content: &[u8]) -> Result<SalesImport, JobError> {
        let mut import = SalesImport::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut errors = Vec::new();

        self.each_row(content, &mut errors, |row_num, row: CsvSalesRow| {
            if row.invoice_no.is_empty() {
                errors_push(&mut import.row_errors, row_num, Some(&row.sku), "missing invoice number");
                return;
            }
            if row.sku.is_empty() {
                errors_push(&mut import.row_errors, row_num, Some(&row.invoice_no), "missing SKU");
                return;
            }
            let quantity = match parse_quantity(&row.quantity) {
                Ok(q) if q > 0 => q,
                Ok(q) => {
                    errors_push(
                        &mut import.row_errors,
                        row_num,
                        Some(&row.sku),
                        format!("quantity must be positive (got {q})"),
                    );
                    return;
                }
                Err(message) => {
                    errors_push(&mut import.row_errors, row_num, Some(&row.sku), message);
                    return;
                }
            };

            let line = SalesLine {
                row: row_num,
                sku: row.sku,
                quantity,
            };
            match index.get(&row.invoice_no) {
                Some(&i) => import.orders[i].lines.push(line),
                None => {
                    index.insert(row.invoice_no.clone(), import.orders.len());
                    import.orders.push(SalesOrder {
                        invoice_no: row.invoice_no,
                        lines: vec![line],
                    });
                }
            }
        })?;

        import.row_errors.extend(errors);
        Ok(import)
    }

    fn parse_adjustments(&self, content: &[u8]) -> Result<AdjustmentImport, JobError> {
        let mut import = AdjustmentImport::default();
        let mut errors = Vec::new();

        self.each_row(content, &mut errors, |row_num, row: CsvAdjustmentRow| {
            if row.sku.is_empty() {
                errors_push(&mut import.row_errors, row_num, None, "missing SKU");
                return;
            }
            match adjustment_from_row(row_num, row) {
                Ok(adjustment) => import.adjustments.push(adjustment),
                Err(e) => import.row_errors.push(e),
            }
        })?;

        import.row_errors.extend(errors);
        Ok(import)
    }

    fn parse_attendance(&self, content: &[u8]) -> Result<AttendanceImport, JobError> {
        let mut import = AttendanceImport::default();
        let mut errors = Vec::new();

        self.each_row(content, &mut errors, |row_num, row: CsvAttendanceRow| {
            let key = Some(row.employee_code.as_str());
            let Some(date) = parse_date(&row.date) else {
                errors_push(&mut import.row_errors, row_num, key, format!("invalid date {:?}", row.date));
                return;
            };
            let clock_in = match parse_time(row.clock_in.as_deref()) {
                Ok(t) => t,
                Err(message) => {
                    errors_push(&mut import.row_errors, row_num, key, message);
                    return;
                }
            };
            let clock_out = match parse_time(row.clock_out.as_deref()) {
                Ok(t) => t,
                Err(message) => {
                    errors_push(&mut import.row_errors, row_num, key, message);
                    return;
                }
            };
            import.records.push(AttendanceRecord {
                row: row_num,
                employee_code: row.employee_code,
                date,
                clock_in,
                clock_out,
            });
        })?;

        import.row_errors.extend(errors);
        Ok(import)
    }
}

fn errors_push(errors: &mut Vec<RowError>, row: usize, key: Option<&str>, message: impl Into<String>) {
    errors.push(RowError::new(row, key, message));
}

fn adjustment_from_row(row_num: usize, row: CsvAdjustmentRow) -> Result<StockAdjustment, RowError> {
    let key = Some(row.sku.as_str());
    let fail = |message: String| RowError::new(row_num, key, message);

    let quantity = non_empty(row.quantity.as_deref())
        .map(parse_quantity)
        .transpose()
        .map_err(fail)?;
    if let Some(q) = quantity {
        if q < 0 {
            return Err(fail(format!("quantity cannot be negative (got {q})")));
        }
    }
    let price_cents = non_empty(row.price.as_deref())
        .map(parse_cents)
        .transpose()
        .map_err(fail)?;
    let is_active = non_empty(row.active.as_deref())
        .map(parse_flag)
        .transpose()
        .map_err(fail)?;

    Ok(StockAdjustment {
        row: row_num,
        location_code: non_empty(row.location.as_deref()).map(str::to_string),
        quantity,
        name: non_empty(row.name.as_deref()).map(str::to_string),
        price_cents,
        is_active,
        sku: row.sku,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Whole-number quantity; accepts a trailing `.0` from spreadsheet exports.
pub fn parse_quantity(raw: &str) -> Result<i64, String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    digits
        .parse::<i64>()
        .map_err(|_| format!("malformed quantity {raw:?}"))
}

/// Decimal money amount to cents (`"12.5"` → 1250). At most two decimals.
pub fn parse_cents(raw: &str) -> Result<i64, String> {
    let malformed = || format!("malformed price {raw:?}");
    let trimmed = raw.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if whole.is_empty() || fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }
    let whole: i64 = whole.parse().map_err(|_| malformed())?;
    let fraction: i64 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<2}").parse().map_err(|_| malformed())?
    };
    let cents = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(malformed)?;
    Ok(if negative { -cents } else { cents })
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "active" => Ok(true),
        "0" | "false" | "no" | "n" | "inactive" => Ok(false),
        _ => Err(format!("malformed flag {raw:?}")),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d.%m.%Y"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

fn parse_time(raw: Option<&str>) -> Result<Option<NaiveTime>, String> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map(Some)
        .map_err(|_| format!("invalid time {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_header_is_a_header_error() {
        let err = CsvImportParser::new()
            .parse_adjustments(b"sku,\xff\xfe\nA,1\n")
            .unwrap_err();
        assert!(matches!(err, JobError::Header(_)));
        assert!(matches!(err.in_file("counts.csv"), JobError::Parse { ref path, .. } if path == "counts.csv"));
    }

    #[test]
    fn sales_rows_group_by_invoice_in_file_order() {
        let csv = "invoice,sku,qty\nINV-2,A,2\nINV-1,B,1\nINV-2,C,3\n";
        let import = CsvImportParser::new().parse_sales(SalesChannel::A, csv.as_bytes()).unwrap();

        assert!(import.row_errors.is_empty());
        assert_eq!(import.orders.len(), 2);
        assert_eq!(import.orders[0].invoice_no, "INV-2");
        assert_eq!(import.orders[0].lines.len(), 2);
        assert_eq!(import.orders[0].lines[1].row, 4);
        assert_eq!(import.orders[1].first_row(), 3);
    }

    #[test]
    fn bad_sales_rows_are_reported_with_line_numbers() {
        let csv = "invoice_no;sku;quantity\nINV-1;A;two\nINV-1;B;0\nINV-1;C;4\n";
        let import = CsvImportParser::new()
            .with_delimiter(b';')
            .parse_sales(SalesChannel::B, csv.as_bytes())
            .unwrap();

        assert_eq!(import.orders.len(), 1);
        assert_eq!(import.orders[0].lines.len(), 1);
        let rows: Vec<usize> = import.row_errors.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![2, 3]);
        assert!(import.row_errors[0].message.contains("malformed quantity"));
    }

    #[test]
    fn missing_columns_are_row_errors() {
        let csv = "invoice_no,sku\nINV-1,A\n";
        let import = CsvImportParser::new().parse_sales(SalesChannel::A, csv.as_bytes()).unwrap();
        assert!(import.orders.is_empty());
        assert_eq!(import.row_errors.len(), 1);
        assert_eq!(import.row_errors[0].row, 2);
    }

    #[test]
    fn adjustment_rows_carry_optional_fields() {
        let csv = "sku,location,quantity,name,price,active\n\
                   A,L1,7,,,\n\
                   B,,,Bravo,12.5,no\n\
                   C,L1,-3,,,\n";
        let import = CsvImportParser::new().parse_adjustments(csv.as_bytes()).unwrap();

        assert_eq!(import.adjustments.len(), 2);
        let a = &import.adjustments[0];
        assert_eq!((a.location_code.as_deref(), a.quantity), (Some("L1"), Some(7)));
        let b = &import.adjustments[1];
        assert_eq!(b.name.as_deref(), Some("Bravo"));
        assert_eq!(b.price_cents, Some(1250));
        assert_eq!(b.is_active, Some(false));
        assert_eq!(import.row_errors.len(), 1);
        assert_eq!(import.row_errors[0].key.as_deref(), Some("C"));
    }

    #[test]
    fn attendance_dates_and_times_are_validated() {
        let csv = "employee_code,date,clock_in,clock_out\n\
                   E1,2024-03-01,08:00,16:30\n\
                   E2,01.03.2024,,\n\
                   E3,yesterday,08:00,\n";
        let import = CsvImportParser::new().parse_attendance(csv.as_bytes()).unwrap();

        assert_eq!(import.records.len(), 2);
        assert_eq!(import.records[1].date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!(import.records[1].clock_in.is_none());
        assert_eq!(import.row_errors[0].row, 4);
    }

    #[test]
    fn cents_parsing() {
        assert_eq!(parse_cents("12"), Ok(1200));
        assert_eq!(parse_cents("12.05"), Ok(1205));
        assert_eq!(parse_cents("-0.5"), Ok(-50));
        assert!(parse_cents("1.234").is_err());
        assert!(parse_cents("abc").is_err());
        assert!(parse_cents(".5").is_err());
    }

    #[test]
    fn quantity_accepts_spreadsheet_floats() {
        assert_eq!(parse_quantity(" 5.0 "), Ok(5));
        assert!(parse_quantity("5.5").is_err());
    }
}
