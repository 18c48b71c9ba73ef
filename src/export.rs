// 📤 Report Writers - one workbook (or CSV set) per company and date
//
// Layout: <output_dir>/<company>/Report_<company>_<date>.xlsx with sheets
// local, foreign, combined and, when there are issues, data_quality.

use anyhow::{Context, Result};
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook, Worksheet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data_quality::QualityIssue;
use crate::report::{Cell, Report, ReportRow, HARMONIZED_COLUMNS};

const QUALITY_COLUMNS: &[&str] = &["Severity", "Category", "Subject", "Message", "Recommendation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Xlsx,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xlsx" | "excel" => Ok(OutputFormat::Xlsx),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}

pub trait ReportWriter {
    /// Write one report below `output_dir`, returning the main file written
    fn write(&self, report: &Report, output_dir: &Path) -> Result<PathBuf>;
}

pub fn get_writer(format: OutputFormat) -> Box<dyn ReportWriter> {
    match format {
        OutputFormat::Xlsx => Box::new(XlsxReportWriter),
        OutputFormat::Csv => Box::new(CsvReportWriter),
    }
}

/// Company codes end up in paths
fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn company_dir(report: &Report, output_dir: &Path) -> Result<PathBuf> {
    let dir = output_dir.join(safe_name(&report.company));
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    Ok(dir)
}

fn file_stem(report: &Report) -> String {
    format!(
        "Report_{}_{}",
        safe_name(&report.company),
        report.date.format("%Y-%m-%d")
    )
}

// ============================================================================
// XLSX
// ============================================================================

pub struct XlsxReportWriter;

struct Formats {
    header: Format,
    revaluation: Format,
}

impl Formats {
    fn new() -> Self {
        Formats {
            header: Format::new().set_bold().set_border(FormatBorder::Thin),
            revaluation: Format::new()
                .set_bold()
                .set_background_color(Color::RGB(0xFFFF99)),
        }
    }
}

impl XlsxReportWriter {
    fn write_rows(
        worksheet: &mut Worksheet,
        name: &str,
        rows: &[&ReportRow],
        formats: &Formats,
    ) -> Result<()> {
        worksheet.set_name(name)?;
        for (col, header) in HARMONIZED_COLUMNS.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &formats.header)?;
            worksheet.set_column_width(col as u16, 16)?;
        }
        worksheet.set_freeze_panes(1, 0)?;

        for (i, row) in rows.iter().enumerate() {
            let r = (i + 1) as u32;
            let highlight = row.is_revaluation();
            for (col, cell) in row.cells().into_iter().enumerate() {
                let c = col as u16;
                match (cell, highlight) {
                    (Cell::Text(s), false) => {
                        worksheet.write_string(r, c, &s)?;
                    }
                    (Cell::Text(s), true) => {
                        worksheet.write_string_with_format(r, c, &s, &formats.revaluation)?;
                    }
                    (Cell::Number(n), false) => {
                        worksheet.write_number(r, c, n)?;
                    }
                    (Cell::Number(n), true) => {
                        worksheet.write_number_with_format(r, c, n, &formats.revaluation)?;
                    }
                    (Cell::Empty, true) => {
                        worksheet.write_blank(r, c, &formats.revaluation)?;
                    }
                    (Cell::Empty, false) => {}
                }
            }
        }
        Ok(())
    }

    fn write_quality(worksheet: &mut Worksheet, issues: &[QualityIssue], formats: &Formats) -> Result<()> {
        worksheet.set_name("data_quality")?;
        for (col, header) in QUALITY_COLUMNS.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, *header, &formats.header)?;
        }
        worksheet.set_column_width(3, 80)?;
        for (i, issue) in issues.iter().enumerate() {
            let r = (i + 1) as u32;
            worksheet.write_string(r, 0, issue.severity.to_string())?;
            worksheet.write_string(r, 1, issue.category.to_string())?;
            worksheet.write_string(r, 2, &issue.subject)?;
            worksheet.write_string(r, 3, &issue.message)?;
            worksheet.write_string(r, 4, &issue.recommendation)?;
        }
        Ok(())
    }
}

impl ReportWriter for XlsxReportWriter {
    fn write(&self, report: &Report, output_dir: &Path) -> Result<PathBuf> {
        let path = company_dir(report, output_dir)?.join(format!("{}.xlsx", file_stem(report)));
        let formats = Formats::new();
        let mut workbook = Workbook::new();

        let local: Vec<&ReportRow> = report.local.iter().collect();
        let foreign: Vec<&ReportRow> = report.foreign.iter().collect();
        let combined = report.combined();

        Self::write_rows(workbook.add_worksheet(), "local", &local, &formats)?;
        Self::write_rows(workbook.add_worksheet(), "foreign", &foreign, &formats)?;
        Self::write_rows(workbook.add_worksheet(), "combined", &combined, &formats)?;
        if !report.quality.is_empty() {
            Self::write_quality(workbook.add_worksheet(), &report.quality, &formats)?;
        }

        workbook
            .save(&path)
            .with_context(|| format!("Failed to save workbook {}", path.display()))?;

        tracing::info!(path = %path.display(), rows = report.len(), "report written");
        Ok(path)
    }
}

// ============================================================================
// CSV
// ============================================================================

/// One CSV per sheet: Report_<company>_<date>_<sheet>.csv
pub struct CsvReportWriter;

impl CsvReportWriter {
    fn write_rows(path: &Path, rows: &[&ReportRow]) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        wtr.write_record(HARMONIZED_COLUMNS)?;
        for row in rows {
            wtr.write_record(row.cells().iter().map(Cell::render))?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_quality(path: &Path, issues: &[QualityIssue]) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        wtr.write_record(QUALITY_COLUMNS)?;
        for issue in issues {
            wtr.write_record([
                issue.severity.to_string(),
                issue.category.to_string(),
                issue.subject.clone(),
                issue.message.clone(),
                issue.recommendation.clone(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

impl ReportWriter for CsvReportWriter {
    fn write(&self, report: &Report, output_dir: &Path) -> Result<PathBuf> {
        let dir = company_dir(report, output_dir)?;
        let stem = file_stem(report);

        let local: Vec<&ReportRow> = report.local.iter().collect();
        let foreign: Vec<&ReportRow> = report.foreign.iter().collect();
        let combined_path = dir.join(format!("{}_combined.csv", stem));

        Self::write_rows(&dir.join(format!("{}_local.csv", stem)), &local)?;
        Self::write_rows(&dir.join(format!("{}_foreign.csv", stem)), &foreign)?;
        Self::write_rows(&combined_path, &report.combined())?;
        if !report.quality.is_empty() {
            Self::write_quality(&dir.join(format!("{}_data_quality.csv", stem)), &report.quality)?;
        }

        tracing::info!(path = %combined_path.display(), rows = report.len(), "report written");
        Ok(combined_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bank, Memo, NormalizedTransaction, RowKind};
    use crate::report::ReportAssembler;
    use crate::revaluation::RevaluationEntry;
    use chrono::NaiveDate;

    fn sample_report() -> Report {
        let day = NaiveDate::from_ymd_opt(2025, 5, 29).unwrap();
        let tx = NormalizedTransaction {
            bank: Bank::Tbc,
            company: "BRG".to_string(),
            account_number: "GE11TB0000000000000002".to_string(),
            currency: "USD".to_string(),
            date: day,
            entry_id: "M-1".to_string(),
            debit: 50.0,
            credit: 0.0,
            debit_base: Some(136.0),
            credit_base: Some(0.0),
            rate: Some(2.72),
            transaction_rate: Some(2.71),
            opening_balance: 1000.0,
            closing_balance: 950.0,
            reported_closing_balance: Some(950.0),
            memo: Memo {
                description: Some("Rent, May".to_string()),
                ..Memo::default()
            },
        };
        let reval = RevaluationEntry {
            kind: RowKind::Revaluation,
            bank: Bank::Tbc,
            company: "BRG".to_string(),
            account_number: "GE11TB0000000000000002".to_string(),
            currency: "USD".to_string(),
            date: day,
            opening_balance: 1000.0,
            closing_balance: 950.0,
            turnover: -50.0,
            rate_today: 2.72,
            rate_yesterday: 2.70,
            fx_adjustment: -20.0,
        };
        let mut reports = ReportAssembler::new("GEL").assemble(&[tx], &[reval]);
        reports.remove(0)
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("XLSX".parse::<OutputFormat>().unwrap(), OutputFormat::Xlsx);
        assert_eq!("csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert!("pdf".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("BRG"), "BRG");
        assert_eq!(safe_name("A/B C"), "A_B_C");
    }

    #[test]
    fn test_csv_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();

        let path = CsvReportWriter.write(&report, dir.path()).unwrap();
        assert_eq!(
            path,
            dir.path().join("BRG").join("Report_BRG_2025-05-29_combined.csv")
        );

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers.len(), HARMONIZED_COLUMNS.len());
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][1], "transaction");
        assert_eq!(&records[0][7], "Rent, May");
        assert_eq!(&records[1][1], "revaluation");
        assert_eq!(&records[1][17], "20");

        assert!(dir.path().join("BRG").join("Report_BRG_2025-05-29_local.csv").exists());
        assert!(!dir.path().join("BRG").join("Report_BRG_2025-05-29_data_quality.csv").exists());

        println!("✅ CSV writer test PASSED");
    }

    #[test]
    fn test_xlsx_writer_creates_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample_report();

        let path = XlsxReportWriter.write(&report, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("BRG").join("Report_BRG_2025-05-29.xlsx"));
        assert!(path.exists());

        // Read it back with the registry reader's crate
        use calamine::{open_workbook, Reader, Xlsx};
        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(
            workbook.sheet_names(),
            vec!["local".to_string(), "foreign".to_string(), "combined".to_string()]
        );
        let combined = workbook.worksheet_range("combined").unwrap();
        assert_eq!(combined.height(), 3);

        println!("✅ XLSX writer test PASSED");
    }
}
