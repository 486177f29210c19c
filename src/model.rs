use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::portal::params::ReportType;

/// One row from the portal's search results. `upload_info_id` is the
/// portal's opaque handle for the uploaded report instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRef {
    pub upload_info_id: String,
    pub fund_code: String,
    pub fund_short_name: String,
    pub organization_name: String,
    pub report_send_date: NaiveDate,
    pub report_desc: String,
}

/// A bounded page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPage {
    pub rows: Vec<ReportRef>,
    pub total_records: u64,
    pub has_next: bool,
}

/// Which extraction path produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParserKind {
    Xbrl,
    Ixbrl,
    Html,
    Llm,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Xbrl => "XBRL",
            ParserKind::Ixbrl => "IXBRL",
            ParserKind::Html => "HTML",
            ParserKind::Llm => "LLM",
        }
    }
}

impl std::fmt::Display for ParserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAllocation {
    pub asset_type: String,
    pub asset_subtype: Option<String>,
    pub market_value: Decimal,
    /// Fraction of net asset value, 0..=1.
    pub net_value_ratio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub rank: u32,
    pub security_code: String,
    pub security_name: String,
    pub shares: Option<i64>,
    pub market_value: Decimal,
    pub net_value_ratio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndustryAllocation {
    pub industry_name: String,
    pub market_value: Decimal,
    pub net_value_ratio: Decimal,
}

/// Aggregate produced by the parser engine; plain data end to end so it
/// can cross worker boundaries untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFundReport {
    pub fund_code: String,
    pub fund_name: String,
    pub fund_manager: Option<String>,
    pub report_type: ReportType,
    pub report_period_start: Option<NaiveDate>,
    pub report_period_end: NaiveDate,
    pub net_asset_value: Option<Decimal>,
    pub total_net_assets: Option<Decimal>,
    pub period_profit: Option<Decimal>,
    pub asset_allocations: Vec<AssetAllocation>,
    pub top_holdings: Vec<Holding>,
    pub industry_allocations: Vec<IndustryAllocation>,
    pub parser_kind: ParserKind,
    pub taxonomy_version: Option<String>,
    pub confidence: Decimal,
    pub warnings: Vec<String>,
}

/// Side-channel context the caller may pass into a parse. The mapper's
/// report-type fallback reads `report_desc` when no document-type fact
/// exists; the HTML path uses `fund_code` when the page omits it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseHints {
    pub report_desc: Option<String>,
    pub fund_code: Option<String>,
}

impl ParseHints {
    pub fn from_ref(r: &ReportRef) -> Self {
        ParseHints {
            report_desc: Some(r.report_desc.clone()),
            fund_code: Some(r.fund_code.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum AttemptOutcome {
    Ok,
    Failed { kind: ErrorKind, message: String },
}

/// One entry per extraction path the facade tried, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseAttempt {
    pub kind: ParserKind,
    pub outcome: AttemptOutcome,
}

/// Outcome of a facade parse. Success carries the report; failure carries
/// the ordered attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResult {
    pub report: Option<ParsedFundReport>,
    pub warnings: Vec<String>,
    pub attempted: Vec<ParseAttempt>,
}

impl ParseResult {
    pub fn success(&self) -> bool {
        self.report.is_some()
    }

    /// FORMAT when nothing could even be classified, PARSE otherwise.
    pub fn failure_kind(&self) -> ErrorKind {
        let all_format = self.attempted.iter().all(|a| {
            matches!(
                &a.outcome,
                AttemptOutcome::Failed {
                    kind: ErrorKind::Format,
                    ..
                }
            )
        });
        if self.attempted.is_empty() || all_format {
            ErrorKind::Format
        } else {
            ErrorKind::Parse
        }
    }

    pub fn failure_message(&self) -> String {
        let parts: Vec<String> = self
            .attempted
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::Ok => format!("{}: ok", a.kind),
                AttemptOutcome::Failed { kind, message } => {
                    format!("{}: {} ({})", a.kind, kind, message)
                }
            })
            .collect();
        format!("no parser succeeded [{}]", parts.join("; "))
    }
}
