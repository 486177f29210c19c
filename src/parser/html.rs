use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use std::collections::HashMap;

use crate::error::ParseError;
use crate::model::{AssetAllocation, Holding, IndustryAllocation, ParseHints, ParsedFundReport, ParserKind};
use crate::portal::params::ReportType;

/// Header aliases per logical column. Portal HTML renditions vary the
/// wording table by table, so columns are located by these aliases and
/// never by fixed indices.
const SECURITY_CODE: &[&str] = &["证券代码", "股票代码", "债券代码"];
const SECURITY_NAME: &[&str] = &["证券名称", "股票名称", "债券名称"];
const MARKET_VALUE: &[&str] = &["公允价值", "市值", "金额"];
const RATIO: &[&str] = &["占基金资产净值比例", "占净值比例", "净值比例", "比例"];
const RANK: &[&str] = &["序号", "排名"];
const SHARES: &[&str] = &["数量", "持股数", "份额"];
const INDUSTRY: &[&str] = &["行业类别", "行业名称", "行业"];
const ASSET_TYPE: &[&str] = &["项目", "资产类别", "资产项目"];

const FUND_CODE_LABELS: &[&str] = &["基金主代码", "基金代码"];
const FUND_NAME_LABELS: &[&str] = &["基金名称", "基金全称"];
const FUND_MANAGER_LABELS: &[&str] = &["基金管理人"];
const NAV_LABELS: &[&str] = &["期末基金份额净值", "基金份额净值", "单位净值"];
const TOTAL_NET_LABELS: &[&str] = &["期末基金资产净值", "基金资产净值", "资产净值合计"];
const PROFIT_LABELS: &[&str] = &["本期利润", "本期已实现收益"];

static PERIOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"自\s*(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日.{0,6}至\s*(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").unwrap()
});
static DATE_CN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").unwrap());
static FUND_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{6})").unwrap());

/// Parse an untagged HTML rendition of a fund report into the same shape
/// the XBRL path produces.
pub fn parse(content: &str, hints: &ParseHints) -> Result<ParsedFundReport, ParseError> {
    let document = Html::parse_document(content);
    let tables = collect_tables(&document);
    if tables.is_empty() {
        return Err(ParseError::Extraction(
            "document contains no tables".to_string(),
        ));
    }

    let full_text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let title = select_text(&document, "title");

    let fund_code = find_labeled(&tables, FUND_CODE_LABELS)
        .and_then(|v| FUND_CODE_RE.captures(&v).map(|c| c[1].to_string()))
        .or_else(|| hints.fund_code.clone())
        .ok_or_else(|| ParseError::Extraction("fund code not found".to_string()))?;

    let fund_name = find_labeled(&tables, FUND_NAME_LABELS)
        .or_else(|| title.clone().filter(|t| t.len() >= 5))
        .ok_or_else(|| ParseError::Extraction("fund name not found".to_string()))?;

    let fund_manager = find_labeled(&tables, FUND_MANAGER_LABELS);

    let (report_period_start, report_period_end) = find_period(&full_text)
        .ok_or_else(|| ParseError::Extraction("report period not found".to_string()))?;

    let report_type = title
        .as_deref()
        .and_then(ReportType::from_desc)
        .or_else(|| hints.report_desc.as_deref().and_then(ReportType::from_desc))
        .or_else(|| {
            let head: String = full_text.chars().take(500).collect();
            ReportType::from_desc(&head)
        })
        .ok_or_else(|| ParseError::Extraction("report type not determinable".to_string()))?;

    let net_asset_value = find_labeled(&tables, NAV_LABELS).and_then(|v| parse_number(&v));
    let total_net_assets = find_labeled(&tables, TOTAL_NET_LABELS).and_then(|v| parse_number(&v));
    let period_profit = find_labeled(&tables, PROFIT_LABELS).and_then(|v| parse_number(&v));

    let top_holdings = extract_holdings(&tables);
    let industry_allocations = extract_industries(&tables);
    let asset_allocations = extract_allocations(&tables);

    // Confidence grows with every field this parser actually captured.
    let captures = [
        fund_manager.is_some(),
        net_asset_value.is_some(),
        total_net_assets.is_some(),
        period_profit.is_some(),
        !top_holdings.is_empty(),
        !industry_allocations.is_empty(),
        !asset_allocations.is_empty(),
    ];
    let hits = captures.iter().filter(|c| **c).count() as i64;
    let mut confidence = Decimal::new(70, 2) + Decimal::new(5, 2) * Decimal::from(hits);
    if confidence > Decimal::new(95, 2) {
        confidence = Decimal::new(95, 2);
    }

    debug!(
        "html parse: {} holdings, {} industries, {} allocations, confidence {}",
        top_holdings.len(),
        industry_allocations.len(),
        asset_allocations.len(),
        confidence
    );

    Ok(ParsedFundReport {
        fund_code,
        fund_name,
        fund_manager,
        report_type,
        report_period_start,
        report_period_end,
        net_asset_value,
        total_net_assets,
        period_profit,
        asset_allocations,
        top_holdings,
        industry_allocations,
        parser_kind: ParserKind::Html,
        taxonomy_version: None,
        confidence,
        warnings: Vec::new(),
    })
}

type Table = Vec<Vec<String>>;

fn collect_tables(document: &Html) -> Vec<Table> {
    let table_selector = Selector::parse("table").expect("static selector");
    let row_selector = Selector::parse("tr").expect("static selector");
    let cell_selector = Selector::parse("th, td").expect("static selector");

    document
        .select(&table_selector)
        .map(|table| {
            table
                .select(&row_selector)
                .map(|row| {
                    row.select(&cell_selector)
                        .map(|cell| clean_text(&cell.text().collect::<Vec<_>>().join(" ")))
                        .collect()
                })
                .filter(|cells: &Vec<String>| !cells.is_empty())
                .collect()
        })
        .collect()
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .map(|el| clean_text(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
}

fn clean_text(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Locate a scalar by its label using ordered DOM-neighbor strategies:
/// value in the same cell after the separator, the next cell in the row,
/// then the same column of the next row.
fn find_labeled(tables: &[Table], labels: &[&str]) -> Option<String> {
    for table in tables {
        for (row_idx, row) in table.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                if !labels.iter().any(|l| cell.contains(l)) {
                    continue;
                }
                if let Some((_, value)) = cell.split_once(|c| c == '：' || c == ':') {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
                if let Some(next) = row.get(col_idx + 1) {
                    if !next.is_empty() && !labels.iter().any(|l| next.contains(l)) {
                        return Some(next.clone());
                    }
                }
                if let Some(below) = table.get(row_idx + 1).and_then(|r| r.get(col_idx)) {
                    if !below.is_empty() {
                        return Some(below.clone());
                    }
                }
            }
        }
    }
    None
}

/// Find the header row matching every required alias group; returns the
/// row index plus field -> column mapping (optional groups included when
/// present).
fn header_map(
    table: &Table,
    required: &[(&str, &[&str])],
    optional: &[(&str, &[&str])],
) -> Option<(usize, HashMap<String, usize>)> {
    'rows: for (row_idx, row) in table.iter().enumerate() {
        let mut mapping = HashMap::new();
        for (field, aliases) in required {
            match locate_column(row, aliases) {
                Some(col) => {
                    mapping.insert(field.to_string(), col);
                }
                None => continue 'rows,
            }
        }
        for (field, aliases) in optional {
            if let Some(col) = locate_column(row, aliases) {
                mapping.insert(field.to_string(), col);
            }
        }
        return Some((row_idx, mapping));
    }
    None
}

fn locate_column(row: &[String], aliases: &[&str]) -> Option<usize> {
    for alias in aliases {
        if let Some(idx) = row.iter().position(|cell| cell.contains(alias)) {
            return Some(idx);
        }
    }
    None
}

fn is_summary_row(label: &str) -> bool {
    matches!(label, "合计" | "总计" | "小计")
}

fn cell<'a>(row: &'a [String], mapping: &HashMap<String, usize>, field: &str) -> Option<&'a str> {
    mapping
        .get(field)
        .and_then(|&col| row.get(col))
        .map(String::as_str)
}

fn extract_holdings(tables: &[Table]) -> Vec<Holding> {
    let required: &[(&str, &[&str])] = &[
        ("security_code", SECURITY_CODE),
        ("security_name", SECURITY_NAME),
        ("market_value", MARKET_VALUE),
        ("net_value_ratio", RATIO),
    ];
    let optional: &[(&str, &[&str])] = &[("rank", RANK), ("shares", SHARES)];

    for table in tables {
        let Some((header_idx, mapping)) = header_map(table, required, optional) else {
            continue;
        };
        let mut holdings = Vec::new();
        for row in &table[header_idx + 1..] {
            let code = cell(row, &mapping, "security_code")
                .and_then(|v| FUND_CODE_RE.captures(v).map(|c| c[1].to_string()));
            let name = cell(row, &mapping, "security_name").map(str::to_string);
            let market_value = cell(row, &mapping, "market_value").and_then(parse_number);
            let ratio = cell(row, &mapping, "net_value_ratio").and_then(parse_ratio);

            let (Some(code), Some(name), Some(market_value), Some(ratio)) =
                (code, name, market_value, ratio)
            else {
                continue;
            };
            if name.is_empty() || is_summary_row(&name) {
                continue;
            }
            holdings.push(Holding {
                rank: cell(row, &mapping, "rank")
                    .and_then(parse_number)
                    .and_then(|r| r.to_u32())
                    .unwrap_or((holdings.len() + 1) as u32),
                security_code: code,
                security_name: name,
                shares: cell(row, &mapping, "shares")
                    .and_then(parse_number)
                    .and_then(|s| s.trunc().to_i64()),
                market_value,
                net_value_ratio: ratio,
            });
        }
        if !holdings.is_empty() {
            holdings.sort_by_key(|h| h.rank);
            return holdings;
        }
    }
    Vec::new()
}

fn extract_industries(tables: &[Table]) -> Vec<IndustryAllocation> {
    let required: &[(&str, &[&str])] = &[
        ("industry_name", INDUSTRY),
        ("market_value", MARKET_VALUE),
        ("net_value_ratio", RATIO),
    ];

    for table in tables {
        let Some((header_idx, mapping)) = header_map(table, required, &[]) else {
            continue;
        };
        let mut industries = Vec::new();
        for row in &table[header_idx + 1..] {
            let name = cell(row, &mapping, "industry_name")
                .map(str::to_string)
                .filter(|n| !n.is_empty() && !is_summary_row(n));
            let market_value = cell(row, &mapping, "market_value").and_then(parse_number);
            let ratio = cell(row, &mapping, "net_value_ratio").and_then(parse_ratio);
            if let (Some(industry_name), Some(market_value), Some(net_value_ratio)) =
                (name, market_value, ratio)
            {
                industries.push(IndustryAllocation {
                    industry_name,
                    market_value,
                    net_value_ratio,
                });
            }
        }
        if !industries.is_empty() {
            return industries;
        }
    }
    Vec::new()
}

fn extract_allocations(tables: &[Table]) -> Vec<AssetAllocation> {
    let required: &[(&str, &[&str])] = &[
        ("asset_type", ASSET_TYPE),
        ("market_value", MARKET_VALUE),
        ("net_value_ratio", RATIO),
    ];

    for table in tables {
        let Some((header_idx, mapping)) = header_map(table, required, &[]) else {
            continue;
        };
        let mut allocations = Vec::new();
        for row in &table[header_idx + 1..] {
            let asset_type = cell(row, &mapping, "asset_type")
                .map(str::to_string)
                // Serial-number cells are not asset classes.
                .filter(|t| !t.is_empty() && !is_summary_row(t) && !t.chars().all(|c| c.is_ascii_digit()));
            let market_value = cell(row, &mapping, "market_value").and_then(parse_number);
            let ratio = cell(row, &mapping, "net_value_ratio").and_then(parse_ratio);
            if let (Some(asset_type), Some(market_value), Some(net_value_ratio)) =
                (asset_type, market_value, ratio)
            {
                allocations.push(AssetAllocation {
                    asset_type,
                    asset_subtype: None,
                    market_value,
                    net_value_ratio,
                });
            }
        }
        if !allocations.is_empty() {
            return allocations;
        }
    }
    Vec::new()
}

/// Numeric cell with thousand separators and unit suffixes stripped.
fn parse_number(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse::<Decimal>().ok()
}

/// Ratio cell: percent signs mean the value is scaled by 100.
fn parse_ratio(raw: &str) -> Option<Decimal> {
    let had_percent = raw.contains('%') || raw.contains('％');
    let value = parse_number(raw)?;
    let value = if had_percent || value > Decimal::ONE {
        value / Decimal::from(100)
    } else {
        value
    };
    Some(value)
}

fn find_period(text: &str) -> Option<(Option<chrono::NaiveDate>, chrono::NaiveDate)> {
    if let Some(caps) = PERIOD_RE.captures(text) {
        let start = ymd(&caps[1], &caps[2], &caps[3]);
        let end = ymd(&caps[4], &caps[5], &caps[6])?;
        return Some((start, end));
    }
    // Single dates appear as 截至/止 statements; the latest one is the
    // period end.
    let mut last = None;
    for caps in DATE_CN_RE.captures_iter(text) {
        if let Some(date) = ymd(&caps[1], &caps[2], &caps[3]) {
            last = Some(match last {
                Some(prev) if prev > date => prev,
                _ => date,
            });
        }
    }
    last.map(|end| (None, end))
}

fn ymd(y: &str, m: &str, d: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const REPORT: &str = r#"<!DOCTYPE html>
<html><head><title>华夏成长证券投资基金2024年年度报告</title></head>
<body>
<p>本报告期自2024年1月1日起至2024年12月31日止。</p>
<table>
  <tr><td>基金主代码</td><td>000001</td></tr>
  <tr><td>基金名称</td><td>华夏成长证券投资基金</td></tr>
  <tr><td>基金管理人：华夏基金管理有限公司</td></tr>
  <tr><td>期末基金资产净值</td><td>5,000,000,000.00元</td></tr>
  <tr><td>期末基金份额净值</td><td>1.5234</td></tr>
</table>
<table>
  <tr><th>序号</th><th>股票代码</th><th>股票名称</th><th>数量（股）</th><th>公允价值（元）</th><th>占基金资产净值比例（%）</th></tr>
  <tr><td>1</td><td>600519</td><td>贵州茅台</td><td>120,000</td><td>200,000,000.00</td><td>4.00%</td></tr>
  <tr><td>2</td><td>000858</td><td>五粮液</td><td>300,000</td><td>150,000,000.00</td><td>3.00%</td></tr>
  <tr><td colspan="4">合计</td><td>350,000,000.00</td><td>7.00%</td></tr>
</table>
<table>
  <tr><th>行业类别</th><th>公允价值（元）</th><th>占基金资产净值比例（%）</th></tr>
  <tr><td>制造业</td><td>1,250,000,000.00</td><td>25.00%</td></tr>
  <tr><td>金融业</td><td>750,000,000.00</td><td>15.00%</td></tr>
  <tr><td>合计</td><td>2,000,000,000.00</td><td>40.00%</td></tr>
</table>
<table>
  <tr><th>项目</th><th>金额（元）</th><th>占基金总资产的比例（%）</th></tr>
  <tr><td>股票投资</td><td>4,250,000,000.00</td><td>85.00%</td></tr>
  <tr><td>债券投资</td><td>500,000,000.00</td><td>10.00%</td></tr>
  <tr><td>银行存款和结算备付金合计</td><td>250,000,000.00</td><td>5.00%</td></tr>
</table>
</body></html>"#;

    #[test]
    fn parses_scalars_via_label_strategies() {
        let report = parse(REPORT, &ParseHints::default()).unwrap();
        assert_eq!(report.fund_code, "000001");
        assert_eq!(report.fund_name, "华夏成长证券投资基金");
        assert_eq!(
            report.fund_manager.as_deref(),
            Some("华夏基金管理有限公司")
        );
        assert_eq!(report.total_net_assets, Some(dec!(5000000000.00)));
        assert_eq!(report.net_asset_value, Some(dec!(1.5234)));
        assert_eq!(report.report_type, ReportType::Annual);
        assert_eq!(
            report.report_period_end,
            chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
        );
        assert_eq!(
            report.report_period_start,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
        );
    }

    #[test]
    fn holdings_come_from_header_aliases_not_positions() {
        let report = parse(REPORT, &ParseHints::default()).unwrap();
        assert_eq!(report.top_holdings.len(), 2);
        let first = &report.top_holdings[0];
        assert_eq!(first.rank, 1);
        assert_eq!(first.security_code, "600519");
        assert_eq!(first.security_name, "贵州茅台");
        assert_eq!(first.shares, Some(120000));
        assert_eq!(first.market_value, dec!(200000000.00));
        assert_eq!(first.net_value_ratio, dec!(0.04));
    }

    #[test]
    fn summary_rows_are_skipped() {
        let report = parse(REPORT, &ParseHints::default()).unwrap();
        assert!(report
            .industry_allocations
            .iter()
            .all(|i| i.industry_name != "合计"));
        assert_eq!(report.industry_allocations.len(), 2);
        assert_eq!(report.industry_allocations[0].net_value_ratio, dec!(0.25));
    }

    #[test]
    fn asset_allocation_table_extracted() {
        let report = parse(REPORT, &ParseHints::default()).unwrap();
        assert_eq!(report.asset_allocations.len(), 3);
        assert_eq!(report.asset_allocations[0].asset_type, "股票投资");
        assert_eq!(report.asset_allocations[0].net_value_ratio, dec!(0.85));
    }

    #[test]
    fn confidence_is_additive_and_capped() {
        let report = parse(REPORT, &ParseHints::default()).unwrap();
        assert_eq!(report.parser_kind, ParserKind::Html);
        assert!(report.confidence > dec!(0.70));
        assert!(report.confidence <= dec!(0.95));
    }

    #[test]
    fn table_without_required_aliases_is_rejected() {
        let html = r#"<html><head><title>某基金2024年年度报告</title></head><body>
<p>本报告期自2024年1月1日起至2024年12月31日止。</p>
<table><tr><td>基金代码</td><td>000002</td></tr><tr><td>基金名称</td><td>某某证券投资基金</td></tr></table>
<table><tr><th>名称</th><th>数值</th></tr><tr><td>东西</td><td>123</td></tr></table>
</body></html>"#;
        let report = parse(html, &ParseHints::default()).unwrap();
        assert!(report.top_holdings.is_empty());
        assert!(report.industry_allocations.is_empty());
    }

    #[test]
    fn missing_identity_is_an_error() {
        let html = "<html><body><table><tr><td>无关内容</td></tr></table></body></html>";
        assert!(parse(html, &ParseHints::default()).is_err());
    }
}
