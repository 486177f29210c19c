use log::debug;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::taxonomy::Taxonomy;
use super::xbrl::{parse_date, Fact, XbrlInstance};
use crate::error::ParseError;
use crate::model::{AssetAllocation, Holding, IndustryAllocation, ParseHints, ParsedFundReport, ParserKind};
use crate::portal::params::ReportType;

/// Declarative concept map for one taxonomy version. Loaded from JSON so
/// a new portal taxonomy is a config drop, not a code change.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    /// Substrings that match this version against a report's schemaRef.
    #[serde(default)]
    pub schema_ref_patterns: Vec<String>,
    /// Business field -> candidate concept ids, first match wins.
    pub scalars: HashMap<String, Vec<String>>,
    pub tables: TablesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablesConfig {
    pub top_holdings: ContextGroup,
    pub industry_allocations: DimensionGroup,
    pub asset_allocations: ScalarGroup,
}

/// Rows are facts sharing a contextRef.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextGroup {
    #[serde(default = "group_by_context")]
    pub group_by: String,
    pub fields: HashMap<String, Vec<String>>,
}

/// Rows are facts sharing an explicit member on the given axis.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionGroup {
    #[serde(default = "group_by_dimension")]
    pub group_by: String,
    pub axis: String,
    pub fields: HashMap<String, Vec<String>>,
}

/// A fixed list of labeled scalar pairs (one per asset class).
#[derive(Debug, Clone, Deserialize)]
pub struct ScalarGroup {
    #[serde(default = "scalar_group_kind")]
    pub kind: String,
    pub entries: Vec<AllocationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationEntry {
    pub label: String,
    #[serde(default)]
    pub subtype: Option<String>,
    pub market_value: Vec<String>,
    pub net_value_ratio: Vec<String>,
}

fn group_by_context() -> String {
    "contextRef".to_string()
}
fn group_by_dimension() -> String {
    "dimension".to_string()
}
fn scalar_group_kind() -> String {
    "scalar_group".to_string()
}

/// All version configs found in the mapping directory, keyed by filename
/// stem.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    configs: HashMap<String, MappingConfig>,
    default_version: String,
}

impl MappingRegistry {
    pub fn load_dir(dir: &Path, default_version: &str) -> Result<Self, ParseError> {
        let mut configs = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ParseError::Config(format!("mapping dir {:?}: {}", dir, e)))?;

        for entry in entries {
            let entry = entry.map_err(|e| ParseError::Config(e.to_string()))?;
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ParseError::Config(format!("{:?}: {}", path, e)))?;
            let config: MappingConfig = serde_json::from_str(&raw)
                .map_err(|e| ParseError::Config(format!("{:?}: {}", path, e)))?;
            configs.insert(stem, config);
        }

        if !configs.contains_key(default_version) {
            return Err(ParseError::Config(format!(
                "default mapping version {:?} not present in {:?}",
                default_version, dir
            )));
        }

        Ok(MappingRegistry {
            configs,
            default_version: default_version.to_string(),
        })
    }

    /// Pick a version by schemaRef pattern match; the configured default
    /// otherwise.
    pub fn select(&self, schema_ref: Option<&str>) -> (&str, &MappingConfig) {
        if let Some(href) = schema_ref {
            let href = href.to_lowercase();
            let mut versions: Vec<&String> = self.configs.keys().collect();
            versions.sort();
            for version in versions {
                if *version == self.default_version {
                    continue;
                }
                let config = &self.configs[version];
                if config
                    .schema_ref_patterns
                    .iter()
                    .any(|p| href.contains(&p.to_lowercase()))
                {
                    debug!("schemaRef {:?} selected taxonomy version {}", href, version);
                    return (version.as_str(), config);
                }
            }
        }
        (
            self.default_version.as_str(),
            &self.configs[&self.default_version],
        )
    }

    pub fn versions(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }
}

/// Strip separators a reporting tool may leave in a numeric fact and
/// parse it as an exact decimal.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '，' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned == "--" {
        return None;
    }
    cleaned.parse::<Decimal>().ok()
}

/// The XBRL scaling contract: a negative decimals attribute scales the
/// lexical value by 10^(-decimals); non-negative leaves it untouched.
pub fn apply_decimals(value: Decimal, decimals: Option<i32>) -> Decimal {
    match decimals {
        Some(d) if d < 0 => value * pow10((-d) as u32),
        _ => value,
    }
}

fn pow10(exp: u32) -> Decimal {
    let mut result = Decimal::ONE;
    let ten = Decimal::from(10);
    for _ in 0..exp.min(28) {
        result *= ten;
    }
    result
}

/// Ratios are pure fractions in 0..=1; percent-styled values are brought
/// into range.
fn normalize_ratio(value: Decimal) -> Decimal {
    if value > Decimal::ONE {
        value / Decimal::from(100)
    } else {
        value
    }
}

struct FieldSet {
    ids: HashSet<String>,
}

impl FieldSet {
    fn new(ids: &[String]) -> Self {
        FieldSet {
            ids: ids.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    fn matches(&self, fact: &Fact) -> bool {
        self.ids.contains(&fact.concept.to_lowercase())
    }
}

fn find_scalar<'a>(
    instance: &'a XbrlInstance,
    config: &MappingConfig,
    field: &str,
) -> Option<&'a Fact> {
    let ids = config.scalars.get(field)?;
    let set = FieldSet::new(ids);
    instance.facts.iter().find(|f| set.matches(f))
}

/// Apply a version's concept map to an extracted instance.
pub fn map_instance(
    instance: &XbrlInstance,
    config: &MappingConfig,
    taxonomy: Option<&Taxonomy>,
    hints: &ParseHints,
) -> Result<ParsedFundReport, ParseError> {
    let mut warnings: Vec<String> = Vec::new();
    let mut confidence = Decimal::ONE;

    let scalar = |field: &str| find_scalar(instance, config, field);
    let scalar_text =
        |field: &str| find_scalar(instance, config, field).map(|f| f.value_raw.trim().to_string());
    let scalar_decimal = |field: &str| -> Option<Decimal> {
        let fact = find_scalar(instance, config, field)?;
        parse_decimal(&fact.value_raw).map(|v| apply_decimals(v, fact.decimals))
    };

    // Identity. Unmapped scalars stay unset; the fund code may fall back
    // to the portal listing, which is authoritative for the artifact.
    let fund_code = match scalar_text("fund_code") {
        Some(code) if !code.is_empty() => code,
        _ => match &hints.fund_code {
            Some(code) => {
                warnings.push("fund_code taken from the portal listing".to_string());
                code.clone()
            }
            None => return Err(ParseError::Extraction("fund code not found".to_string())),
        },
    };
    let fund_name = scalar_text("fund_name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ParseError::Extraction("fund name not found".to_string()))?;
    let fund_manager = scalar_text("fund_manager").filter(|m| !m.is_empty());

    // Reporting period. The document concepts win; failing those, the
    // period is read off the instance's own contexts.
    let mut report_period_end = scalar("report_period_end").and_then(|f| parse_date(&f.value_raw));
    let mut report_period_start =
        scalar("report_period_start").and_then(|f| parse_date(&f.value_raw));
    if report_period_end.is_none() {
        report_period_end = instance
            .contexts
            .values()
            .filter_map(|c| c.period.end_date())
            .max();
        if report_period_end.is_some() {
            warnings.push("report period end derived from instance contexts".to_string());
        }
    }
    let report_period_end = report_period_end
        .ok_or_else(|| ParseError::Extraction("report period end not found".to_string()))?;
    if report_period_start.is_none() {
        report_period_start = instance
            .contexts
            .values()
            .filter(|c| c.period.end_date() == Some(report_period_end))
            .filter_map(|c| c.period.start_date())
            .min();
    }

    // Report type comes from a document fact; the listing description is
    // the only permitted fallback. Never inferred from dates.
    let report_type = scalar_text("report_type")
        .and_then(|v| ReportType::from_desc(&v))
        .or_else(|| {
            hints
                .report_desc
                .as_deref()
                .and_then(ReportType::from_desc)
        })
        .ok_or_else(|| ParseError::Extraction("report type not determinable".to_string()))?;

    let top_holdings = map_holdings(instance, &config.tables.top_holdings, &mut warnings);
    let industry_allocations = map_industries(
        instance,
        &config.tables.industry_allocations,
        taxonomy,
        &mut warnings,
    );
    let asset_allocations = map_allocations(instance, &config.tables.asset_allocations, &mut warnings);

    // Allocation ratios must roughly cover the portfolio.
    if !asset_allocations.is_empty() {
        let sum: Decimal = asset_allocations.iter().map(|a| a.net_value_ratio).sum();
        let deviation = (sum - Decimal::ONE).abs();
        if deviation > Decimal::new(2, 2) {
            warnings.push(format!(
                "asset allocation ratios sum to {} (deviation {})",
                sum, deviation
            ));
            confidence -= Decimal::new(1, 1);
        }
    }

    Ok(ParsedFundReport {
        fund_code,
        fund_name,
        fund_manager,
        report_type,
        report_period_start,
        report_period_end,
        net_asset_value: scalar_decimal("net_asset_value"),
        total_net_assets: scalar_decimal("total_net_assets"),
        period_profit: scalar_decimal("period_profit"),
        asset_allocations,
        top_holdings,
        industry_allocations,
        parser_kind: ParserKind::Xbrl,
        taxonomy_version: None,
        confidence,
        warnings,
    })
}

fn map_holdings(
    instance: &XbrlInstance,
    config: &ContextGroup,
    warnings: &mut Vec<String>,
) -> Vec<Holding> {
    let sets: HashMap<&str, FieldSet> = config
        .fields
        .iter()
        .map(|(k, v)| (k.as_str(), FieldSet::new(v)))
        .collect();

    // Group by contextRef, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, HashMap<&str, &Fact>> = HashMap::new();
    for fact in &instance.facts {
        for (field, set) in &sets {
            if set.matches(fact) {
                let group = groups.entry(fact.context_ref.clone()).or_insert_with(|| {
                    order.push(fact.context_ref.clone());
                    HashMap::new()
                });
                group.entry(*field).or_insert(fact);
            }
        }
    }

    let mut holdings: Vec<Holding> = Vec::new();
    for context_ref in &order {
        let group = &groups[context_ref];
        let decimal_of = |field: &str| -> Option<Decimal> {
            let fact = group.get(field)?;
            parse_decimal(&fact.value_raw).map(|v| apply_decimals(v, fact.decimals))
        };

        let security_code = group
            .get("security_code")
            .map(|f| f.value_raw.trim().to_string());
        let security_name = group
            .get("security_name")
            .map(|f| f.value_raw.trim().to_string());
        let market_value = decimal_of("market_value");
        let net_value_ratio = decimal_of("net_value_ratio").map(normalize_ratio);

        match (security_code, security_name, market_value, net_value_ratio) {
            (Some(code), Some(name), Some(market_value), Some(ratio))
                if !code.is_empty() && !name.is_empty() =>
            {
                holdings.push(Holding {
                    rank: decimal_of("rank")
                        .and_then(|r| r.to_u32())
                        .unwrap_or(0),
                    security_code: code,
                    security_name: name,
                    shares: decimal_of("shares").and_then(|s| s.trunc().to_i64()),
                    market_value,
                    net_value_ratio: ratio,
                });
            }
            _ => {
                warnings.push(format!("incomplete holding row in context {}", context_ref));
            }
        }
    }

    // Reported ranks order the table; rows without one fall in behind in
    // document order.
    holdings.sort_by_key(|h| if h.rank == 0 { u32::MAX } else { h.rank });
    for (i, holding) in holdings.iter_mut().enumerate() {
        if holding.rank == 0 {
            holding.rank = (i + 1) as u32;
        }
    }
    holdings
}

fn map_industries(
    instance: &XbrlInstance,
    config: &DimensionGroup,
    taxonomy: Option<&Taxonomy>,
    warnings: &mut Vec<String>,
) -> Vec<IndustryAllocation> {
    let sets: HashMap<&str, FieldSet> = config
        .fields
        .iter()
        .map(|(k, v)| (k.as_str(), FieldSet::new(v)))
        .collect();
    let axis = config.axis.to_lowercase();

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, HashMap<&str, &Fact>> = HashMap::new();
    for fact in &instance.facts {
        let member = match instance.context_of(fact).and_then(|c| {
            c.dimensions
                .iter()
                .find(|(dim, _)| dim.to_lowercase() == axis)
                .map(|(_, member)| member.clone())
        }) {
            Some(member) => member,
            None => continue,
        };
        for (field, set) in &sets {
            if set.matches(fact) {
                let group = groups.entry(member.clone()).or_insert_with(|| {
                    order.push(member.clone());
                    HashMap::new()
                });
                group.entry(*field).or_insert(fact);
            }
        }
    }

    let mut allocations = Vec::new();
    for member in &order {
        let group = &groups[member];
        let decimal_of = |field: &str| -> Option<Decimal> {
            let fact = group.get(field)?;
            parse_decimal(&fact.value_raw).map(|v| apply_decimals(v, fact.decimals))
        };

        let market_value = decimal_of("market_value");
        let ratio = decimal_of("net_value_ratio").map(normalize_ratio);
        match (market_value, ratio) {
            (Some(market_value), Some(net_value_ratio)) => {
                allocations.push(IndustryAllocation {
                    industry_name: member_label(member, taxonomy),
                    market_value,
                    net_value_ratio,
                });
            }
            _ => warnings.push(format!("incomplete industry row for member {}", member)),
        }
    }
    allocations
}

/// Row label for a dimension member: its taxonomy label when available,
/// the member's local name otherwise.
fn member_label(member: &str, taxonomy: Option<&Taxonomy>) -> String {
    if let Some(label) = taxonomy.and_then(|t| t.label_of(member)) {
        return label.to_string();
    }
    member
        .rsplit(':')
        .next()
        .unwrap_or(member)
        .trim_end_matches("Member")
        .to_string()
}

fn map_allocations(
    instance: &XbrlInstance,
    config: &ScalarGroup,
    warnings: &mut Vec<String>,
) -> Vec<AssetAllocation> {
    let mut allocations = Vec::new();
    for entry in &config.entries {
        let value_set = FieldSet::new(&entry.market_value);
        let ratio_set = FieldSet::new(&entry.net_value_ratio);

        let market_value = instance
            .facts
            .iter()
            .find(|f| value_set.matches(f))
            .and_then(|f| parse_decimal(&f.value_raw).map(|v| apply_decimals(v, f.decimals)));
        let ratio = instance
            .facts
            .iter()
            .find(|f| ratio_set.matches(f))
            .and_then(|f| parse_decimal(&f.value_raw).map(|v| apply_decimals(v, f.decimals)))
            .map(normalize_ratio);

        match (market_value, ratio) {
            (Some(market_value), Some(net_value_ratio)) => allocations.push(AssetAllocation {
                asset_type: entry.label.clone(),
                asset_subtype: entry.subtype.clone(),
                market_value,
                net_value_ratio,
            }),
            (None, None) => {}
            _ => warnings.push(format!(
                "asset class {} present without both value and ratio",
                entry.label
            )),
        }
    }
    allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::xbrl::parse_instance;
    use rust_decimal_macros::dec;

    fn test_config() -> MappingConfig {
        serde_json::from_str(
            r#"{
            "schema_ref_patterns": ["csrc-mf"],
            "scalars": {
                "fund_code": ["cn:FundCode"],
                "fund_name": ["cn:FundName"],
                "fund_manager": ["cn:FundManagerName"],
                "report_type": ["cn:ReportTypeCode"],
                "report_period_end": ["cn:ReportPeriodEndDate"],
                "net_asset_value": ["cn:NetAssetValuePerUnit"],
                "total_net_assets": ["cn:TotalNetAssets"],
                "period_profit": ["cn:PeriodProfit"]
            },
            "tables": {
                "top_holdings": {
                    "group_by": "contextRef",
                    "fields": {
                        "rank": ["cn:HoldingRank"],
                        "security_code": ["cn:SecurityCode"],
                        "security_name": ["cn:SecurityName"],
                        "shares": ["cn:SharesHeld"],
                        "market_value": ["cn:HoldingMarketValue"],
                        "net_value_ratio": ["cn:HoldingRatio"]
                    }
                },
                "industry_allocations": {
                    "group_by": "dimension",
                    "axis": "cn:IndustryAxis",
                    "fields": {
                        "market_value": ["cn:IndustryMarketValue"],
                        "net_value_ratio": ["cn:IndustryRatio"]
                    }
                },
                "asset_allocations": {
                    "kind": "scalar_group",
                    "entries": [
                        {"label": "股票", "market_value": ["cn:EquityInvestment"], "net_value_ratio": ["cn:EquityRatio"]},
                        {"label": "债券", "market_value": ["cn:BondInvestment"], "net_value_ratio": ["cn:BondRatio"]},
                        {"label": "银行存款", "market_value": ["cn:CashDeposit"], "net_value_ratio": ["cn:CashRatio"]}
                    ]
                }
            }
        }"#,
        )
        .unwrap()
    }

    const INSTANCE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance"
            xmlns:xbrldi="http://xbrl.org/2006/xbrldi"
            xmlns:cn="http://csrc.example/mf">
  <xbrli:context id="AsOf">
    <xbrli:entity><xbrli:identifier scheme="s">000001</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
  </xbrli:context>
  <xbrli:context id="FY2024">
    <xbrli:entity><xbrli:identifier scheme="s">000001</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:startDate>2024-01-01</xbrli:startDate><xbrli:endDate>2024-12-31</xbrli:endDate></xbrli:period>
  </xbrli:context>
  <xbrli:context id="H1">
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
  </xbrli:context>
  <xbrli:context id="H2">
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
  </xbrli:context>
  <xbrli:context id="IndManufacturing">
    <xbrli:period><xbrli:instant>2024-12-31</xbrli:instant></xbrli:period>
    <xbrli:scenario><xbrldi:explicitMember dimension="cn:IndustryAxis">cn:ManufacturingMember</xbrldi:explicitMember></xbrli:scenario>
  </xbrli:context>
  <xbrli:unit id="CNY"><xbrli:measure>iso4217:CNY</xbrli:measure></xbrli:unit>

  <cn:FundCode contextRef="AsOf">000001</cn:FundCode>
  <cn:FundName contextRef="AsOf">华夏成长证券投资基金</cn:FundName>
  <cn:FundManagerName contextRef="AsOf">华夏基金管理有限公司</cn:FundManagerName>
  <cn:ReportTypeCode contextRef="FY2024">年度报告</cn:ReportTypeCode>
  <cn:TotalNetAssets contextRef="AsOf" unitRef="CNY" decimals="2">5000000000.00</cn:TotalNetAssets>
  <cn:NetAssetValuePerUnit contextRef="AsOf" unitRef="CNY" decimals="4">1.5234</cn:NetAssetValuePerUnit>

  <cn:HoldingRank contextRef="H2">2</cn:HoldingRank>
  <cn:SecurityCode contextRef="H2">600519</cn:SecurityCode>
  <cn:SecurityName contextRef="H2">贵州茅台</cn:SecurityName>
  <cn:SharesHeld contextRef="H2" unitRef="CNY">120000</cn:SharesHeld>
  <cn:HoldingMarketValue contextRef="H2" unitRef="CNY" decimals="2">200000000.00</cn:HoldingMarketValue>
  <cn:HoldingRatio contextRef="H2" decimals="4">0.0400</cn:HoldingRatio>

  <cn:HoldingRank contextRef="H1">1</cn:HoldingRank>
  <cn:SecurityCode contextRef="H1">000858</cn:SecurityCode>
  <cn:SecurityName contextRef="H1">五粮液</cn:SecurityName>
  <cn:HoldingMarketValue contextRef="H1" unitRef="CNY" decimals="2">300000000.00</cn:HoldingMarketValue>
  <cn:HoldingRatio contextRef="H1" decimals="4">0.0600</cn:HoldingRatio>

  <cn:IndustryMarketValue contextRef="IndManufacturing" unitRef="CNY" decimals="2">1250000000.00</cn:IndustryMarketValue>
  <cn:IndustryRatio contextRef="IndManufacturing" decimals="4">0.2500</cn:IndustryRatio>

  <cn:EquityInvestment contextRef="AsOf" unitRef="CNY" decimals="2">4250000000.00</cn:EquityInvestment>
  <cn:EquityRatio contextRef="AsOf" decimals="4">0.8500</cn:EquityRatio>
  <cn:BondInvestment contextRef="AsOf" unitRef="CNY" decimals="2">500000000.00</cn:BondInvestment>
  <cn:BondRatio contextRef="AsOf" decimals="4">0.1000</cn:BondRatio>
  <cn:CashDeposit contextRef="AsOf" unitRef="CNY" decimals="2">250000000.00</cn:CashDeposit>
  <cn:CashRatio contextRef="AsOf" decimals="4">0.0500</cn:CashRatio>
</xbrli:xbrl>"#;

    #[test]
    fn maps_scalars_and_period() {
        let instance = parse_instance(INSTANCE).unwrap();
        let report =
            map_instance(&instance, &test_config(), None, &ParseHints::default()).unwrap();

        assert_eq!(report.fund_code, "000001");
        assert_eq!(report.fund_name, "华夏成长证券投资基金");
        assert_eq!(
            report.fund_manager.as_deref(),
            Some("华夏基金管理有限公司")
        );
        assert_eq!(report.report_type, ReportType::Annual);
        assert_eq!(
            report.report_period_end,
            chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
        );
        assert_eq!(
            report.report_period_start,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
        );
        assert_eq!(report.total_net_assets, Some(dec!(5000000000.00)));
        assert_eq!(report.net_asset_value, Some(dec!(1.5234)));
        // No period_profit concept in the instance: stays unset.
        assert_eq!(report.period_profit, None);
    }

    #[test]
    fn holdings_group_by_context_and_sort_by_rank() {
        let instance = parse_instance(INSTANCE).unwrap();
        let report =
            map_instance(&instance, &test_config(), None, &ParseHints::default()).unwrap();

        assert_eq!(report.top_holdings.len(), 2);
        assert_eq!(report.top_holdings[0].rank, 1);
        assert_eq!(report.top_holdings[0].security_code, "000858");
        assert_eq!(report.top_holdings[1].rank, 2);
        assert_eq!(report.top_holdings[1].security_name, "贵州茅台");
        assert_eq!(report.top_holdings[1].shares, Some(120000));
        assert_eq!(report.top_holdings[1].market_value, dec!(200000000.00));
    }

    #[test]
    fn industries_group_by_dimension_member() {
        let instance = parse_instance(INSTANCE).unwrap();
        let report =
            map_instance(&instance, &test_config(), None, &ParseHints::default()).unwrap();

        assert_eq!(report.industry_allocations.len(), 1);
        let industry = &report.industry_allocations[0];
        // No taxonomy loaded: the member's local name is the label.
        assert_eq!(industry.industry_name, "Manufacturing");
        assert_eq!(industry.net_value_ratio, dec!(0.2500));
    }

    #[test]
    fn allocations_within_tolerance_keep_full_confidence() {
        let instance = parse_instance(INSTANCE).unwrap();
        let report =
            map_instance(&instance, &test_config(), None, &ParseHints::default()).unwrap();

        assert_eq!(report.asset_allocations.len(), 3);
        let sum: Decimal = report
            .asset_allocations
            .iter()
            .map(|a| a.net_value_ratio)
            .sum();
        assert_eq!(sum, dec!(1.0000));
        assert_eq!(report.confidence, Decimal::ONE);
    }

    #[test]
    fn ratio_sum_violation_warns_and_cuts_confidence() {
        let bad = INSTANCE.replace(
            r#"<cn:EquityRatio contextRef="AsOf" decimals="4">0.8500</cn:EquityRatio>"#,
            r#"<cn:EquityRatio contextRef="AsOf" decimals="4">0.5000</cn:EquityRatio>"#,
        );
        let instance = parse_instance(&bad).unwrap();
        let report =
            map_instance(&instance, &test_config(), None, &ParseHints::default()).unwrap();

        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("allocation ratios sum")));
        assert!(report.confidence <= dec!(0.9));
    }

    #[test]
    fn report_type_falls_back_to_listing_desc() {
        let no_type = INSTANCE.replace(
            r#"<cn:ReportTypeCode contextRef="FY2024">年度报告</cn:ReportTypeCode>"#,
            "",
        );
        let instance = parse_instance(&no_type).unwrap();

        let hints = ParseHints {
            report_desc: Some("华夏成长2024年第二季度报告".to_string()),
            fund_code: None,
        };
        let report = map_instance(&instance, &test_config(), None, &hints).unwrap();
        assert_eq!(report.report_type, ReportType::Q2);

        // Without any source the mapping fails rather than guessing.
        assert!(map_instance(&instance, &test_config(), None, &ParseHints::default()).is_err());
    }

    #[test]
    fn decimals_scaling_contract() {
        assert_eq!(apply_decimals(dec!(12345.67), Some(-2)), dec!(1234567.00));
        assert_eq!(apply_decimals(dec!(12345.67), Some(2)), dec!(12345.67));
        assert_eq!(apply_decimals(dec!(12345.67), None), dec!(12345.67));
    }

    #[test]
    fn decimal_normalization() {
        assert_eq!(parse_decimal("1,234,567.89"), Some(dec!(1234567.89)));
        assert_eq!(parse_decimal("  5000 "), Some(dec!(5000)));
        assert_eq!(parse_decimal("--"), None);
        assert_eq!(parse_decimal(""), None);
        assert_eq!(normalize_ratio(dec!(65.23)), dec!(0.6523));
        assert_eq!(normalize_ratio(dec!(0.6523)), dec!(0.6523));
    }

    #[test]
    fn registry_selects_by_schema_ref_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let config_json = serde_json::to_string(&serde_json::json!({
            "schema_ref_patterns": ["csrc-mf"],
            "scalars": {},
            "tables": {
                "top_holdings": {"fields": {}},
                "industry_allocations": {"axis": "cn:IndustryAxis", "fields": {}},
                "asset_allocations": {"entries": []}
            }
        }))
        .unwrap();
        let default_json = config_json.replace("csrc-mf", "never-matches");
        std::fs::write(dir.path().join("csrc_v2.1.json"), &config_json).unwrap();
        std::fs::write(dir.path().join("default.json"), &default_json).unwrap();

        let registry = MappingRegistry::load_dir(dir.path(), "default").unwrap();
        let (version, _) =
            registry.select(Some("http://csrc.example/csrc-mf-general-2021.xsd"));
        assert_eq!(version, "csrc_v2.1");
        let (version, _) = registry.select(Some("http://elsewhere/other.xsd"));
        assert_eq!(version, "default");
        let (version, _) = registry.select(None);
        assert_eq!(version, "default");
    }
}
