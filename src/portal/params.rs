use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ValidationError;

/// Periodic report categories. Each member is bound to the portal's
/// reportTypeCode; these codes are the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    Annual,
    SemiAnnual,
    Q1,
    Q2,
    Q3,
    Q4,
    FundProfile,
}

impl ReportType {
    pub fn portal_code(&self) -> &'static str {
        match self {
            ReportType::Annual => "FB010010",
            ReportType::SemiAnnual => "FB020010",
            ReportType::Q1 => "FB030010",
            ReportType::Q2 => "FB030020",
            ReportType::Q3 => "FB030030",
            ReportType::Q4 => "FB030040",
            ReportType::FundProfile => "FB040010",
        }
    }

    pub fn from_portal_code(code: &str) -> Option<Self> {
        match code {
            "FB010010" => Some(ReportType::Annual),
            "FB020010" => Some(ReportType::SemiAnnual),
            "FB030010" => Some(ReportType::Q1),
            "FB030020" => Some(ReportType::Q2),
            "FB030030" => Some(ReportType::Q3),
            "FB030040" => Some(ReportType::Q4),
            "FB040010" => Some(ReportType::FundProfile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Annual => "ANNUAL",
            ReportType::SemiAnnual => "SEMI_ANNUAL",
            ReportType::Q1 => "Q1",
            ReportType::Q2 => "Q2",
            ReportType::Q3 => "Q3",
            ReportType::Q4 => "Q4",
            ReportType::FundProfile => "FUND_PROFILE",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "ANNUAL" => Some(ReportType::Annual),
            "SEMI_ANNUAL" => Some(ReportType::SemiAnnual),
            "Q1" => Some(ReportType::Q1),
            "Q2" => Some(ReportType::Q2),
            "Q3" => Some(ReportType::Q3),
            "Q4" => Some(ReportType::Q4),
            "FUND_PROFILE" => Some(ReportType::FundProfile),
            _ => None,
        }
    }

    /// Recognize a report type inside free text: a portal code, an enum
    /// name, or the Chinese wording used in report titles. Dates are
    /// deliberately not consulted.
    pub fn from_desc(text: &str) -> Option<Self> {
        if let Some(t) = Self::from_portal_code(text.trim()) {
            return Some(t);
        }
        if let Some(t) = Self::from_str_name(text.trim()) {
            return Some(t);
        }
        if text.contains("产品资料概要") {
            return Some(ReportType::FundProfile);
        }
        if text.contains("半年") || text.contains("中期") {
            return Some(ReportType::SemiAnnual);
        }
        if text.contains("年度报告") || text.contains("年报") {
            return Some(ReportType::Annual);
        }
        if text.contains("第一季度") || text.contains("一季") || text.contains("Q1") {
            return Some(ReportType::Q1);
        }
        if text.contains("第二季度") || text.contains("二季") || text.contains("Q2") {
            return Some(ReportType::Q2);
        }
        if text.contains("第三季度") || text.contains("三季") || text.contains("Q3") {
            return Some(ReportType::Q3);
        }
        if text.contains("第四季度") || text.contains("四季") || text.contains("Q4") {
            return Some(ReportType::Q4);
        }
        None
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fund categories with their portal filter codes. Also frozen contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundType {
    Stock,
    Mixed,
    Bond,
    Money,
    Qdii,
    Fof,
    Infrastructure,
    Commodity,
}

impl FundType {
    pub fn portal_code(&self) -> &'static str {
        match self {
            FundType::Stock => "6020-6010",
            FundType::Mixed => "6020-6020",
            FundType::Bond => "6020-6030",
            FundType::Money => "6020-6040",
            FundType::Qdii => "6020-6050",
            FundType::Fof => "6020-6060",
            FundType::Infrastructure => "6020-6084",
            FundType::Commodity => "6020-6104",
        }
    }
}

/// User-facing search criteria, validated before any request is composed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Required except for FUND_PROFILE searches.
    pub year: Option<i32>,
    pub report_type: ReportType,
    pub fund_type: Option<FundType>,
    pub fund_company_short_name: Option<String>,
    /// Six digits when present.
    pub fund_code: Option<String>,
    pub fund_short_name: Option<String>,
    pub start_upload_date: Option<NaiveDate>,
    pub end_upload_date: Option<NaiveDate>,
    pub page: u32,
    pub page_size: u32,
}

impl SearchCriteria {
    pub fn new(year: i32, report_type: ReportType) -> Self {
        SearchCriteria {
            year: Some(year),
            report_type,
            fund_type: None,
            fund_company_short_name: None,
            fund_code: None,
            fund_short_name: None,
            start_upload_date: None,
            end_upload_date: None,
            page: 1,
            page_size: 20,
        }
    }

    pub fn fund_profile(fund_code: impl Into<String>) -> Self {
        SearchCriteria {
            year: None,
            report_type: ReportType::FundProfile,
            fund_type: None,
            fund_company_short_name: None,
            fund_code: Some(fund_code.into()),
            fund_short_name: None,
            start_upload_date: None,
            end_upload_date: None,
            page: 1,
            page_size: 20,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.year.is_none() && self.report_type != ReportType::FundProfile {
            return Err(ValidationError::MissingYear);
        }
        if let Some(code) = &self.fund_code {
            if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(ValidationError::BadFundCode(code.clone()));
            }
        }
        if let (Some(start), Some(end)) = (self.start_upload_date, self.end_upload_date) {
            if start > end {
                return Err(ValidationError::BadDateRange { start, end });
            }
        }
        if self.page < 1 {
            return Err(ValidationError::BadPage);
        }
        if self.page_size < 1 || self.page_size > 100 {
            return Err(ValidationError::BadPageSize(self.page_size));
        }
        Ok(())
    }

    /// The exact DataTables field list the portal expects, in order.
    /// Absent optionals are sent as empty strings, never omitted; the
    /// reportYear is empty iff the search is for fund profiles.
    pub fn ao_data(&self) -> Vec<(String, Value)> {
        let display_start = (self.page - 1) * self.page_size;
        let report_year = match (self.report_type, self.year) {
            (ReportType::FundProfile, _) => String::new(),
            (_, Some(year)) => year.to_string(),
            (_, None) => String::new(),
        };

        vec![
            ("sEcho".into(), json!(self.page)),
            ("iColumns".into(), json!(6)),
            ("sColumns".into(), json!(",,,,,")),
            ("iDisplayStart".into(), json!(display_start)),
            ("iDisplayLength".into(), json!(self.page_size)),
            ("mDataProp_0".into(), json!("fundCode")),
            ("mDataProp_1".into(), json!("fundId")),
            ("mDataProp_2".into(), json!("organName")),
            ("mDataProp_3".into(), json!("reportSendDate")),
            ("mDataProp_4".into(), json!("reportDesp")),
            ("mDataProp_5".into(), json!("uploadInfoId")),
            (
                "fundType".into(),
                json!(self.fund_type.map(|t| t.portal_code()).unwrap_or("")),
            ),
            (
                "reportTypeCode".into(),
                json!(self.report_type.portal_code()),
            ),
            ("reportYear".into(), json!(report_year)),
            (
                "fundCompanyShortName".into(),
                json!(self.fund_company_short_name.as_deref().unwrap_or("")),
            ),
            (
                "fundCode".into(),
                json!(self.fund_code.as_deref().unwrap_or("")),
            ),
            (
                "fundShortName".into(),
                json!(self.fund_short_name.as_deref().unwrap_or("")),
            ),
            (
                "startUploadDate".into(),
                json!(self
                    .start_upload_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default()),
            ),
            (
                "endUploadDate".into(),
                json!(self
                    .end_upload_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default()),
            ),
        ]
    }

    /// aoData as the JSON array of `{name, value}` objects carried in the
    /// list request's query string.
    pub fn ao_data_json(&self) -> String {
        let fields: Vec<Value> = self
            .ao_data()
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        Value::Array(fields).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(ao: &'a [(String, Value)], name: &str) -> &'a Value {
        &ao.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn portal_codes_are_frozen() {
        assert_eq!(ReportType::Annual.portal_code(), "FB010010");
        assert_eq!(ReportType::SemiAnnual.portal_code(), "FB020010");
        assert_eq!(ReportType::Q1.portal_code(), "FB030010");
        assert_eq!(ReportType::Q2.portal_code(), "FB030020");
        assert_eq!(ReportType::Q3.portal_code(), "FB030030");
        assert_eq!(ReportType::Q4.portal_code(), "FB030040");
        assert_eq!(ReportType::FundProfile.portal_code(), "FB040010");
        assert_eq!(FundType::Stock.portal_code(), "6020-6010");
        assert_eq!(FundType::Qdii.portal_code(), "6020-6050");
        assert_eq!(FundType::Fof.portal_code(), "6020-6060");
    }

    #[test]
    fn ao_data_field_set_is_exact() {
        let criteria = SearchCriteria::new(2024, ReportType::Annual);
        let ao = criteria.ao_data();
        let names: Vec<&str> = ao.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "sEcho",
                "iColumns",
                "sColumns",
                "iDisplayStart",
                "iDisplayLength",
                "mDataProp_0",
                "mDataProp_1",
                "mDataProp_2",
                "mDataProp_3",
                "mDataProp_4",
                "mDataProp_5",
                "fundType",
                "reportTypeCode",
                "reportYear",
                "fundCompanyShortName",
                "fundCode",
                "fundShortName",
                "startUploadDate",
                "endUploadDate",
            ]
        );
        // Absent optionals serialize as empty strings, not nulls.
        assert_eq!(field(&ao, "fundType"), &json!(""));
        assert_eq!(field(&ao, "fundCompanyShortName"), &json!(""));
        assert_eq!(field(&ao, "startUploadDate"), &json!(""));
    }

    #[test]
    fn annual_search_carries_year_and_codes() {
        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.fund_type = Some(FundType::Qdii);
        criteria.fund_company_short_name = Some("工银瑞信".to_string());
        criteria.validate().unwrap();

        let ao = criteria.ao_data();
        assert_eq!(field(&ao, "reportTypeCode"), &json!("FB010010"));
        assert_eq!(field(&ao, "reportYear"), &json!("2024"));
        assert_eq!(field(&ao, "fundType"), &json!("6020-6050"));
        assert_eq!(field(&ao, "fundCompanyShortName"), &json!("工银瑞信"));
    }

    #[test]
    fn fund_profile_sends_empty_year() {
        let criteria = SearchCriteria::fund_profile("000001");
        criteria.validate().unwrap();
        let ao = criteria.ao_data();
        assert_eq!(field(&ao, "reportYear"), &json!(""));
        assert_eq!(field(&ao, "fundCode"), &json!("000001"));
    }

    #[test]
    fn paging_fields() {
        let mut criteria = SearchCriteria::new(2024, ReportType::Q1);
        criteria.page = 3;
        criteria.page_size = 20;
        let ao = criteria.ao_data();
        assert_eq!(field(&ao, "sEcho"), &json!(3));
        assert_eq!(field(&ao, "iDisplayStart"), &json!(40));
        assert_eq!(field(&ao, "iDisplayLength"), &json!(20));
    }

    #[test]
    fn validation_rejects_bad_input() {
        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.year = None;
        assert_eq!(criteria.validate(), Err(ValidationError::MissingYear));

        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.fund_code = Some("12345".to_string());
        assert!(matches!(
            criteria.validate(),
            Err(ValidationError::BadFundCode(_))
        ));

        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.page_size = 101;
        assert_eq!(criteria.validate(), Err(ValidationError::BadPageSize(101)));

        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.start_upload_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        criteria.end_upload_date = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert!(matches!(
            criteria.validate(),
            Err(ValidationError::BadDateRange { .. })
        ));
    }

    #[test]
    fn profile_search_without_year_is_valid() {
        let criteria = SearchCriteria::fund_profile("000001");
        assert!(criteria.validate().is_ok());
    }

    #[test]
    fn report_type_from_desc() {
        assert_eq!(
            ReportType::from_desc("易方达蓝筹2024年年度报告"),
            Some(ReportType::Annual)
        );
        assert_eq!(
            ReportType::from_desc("2024年第三季度报告"),
            Some(ReportType::Q3)
        );
        assert_eq!(ReportType::from_desc("FB020010"), Some(ReportType::SemiAnnual));
        assert_eq!(ReportType::from_desc("随便什么"), None);
    }
}
