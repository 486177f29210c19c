use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use url::{form_urlencoded, Url};

use super::params::SearchCriteria;
use super::rate_limiter::RateLimiter;
use crate::core::config::IngestConfig;
use crate::error::PortalError;
use crate::model::{ReportPage, ReportRef};

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Client for the disclosure portal's DataTables-style list endpoint and
/// its instance-view download URL. The legacy downloadFile.do endpoint is
/// not valid and is never composed here.
pub struct PortalClient {
    http: Client,
    search_url: String,
    instance_url: String,
    user_agent: String,
    rate_limiter: RateLimiter,
}

impl PortalClient {
    pub fn new(config: &IngestConfig) -> Result<Self, PortalError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(PortalClient {
            http,
            search_url: config.search_url.clone(),
            instance_url: config.instance_url.clone(),
            user_agent: config.user_agent.clone(),
            rate_limiter: RateLimiter::new(config.portal_min_interval),
        })
    }

    /// One page of reports matching the criteria (validated by the
    /// service before it reaches the wire). The server caps a page at 20
    /// rows regardless of the requested size.
    pub async fn list_reports(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<ReportPage, PortalError> {
        self.rate_limiter.acquire().await;

        let url = self.compose_list_url(criteria);
        debug!("portal list request: {}", url);

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PortalError::Http {
                status: status.as_u16(),
                snippet: snippet(&body),
            });
        }

        // The portal serves JSON under a text/html content type, so the
        // body is parsed unconditionally.
        let envelope: Value = serde_json::from_str(&body)
            .map_err(|e| PortalError::Malformed(format!("{}: {}", e, snippet(&body))))?;

        let total_records = envelope
            .get("iTotalRecords")
            .and_then(Value::as_u64)
            .ok_or_else(|| PortalError::Malformed("missing iTotalRecords".to_string()))?;
        let rows_raw = envelope
            .get("aaData")
            .and_then(Value::as_array)
            .ok_or_else(|| PortalError::Malformed("missing aaData".to_string()))?;

        let rows: Vec<ReportRef> = rows_raw.iter().filter_map(parse_row).collect();
        let has_next = total_records > (criteria.page as u64) * (criteria.page_size as u64);

        info!(
            "portal list: {} rows of {} total (page {}, has_next={})",
            rows.len(),
            total_records,
            criteria.page,
            has_next
        );

        Ok(ReportPage {
            rows,
            total_records,
            has_next,
        })
    }

    /// Walk result pages until the portal reports no more, or `max_pages`.
    pub async fn list_all_reports(
        &self,
        criteria: &SearchCriteria,
        max_pages: Option<u32>,
    ) -> Result<Vec<ReportRef>, PortalError> {
        let mut all = Vec::new();
        let mut page_criteria = criteria.clone();
        page_criteria.page = 1;

        loop {
            if let Some(cap) = max_pages {
                if page_criteria.page > cap {
                    break;
                }
            }
            let page = self.list_reports(&page_criteria).await?;
            let empty = page.rows.is_empty();
            all.extend(page.rows);
            if empty || !page.has_next {
                break;
            }
            page_criteria.page += 1;
        }

        Ok(all)
    }

    /// The authoritative artifact URL for an uploaded report instance.
    pub fn resolve_download_url(&self, upload_info_id: &str) -> Url {
        let mut url = Url::parse(&self.instance_url).expect("instance_url must be a valid URL");
        url.set_query(Some(&format!("instanceid={}", upload_info_id)));
        url
    }

    fn compose_list_url(&self, criteria: &SearchCriteria) -> String {
        // DataTables carries the whole field list JSON-encoded in a single
        // aoData query parameter plus an anti-cache timestamp; Chinese
        // field values end up UTF-8 percent-encoded by the form encoder.
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("aoData", &criteria.ao_data_json())
            .append_pair("_", &Utc::now().timestamp_millis().to_string())
            .finish();
        format!("{}?{}", self.search_url, query)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

fn clean_text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let stripped = TAG_RE.replace_all(&raw, "").trim().to_string();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    }
}

fn parse_send_date(value: Option<&Value>) -> Option<NaiveDate> {
    let text = clean_text(value?)?;
    let head: String = text.chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&head, "%Y/%m/%d"))
        .ok()
}

/// Map one aaData row into a ReportRef. Rows without an uploadInfoId are
/// unusable and dropped with a warning.
fn parse_row(row: &Value) -> Option<ReportRef> {
    let upload_info_id = match row.get("uploadInfoId").and_then(clean_text) {
        Some(id) => id,
        None => {
            warn!("portal row without uploadInfoId, skipping: {}", row);
            return None;
        }
    };
    let report_send_date = match parse_send_date(row.get("reportSendDate")) {
        Some(d) => d,
        None => {
            warn!(
                "portal row {} has unparseable reportSendDate, skipping",
                upload_info_id
            );
            return None;
        }
    };

    Some(ReportRef {
        upload_info_id,
        fund_code: row.get("fundCode").and_then(clean_text).unwrap_or_default(),
        fund_short_name: row
            .get("fundShortName")
            .and_then(clean_text)
            .unwrap_or_default(),
        organization_name: row.get("organName").and_then(clean_text).unwrap_or_default(),
        report_send_date,
        report_desc: row
            .get("reportDesp")
            .and_then(clean_text)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::params::ReportType;
    use serde_json::json;

    fn test_client() -> PortalClient {
        let config = IngestConfig::with_database_url("postgres://unused/unused");
        PortalClient::new(&config).unwrap()
    }

    #[test]
    fn download_url_uses_instance_view() {
        let client = test_client();
        let url = client.resolve_download_url("19052421");
        assert!(url.path().ends_with("instance_html_view.do"));
        assert_eq!(url.query(), Some("instanceid=19052421"));
    }

    #[test]
    fn list_url_carries_ao_data_and_timestamp() {
        let client = test_client();
        let mut criteria = SearchCriteria::new(2024, ReportType::Annual);
        criteria.fund_company_short_name = Some("工银瑞信".to_string());
        let url = client.compose_list_url(&criteria);
        assert!(url.starts_with(&client.search_url));
        assert!(url.contains("aoData="));
        assert!(url.contains("&_="));
        // Chinese company name must be UTF-8 percent-encoded.
        assert!(url.contains("%E5%B7%A5%E9%93%B6%E7%91%9E%E4%BF%A1"));
    }

    #[test]
    fn row_mapping_strips_html_and_parses_dates() {
        let row = json!({
            "uploadInfoId": 19052421,
            "fundCode": "000001",
            "fundShortName": "<a href=\"x\">华夏成长</a>",
            "organName": "华夏基金管理有限公司",
            "reportSendDate": "2024/03/29",
            "reportDesp": "华夏成长证券投资基金2023年年度报告"
        });
        let report = parse_row(&row).unwrap();
        assert_eq!(report.upload_info_id, "19052421");
        assert_eq!(report.fund_short_name, "华夏成长");
        assert_eq!(
            report.report_send_date,
            NaiveDate::from_ymd_opt(2024, 3, 29).unwrap()
        );
    }

    #[test]
    fn row_without_upload_info_id_is_dropped() {
        let row = json!({ "fundCode": "000001" });
        assert!(parse_row(&row).is_none());
    }
}
