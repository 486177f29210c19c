use chrono::Utc;
use log::{debug, info};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::DbError;
use crate::model::ParsedFundReport;

/// Authoritative relational schema. Idempotent; executed at service
/// startup. Monetary columns are 20,2 fixed-point, ratios 8,4 and
/// constrained to the unit interval; children cascade on delete.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS fund_report (
        id UUID PRIMARY KEY,
        fund_code VARCHAR(10) NOT NULL,
        fund_name VARCHAR(200) NOT NULL,
        fund_manager VARCHAR(200),
        report_type VARCHAR(16) NOT NULL,
        report_period_start DATE,
        report_period_end DATE NOT NULL,
        net_asset_value NUMERIC(20, 2),
        total_net_assets NUMERIC(20, 2),
        period_profit NUMERIC(20, 2),
        parser_kind VARCHAR(8) NOT NULL,
        taxonomy_version VARCHAR(64),
        confidence NUMERIC(8, 4) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        reparsed_at TIMESTAMPTZ,
        UNIQUE (fund_code, report_period_end, report_type)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_fund_report_code_period
        ON fund_report (fund_code, report_period_end)"#,
    r#"CREATE TABLE IF NOT EXISTS asset_allocation (
        id UUID PRIMARY KEY,
        fund_report_id UUID NOT NULL REFERENCES fund_report (id) ON DELETE CASCADE,
        asset_type VARCHAR(100) NOT NULL,
        asset_subtype VARCHAR(100),
        market_value NUMERIC(20, 2) NOT NULL,
        net_value_ratio NUMERIC(8, 4) NOT NULL CHECK (net_value_ratio >= 0 AND net_value_ratio <= 1)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_asset_allocation_report
        ON asset_allocation (fund_report_id)"#,
    r#"CREATE TABLE IF NOT EXISTS top_holding (
        id UUID PRIMARY KEY,
        fund_report_id UUID NOT NULL REFERENCES fund_report (id) ON DELETE CASCADE,
        rank INTEGER NOT NULL CHECK (rank >= 1),
        security_code VARCHAR(20) NOT NULL,
        security_name VARCHAR(100) NOT NULL,
        shares BIGINT,
        market_value NUMERIC(20, 2) NOT NULL,
        net_value_ratio NUMERIC(8, 4) NOT NULL CHECK (net_value_ratio >= 0 AND net_value_ratio <= 1)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_top_holding_report
        ON top_holding (fund_report_id)"#,
    r#"CREATE TABLE IF NOT EXISTS industry_allocation (
        id UUID PRIMARY KEY,
        fund_report_id UUID NOT NULL REFERENCES fund_report (id) ON DELETE CASCADE,
        industry_name VARCHAR(100) NOT NULL,
        market_value NUMERIC(20, 2) NOT NULL,
        net_value_ratio NUMERIC(8, 4) NOT NULL CHECK (net_value_ratio >= 0 AND net_value_ratio <= 1)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_industry_allocation_report
        ON industry_allocation (fund_report_id)"#,
    r#"CREATE TABLE IF NOT EXISTS download_task (
        task_id UUID PRIMARY KEY,
        status VARCHAR(16) NOT NULL,
        save_dir TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        requested_refs JSONB NOT NULL,
        per_item JSONB NOT NULL,
        progress JSONB NOT NULL
    )"#,
];

/// Maps parsed reports onto the relational schema. One short transaction
/// per report: upsert the parent by its natural key, replace the children
/// as a unit.
pub struct FundReportStore {
    pool: PgPool,
}

impl FundReportStore {
    pub fn new(pool: PgPool) -> Self {
        FundReportStore { pool }
    }

    pub async fn init_schema(&self) -> Result<(), DbError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    /// Idempotent save keyed on (fund_code, report_period_end,
    /// report_type). A reparse keeps the row id, stamps reparsed_at and
    /// rebuilds the children.
    pub async fn save(&self, report: &ParsedFundReport) -> Result<Uuid, DbError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"INSERT INTO fund_report
               (id, fund_code, fund_name, fund_manager, report_type,
                report_period_start, report_period_end,
                net_asset_value, total_net_assets, period_profit,
                parser_kind, taxonomy_version, confidence, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
               ON CONFLICT (fund_code, report_period_end, report_type) DO UPDATE SET
                 fund_name = EXCLUDED.fund_name,
                 fund_manager = EXCLUDED.fund_manager,
                 report_period_start = EXCLUDED.report_period_start,
                 net_asset_value = EXCLUDED.net_asset_value,
                 total_net_assets = EXCLUDED.total_net_assets,
                 period_profit = EXCLUDED.period_profit,
                 parser_kind = EXCLUDED.parser_kind,
                 taxonomy_version = EXCLUDED.taxonomy_version,
                 confidence = EXCLUDED.confidence,
                 reparsed_at = EXCLUDED.created_at
               RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(&report.fund_code)
        .bind(&report.fund_name)
        .bind(&report.fund_manager)
        .bind(report.report_type.as_str())
        .bind(report.report_period_start)
        .bind(report.report_period_end)
        .bind(report.net_asset_value)
        .bind(report.total_net_assets)
        .bind(report.period_profit)
        .bind(report.parser_kind.as_str())
        .bind(&report.taxonomy_version)
        .bind(report.confidence)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let fund_report_id: Uuid = row.try_get("id")?;

        // Children are replaced as a unit on every (re)parse.
        for table in ["asset_allocation", "top_holding", "industry_allocation"] {
            sqlx::query(&format!("DELETE FROM {} WHERE fund_report_id = $1", table))
                .bind(fund_report_id)
                .execute(&mut *tx)
                .await?;
        }

        for allocation in &report.asset_allocations {
            sqlx::query(
                r#"INSERT INTO asset_allocation
                   (id, fund_report_id, asset_type, asset_subtype, market_value, net_value_ratio)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(Uuid::new_v4())
            .bind(fund_report_id)
            .bind(&allocation.asset_type)
            .bind(&allocation.asset_subtype)
            .bind(allocation.market_value)
            .bind(allocation.net_value_ratio)
            .execute(&mut *tx)
            .await?;
        }

        for holding in &report.top_holdings {
            sqlx::query(
                r#"INSERT INTO top_holding
                   (id, fund_report_id, rank, security_code, security_name, shares,
                    market_value, net_value_ratio)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(Uuid::new_v4())
            .bind(fund_report_id)
            .bind(holding.rank as i32)
            .bind(&holding.security_code)
            .bind(&holding.security_name)
            .bind(holding.shares)
            .bind(holding.market_value)
            .bind(holding.net_value_ratio)
            .execute(&mut *tx)
            .await?;
        }

        for industry in &report.industry_allocations {
            sqlx::query(
                r#"INSERT INTO industry_allocation
                   (id, fund_report_id, industry_name, market_value, net_value_ratio)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(Uuid::new_v4())
            .bind(fund_report_id)
            .bind(&industry.industry_name)
            .bind(industry.market_value)
            .bind(industry.net_value_ratio)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "saved fund_report {} ({} {} {})",
            fund_report_id,
            report.fund_code,
            report.report_period_end,
            report.report_type
        );
        Ok(fund_report_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_enforces_the_write_invariants() {
        let ddl = SCHEMA.join("\n");
        assert!(ddl.contains("UNIQUE (fund_code, report_period_end, report_type)"));
        assert!(ddl.contains("ON DELETE CASCADE"));
        assert!(ddl.contains("NUMERIC(20, 2)"));
        assert!(ddl.contains("NUMERIC(8, 4)"));
        assert!(ddl.contains("net_value_ratio >= 0 AND net_value_ratio <= 1"));
        // Every statement must be idempotent for startup re-runs.
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{}", statement);
        }
    }
}
