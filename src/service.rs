use anyhow::{Context, Result};
use log::info;
use sqlx::postgres::PgPoolOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::config::IngestConfig;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::{DbError, IngestError, ValidationError};
use crate::model::{ParseHints, ParseResult, ReportPage, ReportRef};
use crate::parser::ParserFacade;
use crate::portal::{PortalClient, SearchCriteria};
use crate::storage::FundReportStore;
use crate::task::{DownloadTask, Orchestrator, TaskStore};

/// The public contract of the pipeline. HTTP, CLI or messaging shells map
/// 1:1 onto these operations and add no business logic of their own.
pub struct FundReportService {
    config: Arc<IngestConfig>,
    portal: Arc<PortalClient>,
    downloader: Arc<Downloader>,
    parser: Arc<ParserFacade>,
    tasks: Arc<TaskStore>,
    orchestrator: Arc<Orchestrator>,
}

impl FundReportService {
    /// Wire the whole pipeline: database pool, schema, portal client,
    /// downloader and parser.
    pub async fn connect(config: IngestConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.worker_pool_size as u32 + 2)
            .connect(&config.database_url)
            .await
            .context("connecting to the database")?;

        let reports = Arc::new(FundReportStore::new(pool.clone()));
        reports
            .init_schema()
            .await
            .context("initializing the schema")?;

        let config = Arc::new(config);
        let portal = Arc::new(PortalClient::new(&config).context("building the portal client")?);
        let downloader = Arc::new(
            Downloader::new(&config.user_agent, config.download_timeout)
                .context("building the downloader")?,
        );
        let parser = Arc::new(ParserFacade::new(&config).context("loading mapping configs")?);
        let tasks = Arc::new(TaskStore::new(pool));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&portal),
            Arc::clone(&downloader),
            Arc::clone(&parser),
            reports,
            Arc::clone(&tasks),
        ));

        info!("fund report service ready");
        Ok(FundReportService {
            config,
            portal,
            downloader,
            parser,
            tasks,
            orchestrator,
        })
    }

    /// One page of portal search results.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<ReportPage, IngestError> {
        criteria.validate()?;
        let page = self.portal.list_reports(criteria).await?;
        Ok(page)
    }

    /// Fetch one report artifact into `dir` without parsing it.
    pub async fn download(
        &self,
        report_ref: &ReportRef,
        dir: &Path,
    ) -> Result<DownloadOutcome, IngestError> {
        let url = self.portal.resolve_download_url(&report_ref.upload_info_id);
        let destination = dir.join(format!(
            "{}_{}.xbrl",
            report_ref.fund_code, report_ref.upload_info_id
        ));
        let outcome = self.downloader.download(url.as_str(), &destination).await?;
        Ok(outcome)
    }

    /// Parse an artifact already on disk; used by reparse workflows.
    pub async fn parse_file(&self, path: &Path) -> ParseResult {
        let parser = Arc::clone(&self.parser);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || parser.parse_file(&path, &ParseHints::default()))
            .await
            .unwrap_or_else(|e| ParseResult {
                report: None,
                warnings: vec![format!("parse worker failed: {}", e)],
                attempted: Vec::new(),
            })
    }

    /// Persist a PENDING task, launch the orchestrator and return its id
    /// immediately (202 semantics).
    pub async fn enqueue_batch(
        &self,
        refs: Vec<ReportRef>,
        save_dir: PathBuf,
    ) -> Result<Uuid, IngestError> {
        if refs.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        if refs.len() > self.config.batch_cap {
            return Err(ValidationError::BatchTooLarge {
                got: refs.len(),
                cap: self.config.batch_cap,
            }
            .into());
        }

        let task_id = Uuid::new_v4();
        let requested: Vec<String> = refs.iter().map(|r| r.upload_info_id.clone()).collect();
        let task = DownloadTask::new(task_id, requested, save_dir.to_string_lossy().to_string());
        self.tasks.create(&task).await?;

        Arc::clone(&self.orchestrator)
            .spawn_batch(task_id, refs, save_dir)
            .await;

        info!("batch {} enqueued", task_id);
        Ok(task_id)
    }

    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<DownloadTask>, DbError> {
        self.tasks.get(task_id).await
    }

    /// Cooperative cancellation; returns false when the task is already
    /// terminal.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, DbError> {
        self.orchestrator.cancel(task_id).await
    }
}
