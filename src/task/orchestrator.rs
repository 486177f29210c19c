use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::store::TaskStore;
use super::types::{ItemOutcome, ItemStatus, Progress, TaskStatus};
use crate::core::config::IngestConfig;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::{ErrorKind, ItemError};
use crate::model::{ParseHints, ParsedFundReport, ReportRef};
use crate::parser::ParserFacade;
use crate::portal::PortalClient;
use crate::storage::FundReportStore;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Fans a batch out into independent download -> parse -> persist chains
/// on a bounded worker pool and finalizes the task exactly once when all
/// chains have settled. Values crossing chain steps are plain serde
/// structs; nothing from the persistence layer travels between steps.
pub struct Orchestrator {
    config: Arc<IngestConfig>,
    portal: Arc<PortalClient>,
    downloader: Arc<Downloader>,
    parser: Arc<ParserFacade>,
    reports: Arc<FundReportStore>,
    tasks: Arc<TaskStore>,
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<IngestConfig>,
        portal: Arc<PortalClient>,
        downloader: Arc<Downloader>,
        parser: Arc<ParserFacade>,
        reports: Arc<FundReportStore>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        Orchestrator {
            config,
            portal,
            downloader,
            parser,
            reports,
            tasks,
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Launch the batch in the background and return immediately.
    pub async fn spawn_batch(self: Arc<Self>, task_id: Uuid, refs: Vec<ReportRef>, save_dir: PathBuf) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .await
            .insert(task_id, Arc::clone(&cancel));

        tokio::spawn(async move {
            self.run_batch(task_id, refs, save_dir, cancel).await;
        });
    }

    /// Cooperative cancel: in-flight chains finish their current step and
    /// skip the rest. Returns false when the task is already terminal.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, crate::error::DbError> {
        let accepted = self
            .tasks
            .update_status(task_id, TaskStatus::Cancelling)
            .await?;
        if accepted {
            if let Some(flag) = self.cancel_flags.lock().await.get(&task_id) {
                flag.store(true, Ordering::SeqCst);
            }
            info!("task {} cancelling", task_id);
        }
        Ok(accepted)
    }

    async fn run_batch(
        self: Arc<Self>,
        task_id: Uuid,
        refs: Vec<ReportRef>,
        save_dir: PathBuf,
        cancel: Arc<AtomicBool>,
    ) {
        info!("task {} running with {} reports", task_id, refs.len());
        if let Err(e) = self.tasks.update_status(task_id, TaskStatus::Running).await {
            error!("task {} could not transition to RUNNING: {}", task_id, e);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut chains = JoinSet::new();
        for report_ref in refs {
            let orchestrator = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = Arc::clone(&cancel);
            let save_dir = save_dir.clone();
            chains.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                orchestrator
                    .run_chain(task_id, report_ref, save_dir, cancel)
                    .await;
            });
        }

        while let Some(joined) = chains.join_next().await {
            if let Err(e) = joined {
                error!("task {} chain panicked: {}", task_id, e);
            }
        }

        self.finalize(task_id, cancel).await;
        self.cancel_flags.lock().await.remove(&task_id);
    }

    /// Runs after every chain has reached a terminal item state; writes
    /// the aggregate terminal status once.
    async fn finalize(&self, task_id: Uuid, cancel: Arc<AtomicBool>) {
        let task = match self.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!("task {} vanished before finalize", task_id);
                return;
            }
            Err(e) => {
                error!("task {} finalize read failed: {}", task_id, e);
                return;
            }
        };

        let progress = Progress::recompute(task.requested_refs.len(), &task.per_item);
        let cancelling =
            cancel.load(Ordering::SeqCst) || task.status == TaskStatus::Cancelling;
        let terminal = progress.terminal_status(cancelling);

        match self.tasks.finalize(task_id, terminal).await {
            Ok(true) => info!(
                "task {} finalized as {} ({}/{} persisted, {} failed)",
                task_id,
                terminal.as_str(),
                progress.completed,
                progress.total,
                progress.failed
            ),
            Ok(false) => warn!("task {} was already terminal", task_id),
            Err(e) => error!("task {} finalize write failed: {}", task_id, e),
        }
    }

    async fn run_chain(
        self: Arc<Self>,
        task_id: Uuid,
        report_ref: ReportRef,
        save_dir: PathBuf,
        cancel: Arc<AtomicBool>,
    ) {
        let id = report_ref.upload_info_id.clone();

        if cancel.load(Ordering::SeqCst) {
            self.record(task_id, &id, cancelled_outcome(None)).await;
            return;
        }

        // download
        let downloaded = match self.download_with_retry(&report_ref, &save_dir).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.record(task_id, &id, failed_outcome(error, None)).await;
                return;
            }
        };
        let file_path = downloaded.file_path.to_string_lossy().to_string();
        self.record(
            task_id,
            &id,
            ItemOutcome {
                status: ItemStatus::Downloaded,
                file_path: Some(file_path.clone()),
                fund_report_id: None,
                error: None,
            },
        )
        .await;

        if cancel.load(Ordering::SeqCst) {
            self.record(task_id, &id, cancelled_outcome(Some(file_path))).await;
            return;
        }

        // parse
        let report = match self.parse_step(&downloaded, &report_ref).await {
            Ok(report) => report,
            Err(error) => {
                self.record(task_id, &id, failed_outcome(error, Some(file_path)))
                    .await;
                return;
            }
        };
        self.record(
            task_id,
            &id,
            ItemOutcome {
                status: ItemStatus::Parsed,
                file_path: Some(file_path.clone()),
                fund_report_id: None,
                error: None,
            },
        )
        .await;

        if cancel.load(Ordering::SeqCst) {
            self.record(task_id, &id, cancelled_outcome(Some(file_path))).await;
            return;
        }

        // persist
        match self.persist_with_retry(&report).await {
            Ok(fund_report_id) => {
                self.record(
                    task_id,
                    &id,
                    ItemOutcome {
                        status: ItemStatus::Persisted,
                        file_path: Some(file_path),
                        fund_report_id: Some(fund_report_id),
                        error: None,
                    },
                )
                .await;
            }
            Err(error) => {
                self.record(task_id, &id, failed_outcome(error, Some(file_path)))
                    .await;
            }
        }
    }

    async fn download_with_retry(
        &self,
        report_ref: &ReportRef,
        save_dir: &PathBuf,
    ) -> Result<DownloadOutcome, ItemError> {
        let url = self.portal.resolve_download_url(&report_ref.upload_info_id);
        let destination = save_dir.join(format!(
            "{}_{}.xbrl",
            report_ref.fund_code, report_ref.upload_info_id
        ));

        let mut backoff = RETRY_INITIAL;
        let mut attempt = 1;
        loop {
            match self.downloader.download(url.as_str(), &destination).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.retryable() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "download attempt {}/{} for {} failed, retrying in {:?}: {}",
                        attempt, RETRY_ATTEMPTS, report_ref.upload_info_id, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(ItemError::new(e.kind(), e.to_string())),
            }
        }
    }

    /// Parsing is compute-bound, so it runs on a blocking worker under
    /// the step watchdog.
    async fn parse_step(
        &self,
        downloaded: &DownloadOutcome,
        report_ref: &ReportRef,
    ) -> Result<ParsedFundReport, ItemError> {
        let parser = Arc::clone(&self.parser);
        let path = downloaded.file_path.clone();
        let hints = ParseHints::from_ref(report_ref);

        let handle = tokio::task::spawn_blocking(move || parser.parse_file(&path, &hints));
        let result = match tokio::time::timeout(self.config.parse_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                return Err(ItemError::new(
                    ErrorKind::Parse,
                    format!("parse worker failed: {}", join_error),
                ))
            }
            Err(_) => {
                return Err(ItemError::new(
                    ErrorKind::Timeout,
                    format!("parse exceeded {:?}", self.config.parse_timeout),
                ))
            }
        };

        match result.report {
            Some(report) => Ok(report),
            None => Err(ItemError::new(
                result.failure_kind(),
                result.failure_message(),
            )),
        }
    }

    async fn persist_with_retry(&self, report: &ParsedFundReport) -> Result<Uuid, ItemError> {
        let mut backoff = RETRY_INITIAL;
        let mut attempt = 1;
        loop {
            let save = self.reports.save(report);
            match tokio::time::timeout(self.config.persist_timeout, save).await {
                Ok(Ok(id)) => return Ok(id),
                Ok(Err(e)) if e.retryable() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "persist attempt {}/{} for {} failed, retrying in {:?}: {}",
                        attempt, RETRY_ATTEMPTS, report.fund_code, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(ItemError::new(e.kind(), e.to_string())),
                Err(_) => {
                    return Err(ItemError::new(
                        ErrorKind::Timeout,
                        format!("persist exceeded {:?}", self.config.persist_timeout),
                    ))
                }
            }
        }
    }

    async fn record(&self, task_id: Uuid, upload_info_id: &str, outcome: ItemOutcome) {
        if let Err(e) = self
            .tasks
            .update_item(task_id, upload_info_id, outcome)
            .await
        {
            error!(
                "task {} could not record outcome for {}: {}",
                task_id, upload_info_id, e
            );
        }
    }
}

fn failed_outcome(error: ItemError, file_path: Option<String>) -> ItemOutcome {
    ItemOutcome {
        status: ItemStatus::Failed,
        file_path,
        fund_report_id: None,
        error: Some(error),
    }
}

/// Cancellation is not a failure; the item is marked CANCELLED.
fn cancelled_outcome(file_path: Option<String>) -> ItemOutcome {
    ItemOutcome {
        status: ItemStatus::Cancelled,
        file_path,
        fund_report_id: None,
        error: Some(ItemError::new(ErrorKind::Cancelled, "task cancelled")),
    }
}
