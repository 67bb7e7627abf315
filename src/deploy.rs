//! The webhook-to-action pipeline
//!
//! For every modified file of a push, in commit order, the path is classified
//! into a unit and checked against the trigger policy. A triggering change
//! pulls the repository checkout (awaited) and then restarts the unit in a
//! background task whose completion the caller does not wait for.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info};

use crate::DeployConfig;
use crate::command::{CaptureMode, CommandError, CommandExecutor, CommandOutput, RunOptions};
use crate::policy::{Decision, TriggerPolicy, classify};
use crate::webhook::WebhookEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    NotConfigured,
    WrongFile,
    Triggered,
    NoData,
}

/// What happened to one modified file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    pub folder: Option<String>,
    pub result: OutcomeKind,
    pub message: String,
}

/// Response body for a processed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub result: &'static str,
    pub commits: Vec<TriggerOutcome>,
}

impl Default for DeployReport {
    fn default() -> Self {
        Self {
            result: "success",
            commits: Vec::new(),
        }
    }
}

impl DeployReport {
    pub fn no_data() -> Self {
        let mut report = Self::default();
        report.commits.push(TriggerOutcome {
            folder: None,
            result: OutcomeKind::NoData,
            message: "The push didn't hold any data to process".to_string(),
        });
        report
    }

    fn record(&mut self, folder: String, result: OutcomeKind, message: String) {
        self.commits.push(TriggerOutcome {
            folder: Some(folder),
            result,
            message,
        });
    }
}

/// Result of [`Deployer::deploy`]: the report plus the restart tasks it
/// started. Dropping the handles detaches the tasks.
pub struct Deployment {
    pub report: DeployReport,
    pub restarts: Vec<JoinHandle<()>>,
}

pub struct Deployer {
    config: Arc<DeployConfig>,
    policy: TriggerPolicy,
    executor: Arc<dyn CommandExecutor>,
    repository_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Deployer {
    pub fn new(config: Arc<DeployConfig>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            policy: TriggerPolicy::from_config(&config),
            config,
            executor,
            repository_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    /// Runs the pipeline for one push event.
    ///
    /// Never fails: command failures are reported by the executor and the
    /// pipeline moves on to the next file.
    pub async fn deploy(&self, event: &WebhookEvent) -> Deployment {
        let mut restarts = Vec::new();

        if !event.has_commits() {
            info!(
                "The push for '{}' didn't hold any data to process",
                event.repository_name
            );
            return Deployment {
                report: DeployReport::no_data(),
                restarts,
            };
        }

        let mut report = DeployReport::default();
        for (index, commit) in event.commits.iter().enumerate() {
            debug!(
                "Taking action on commit #{} of '{}' ({} modified file(s))",
                index + 1,
                event.repository_name,
                commit.modified_files.len()
            );

            for modified_file in &commit.modified_files {
                info!("Processing {}", modified_file);

                let classified = classify(modified_file);
                let folder = classified.unit.to_string();
                debug!("File: {}. Folder: {}", classified.leaf, folder);

                match self.policy.evaluate(&classified) {
                    Decision::NotConfigured => {
                        info!("The container is not configured on this server: {}", folder);
                        report.record(
                            folder,
                            OutcomeKind::NotConfigured,
                            "The container is not configured on this server".to_string(),
                        );
                    }
                    Decision::WrongFile => {
                        info!(
                            "The updated file isn't a {} file: {}",
                            self.policy.trigger_filename(),
                            modified_file
                        );
                        report.record(
                            folder,
                            OutcomeKind::WrongFile,
                            format!(
                                "The updated file isn't a {} file",
                                self.policy.trigger_filename()
                            ),
                        );
                    }
                    Decision::Trigger => {
                        // A failed pull is reported by the executor; the restart
                        // still goes ahead against whatever is checked out.
                        let message = match self.pull(&event.repository_name).await {
                            Ok(_) => "Repository pulled, container restart started",
                            Err(_) => "Repository pull failed, container restart started anyway",
                        };
                        restarts.push(self.spawn_restart(&event.repository_name, &folder));
                        report.record(folder, OutcomeKind::Triggered, message.to_string());
                    }
                }
            }
        }

        info!(
            "Processed push for '{}': {} file(s), {} restart(s)",
            event.repository_name,
            report.commits.len(),
            restarts.len()
        );

        Deployment { report, restarts }
    }

    async fn pull(&self, repository: &str) -> Result<CommandOutput, CommandError> {
        let directory = self.config.repository_dir(repository);
        let options = RunOptions {
            capture: CaptureMode::Separate,
            timeout: self.config.pull_timeout(),
        };

        if !self.config.serialize_pulls {
            return self
                .executor
                .run(&self.config.pull_command, &directory, options)
                .await;
        }

        let lock = self.repository_lock(repository);
        let _guard = lock.lock().await;
        self.executor
            .run(&self.config.pull_command, &directory, options)
            .await
    }

    fn repository_lock(&self, repository: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .repository_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(repository.to_string()).or_default())
    }

    fn spawn_restart(&self, repository: &str, unit: &str) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let command = self.config.restart_command.clone();
        let directory: PathBuf = self.config.unit_dir(repository, unit);
        let options = RunOptions {
            capture: CaptureMode::Merged,
            timeout: Some(self.config.restart_timeout()),
        };
        let unit = unit.to_string();

        tokio::spawn(
            async move {
                // Failures are logged and notified by the executor itself
                if executor.run(&command, &directory, options).await.is_ok() {
                    info!("{} was restarted.", unit);
                }
            }
            .in_current_span(),
        )
    }
}
