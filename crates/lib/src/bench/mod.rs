//! Flag-toggle benchmark: run the same prompts against a serving instance with a config flag
//! on and then off, and keep one record per prompt.
//!
//! The pieces around the gateway (flag file, instance restart, workspace capture, result
//! storage) sit behind async traits; [`Harness::from_config`] wires the default implementations.

mod collaborators;
mod records;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{self, Config};
use crate::device::DeviceIdentity;
use crate::gateway::{ClientOptions, GatewayClient, GatewayError};

pub use collaborators::{CommandRestart, DirectoryCapture, JsonFlagFile};
pub use records::{JsonResultStore, ResultRecord};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Turns the feature under test on or off in the serving instance's configuration.
#[async_trait]
pub trait FlagToggle: Send + Sync {
    async fn set(&self, enabled: bool) -> Result<()>;
}

/// Restarts the serving instance so a changed flag takes effect.
#[async_trait]
pub trait InstanceControl: Send + Sync {
    async fn restart(&self) -> Result<()>;
}

/// Copies whatever the agent produced into `dest`; returns the captured files.
#[async_trait]
pub trait WorkspaceCapture: Send + Sync {
    async fn capture(&self, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Persists one record; returns where it went.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, record: &ResultRecord) -> Result<PathBuf>;
}

pub fn variant_label(enabled: bool) -> &'static str {
    if enabled {
        "flag-on"
    } else {
        "flag-off"
    }
}

pub struct Harness {
    options: ClientOptions,
    identity: DeviceIdentity,
    prompts: Vec<String>,
    reset_between_prompts: bool,
    ready_timeout: Duration,
    captures_dir: PathBuf,
    flag: Box<dyn FlagToggle>,
    instance: Box<dyn InstanceControl>,
    workspace: Option<Box<dyn WorkspaceCapture>>,
    store: Box<dyn ResultStore>,
}

impl Harness {
    /// Harness with the default collaborators from the `bench` config section. Relative paths
    /// resolve against the config file's directory.
    pub fn from_config(config: &Config, config_path: &Path, identity: DeviceIdentity) -> Result<Self> {
        let bench = &config.bench;
        let flag_file = bench
            .flag_file
            .as_ref()
            .context("bench.flagFile is not set")?;
        if bench.flag_pointer.is_empty() {
            anyhow::bail!("bench.flagPointer is not set");
        }
        if bench.prompts.is_empty() {
            anyhow::bail!("bench.prompts is empty");
        }
        let results_dir = config::resolve_relative(&bench.results_dir, config_path);
        let workspace = bench.workspace_dir.as_ref().map(|dir| {
            Box::new(DirectoryCapture::new(config::resolve_relative(dir, config_path)))
                as Box<dyn WorkspaceCapture>
        });

        let mut harness = Self::new(
            ClientOptions::from_config(config),
            identity,
            bench.prompts.clone(),
            Box::new(JsonFlagFile::new(
                config::resolve_relative(flag_file, config_path),
                bench.flag_pointer.clone(),
            )),
            Box::new(CommandRestart::new(bench.restart_command.clone())),
            Box::new(JsonResultStore::new(results_dir.clone())),
        );
        harness.workspace = workspace;
        harness.captures_dir = results_dir.join("captures");
        harness.ready_timeout = Duration::from_millis(bench.ready_timeout_ms);
        harness.reset_between_prompts = bench.reset_between_prompts;
        Ok(harness)
    }

    pub fn new(
        options: ClientOptions,
        identity: DeviceIdentity,
        prompts: Vec<String>,
        flag: Box<dyn FlagToggle>,
        instance: Box<dyn InstanceControl>,
        store: Box<dyn ResultStore>,
    ) -> Self {
        Self {
            options,
            identity,
            prompts,
            reset_between_prompts: true,
            ready_timeout: Duration::from_millis(120_000),
            captures_dir: PathBuf::from("results").join("captures"),
            flag,
            instance,
            workspace: None,
            store,
        }
    }

    pub fn with_workspace(mut self, workspace: Box<dyn WorkspaceCapture>, captures_dir: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self.captures_dir = captures_dir;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_reset_between_prompts(mut self, reset: bool) -> Self {
        self.reset_between_prompts = reset;
        self
    }

    /// Run every prompt with the flag set to `enabled`. A failed prompt becomes a record with
    /// an error; failing to set the flag, restart, or reconnect aborts the variant.
    pub async fn run_variant(&self, enabled: bool) -> Result<Vec<ResultRecord>> {
        let label = variant_label(enabled);
        log::info!("bench {}: setting flag", label);
        self.flag.set(enabled).await.context("setting flag")?;
        self.instance.restart().await.context("restarting instance")?;

        let mut client = self.connect_when_ready().await?;
        let mut records = Vec::with_capacity(self.prompts.len());
        for (index, prompt) in self.prompts.iter().enumerate() {
            let mut record = ResultRecord::new(label, enabled, index, prompt);
            let outcome = self.run_prompt(&mut client, prompt).await;
            match outcome {
                Ok(result) => {
                    log::info!(
                        "bench {} prompt {}: {}ms via {:?}",
                        label,
                        index,
                        result.elapsed_ms,
                        result.completed_via
                    );
                    record.result = Some(result);
                }
                Err(e) => {
                    log::warn!("bench {} prompt {} failed: {}", label, index, e);
                    record.error = Some(e.to_string());
                }
            }
            if let Some(workspace) = &self.workspace {
                let dest = self.captures_dir.join(format!("{}-{:02}", label, index));
                match workspace.capture(&dest).await {
                    Ok(files) => record.artifacts = files,
                    Err(e) => log::warn!("workspace capture failed: {:#}", e),
                }
            }
            let path = self.store.save(&record).await?;
            log::debug!("saved record {}", path.display());
            records.push(record);
        }
        client.disconnect().await;
        Ok(records)
    }

    async fn run_prompt(
        &self,
        client: &mut GatewayClient,
        prompt: &str,
    ) -> Result<crate::gateway::PromptResult, GatewayError> {
        if self.reset_between_prompts {
            client.reset_session().await?;
        }
        client.send_prompt(prompt).await
    }

    /// The instance takes a while to come back after a restart; retry connecting until the
    /// ready timeout.
    async fn connect_when_ready(&self) -> Result<GatewayClient> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match GatewayClient::connect(self.options.clone(), &self.identity).await {
                Ok(client) => return Ok(client),
                Err(e) if Instant::now() + RECONNECT_INTERVAL < deadline => {
                    log::debug!("gateway not ready yet: {}", e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "gateway not ready after {}ms",
                            self.ready_timeout.as_millis()
                        )
                    })
                }
            }
        }
    }
}
