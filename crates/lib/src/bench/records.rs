//! Benchmark result records and their JSON file store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ResultStore;
use crate::gateway::PromptResult;

/// One prompt run under one flag setting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    /// "flag-on" or "flag-off".
    pub label: String,
    pub flag_enabled: bool,
    pub prompt_index: usize,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PromptResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
}

impl ResultRecord {
    pub fn new(label: &str, flag_enabled: bool, prompt_index: usize, prompt: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            label: label.to_string(),
            flag_enabled,
            prompt_index,
            prompt: prompt.to_string(),
            result: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{:02}-{}.json",
            self.label,
            self.prompt_index,
            self.recorded_at.format("%Y%m%dT%H%M%S")
        )
    }
}

/// One pretty-printed JSON file per record under `dir`.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    dir: PathBuf,
}

impl JsonResultStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ResultStore for JsonResultStore {
    async fn save(&self, record: &ResultRecord) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(record.file_name());
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
