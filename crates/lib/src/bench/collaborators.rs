//! Default collaborators: a boolean inside a JSON config file, a restart command, and a
//! directory copy of the agent workspace.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{FlagToggle, InstanceControl, WorkspaceCapture};

/// Boolean at a JSON pointer (RFC 6901) inside a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFlagFile {
    path: PathBuf,
    pointer: String,
}

impl JsonFlagFile {
    pub fn new(path: PathBuf, pointer: impl Into<String>) -> Self {
        Self {
            path,
            pointer: pointer.into(),
        }
    }
}

fn pointer_tokens(pointer: &str) -> Result<Vec<String>> {
    let rest = pointer
        .strip_prefix('/')
        .with_context(|| format!("invalid JSON pointer {:?}", pointer))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Set `value` at `pointer`, creating missing intermediate objects.
fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let tokens = pointer_tokens(pointer)?;
    let Some((last, parents)) = tokens.split_last() else {
        anyhow::bail!("empty JSON pointer");
    };
    let mut node = root;
    for token in parents {
        let obj = node
            .as_object_mut()
            .with_context(|| format!("{} crosses a non-object at {:?}", pointer, token))?;
        node = obj
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let obj = node
        .as_object_mut()
        .with_context(|| format!("parent of {} is not an object", pointer))?;
    obj.insert(last.clone(), value);
    Ok(())
}

#[async_trait]
impl FlagToggle for JsonFlagFile {
    async fn set(&self, enabled: bool) -> Result<()> {
        let mut doc = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing {}", self.path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        set_pointer(&mut doc, &self.pointer, Value::Bool(enabled))?;
        let mut out = serde_json::to_string_pretty(&doc)?;
        out.push('\n');
        tokio::fs::write(&self.path, out)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        log::info!("{} {} = {}", self.path.display(), self.pointer, enabled);
        Ok(())
    }
}

/// Restart by running a command. Arguments are passed as a list; no shell is involved.
/// An empty command means the instance picks up config changes by itself.
#[derive(Debug, Clone)]
pub struct CommandRestart {
    argv: Vec<String>,
}

impl CommandRestart {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl InstanceControl for CommandRestart {
    async fn restart(&self) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            log::info!("no restart command configured; skipping restart");
            return Ok(());
        };
        log::info!("restarting instance: {}", self.argv.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("exec failed: {}", program))?;
        if output.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut msg = stdout.trim().to_string();
        if !stderr.trim().is_empty() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            msg.push_str(stderr.trim());
        }
        anyhow::bail!("{} exited with {}: {}", program, output.status, msg)
    }
}

/// Recursive copy of a workspace directory. Symlinks are skipped.
#[derive(Debug, Clone)]
pub struct DirectoryCapture {
    source: PathBuf,
}

impl DirectoryCapture {
    pub fn new(source: PathBuf) -> Self {
        Self { source }
    }
}

#[async_trait]
impl WorkspaceCapture for DirectoryCapture {
    async fn capture(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::new();
        let mut dirs = vec![(self.source.clone(), dest.to_path_buf())];
        while let Some((src, dst)) = dirs.pop() {
            tokio::fs::create_dir_all(&dst)
                .await
                .with_context(|| format!("creating {}", dst.display()))?;
            let mut entries = tokio::fs::read_dir(&src)
                .await
                .with_context(|| format!("reading {}", src.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let target = dst.join(entry.file_name());
                if file_type.is_dir() {
                    dirs.push((entry.path(), target));
                } else if file_type.is_file() {
                    tokio::fs::copy(entry.path(), &target)
                        .await
                        .with_context(|| format!("copying {}", entry.path().display()))?;
                    copied.push(target);
                }
            }
        }
        copied.sort();
        Ok(copied)
    }
}
