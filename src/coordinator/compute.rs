//! Compute jobs: run a script against a read-only snapshot of a dataset.
//!
//! The dataset is laid out under `<workspace_root>/<job key>/linked`, as
//! symlinks into the blob store when it has local paths and as copies
//! otherwise. Script failures are results, not job errors: they are parked
//! for the poller in the [`CachedComputeResponse`] and the job ends.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::blob::{trim_protocol, StorageLocation};
use crate::error::{Result, SyncError};
use crate::job::{Job, JobContext, DDI_CDI_PLUGIN};
use crate::tree::Node;

use super::types::CachedComputeResponse;
use super::SyncEngine;

const COMPUTATION_FAILED: &str = "computation failed";

/// Per-job directory tree, removed once the run is over.
struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn linked(&self) -> PathBuf {
        self.root.join("linked")
    }

    fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.root.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

/// `id` as a path below the workspace; absolute paths and `..` are refused.
fn relative_path(id: &str) -> Result<PathBuf> {
    let path = Path::new(id);
    let clean = !id.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(path.to_path_buf())
    } else {
        Err(SyncError::Destination(format!("invalid file path '{id}'")))
    }
}

#[cfg(unix)]
async fn symlink(source: &Path, target: &Path) -> Result<bool> {
    tokio::fs::symlink(source, target).await?;
    Ok(true)
}

/// No symlinks here; the caller copies instead.
#[cfg(not(unix))]
async fn symlink(_source: &Path, _target: &Path) -> Result<bool> {
    Ok(false)
}

/// Console text of a failed run.
fn failure_text(e: &SyncError) -> String {
    match e {
        SyncError::Compute(console) => console.clone(),
        other => other.to_string(),
    }
}

impl SyncEngine {
    /// Run a `compute` or `ddi-cdi` job and park its result under `job.key`.
    pub(super) async fn run_compute(&self, ctx: &JobContext, job: &mut Job) -> Result<()> {
        let res = if job.plugin == DDI_CDI_PLUGIN {
            self.ddi_cdi(ctx, job).await?
        } else {
            self.compute_script(ctx, job).await?
        };
        info!(
            persistent_id = %job.persistent_id,
            plugin = %job.plugin,
            failed = !res.error_message.is_empty(),
            "Computation done"
        );
        self.cache_compute_response(&res).await
    }

    async fn cache_compute_response(&self, res: &CachedComputeResponse) -> Result<()> {
        let raw = serde_json::to_string(res)?;
        self.store.set(&res.key, &raw, Some(self.config.result_ttl())).await?;
        Ok(())
    }

    async fn compute_script(&self, ctx: &JobContext, job: &mut Job) -> Result<CachedComputeResponse> {
        let mut res = CachedComputeResponse {
            key: job.key.clone(),
            ready: true,
            ..Default::default()
        };
        let script = match job.writable_nodes.keys().next() {
            Some(key) if job.writable_nodes.len() == 1 => key.clone(),
            _ => {
                job.writable_nodes.clear();
                res.error_message = COMPUTATION_FAILED.to_string();
                res.console_out = "file not found".to_string();
                return Ok(res);
            }
        };
        let Some(node) = job.writable_nodes.remove(&script) else {
            return Ok(res);
        };

        let outcome = match self.prepare_workspace(ctx, job).await {
            Ok(ws) => {
                let out = ctx.guard(self.compute.run(&ws.linked(), &[script.clone()])).await;
                ws.remove().await;
                out
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(console) => res.console_out = console,
            Err(e) if e.is_cancellation() => {
                job.writable_nodes.insert(script, node);
                return Err(e);
            }
            Err(e) => res.console_out = failure_text(&e),
        }
        Ok(res)
    }

    /// One conversion per selected CSV file; the documents are concatenated.
    async fn ddi_cdi(&self, ctx: &JobContext, job: &mut Job) -> Result<CachedComputeResponse> {
        let mut res = CachedComputeResponse {
            key: job.key.clone(),
            ready: true,
            ..Default::default()
        };
        let mut files: Vec<String> = job.writable_nodes.keys().cloned().collect();
        if files.is_empty() {
            res.error_message = COMPUTATION_FAILED.to_string();
            res.console_out = "no writable files found".to_string();
            return Ok(res);
        }
        files.sort();

        let ws = match self.prepare_workspace(ctx, job).await {
            Ok(ws) => ws,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                job.writable_nodes.clear();
                res.error_message = COMPUTATION_FAILED.to_string();
                res.console_out = failure_text(&e);
                return Ok(res);
            }
        };

        let mut outputs = Vec::new();
        let mut warnings = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let Some(node) = job.writable_nodes.remove(file) else {
                continue;
            };
            match self.convert_csv(ctx, job, &ws, file, i).await {
                Ok((document, console)) => {
                    if !console.trim().is_empty() {
                        warnings.push(format!("file {file}: {}", console.trim()));
                    }
                    outputs.push(document);
                }
                Err(e) if e.is_cancellation() => {
                    job.writable_nodes.insert(file.clone(), node);
                    ws.remove().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(persistent_id = %job.persistent_id, file = %file, error = %e, "CDI conversion failed");
                    warnings.push(format!("file {file}: {}", failure_text(&e).trim()));
                }
            }
        }
        ws.remove().await;

        if outputs.is_empty() {
            res.error_message = COMPUTATION_FAILED.to_string();
            res.console_out = if warnings.is_empty() {
                "no CDI output generated".to_string()
            } else {
                warnings.join("\n\n")
            };
        } else {
            res.ddi_cdi = outputs.join("\n");
            res.console_out = warnings.join("\n\n");
        }
        Ok(res)
    }

    async fn convert_csv(
        &self,
        ctx: &JobContext,
        job: &Job,
        ws: &Workspace,
        file: &str,
        index: usize,
    ) -> Result<(String, String)> {
        let csv = ws.linked().join(relative_path(file)?);
        let output = ws.work().join(format!("ddi-cdi-{index}.ttl"));
        let args = vec![
            self.config.ddi_cdi_script.clone(),
            "--csv".to_string(),
            csv.display().to_string(),
            "--dataset-pid".to_string(),
            job.persistent_id.clone(),
            "--output".to_string(),
            output.display().to_string(),
            "--skip-md5".to_string(),
            "--quiet".to_string(),
        ];
        let console = ctx.guard(self.compute.run(&ws.linked(), &args)).await?;
        let document = tokio::fs::read_to_string(&output).await?;
        Ok((document, console))
    }

    /// Lay the dataset's files out under a fresh workspace.
    async fn prepare_workspace(&self, ctx: &JobContext, job: &Job) -> Result<Workspace> {
        let name = if job.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            job.key.clone()
        };
        let ws = Workspace {
            root: Path::new(&self.config.workspace_root).join(relative_path(&name)?),
        };
        let linked = ws.linked();
        if tokio::fs::try_exists(&linked).await? {
            tokio::fs::remove_dir_all(&linked).await?;
        }
        tokio::fs::create_dir_all(&linked).await?;
        tokio::fs::create_dir_all(ws.work()).await?;

        let listing = ctx
            .guard(self.destination.query(&job.persistent_id, &job.dataverse_key, &job.user))
            .await;
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                ws.remove().await;
                return Err(e);
            }
        };
        for node in listing.values().filter(|n| n.is_file()) {
            if let Err(e) = ctx.guard(self.place_file(job, node, &linked)).await {
                ws.remove().await;
                return Err(e);
            }
        }
        debug!(persistent_id = %job.persistent_id, files = listing.len(), dir = %linked.display(), "Workspace ready");
        Ok(ws)
    }

    async fn place_file(&self, job: &Job, node: &Node, linked: &Path) -> Result<()> {
        let target = linked.join(relative_path(&node.id)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(source) = self.local_blob_path(job, node)? {
            if symlink(&source, &target).await? {
                return Ok(());
            }
        }
        let mut content = self.open_destination_content(job, node).await?;
        let mut file = tokio::fs::File::create(&target).await?;
        tokio::io::copy(&mut content, &mut file).await?;
        Ok(())
    }

    /// Path of a directly uploaded file in a blob store that has one.
    fn local_blob_path(&self, job: &Job, node: &Node) -> Result<Option<PathBuf>> {
        if !self.destination.is_direct_upload() {
            return Ok(None);
        }
        let location = StorageLocation::parse(
            &node.attributes.destination_file.storage_identifier,
            &self.config.storage.default_driver,
        );
        let store = self.blob_store(&location.driver)?;
        Ok(store.local_path(&trim_protocol(&job.persistent_id)?, &location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_rejects_escapes() {
        assert_eq!(relative_path("dir/a.csv").unwrap(), PathBuf::from("dir/a.csv"));
        assert!(relative_path("../etc/passwd").is_err());
        assert!(relative_path("/abs").is_err());
        assert!(relative_path("a/../../b").is_err());
        assert!(relative_path("").is_err());
    }

    #[test]
    fn test_failure_text_keeps_console() {
        assert_eq!(failure_text(&SyncError::Compute("out\n\nexit 1".into())), "out\n\nexit 1");
        assert!(failure_text(&SyncError::Destination("down".into())).contains("down"));
    }
}
