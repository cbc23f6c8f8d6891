//! Storage staging: fetch artifact/volume tarballs and unpack them in the
//! guest before the agent starts.
//!
//! Snapshots are content-addressed tarballs. Each one is downloaded on the
//! host (pre-signed URL when the manifest carries one, platform fetch
//! otherwise), written to a guest staging path over vsock, and extracted
//! under its mount path in-guest. Independent snapshots stage in parallel.

use std::time::Duration;

use futures_util::future::join_all;
use reqwest::{Method, StatusCode};
use sandbox::{ExecRequest, Sandbox};
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::http::HttpClient;
use crate::paths::guest;
use crate::types::{ExecutionContext, StorageManifest};

/// Timeout for the in-guest extract command.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(300);

struct StageItem {
    label: String,
    name: String,
    version_id: String,
    mount_path: String,
    archive_url: Option<String>,
    optional: bool,
}

fn stage_items(manifest: &StorageManifest) -> Vec<StageItem> {
    let mut items = Vec::with_capacity(manifest.volumes.len() + 1);
    if let Some(artifact) = &manifest.artifact {
        items.push(StageItem {
            label: format!("artifact/{}", artifact.name),
            name: artifact.name.clone(),
            version_id: artifact.version_id.clone(),
            mount_path: artifact.mount_path.clone(),
            archive_url: artifact.archive_url.clone(),
            optional: false,
        });
    }
    for volume in &manifest.volumes {
        items.push(StageItem {
            label: format!("volume/{}", volume.name),
            name: volume.name.clone(),
            version_id: volume.version_id.clone(),
            mount_path: volume.mount_path.clone(),
            archive_url: volume.archive_url.clone(),
            optional: volume.optional,
        });
    }
    items
}

/// Stage every snapshot in the manifest into the guest, in parallel.
pub async fn stage_all(
    sandbox: &dyn Sandbox,
    http: &HttpClient,
    context: &ExecutionContext,
    manifest: &StorageManifest,
) -> RunnerResult<()> {
    let items = stage_items(manifest);
    if items.is_empty() {
        return Ok(());
    }
    info!(run_id = %context.run_id, count = items.len(), "staging storage snapshots");

    let results = join_all(
        items
            .iter()
            .enumerate()
            .map(|(index, item)| stage_one(sandbox, http, context, item, index)),
    )
    .await;

    results.into_iter().collect()
}

async fn stage_one(
    sandbox: &dyn Sandbox,
    http: &HttpClient,
    context: &ExecutionContext,
    item: &StageItem,
    index: usize,
) -> RunnerResult<()> {
    let Some(tarball) = fetch_archive(http, context, item).await? else {
        debug!(run_id = %context.run_id, label = %item.label, "optional snapshot absent, skipping");
        return Ok(());
    };

    let staging_path = format!("{}/{index}.tar.gz", guest::STAGING_DIR);
    sandbox.write_file(&staging_path, &tarball).await?;

    let cmd = format!(
        "mkdir -p {mount} && tar -xzf {tmp} -C {mount} && rm -f {tmp}",
        mount = shell_quote(&item.mount_path),
        tmp = shell_quote(&staging_path),
    );
    let result = sandbox
        .exec(&ExecRequest {
            cmd: &cmd,
            timeout: EXTRACT_TIMEOUT,
        })
        .await?;

    if result.exit_code != 0 {
        return Err(RunnerError::StorageFetch(format!(
            "{}: extract failed: {}",
            item.label,
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    info!(run_id = %context.run_id, label = %item.label, mount = %item.mount_path, "snapshot staged");
    Ok(())
}

/// Download one snapshot. `Ok(None)` when an optional snapshot does not
/// exist upstream.
async fn fetch_archive(
    http: &HttpClient,
    context: &ExecutionContext,
    item: &StageItem,
) -> RunnerResult<Option<Vec<u8>>> {
    let request = match &item.archive_url {
        Some(url) => http.get_raw(url),
        None => {
            let path = format!("/storage/{}/versions/{}/archive", item.name, item.version_id);
            http.request(Method::GET, &path, &context.sandbox_token)
        }
    };

    let response = request
        .timeout(Duration::from_secs(120))
        .send()
        .await
        .map_err(|e| RunnerError::StorageFetch(format!("{}: {e}", item.label)))?;

    if response.status() == StatusCode::NOT_FOUND && item.optional {
        return Ok(None);
    }
    let status = response.status();
    if !status.is_success() {
        return Err(RunnerError::StorageFetch(format!(
            "{}: download returned {status}",
            item.label
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| RunnerError::StorageFetch(format!("{}: body: {e}", item.label)))?;
    Ok(Some(bytes.to_vec()))
}

/// Single-quote a path for the in-guest shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArtifactEntry, VolumeEntry};

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/plain/path"), "'/plain/path'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn artifact_stages_before_volumes() {
        let manifest = StorageManifest {
            artifact: Some(ArtifactEntry {
                name: "app".into(),
                version_id: "v1".into(),
                mount_path: "/workspace".into(),
                archive_url: None,
            }),
            volumes: vec![
                VolumeEntry {
                    name: "cache".into(),
                    version_id: "v2".into(),
                    mount_path: "/cache".into(),
                    optional: true,
                    archive_url: Some("https://blobs/x".into()),
                },
                VolumeEntry {
                    name: "data".into(),
                    version_id: "v3".into(),
                    mount_path: "/data".into(),
                    optional: false,
                    archive_url: None,
                },
            ],
        };
        let items = stage_items(&manifest);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].label, "artifact/app");
        assert!(!items[0].optional);
        assert_eq!(items[1].label, "volume/cache");
        assert!(items[1].optional);
        assert_eq!(items[2].mount_path, "/data");
    }

    #[test]
    fn empty_manifest_stages_nothing() {
        let manifest = StorageManifest {
            artifact: None,
            volumes: Vec::new(),
        };
        assert!(stage_items(&manifest).is_empty());
    }
}
