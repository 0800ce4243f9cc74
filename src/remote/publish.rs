//! Publishing local artifacts to the remote destination.

use super::{ObjectUri, RemoteFilesystem};
use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Key listing of a published store, written after every other object.
pub const MANIFEST_FILE: &str = ".manifest.json";

const NODE_METADATA_FILE: &str = "zarr.json";

/// Keys (relative to the store root) of one publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub keys: Vec<String>,
    pub published_at: DateTime<Utc>,
}

/// Upload a local store under `remote`, replacing what was published there.
///
/// Every local file is uploaded before anything is removed: child objects
/// first, then the root `zarr.json` (carrying inline consolidated metadata
/// when `consolidated` is set), then the new manifest. Only then are keys of
/// the previous manifest that are not part of this publication deleted, so a
/// failed republish leaves the previous store readable.
pub async fn publish_store(
    fs: &RemoteFilesystem,
    local: &Path,
    remote: &ObjectUri,
    consolidated: bool,
) -> PipelineResult<Manifest> {
    let manifest_uri = remote.join(MANIFEST_FILE);
    let files = local_files(local)?;
    let previous = previous_manifest(fs, &manifest_uri).await?;

    let mut keys = Vec::with_capacity(files.len());
    let mut nodes = Map::new();
    let mut root_metadata = None;

    for (key, path) in &files {
        let bytes = tokio::fs::read(path).await?;
        if key == NODE_METADATA_FILE {
            root_metadata = Some(bytes);
            continue;
        }

        if consolidated {
            if let Some(node) = key.strip_suffix(&format!("/{}", NODE_METADATA_FILE)) {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        nodes.insert(node.to_string(), value);
                    }
                    Err(e) => warn!("Skipping unreadable metadata {}: {}", path.display(), e),
                }
            }
        }

        fs.put(&remote.join(key), &bytes).await?;
        keys.push(key.clone());
    }

    match root_metadata {
        Some(bytes) => {
            let bytes = if consolidated {
                consolidate(&bytes, nodes, remote)?
            } else {
                bytes
            };
            fs.put(&remote.join(NODE_METADATA_FILE), &bytes).await?;
            keys.push(NODE_METADATA_FILE.to_string());
        }
        None if consolidated => warn!(
            "{} has no root {}; nothing to consolidate",
            local.display(),
            NODE_METADATA_FILE
        ),
        None => {}
    }

    let manifest = Manifest {
        keys,
        published_at: Utc::now(),
    };
    let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| {
        PipelineError::remote(manifest_uri.to_string(), format!("Failed to encode manifest: {}", e))
    })?;
    fs.put(&manifest_uri, &bytes).await?;

    if let Some(previous) = previous {
        let current: HashSet<&str> = manifest.keys.iter().map(String::as_str).collect();
        let stale: Vec<&String> = previous
            .keys
            .iter()
            .filter(|key| !current.contains(key.as_str()))
            .collect();
        debug!("Removing {} stale keys under {}", stale.len(), remote);
        for key in stale {
            fs.delete(&remote.join(key)).await?;
        }
    }

    info!("Published {} objects to {}", manifest.keys.len(), remote);
    Ok(manifest)
}

async fn previous_manifest(
    fs: &RemoteFilesystem,
    manifest_uri: &ObjectUri,
) -> PipelineResult<Option<Manifest>> {
    let Some(bytes) = fs.get(manifest_uri).await? else {
        debug!("No previous publication at {}", manifest_uri);
        return Ok(None);
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        PipelineError::remote(manifest_uri.to_string(), format!("Invalid manifest: {}", e))
    })
}

/// Root group metadata with the child nodes inlined as
/// `consolidated_metadata`, keyed by node path.
fn consolidate(root: &[u8], nodes: Map<String, Value>, remote: &ObjectUri) -> PipelineResult<Vec<u8>> {
    let context = remote.join(NODE_METADATA_FILE).to_string();
    let mut document: Value = serde_json::from_slice(root)
        .map_err(|e| PipelineError::malformed(&context, e.to_string()))?;
    let Some(object) = document.as_object_mut() else {
        return Err(PipelineError::malformed(&context, "root metadata is not a JSON object"));
    };

    object.insert(
        "consolidated_metadata".to_string(),
        json!({
            "kind": "inline",
            "must_understand": false,
            "metadata": Value::Object(nodes),
        }),
    );
    serde_json::to_vec_pretty(&document)
        .map_err(|e| PipelineError::malformed(&context, e.to_string()))
}

/// Every file under `root` as `(key, path)`, keys `/`-separated and sorted.
fn local_files(root: &Path) -> PipelineResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| PipelineError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PipelineError::store(entry.path(), e))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((key, entry.path().to_path_buf()));
    }
    Ok(files)
}

/// A local directory paired with a remote prefix; every artifact is written
/// to both, local first.
#[derive(Debug)]
pub struct DualDestination<'a> {
    local_dir: PathBuf,
    remote_base: ObjectUri,
    fs: &'a RemoteFilesystem,
    consolidated: bool,
}

impl<'a> DualDestination<'a> {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        remote_base: ObjectUri,
        fs: &'a RemoteFilesystem,
        consolidated: bool,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            remote_base,
            fs,
            consolidated,
        }
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.local_dir.join(name)
    }

    pub fn remote_uri(&self, name: &str) -> ObjectUri {
        self.remote_base.join(name)
    }

    /// Write a store locally with `write_local`, then publish that copy.
    pub async fn write_store<F>(&self, name: &str, write_local: F) -> PipelineResult<ObjectUri>
    where
        F: FnOnce(&Path) -> PipelineResult<()>,
    {
        let local = self.local_path(name);
        let remote = self.remote_uri(name);

        write_local(&local)?;
        info!("Wrote {}", local.display());

        publish_store(self.fs, &local, &remote, self.consolidated)
            .await
            .map_err(|e| partial_write(&local, &remote, e))?;
        Ok(remote)
    }

    /// Write the same bytes to the local file and the remote object.
    pub async fn write_bytes(&self, name: &str, bytes: &[u8]) -> PipelineResult<ObjectUri> {
        let local = self.local_path(name);
        let remote = self.remote_uri(name);

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, bytes).await?;
        info!("Wrote {} ({} bytes)", local.display(), bytes.len());

        self.fs
            .put(&remote, bytes)
            .await
            .map_err(|e| partial_write(&local, &remote, e))?;
        Ok(remote)
    }
}

fn partial_write(local: &Path, remote: &ObjectUri, error: PipelineError) -> PipelineError {
    PipelineError::PartialWrite {
        local: local.display().to_string(),
        remote: remote.to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_fake_store(root: &Path, with_chunk: bool) {
        fs::create_dir_all(root.join("states/c")).unwrap();
        fs::write(root.join("zarr.json"), r#"{"zarr_format":3,"node_type":"group"}"#).unwrap();
        fs::write(
            root.join("states/zarr.json"),
            r#"{"zarr_format":3,"node_type":"array","shape":[1,2]}"#,
        )
        .unwrap();
        if with_chunk {
            fs::write(root.join("states/c/0"), [1u8, 2, 3]).unwrap();
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_publish_store_writes_manifest_last() {
        let local = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        write_fake_store(local.path(), true);

        let store = RemoteFilesystem::mirror(bucket.path(), "bucket").unwrap();
        let remote = ObjectUri::parse("s3://bucket/groups/avg.zarr").unwrap();

        let manifest =
            tokio_test::block_on(publish_store(&store, local.path(), &remote, true)).unwrap();

        // Root metadata goes up after its children
        assert_eq!(
            manifest.keys,
            vec![
                "states/c/0".to_string(),
                "states/zarr.json".to_string(),
                "zarr.json".to_string(),
            ]
        );

        let published = bucket.path().join("bucket/groups/avg.zarr");
        assert_eq!(fs::read(published.join("states/c/0")).unwrap(), vec![1, 2, 3]);

        let root = read_json(&published.join("zarr.json"));
        assert_eq!(root["node_type"], "group");
        let consolidated = &root["consolidated_metadata"];
        assert_eq!(consolidated["kind"], "inline");
        assert_eq!(consolidated["must_understand"], false);
        assert_eq!(consolidated["metadata"]["states"]["node_type"], "array");
        assert_eq!(consolidated["metadata"]["states"]["shape"], json!([1, 2]));
        assert_eq!(consolidated["metadata"].as_object().unwrap().len(), 1);

        // The local copy is left untouched
        let local_root = read_json(&local.path().join("zarr.json"));
        assert!(local_root.get("consolidated_metadata").is_none());

        let stored: Manifest =
            serde_json::from_slice(&fs::read(published.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(stored, manifest);
    }

    #[test]
    fn test_publish_without_consolidation_copies_root() {
        let local = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        write_fake_store(local.path(), false);

        let store = RemoteFilesystem::mirror(bucket.path(), "bucket").unwrap();
        let remote = ObjectUri::parse("s3://bucket/avg.zarr").unwrap();
        tokio_test::block_on(publish_store(&store, local.path(), &remote, false)).unwrap();

        let published = bucket.path().join("bucket/avg.zarr/zarr.json");
        assert_eq!(
            fs::read(published).unwrap(),
            fs::read(local.path().join("zarr.json")).unwrap()
        );
    }

    #[test]
    fn test_republish_removes_stale_keys() {
        let bucket = TempDir::new().unwrap();
        let store = RemoteFilesystem::mirror(bucket.path(), "bucket").unwrap();
        let remote = ObjectUri::parse("s3://bucket/avg.zarr").unwrap();
        let published = bucket.path().join("bucket/avg.zarr");

        let first = TempDir::new().unwrap();
        write_fake_store(first.path(), true);
        tokio_test::block_on(publish_store(&store, first.path(), &remote, true)).unwrap();
        assert!(published.join("states/c/0").is_file());

        let second = TempDir::new().unwrap();
        write_fake_store(second.path(), false);
        let manifest =
            tokio_test::block_on(publish_store(&store, second.path(), &remote, true)).unwrap();

        assert!(!published.join("states/c/0").exists());
        assert!(published.join("states/zarr.json").is_file());
        assert!(published.join("zarr.json").is_file());
        assert_eq!(manifest.keys, vec!["states/zarr.json", "zarr.json"]);
    }

    #[test]
    fn test_failed_republish_keeps_previous_store() {
        let local = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        write_fake_store(local.path(), true);

        let store = RemoteFilesystem::mirror(bucket.path(), "bucket").unwrap();
        let remote = ObjectUri::parse("s3://bucket/avg.zarr").unwrap();
        let first =
            tokio_test::block_on(publish_store(&store, local.path(), &remote, true)).unwrap();

        let missing = local.path().join("does-not-exist.zarr");
        let result = tokio_test::block_on(publish_store(&store, &missing, &remote, true));
        assert!(result.is_err());

        let published = bucket.path().join("bucket/avg.zarr");
        assert!(published.join("zarr.json").is_file());
        assert!(published.join("states/zarr.json").is_file());
        assert_eq!(fs::read(published.join("states/c/0")).unwrap(), vec![1, 2, 3]);
        let stored: Manifest =
            serde_json::from_slice(&fs::read(published.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(stored, first);
    }

    #[test]
    fn test_write_bytes_is_identical() {
        let local = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        let store = RemoteFilesystem::mirror(bucket.path(), "bucket").unwrap();
        let dest = DualDestination::new(
            local.path().join("out"),
            ObjectUri::parse("s3://bucket/groups").unwrap(),
            &store,
            true,
        );

        let payload = b"PAR1 not really parquet PAR1";
        let uri = tokio_test::block_on(dest.write_bytes("x_q1.parquet", payload)).unwrap();

        assert_eq!(uri.to_string(), "s3://bucket/groups/x_q1.parquet");
        let local_bytes = fs::read(local.path().join("out/x_q1.parquet")).unwrap();
        let remote_bytes = fs::read(bucket.path().join("bucket/groups/x_q1.parquet")).unwrap();
        assert_eq!(local_bytes, payload.to_vec());
        assert_eq!(local_bytes, remote_bytes);
    }

    #[test]
    fn test_remote_failure_is_partial_write() {
        let local = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let store = RemoteFilesystem::mirror(scratch.path(), "bucket").unwrap();

        // A regular file where the bucket directory should be
        let blocked = scratch.path().join("bucket");
        fs::remove_dir_all(&blocked).unwrap();
        fs::write(&blocked, "x").unwrap();

        let dest = DualDestination::new(
            local.path(),
            ObjectUri::parse("s3://bucket/groups").unwrap(),
            &store,
            true,
        );

        let result = tokio_test::block_on(dest.write_bytes("x_q1.parquet", b"data"));
        assert!(matches!(result, Err(PipelineError::PartialWrite { .. })));
        // The local copy stays in place
        assert!(local.path().join("x_q1.parquet").is_file());
    }
}
