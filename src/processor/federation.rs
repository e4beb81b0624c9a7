//! Federated "code-island" module mirroring.
//!
//! A code-island's loader JSON points at a WF manifest, which points at a
//! module-federation (MF) manifest, which enumerates every chunk the remote
//! module can load. All three plus the chunks are mirrored into a
//! deterministic `code-components/{host}/{path}` layout and rewritten so
//! playback never touches the network.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Loader tag identifying a federated module.
const FEDERATION_TAG: &str = "FEDERATION";

/// Default MF manifest name when the WF manifest omits `entry`.
const DEFAULT_MF_ENTRY: &str = "mf-manifest.json";

// The MF manifest is modeled as a typed tree; unknown fields ride along in
// the flattened maps so a rewrite round-trips everything it does not touch.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MfManifest {
    meta_data: MfMetaData,
    exposes: Vec<MfModule>,
    shared: Vec<MfModule>,
    remotes: Vec<MfModule>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MfMetaData {
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_entry: Option<MfRemoteEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_path: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MfRemoteEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MfModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    assets: Option<MfAssets>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MfAssets {
    js: MfAssetGroup,
    css: MfAssetGroup,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MfAssetGroup {
    sync: Vec<String>,
    #[serde(rename = "async")]
    async_: Vec<String>,
}

/// Per-crawl federated-module mirror with an at-most-once cache per source
/// URL.
pub struct FederationMirror {
    client: Client,
    output_dir: PathBuf,
    /// clientModuleUrl → local WF manifest path (`/code-components/...`).
    cache: DashMap<String, String>,
}

impl FederationMirror {
    #[must_use]
    pub fn new(client: Client, output_dir: PathBuf) -> Self {
        Self {
            client,
            output_dir,
            cache: DashMap::new(),
        }
    }

    /// Number of distinct modules mirrored so far.
    #[must_use]
    pub fn mirrored_count(&self) -> usize {
        self.cache.len()
    }

    /// Inspect a `data-loader` JSON value; when it describes a federated
    /// module, mirror the module and return the rewritten loader JSON.
    /// Non-federation loaders return `None`.
    pub async fn mirror_loader(&self, loader_json: &str, page_url: &Url) -> Result<Option<String>> {
        let mut loader: Value = match serde_json::from_str(loader_json) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        let tag = loader.get("tag").and_then(Value::as_str);
        if tag != Some(FEDERATION_TAG) {
            return Ok(None);
        }
        let Some(client_module_url) = loader
            .get("val")
            .and_then(|v| v.get("clientModuleUrl"))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };

        let wf_url = page_url
            .join(client_module_url)
            .with_context(|| format!("invalid clientModuleUrl {client_module_url:?}"))?;

        let local = match self.cache.get(wf_url.as_str()) {
            Some(cached) => cached.clone(),
            None => {
                let local = self.mirror_module(&wf_url).await?;
                self.cache.insert(wf_url.as_str().to_string(), local.clone());
                local
            }
        };

        if let Some(val) = loader.get_mut("val").and_then(Value::as_object_mut) {
            val.insert("clientModuleUrl".to_string(), Value::String(local));
        }
        Ok(Some(serde_json::to_string(&loader)?))
    }

    /// Mirror WF manifest, MF manifest, and every referenced chunk.
    /// Returns the local WF manifest path prefixed with `/`.
    async fn mirror_module(&self, wf_url: &Url) -> Result<String> {
        // 1. WF manifest, mirrored verbatim: its entry reference is
        // relative and the MF manifest lands beside it.
        let wf_bytes = self.fetch(wf_url).await?;
        let wf_rel = mirror_rel_path(wf_url)?;
        self.write_file(&wf_rel, &wf_bytes).await?;

        let wf_manifest: Value = serde_json::from_slice(&wf_bytes)
            .with_context(|| format!("WF manifest at {wf_url} is not JSON"))?;
        let entry = wf_manifest
            .get("entry")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MF_ENTRY);

        // 2. MF manifest next to the WF manifest.
        let mf_url = wf_url
            .join(entry)
            .with_context(|| format!("invalid MF entry {entry:?}"))?;
        let mf_bytes = self.fetch(&mf_url).await?;
        let mut mf_manifest: MfManifest = serde_json::from_slice(&mf_bytes)
            .with_context(|| format!("MF manifest at {mf_url} is not JSON"))?;

        // 3. Resolve chunk references against the advertised publicPath,
        // falling back to the MF manifest's own URL.
        let public_base = mf_manifest
            .meta_data
            .public_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .and_then(|p| Url::parse(p).ok())
            .unwrap_or_else(|| mf_url.clone());

        for asset_ref in collect_asset_refs(&mf_manifest) {
            let resolved = match public_base.join(&asset_ref) {
                Ok(url) => url,
                Err(_) => {
                    log::warn!("Skipping unresolvable MF asset ref {asset_ref:?}");
                    continue;
                }
            };
            match self.fetch(&resolved).await {
                Ok(bytes) => {
                    let rel = mirror_rel_path(&resolved)?;
                    self.write_file(&rel, &bytes).await?;
                }
                Err(e) => log::warn!("Failed to mirror MF asset {resolved}: {e:#}"),
            }
        }

        // 4. Rewrite the MF manifest: publicPath points into the local
        // layout; absolute refs become local paths; relative refs already
        // resolve against the rewritten publicPath.
        let local_public_prefix = local_prefix_for(&public_base)?;
        mf_manifest.meta_data.public_path = Some(local_public_prefix);
        rewrite_absolute_refs(&mut mf_manifest)?;

        let mf_rel = mirror_rel_path(&mf_url)?;
        let mf_out = serde_json::to_vec(&mf_manifest)?;
        self.write_file(&mf_rel, &mf_out).await?;

        Ok(format!("/{}", path_to_forward_slashes(&wf_rel)))
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!("fetch of {url} returned status {}", response.status()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write_file(&self, rel: &Path, bytes: &[u8]) -> Result<()> {
        let path = self.output_dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create mirror directory")?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Deterministic mirror location for a remote URL:
/// `code-components/{host}/{percent-decoded path}`.
fn mirror_rel_path(url: &Url) -> Result<PathBuf> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL {url} has no host"))?;
    let decoded = urlencoding::decode(url.path()).unwrap_or_else(|_| url.path().into());

    let mut path = PathBuf::from("code-components");
    path.push(sanitize_filename::sanitize(host));
    for seg in decoded.trim_matches('/').split('/') {
        if seg.is_empty() || seg == ".." {
            continue;
        }
        path.push(sanitize_filename::sanitize(seg));
    }
    Ok(path)
}

/// Local directory prefix (with trailing slash) a public path maps to.
fn local_prefix_for(public_base: &Url) -> Result<String> {
    // The public path names a directory; resolve a probe file and take its
    // mirrored parent.
    let probe = public_base
        .join("__probe__")
        .context("invalid public path")?;
    let rel = mirror_rel_path(&probe)?;
    let dir = rel.parent().unwrap_or(&rel);
    Ok(format!("/{}/", path_to_forward_slashes(dir)))
}

fn path_to_forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Every asset reference an MF manifest can carry.
fn collect_asset_refs(manifest: &MfManifest) -> Vec<String> {
    let mut refs = Vec::new();

    if let Some(remote_entry) = &manifest.meta_data.remote_entry {
        let name = &remote_entry.name;
        let joined = match remote_entry.path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => format!("{}/{}", path.trim_end_matches('/'), name),
            None => name.clone(),
        };
        refs.push(joined);
    }

    for module in manifest
        .exposes
        .iter()
        .chain(&manifest.shared)
        .chain(&manifest.remotes)
    {
        if let Some(assets) = &module.assets {
            for group in [&assets.js, &assets.css] {
                refs.extend(group.sync.iter().cloned());
                refs.extend(group.async_.iter().cloned());
            }
        }
    }

    refs.retain(|r| !r.is_empty());
    refs.sort();
    refs.dedup();
    refs
}

/// Rewrite absolute http(s) refs inside the manifest to their mirrored
/// local paths; relative refs are left for the rewritten publicPath.
fn rewrite_absolute_refs(manifest: &mut MfManifest) -> Result<()> {
    let rewrite = |item: &mut String| {
        if let Ok(url) = Url::parse(item) {
            if matches!(url.scheme(), "http" | "https") {
                if let Ok(rel) = mirror_rel_path(&url) {
                    *item = format!("/{}", path_to_forward_slashes(&rel));
                }
            }
        }
    };

    for module in manifest
        .exposes
        .iter_mut()
        .chain(manifest.shared.iter_mut())
        .chain(manifest.remotes.iter_mut())
    {
        if let Some(assets) = &mut module.assets {
            for group in [&mut assets.js, &mut assets.css] {
                group.sync.iter_mut().for_each(rewrite);
                group.async_.iter_mut().for_each(rewrite);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_path_decodes_and_sanitizes() {
        let url = Url::parse("https://cdn.example.com/modules%2Fwidget/wf.json").unwrap();
        let rel = mirror_rel_path(&url).unwrap();
        assert_eq!(
            rel,
            PathBuf::from("code-components/cdn.example.com/modules/widget/wf.json")
        );
    }

    #[test]
    fn local_prefix_points_into_mirror_layout() {
        let base = Url::parse("https://cdn.example.com/widget/v2/").unwrap();
        let prefix = local_prefix_for(&base).unwrap();
        assert_eq!(prefix, "/code-components/cdn.example.com/widget/v2/");
    }

    #[test]
    fn collects_all_asset_groups() {
        let manifest: MfManifest = serde_json::from_str(
            r#"{
                "metaData": {"remoteEntry": {"name": "remoteEntry.js"}, "publicPath": "https://cdn.example.com/w/"},
                "exposes": [{"assets": {"js": {"sync": ["js/a.js"], "async": ["js/b.js"]},
                                         "css": {"sync": ["css/a.css"], "async": []}}}],
                "shared": [{"assets": {"js": {"sync": ["js/shared.js"], "async": []},
                                        "css": {"sync": [], "async": []}}}],
                "remotes": []
            }"#,
        )
        .unwrap();
        let refs = collect_asset_refs(&manifest);
        assert_eq!(
            refs,
            vec!["css/a.css", "js/a.js", "js/b.js", "js/shared.js", "remoteEntry.js"]
        );
    }

    #[test]
    fn manifest_roundtrip_preserves_unknown_fields() {
        let raw = r#"{"id":"widget","metaData":{"publicPath":"auto","custom":1},"exposes":[],"shared":[],"remotes":[]}"#;
        let manifest: MfManifest = serde_json::from_str(raw).unwrap();
        let out = serde_json::to_value(&manifest).unwrap();
        assert_eq!(out["id"], "widget");
        assert_eq!(out["metaData"]["custom"], 1);
    }
}
