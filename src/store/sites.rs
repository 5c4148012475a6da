use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::store::OAuthPolicy;

/// Snapshots retained per site; the oldest is pruned on overflow.
pub const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteMetadata {
    pub subdomain: String,
    pub size: u64,
    pub deployed_at: DateTime<Utc>,
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
}

/// Summary view for list endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    pub subdomain: String,
    pub size: u64,
    pub deployed_at: DateTime<Utc>,
    pub file_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
}

impl From<&SiteMetadata> for SiteInfo {
    fn from(meta: &SiteMetadata) -> Self {
        Self {
            subdomain: meta.subdomain.clone(),
            size: meta.size,
            deployed_at: meta.deployed_at,
            file_count: meta.files.len(),
            oauth: meta.oauth.clone(),
            domains: meta.domains.clone(),
        }
    }
}

/// Sidecar record written next to each history snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: u32,
    pub deployed_at: DateTime<Utc>,
    pub size: u64,
}

/// Owns the sites, metadata and history trees under the data root. All
/// written files end up world-readable so the static server's uid can
/// serve them.
#[derive(Debug, Clone)]
pub struct SiteStore {
    data_dir: PathBuf,
}

impl SiteStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn sites_root(&self) -> PathBuf {
        self.data_dir.join("sites")
    }

    pub fn site_dir(&self, subdomain: &str) -> PathBuf {
        self.sites_root().join(subdomain)
    }

    fn metadata_path(&self, subdomain: &str) -> PathBuf {
        self.data_dir.join("metadata").join(format!("{}.json", subdomain))
    }

    fn history_dir(&self, subdomain: &str) -> PathBuf {
        self.data_dir.join("history").join(subdomain)
    }

    pub fn exists(&self, subdomain: &str) -> bool {
        self.metadata_path(subdomain).exists()
    }

    pub fn get_metadata(&self, subdomain: &str) -> Result<Option<SiteMetadata>> {
        let path = self.metadata_path(subdomain);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let meta = serde_json::from_str(&content)
            .with_context(|| format!("corrupt site metadata {}", path.display()))?;
        Ok(Some(meta))
    }

    /// All site metadata, most recently deployed first.
    pub fn list(&self) -> Result<Vec<SiteMetadata>> {
        let dir = self.data_dir.join("metadata");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut sites = Vec::new();
        for entry in fs::read_dir(&dir).context("failed to list site metadata")? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let meta: SiteMetadata = serde_json::from_str(&content)
                    .with_context(|| format!("corrupt site metadata {}", path.display()))?;
                sites.push(meta);
            }
        }
        sites.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
        Ok(sites)
    }

    /// Cheap structural check of an uploaded bundle, run before anything
    /// on disk is touched: the archive must parse and every entry must
    /// stay inside the extraction root.
    pub fn validate_bundle(zip_bytes: &[u8]) -> Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(zip_bytes)).context("invalid zip archive")?;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if !entry.is_dir() && entry.enclosed_name().is_none() {
                bail!("unsafe path in archive: {}", entry.name());
            }
        }
        Ok(())
    }

    /// Unpack a site bundle over the live directory, snapshotting the
    /// previous deployment first.
    pub fn extract_and_store(
        &self,
        subdomain: &str,
        zip_bytes: &[u8],
        oauth: Option<OAuthPolicy>,
    ) -> Result<SiteMetadata> {
        let live = self.site_dir(subdomain);
        let previous = self.get_metadata(subdomain)?;

        if live.exists() {
            self.snapshot_current(subdomain, previous.as_ref())?;
            fs::remove_dir_all(&live)
                .with_context(|| format!("failed to clear {}", live.display()))?;
        }
        fs::create_dir_all(&live).with_context(|| format!("failed to create {}", live.display()))?;

        let mut archive = ZipArchive::new(Cursor::new(zip_bytes)).context("invalid zip archive")?;
        let mut size: u64 = 0;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let relative = entry
                .enclosed_name()
                .with_context(|| format!("unsafe path in archive: {}", entry.name()))?;
            let target = live.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut contents)?;
            size += contents.len() as u64;
            fs::write(&target, &contents)
                .with_context(|| format!("failed to write {}", target.display()))?;
        }
        make_world_readable(&live)?;

        let meta = SiteMetadata {
            subdomain: subdomain.to_string(),
            size,
            deployed_at: Utc::now(),
            files: enumerate_files(&live)?,
            oauth: oauth.map(|p| p.normalized()),
            domains: previous.and_then(|p| p.domains),
        };
        self.write_metadata(&meta)?;
        Ok(meta)
    }

    /// Roll the live directory back to snapshot `version`, archiving the
    /// current deployment as a new snapshot first. The previous access
    /// policy carries over.
    pub fn rollback(&self, subdomain: &str, version: u32) -> Result<SiteMetadata> {
        let snapshot = self.history_dir(subdomain).join(format!("v{}", version));
        if !snapshot.is_dir() {
            bail!("version {} not found for site '{}'", version, subdomain);
        }
        let sidecar = self.read_version_info(subdomain, version)?;
        let previous = self.get_metadata(subdomain)?;

        let live = self.site_dir(subdomain);
        if live.exists() {
            self.snapshot_current(subdomain, previous.as_ref())?;
            fs::remove_dir_all(&live)
                .with_context(|| format!("failed to clear {}", live.display()))?;
        }
        copy_dir_all(&snapshot, &live)?;
        make_world_readable(&live)?;

        let meta = SiteMetadata {
            subdomain: subdomain.to_string(),
            size: sidecar.size,
            deployed_at: Utc::now(),
            files: enumerate_files(&live)?,
            oauth: previous.as_ref().and_then(|p| p.oauth.clone()),
            domains: previous.and_then(|p| p.domains),
        };
        self.write_metadata(&meta)?;
        Ok(meta)
    }

    /// Retained snapshot records, newest first.
    pub fn versions(&self, subdomain: &str) -> Result<Vec<VersionInfo>> {
        let dir = self.history_dir(subdomain);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for number in version_numbers(&dir)? {
            versions.push(self.read_version_info(subdomain, number)?);
        }
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    /// Re-zip the live directory, mirroring the unpack (files only).
    pub fn zip_site(&self, subdomain: &str) -> Result<Option<Vec<u8>>> {
        let live = self.site_dir(subdomain);
        if !self.exists(subdomain) || !live.is_dir() {
            return Ok(None);
        }

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6));

        for relative in enumerate_files(&live)? {
            let contents = fs::read(live.join(&relative))
                .with_context(|| format!("failed to read site file {}", relative))?;
            writer.start_file(relative, options)?;
            writer.write_all(&contents)?;
        }

        let cursor = writer.finish().context("failed to finalize zip")?;
        Ok(Some(cursor.into_inner()))
    }

    /// Replace or clear the stored access policy.
    pub fn update_oauth(
        &self,
        subdomain: &str,
        oauth: Option<OAuthPolicy>,
    ) -> Result<Option<SiteMetadata>> {
        let Some(mut meta) = self.get_metadata(subdomain)? else {
            return Ok(None);
        };
        meta.oauth = oauth.map(|p| p.normalized());
        self.write_metadata(&meta)?;
        Ok(Some(meta))
    }

    pub fn update_domains(
        &self,
        subdomain: &str,
        domains: Option<Vec<String>>,
    ) -> Result<Option<SiteMetadata>> {
        let Some(mut meta) = self.get_metadata(subdomain)? else {
            return Ok(None);
        };
        meta.domains = domains;
        self.write_metadata(&meta)?;
        Ok(Some(meta))
    }

    /// Remove the live directory and metadata. History is kept on purpose:
    /// snapshots survive an undeploy.
    pub fn delete(&self, subdomain: &str) -> Result<bool> {
        if !self.exists(subdomain) {
            return Ok(false);
        }
        let live = self.site_dir(subdomain);
        if live.exists() {
            fs::remove_dir_all(&live)
                .with_context(|| format!("failed to remove {}", live.display()))?;
        }
        fs::remove_file(self.metadata_path(subdomain))
            .with_context(|| format!("failed to remove metadata for '{}'", subdomain))?;
        Ok(true)
    }

    fn snapshot_current(&self, subdomain: &str, current: Option<&SiteMetadata>) -> Result<u32> {
        let history = self.history_dir(subdomain);
        fs::create_dir_all(&history)
            .with_context(|| format!("failed to create {}", history.display()))?;

        let version = version_numbers(&history)?.last().copied().unwrap_or(0) + 1;
        let live = self.site_dir(subdomain);
        let snapshot = history.join(format!("v{}", version));
        copy_dir_all(&live, &snapshot)?;

        let info = VersionInfo {
            version,
            deployed_at: current.map(|m| m.deployed_at).unwrap_or_else(Utc::now),
            size: match current {
                Some(meta) => meta.size,
                None => dir_size(&live)?,
            },
        };
        let sidecar = history.join(format!("v{}.json", version));
        fs::write(&sidecar, serde_json::to_string_pretty(&info)?)
            .with_context(|| format!("failed to write {}", sidecar.display()))?;

        self.prune_history(subdomain)?;
        Ok(version)
    }

    fn prune_history(&self, subdomain: &str) -> Result<()> {
        let history = self.history_dir(subdomain);
        let numbers = version_numbers(&history)?;
        if numbers.len() <= MAX_HISTORY {
            return Ok(());
        }
        for stale in &numbers[..numbers.len() - MAX_HISTORY] {
            let dir = history.join(format!("v{}", stale));
            let sidecar = history.join(format!("v{}.json", stale));
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to prune {}", dir.display()))?;
            let _ = fs::remove_file(sidecar);
        }
        Ok(())
    }

    fn read_version_info(&self, subdomain: &str, version: u32) -> Result<VersionInfo> {
        let path = self.history_dir(subdomain).join(format!("v{}.json", version));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("corrupt version record {}", path.display()))
    }

    fn write_metadata(&self, meta: &SiteMetadata) -> Result<()> {
        let path = self.metadata_path(&meta.subdomain);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Ascending snapshot numbers present in a history directory.
fn version_numbers(history: &Path) -> Result<Vec<u32>> {
    if !history.exists() {
        return Ok(Vec::new());
    }
    let mut numbers = Vec::new();
    for entry in fs::read_dir(history).context("failed to list history")? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(number) = name.strip_prefix('v').and_then(|n| n.parse::<u32>().ok()) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Relative paths of every file under `dir`, sorted, `/`-separated.
fn enumerate_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.context("failed to walk site directory")?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(dir)
                .context("walked file outside site directory")?;
            files.push(relative.to_string_lossy().to_string());
        }
    }
    files.sort_unstable();
    Ok(files)
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.context("failed to walk site directory")?;
        if entry.file_type().is_file() {
            total += entry.metadata().context("failed to stat site file")?.len();
        }
    }
    Ok(total)
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy to {}", target.display()))?;
        }
    }
    Ok(())
}

/// 0o755 on directories and 0o644 on files so the static server, running
/// as its own uid, can read everything.
fn make_world_readable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.context("failed to walk site directory")?;
        let mode = if entry.file_type().is_dir() { 0o755 } else { 0o644 };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to chmod {}", entry.path().display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, contents) in files {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn store() -> (tempfile::TempDir, SiteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn extracts_files_and_records_metadata() {
        let (_dir, store) = store();
        let bundle = zip_of(&[("index.html", b"<h1>hi</h1>"), ("a/b.html", b"nested")]);

        let meta = store.extract_and_store("s1", &bundle, None).unwrap();
        assert_eq!(meta.subdomain, "s1");
        assert_eq!(meta.size, 17);
        assert_eq!(meta.files, vec!["a/b.html", "index.html"]);

        let live = store.site_dir("s1");
        assert_eq!(fs::read(live.join("index.html")).unwrap(), b"<h1>hi</h1>");
        assert_eq!(fs::read(live.join("a/b.html")).unwrap(), b"nested");

        let mode = fs::metadata(live.join("index.html")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        let mode = fs::metadata(live.join("a")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn rejects_zip_slip_entries() {
        let (_dir, store) = store();
        let bundle = zip_of(&[("../escape.html", b"nope")]);
        assert!(store.extract_and_store("s1", &bundle, None).is_err());
    }

    #[test]
    fn redeploy_snapshots_the_previous_version() {
        let (_dir, store) = store();
        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"v1")]), None)
            .unwrap();
        assert!(store.versions("s1").unwrap().is_empty());

        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"v2")]), None)
            .unwrap();
        let versions = store.versions("s1").unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 1);

        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"v3")]), None)
            .unwrap();
        let versions = store.versions("s1").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
    }

    #[test]
    fn history_is_capped() {
        let (_dir, store) = store();
        for round in 0..(MAX_HISTORY + 5) {
            let body = format!("round {}", round);
            store
                .extract_and_store("s1", &zip_of(&[("index.html", body.as_bytes())]), None)
                .unwrap();
        }
        let versions = store.versions("s1").unwrap();
        assert_eq!(versions.len(), MAX_HISTORY);
        assert_eq!(versions[0].version, MAX_HISTORY as u32 + 4);
        assert_eq!(versions.last().unwrap().version, 5);
    }

    #[test]
    fn rollback_restores_bytes_and_keeps_policy() {
        let (_dir, store) = store();
        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"first")]), None)
            .unwrap();

        let policy = OAuthPolicy {
            allowed_domain: Some("x.com".to_string()),
            ..Default::default()
        };
        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"second")]), Some(policy.clone()))
            .unwrap();

        let meta = store.rollback("s1", 1).unwrap();
        assert_eq!(meta.oauth, Some(policy));
        assert_eq!(
            fs::read(store.site_dir("s1").join("index.html")).unwrap(),
            b"first"
        );

        // rollback archived "second" as v2
        let versions = store.versions("s1").unwrap();
        assert_eq!(versions.len(), 2);

        let err = store.rollback("s1", 99).unwrap_err().to_string();
        assert!(err.contains("not found"));
    }

    #[test]
    fn zip_round_trip_preserves_contents() {
        let (_dir, store) = store();
        let files: Vec<(&str, &[u8])> = vec![
            ("index.html", b"<h1>hello</h1>" as &[u8]),
            ("assets/app.js", b"console.log(1)"),
            ("assets/deep/style.css", b"body{}"),
        ];
        store.extract_and_store("s1", &zip_of(&files), None).unwrap();

        let exported = store.zip_site("s1").unwrap().unwrap();
        store.extract_and_store("s2", &exported, None).unwrap();

        let mut expected = BTreeMap::new();
        for (name, contents) in &files {
            expected.insert(name.to_string(), contents.to_vec());
        }
        for (name, contents) in expected {
            assert_eq!(fs::read(store.site_dir("s2").join(name)).unwrap(), contents);
        }
        assert_eq!(
            store.get_metadata("s1").unwrap().unwrap().files,
            store.get_metadata("s2").unwrap().unwrap().files
        );
    }

    #[test]
    fn delete_keeps_history() {
        let (_dir, store) = store();
        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"v1")]), None)
            .unwrap();
        store
            .extract_and_store("s1", &zip_of(&[("index.html", b"v2")]), None)
            .unwrap();

        assert!(store.delete("s1").unwrap());
        assert!(!store.exists("s1"));
        assert!(!store.site_dir("s1").exists());
        assert_eq!(store.versions("s1").unwrap().len(), 1);

        assert!(!store.delete("s1").unwrap());
    }

    #[test]
    fn list_sorts_by_deployment_time_descending() {
        let (_dir, store) = store();
        store
            .extract_and_store("older", &zip_of(&[("index.html", b"a")]), None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .extract_and_store("newer", &zip_of(&[("index.html", b"b")]), None)
            .unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed[0].subdomain, "newer");
        assert_eq!(listed[1].subdomain, "older");
    }
}
