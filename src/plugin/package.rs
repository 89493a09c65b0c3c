//! Package reading, verification and building.
//!
//! A package is a gzip-compressed tar archive with a mandatory
//! `manifest.json`. Every other regular file is payload. The whole archive
//! is read into memory and verified before anything touches the disk; only a
//! verified payload is extracted, into a fresh scratch directory per load.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::signing::{self, TrustedKeys};
use super::{
    ConfigSchema, EntrypointKind, PluginError, PluginManifest, PluginResult, MANIFEST_FILE,
    SCHEMA_FILE,
};

/// Settings for [`PackageReader`].
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Upper bound on both the archive size and its unpacked size.
    pub max_package_bytes: u64,
    /// Reject unsigned packages.
    pub require_signatures: bool,
    /// Keys accepted for package signatures.
    pub trusted_keys: TrustedKeys,
    /// Parent directory of per-load scratch directories.
    pub scratch_dir: PathBuf,
    /// Bound on reading, verifying and extracting one package.
    pub io_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_package_bytes: 64 * 1024 * 1024,
            require_signatures: true,
            trusted_keys: TrustedKeys::new(),
            scratch_dir: std::env::temp_dir().join("caphost"),
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// A package whose manifest, checksum and signature have been verified.
#[derive(Debug)]
pub struct ValidatedPackage {
    manifest: PluginManifest,
    source: PathBuf,
    checksum: String,
    signed: bool,
    files: Vec<String>,
    scratch: Arc<TempDir>,
}

impl ValidatedPackage {
    /// The effective manifest (with `config.schema.json` applied).
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Plugin version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Path the package was read from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Verified payload checksum.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Whether a trusted signature was verified.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Payload entry paths.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Directory the payload was extracted into.
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// Absolute path of a payload entry.
    pub fn payload_path(&self, entry: &str) -> PathBuf {
        self.scratch.path().join(entry)
    }

    /// Shared handle that keeps the scratch directory alive.
    pub fn scratch_handle(&self) -> Arc<TempDir> {
        Arc::clone(&self.scratch)
    }
}

/// Reads and verifies packages. Stateless; clone freely.
#[derive(Debug, Clone)]
pub struct PackageReader {
    options: Arc<ReaderOptions>,
}

impl PackageReader {
    /// Create a reader.
    pub fn new(options: ReaderOptions) -> Self {
        Self { options: Arc::new(options) }
    }

    /// Reader options.
    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// Read a package on the blocking pool, bounded by the IO timeout.
    pub async fn read(&self, path: &Path) -> PluginResult<ValidatedPackage> {
        let options = Arc::clone(&self.options);
        let owned = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || read_package(&options, &owned));

        match tokio::time::timeout(self.options.io_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                Err(PluginError::MalformedPackage(format!("Package reader task failed: {join}")))
            }
            Err(_) => Err(PluginError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Reading {} exceeded {:?}", path.display(), self.options.io_timeout),
            ))),
        }
    }

    /// Read a package synchronously.
    pub fn read_blocking(&self, path: &Path) -> PluginResult<ValidatedPackage> {
        read_package(&self.options, path)
    }

    /// Read and check a manifest without verifying integrity or extracting.
    pub fn inspect(&self, path: &Path) -> PluginResult<(PluginManifest, String)> {
        let (raw, payload) = read_archive(path, self.options.max_package_bytes)?;
        let manifest = effective_manifest(PluginManifest::from_json(&raw)?, &payload)?;
        Ok((manifest, signing::checksum_hex(&payload)))
    }
}

fn read_package(options: &ReaderOptions, path: &Path) -> PluginResult<ValidatedPackage> {
    let (raw, payload) = read_archive(path, options.max_package_bytes)?;
    let shipped = PluginManifest::from_json(&raw)?;
    shipped.validate()?;

    // Nothing from the payload is interpreted before it is verified.
    let digest = signing::payload_digest(&payload);
    signing::verify_checksum(&shipped, &digest)?;

    let signed = match (shipped.signature.is_empty(), options.require_signatures) {
        (true, true) => {
            return Err(PluginError::Integrity(format!("Package '{}' is not signed", shipped.id)));
        }
        (true, false) => {
            tracing::warn!(plugin_id = %shipped.id, path = %path.display(), "loading unsigned package");
            false
        }
        (false, false) if options.trusted_keys.is_empty() => {
            tracing::warn!(plugin_id = %shipped.id, "no trusted keys configured, signature not checked");
            false
        }
        (false, _) => {
            options.trusted_keys.verify(&shipped, &digest)?;
            true
        }
    };

    let manifest = effective_manifest(shipped, &payload)?;
    let scratch = extract(&options.scratch_dir, &manifest.id, &payload)?;
    tracing::debug!(
        plugin_id = %manifest.id,
        version = %manifest.version,
        scratch = %scratch.path().display(),
        "package verified and extracted"
    );

    Ok(ValidatedPackage {
        files: payload.keys().cloned().collect(),
        checksum: hex::encode(digest),
        manifest,
        source: path.to_path_buf(),
        signed,
        scratch: Arc::new(scratch),
    })
}

/// Validate the manifest, applying `config.schema.json` when the
/// manifest declares no schema.
fn effective_manifest(
    mut manifest: PluginManifest,
    payload: &BTreeMap<String, Vec<u8>>,
) -> PluginResult<PluginManifest> {
    if manifest.config_schema.is_empty() {
        if let Some(bytes) = payload.get(SCHEMA_FILE) {
            manifest.config_schema = serde_json::from_slice::<ConfigSchema>(bytes)
                .map_err(|e| PluginError::InvalidManifest(format!("{SCHEMA_FILE}: {e}")))?;
        }
    }

    manifest.validate()?;

    if manifest.entrypoint.kind == EntrypointKind::Process {
        let target = manifest.entrypoint_target();
        if !payload.contains_key(&target) {
            return Err(PluginError::InvalidManifest(format!(
                "Process entrypoint '{target}' is not in the payload"
            )));
        }
    }

    Ok(manifest)
}

/// Read the archive into memory: manifest bytes plus payload entries.
fn read_archive(path: &Path, max_bytes: u64) -> PluginResult<(Vec<u8>, BTreeMap<String, Vec<u8>>)> {
    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(PluginError::MalformedPackage(format!(
            "{} is {size} bytes, limit is {max_bytes}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(malformed)?;

    let mut manifest = None;
    let mut payload = BTreeMap::new();
    let mut remaining = max_bytes;

    for entry in entries {
        let mut entry = entry.map_err(malformed)?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        let name = entry_name(&entry.path().map_err(malformed)?)?;
        if !kind.is_file() {
            return Err(PluginError::MalformedPackage(format!(
                "Entry '{name}' is not a regular file"
            )));
        }

        let mut content = Vec::new();
        let read = (&mut entry).take(remaining + 1).read_to_end(&mut content).map_err(malformed)?;
        if read as u64 > remaining {
            return Err(PluginError::MalformedPackage(format!(
                "Unpacked size exceeds limit of {max_bytes} bytes"
            )));
        }
        remaining -= read as u64;

        if name == MANIFEST_FILE {
            if manifest.replace(content).is_some() {
                return Err(PluginError::MalformedPackage("Duplicate manifest entry".into()));
            }
        } else if payload.insert(name.clone(), content).is_some() {
            return Err(PluginError::MalformedPackage(format!("Duplicate entry '{name}'")));
        }
    }

    let manifest = manifest
        .ok_or_else(|| PluginError::MalformedPackage(format!("Missing {MANIFEST_FILE}")))?;
    Ok((manifest, payload))
}

/// Normalize an entry path, rejecting absolute and parent-relative paths.
fn entry_name(path: &Path) -> PluginResult<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                PluginError::MalformedPackage(format!("Non UTF-8 entry path {}", path.display()))
            })?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PluginError::MalformedPackage(format!(
                    "Unsafe entry path {}",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(PluginError::MalformedPackage("Empty entry path".into()));
    }
    Ok(parts.join("/"))
}

fn malformed(e: io::Error) -> PluginError {
    PluginError::MalformedPackage(e.to_string())
}

fn extract(scratch_root: &Path, id: &str, payload: &BTreeMap<String, Vec<u8>>) -> PluginResult<TempDir> {
    std::fs::create_dir_all(scratch_root)?;
    let dir = tempfile::Builder::new().prefix(&format!("{id}-")).tempdir_in(scratch_root)?;

    for (name, content) in payload {
        let target = dir.path().join(name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
        if name.starts_with("bin/") {
            make_executable(&target)?;
        }
    }

    Ok(dir)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Assembles a package from a manifest and payload files.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    manifest: PluginManifest,
    files: BTreeMap<String, Vec<u8>>,
    checksum_override: Option<String>,
}

impl PackageBuilder {
    /// Start a package for `manifest`.
    pub fn new(manifest: PluginManifest) -> Self {
        Self { manifest, files: BTreeMap::new(), checksum_override: None }
    }

    /// Add a payload file.
    pub fn file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Add every file under `root` as payload, except a `manifest.json` at the top.
    pub fn dir(mut self, root: &Path) -> PluginResult<Self> {
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| PluginError::Io(io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let name = entry_name(relative)?;
            if name == MANIFEST_FILE {
                continue;
            }
            let content = std::fs::read(entry.path())?;
            self.files.insert(name, content);
        }
        Ok(self)
    }

    /// Force a checksum instead of computing one.
    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum_override = Some(checksum.into());
        self
    }

    /// Stamp checksum and signature, returning the final manifest.
    pub fn seal(&self, key: Option<&SigningKey>) -> PluginResult<PluginManifest> {
        let mut manifest = self.manifest.clone();
        let digest = signing::payload_digest(&self.files);
        manifest.checksum =
            self.checksum_override.clone().unwrap_or_else(|| hex::encode(digest));
        manifest.signature = match key {
            Some(key) => signing::sign(&manifest, &digest, key)?,
            None => String::new(),
        };
        Ok(manifest)
    }

    /// Write the package to `out`.
    pub fn write(&self, out: &Path, key: Option<&SigningKey>) -> PluginResult<PluginManifest> {
        let manifest = self.seal(key)?;
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoder = GzEncoder::new(File::create(out)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        append(&mut builder, MANIFEST_FILE, &manifest_bytes, 0o644)?;
        for (name, content) in &self.files {
            let mode = if name.starts_with("bin/") { 0o755 } else { 0o644 };
            append(&mut builder, name, content, mode)?;
        }

        builder.into_inner()?.finish()?;
        Ok(manifest)
    }
}

fn append<W: io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    content: &[u8],
    mode: u32,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::signing::{encode_verifying_key, generate_signing_key};
    use crate::plugin::{Capability, CapabilityDecl};
    use serde_json::json;

    fn manifest(id: &str) -> PluginManifest {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "capabilities": [{"type": "embedding", "models": []}]
        }))
        .unwrap()
    }

    fn reader(dir: &Path, keys: &[String], require: bool) -> PackageReader {
        PackageReader::new(ReaderOptions {
            require_signatures: require,
            trusted_keys: TrustedKeys::from_base64(keys).unwrap(),
            scratch_dir: dir.join("scratch"),
            ..ReaderOptions::default()
        })
    }

    #[test]
    fn test_signed_package_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let path = dir.path().join("embed.xpkg");

        PackageBuilder::new(manifest("embed"))
            .file("README.md", "docs")
            .file("assets/vocab.txt", "a b c")
            .write(&path, Some(&key))
            .unwrap();

        let reader = reader(dir.path(), &[encode_verifying_key(&key.verifying_key())], true);
        let package = reader.read_blocking(&path).unwrap();

        assert_eq!(package.id(), "embed");
        assert!(package.is_signed());
        assert_eq!(package.files().to_vec(), vec!["README.md".to_string(), "assets/vocab.txt".to_string()]);
        assert_eq!(
            std::fs::read_to_string(package.payload_path("assets/vocab.txt")).unwrap(),
            "a b c"
        );
    }

    #[test]
    fn test_fresh_scratch_per_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.xpkg");
        PackageBuilder::new(manifest("p")).file("a", "1").write(&path, None).unwrap();

        let reader = reader(dir.path(), &[], false);
        let first = reader.read_blocking(&path).unwrap();
        let second = reader.read_blocking(&path).unwrap();
        assert_ne!(first.scratch_path(), second.scratch_path());

        let scratch = first.scratch_path().to_path_buf();
        drop(first);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_checksum_mismatch_not_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xpkg");
        PackageBuilder::new(manifest("bad"))
            .file("a", "1")
            .checksum("deadbeef")
            .write(&path, None)
            .unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::Integrity(_)));

        let scratch = dir.path().join("scratch");
        let extracted = scratch.exists() && std::fs::read_dir(&scratch).unwrap().next().is_some();
        assert!(!extracted);
    }

    #[test]
    fn test_tampered_schema_file_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.xpkg");
        PackageBuilder::new(manifest("tampered"))
            .file(SCHEMA_FILE, "{ this is tampered")
            .checksum("deadbeef")
            .write(&path, None)
            .unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::Integrity(_)), "got {err:?}");
    }

    #[test]
    fn test_broken_schema_file_with_valid_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xpkg");
        PackageBuilder::new(manifest("broken"))
            .file(SCHEMA_FILE, "{ not json")
            .write(&path, None)
            .unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest(_)), "got {err:?}");
    }

    #[test]
    fn test_unsigned_rejected_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.xpkg");
        PackageBuilder::new(manifest("u")).write(&path, None).unwrap();

        let err = reader(dir.path(), &[], true).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::Integrity(_)));
        assert!(reader(dir.path(), &[], false).read_blocking(&path).is_ok());
    }

    #[test]
    fn test_untrusted_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.xpkg");
        PackageBuilder::new(manifest("s")).write(&path, Some(&generate_signing_key())).unwrap();

        let other = encode_verifying_key(&generate_signing_key().verifying_key());
        let err = reader(dir.path(), &[other], true).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::Integrity(_)));
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.xpkg");
        std::fs::write(&path, b"definitely not gzip").unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(_)));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.xpkg");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append(&mut builder, "README.md", b"hi", 0o644).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(_)));
    }

    #[test]
    fn test_symlink_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.xpkg");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let manifest_bytes = serde_json::to_vec(&manifest("link")).unwrap();
        append(&mut builder, MANIFEST_FILE, &manifest_bytes, 0o644).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name("/etc/passwd").unwrap();
        header.set_cksum();
        builder.append_data(&mut header, "passwd", io::empty()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(_)));
    }

    #[test]
    fn test_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.xpkg");
        PackageBuilder::new(manifest("big"))
            .file("blob", vec![0u8; 64 * 1024])
            .write(&path, None)
            .unwrap();

        let reader = PackageReader::new(ReaderOptions {
            max_package_bytes: 16 * 1024,
            require_signatures: false,
            scratch_dir: dir.path().join("scratch"),
            ..ReaderOptions::default()
        });
        let err = reader.read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(_)));
    }

    #[test]
    fn test_schema_file_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.xpkg");
        let schema = json!({"properties": {"api_key": {"type": "string"}}, "required": ["api_key"]});
        PackageBuilder::new(manifest("schema"))
            .file(SCHEMA_FILE, serde_json::to_vec(&schema).unwrap())
            .write(&path, None)
            .unwrap();

        let package = reader(dir.path(), &[], false).read_blocking(&path).unwrap();
        assert_eq!(package.manifest().config_schema.required, vec!["api_key".to_string()]);
    }

    #[test]
    fn test_process_entrypoint_requires_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proc.xpkg");
        let mut m = manifest("proc");
        m.entrypoint.kind = EntrypointKind::Process;
        m.capabilities = vec![CapabilityDecl::new(Capability::Chat, &[])];
        PackageBuilder::new(m).write(&path, None).unwrap();

        let err = reader(dir.path(), &[], false).read_blocking(&path).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest(_)));
    }

    #[test]
    fn test_entry_name_normalization() {
        assert_eq!(entry_name(Path::new("./assets/a.txt")).unwrap(), "assets/a.txt");
        assert!(entry_name(Path::new("../escape")).is_err());
        assert!(entry_name(Path::new("/abs")).is_err());
    }

    #[tokio::test]
    async fn test_async_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xpkg");
        PackageBuilder::new(manifest("a")).write(&path, None).unwrap();

        let package = reader(dir.path(), &[], false).read(&path).await.unwrap();
        assert_eq!(package.version(), "1.0.0");
    }
}
