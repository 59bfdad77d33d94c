//! Firmware store
//!
//! Tracks the single active firmware artifact and the declared version the
//! server advertises. Uploads are staged next to their destination and only
//! become active after a complete write.

use crate::{error::ServiceError, services::checksum};
use log::{debug, info, warn};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
    time::SystemTime,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

pub const FIRMWARE_EXTENSION: &str = "bin";
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
const EXCLUDED_NAME_MARKERS: [&str; 3] = ["bootloader", "partition", "ota_data"];

const PROJECT_VER_PATTERN: &str = r#"set\s*\(\s*PROJECT_VER\s+"([^"]+)"\s*\)"#;

/// Snapshot of the active firmware artifact
#[derive(Clone, Debug, PartialEq)]
pub struct FirmwareArtifact {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug)]
struct ActiveFirmware {
    path: Option<PathBuf>,
    version: String,
}

struct CachedDigest {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
    digest: String,
}

pub struct FirmwareStore {
    dir: PathBuf,
    active: RwLock<ActiveFirmware>,
    digest_cache: Mutex<Option<CachedDigest>>,
}

/// Whether `name` carries the firmware extension
pub fn is_firmware_file_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == FIRMWARE_EXTENSION)
}

/// Whether `name` is an application image rather than a build by-product
fn is_application_image(name: &str) -> bool {
    is_firmware_file_name(name)
        && !EXCLUDED_NAME_MARKERS
            .iter()
            .any(|marker| name.contains(marker))
}

/// Find the application image in `dir`, first in lexicographic order
pub fn locate(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_application_image)
        })
        .collect();

    candidates.sort();
    if candidates.len() > 1 {
        debug!(
            "found {} firmware candidates in {}, using the first",
            candidates.len(),
            dir.display()
        );
    }

    candidates.into_iter().next()
}

/// Version embedded in a firmware file name like `app_v1.2.3.bin`
pub fn extract_version_from_filename(name: &str) -> Option<String> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let (_, candidate) = stem.rsplit_once("_v")?;

    semver::Version::parse(candidate)
        .ok()
        .map(|version| version.to_string())
}

/// `PROJECT_VER` of the ESP-IDF project the firmware directory belongs to
pub fn read_project_version(firmware_dir: &Path) -> Option<String> {
    let parent = firmware_dir.parent();
    let search = [
        parent.map(Path::to_path_buf),
        parent.and_then(Path::parent).map(Path::to_path_buf),
        Some(PathBuf::from(".")),
    ];

    let pattern = Regex::new(PROJECT_VER_PATTERN).ok()?;

    search.into_iter().flatten().find_map(|dir| {
        let content = fs::read_to_string(dir.join("CMakeLists.txt")).ok()?;
        pattern
            .captures(&content)
            .map(|captures| captures[1].to_string())
    })
}

/// Accept only a bare file name, never a path
fn validate_file_name(name: &str) -> Result<&str, ServiceError> {
    let bare = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');

    if bare {
        Ok(name)
    } else {
        Err(ServiceError::invalid_input(format!(
            "invalid firmware file name: {name:?}"
        )))
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FirmwareStore {
    pub fn new(dir: impl Into<PathBuf>, path: Option<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            active: RwLock::new(ActiveFirmware {
                path,
                version: version.into(),
            }),
            digest_cache: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> String {
        self.read().version.clone()
    }

    /// The active artifact, if its file currently exists
    pub fn active(&self) -> Option<FirmwareArtifact> {
        let (path, version) = {
            let active = self.read();
            (active.path.clone()?, active.version.clone())
        };

        Self::artifact(path, version)
    }

    /// Overwrite the declared version, returning the previous one
    pub fn set_version(&self, version: &str) -> Result<String, ServiceError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(ServiceError::invalid_input("empty version"));
        }

        let mut active = self.write();
        let old = std::mem::replace(&mut active.version, version.to_string());
        info!("version updated: {old} -> {version}");

        Ok(old)
    }

    /// Resolve a download request to an artifact
    ///
    /// Without a name the active artifact is served. A name must match the
    /// active artifact or a file inside the firmware directory.
    pub fn resolve(&self, name: Option<&str>) -> Result<FirmwareArtifact, ServiceError> {
        let Some(name) = name else {
            return self.active().ok_or(ServiceError::FirmwareNotFound);
        };

        let name = validate_file_name(name)?;
        if let Some(active) = self.active().filter(|artifact| artifact.name == name) {
            return Ok(active);
        }

        Self::artifact(self.dir.join(name), self.version()).ok_or(ServiceError::FirmwareNotFound)
    }

    /// Stream an uploaded firmware image into the firmware directory and
    /// make it the active artifact
    ///
    /// The bytes land in a staging file that is renamed over the destination
    /// only after the whole upload was written. On any failure the staging
    /// file is removed and the previous artifact stays active.
    pub async fn replace<R>(
        &self,
        name: &str,
        mut source: R,
        version: Option<&str>,
    ) -> Result<FirmwareArtifact, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let name = validate_file_name(name)?;
        if !is_firmware_file_name(name) {
            return Err(ServiceError::invalid_input(format!(
                "only .{FIRMWARE_EXTENSION} files allowed"
            )));
        }

        fs::create_dir_all(&self.dir)
            .map_err(ServiceError::io("failed to create firmware directory"))?;

        let staging = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(&self.dir)
            .map_err(ServiceError::io("failed to create staging file"))?;

        let std_file = staging
            .as_file()
            .try_clone()
            .map_err(ServiceError::io("failed to open staging file"))?;
        let mut writer = tokio::fs::File::from_std(std_file);
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let read = source
                .read(&mut buffer)
                .await
                .map_err(ServiceError::io("failed to read uploaded firmware"))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(ServiceError::io("failed to write firmware"))?;
            written += read as u64;
        }

        writer
            .flush()
            .await
            .map_err(ServiceError::io("failed to flush firmware"))?;
        writer
            .sync_all()
            .await
            .map_err(ServiceError::io("failed to sync firmware"))?;
        drop(writer);

        let destination = self.dir.join(name);
        staging
            .persist(&destination)
            .map_err(|e| ServiceError::io("failed to activate firmware")(e.error))?;
        debug!("wrote {written} bytes to {}", destination.display());

        let derived = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| extract_version_from_filename(name));

        let version = {
            let mut active = self.write();
            active.path = Some(destination.clone());
            match derived {
                Some(version) => active.version = version,
                None => warn!(
                    "no version given or found in {name}, keeping {}",
                    active.version
                ),
            }
            active.version.clone()
        };

        Self::artifact(destination, version).ok_or(ServiceError::FirmwareNotFound)
    }

    /// MD5 digest of an artifact, cached while its file is unchanged
    pub async fn digest(&self, artifact: &FirmwareArtifact) -> Result<String, ServiceError> {
        {
            let cache = self.cache();
            if let Some(cached) = cache.as_ref().filter(|cached| {
                cached.path == artifact.path
                    && cached.size == artifact.size
                    && cached.modified == artifact.modified
            }) {
                return Ok(cached.digest.clone());
            }
        }

        let path = artifact.path.clone();
        let digest = tokio::task::spawn_blocking(move || checksum::md5_file(&path))
            .await
            .map_err(|e| ServiceError::io("digest task failed")(std::io::Error::other(e)))?
            .map_err(ServiceError::io("failed to compute firmware digest"))?;

        *self.cache() = Some(CachedDigest {
            path: artifact.path.clone(),
            size: artifact.size,
            modified: artifact.modified,
            digest: digest.clone(),
        });

        Ok(digest)
    }

    fn artifact(path: PathBuf, version: String) -> Option<FirmwareArtifact> {
        let metadata = fs::metadata(&path).ok().filter(|m| m.is_file())?;

        Some(FirmwareArtifact {
            name: file_name_of(&path),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path,
            version,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ActiveFirmware> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ActiveFirmware> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Option<CachedDigest>> {
        self.digest_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
