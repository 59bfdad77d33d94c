//! OTA protocol and admin operations
//!
//! [`OtaService`] owns all shared state of the server: the device registry,
//! the firmware store, the transfer tracker, counters and the per-address
//! contact tally. HTTP handlers only translate requests into calls on it.

use crate::{
    error::ServiceError,
    services::{
        checksum,
        devices::{
            DeviceContact, DeviceRecord, DeviceRegistry, DeviceReport, DeviceStatus,
            DeviceStore, DeviceTable, normalize_identity,
        },
        firmware::{FirmwareArtifact, FirmwareStore},
        transfer::{TransferGuard, TransferProgress, TransferTracker, format_size},
    },
};
use actix_web::web::Bytes;
use chrono::{DateTime, Local};
use futures_util::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024;
const CONTACT_TIME_FORMAT: &str = "%H:%M:%S %d/%m/%Y";
const FIRMWARE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// When a version check discloses the download URL to an approved device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Disclosure {
    /// only if the reported version differs from the declared one
    #[default]
    VersionDiffers,
    /// whenever the device is approved
    Approved,
}

#[derive(Clone, Debug, Default)]
pub struct OtaSettings {
    /// base of download links, without trailing slash
    pub public_url: String,
    /// shared secret for token verification
    pub secret: Option<String>,
    pub disclosure: Disclosure,
    pub address_fallback: bool,
}

#[derive(Debug, Default)]
pub struct ServerCounters {
    version_checks: AtomicU64,
    downloads: AtomicU64,
    token_validations: AtomicU64,
}

impl ServerCounters {
    pub fn version_checks(&self) -> u64 {
        self.version_checks.load(Ordering::Relaxed)
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn token_validations(&self) -> u64 {
        self.token_validations.load(Ordering::Relaxed)
    }

    fn increment(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContactTally {
    pub count: u64,
    pub last_time: String,
}

#[derive(Clone, Debug, Default)]
pub struct VersionCheck {
    pub identity: Option<String>,
    pub address: String,
    pub report: DeviceReport,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VersionInfo {
    pub version: String,
    pub firmware_url: Option<String>,
    pub force: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TokenValidation {
    pub identity: Option<String>,
    pub address: String,
    pub token_hash: String,
    pub report: DeviceReport,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DownloadRequest {
    pub name: Option<String>,
    pub identity: Option<String>,
    pub address: String,
}

/// An authorized download ready to be streamed
pub struct FirmwareDownload {
    pub name: String,
    pub size: u64,
    pub chunks: ChunkStream,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub ok: bool,
    pub version: String,
    pub size: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerSummary {
    pub address: String,
    pub version: String,
    pub checks: u64,
    pub downloads: u64,
    pub token_validations: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FirmwareSummary {
    pub name: String,
    pub size: String,
    pub size_bytes: u64,
    pub time: String,
    pub md5: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DashboardSnapshot {
    pub server: ServerSummary,
    pub version_clients: BTreeMap<String, ContactTally>,
    pub devices: DeviceTable,
    pub firmware: Option<FirmwareSummary>,
    pub active_downloads: BTreeMap<String, TransferProgress>,
}

pub struct OtaService<Store: DeviceStore> {
    registry: DeviceRegistry<Store>,
    firmware: FirmwareStore,
    transfers: Arc<TransferTracker>,
    counters: ServerCounters,
    contacts: Mutex<BTreeMap<String, ContactTally>>,
    settings: OtaSettings,
}

fn timestamp() -> String {
    Local::now().format(CONTACT_TIME_FORMAT).to_string()
}

fn missing_identity() -> ServiceError {
    ServiceError::invalid_input("missing mac/Device-Id")
}

impl<Store: DeviceStore> OtaService<Store> {
    pub fn new(registry: DeviceRegistry<Store>, firmware: FirmwareStore, settings: OtaSettings) -> Self {
        Self {
            registry,
            firmware,
            transfers: Arc::new(TransferTracker::default()),
            counters: ServerCounters::default(),
            contacts: Mutex::new(BTreeMap::new()),
            settings,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry<Store> {
        &self.registry
    }

    pub fn firmware(&self) -> &FirmwareStore {
        &self.firmware
    }

    pub fn transfers(&self) -> &TransferTracker {
        &self.transfers
    }

    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    pub fn settings(&self) -> &OtaSettings {
        &self.settings
    }

    /// Register the contacting device and tell it the declared version
    ///
    /// Unknown devices are registered as pending. The download URL is only
    /// part of the answer for approved devices while an artifact exists.
    /// When a shared secret is configured, the device must have passed
    /// [`Self::validate_token`] first.
    pub fn check_version(&self, check: VersionCheck) -> Result<VersionInfo, ServiceError> {
        let identity = check
            .identity
            .as_deref()
            .and_then(normalize_identity)
            .ok_or_else(missing_identity)?;
        self.require_token(&identity, &check.address)?;

        let now = timestamp();
        let contact = DeviceContact {
            address: check.address.clone(),
            report: check.report,
            token_hash: None,
            timestamp: now.clone(),
        };
        let record = self
            .registry
            .upsert(&identity, &contact, None)
            .ok_or_else(missing_identity)?;

        let count = ServerCounters::increment(&self.counters.version_checks);
        self.record_contact(&check.address, now);

        let version = self.firmware.version();
        let firmware_url = self.disclosed_url(&record, &version);
        info!(
            "[#{count}] version check from {} | MAC: {identity} | v{} ({})",
            check.address, record.app_version, record.status
        );
        debug!(
            "responding v{version} | URL: {}",
            firmware_url.as_deref().unwrap_or("(none)")
        );

        Ok(VersionInfo {
            version,
            firmware_url,
            force: false,
        })
    }

    /// Verify a device token hash and register the device
    ///
    /// A mismatching hash is rejected before anything is recorded. An empty
    /// hash registers the device without a token.
    pub fn validate_token(&self, request: TokenValidation) -> Result<TokenStatus, ServiceError> {
        let claimed = request.identity.as_deref().map(str::trim).unwrap_or_default();
        let identity = normalize_identity(claimed).ok_or_else(missing_identity)?;
        let count = ServerCounters::increment(&self.counters.token_validations);
        let token_hash = request.token_hash.trim();

        if let Some(secret) = self.settings.secret.as_deref().filter(|_| !token_hash.is_empty()) {
            let expected = checksum::token_hash(secret, claimed);
            if !token_hash.eq_ignore_ascii_case(&expected) {
                warn!(
                    "[#{count}] token mismatch from {} | MAC: {identity}",
                    request.address
                );
                return Err(ServiceError::TokenMismatch);
            }
        }

        let contact = DeviceContact {
            address: request.address.clone(),
            report: request.report,
            token_hash: Some(token_hash.to_string()),
            timestamp: timestamp(),
        };
        let record = self
            .registry
            .upsert(&identity, &contact, None)
            .ok_or_else(missing_identity)?;

        if token_hash.is_empty() {
            info!("[#{count}] device {identity} without key from {}", request.address);
        } else {
            info!("[#{count}] valid token from {} | MAC: {identity}", request.address);
        }
        if record.status == DeviceStatus::Pending {
            info!("device {identity} waits for approval");
        }

        Ok(self.token_status_of(&record))
    }

    /// Approval status of a device for polling clients
    pub fn token_status(&self, identity: Option<&str>) -> Result<TokenStatus, ServiceError> {
        let identity = identity
            .and_then(normalize_identity)
            .ok_or_else(missing_identity)?;

        Ok(match self.registry.get(&identity) {
            Some(record) => self.token_status_of(&record),
            None => TokenStatus {
                status: "unknown".to_string(),
                firmware_url: None,
            },
        })
    }

    /// Authorize a download and open the requested artifact for streaming
    ///
    /// Nothing is streamed unless the resolved identity belongs to an
    /// approved device.
    pub async fn download(&self, request: DownloadRequest) -> Result<FirmwareDownload, ServiceError> {
        let record = self.authorize_download(&request)?;
        let artifact = self.firmware.resolve(request.name.as_deref())?;

        let file = tokio::fs::File::open(&artifact.path)
            .await
            .map_err(|_| ServiceError::FirmwareNotFound)?;
        let size = file
            .metadata()
            .await
            .map_err(ServiceError::io("failed to read firmware metadata"))?
            .len();

        let count = ServerCounters::increment(&self.counters.downloads);
        info!(
            "OTA #{count} to {} | MAC: {} | file: {} | size: {}",
            request.address,
            record.mac,
            artifact.name,
            format_size(size)
        );

        let guard = self
            .transfers
            .start(&record.mac, &record.mac, &request.address, size);

        Ok(FirmwareDownload {
            name: artifact.name,
            size,
            chunks: chunk_stream(file.take(size), guard, size),
        })
    }

    pub fn approve_device(&self, identity: &str) -> Result<DeviceRecord, ServiceError> {
        let record = self.registry.set_status(identity, DeviceStatus::Approved)?;
        info!("APPROVED MAC: {}", record.mac);
        Ok(record)
    }

    pub fn deny_device(&self, identity: &str) -> Result<DeviceRecord, ServiceError> {
        let record = self.registry.set_status(identity, DeviceStatus::Denied)?;
        info!("DENIED MAC: {}", record.mac);
        Ok(record)
    }

    /// Replace the active artifact with an uploaded image
    pub async fn upload_firmware<R>(
        &self,
        name: &str,
        source: R,
        version: Option<&str>,
    ) -> Result<UploadOutcome, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let artifact = self.firmware.replace(name, source, version).await?;
        info!(
            "uploaded {} ({}) v{}",
            artifact.name,
            format_size(artifact.size),
            artifact.version
        );

        Ok(UploadOutcome {
            ok: true,
            version: artifact.version,
            size: format_size(artifact.size),
        })
    }

    /// Overwrite the declared version, returning `(old, new)`
    pub fn set_version(&self, version: &str) -> Result<(String, String), ServiceError> {
        let old = self.firmware.set_version(version)?;
        Ok((old, self.firmware.version()))
    }

    pub async fn dashboard(&self) -> Result<DashboardSnapshot, ServiceError> {
        let firmware = match self.firmware.active() {
            Some(artifact) => Some(self.firmware_summary(&artifact).await?),
            None => None,
        };

        Ok(DashboardSnapshot {
            server: ServerSummary {
                address: self.settings.public_url.clone(),
                version: self.firmware.version(),
                checks: self.counters.version_checks(),
                downloads: self.counters.downloads(),
                token_validations: self.counters.token_validations(),
            },
            version_clients: self.contacts().clone(),
            devices: self.registry.snapshot(),
            firmware,
            active_downloads: self.transfers.snapshot(),
        })
    }

    pub async fn firmware_summary(
        &self,
        artifact: &FirmwareArtifact,
    ) -> Result<FirmwareSummary, ServiceError> {
        let md5 = self.firmware.digest(artifact).await?;
        let time = artifact
            .modified
            .map(|modified| {
                DateTime::<Local>::from(modified)
                    .format(FIRMWARE_TIME_FORMAT)
                    .to_string()
            })
            .unwrap_or_default();

        Ok(FirmwareSummary {
            name: artifact.name.clone(),
            size: format_size(artifact.size),
            size_bytes: artifact.size,
            time,
            md5,
        })
    }

    fn authorize_download(&self, request: &DownloadRequest) -> Result<DeviceRecord, ServiceError> {
        let record = match request.identity.as_deref().and_then(normalize_identity) {
            Some(identity) => self
                .registry
                .get(&identity)
                .ok_or_else(|| ServiceError::Forbidden(format!("unknown device {identity}")))?,
            None if self.settings.address_fallback => {
                let record = self.registry.find_by_address(&request.address).ok_or_else(|| {
                    ServiceError::Forbidden(format!("no device known at {}", request.address))
                })?;
                debug!("resolved {} to device {}", request.address, record.mac);
                record
            }
            None => {
                return Err(ServiceError::Forbidden(
                    "missing device identity".to_string(),
                ));
            }
        };

        if record.status != DeviceStatus::Approved {
            warn!(
                "refusing download to {} ({}): device is {}",
                record.mac, request.address, record.status
            );
            return Err(ServiceError::Forbidden(format!(
                "device {} is {}",
                record.mac, record.status
            )));
        }

        Ok(record)
    }

    /// With a shared secret, only devices registered through token
    /// validation may check their version
    fn require_token(&self, identity: &str, address: &str) -> Result<(), ServiceError> {
        if self.settings.secret.is_none() {
            return Ok(());
        }

        let validated = self
            .registry
            .get(identity)
            .is_some_and(|record| record.hash.is_some());
        if !validated {
            warn!("version check from {address} | MAC: {identity} without validated token");
            return Err(ServiceError::Forbidden(format!(
                "device {identity} has not validated its token"
            )));
        }

        Ok(())
    }

    fn disclosed_url(&self, record: &DeviceRecord, version: &str) -> Option<String> {
        if record.status != DeviceStatus::Approved {
            return None;
        }
        let artifact = self.firmware.active()?;

        let current = match self.settings.disclosure {
            Disclosure::VersionDiffers => record.app_version == version,
            Disclosure::Approved => false,
        };

        (!current).then(|| self.url_of(&artifact))
    }

    fn token_status_of(&self, record: &DeviceRecord) -> TokenStatus {
        let firmware_url = (record.status == DeviceStatus::Approved)
            .then(|| self.firmware.active())
            .flatten()
            .map(|artifact| self.url_of(&artifact));

        TokenStatus {
            status: record.status.to_string(),
            firmware_url,
        }
    }

    fn url_of(&self, artifact: &FirmwareArtifact) -> String {
        format!("{}/{}", self.settings.public_url, artifact.name)
    }

    fn record_contact(&self, address: &str, time: String) {
        self.contacts()
            .entry(address.to_string())
            .and_modify(|tally| {
                tally.count += 1;
                tally.last_time.clone_from(&time);
            })
            .or_insert_with(|| ContactTally {
                count: 1,
                last_time: time.clone(),
            });
    }

    fn contacts(&self) -> MutexGuard<'_, BTreeMap<String, ContactTally>> {
        self.contacts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ChunkState<R> {
    reader: R,
    guard: TransferGuard,
    buffer: Vec<u8>,
    total: u64,
}

/// Fixed-size chunks of `reader`, reporting progress to `guard`
///
/// The guard lives inside the stream, so dropping the stream early (client
/// gone) removes the tracker entry as well.
fn chunk_stream<R>(reader: R, guard: TransferGuard, total: u64) -> ChunkStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = ChunkState {
        reader,
        guard,
        buffer: vec![0u8; DOWNLOAD_CHUNK_SIZE],
        total,
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        let read = state.reader.read(&mut state.buffer).await?;

        if read == 0 {
            if state.guard.sent() < state.total {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "firmware file shrank during transfer",
                ));
            }
            state.guard.complete();
            return Ok(None);
        }

        state.guard.record(read);
        let chunk = Bytes::copy_from_slice(&state.buffer[..read]);
        Ok(Some((chunk, state)))
    })
    .boxed()
}
