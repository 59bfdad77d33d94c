//! Device registry
//!
//! Holds one record per device identity (MAC address) together with its
//! approval status. Every mutation is written through to a [`DeviceStore`];
//! a failed write is logged and never rolls back the in-memory table.

use crate::error::ServiceError;
use anyhow::{Context, Result};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io::{BufWriter, ErrorKind, Write as _},
    path::PathBuf,
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub type DeviceTable = BTreeMap<String, DeviceRecord>;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Pending,
    Approved,
    Denied,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Pending => write!(f, "pending"),
            DeviceStatus::Approved => write!(f, "approved"),
            DeviceStatus::Denied => write!(f, "denied"),
        }
    }
}

/// Persisted device record
///
/// All fields default so documents written by older server versions load.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub mac: String,
    pub ip: String,
    pub status: DeviceStatus,
    pub chip: String,
    pub cores: u32,
    pub flash_kb: u64,
    pub app_name: String,
    pub app_version: String,
    pub idf_version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Fields a device reports about itself, applied only when present
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DeviceReport {
    pub chip: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub cores: Option<u32>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub flash_kb: Option<u64>,
    pub app_name: Option<String>,
    #[serde(alias = "version", alias = "v")]
    pub app_version: Option<String>,
    pub idf_version: Option<String>,
}

/// Hardware descriptors are informational: numbers may arrive as strings
/// and anything unparsable is dropped instead of failing the request.
fn lenient_number<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;

    Ok(match value {
        serde_json::Value::String(text) => text.trim().parse().ok(),
        value => serde_json::from_value(value).ok(),
    })
}

impl DeviceReport {
    fn apply(&self, record: &mut DeviceRecord) {
        if let Some(chip) = &self.chip {
            record.chip.clone_from(chip);
        }
        if let Some(cores) = self.cores {
            record.cores = cores;
        }
        if let Some(flash_kb) = self.flash_kb {
            record.flash_kb = flash_kb;
        }
        if let Some(app_name) = &self.app_name {
            record.app_name.clone_from(app_name);
        }
        if let Some(app_version) = self.app_version.as_ref().filter(|v| !v.is_empty()) {
            record.app_version.clone_from(app_version);
        }
        if let Some(idf_version) = &self.idf_version {
            record.idf_version.clone_from(idf_version);
        }
    }
}

/// One contact from a device: where it came from and what it reported
#[derive(Clone, Debug, Default)]
pub struct DeviceContact {
    pub address: String,
    pub report: DeviceReport,
    pub token_hash: Option<String>,
    pub timestamp: String,
}

/// Canonical form of a device identity: trimmed and upper-cased
pub fn normalize_identity(identity: &str) -> Option<String> {
    let identity = identity.trim();
    (!identity.is_empty()).then(|| identity.to_ascii_uppercase())
}

/// Durable storage of the whole device table
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DeviceStore {
    fn load(&self) -> Result<DeviceTable>;
    fn persist(&self, devices: &DeviceTable) -> Result<()>;
}

/// Stores the device table as a pretty-printed JSON document
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<DeviceTable> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DeviceTable::new()),
            Err(e) => return Err(e).context("failed to read devices file"),
        };

        let devices: DeviceTable =
            serde_json::from_str(&content).context("failed to parse devices file")?;

        // older documents only carry the identity as map key
        Ok(devices
            .into_iter()
            .filter_map(|(key, mut record)| {
                let identity = normalize_identity(&key)?;
                record.mac.clone_from(&identity);
                Some((identity, record))
            })
            .collect())
    }

    fn persist(&self, devices: &DeviceTable) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("failed to get parent directory of devices file")?;
        fs::create_dir_all(dir).context("failed to create data directory")?;

        let staging =
            tempfile::NamedTempFile::new_in(dir).context("failed to create staging file")?;
        {
            let mut writer = BufWriter::new(staging.as_file());
            serde_json::to_writer_pretty(&mut writer, devices)
                .context("failed to serialize devices")?;
            writer.flush().context("failed to write devices")?;
        }
        staging
            .persist(&self.path)
            .context("failed to replace devices file")?;

        Ok(())
    }
}

struct Table {
    devices: DeviceTable,
    generation: u64,
}

/// In-memory device table with write-through persistence
pub struct DeviceRegistry<Store: DeviceStore> {
    table: Mutex<Table>,
    /// generation of the last snapshot handed to the store
    persisted: Mutex<u64>,
    store: Store,
}

impl<Store: DeviceStore> DeviceRegistry<Store> {
    pub fn new(store: Store) -> Self {
        Self {
            table: Mutex::new(Table {
                devices: DeviceTable::new(),
                generation: 0,
            }),
            persisted: Mutex::new(0),
            store,
        }
    }

    /// Populate the table from the store
    ///
    /// A missing or unreadable document means no devices are known yet.
    pub fn load(&self) -> usize {
        let devices = match self.store.load() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("failed to load devices, starting empty: {e:#}");
                DeviceTable::new()
            }
        };

        let count = devices.len();
        let mut table = self.lock();
        table.devices = devices;
        table.generation += 1;
        info!("loaded {count} device(s)");

        count
    }

    /// Create or refresh a device record
    ///
    /// The stored status is kept unless `status` is given; new devices start
    /// as pending. Returns `None` for an empty identity.
    pub fn upsert(
        &self,
        identity: &str,
        contact: &DeviceContact,
        status: Option<DeviceStatus>,
    ) -> Option<DeviceRecord> {
        let identity = normalize_identity(identity)?;

        let (record, snapshot, generation) = {
            let mut table = self.lock();
            let record = table
                .devices
                .entry(identity.clone())
                .or_insert_with(|| {
                    info!("new device {identity} registered as pending");
                    DeviceRecord {
                        mac: identity.clone(),
                        ..Default::default()
                    }
                });

            record.ip.clone_from(&contact.address);
            record.timestamp.clone_from(&contact.timestamp);
            contact.report.apply(record);
            if let Some(hash) = &contact.token_hash {
                record.hash = Some(hash.clone());
            }
            if let Some(status) = status {
                record.status = status;
            }

            let record = record.clone();
            table.generation += 1;
            (record, table.devices.clone(), table.generation)
        };

        self.write_through(&snapshot, generation);
        Some(record)
    }

    pub fn get(&self, identity: &str) -> Option<DeviceRecord> {
        let identity = normalize_identity(identity)?;
        self.lock().devices.get(&identity).cloned()
    }

    /// Change the approval status of a known device
    pub fn set_status(
        &self,
        identity: &str,
        status: DeviceStatus,
    ) -> Result<DeviceRecord, ServiceError> {
        if status == DeviceStatus::Pending {
            return Err(ServiceError::invalid_input(
                "status can only be set to approved or denied",
            ));
        }

        let not_found = || ServiceError::DeviceNotFound(identity.to_string());
        let key = normalize_identity(identity).ok_or_else(not_found)?;

        let (record, snapshot, generation) = {
            let mut table = self.lock();
            let record = table.devices.get_mut(&key).ok_or_else(not_found)?;
            record.status = status;

            let record = record.clone();
            table.generation += 1;
            (record, table.devices.clone(), table.generation)
        };

        self.write_through(&snapshot, generation);
        Ok(record)
    }

    /// Look up the single known device last seen at `address`
    ///
    /// Returns `None` if no device or more than one device shares the address.
    pub fn find_by_address(&self, address: &str) -> Option<DeviceRecord> {
        let table = self.lock();
        let mut matches = table.devices.values().filter(|r| r.ip == address);

        match (matches.next(), matches.next()) {
            (Some(record), None) => Some(record.clone()),
            (Some(_), Some(_)) => {
                warn!("address {address} is shared by several devices, not resolving identity");
                None
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> DeviceTable {
        self.lock().devices.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current table to the store
    pub fn persist(&self) -> Result<()> {
        let (snapshot, generation) = {
            let table = self.lock();
            (table.devices.clone(), table.generation)
        };

        let mut persisted = self
            .persisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.store.persist(&snapshot)?;
        *persisted = (*persisted).max(generation);

        Ok(())
    }

    fn write_through(&self, snapshot: &DeviceTable, generation: u64) {
        let mut persisted = self
            .persisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // a newer snapshot was already written by a concurrent mutation
        if generation <= *persisted {
            debug!("skipping stale device snapshot {generation}");
            return;
        }

        match self.store.persist(snapshot) {
            Ok(()) => *persisted = generation,
            Err(e) => warn!("failed to persist devices: {e:#}"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
