use crate::services::{
    firmware,
    ota::{Disclosure, OtaSettings},
};
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
};

const DEFAULT_VERSION: &str = "0.0.0";
const DEVICES_FILE_NAME: &str = "ota_devices.json";
const FALLBACK_FIRMWARE_DIRS: [&str; 2] = ["/firmware", "."];

/// Command line arguments, each with an environment fallback
#[derive(Clone, Debug, Parser)]
#[command(about = "Distributes firmware images to ESP32 devices performing OTA updates")]
pub struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0", env = "OTA_BIND")]
    pub bind: IpAddr,

    /// Listen port
    #[arg(short, long, default_value_t = 8080, env = "OTA_PORT")]
    pub port: u16,

    /// Firmware image to serve
    #[arg(short, long, env = "OTA_FIRMWARE")]
    pub firmware: Option<PathBuf>,

    /// Directory searched for firmware and receiving uploads
    #[arg(short, long, default_value = "/firmware", env = "OTA_FIRMWARE_DIR")]
    pub dir: PathBuf,

    /// Declared firmware version
    #[arg(short = 'v', long = "version", env = "OTA_VERSION")]
    pub ota_version: Option<String>,

    /// Public URL used in download links
    #[arg(long, env = "OTA_BASE_URL")]
    pub base_url: Option<String>,

    /// Shared secret enabling token verification
    #[arg(short, long, env = "OTA_TOKEN")]
    pub token: Option<String>,

    /// Directory of the persisted device table
    #[arg(long, default_value = "/data", env = "OTA_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Dashboard assets
    #[arg(long, default_value = "web", env = "OTA_WEB_DIR")]
    pub web_dir: PathBuf,

    /// When version checks disclose the download URL
    #[arg(long, value_enum, default_value_t = Disclosure::VersionDiffers, env = "OTA_DISCLOSURE")]
    pub disclosure: Disclosure,

    /// Resolve download identity by client address
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "OTA_ADDRESS_FALLBACK")]
    pub address_fallback: bool,

    /// Maximum firmware upload size in MiB
    #[arg(long, default_value_t = 64, env = "OTA_UPLOAD_LIMIT_MB")]
    pub upload_limit_mb: usize,
}

/// Application configuration resolved and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Firmware artifact configuration
    pub firmware: FirmwareConfig,

    /// Path configuration
    pub paths: PathConfig,

    /// OTA protocol settings
    pub ota: OtaSettings,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub upload_limit_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct FirmwareConfig {
    pub dir: PathBuf,
    pub path: Option<PathBuf>,
    pub version: String,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub devices_file: PathBuf,
    pub web_dir: PathBuf,
}

impl AppConfig {
    pub fn load(args: Args) -> Result<Self> {
        let server = ServerConfig::load(&args)?;
        let firmware = FirmwareConfig::load(&args)?;
        let paths = PathConfig::load(&args);
        let public_url = public_url(args.base_url.as_deref(), server.bind, server.port);

        let ota = OtaSettings {
            public_url,
            secret: args.token.filter(|token| !token.is_empty()),
            disclosure: args.disclosure,
            address_fallback: args.address_fallback,
        };

        Ok(Self {
            server,
            firmware,
            paths,
            ota,
        })
    }
}

impl ServerConfig {
    fn load(args: &Args) -> Result<Self> {
        let upload_limit_bytes = args
            .upload_limit_mb
            .checked_mul(1024 * 1024)
            .context("failed to parse OTA_UPLOAD_LIMIT_MB: value too large")?;

        Ok(Self {
            bind: args.bind,
            port: args.port,
            upload_limit_bytes,
        })
    }
}

impl FirmwareConfig {
    fn load(args: &Args) -> Result<Self> {
        let (dir, path) = Self::resolve(args.firmware.as_deref(), &args.dir)?;

        let version = args
            .ota_version
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .map(str::to_string)
            .or_else(|| firmware::read_project_version(&dir))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        Ok(Self { dir, path, version })
    }

    /// Firmware directory and active image
    ///
    /// An existing explicit file wins, then the configured directory, then
    /// the fallback directories in order.
    fn resolve(explicit: Option<&Path>, dir: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
        if let Some(file) = explicit {
            if file.is_file() {
                let file = std::path::absolute(file).context("failed to resolve firmware path")?;
                let dir = file
                    .parent()
                    .context("failed to get firmware directory")?
                    .to_path_buf();
                return Ok((dir, Some(file)));
            }
            warn!("firmware file {} does not exist", file.display());
        }

        if dir.is_dir() {
            let dir = std::path::absolute(dir).context("failed to resolve firmware directory")?;
            let path = firmware::locate(&dir);
            return Ok((dir, path));
        }

        for candidate in FALLBACK_FIRMWARE_DIRS {
            let candidate = Path::new(candidate);
            if let Some(path) = firmware::locate(candidate) {
                debug!("found firmware in fallback directory {}", candidate.display());
                let dir = std::path::absolute(candidate)
                    .context("failed to resolve firmware directory")?;
                let path = std::path::absolute(path).context("failed to resolve firmware path")?;
                return Ok((dir, Some(path)));
            }
        }

        Ok((dir.to_path_buf(), None))
    }
}

impl PathConfig {
    fn load(args: &Args) -> Self {
        Self {
            devices_file: args.data_dir.join(DEVICES_FILE_NAME),
            data_dir: args.data_dir.clone(),
            web_dir: args.web_dir.clone(),
        }
    }
}

/// Base of download links: the configured URL or `http://<local ip>:<port>`
pub fn public_url(base_url: Option<&str>, bind: IpAddr, port: u16) -> String {
    if let Some(base_url) = base_url.map(str::trim).filter(|url| !url.is_empty()) {
        return base_url.trim_end_matches('/').to_string();
    }

    let host = if bind.is_unspecified() {
        local_ip()
    } else {
        bind
    };

    format!("http://{}", SocketAddr::new(host, port))
}

/// Address of the interface used for outbound traffic
fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
