use crate::{
    error::ServiceError,
    services::{
        devices::{DeviceReport, DeviceStore},
        firmware::{self, FIRMWARE_EXTENSION},
        ota::{DownloadRequest, OtaService, TokenValidation, VersionCheck},
    },
};
use actix_files::{Files, NamedFile};
use actix_multipart::{
    Field, MultipartError,
    form::{FieldReader, Limits, MultipartForm, MultipartFormConfig, tempfile::TempFile, text::Text},
};
use actix_web::{
    HttpRequest, HttpResponse, Responder, ResponseError,
    error::{JsonPayloadError, QueryPayloadError},
    http::header::{ContentDisposition, ContentType, DispositionParam, DispositionType},
    web,
};
use futures_util::future::LocalBoxFuture;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_valid::Validate;
use std::{path::PathBuf, sync::Arc};

pub const DEVICE_ID_HEADER: &str = "Device-Id";
const MEMORY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Deserialize)]
pub struct VersionCheckPayload {
    #[serde(default)]
    mac: Option<String>,
    #[serde(flatten)]
    report: DeviceReport,
}

#[derive(Deserialize)]
pub struct VersionQuery {
    mac: Option<String>,
    v: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenPayload {
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    token_hash: String,
    #[serde(flatten)]
    report: DeviceReport,
}

#[derive(Deserialize)]
pub struct IdentityQuery {
    mac: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct DevicePayload {
    #[validate(min_length = 1)]
    mac: String,
}

#[derive(Deserialize, Validate)]
pub struct SetVersionPayload {
    #[serde(default)]
    #[validate(min_length = 1)]
    version: String,
}

#[derive(MultipartForm)]
pub struct UploadForm {
    file: FirmwareFile,
    version: Option<Text<String>>,
}

/// Uploaded image spooled to a temporary file
///
/// The file name is checked before the first byte is written, so a
/// non-firmware upload never reaches the disk.
pub struct FirmwareFile(TempFile);

impl<'t> FieldReader<'t> for FirmwareFile {
    type Future = LocalBoxFuture<'t, Result<Self, MultipartError>>;

    fn read_field(req: &'t HttpRequest, field: Field, limits: &'t mut Limits) -> Self::Future {
        Box::pin(async move {
            let file_name = field
                .content_disposition()
                .and_then(|disposition| disposition.get_filename())
                .unwrap_or_default();

            if !firmware::is_firmware_file_name(file_name) {
                return Err(MultipartError::Field {
                    name: field.name().unwrap_or_default().to_string(),
                    source: ServiceError::invalid_input(format!(
                        "only .{FIRMWARE_EXTENSION} files allowed, got '{file_name}'"
                    ))
                    .into(),
                });
            }

            TempFile::read_field(req, field, limits).await.map(Self)
        })
    }
}

#[derive(Serialize)]
struct FirmwareOffer {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    force: u8,
}

#[derive(Serialize)]
struct VersionCheckResponse {
    firmware: FirmwareOffer,
}

#[derive(Serialize)]
struct VersionResponse {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware_url: Option<String>,
}

pub struct Api<Store>
where
    Store: DeviceStore,
{
    pub ota: Arc<OtaService<Store>>,
    pub web_dir: PathBuf,
    pub upload_limit_bytes: usize,
}

impl<Store: DeviceStore> Clone for Api<Store> {
    fn clone(&self) -> Self {
        Self {
            ota: Arc::clone(&self.ota),
            web_dir: self.web_dir.clone(),
            upload_limit_bytes: self.upload_limit_bytes,
        }
    }
}

/// Convert a service result into a JSON response, logging failures
pub fn handle_service_result<T>(result: Result<T, ServiceError>, operation: &str) -> HttpResponse
where
    T: Serialize,
{
    match result {
        Ok(data) => HttpResponse::Ok().json(data),
        Err(e) => handle_service_error(e, operation),
    }
}

fn handle_service_error(e: ServiceError, operation: &str) -> HttpResponse {
    if e.is_client_error() {
        debug!("{operation} rejected: {e}");
    } else {
        error!("{operation} failed: {e:#}");
    }
    e.error_response()
}

fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServiceError::invalid_input(format!("invalid JSON: {err}")).into()
}

fn multipart_error(err: MultipartError, _req: &HttpRequest) -> actix_web::Error {
    match err {
        MultipartError::Field { source, .. } => source,
        err => err.into(),
    }
}

fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ServiceError::invalid_input(format!("invalid query: {err}")).into()
}

/// Identity from the `Device-Id` header, else from the request itself
fn device_identity(req: &HttpRequest, fallback: Option<&str>) -> Option<String> {
    req.headers()
        .get(DEVICE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .or(fallback)
        .map(str::to_string)
}

fn client_address(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

impl<Store> Api<Store>
where
    Store: DeviceStore + 'static,
{
    pub fn new(ota: Arc<OtaService<Store>>, web_dir: PathBuf, upload_limit_bytes: usize) -> Self {
        Api {
            ota,
            web_dir,
            upload_limit_bytes,
        }
    }

    /// Register shared state and the route table
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::new(self.clone()))
            .app_data(web::JsonConfig::default().error_handler(json_error))
            .app_data(web::QueryConfig::default().error_handler(query_error))
            .app_data(
                MultipartFormConfig::default()
                    .total_limit(self.upload_limit_bytes)
                    .memory_limit(MEMORY_LIMIT_BYTES)
                    .error_handler(multipart_error),
            )
            .route("/", web::get().to(Self::dashboard))
            .route("/", web::post().to(Self::check_version))
            .route("/dashboard", web::get().to(Self::dashboard))
            .route("/version.json", web::get().to(Self::version_json))
            .route("/validate-token", web::post().to(Self::validate_token))
            .route("/token-status", web::get().to(Self::token_status))
            .route("/firmware.bin", web::get().to(Self::download_default))
            .route("/api/approve-device", web::post().to(Self::approve_device))
            .route("/api/deny-device", web::post().to(Self::deny_device))
            .route("/api/upload-firmware", web::post().to(Self::upload_firmware))
            .route("/api/set-version", web::post().to(Self::set_version))
            .route("/api/data", web::get().to(Self::data));

        let static_dir = self.web_dir.join("static");
        if static_dir.is_dir() {
            cfg.service(Files::new("/static", static_dir));
        }

        cfg.route(r"/{name:[^/]+\.bin}", web::get().to(Self::download_named));
    }

    pub async fn dashboard(api: web::Data<Self>) -> actix_web::Result<NamedFile> {
        debug!("dashboard() called");
        Ok(NamedFile::open_async(api.web_dir.join("index.html")).await?)
    }

    pub async fn check_version(
        req: HttpRequest,
        body: web::Json<VersionCheckPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("check_version() called");

        let body = body.into_inner();
        let check = VersionCheck {
            identity: device_identity(&req, body.mac.as_deref()),
            address: client_address(&req),
            report: body.report,
        };

        let result = api.ota.check_version(check).map(|info| VersionCheckResponse {
            firmware: FirmwareOffer {
                version: info.version,
                url: info.firmware_url,
                force: u8::from(info.force),
            },
        });

        handle_service_result(result, "check_version")
    }

    pub async fn version_json(
        req: HttpRequest,
        query: web::Query<VersionQuery>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("version_json() called");

        let query = query.into_inner();
        let check = VersionCheck {
            identity: device_identity(&req, query.mac.as_deref()),
            address: client_address(&req),
            report: DeviceReport {
                app_version: query.v,
                ..Default::default()
            },
        };

        let result = api.ota.check_version(check).map(|info| VersionResponse {
            version: info.version,
            firmware_url: info.firmware_url,
        });

        handle_service_result(result, "version_json")
    }

    pub async fn validate_token(
        req: HttpRequest,
        body: web::Json<TokenPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("validate_token() called");

        let body = body.into_inner();
        let request = TokenValidation {
            identity: body.mac,
            address: client_address(&req),
            token_hash: body.token_hash,
            report: body.report,
        };

        handle_service_result(api.ota.validate_token(request), "validate_token")
    }

    pub async fn token_status(
        query: web::Query<IdentityQuery>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("token_status() called");
        handle_service_result(api.ota.token_status(query.mac.as_deref()), "token_status")
    }

    pub async fn download_default(
        req: HttpRequest,
        query: web::Query<IdentityQuery>,
        api: web::Data<Self>,
    ) -> HttpResponse {
        debug!("download_default() called");
        Self::download(&req, None, query.into_inner(), &api).await
    }

    pub async fn download_named(
        req: HttpRequest,
        name: web::Path<String>,
        query: web::Query<IdentityQuery>,
        api: web::Data<Self>,
    ) -> HttpResponse {
        debug!("download_named() called: {name}");
        Self::download(&req, Some(name.into_inner()), query.into_inner(), &api).await
    }

    pub async fn approve_device(
        body: web::Json<DevicePayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("approve_device() called");

        let result = Self::validated(&*body)
            .and_then(|_| api.ota.approve_device(&body.mac))
            .map(|record| json!({ "ok": true, "status": record.status }));

        handle_service_result(result, "approve_device")
    }

    pub async fn deny_device(body: web::Json<DevicePayload>, api: web::Data<Self>) -> impl Responder {
        debug!("deny_device() called");

        let result = Self::validated(&*body)
            .and_then(|_| api.ota.deny_device(&body.mac))
            .map(|record| json!({ "ok": true, "status": record.status }));

        handle_service_result(result, "deny_device")
    }

    pub async fn upload_firmware(
        MultipartForm(form): MultipartForm<UploadForm>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("upload_firmware() called");

        let result = async {
            let FirmwareFile(file) = form.file;
            let name = file
                .file_name
                .as_deref()
                .ok_or_else(|| ServiceError::invalid_input("missing file name"))?;
            let source = tokio::fs::File::open(file.file.path())
                .await
                .map_err(ServiceError::io("failed to open uploaded file"))?;
            let version = form.version.as_ref().map(|version| version.as_str());

            api.ota.upload_firmware(name, source, version).await
        }
        .await;

        handle_service_result(result, "upload_firmware")
    }

    pub async fn set_version(
        body: web::Json<SetVersionPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("set_version() called");

        let result = Self::validated(&*body)
            .and_then(|_| api.ota.set_version(&body.version))
            .map(|(old, new)| json!({ "ok": true, "old": old, "new": new }));

        handle_service_result(result, "set_version")
    }

    pub async fn data(api: web::Data<Self>) -> impl Responder {
        debug!("data() called");
        handle_service_result(api.ota.dashboard().await, "data")
    }

    async fn download(
        req: &HttpRequest,
        name: Option<String>,
        query: IdentityQuery,
        api: &Self,
    ) -> HttpResponse {
        let request = DownloadRequest {
            name,
            identity: device_identity(req, query.mac.as_deref()),
            address: client_address(req),
        };

        match api.ota.download(request).await {
            Ok(download) => HttpResponse::Ok()
                .content_type(ContentType::octet_stream())
                .insert_header(ContentDisposition {
                    disposition: DispositionType::Attachment,
                    parameters: vec![DispositionParam::Filename(download.name)],
                })
                .no_chunking(download.size)
                .streaming(download.chunks),
            Err(e) => handle_service_error(e, "download_firmware"),
        }
    }

    fn validated<T: Validate>(payload: &T) -> Result<(), ServiceError> {
        payload
            .validate()
            .map_err(|e| ServiceError::invalid_input(e.to_string()))
    }
}
