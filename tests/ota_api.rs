use actix_web::{
    App,
    body::MessageBody,
    dev::{Service, ServiceResponse},
    http::{StatusCode, header},
    test,
};
use esp_ota_server::{
    api::Api,
    services::{
        checksum,
        devices::{DeviceRegistry, DeviceStatus, JsonFileStore},
        firmware::FirmwareStore,
        ota::{OtaService, OtaSettings},
    },
};
use serde_json::{Value, json};
use std::{fs, net::SocketAddr, sync::Arc};
use tempfile::TempDir;

const MAC: &str = "AA:BB:CC:DD:EE:FF";
const PUBLIC_URL: &str = "http://ota.local:8080";
const TWO_MIB: usize = 2 * 1024 * 1024;

struct Fixture {
    api: Api<JsonFileStore>,
    firmware_dir: TempDir,
    data_dir: TempDir,
}

fn fixture(firmware: Option<&[u8]>, secret: Option<&str>) -> Fixture {
    let firmware_dir = TempDir::new().expect("should create firmware dir");
    let data_dir = TempDir::new().expect("should create data dir");
    let web_dir = data_dir.path().join("web");

    let path = firmware.map(|content| {
        let path = firmware_dir.path().join("app.bin");
        fs::write(&path, content).expect("should write firmware");
        path
    });

    let ota = OtaService::new(
        DeviceRegistry::new(JsonFileStore::new(data_dir.path().join("ota_devices.json"))),
        FirmwareStore::new(firmware_dir.path(), path, "1.2.0"),
        OtaSettings {
            public_url: PUBLIC_URL.to_string(),
            secret: secret.map(str::to_string),
            address_fallback: true,
            ..Default::default()
        },
    );

    Fixture {
        api: Api::new(Arc::new(ota), web_dir, 16 * 1024 * 1024),
        firmware_dir,
        data_dir,
    }
}

fn peer() -> SocketAddr {
    "10.0.0.2:51000".parse().expect("valid address")
}

async fn json_body(resp: ServiceResponse<impl MessageBody>) -> Value {
    let body = test::read_body(resp).await;
    serde_json::from_slice(&body).expect("should be json")
}

async fn check_version<S, B>(app: &S, mac: &str, version: &str) -> ServiceResponse<B>
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let req = test::TestRequest::post()
        .uri("/")
        .peer_addr(peer())
        .insert_header(("Device-Id", mac))
        .set_json(json!({ "version": version, "chip": "ESP32-S3", "cores": 2, "flash_kb": 8192 }))
        .to_request();
    test::call_service(app, req).await
}

async fn approve<S, B>(app: &S, mac: &str) -> ServiceResponse<B>
where
    S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let req = test::TestRequest::post()
        .uri("/api/approve-device")
        .set_json(json!({ "mac": mac }))
        .to_request();
    test::call_service(app, req).await
}

fn multipart(file_name: &str, content: &[u8], version: Option<&str>) -> (String, Vec<u8>) {
    let boundary = "ota-test-boundary";
    let mut body = Vec::new();

    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(b"\r\n");

    if let Some(version) = version {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"version\"\r\n\r\n{version}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[tokio::test]
async fn unknown_device_is_registered_pending_without_url() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let resp = check_version(&app, MAC, "1.0.0").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body, json!({ "firmware": { "version": "1.2.0", "force": 0 } }));

    let record = fixture.api.ota.registry().get(MAC).expect("registered");
    assert_eq!(record.status, DeviceStatus::Pending);
    assert_eq!(record.ip, "10.0.0.2");
    assert_eq!(record.chip, "ESP32-S3");
    assert_eq!(record.app_version, "1.0.0");
}

#[tokio::test]
async fn approved_device_gets_url_and_downloads_whole_artifact() {
    let firmware = vec![0x5a_u8; TWO_MIB];
    let fixture = fixture(Some(firmware.as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    check_version(&app, MAC, "1.0.0").await;
    let resp = approve(&app, MAC).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({ "ok": true, "status": "approved" }));

    let resp = check_version(&app, MAC, "1.0.0").await;
    let body = json_body(resp).await;
    assert_eq!(body["firmware"]["version"], "1.2.0");
    assert_eq!(body["firmware"]["url"], format!("{PUBLIC_URL}/app.bin"));

    let downloads_before = fixture.api.ota.counters().downloads();
    let req = test::TestRequest::get()
        .uri("/firmware.bin")
        .peer_addr(peer())
        .insert_header(("Device-Id", MAC))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_LENGTH).expect("length"),
        TWO_MIB.to_string().as_str()
    );
    let disposition = resp
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .expect("disposition")
        .to_str()
        .expect("ascii");
    assert!(disposition.contains("attachment"));
    assert!(disposition.contains("app.bin"));

    let body = test::read_body(resp).await;
    assert_eq!(body.len(), 2_097_152);
    assert_eq!(fixture.api.ota.counters().downloads(), downloads_before + 1);
    assert!(fixture.api.ota.transfers().is_empty());
}

#[tokio::test]
async fn current_device_gets_no_url() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    check_version(&app, MAC, "1.2.0").await;
    approve(&app, MAC).await;

    let body = json_body(check_version(&app, MAC, "1.2.0").await).await;
    assert!(body["firmware"].get("url").is_none());
}

#[tokio::test]
async fn unknown_device_download_is_forbidden() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::get()
        .uri("/firmware.bin")
        .peer_addr(peer())
        .insert_header(("Device-Id", "11:22:33:44:55:66"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(json_body(resp).await["error"].is_string());
    assert!(fixture.api.ota.registry().is_empty());
    assert_eq!(fixture.api.ota.counters().downloads(), 0);
}

#[tokio::test]
async fn pending_and_denied_downloads_are_forbidden() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;
    check_version(&app, MAC, "1.0.0").await;

    for uri in ["/firmware.bin", "/app.bin", "/missing.bin"] {
        let req = test::TestRequest::get()
            .uri(&format!("{uri}?mac={MAC}"))
            .peer_addr(peer())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "pending {uri}");
    }

    let req = test::TestRequest::post()
        .uri("/api/deny-device")
        .set_json(json!({ "mac": MAC }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri("/app.bin")
        .peer_addr(peer())
        .insert_header(("Device-Id", MAC))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::FORBIDDEN
    );
}

#[tokio::test]
async fn named_download_and_missing_file() {
    let fixture = fixture(Some(b"active".as_slice()), None);
    fs::write(fixture.firmware_dir.path().join("other.bin"), b"other firmware")
        .expect("should write");
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;
    check_version(&app, MAC, "1.0.0").await;
    approve(&app, MAC).await;

    let req = test::TestRequest::get()
        .uri("/other.bin")
        .peer_addr(peer())
        .insert_header(("Device-Id", MAC))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(test::read_body(resp).await.as_ref(), b"other firmware");

    let req = test::TestRequest::get()
        .uri("/missing.bin")
        .peer_addr(peer())
        .insert_header(("Device-Id", MAC))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn version_check_requires_identity() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/")
        .set_json(json!({ "version": "1.0.0" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/")
        .insert_header(header::ContentType::json())
        .set_payload("not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(resp).await["error"].is_string());

    assert!(fixture.api.ota.registry().is_empty());
}

#[tokio::test]
async fn version_json_query_form() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::get()
        .uri(&format!("/version.json?mac={MAC}&v=1.0.0"))
        .peer_addr(peer())
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body, json!({ "version": "1.2.0" }));
    assert_eq!(
        fixture.api.ota.registry().get(MAC).expect("registered").app_version,
        "1.0.0"
    );

    approve(&app, MAC).await;
    let req = test::TestRequest::get()
        .uri(&format!("/version.json?mac={MAC}&v=1.0.0"))
        .peer_addr(peer())
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body["firmware_url"], format!("{PUBLIC_URL}/app.bin"));
}

#[tokio::test]
async fn admin_cannot_approve_unknown_device() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let resp = approve(&app, "11:22:33:44:55:66").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = approve(&app, "").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_extracts_version_from_file_name() {
    let fixture = fixture(Some(b"old firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let (content_type, body) = multipart("firmware_v2.0.1.bin", &[0xab; 4096], None);
    let req = test::TestRequest::post()
        .uri("/api/upload-firmware")
        .insert_header((header::CONTENT_TYPE, content_type))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        json_body(resp).await,
        json!({ "ok": true, "version": "2.0.1", "size": "4.0 KB" })
    );

    let active = fixture.api.ota.firmware().active().expect("active");
    assert_eq!(active.path, fixture.firmware_dir.path().join("firmware_v2.0.1.bin"));
    assert_eq!(fixture.api.ota.firmware().version(), "2.0.1");
}

#[tokio::test]
async fn upload_with_explicit_version_and_wrong_extension() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let (content_type, body) = multipart("firmware_v2.0.1.bin", b"image", Some("3.0.0"));
    let req = test::TestRequest::post()
        .uri("/api/upload-firmware")
        .insert_header((header::CONTENT_TYPE, content_type))
        .set_payload(body)
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body["version"], "3.0.0");

    let (content_type, body) = multipart("firmware.elf", b"elf", None);
    let req = test::TestRequest::post()
        .uri("/api/upload-firmware")
        .insert_header((header::CONTENT_TYPE, content_type))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!fixture.firmware_dir.path().join("firmware.elf").exists());
    assert_eq!(fixture.api.ota.firmware().version(), "3.0.0");
}

#[tokio::test]
async fn non_firmware_upload_is_rejected_before_spooling() {
    let fixture = fixture(Some(b"old firmware".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    // larger than the form limit, so only a check on the name can answer first
    let (content_type, body) = multipart("image.elf", &vec![0u8; 17 * 1024 * 1024], None);
    let req = test::TestRequest::post()
        .uri("/api/upload-firmware")
        .insert_header((header::CONTENT_TYPE, content_type))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert!(
        body["error"]
            .as_str()
            .expect("error reason")
            .contains("image.elf")
    );
    assert!(!fixture.firmware_dir.path().join("image.elf").exists());
    assert_eq!(
        fixture.api.ota.firmware().active().expect("active").name,
        "app.bin"
    );
}

#[tokio::test]
async fn set_version() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/api/set-version")
        .set_json(json!({ "version": "1.3.0" }))
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body, json!({ "ok": true, "old": "1.2.0", "new": "1.3.0" }));

    for version in ["", "   "] {
        let req = test::TestRequest::post()
            .uri("/api/set-version")
            .set_json(json!({ "version": version }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(fixture.api.ota.firmware().version(), "1.3.0");
}

#[tokio::test]
async fn token_validation() {
    let fixture = fixture(Some(b"firmware".as_slice()), Some("VIBO-KEY"));
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/validate-token")
        .peer_addr(peer())
        .set_json(json!({ "mac": MAC, "token_hash": "deadbeefdeadbeef" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(resp).await["status"], "denied");
    assert!(fixture.api.ota.registry().is_empty());

    let req = test::TestRequest::post()
        .uri("/validate-token")
        .peer_addr(peer())
        .set_json(json!({
            "mac": MAC,
            "token_hash": checksum::token_hash("VIBO-KEY", MAC),
            "chip": "ESP32",
            "app_version": "1.0.0",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({ "status": "pending" }));

    let req = test::TestRequest::get()
        .uri(&format!("/token-status?mac={MAC}"))
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body, json!({ "status": "pending" }));

    approve(&app, MAC).await;
    let req = test::TestRequest::get()
        .uri(&format!("/token-status?mac={MAC}"))
        .to_request();
    let body = json_body(test::call_service(&app, req).await).await;
    assert_eq!(body["status"], "approved");
    assert_eq!(body["firmware_url"], format!("{PUBLIC_URL}/app.bin"));

    let req = test::TestRequest::get().uri("/token-status").to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn dashboard_data_snapshot() {
    let fixture = fixture(Some(b"hello".as_slice()), None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;
    check_version(&app, MAC, "1.0.0").await;

    let req = test::TestRequest::get().uri("/api/data").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["server"]["address"], PUBLIC_URL);
    assert_eq!(body["server"]["version"], "1.2.0");
    assert_eq!(body["server"]["checks"], 1);
    assert_eq!(body["server"]["downloads"], 0);
    assert_eq!(body["version_clients"]["10.0.0.2"]["count"], 1);
    assert_eq!(body["devices"][MAC]["status"], "pending");
    assert_eq!(body["firmware"]["name"], "app.bin");
    assert_eq!(body["firmware"]["size"], "5 B");
    assert_eq!(body["firmware"]["md5"], "5d41402abc4b2a76b9719d911017c592");
    assert_eq!(body["active_downloads"], json!({}));
}

#[tokio::test]
async fn dashboard_page_requires_assets() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::get().uri("/dashboard").to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::NOT_FOUND
    );

    fs::create_dir_all(&fixture.api.web_dir).expect("should create web dir");
    fs::write(fixture.api.web_dir.join("index.html"), "<html>OTA</html>").expect("should write");

    let req = test::TestRequest::get().uri("/").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(test::read_body(resp).await.as_ref(), b"<html>OTA</html>");
}

#[tokio::test]
async fn status_survives_restart() {
    let fixture = fixture(Some(b"firmware".as_slice()), None);
    {
        let app =
            test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;
        check_version(&app, MAC, "1.0.0").await;
        approve(&app, MAC).await;
    }

    let restarted = DeviceRegistry::new(JsonFileStore::new(
        fixture.data_dir.path().join("ota_devices.json"),
    ));
    restarted.load();
    assert_eq!(
        restarted.get(MAC).expect("persisted").status,
        DeviceStatus::Approved
    );
}

#[tokio::test]
async fn rejected_token_cannot_register_through_version_check() {
    let fixture = fixture(Some(b"firmware".as_slice()), Some("VIBO-KEY"));
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/validate-token")
        .peer_addr(peer())
        .set_json(json!({ "mac": MAC, "token_hash": "deadbeefdeadbeef" }))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::FORBIDDEN
    );

    let resp = check_version(&app, MAC, "1.0.0").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri(&format!("/version.json?mac={MAC}&v=1.0.0"))
        .peer_addr(peer())
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::FORBIDDEN
    );
    assert!(fixture.api.ota.registry().is_empty());
}

#[tokio::test]
async fn malformed_hardware_fields_still_register() {
    let fixture = fixture(None, None);
    let app = test::init_service(App::new().configure(|cfg| fixture.api.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/")
        .peer_addr(peer())
        .set_json(json!({ "mac": MAC, "version": "1.0.0", "cores": "2", "flash_kb": "n/a" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let record = fixture.api.ota.registry().get(MAC).expect("registered");
    assert_eq!(record.cores, 2);
    assert_eq!(record.flash_kb, 0);
    assert_eq!(record.app_version, "1.0.0");
}
