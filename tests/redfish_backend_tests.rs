//! Redfish backend tests against an in-process mock controller
//! 基于进程内模拟控制器的 Redfish 后端测试

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use powerall::agent::config::AgentConfig;
use powerall::backends::redfish::RedfishBackend;
use powerall::backends::BackendError;
use powerall::components::bmc::BmcDriver;
use powerall::components::{Component, ControlResult, Guarded, Phase};

const TOKEN: &str = "c0ffee";
const SESSION_URI: &str = "/redfish/v1/SessionService/Sessions/7";
const ETAG: &str = "W/\"42\"";

#[derive(Default)]
struct Log {
    logins: Vec<Value>,
    thermal_gets: usize,
    patches: Vec<(String, Value)>,
    deletes: Vec<String>,
}

#[derive(Default)]
struct Mock {
    log: Mutex<Log>,
    omit_etag: bool,
    reject_member: Option<u64>,
}

type Shared = Arc<Mock>;

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("X-Auth-Token").and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

async fn login(State(mock): State<Shared>, Json(body): Json<Value>) -> Response {
    let accepted = body["Password"] == "secret";
    mock.log.lock().logins.push(body);
    if !accepted {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        StatusCode::CREATED,
        [("X-Auth-Token", TOKEN), ("Location", SESSION_URI)],
        Json(json!({"Id": "7"})),
    )
        .into_response()
}

async fn logout(State(mock): State<Shared>, headers: HeaderMap) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    mock.log.lock().deletes.push(SESSION_URI.to_string());
    StatusCode::NO_CONTENT
}

async fn chassis(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"Manufacturer": "Inspur", "Model": "NF5280M6"})).into_response()
}

async fn thermal(State(mock): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    mock.log.lock().thermal_gets += 1;
    let body = Json(json!({
        "Fans": [
            {
                "Name": "FAN0_F_Speed",
                "Status": {"State": "Enabled", "Health": "OK"},
                "Reading": 5400,
                "ReadingUnits": "RPM",
                "Oem": {"Public": {"ControlMode": "Auto", "SpeedRatio": 30}}
            },
            {
                "Name": "FAN1_F_Speed",
                "Status": {"State": "Enabled", "Health": "Warning"},
                "Reading": "5100",
                "ReadingUnits": "RPM",
                "Oem": {"Public": {"ControlMode": "Auto", "SpeedRatio": null}}
            }
        ]
    }));
    if mock.omit_etag {
        body.into_response()
    } else {
        ([("ETag", ETAG)], body).into_response()
    }
}

async fn patch_thermal(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let if_match = headers
        .get("If-Match")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let member = body["Oem"]["Fans"]["MemberId"].as_u64();
    if member.is_some() && member == mock.reject_member {
        return StatusCode::PRECONDITION_FAILED;
    }
    mock.log.lock().patches.push((if_match, body));
    StatusCode::OK
}

async fn power(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "PowerSupplies": [
            {"PowerInputWatts": 410, "PowerOutputWatts": 390},
            {"PowerInputWatts": null, "PowerOutputWatts": 0}
        ],
        "Oem": {"Public": {
            "CurrentCPUPowerWatts": 160,
            "CurrentMemoryPowerWatts": 35,
            "CurrentFANPowerWatts": 22,
            "TotalPower": 410
        }}
    }))
    .into_response()
}

async fn threshold_sensors(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "Sensors": [
            {"Name": "Inlet_Temp", "Status": "ok", "unit": "deg_c", "ReadingValue": 23.5},
            {"Name": "PSU0_Temp", "Status": "na", "unit": "deg_c", "ReadingValue": null}
        ]
    }))
    .into_response()
}

async fn discrete_sensors(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "Sensors": [
            {"Name": "CPU0_Status", "Status": "Enable"},
            {"Name": "PSU_Redundancy", "Status": "Disable"}
        ]
    }))
    .into_response()
}

async fn start_mock(mock: Mock) -> (SocketAddr, Shared) {
    let mock = Arc::new(mock);
    let app = Router::new()
        .route("/redfish/v1/SessionService/Sessions", post(login))
        .route(SESSION_URI, delete(logout))
        .route("/redfish/v1/Chassis/1", get(chassis))
        .route("/redfish/v1/Chassis/1/Thermal", get(thermal).patch(patch_thermal))
        .route("/redfish/v1/Chassis/1/Power", get(power))
        .route("/redfish/v1/Chassis/1/ThresholdSensors", get(threshold_sensors))
        .route("/redfish/v1/Chassis/1/DiscreteSensors", get(discrete_sensors))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, mock)
}

fn connect(addr: SocketAddr, password: &str) -> Result<RedfishBackend, BackendError> {
    RedfishBackend::connect(&format!("http://{addr}"), "admin", password, false)
}

fn bmc_component(addr: SocketAddr) -> Guarded<BmcDriver> {
    let backend = connect(addr, "secret").expect("login");
    let mut bmc = Guarded::new(BmcDriver::with_backend(backend));
    bmc.setup(&AgentConfig::default());
    bmc
}

fn tokens(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_lifecycle() {
    let (addr, mock) = start_mock(Mock::default()).await;
    tokio::task::spawn_blocking(move || {
        let bmc = bmc_component(addr);
        assert_eq!(bmc.phase(), Phase::Serving);
        let attrs = bmc.get_attrs(&tokens(&["fannums", "cauto"]));
        assert_eq!(attrs["fannums"], json!(2));
        assert_eq!(attrs["cauto"], json!(true));
        bmc.teardown();
    })
    .await
    .unwrap();

    let log = mock.log.lock();
    assert_eq!(log.logins, vec![json!({"UserName": "admin", "Password": "secret"})]);
    assert_eq!(log.deletes, vec![SESSION_URI.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_login() {
    let (addr, _mock) = start_mock(Mock::default()).await;
    let err = tokio::task::spawn_blocking(move || connect(addr, "wrong").err())
        .await
        .unwrap()
        .expect("login must fail");
    assert!(matches!(err, BackendError::Status { status: 401, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_fetches_etag_once() {
    let (addr, mock) = start_mock(Mock::default()).await;
    let observer = mock.clone();
    let (gets_after_setup, result) = tokio::task::spawn_blocking(move || {
        let bmc = bmc_component(addr);
        let gets = observer.log.lock().thermal_gets;
        (gets, bmc.control(&tokens(&["set-auto", "change-speed", "all", "55"])))
    })
    .await
    .unwrap();

    assert_eq!(result, ControlResult::success("bmc control success"));
    let log = mock.log.lock();
    assert_eq!(log.thermal_gets - gets_after_setup, 1);
    assert_eq!(
        log.patches,
        vec![
            (ETAG.to_string(), json!({"Oem": {"Fans": {"ControlMode": "Auto"}}})),
            (
                ETAG.to_string(),
                json!({"Oem": {"Fans": {"ControlMode": "Manual", "MemberId": 0, "SpeedRatio": 55}}})
            ),
            (
                ETAG.to_string(),
                json!({"Oem": {"Fans": {"ControlMode": "Manual", "MemberId": 1, "SpeedRatio": 55}}})
            ),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_without_etag() {
    let (addr, mock) = start_mock(Mock {
        omit_etag: true,
        ..Default::default()
    })
    .await;
    let result = tokio::task::spawn_blocking(move || {
        bmc_component(addr).control(&tokens(&["set-auto"]))
    })
    .await
    .unwrap();
    assert_eq!(result, ControlResult::error("Could not get If-Match"));
    assert!(mock.log.lock().patches.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_patch_reports_fan() {
    let (addr, mock) = start_mock(Mock {
        reject_member: Some(1),
        ..Default::default()
    })
    .await;
    let result = tokio::task::spawn_blocking(move || {
        bmc_component(addr).control(&tokens(&["change-speed", "0-1", "80"]))
    })
    .await
    .unwrap();
    assert_eq!(result, ControlResult::error("bmc fan 1 change speed failed"));
    assert_eq!(mock.log.lock().patches.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scrape_vendor_documents() {
    let (addr, _mock) = start_mock(Mock::default()).await;
    let text = tokio::task::spawn_blocking(move || {
        String::from_utf8(bmc_component(addr).update()).unwrap()
    })
    .await
    .unwrap();

    assert!(text.contains("bmc_machine_info_info{manufacturer=\"Inspur\",model=\"NF5280M6\"} 1"));
    assert!(text.contains("bmc_fan_read{index=\"1\",name=\"FAN1_F_Speed\",readingunits=\"RPM\"} 5100"));
    assert!(text.contains("speedratio=\"None\""));
    assert!(text.contains("bmc_power_info{component=\"total\"} 410"));
    assert!(text.contains("bmc_powersupply_power{index=\"1\",mode=\"input\"} -1"));
    assert!(text.contains("bmc_threshold_sensors_values{name=\"Inlet_Temp\",unit=\"deg_c\"} 23.5"));
    assert!(text.contains("bmc_threshold_sensors_values{name=\"PSU0_Temp\",unit=\"deg_c\"} -1"));
    assert!(text.contains("bmc_discrete_sensors{name=\"PSU_Redundancy\"} 0"));
}

#[test]
fn test_unreachable_controller() {
    // Nothing listens on the discard port.
    let err = RedfishBackend::connect("http://127.0.0.1:9", "admin", "admin", false).err();
    assert!(matches!(err, Some(BackendError::Http(_))));
}
