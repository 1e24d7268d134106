//! Integration tests for the request dispatcher.
//!
//! These tests push device requests through a running server (registry,
//! dispatcher, request loop) via the dispatch harness and check the CoAP
//! answers and the resulting registry state.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

use std::net::SocketAddr;
use std::time::Duration;

use shepherd_core::{ClientName, DeviceStatus};
use shepherd_protocol::{CoapResponse, InboundRequest, Method, OutboundResponse, ResponseCode};
use shepherdd::config::ShepherdConfig;
use shepherdd::registry::ShepherdEvent;
use shepherdd::testing::DispatchHarness;
use tokio::sync::broadcast;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

const REGISTER_QUERY: &str = "ep=dev1&lt=86400&lwm2m=1.0.0&mac=AA:BB:CC:DD";

fn source() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn register_request(query: &str) -> InboundRequest {
    InboundRequest::new(Method::Post, "/rd", source())
        .with_query(query)
        .with_payload("</x/0>,</x/1>")
}

async fn send(harness: &DispatchHarness, request: InboundRequest) -> OutboundResponse {
    timeout(EVENT_TIMEOUT, harness.send(request))
        .await
        .expect("server should answer")
        .expect("server should be running")
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ShepherdEvent>, pred: F) -> ShepherdEvent
where
    F: Fn(&ShepherdEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event should arrive")
}

/// Registers `dev1` and waits until its bootstrap has finished.
async fn registered(harness: &DispatchHarness) -> broadcast::Receiver<ShepherdEvent> {
    let mut events = harness.registry().subscribe();
    let response = send(harness, register_request(REGISTER_QUERY)).await;
    assert_eq!(response.code, ResponseCode::Created);
    wait_for(&mut events, |e| matches!(e, ShepherdEvent::Incoming { .. })).await;
    events
}

// ============================================================================
// Registration Tests
// ============================================================================

#[tokio::test]
async fn test_register_then_deregister_flow() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let mut events = harness.registry().subscribe();

    let response = send(&harness, register_request(REGISTER_QUERY)).await;
    assert_eq!(response.code, ResponseCode::Created);
    assert_eq!(response.location_path, vec!["rd".to_string(), "1".to_string()]);

    let dev1 = ClientName::new("dev1");
    let device = harness.registry().find(&dev1).await.expect("dev1 registered");
    assert_eq!(device.ip, "127.0.0.1");
    assert_eq!(device.port, 40000);
    assert_eq!(device.object_list.get("x"), Some(&vec!["0".to_string(), "1".to_string()]));

    wait_for(&mut events, |e| matches!(e, ShepherdEvent::Incoming { .. })).await;

    let delete = InboundRequest::new(Method::Delete, "/rd/1", source());
    let response = send(&harness, delete).await;
    assert_eq!(response.code, ResponseCode::Deleted);
    assert!(harness.registry().find(&dev1).await.is_none());

    let leaving = wait_for(&mut events, |e| {
        matches!(e, ShepherdEvent::Incoming { .. } | ShepherdEvent::Leaving { .. })
    })
    .await;
    assert_eq!(
        leaving,
        ShepherdEvent::Leaving {
            client_name: dev1,
            mac: Some("AA:BB:CC:DD".to_string()),
        }
    );
}

#[tokio::test]
async fn test_register_rejects_unknown_query_key() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let response = send(&harness, register_request("ep=dev1&color=blue")).await;

    assert_eq!(response.code, ResponseCode::BadRequest);
    assert!(harness.registry().list().await.is_empty());
}

#[tokio::test]
async fn test_register_rejects_unsupported_version() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let response = send(&harness, register_request("ep=dev1&lwm2m=2.0")).await;

    assert_eq!(response.code, ResponseCode::BadRequest);
    assert!(harness.registry().list().await.is_empty());
}

#[tokio::test]
async fn test_register_payload_must_be_link_format() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let request = InboundRequest::new(Method::Post, "/rd", source()).with_query("ep=dev1");

    let response = send(&harness, request).await;

    // An empty payload is an empty object list, which is a valid listing
    assert_eq!(response.code, ResponseCode::Created);

    let request = InboundRequest::new(Method::Post, "/rd", source())
        .with_query("ep=dev2")
        .with_payload("/3/0");
    let response = send(&harness, request).await;
    assert_eq!(response.code, ResponseCode::BadRequest);
}

#[tokio::test]
async fn test_register_refused_while_join_gate_closed() {
    let harness = DispatchHarness::new(ShepherdConfig {
        always_permit_join: false,
        ..ShepherdConfig::default()
    });

    let response = send(&harness, register_request(REGISTER_QUERY)).await;

    assert_eq!(response.code, ResponseCode::NotAllowed);
    assert!(harness.registry().list().await.is_empty());
}

#[tokio::test]
async fn test_register_refused_when_registry_full() {
    let harness = DispatchHarness::new(ShepherdConfig {
        max_devices: 1,
        ..ShepherdConfig::default()
    });
    send(&harness, register_request(REGISTER_QUERY)).await;

    let response = send(&harness, register_request("ep=dev2")).await;

    assert_eq!(response.code, ResponseCode::ServiceUnavailable);
}

#[tokio::test]
async fn test_endpoint_prefix_is_stripped() {
    let harness = DispatchHarness::new(ShepherdConfig {
        client_name_prefix_strip: Some("urn:dev:".to_string()),
        ..ShepherdConfig::default()
    });

    let response = send(&harness, register_request("ep=urn:dev:sensor-7")).await;

    assert_eq!(response.code, ResponseCode::Created);
    assert!(harness.registry().find(&ClientName::new("sensor-7")).await.is_some());
}

// ============================================================================
// Update / Deregister Tests
// ============================================================================

#[tokio::test]
async fn test_update_changes_lifetime() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let mut events = registered(&harness).await;

    let update = InboundRequest::new(Method::Post, "/rd/1", source()).with_query("lt=120");
    let response = send(&harness, update).await;
    assert_eq!(response.code, ResponseCode::Changed);

    let event = wait_for(&mut events, |e| matches!(e, ShepherdEvent::Update { .. })).await;
    match event {
        ShepherdEvent::Update { client_name, diff } => {
            assert_eq!(client_name.as_str(), "dev1");
            assert_eq!(diff.get("lifetime"), Some(&serde_json::json!(120)));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let device = harness.registry().find(&ClientName::new("dev1")).await.unwrap();
    assert_eq!(device.lifetime, 120);
}

#[tokio::test]
async fn test_update_with_failed_reread_is_server_error() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let mut events = harness.registry().subscribe();
    let register = InboundRequest::new(Method::Post, "/rd", source())
        .with_query("ep=dev1")
        .with_payload("</3/0>");
    assert_eq!(send(&harness, register).await.code, ResponseCode::Created);
    wait_for(&mut events, |e| matches!(e, ShepherdEvent::Incoming { .. })).await;

    harness
        .transport()
        .respond(Method::Get, "/5", CoapResponse::new(ResponseCode::NotFound));
    let update = InboundRequest::new(Method::Post, "/rd/1", source()).with_payload("</3/0>,</5/0>");
    let response = send(&harness, update).await;

    assert_eq!(response.code, ResponseCode::ServerError);
    let mut seen = Vec::new();
    let error = timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            seen.push(event.name());
            if matches!(event, ShepherdEvent::Error { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("error event should arrive");
    assert_eq!(error.client_name().map(ClientName::as_str), Some("dev1"));
    while let Ok(event) = events.try_recv() {
        seen.push(event.name());
    }
    assert!(!seen.contains(&"device::update"), "{seen:?}");
}

#[tokio::test]
async fn test_update_of_restored_device_requires_registration() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    registered(&harness).await;
    assert_eq!(harness.registry().reset(false).await, Ok(1));

    let update = InboundRequest::new(Method::Post, "/rd/1", source()).with_query("lt=100");
    let response = send(&harness, update).await;

    assert_eq!(response.code, ResponseCode::NotFound);
    let dev1 = ClientName::new("dev1");
    let device = harness.registry().find(&dev1).await.unwrap();
    assert!(!device.registered);
    assert_eq!(device.status, DeviceStatus::Offline);
    assert!(harness.registry().read(&dev1, "/3/0").await.is_err());
}

#[tokio::test]
async fn test_update_unknown_location_is_not_found() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let update = InboundRequest::new(Method::Post, "/rd/42", source()).with_query("lt=120");
    let response = send(&harness, update).await;

    assert_eq!(response.code, ResponseCode::NotFound);
}

#[tokio::test]
async fn test_deregister_unknown_location_is_not_found() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let response = send(&harness, InboundRequest::new(Method::Delete, "/rd/42", source())).await;

    assert_eq!(response.code, ResponseCode::NotFound);
}

// ============================================================================
// Check / Lookup / Misc Tests
// ============================================================================

#[tokio::test]
async fn test_check_out_and_in() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let mut events = registered(&harness).await;
    let dev1 = ClientName::new("dev1");

    let out = InboundRequest::new(Method::Put, "/rd/1", source()).with_query("chk=out&t=300");
    assert_eq!(send(&harness, out).await.code, ResponseCode::Changed);
    assert_eq!(harness.registry().find(&dev1).await.unwrap().status, DeviceStatus::Sleep);
    wait_for(&mut events, |e| {
        matches!(e, ShepherdEvent::Status { status: DeviceStatus::Sleep, .. })
    })
    .await;

    let woken_at: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let check_in = InboundRequest::new(Method::Put, "/rd/1", woken_at).with_query("chk=in");
    assert_eq!(send(&harness, check_in).await.code, ResponseCode::Changed);

    wait_for(&mut events, |e| {
        matches!(e, ShepherdEvent::Status { status: DeviceStatus::Online, .. })
    })
    .await;
    assert_eq!(harness.registry().find(&dev1).await.unwrap().port, 40001);
}

#[tokio::test]
async fn test_check_with_bad_direction_is_bad_request() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    registered(&harness).await;

    let check = InboundRequest::new(Method::Put, "/rd/1", source()).with_query("chk=sideways");

    assert_eq!(send(&harness, check).await.code, ResponseCode::BadRequest);
}

#[tokio::test]
async fn test_lookup_returns_link_and_event() {
    let harness = DispatchHarness::new(ShepherdConfig::default());
    let mut events = registered(&harness).await;

    let lookup = InboundRequest::new(Method::Get, "/rd-lookup/ep", source()).with_query("ep=dev1");
    let response = send(&harness, lookup).await;

    assert_eq!(response.code, ResponseCode::Content);
    assert_eq!(response.payload_text(), "<coap://127.0.0.1:40000>;ep=dev1");
    let event = wait_for(&mut events, |e| matches!(e, ShepherdEvent::Lookup { .. })).await;
    assert_eq!(event.client_name().map(ClientName::as_str), Some("dev1"));
}

#[tokio::test]
async fn test_lookup_errors() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let unknown = InboundRequest::new(Method::Get, "/rd-lookup/ep", source()).with_query("ep=nobody");
    assert_eq!(send(&harness, unknown).await.code, ResponseCode::NotFound);

    let nameless = InboundRequest::new(Method::Get, "/rd-lookup/ep", source());
    assert_eq!(send(&harness, nameless).await.code, ResponseCode::BadRequest);
}

#[tokio::test]
async fn test_empty_message_is_reset() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let response = send(&harness, InboundRequest::empty(source())).await;

    assert!(response.reset);
}

#[tokio::test]
async fn test_diagnostic_self_test() {
    let harness = DispatchHarness::new(ShepherdConfig::default());

    let response = send(&harness, InboundRequest::new(Method::Get, "/test", source())).await;

    assert_eq!(response.code, ResponseCode::Content);
    assert_eq!(response.payload_text(), shepherdd::server::DIAGNOSTIC_REPLY);
}
