// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use fleetward_core::probe::{Management, ProbeError, ProbeTarget, RouterOsClient};
use fleetward_types::SessionKind;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// base64("admin:secret")
const AUTH: &str = "Basic YWRtaW46c2VjcmV0";

async fn setup() -> (MockServer, RouterOsClient, ProbeTarget) {
    let server = MockServer::start().await;
    let address = server.address();
    let IpAddr::V4(ip) = address.ip() else {
        panic!("mock server bound to a non-IPv4 address");
    };
    let target = ProbeTarget::new(Uuid::new_v4(), ip, address.port(), "admin", "secret");
    let client = RouterOsClient::new(Duration::from_secs(5)).unwrap();
    (server, client, target)
}

#[tokio::test]
async fn resources_are_parsed() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .and(header("authorization", AUTH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cpu-load": "12",
            "free-memory": "402653184",
            "total-memory": "536870912",
            "uptime": "3d04:05:06",
            "board-name": "hAP ac2"
        })))
        .mount(&server)
        .await;

    let snapshot = client.resources(&target).await.unwrap();
    assert_eq!(snapshot.cpu_percent, 12.0);
    assert_eq!(snapshot.memory_percent, 25.0);
    assert_eq!(snapshot.uptime_secs, 3 * 86_400 + 4 * 3_600 + 5 * 60 + 6);
}

#[tokio::test]
async fn rejected_credentials() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client.resources(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Unauthorized));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn server_error_keeps_body() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let err = client.resources(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Status { status: 500, ref body } if body == "internal"));
}

#[tokio::test]
async fn malformed_body_is_decode_error() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = client.resources(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Decode(_)));
}

#[tokio::test]
async fn sessions_combine_hotspot_and_ppp() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/hotspot/active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { ".id": "*1", "user": "alice", "address": "10.5.50.2", "mac-address": "AA:BB:CC:00:00:01" },
            { ".id": "*2", "user": "", "address": "10.5.50.3" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/ppp/active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { ".id": "*a", "name": "bob", "service": "pppoe", "address": "10.10.0.9", "caller-id": "AA:BB:CC:00:00:02" }
        ])))
        .mount(&server)
        .await;

    let sessions = client.active_sessions(&target).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].identity, "alice");
    assert_eq!(sessions[0].kind, SessionKind::Hotspot);
    assert_eq!(sessions[0].mac_address.as_deref(), Some("AA:BB:CC:00:00:01"));
    assert_eq!(sessions[1].identity, "bob");
    assert_eq!(sessions[1].kind, SessionKind::Pppoe);
    assert_eq!(sessions[1].peer_address, "10.10.0.9");
}

#[tokio::test]
async fn one_failing_session_source_fails_enumeration() {
    let (server, client, target) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/hotspot/active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/ppp/active"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such command"))
        .mount(&server)
        .await;

    let err = client.active_sessions(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Status { status: 404, .. }));
}

#[tokio::test]
async fn slow_device_times_out() {
    let (server, _, target) = setup().await;
    let client = RouterOsClient::new(Duration::from_millis(100)).unwrap();

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let err = client.resources(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Request(_)));
}

#[tokio::test]
async fn unreachable_device_is_request_error() {
    // nothing listens on the discard port
    let target = ProbeTarget::new(Uuid::new_v4(), Ipv4Addr::LOCALHOST, 9, "admin", "secret");
    let client = RouterOsClient::new(Duration::from_secs(2)).unwrap();
    let err = client.resources(&target).await.unwrap_err();
    assert!(matches!(err, ProbeError::Request(_)));
    assert!(!err.is_fatal());
}
