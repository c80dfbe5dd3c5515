// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::sync::Once;

use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

#[path = "../src/error.rs"]
mod error;
#[path = "../src/models.rs"]
mod models;
#[path = "../src/caldav/mod.rs"]
mod caldav;

static INIT: Once = Once::new();

fn init_crypto() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn endpoint(url: String) -> models::CaldavEndpoint {
    models::CaldavEndpoint {
        url,
        username: "user".into(),
        password: "pass".into(),
    }
}

#[tokio::test]
async fn discovers_current_user_principal() {
    init_crypto();
    let server = MockServer::start().await;

    Mock::given(method("PROPFIND"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(207).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/</d:href>
    <d:propstat>
      <d:prop>
        <d:current-user-principal>
          <d:href>/principals/user/</d:href>
        </d:current-user-principal>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#,
        ))
        .mount(&server)
        .await;

    let client = caldav::GuardedClient::new(&endpoint(server.uri()), false, true)
        .await
        .unwrap();

    let principal = client.discover_current_user_principal().await.unwrap();
    assert_eq!(principal.as_deref(), Some("/principals/user/"));
}

#[tokio::test]
async fn fetches_put_and_deletes_an_event() {
    init_crypto();
    let server = MockServer::start().await;
    let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:abc@example.com\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    Mock::given(method("GET"))
        .and(path("/cal/abc.ics"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"etag-1\"")
                .set_body_string(ics),
        )
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/cal/abc.ics"))
        .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"etag-2\""))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/cal/abc.ics"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = caldav::GuardedClient::new(&endpoint(server.uri()), false, true)
        .await
        .unwrap();

    let fetched = client.fetch_event("/cal/abc.ics").await.unwrap();
    assert_eq!(fetched.etag.as_deref(), Some("\"etag-1\""));
    assert!(fetched.ical_body.contains("abc@example.com"));

    let put = client
        .put_event("/cal/abc.ics", ics, caldav::PutMode::Unconditional)
        .await
        .unwrap();
    assert_eq!(put.etag.as_deref(), Some("\"etag-2\""));

    client.delete_event("/cal/abc.ics", None).await.unwrap();
}

#[tokio::test]
async fn fetch_of_missing_event_is_not_found() {
    init_crypto();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cal/missing.ics"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = caldav::GuardedClient::new(&endpoint(server.uri()), false, true)
        .await
        .unwrap();

    let err = client.fetch_event("/cal/missing.ics").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn conditional_put_conflict_maps_to_precondition() {
    init_crypto();
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/cal/abc.ics"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let client = caldav::GuardedClient::new(&endpoint(server.uri()), false, true)
        .await
        .unwrap();

    let err = client
        .put_event(
            "/cal/abc.ics",
            "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n",
            caldav::PutMode::ConditionalUpdate("\"stale\""),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, error::CalBridgeError::Precondition(_)));
}
