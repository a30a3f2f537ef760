//! Registry session protocol against a mock portal.

use chrono::NaiveDate;
use std::io::{Cursor, Write};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use patients_enricher::credentials::{Credential, CredentialPool};
use patients_enricher::model::ResolvedRecord;
use patients_enricher::session::{
    LookupOutcome, RegistrySession, SessionState, SrzEndpoint, SrzSession,
};

// =============================================================================
// Helpers
// =============================================================================

async fn mount_logon(server: &MockServer, login: &str, body: &str) {
    Mock::given(method("POST"))
        .and(path("/data/user.ajax.logon.php"))
        .and(body_string_contains(format!("lg={login}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_search(server: &MockServer, insurance_number: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/data/reg.person.polis.search.php"))
        .and(body_string_contains(format!("person_enp={insurance_number}")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn pool(logins: &[&str]) -> CredentialPool {
    CredentialPool::new(logins.iter().map(|login| Credential::new(*login, "secret", 10)))
}

async fn signed_in(server: &MockServer, pool: &CredentialPool) -> SrzSession {
    let mut session = SrzSession::new(SrzEndpoint::new(&server.uri())).unwrap();
    let credential = pool.get(0).unwrap();
    session.authenticate(credential).await.unwrap();
    session
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn empty_logon_body_means_authenticated() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "").await;

    let pool = pool(&["clinic"]);
    let session = signed_in(&server, &pool).await;
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.login(), Some("clinic"));
}

#[tokio::test]
async fn logon_error_text_is_a_rejection() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "Неверный логин или пароль").await;

    let pool = pool(&["clinic"]);
    let mut session = SrzSession::new(SrzEndpoint::new(&server.uri())).unwrap();
    let err = session
        .authenticate(pool.get(0).unwrap())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("rejected"));
    assert_eq!(session.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn logon_server_error_fails_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/data/user.ajax.logon.php"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let pool = pool(&["clinic"]);
    let mut session = SrzSession::new(SrzEndpoint::new(&server.uri())).unwrap();
    assert!(session.authenticate(pool.get(0).unwrap()).await.is_err());
}

// =============================================================================
// Person search
// =============================================================================

#[tokio::test]
async fn search_parses_found_and_not_found() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "").await;
    mount_search(
        &server,
        "2752930829000110",
        ResponseTemplate::new(200)
            .set_body_string("1||77||2752930829000110||Гаас||Елена||Николаевна||01.02.1970"),
    )
    .await;
    mount_search(
        &server,
        "2793699740000035",
        ResponseTemplate::new(200).set_body_string("0||not found"),
    )
    .await;

    let pool = pool(&["clinic"]);
    let mut session = signed_in(&server, &pool).await;

    let found = session.lookup("2752930829000110").await.unwrap();
    assert_eq!(
        found,
        LookupOutcome::Found(ResolvedRecord::new(
            "2752930829000110",
            "Гаас",
            "Елена",
            "Николаевна"
        ))
    );
    let missing = session.lookup("2793699740000035").await.unwrap();
    assert_eq!(missing, LookupOutcome::NotFound);
}

#[tokio::test]
async fn search_server_error_is_a_transport_failure() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "").await;
    mount_search(&server, "1", ResponseTemplate::new(500)).await;

    let pool = pool(&["clinic"]);
    let mut session = signed_in(&server, &pool).await;
    assert!(session.lookup("1").await.is_err());
}

#[tokio::test]
async fn lookup_before_logon_is_refused() {
    let server = MockServer::start().await;
    let mut session = SrzSession::new(SrzEndpoint::new(&server.uri())).unwrap();
    assert!(session.lookup("1").await.is_err());
    assert!(server.received_requests().await.unwrap().is_empty());
}

// =============================================================================
// Logout
// =============================================================================

#[tokio::test]
async fn close_logs_off_once() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "").await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("show", "logoff"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pool = pool(&["clinic"]);
    let mut session = signed_in(&server, &pool).await;
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.lookup("1").await.is_err());
}

// =============================================================================
// Export download
// =============================================================================

#[tokio::test]
async fn export_link_is_followed_and_archive_returned() {
    let server = MockServer::start().await;
    mount_logon(&server, "clinic", "").await;
    Mock::given(method("POST"))
        .and(path("/data/dbase.export.php"))
        .and(body_string_contains("export_date_on=05.03.2024"))
        .and(body_string_contains("exportlist_id=25"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "Файл готов: <a href='/files/export_25.zip' target='_blank'>скачать</a>",
        ))
        .mount(&server)
        .await;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("PRIK.DBF", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"payload").unwrap();
    let archive = writer.finish().unwrap().into_inner();
    Mock::given(method("GET"))
        .and(path("/files/export_25.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
        .mount(&server)
        .await;

    let pool = pool(&["clinic"]);
    let session = signed_in(&server, &pool).await;
    let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
    assert_eq!(
        session.export_reference(date).await.unwrap(),
        "/files/export_25.zip"
    );
    let bytes = session.download_export(date).await.unwrap();
    assert_eq!(bytes, archive);
    assert_eq!(
        patients_enricher::legacy_export::extract_first_entry(&bytes).unwrap(),
        b"payload"
    );
}
