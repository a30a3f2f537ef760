//! Whole enrich runs against a mock portal: cache fill, registry lookups, merge, save.

use std::fs;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use patients_enricher::cache::PatientCache;
use patients_enricher::config::Settings;
use patients_enricher::credentials::Credential;
use patients_enricher::enrich::{EnrichOptions, enrich_patients_file};
use patients_enricher::model::{LookupKey, ResolvedRecord};
use patients_enricher::progress::NoProgress;
use patients_enricher::scheduler::{SchedulerOptions, reconcile_with_registry};
use patients_enricher::session::SrzEndpoint;

const PATIENTS: &str = "\
ENP;FIO;DR
2752930829000110;ГЕН;01.02.1970
2751640821000288;НВЭ;03.04.1981
2748540839000021;СН;05.06.1992
2793699740000035;ИИИ;07.08.2003
";

async fn portal() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/data/user.ajax.logon.php"))
        .and(body_string_contains("lg=good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/data/user.ajax.logon.php"))
        .and(body_string_contains("lg=blocked"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Учетная запись заблокирована"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("show", "logoff"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    for (enp, surname, name, patronymic) in [
        ("2752930829000110", "Гаас", "Елена", "Николаевна"),
        ("2751640821000288", "Нуриева", "Венера", "Эльдаровна"),
        ("2748540839000021", "Сатлыкова", "Наталья", ""),
    ] {
        Mock::given(method("POST"))
            .and(path("/data/reg.person.polis.search.php"))
            .and(body_string_contains(format!("person_enp={enp}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "1||0||{enp}||{surname}||{name}||{patronymic}||"
            )))
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/data/reg.person.polis.search.php"))
        .and(body_string_contains("person_enp=2793699740000035"))
        .respond_with(ResponseTemplate::new(200).set_body_string("0||"))
        .mount(&server)
        .await;
    server
}

fn settings(server: &MockServer, dir: &TempDir, credentials: Vec<Credential>) -> Settings {
    Settings {
        base_url: server.uri(),
        credentials,
        thread_limit: 2,
        cache_db: dir.path().join("cache.sqlite"),
        ..Settings::default()
    }
}

#[tokio::test]
async fn reconcile_skips_blocked_login_and_stops_at_quota() {
    let server = portal().await;
    let keys = vec![
        LookupKey::new("2752930829000110", "ГЕН"),
        LookupKey::new("2751640821000288", "НВЭ"),
        LookupKey::new("2748540839000021", "СН"),
    ];
    let credentials = vec![
        Credential::new("blocked", "x", 5),
        Credential::new("good", "y", 2),
    ];
    let options = SchedulerOptions {
        thread_limit: 1,
        ..SchedulerOptions::default()
    };

    let outcome = reconcile_with_registry(
        keys,
        credentials,
        SrzEndpoint::new(&server.uri()),
        &options,
        &NoProgress,
        &AtomicBool::new(false),
    )
    .await
    .unwrap();

    assert_eq!(outcome.requested, 3);
    assert_eq!(outcome.resolved.len(), 2);
    assert_eq!(outcome.unresolved, 1);
    assert!(outcome.pool_exhausted);
    assert_eq!(outcome.resolved[0].surname, "ГААС");
}

#[tokio::test]
async fn enrich_fills_cache_then_registry_and_saves() {
    let server = portal().await;
    let dir = TempDir::new().unwrap();
    let patients = dir.path().join("patients.csv");
    fs::write(&patients, PATIENTS).unwrap();

    let settings = settings(&server, &dir, vec![Credential::new("good", "y", 100)]);
    {
        let cache = PatientCache::open(&settings.cache_db).unwrap();
        cache
            .upsert(&ResolvedRecord::new(
                "2752930829000110",
                "Гаас",
                "Елена",
                "Николаевна",
            ))
            .unwrap();
    }

    let report = enrich_patients_file(
        &settings,
        &patients,
        EnrichOptions::default(),
        &AtomicBool::new(false),
    )
    .await
    .unwrap();

    assert_eq!(report.rows, 4);
    assert_eq!(report.filled_from_cache, 1);
    assert_eq!(report.requested, 3);
    assert_eq!(report.filled_from_registry, 2);
    assert_eq!(report.remaining, 1);
    assert_eq!(report.cached, 2);
    assert_eq!(report.outcome.as_ref().unwrap().not_found, 1);

    let saved = fs::read_to_string(&patients).unwrap();
    let mut lines = saved.lines();
    assert_eq!(lines.next(), Some("ENP;FIO;Фамилия;Имя;Отчество;DR"));
    assert_eq!(
        lines.next(),
        Some("2752930829000110;ГЕН;ГААС;ЕЛЕНА;НИКОЛАЕВНА;01.02.1970")
    );
    assert!(saved.contains("2748540839000021;СН;САТЛЫКОВА;НАТАЛЬЯ;;05.06.1992"));
    assert!(saved.contains("2793699740000035;ИИИ;;;;07.08.2003"));

    let cache = PatientCache::open(&settings.cache_db).unwrap();
    assert_eq!(cache.len().unwrap(), 3);
    assert!(!cache.contains("2793699740000035").unwrap());
}

#[tokio::test]
async fn cache_only_run_sends_nothing() {
    let server = portal().await;
    let dir = TempDir::new().unwrap();
    let patients = dir.path().join("patients.csv");
    fs::write(&patients, PATIENTS).unwrap();

    let settings = settings(&server, &dir, vec![Credential::new("good", "y", 100)]);
    let report = enrich_patients_file(
        &settings,
        &patients,
        EnrichOptions {
            cache_only: true,
            show_progress: false,
        },
        &AtomicBool::new(false),
    )
    .await
    .unwrap();

    assert_eq!(report.requested, 0);
    assert_eq!(report.remaining, 4);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn request_limit_caps_registry_lookups() {
    let server = portal().await;
    let dir = TempDir::new().unwrap();
    let patients = dir.path().join("patients.csv");
    fs::write(&patients, PATIENTS).unwrap();

    let mut settings = settings(&server, &dir, vec![Credential::new("good", "y", 100)]);
    settings.request_limit = 2;
    let report = enrich_patients_file(
        &settings,
        &patients,
        EnrichOptions::default(),
        &AtomicBool::new(false),
    )
    .await
    .unwrap();

    assert_eq!(report.requested, 2);
    assert_eq!(report.filled_from_registry, 2);
    assert_eq!(report.remaining, 2);
}
