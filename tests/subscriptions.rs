mod common;

use std::path::Path;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reqwest::Client;
use serial_test::serial;
use tempfile::TempDir;

use common::{fake_core, start_server, Hits, VALID_SUB};
use deckyclash::core::{CoreBinary, SubscriptionStore};
use deckyclash::persistence::Database;
use deckyclash::Error;

struct Fixture {
    dir: TempDir,
    db: Arc<Database>,
    base: String,
    store: SubscriptionStore,
    slow_hits: Hits,
}

impl Fixture {
    fn reload(&self) -> SubscriptionStore {
        open_store(self.dir.path(), Arc::clone(&self.db))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn open_store(root: &Path, db: Arc<Database>) -> SubscriptionStore {
    let binary = CoreBinary::new(root.join("fake-core"), root.to_path_buf());
    SubscriptionStore::load(root.join("subscriptions"), db, Client::new(), binary).unwrap()
}

async fn fixture() -> Fixture {
    let slow_hits = Hits::default();
    let hits = slow_hits.clone();
    let app = Router::new()
        .route(
            "/sub/slow.yaml",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.hit();
                    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                    VALID_SUB
                }
            }),
        )
        .route("/sub/work.yaml", get(|| async { VALID_SUB }))
        .route("/sub/home", get(|| async { VALID_SUB }))
        .route(
            "/api/v1/client",
            get(|| async {
                (
                    [(header::CONTENT_DISPOSITION, r#"attachment; filename="Airport.YML""#)],
                    VALID_SUB,
                )
                    .into_response()
            }),
        )
        .route("/sub/invalid.yaml", get(|| async { "port: 7890\n" }))
        .route("/sub/gone", get(|| async { StatusCode::NOT_FOUND }));
    let base = format!("http://{}", start_server(app).await);

    let dir = tempfile::tempdir().unwrap();
    fake_core(dir.path());
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    let db = Arc::new(db);
    let store = open_store(dir.path(), Arc::clone(&db));

    Fixture {
        dir,
        db,
        base,
        store,
        slow_hits,
    }
}

fn names(store: &SubscriptionStore) -> Vec<String> {
    store.list().into_iter().map(|(name, _)| name).collect()
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
#[serial]
async fn test_download_registers_and_selects() {
    let f = fixture().await;

    let name = f.store.download(&f.url("/sub/work.yaml")).await.unwrap();

    assert_eq!(name, "work");
    assert_eq!(f.store.current().as_deref(), Some("work"));
    assert_eq!(
        std::fs::read_to_string(f.store.path_of("work")).unwrap(),
        VALID_SUB
    );
    assert_eq!(f.store.url_of("work"), Some(f.url("/sub/work.yaml")));
}

#[tokio::test]
#[serial]
async fn test_download_name_from_content_disposition() {
    let f = fixture().await;
    let name = f.store.download(&f.url("/api/v1/client")).await.unwrap();
    assert_eq!(name, "Airport");
}

#[tokio::test]
#[serial]
async fn test_duplicate_download_gets_suffix() {
    let f = fixture().await;
    let url = f.url("/sub/work.yaml");

    f.store.download(&url).await.unwrap();
    let second = f.store.download(&url).await.unwrap();
    let third = f.store.download(&url).await.unwrap();

    assert_eq!(second, "work_0");
    assert_eq!(third, "work_1");
    assert_eq!(names(&f.store), ["work", "work_0", "work_1"]);
    // The first download stays selected
    assert_eq!(f.store.current().as_deref(), Some("work"));
}

#[tokio::test]
#[serial]
async fn test_dedupe_exhaustion_writes_nothing() {
    let f = fixture().await;
    let subs_dir = f.store.dir().to_path_buf();
    std::fs::create_dir_all(&subs_dir).unwrap();
    std::fs::write(subs_dir.join("work.yaml"), VALID_SUB).unwrap();
    for i in 0..100 {
        std::fs::write(subs_dir.join(format!("work_{}.yaml", i)), VALID_SUB).unwrap();
    }
    let before = entries(&subs_dir);

    let result = f.store.download(&f.url("/sub/work.yaml")).await;

    assert!(matches!(result, Err(Error::NameConflict(_))));
    assert_eq!(entries(&subs_dir), before);
    assert!(f.store.list().is_empty());
}

#[tokio::test]
#[serial]
async fn test_invalid_config_is_deleted() {
    let f = fixture().await;

    let result = f.store.download(&f.url("/sub/invalid.yaml")).await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(entries(f.store.dir()).is_empty());
    assert!(f.store.list().is_empty());
    assert_eq!(f.store.current(), None);
}

#[tokio::test]
#[serial]
async fn test_network_failure_is_reported() {
    let f = fixture().await;
    let result = f.store.download(&f.url("/sub/gone")).await;
    assert!(matches!(result, Err(Error::Network(_))));
    assert!(entries(f.store.dir()).is_empty());
}

#[tokio::test]
#[serial]
async fn test_failed_update_keeps_file() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    std::fs::write(f.store.path_of("work"), "proxies: [edited]\n").unwrap();

    f.store.rename("work", "work", &f.url("/sub/gone")).unwrap();
    assert!(f.store.update("work").await.is_err());
    assert_eq!(
        std::fs::read_to_string(f.store.path_of("work")).unwrap(),
        "proxies: [edited]\n"
    );

    f.store.rename("work", "work", &f.url("/sub/work.yaml")).unwrap();
    f.store.update("work").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(f.store.path_of("work")).unwrap(),
        VALID_SUB
    );
}

#[tokio::test]
#[serial]
async fn test_update_all_reports_failures() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();
    f.store.rename("home", "home", &f.url("/sub/gone")).unwrap();

    let failures = f.store.update_all().await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "home");
}

#[tokio::test]
#[serial]
async fn test_rename_moves_file_and_keeps_position() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();

    f.store
        .rename("work", "office/main", "https://example.com/new")
        .unwrap();

    assert_eq!(names(&f.store), ["office-main", "home"]);
    assert!(f.store.path_of("office-main").exists());
    assert!(!f.store.path_of("work").exists());
    assert_eq!(f.store.current().as_deref(), Some("office-main"));
    assert_eq!(
        f.store.url_of("office-main").as_deref(),
        Some("https://example.com/new")
    );
}

#[tokio::test]
#[serial]
async fn test_rename_collision_is_rejected() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();

    let result = f.store.rename("work", "home", "https://example.com/x");

    assert!(matches!(result, Err(Error::NameConflict(_))));
    assert_eq!(names(&f.store), ["work", "home"]);
    assert_eq!(f.store.url_of("work"), Some(f.url("/sub/work.yaml")));
    assert!(f.store.path_of("work").exists());
}

#[tokio::test]
#[serial]
async fn test_duplicate_copies_file() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();

    let copy = f.store.duplicate("work").unwrap();

    assert_eq!(copy, "work_0");
    assert_eq!(f.store.url_of("work_0"), f.store.url_of("work"));
    assert_eq!(
        std::fs::read(f.store.path_of("work_0")).unwrap(),
        std::fs::read(f.store.path_of("work")).unwrap()
    );
    assert!(matches!(
        f.store.duplicate("nope"),
        Err(Error::UnknownSubscription(_))
    ));
}

#[tokio::test]
#[serial]
async fn test_remove_clears_current() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();

    f.store.remove("work").unwrap();

    assert!(f.store.list().is_empty());
    assert_eq!(f.store.current(), None);
    assert!(!f.store.path_of("work").exists());
}

#[tokio::test]
#[serial]
async fn test_reorder_requires_permutation() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();

    let partial = vec!["home".to_string()];
    assert!(f.store.reorder(&partial).is_err());
    let repeated = vec!["home".to_string(), "home".to_string()];
    assert!(f.store.reorder(&repeated).is_err());
    assert_eq!(names(&f.store), ["work", "home"]);

    f.store
        .reorder(&["home".to_string(), "work".to_string()])
        .unwrap();
    assert_eq!(names(&f.store), ["home", "work"]);
}

#[tokio::test]
#[serial]
async fn test_check_all_drops_missing_files() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();
    std::fs::remove_file(f.store.path_of("work")).unwrap();

    let removed = f.store.check_all().unwrap();

    assert_eq!(removed, ["work"]);
    assert_eq!(names(&f.store), ["home"]);
    assert_eq!(f.store.current(), None);
}

#[tokio::test]
#[serial]
async fn test_registry_survives_reload() {
    let f = fixture().await;
    f.store.download(&f.url("/sub/work.yaml")).await.unwrap();
    f.store.download(&f.url("/sub/home")).await.unwrap();
    f.store
        .reorder(&["home".to_string(), "work".to_string()])
        .unwrap();
    f.store.set_current("home").unwrap();

    let reloaded = f.reload();

    assert_eq!(names(&reloaded), ["home", "work"]);
    assert_eq!(reloaded.current().as_deref(), Some("home"));
    assert!(matches!(
        reloaded.set_current("nope"),
        Err(Error::UnknownSubscription(_))
    ));
}

#[tokio::test]
#[serial]
async fn test_overlapping_updates_share_one_transfer() {
    let f = fixture().await;
    let name = f.store.download(&f.url("/sub/slow.yaml")).await.unwrap();
    std::fs::write(f.store.path_of(&name), "proxies: [stale]\n").unwrap();

    let (first, second) = tokio::join!(f.store.update(&name), f.store.update(&name));

    assert!(first.is_ok(), "{:?}", first);
    assert!(second.is_ok(), "{:?}", second);
    assert_eq!(f.slow_hits.count(), 2);
    assert_eq!(
        std::fs::read_to_string(f.store.path_of(&name)).unwrap(),
        VALID_SUB
    );
    assert_eq!(entries(f.store.dir()), ["slow.yaml"]);
}
