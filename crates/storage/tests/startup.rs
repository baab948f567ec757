use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use waypoint_storage::migration::CURSOR_FILE;
use waypoint_storage::{Migration, MigrationPipeline, SqliteRecordStore, Storage};

struct Counting {
    name: &'static str,
    runs: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl Migration for Counting {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _dir: &Path) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            anyhow::bail!("{} exploded", self.name);
        }
        Ok(())
    }
}

struct Counters {
    a: Arc<AtomicUsize>,
    b: Arc<AtomicUsize>,
    c: Arc<AtomicUsize>,
}

impl Counters {
    fn new() -> Self {
        Self {
            a: Arc::default(),
            b: Arc::default(),
            c: Arc::default(),
        }
    }

    /// `a`, then a failing `b`, then `c`.
    fn pipeline(&self) -> MigrationPipeline {
        MigrationPipeline::new(vec![
            Box::new(Counting {
                name: "a",
                runs: self.a.clone(),
                fail: false,
            }),
            Box::new(Counting {
                name: "b",
                runs: self.b.clone(),
                fail: true,
            }),
            Box::new(Counting {
                name: "c",
                runs: self.c.clone(),
                fail: false,
            }),
        ])
    }

    fn runs(&self) -> [usize; 3] {
        [
            self.a.load(Ordering::SeqCst),
            self.b.load(Ordering::SeqCst),
            self.c.load(Ordering::SeqCst),
        ]
    }
}

async fn open(dir: &Path, pipeline: MigrationPipeline) -> Storage {
    waypoint_utils::setup_logging("waypoint-storage-tests");
    let records = SqliteRecordStore::open(dir.join("waypoint.db")).await.unwrap();
    Storage::new(dir.join("data"), Arc::new(records), pipeline)
}

#[tokio::test]
async fn resumes_at_cursor_and_records_failures() {
    let root = TempDir::new().unwrap();
    let data = root.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join(CURSOR_FILE), "1").unwrap();

    let counters = Counters::new();
    let storage = open(root.path(), counters.pipeline()).await;
    let health = storage.health().await.unwrap();

    assert_eq!(counters.runs(), [0, 1, 1]);
    assert_eq!(health.migration_cursor, 3);
    assert_eq!(health.applied_migrations, vec![2]);
    assert_eq!(health.skipped_migrations.len(), 1);
    assert_eq!(health.skipped_migrations[0].index, 1);
    assert_eq!(health.skipped_migrations[0].name, "b");
    assert!(health.skipped_migrations[0].reason.contains("exploded"));
    assert!(health.is_degraded());
    assert!(health.json_imported);
    assert_eq!(
        std::fs::read_to_string(data.join(CURSOR_FILE)).unwrap().trim(),
        "3"
    );
}

#[tokio::test]
async fn restart_runs_nothing_and_keeps_state() {
    let root = TempDir::new().unwrap();

    let first = Counters::new();
    {
        let storage = open(root.path(), first.pipeline()).await;
        storage
            .write(["session", "proj", "ses_1"], &json!({"title": "kept"}))
            .await
            .unwrap();
        assert!(storage.health().await.unwrap().import.is_some());
    }
    assert_eq!(first.runs(), [1, 1, 1]);

    let second = Counters::new();
    let storage = open(root.path(), second.pipeline()).await;
    let health = storage.health().await.unwrap();

    assert_eq!(second.runs(), [0, 0, 0]);
    assert_eq!(health.migration_cursor, 3);
    assert!(health.applied_migrations.is_empty());
    assert!(health.json_imported);
    assert!(health.import.is_none());
    // The failure from the first run is still reported.
    assert_eq!(health.skipped_migrations.len(), 1);

    let session: Value = storage.read(["session", "proj", "ses_1"]).await.unwrap();
    assert_eq!(session["title"], "kept");
}

#[tokio::test]
async fn concurrent_first_callers_share_one_initialization() {
    let root = TempDir::new().unwrap();
    let counters = Counters::new();
    let storage = Arc::new(open(root.path(), counters.pipeline()).await);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            storage.write(vec![format!("note_{i}")], &json!(i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(counters.runs(), [1, 1, 1]);
    assert_eq!(storage.list(Vec::<String>::new()).await.unwrap().len(), 16);
}

#[tokio::test]
async fn legacy_documents_are_imported_on_first_use() {
    let root = TempDir::new().unwrap();
    let data = root.path().join("data");
    let put = |rel: &str, doc: Value| {
        let path = data.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(&doc).unwrap()).unwrap();
    };
    put(
        "project/app/storage/session/info/ses_1.json",
        json!({"id": "ses_1", "projectID": "proj", "summary": {"diffs": [
            {"file": "a.rs", "additions": 2, "deletions": 1}
        ]}}),
    );
    put(
        "project/app/storage/session/message/ses_1/msg_1.json",
        json!({"id": "msg_1"}),
    );
    put(
        "project/app/storage/session/part/ses_1/msg_1/prt_1.json",
        json!({"id": "prt_1", "type": "text"}),
    );

    let storage = open(root.path(), MigrationPipeline::default()).await;
    let health = storage.health().await.unwrap();
    assert!(health.skipped_migrations.is_empty());
    let stats = health.import.unwrap();
    assert_eq!((stats.sessions, stats.messages, stats.parts, stats.diffs), (1, 1, 1, 1));

    let session: Value = storage.read(["session", "proj", "ses_1"]).await.unwrap();
    assert_eq!(session["summary"], json!({"additions": 2, "deletions": 1}));

    let message: Value = storage.read(["message", "ses_1", "msg_1"]).await.unwrap();
    assert_eq!(message["info"]["id"], "msg_1");
    assert_eq!(message["parts"][0]["id"], "prt_1");

    let diff: Value = storage.read(["session_diff", "ses_1"]).await.unwrap();
    assert_eq!(diff[0]["file"], "a.rs");
}
