use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use inkmon::config::{DaemonConfig, WatchConfig};
use inkmon::oracle::{thumbnail_paths, ProcessingOracle};
use rusqlite::Connection;

type TestResult = Result<(), Box<dyn Error>>;

const BOOK: &str = "/mnt/onboard/reader.png";
const IMAGE_ID: &str = "file_123";

fn watch() -> WatchConfig {
    WatchConfig {
        filename: PathBuf::from(BOOK),
        action: PathBuf::from("/mnt/onboard/start.sh"),
        label: None,
        hidden: false,
        block_spawns: false,
        skip_db_checks: false,
        do_db_update: false,
        db_title: None,
        db_author: None,
        db_comment: None,
    }
}

fn fast_cfg() -> DaemonConfig {
    let mut cfg = DaemonConfig::default();
    cfg.db_timeout = 50;
    cfg.journal_wait_attempts = 1;
    cfg.journal_wait_interval = 10;
    cfg
}

fn create_db(path: &Path) -> Result<Connection, Box<dyn Error>> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE content (
            ContentID   TEXT PRIMARY KEY,
            ContentType INTEGER,
            ImageId     TEXT,
            Title       TEXT,
            Attribution TEXT,
            Description TEXT
        );",
    )?;
    Ok(conn)
}

fn insert_record(conn: &Connection, image_id: Option<&str>, title: &str) -> TestResult {
    conn.execute(
        "INSERT INTO content (ContentID, ContentType, ImageId, Title)
         VALUES (?1, 6, ?2, ?3)",
        rusqlite::params![format!("file://{BOOK}"), image_id, title],
    )?;
    Ok(())
}

fn create_thumbnails(images_root: &Path, image_id: &str) -> TestResult {
    for path in thumbnail_paths(images_root, image_id) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"thumb")?;
    }
    Ok(())
}

#[test]
fn not_processed_without_a_content_record() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("library.sqlite");
    create_db(&db)?;

    let oracle = ProcessingOracle::new(db, dir.path().join("images"), &fast_cfg());
    assert!(!oracle.is_processed(&watch(), false));
    Ok(())
}

#[test]
fn not_processed_until_every_thumbnail_exists() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("library.sqlite");
    let images = dir.path().join("images");
    let conn = create_db(&db)?;
    insert_record(&conn, Some(IMAGE_ID), "A Book")?;

    let oracle = ProcessingOracle::new(db, images.clone(), &fast_cfg());

    // Record present, no thumbnails at all.
    assert!(!oracle.is_processed(&watch(), false));

    // Two of three variants is still not processed.
    let paths = thumbnail_paths(&images, IMAGE_ID);
    for path in &paths[..2] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"thumb")?;
    }
    assert!(!oracle.is_processed(&watch(), false));

    fs::write(&paths[2], b"thumb")?;
    assert!(oracle.is_processed(&watch(), true));
    Ok(())
}

#[test]
fn record_without_image_identifier_is_not_processed() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("library.sqlite");
    let conn = create_db(&db)?;
    insert_record(&conn, None, "A Book")?;

    let oracle = ProcessingOracle::new(db, dir.path().join("images"), &fast_cfg());
    assert!(!oracle.is_processed(&watch(), false));
    Ok(())
}

#[test]
fn missing_database_reports_not_processed() -> TestResult {
    let dir = tempfile::tempdir()?;
    let oracle = ProcessingOracle::new(
        dir.path().join("nope.sqlite"),
        dir.path().join("images"),
        &fast_cfg(),
    );
    assert!(!oracle.is_processed(&watch(), false));
    Ok(())
}

#[test]
fn metadata_is_rewritten_once_processed() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("library.sqlite");
    let images = dir.path().join("images");
    let conn = create_db(&db)?;
    insert_record(&conn, Some(IMAGE_ID), "placeholder")?;
    create_thumbnails(&images, IMAGE_ID)?;

    let mut cfg = watch();
    cfg.do_db_update = true;
    cfg.db_title = Some("Reader".into());
    cfg.db_author = Some("Someone".into());
    cfg.db_comment = Some("Launcher shim".into());

    let oracle = ProcessingOracle::new(db, images, &fast_cfg());
    assert!(oracle.is_processed(&cfg, false));

    let (title, author, comment): (String, String, String) = conn.query_row(
        "SELECT Title, Attribution, Description FROM content WHERE ContentID = ?1",
        [format!("file://{BOOK}")],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    assert_eq!(title, "Reader");
    assert_eq!(author, "Someone");
    assert_eq!(comment, "Launcher shim");

    // A second pass sees the stored title already matching and leaves the
    // row alone.
    assert!(oracle.is_processed(&cfg, false));
    Ok(())
}
