use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hl7_interface::{FileSystemInboundConfig, FileSystemInboundInterface, StatusKind};

const VALID: &str =
    "MSH|^~\\&|LAB|HOSP|ENGINE|HOSP|20230101120000||ORU^R01|F1|P|2.5\rOBR|1\rOBX|1|NM|GLU||5.4\r";

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_config(drop_dir: &Path) -> FileSystemInboundConfig {
    FileSystemInboundConfig {
        poll_interval_ms: 20,
        settle_time_ms: 0,
        ..FileSystemInboundConfig::new("lab-drop", drop_dir, "hl7")
    }
}

#[tokio::test]
async fn delivers_files_and_archives_them() {
    let root = tempfile::tempdir().unwrap();
    let drop_dir = root.path().join("drop");
    let processed = root.path().join("processed");
    std::fs::create_dir(&drop_dir).unwrap();

    std::fs::write(drop_dir.join("002.HL7"), VALID.replace("F1", "F2")).unwrap();
    std::fs::write(drop_dir.join("001.hl7"), VALID).unwrap();
    std::fs::write(drop_dir.join("notes.txt"), "ignore me").unwrap();

    let interface = FileSystemInboundInterface::new(FileSystemInboundConfig {
        processed_directory: Some(processed.clone()),
        ..fast_config(&drop_dir)
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    interface.on_message(move |_, message| {
        sink.lock().unwrap().push(message.control_id().to_string());
    });
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let status_sink = statuses.clone();
    interface.on_status(move |_, event| status_sink.lock().unwrap().push(event.kind));

    interface.start().await.unwrap();
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    interface.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["F1", "F2"]);
    assert!(processed.join("001.hl7").exists());
    assert!(processed.join("002.HL7").exists());
    assert!(!drop_dir.join("001.hl7").exists());
    assert!(drop_dir.join("notes.txt").exists());
    assert!(statuses.lock().unwrap().contains(&StatusKind::Watching));
    assert_eq!(interface.statistics().successes["ORU^R01"], 2);
}

#[tokio::test]
async fn deletes_processed_files_without_archive() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("only.hl7"), VALID).unwrap();

    let interface = FileSystemInboundInterface::new(fast_config(root.path()));
    interface.start().await.unwrap();
    let file = root.path().join("only.hl7");
    wait_until(|| !file.exists()).await;
    interface.stop().await.unwrap();

    assert_eq!(interface.statistics().total_successes(), 1);
}

#[tokio::test]
async fn malformed_file_reported_once_until_changed() {
    let root = tempfile::tempdir().unwrap();
    let bad = root.path().join("bad.hl7");
    std::fs::write(&bad, "PID|1||12345").unwrap();

    let interface = FileSystemInboundInterface::new(fast_config(root.path()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    interface.on_error(move |_, error| {
        sink.lock().unwrap().push(error.origin.clone().unwrap_or_default());
    });

    interface.start().await.unwrap();
    wait_until(|| errors.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(errors.lock().unwrap()[0].ends_with("bad.hl7"));
    assert!(bad.exists());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let staged = root.path().join("bad.tmp");
    std::fs::write(&staged, VALID).unwrap();
    std::fs::rename(&staged, &bad).unwrap();
    wait_until(|| !bad.exists()).await;
    interface.stop().await.unwrap();

    let stats = interface.statistics();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.total_successes(), 1);
}

#[tokio::test]
async fn malformed_file_moved_to_error_directory() {
    let root = tempfile::tempdir().unwrap();
    let drop_dir = root.path().join("in");
    let error_dir = root.path().join("errors");
    std::fs::create_dir(&drop_dir).unwrap();
    std::fs::write(drop_dir.join("bad.hl7"), "garbage").unwrap();
    std::fs::write(drop_dir.join("good.hl7"), VALID).unwrap();

    let interface = FileSystemInboundInterface::new(FileSystemInboundConfig {
        error_directory: Some(error_dir.clone()),
        ..fast_config(&drop_dir)
    });
    interface.start().await.unwrap();
    assert!(error_dir.is_dir());

    wait_until(|| error_dir.join("bad.hl7").exists() && !drop_dir.join("good.hl7").exists()).await;
    interface.stop().await.unwrap();

    let stats = interface.statistics();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.total_successes(), 1);
}

#[tokio::test]
async fn settle_time_delays_fresh_files() {
    let root = tempfile::tempdir().unwrap();
    let file = root.path().join("fresh.hl7");
    std::fs::write(&file, VALID).unwrap();

    let interface = FileSystemInboundInterface::new(FileSystemInboundConfig {
        settle_time_ms: 60_000,
        ..fast_config(root.path())
    });
    interface.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    interface.stop().await.unwrap();

    assert!(file.exists());
    assert_eq!(interface.statistics().total_successes(), 0);
}

#[tokio::test]
async fn accepts_files_with_byte_order_mark() {
    let root = tempfile::tempdir().unwrap();
    let mut contents = vec![0xEF, 0xBB, 0xBF];
    contents.extend_from_slice(VALID.as_bytes());
    std::fs::write(root.path().join("windows.hl7"), contents).unwrap();

    let interface = FileSystemInboundInterface::new(fast_config(root.path()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    interface.on_message(move |_, message| {
        sink.lock().unwrap().push(message.control_id().to_string());
    });

    interface.start().await.unwrap();
    wait_until(|| seen.lock().unwrap().len() == 1).await;
    interface.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["F1"]);
    assert_eq!(interface.statistics().errors, 0);
    assert!(!root.path().join("windows.hl7").exists());
}
