use snowplow_emitter::buffer::{PersistentBlockingQueue, QueueError};
use snowplow_emitter::domain::Payload;
use snowplow_emitter::storage::{self, StorageBackend, StorageConfig};
use std::time::Duration;
use tempfile::TempDir;

fn event(n: usize) -> Payload {
    Payload::new()
        .with("e", "se")
        .with("se_ca", "durability")
        .with("se_ac", format!("event-{n}"))
}

fn storage_config(backend: StorageBackend, dir: &TempDir, compression: bool) -> StorageConfig {
    StorageConfig {
        backend,
        path: dir.path().join("queue"),
        max_disk_usage: 16 * 1024 * 1024,
        compression,
        retention: None,
    }
}

fn open_queue(config: &StorageConfig) -> PersistentBlockingQueue {
    PersistentBlockingQueue::new(storage::open(config).unwrap())
}

async fn survives_reopen(config: StorageConfig) {
    let removed = {
        let queue = open_queue(&config);
        let ids = queue.enqueue((0..5).map(event).collect()).unwrap();
        assert_eq!(ids.len(), 5);

        // Deliver the first two, lease but never settle the third
        let batch = queue.peek(2, Duration::ZERO).await.unwrap();
        assert!(queue.remove(&[batch[0].0, batch[1].0]).unwrap());
        let leased = queue.peek(1, Duration::ZERO).await.unwrap();
        assert_eq!(leased.len(), 1);
        ids[..2].to_vec()
    };

    let queue = open_queue(&config);
    assert_eq!(queue.len().unwrap(), 3);

    // Leases do not survive the process; everything unsettled is visible again
    let batch = queue.peek(10, Duration::ZERO).await.unwrap();
    let labels: Vec<&str> = batch
        .iter()
        .map(|(_, payload)| payload.get("se_ac").unwrap())
        .collect();
    assert_eq!(labels, vec!["event-2", "event-3", "event-4"]);
    assert!(batch.iter().all(|(id, _)| !removed.contains(id)));
}

#[tokio::test]
async fn test_sled_queue_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    survives_reopen(storage_config(StorageBackend::Sled, &temp_dir, false)).await;
}

#[tokio::test]
async fn test_spool_queue_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    survives_reopen(storage_config(StorageBackend::Spool, &temp_dir, false)).await;
}

#[tokio::test]
async fn test_compressed_spool_queue_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    survives_reopen(storage_config(StorageBackend::Spool, &temp_dir, true)).await;
}

#[tokio::test]
async fn test_ids_keep_growing_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    for backend in [StorageBackend::Sled, StorageBackend::Spool] {
        let dir = TempDir::new_in(temp_dir.path()).unwrap();
        let config = storage_config(backend, &dir, false);

        let first = open_queue(&config).enqueue(vec![event(0)]).unwrap()[0];
        let second = open_queue(&config).enqueue(vec![event(1)]).unwrap()[0];
        assert!(second > first, "{backend:?}: {second:?} <= {first:?}");

        let queue = open_queue(&config);
        let batch = queue.peek(2, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].0, first);
        assert_eq!(batch[1].0, second);
    }
}

#[tokio::test]
async fn test_memory_backend_starts_empty() {
    let config = StorageConfig {
        backend: StorageBackend::Memory,
        ..Default::default()
    };
    open_queue(&config).enqueue(vec![event(0)]).unwrap();
    assert!(open_queue(&config).is_empty().unwrap());
}

#[test]
fn test_storage_path_that_is_a_file_fails_to_open() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("occupied");
    std::fs::write(&file, b"not a directory").unwrap();

    for backend in [StorageBackend::Sled, StorageBackend::Spool] {
        let config = StorageConfig {
            backend,
            path: file.clone(),
            ..Default::default()
        };
        assert!(storage::open(&config).is_err(), "{backend:?} opened a file path");
    }
}

#[tokio::test]
async fn test_garbled_spool_message_does_not_block_the_queue() {
    let temp_dir = TempDir::new().unwrap();
    let config = storage_config(StorageBackend::Spool, &temp_dir, false);
    std::fs::create_dir_all(&config.path).unwrap();
    std::fs::write(config.path.join("00000000000000000001.msg"), b"\x01").unwrap();

    let queue = open_queue(&config);
    queue.enqueue(vec![event(0)]).unwrap();
    assert_eq!(queue.len().unwrap(), 2);

    let bad = match queue.peek(10, Duration::ZERO).await {
        Err(QueueError::Decode { id, .. }) => id,
        other => panic!("expected the garbled message first, got {other:?}"),
    };
    assert_eq!(bad.as_u64(), 1);

    // While the bad record is leased the good one behind it is deliverable
    let batch = queue.peek(10, Duration::ZERO).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].1.get("se_ac"), Some("event-0"));

    assert!(queue.remove(&[bad, batch[0].0]).unwrap());
    assert!(queue.is_empty().unwrap());
}
