//! End-to-end tests of the client against a stub Loki push endpoint.

use std::sync::Arc;
use std::time::Duration;

use lokiship::error::{LokiError, PushError};
use lokiship::{Client, ClientConfig, LogRecord};
use mockito::Server;

fn record(filename: &str) -> LogRecord {
    LogRecord::new("2021-01-08", "11:50:00", filename).with_field("EdgeResultType", "Hit")
}

#[tokio::test]
async fn test_push_logs_batches_by_count() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_header("content-type", "application/x-protobuf")
        .with_status(204)
        .expect(2)
        .create_async()
        .await;

    let config = ClientConfig::new(server.host_with_port())
        .with_batch_size(2)
        .with_batch_wait(Duration::from_secs(3600));
    let client = Client::start(config).unwrap();

    let logs = vec![record("bogus-file1"), record("bogus-file1"), record("bogus-file2")];
    let enqueued = client.push_logs(&logs).await.unwrap();
    assert_eq!(enqueued, 3);

    // One flush of 2 on the count trigger, one of 1 on shutdown.
    let stats = client.shutdown().await.unwrap();
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.entries_sent, 3);
    assert_eq!(stats.entries_dropped, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_time_trigger_flushes_partial_batch() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(2)
        .create_async()
        .await;

    let config = ClientConfig::new(server.host_with_port())
        .with_batch_size(2)
        .with_batch_wait(Duration::from_millis(100));
    let client = Client::start(config).unwrap();

    for i in 0..3 {
        client
            .push_entry(&record("testfilename"), format!("{{\"n\":{i}}}"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    mock.assert_async().await;

    let stats = client.shutdown().await.unwrap();
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.entries_sent, 3);
}

#[tokio::test]
async fn test_explicit_flush_reports_rejection() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(400)
        .with_body("entry too far behind")
        .expect(1)
        .create_async()
        .await;

    let config = ClientConfig::new(server.host_with_port())
        .with_batch_wait(Duration::from_secs(3600))
        .with_max_retries(3);
    let client = Client::start(config).unwrap();

    client
        .push_entry(&record("f"), "{}".to_string())
        .await
        .unwrap();
    let err = client.flush().await.unwrap_err();
    match err {
        LokiError::Push(PushError::Rejected { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "entry too far behind");
        }
        other => panic!("unexpected error: {other}"),
    }

    let stats = client.shutdown().await.unwrap();
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.entries_dropped, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_producers() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(10)
        .create_async()
        .await;

    let config = ClientConfig::new(server.host_with_port())
        .with_batch_size(10)
        .with_batch_wait(Duration::from_secs(3600));
    let client = Arc::new(Client::start(config).unwrap());

    let mut tasks = Vec::new();
    for producer in 0..4 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                client
                    .push_entry(&record(&format!("file-{producer}")), format!("{i}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let client = Arc::into_inner(client).unwrap();
    let stats = client.shutdown().await.unwrap();
    assert_eq!(stats.entries_sent, 100);
    assert_eq!(stats.entries_dropped, 0);
    mock.assert_async().await;
}
