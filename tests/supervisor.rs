//! Worker pool behaviour with in-process workers sharing one port.

mod common;

use std::sync::Arc;
use std::time::Duration;

use api_gateway::config::SslOptions;
use api_gateway::lifecycle::RespawnBackoff;
use api_gateway::modules::ModuleRegistry;
use api_gateway::supervisor::{MasterState, Supervisor, SupervisorOptions, TaskSpawner};
use common::{free_port, proxy_config, start_mock_backend, wait_for_pool};

fn spawner() -> Arc<TaskSpawner> {
    Arc::new(TaskSpawner::new(Arc::new(ModuleRegistry::with_builtins())))
}

fn options(workers: usize) -> SupervisorOptions {
    SupervisorOptions {
        workers: Some(workers),
        drain_timeout: Duration::from_secs(5),
        backoff: RespawnBackoff::new(20, 200),
    }
}

#[tokio::test]
async fn pool_serves_rolls_onto_new_config_and_stops() {
    let alpha = start_mock_backend("alpha").await;
    let beta = start_mock_backend("beta").await;
    let port = free_port();
    let base = format!("http://127.0.0.1:{}", port);

    let (supervisor, handle) = Supervisor::new(proxy_config(port, &alpha.url()), None, spawner(), options(2));
    let task = tokio::spawn(supervisor.run());
    let snapshot = wait_for_pool(&handle, |s| s.listening == 2).await;
    assert_eq!(snapshot.state, MasterState::Running);

    let client = reqwest::Client::new();
    let body = client.get(format!("{}/a", base)).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "alpha GET /a");
    drop(client);

    assert!(handle.apply(proxy_config(port, &beta.url())));
    let snapshot = wait_for_pool(&handle, |s| {
        s.state == MasterState::Running && s.generation == 2 && s.listening == 2 && s.workers.len() == 2
    })
    .await;
    assert_eq!(snapshot.restarts, 0);
    assert!(snapshot.workers.iter().all(|w| w.generation == 2));

    // Every worker now runs the new config, whichever one accepts the connection.
    for _ in 0..4 {
        let body = reqwest::Client::new()
            .get(format!("{}/b", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "beta GET /b");
    }

    assert!(handle.stop());
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(reqwest::get(format!("{}/a", base)).await.is_err());
}

#[tokio::test]
async fn workers_failing_to_start_are_retried_until_stopped() {
    let mut config = proxy_config(free_port(), "http://127.0.0.1:9");
    // HTTPS with certificate files that do not exist: every worker fails before listening.
    config.ports.https = Some(free_port());
    config.ssl_options = Some(SslOptions {
        key: "/nonexistent/key.pem".into(),
        cert: "/nonexistent/cert.pem".into(),
    });

    let (supervisor, handle) = Supervisor::new(config, None, spawner(), options(1));
    let task = tokio::spawn(supervisor.run());

    let snapshot = wait_for_pool(&handle, |s| s.restarts >= 3).await;
    assert_eq!(snapshot.listening, 0);

    assert!(handle.stop());
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
