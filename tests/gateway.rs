//! End-to-end request handling through a single worker server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use api_gateway::config::GatewayConfig;
use api_gateway::error::GatewayError;
use api_gateway::lifecycle::Shutdown;
use api_gateway::modules::ModuleRegistry;
use api_gateway::WorkerServer;
use common::{free_port, gateway_config, proxy_config, start_mock_backend};
use serde_json::json;
use tokio::task::JoinHandle;

async fn start_gateway(config: GatewayConfig) -> (String, Shutdown, JoinHandle<Result<(), GatewayError>>) {
    let server = WorkerServer::from_config(Arc::new(config), &ModuleRegistry::with_builtins()).unwrap();
    let listeners = server.bind().await.unwrap();
    let addr = listeners.http_addr().unwrap();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.serve(listeners, shutdown.clone()));
    (format!("http://{}", addr), shutdown, task)
}

async fn stop(shutdown: Shutdown, task: JoinHandle<Result<(), GatewayError>>) {
    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn full_pipeline_rewrites_proxies_and_caches() {
    let backend = start_mock_backend("alpha").await;
    let config = gateway_config(
        free_port(),
        json!({
            "filters": {"gets": {"methods": ["GET"]}},
            "modules": {"cache": {"require": "memory-cacher", "ttlSecs": 60}},
            "workflows": {
                "api": {
                    "filters": ["gets"],
                    "processors": [{"require": "path", "path": "/v2/"}, {"require": "key-md5"}],
                    "cachers": ["cache"],
                    "proxies": [{"require": "api-proxy", "target": backend.url()}]
                }
            }
        }),
    );
    let (base, shutdown, task) = start_gateway(config).await;
    let client = reqwest::Client::new();

    let first = client.get(format!("{}/items?id=1", base)).send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert!(first.headers().contains_key("x-request-id"));
    assert!(!first.headers().contains_key("cache-key"));
    assert_eq!(first.text().await.unwrap(), "alpha GET /v2/items?id=1");

    // Responses are stored after they are flushed to the client.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = client.get(format!("{}/items?id=1", base)).send().await.unwrap();
    assert_eq!(second.status(), 200);
    assert!(second.headers().contains_key("cache-key"));
    assert_eq!(second.text().await.unwrap(), "alpha GET /v2/items?id=1");
    assert_eq!(backend.hits(), 1);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn request_outside_every_workflow_is_not_found() {
    let backend = start_mock_backend("alpha").await;
    let (base, shutdown, task) = start_gateway(proxy_config(free_port(), &backend.url())).await;

    let response = reqwest::Client::new()
        .post(format!("{}/items", base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "no workflow matched");
    assert_eq!(backend.hits(), 0);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn declining_proxies_are_not_found() {
    let backend = start_mock_backend("alpha").await;
    let config = gateway_config(
        free_port(),
        json!({
            "filters": {"legacy": {"paths": ["^/legacy/"]}},
            "workflows": {
                "api": {
                    "proxies": [{"require": "api-proxy", "target": backend.url(), "filters": ["legacy"]}]
                }
            }
        }),
    );
    let (base, shutdown, task) = start_gateway(config).await;
    let client = reqwest::Client::new();

    let missed = client.get(format!("{}/current/x", base)).send().await.unwrap();
    assert_eq!(missed.status(), 404);
    assert_eq!(missed.text().await.unwrap(), "No proxy found");

    let served = client.get(format!("{}/legacy/x", base)).send().await.unwrap();
    assert_eq!(served.status(), 200);
    assert_eq!(served.text().await.unwrap(), "alpha GET /legacy/x");

    stop(shutdown, task).await;
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let target = format!("http://127.0.0.1:{}", free_port());
    let (base, shutdown, task) = start_gateway(proxy_config(free_port(), &target)).await;

    let response = reqwest::get(format!("{}/items", base)).await.unwrap();
    assert_eq!(response.status(), 502);
    assert!(response.text().await.unwrap().starts_with("Upstream error"));

    stop(shutdown, task).await;
}

#[tokio::test]
async fn error_wrapper_renders_pipeline_failures() {
    let target = format!("http://127.0.0.1:{}", free_port());
    let config = gateway_config(
        free_port(),
        json!({
            "workflows": {
                "api": {
                    "proxies": [{"require": "api-proxy", "target": target}],
                    "errorResponseWrappers": [{"require": "json-error", "objectType": "GatewayException"}]
                }
            }
        }),
    );
    let (base, shutdown, task) = start_gateway(config).await;

    let response = reqwest::get(format!("{}/items", base)).await.unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["error"]["objectType"], "GatewayException");
    assert!(body["executionTime"].is_number());

    stop(shutdown, task).await;
}

#[tokio::test]
async fn inbound_request_id_is_echoed() {
    let backend = start_mock_backend("alpha").await;
    let (base, shutdown, task) = start_gateway(proxy_config(free_port(), &backend.url())).await;

    let response = reqwest::Client::new()
        .get(format!("{}/items", base))
        .header("x-request-id", "req-42")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-request-id"], "req-42");

    stop(shutdown, task).await;
}
