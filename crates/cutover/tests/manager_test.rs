// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container manager deploy flows against the mock runtime.
//!
//! Containers "listen" on real local HTTP servers: the mock runtime publishes
//! each image on the port of a wiremock server that answers health checks.

mod common;

use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{APP, REGISTRY_PORT, TestEnv, app_server, image, launch_config};
use cutover::Error;
use cutover::history::ContainerHistory;
use cutover::manager::ManagerConfig;

#[tokio::test]
async fn test_start_then_switch() {
    let env = TestEnv::new().await;
    let prev_server = app_server("prev999", "<p>prev maintenance</p>").await;
    let next_server = app_server("abc123", "<p>next maintenance</p>").await;

    let prev_hash = env.register(&launch_config("prev999"), &prev_server).await;
    let next_hash = env.register(&launch_config("abc123"), &next_server).await;

    // prev999 is live and routed.
    let (prev_id, prev_port) = env.manager.start_container(&prev_hash).await.unwrap();
    assert_eq!(prev_port, prev_server.address().port());
    env.manager.switch_container(&prev_hash).await.unwrap();
    let prev_addr = format!("127.0.0.1:{}", prev_port);
    assert_eq!(env.proxy.proxy.address(), Some(prev_addr.clone()));

    // Starting abc123 leaves traffic on prev999.
    let (next_id, next_port) = env.manager.start_container(&next_hash).await.unwrap();
    assert_eq!(next_port, next_server.address().port());
    assert_eq!(env.proxy.proxy.address(), Some(prev_addr));
    let (status, body) = env.proxy.get("/").await;
    assert_eq!((status, body.as_str()), (200, "prev999"));
    assert_eq!(env.runtime.containers().await.len(), 2);

    // Switching moves traffic and sweeps prev999.
    let (switched_id, switched_port) = env.manager.switch_container(&next_hash).await.unwrap();
    assert_eq!((switched_id.as_str(), switched_port), (next_id.as_str(), next_port));
    assert_eq!(
        env.proxy.proxy.address(),
        Some(format!("127.0.0.1:{}", next_port))
    );
    let (_, body) = env.proxy.get("/").await;
    assert_eq!(body, "abc123");

    env.wait_for_container_count(1).await;
    let remaining = env.runtime.containers().await;
    assert_eq!(remaining[0].id, next_id);
    assert!(remaining[0].is_running());
    assert!(!env.runtime.has_image(&image("prev999")).await);
    assert!(env.runtime.has_image(&image("abc123")).await);

    let calls = env.runtime.calls().await;
    let stop = calls.iter().position(|c| *c == format!("stop {}", prev_id));
    let remove = calls.iter().position(|c| *c == format!("remove {}", prev_id));
    let delete = calls
        .iter()
        .position(|c| *c == format!("delete_image {}", image("prev999")));
    assert!(stop.is_some() && stop < remove && remove < delete, "{:?}", calls);

    assert_eq!(env.manager.current_container(), Some(next_id));
}

#[tokio::test]
async fn test_switch_requires_started_revision() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.register(&launch_config("abc123"), &server).await;

    let err = env.manager.switch_container(&hash).await.unwrap_err();
    assert!(matches!(err, Error::UnknownRevision(_)));
    assert_eq!(env.proxy.proxy.address(), None);
}

#[tokio::test]
async fn test_reuses_running_container() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.store.save(&launch_config("abc123")).await.unwrap();
    env.runtime
        .add_container("c1", &image("abc123"), "abc123", true, server.address().port())
        .await;

    let (id, port) = env.manager.start_container(&hash).await.unwrap();
    assert_eq!(id, "c1");
    assert_eq!(port, server.address().port());
    assert!(env.runtime.calls().await.is_empty());
}

#[tokio::test]
async fn test_starts_stopped_container() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.store.save(&launch_config("abc123")).await.unwrap();
    env.runtime
        .add_container("c1", &image("abc123"), "abc123", false, server.address().port())
        .await;

    let (id, _) = env.manager.start_container(&hash).await.unwrap();
    assert_eq!(id, "c1");
    assert_eq!(env.runtime.calls().await, vec!["start c1".to_string()]);
}

#[tokio::test]
async fn test_force_reload_recreates_container() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let mut config = launch_config("abc123");
    config.force_reload = true;
    let hash = env.register(&config, &server).await;
    env.runtime
        .add_container("c1", &image("abc123"), "abc123", true, server.address().port())
        .await;

    let (id, _) = env.manager.start_container(&hash).await.unwrap();
    assert_ne!(id, "c1");

    let calls = env.runtime.calls().await;
    assert_eq!(calls[..3], ["stop c1", "remove c1", "create abc123"]);
}

#[tokio::test]
async fn test_force_reload_refuses_live_container() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let mut config = launch_config("abc123");
    config.force_reload = true;
    let hash = env.register(&config, &server).await;

    let (id, port) = env.manager.start_container(&hash).await.unwrap();
    env.manager.switch_container(&hash).await.unwrap();

    let err = env.manager.start_container(&hash).await.unwrap_err();
    assert!(matches!(err, Error::ForceReloadLive(ref live) if *live == id));

    assert_eq!(
        env.proxy.proxy.address(),
        Some(format!("127.0.0.1:{}", port))
    );
    let containers = env.runtime.containers().await;
    assert_eq!(containers.len(), 1);
    assert!(containers[0].is_running());
    let (status, body) = env.proxy.get("/").await;
    assert_eq!((status, body.as_str()), (200, "abc123"));
}

#[tokio::test]
async fn test_created_container_gets_host_config() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let mut config = launch_config("abc123");
    config.host_config.publish_all_ports = true;
    config.host_config.binds = vec!["/srv/shop/log:/app/log".to_string()];
    let hash = env.register(&config, &server).await;

    let (id, _) = env.manager.start_container(&hash).await.unwrap();
    assert_eq!(
        env.runtime.container_host_config(&id).await,
        Some(config.host_config.clone())
    );
}

#[tokio::test]
async fn test_created_container_gets_extra_env() {
    let mut config = ManagerConfig::new(APP, REGISTRY_PORT);
    config
        .container_env
        .insert("SECRET_KEY_BASE".to_string(), "s3cr3t".to_string());
    let env = TestEnv::with_config(config).await;
    let server = app_server("abc123", "").await;
    let hash = env.register(&launch_config("abc123"), &server).await;

    let (id, _) = env.manager.start_container(&hash).await.unwrap();
    assert_eq!(
        env.runtime.container_env(&id).await.unwrap(),
        vec![
            "RACK_ENV=production".to_string(),
            "SECRET_KEY_BASE=s3cr3t".to_string()
        ]
    );

    // The stored configuration is untouched.
    let stored = env.store.load_by_hash(&hash).await.unwrap();
    assert_eq!(stored.container_config.env, vec!["RACK_ENV=production"]);
}

#[tokio::test]
async fn test_pulls_missing_image() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let config = launch_config("abc123");
    let hash = env.store.save(&config).await.unwrap();
    env.runtime
        .set_port_for_image(&image("abc123"), server.address().port())
        .await;

    env.manager.start_container(&hash).await.unwrap();
    let calls = env.runtime.calls().await;
    assert_eq!(calls[0], format!("pull {}", image("abc123")));
    assert_eq!(calls[1], "create abc123");
}

#[tokio::test]
async fn test_unhealthy_container_times_out() {
    let env = TestEnv::with_health_timeout(Duration::from_millis(100)).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let hash = env.register(&launch_config("abc123"), &server).await;

    let err = env.manager.start_container(&hash).await.unwrap_err();
    assert!(matches!(err, Error::HealthCheckTimeout { .. }));
    assert!(env.manager.tracked(&hash).is_none());
}

#[tokio::test]
async fn test_shutdown_cancels_health_check() {
    let env = TestEnv::with_health_timeout(Duration::from_secs(60)).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let hash = env.register(&launch_config("abc123"), &server).await;

    let manager = env.manager.clone();
    let start = tokio::spawn(async move { manager.start_container(&hash).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.manager.shutdown();

    let err = tokio::time::timeout(Duration::from_secs(5), start)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::HealthCheckCancelled(_)));
}

#[tokio::test]
async fn test_start_rejects_corrupt_config() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.register(&launch_config("abc123"), &server).await;
    env.objects
        .corrupt(common::BUCKET, &env.store.container_key(&hash), "{}\n")
        .await;

    let err = env.manager.start_container(&hash).await.unwrap_err();
    assert!(matches!(err, Error::HashMismatch { .. }));
    assert!(env.runtime.calls().await.is_empty());
}

#[tokio::test]
async fn test_cleanup_aborts_on_first_failure() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.register(&launch_config("abc123"), &server).await;
    env.runtime
        .add_container("old", &image("old1"), "old1", true, 1)
        .await;

    env.manager.start_container(&hash).await.unwrap();
    env.runtime.fail_on("stop_container", 500).await;
    env.manager.switch_container(&hash).await.unwrap();

    let err = env.manager.stop_old_containers().await.unwrap_err();
    match err {
        Error::Cleanup {
            container_id, step, ..
        } => {
            assert_eq!(container_id, "old");
            assert_eq!(step, "stop");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(env.runtime.containers().await.len(), 2);
    assert!(env.runtime.has_image(&image("old1")).await);
}

#[tokio::test]
async fn test_run_latest_resumes_current() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "<p>down</p>").await;
    let config = launch_config("abc123");
    env.runtime.add_image(&config.container_config.image).await;
    env.runtime
        .set_port_for_image(&config.container_config.image, server.address().port())
        .await;
    env.runtime
        .add_container("stale", &image("stale1"), "stale1", false, 1)
        .await;

    let mut history = ContainerHistory::new(env.store.clone(), TestEnv::identity());
    let event = history.add(&config).await.unwrap();
    history.save().await.unwrap();

    let (id, port) = env.manager.run_latest().await.unwrap().unwrap();
    assert_eq!(port, server.address().port());
    assert_eq!(
        env.proxy.proxy.address(),
        Some(format!("127.0.0.1:{}", port))
    );
    assert_eq!(env.manager.tracked(&event.hash).map(|t| t.id), Some(id.clone()));

    // Sweep ran before returning.
    let containers = env.runtime.containers().await;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, id);

    let (_, body) = env.proxy.get("/").await;
    assert_eq!(body, "abc123");
}

#[tokio::test]
async fn test_stats() {
    let env = TestEnv::new().await;
    let server = app_server("abc123", "").await;
    let hash = env.register(&launch_config("abc123"), &server).await;
    let (id, _) = env.manager.start_container(&hash).await.unwrap();
    env.manager.switch_container(&hash).await.unwrap();

    let stats = env.manager.stats().await.unwrap();
    assert_eq!(stats.docker_state, "Ok");
    assert_eq!(stats.current_container, Some(id));
    assert_eq!(stats.known_revisions, vec![hash]);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["DockerState"], "Ok");
}
