//! `PooledServiceProxy` over several live servers.

mod common;

use std::time::Duration;

use common::{echo, service, sleep, TestServer};
use remora_client::{
    Arg, DropPolicy, PoolConfig, PooledServiceProxy, PrioritizePolicy, RemoteServiceExt,
    ServiceProxy,
};
use remora_common::protocol::{ControllerInfo, RemoraError, Status};
use serde_json::json;

async fn wait_for_active(pool: &PooledServiceProxy, count: usize) {
    for _ in 0..200 {
        if pool.active_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool has {} active connections, expected {}",
        pool.active_count(),
        count
    );
}

#[tokio::test]
async fn test_pool_adopts_and_serves() {
    let servers = [TestServer::start().await, TestServer::start().await];
    let pool = PooledServiceProxy::new(service(), PoolConfig::default()).unwrap();

    for server in &servers {
        let candidate = ServiceProxy::new(server.addr.clone(), service()).unwrap();
        assert!(pool.pool(candidate).await);
    }
    wait_for_active(&pool, 2).await;

    let text: String = pool
        .call(&echo(), Duration::from_secs(1), vec![json!("pooled").into()])
        .await
        .unwrap();
    assert_eq!(text, "pooled");
    pool.close().await;
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn test_empty_pool_fails_fast() {
    let pool = PooledServiceProxy::new(service(), PoolConfig::default()).unwrap();
    let result = pool
        .request(&echo(), Duration::from_secs(5), vec![json!("x").into()])
        .await;
    assert!(matches!(result, Err(RemoraError::NoAvailableConnection)));
}

#[tokio::test]
async fn test_candidate_without_controller_is_dropped() {
    let server = TestServer::start().await;
    let wider = service().with_controller(ControllerInfo::new("Other", "1"));
    let pool = PooledServiceProxy::new(wider, PoolConfig::default()).unwrap();

    let candidate = ServiceProxy::new(server.addr.clone(), service()).unwrap();
    assert!(!pool.pool(candidate).await);
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn test_least_load_spreads_concurrent_calls() {
    let servers = [TestServer::start().await, TestServer::start().await];
    let config = PoolConfig::default().with_prioritize(PrioritizePolicy::LeastLoadFirst);
    let pool = std::sync::Arc::new(PooledServiceProxy::new(service(), config).unwrap());

    for server in &servers {
        assert!(pool.pool(ServiceProxy::new(server.addr.clone(), service()).unwrap()).await);
    }
    wait_for_active(&pool, 2).await;

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.request(&sleep(), Duration::from_secs(2), vec![json!(300).into()])
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let loads: Vec<usize> = pool.connections().iter().map(|(_, qos)| qos.in_flight).collect();
    assert_eq!(loads.iter().sum::<usize>(), 1);

    // the idle connection takes every call while the other is busy
    for _ in 0..5 {
        let response = pool
            .request(&echo(), Duration::from_secs(1), vec![Arg::Value(json!("x"))])
            .await
            .unwrap();
        assert!(response.is_successful);
    }
    let echoed: Vec<usize> = servers
        .iter()
        .map(|s| s.calls.load(std::sync::atomic::Ordering::SeqCst))
        .collect();
    assert!(echoed.contains(&5) && echoed.contains(&0), "{:?}", echoed);

    assert!(busy.await.unwrap().is_successful);
}

#[tokio::test]
async fn test_probe_failure_evicts_dead_connection() {
    let survivor = TestServer::start().await;
    let doomed = TestServer::start().await;
    let config = PoolConfig::default().with_probe_interval(Duration::from_millis(50));
    let pool = PooledServiceProxy::new(service(), config).unwrap();

    assert!(pool.pool(ServiceProxy::new(survivor.addr.clone(), service()).unwrap()).await);
    assert!(pool.pool(ServiceProxy::new(doomed.addr.clone(), service()).unwrap()).await);
    wait_for_active(&pool, 2).await;

    doomed.adapter.close().await;
    wait_for_active(&pool, 1).await;

    let (addr, _) = &pool.connections()[0];
    assert_eq!(addr, &survivor.addr);
    pool.close().await;
}

#[tokio::test]
async fn test_request_fail_policy_evicts_after_timeouts() {
    let server = TestServer::start().await;
    let config = PoolConfig::default()
        .with_probe_interval(Duration::from_secs(60))
        .with_drop(DropPolicy::RequestFail { max_failures: 2 });
    let pool = PooledServiceProxy::new(service(), config).unwrap();

    assert!(pool.pool(ServiceProxy::new(server.addr.clone(), service()).unwrap()).await);
    wait_for_active(&pool, 1).await;

    for _ in 0..2 {
        let response = pool
            .request(&sleep(), Duration::from_millis(20), vec![json!(500).into()])
            .await
            .unwrap();
        assert_eq!(response.status(), Some(Status::Timeout));
    }
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn test_lag_policy_keeps_fast_connection() {
    let server = TestServer::start().await;
    let config = PoolConfig::default()
        .with_probe_interval(Duration::from_millis(50))
        .with_drop(DropPolicy::Lag {
            threshold: Duration::from_secs(1),
        });
    let pool = PooledServiceProxy::new(service(), config).unwrap();

    assert!(pool.pool(ServiceProxy::new(server.addr.clone(), service()).unwrap()).await);
    wait_for_active(&pool, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, qos) = &pool.connections()[0];
    assert!(qos.latency.is_some());
    assert_eq!(pool.active_count(), 1);
}
