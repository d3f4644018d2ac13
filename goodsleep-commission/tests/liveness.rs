mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use goodsleep_commission::identity;
use goodsleep_commission::*;
use http_body_util::Full;
use hyper::body::Bytes;

fn address() -> ResolvedAddress {
    identity::resolve("AB:CD:12:34:EF:10", &[])
}

#[tokio::test(start_paused = true)]
async fn state_flips_on_every_tick_without_debounce() {
    let endpoint = Arc::new(FakeEndpoint::answering(1));
    endpoint.script(&[1, 1, 1, OFFLINE_STATUS, 2]);
    let mut monitor = LivenessMonitor::new(endpoint.clone(), Duration::from_secs(5));

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    monitor
        .start(address(), Duration::from_secs(5), move |record| {
            sink.lock().unwrap().push((record.current_state, record.consecutive_failures));
        })
        .await;

    // ticks at 0, 5, 10, 15 and 20 seconds
    tokio::time::sleep(Duration::from_secs(22)).await;
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            (LivenessState::Online, 0),
            (LivenessState::Online, 0),
            (LivenessState::Online, 0),
            (LivenessState::Offline, 1),
            (LivenessState::Online, 0),
        ]
    );
    assert_eq!(monitor.record().unwrap().current_state, LivenessState::Online);
    assert!(endpoint.queries().iter().all(|q| q == "AB:CD:12:34:EF:10"));
}

#[tokio::test(start_paused = true)]
async fn nothing_fires_after_stop() {
    let endpoint = Arc::new(FakeEndpoint::answering(1));
    let mut monitor = LivenessMonitor::new(endpoint.clone(), Duration::from_secs(5));

    let ticks = Arc::new(Mutex::new(0u32));
    let counter = ticks.clone();
    monitor
        .start(address(), Duration::from_secs(5), move |_| *counter.lock().unwrap() += 1)
        .await;
    tokio::time::sleep(Duration::from_secs(12)).await;
    monitor.stop().await;
    assert!(!monitor.is_running());

    let fired = *ticks.lock().unwrap();
    let queried = endpoint.queries().len();
    assert_eq!(fired, 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(*ticks.lock().unwrap(), fired);
    assert_eq!(endpoint.queries().len(), queried);
}

#[tokio::test(start_paused = true)]
async fn zero_interval_still_polls() {
    let endpoint = Arc::new(FakeEndpoint::answering(1));
    let mut monitor = LivenessMonitor::new(endpoint.clone(), Duration::from_secs(5));

    monitor.start(address(), Duration::ZERO, |_| {}).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    monitor.stop().await;

    assert_eq!(monitor.record().unwrap().current_state, LivenessState::Online);
    assert!(!endpoint.queries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_endpoint_counts_failures() {
    let endpoint = Arc::new(FakeEndpoint::answering(1));
    endpoint.set_failing(true);
    let mut monitor = LivenessMonitor::new(endpoint.clone(), Duration::from_secs(5));
    monitor.start(address(), Duration::from_secs(5), |_| {}).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    let record = monitor.record().unwrap();
    assert_eq!(record.current_state, LivenessState::Offline);
    assert_eq!(record.consecutive_failures, 3);
    assert_eq!(record.last_online_timestamp, None);

    endpoint.set_failing(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let record = monitor.record().unwrap();
    assert_eq!(record.current_state, LivenessState::Online);
    assert_eq!(record.last_online_timestamp, Some(1_700_000_000));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn one_shot_check_times_out() {
    let endpoint = Arc::new(FakeEndpoint::answering(1));
    let monitor = LivenessMonitor::new(endpoint.clone(), Duration::from_secs(5));
    assert_eq!(monitor.check(&address()).await, LivenessState::Online);

    endpoint.set_delay(Duration::from_secs(30));
    let started = tokio::time::Instant::now();
    assert_eq!(monitor.check(&address()).await, LivenessState::Offline);
    assert!(started.elapsed() < Duration::from_secs(6));
}

async fn serve_status(status: u16, body: &'static str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let io = hyper_util::rt::TokioIo::new(stream);
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| async move {
                    let body = if req.uri().path() == "/device/AB:CD:12:34:EF:10/status" {
                        body
                    } else {
                        "{}"
                    };
                    let mut response = hyper::Response::new(Full::new(Bytes::from(body)));
                    *response.status_mut() = hyper::StatusCode::from_u16(status).unwrap();
                    Ok::<_, std::convert::Infallible>(response)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn http_endpoint_reads_status() {
    let base = serve_status(200, r#"{"status": 1, "updated_at": 1700000123}"#).await;
    let endpoint = HttpLivenessEndpoint::new(&base);
    let report = endpoint.query(&address()).await.unwrap();
    assert_eq!(report, LivenessReport { status_id: 1, last_update: 1_700_000_123 });
    assert!(report.is_online());
}

#[tokio::test]
async fn http_endpoint_reports_offline_and_errors() {
    let base = serve_status(200, r#"{"status": 4, "updated_at": 1}"#).await;
    let report = HttpLivenessEndpoint::new(&base).query(&address()).await.unwrap();
    assert!(!report.is_online());

    let base = serve_status(200, "not json").await;
    assert!(matches!(
        HttpLivenessEndpoint::new(&base).query(&address()).await,
        Err(LivenessError::Malformed(_))
    ));

    let base = serve_status(503, "{}").await;
    assert!(matches!(
        HttpLivenessEndpoint::new(&base).query(&address()).await,
        Err(LivenessError::Transport(_))
    ));
}
