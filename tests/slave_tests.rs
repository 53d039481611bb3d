mod test_harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use slipway::pool::slave::Slave;
use slipway::rpc::codes;
use slipway::scheduler::{Job, JobPolicy, JobState};
use test_harness::CollectingSink;

const TIMEOUT: Duration = Duration::from_millis(100);

fn make_job(event: &str) -> (Arc<Job>, CollectingSink) {
    let sink = CollectingSink::new();
    let job = Arc::new(Job::new(
        event,
        Bytes::from_static(b"payload"),
        JobPolicy::default(),
        Box::new(sink.clone()),
    ));
    (job, sink)
}

#[test]
fn test_fresh_slave_is_idle() {
    let slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    assert!(slave.is_alive());
    assert!(slave.is_idle());
    assert!(!slave.is_busy());
}

#[test]
fn test_assign_carries_exactly_one_job() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    let (first, _) = make_job("first");
    let (second, _) = make_job("second");

    assert!(slave.assign(first.clone()));
    assert!(slave.is_busy());
    assert_eq!(first.state(), JobState::Dispatched);

    // A busy slave refuses a second job, and the job is left untouched.
    assert!(!slave.assign(second.clone()));
    assert_eq!(second.state(), JobState::Pending);
}

#[test]
fn test_chunk_and_choke_complete_the_job() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    let (job, sink) = make_job("stream");
    slave.assign(job.clone());

    slave.on_chunk(Bytes::from_static(b"part"));
    assert!(slave.is_busy());
    assert_eq!(job.state(), JobState::Streaming);

    slave.on_choke();
    assert!(slave.is_idle());
    assert_eq!(job.state(), JobState::Complete);
    assert!(sink.closed());
}

#[test]
fn test_error_fails_the_job_and_frees_the_slave() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    let (job, sink) = make_job("doomed");
    slave.assign(job.clone());

    slave.on_error(codes::APP_ERROR, "handler raised");
    assert!(slave.is_idle());
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(sink.error_code(), Some(codes::APP_ERROR));
    assert_eq!(sink.error_message().as_deref(), Some("handler raised"));
}

#[test]
fn test_terminate_fails_the_inflight_job() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    let (job, sink) = make_job("inflight");
    slave.assign(job);

    slave.on_terminate();
    assert!(slave.is_dead());
    assert_eq!(sink.error_code(), Some(codes::RESOURCE_ERROR));
}

#[test]
fn test_liveness_expiry() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    let (job, sink) = make_job("orphaned");
    slave.assign(job);

    // Within the budget the slave survives.
    assert!(!slave.expire(Instant::now()));
    assert!(slave.is_busy());

    // Past the budget it dies and the job fails with a resource error.
    assert!(slave.expire(Instant::now() + 2 * TIMEOUT));
    assert!(slave.is_dead());
    assert_eq!(sink.error_code(), Some(codes::RESOURCE_ERROR));
}

#[test]
fn test_heartbeat_extends_the_liveness_budget() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);

    let later = Instant::now() + TIMEOUT + Duration::from_millis(10);
    slave.on_heartbeat(10 * TIMEOUT);

    assert!(!slave.expire(later));
    assert!(slave.is_alive());
}

#[test]
fn test_dead_slaves_ignore_everything() {
    let mut slave = Slave::new(Uuid::new_v4(), TIMEOUT);
    slave.on_terminate();
    assert!(slave.is_dead());

    let (job, _) = make_job("late");
    slave.on_heartbeat(TIMEOUT);
    slave.on_chunk(Bytes::from_static(b"late"));
    slave.on_choke();
    slave.on_error(codes::APP_ERROR, "late");
    assert!(!slave.assign(job.clone()));

    assert!(slave.is_dead());
    assert_eq!(job.state(), JobState::Pending);
}
