mod test_harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use slipway::rpc::codes;
use slipway::scheduler::{Job, JobPolicy, JobQueue, JobState};
use test_harness::{CollectingSink, SinkEvent};

fn make_job(event: &str, policy: JobPolicy) -> (Arc<Job>, CollectingSink) {
    let sink = CollectingSink::new();
    let job = Arc::new(Job::new(
        event,
        Bytes::from_static(b"payload"),
        policy,
        Box::new(sink.clone()),
    ));
    (job, sink)
}

#[test]
fn test_urgent_goes_to_front() {
    let mut queue = JobQueue::new(10);

    let (normal, _) = make_job("normal", JobPolicy::default());
    let (urgent, _) = make_job("urgent", JobPolicy::urgent());

    queue.push(normal);
    queue.push(urgent);

    assert_eq!(queue.pop_front().unwrap().event, "urgent");
    assert_eq!(queue.pop_front().unwrap().event, "normal");
    assert!(queue.is_empty());
}

#[test]
fn test_fifo_within_each_priority() {
    let mut queue = JobQueue::new(10);

    for name in ["n1", "n2"] {
        let (job, _) = make_job(name, JobPolicy::default());
        queue.push(job);
    }
    for name in ["u1", "u2"] {
        let (job, _) = make_job(name, JobPolicy::urgent());
        queue.push(job);
    }

    // Urgent insertion is at the head, so later urgent jobs precede
    // earlier ones; the normal tail keeps its submission order.
    let order: Vec<String> = std::iter::from_fn(|| queue.pop_front())
        .map(|j| j.event.clone())
        .collect();
    assert_eq!(order, ["u2", "u1", "n1", "n2"]);
}

#[test]
fn test_iter_expired_scans_only_past_deadlines() {
    let mut queue = JobQueue::new(10);
    let now = Instant::now();

    let (expired, _) = make_job(
        "expired",
        JobPolicy::default().with_deadline(now - Duration::from_secs(1)),
    );
    let (future, _) = make_job(
        "future",
        JobPolicy::default().with_deadline(now + Duration::from_secs(60)),
    );
    let (unbounded, _) = make_job("unbounded", JobPolicy::default());

    queue.push(expired);
    queue.push(future);
    queue.push(unbounded);

    let hits: Vec<String> = queue.iter_expired(now).map(|j| j.event.clone()).collect();
    assert_eq!(hits, ["expired"]);

    // The scan is restartable and does not consume the queue.
    assert_eq!(queue.iter_expired(now).count(), 1);
    assert_eq!(queue.len(), 3);
}

#[test]
fn test_drop_terminal_removes_cancelled_jobs() {
    let mut queue = JobQueue::new(10);

    let (keep, _) = make_job("keep", JobPolicy::default());
    let (cancel, cancel_sink) = make_job("cancel", JobPolicy::default());
    queue.push(keep);
    queue.push(cancel.clone());

    // Producer-side cancellation: the job transitions itself to terminal.
    cancel.process_error(codes::RESOURCE_ERROR, "cancelled by the producer");
    assert_eq!(cancel_sink.error_code(), Some(codes::RESOURCE_ERROR));

    assert_eq!(queue.drop_terminal(), 1);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.front().unwrap().event, "keep");
}

#[test]
fn test_queue_capacity() {
    let mut queue = JobQueue::new(2);
    assert!(!queue.is_full());

    for name in ["a", "b"] {
        let (job, _) = make_job(name, JobPolicy::default());
        queue.push(job);
    }
    assert!(queue.is_full());
}

#[test]
fn test_job_success_path() {
    let (job, sink) = make_job("ping", JobPolicy::default());
    assert_eq!(job.state(), JobState::Pending);

    job.process_invoke();
    assert_eq!(job.state(), JobState::Dispatched);

    job.process_chunk(Bytes::from_static(b"one"));
    job.process_chunk(Bytes::from_static(b"two"));
    assert_eq!(job.state(), JobState::Streaming);

    job.process_choke();
    assert_eq!(job.state(), JobState::Complete);
    assert!(job.is_terminal());

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Chunk(Bytes::from_static(b"one")),
            SinkEvent::Chunk(Bytes::from_static(b"two")),
            SinkEvent::Close,
        ]
    );
}

#[test]
fn test_terminal_states_are_absorbing() {
    let (job, sink) = make_job("ping", JobPolicy::default());

    job.process_invoke();
    job.process_error(codes::DEADLINE_ERROR, "the job has expired");
    assert_eq!(job.state(), JobState::Failed);

    // Late events must neither resurrect the job nor reach the sink.
    job.process_chunk(Bytes::from_static(b"late"));
    job.process_choke();
    job.process_error(codes::RESOURCE_ERROR, "again");

    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(sink.events().len(), 1);
    assert_eq!(sink.error_code(), Some(codes::DEADLINE_ERROR));
}

#[test]
fn test_chunk_before_dispatch_is_ignored() {
    let (job, sink) = make_job("ping", JobPolicy::default());

    job.process_chunk(Bytes::from_static(b"early"));
    assert_eq!(job.state(), JobState::Pending);
    assert!(sink.events().is_empty());
}
