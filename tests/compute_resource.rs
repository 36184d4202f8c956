//! Compute Resource Behavior Tests
//!
//! Submit, batched status and kill against the mock backend, covering the
//! session discipline, the absent-job policy and error classification.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use cwl_compute::backend::BackendState;
use cwl_compute::mock::{FailureConfig, MockBackend, MockOp};
use cwl_compute::{AbsentJobPolicy, ComputeError, ComputeResource, HostConfig, Job, JobState, SubmissionMode};

fn host() -> HostConfig {
    HostConfig::new("mock", "mock://node", "/scratch/jobs", BTreeMap::new()).unwrap()
}

fn resource(backend: &MockBackend) -> ComputeResource {
    ComputeResource::with_backend(host(), Arc::new(backend.clone()))
}

fn long_job(id: &str) -> Job {
    Job::new(id, vec!["sleep".into(), "3600".into()], "/scratch/jobs")
}

fn submit(resource: &ComputeResource, id: &str) -> Job {
    let mut job = long_job(id);
    let handle = resource.submit(&job).expect("submit should succeed");
    job.assign_handle(handle).unwrap();
    job
}

// =============================================================================
// Host addresses
// =============================================================================

#[test]
fn test_valid_addresses_expose_scheme_and_hostname() {
    for (address, scheme, hostname) in [
        ("local://localhost", "local", "localhost"),
        ("ssh://user@login.example.org:2222", "ssh", "user@login.example.org:2222"),
        ("slurm://das5.vu.nl", "slurm", "das5.vu.nl"),
    ] {
        let host = HostConfig::new("h", address, "/w", BTreeMap::new()).unwrap();
        assert_eq!(host.address.scheme(), scheme);
        assert_eq!(host.address.hostname(), hostname);
    }
}

#[test]
fn test_addresses_without_exactly_one_separator_fail() {
    for address in ["localhost", "ssh:/host", "ssh://a://b", "", "://host", "ssh://"] {
        let err = HostConfig::new("h", address, "/w", BTreeMap::new()).unwrap_err();
        assert!(
            matches!(err, ComputeError::ValidationFailure(_)),
            "{address:?} should fail validation"
        );
    }
}

// =============================================================================
// Submit
// =============================================================================

#[test]
fn test_fresh_submission_is_never_done() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let job = submit(&resource, "fresh");
    let states = resource.status(&[job]).unwrap();
    assert!(matches!(states[0], JobState::Running | JobState::Pending));

    let queued = MockBackend::new().with_initial_state(BackendState::Other("PENDING".into()));
    let resource = self::resource(&queued);
    let job = submit(&resource, "queued");
    assert_eq!(resource.status(&[job]).unwrap(), vec![JobState::Pending]);
}

#[test]
fn test_same_id_twice_gives_distinct_handles() {
    let backend = MockBackend::new();
    let resource = resource(&backend);

    let first = submit(&resource, "twice");
    let second = submit(&resource, "twice");
    assert_ne!(first.batch_id(), second.batch_id());

    // resubmitting the original record is refused; a new record is required
    assert!(resource.submit(&first).is_err());
    let third = {
        let mut again = first.resubmission();
        again.assign_handle(resource.submit(&again).unwrap()).unwrap();
        again
    };
    assert_ne!(third.batch_id(), first.batch_id());
    assert_ne!(third.batch_id(), second.batch_id());
}

#[test]
fn test_submission_plan_follows_mode() {
    let backend = MockBackend::new().with_mode(SubmissionMode::Detached);
    let resource = resource(&backend);
    let job = Job::new("abc", vec!["echo".into(), "hi there".into()], "/scratch/jobs");
    resource.submit(&job).unwrap();

    let plan = &backend.submitted()[0];
    assert_eq!(plan.executable, "/bin/sh");
    assert_eq!(
        plan.arguments,
        vec!["-c", "'echo' 'hi there' >'stdout_abc.txt' 2>'stderr_abc.txt' &"]
    );
    assert_eq!(plan.environment.get("SIMCITY_JOBID").map(String::as_str), Some("abc"));
}

#[test]
fn test_submit_failure_is_io_failure_with_native_class() {
    let backend = MockBackend::new();
    backend.inject(MockOp::Submit, FailureConfig::error("SlurmSubmitError", "invalid account"));

    let err = resource(&backend).submit(&long_job("rejected")).unwrap_err();
    match err {
        ComputeError::IoFailure { class, message } => {
            assert_eq!(class, "SlurmSubmitError");
            assert!(message.contains("invalid account"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(backend.opened(), 1);
    assert_eq!(backend.closed(), 1);
}

#[test]
fn test_job_id_with_scheduler_metacharacters_fails_before_io() {
    let backend = MockBackend::new();
    let resource = resource(&backend);

    for id in ["a,b%j", "wf/1", "two words"] {
        let err = resource.submit(&long_job(id)).unwrap_err();
        assert!(
            matches!(err, ComputeError::ValidationFailure(_)),
            "{id:?} should fail validation"
        );
    }
    assert_eq!(backend.opened(), 0);
}

#[test]
fn test_connection_failure_is_not_retried() {
    let backend = MockBackend::new();
    backend.inject(
        MockOp::Open,
        FailureConfig::error("SshConnectError", "Connection refused").with_code(255),
    );

    let err = resource(&backend).submit(&long_job("offline")).unwrap_err();
    assert!(matches!(err, ComputeError::ConnectionFailure { code: Some(255), .. }));
    assert_eq!(backend.counts().submit, 0);
}

// =============================================================================
// Status
// =============================================================================

#[test]
fn test_batched_status_lists_once() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let jobs: Vec<Job> = ["a", "b", "c"].iter().map(|id| submit(&resource, id)).collect();
    let lists_before = backend.list_calls();
    let opens_before = backend.opened();

    let states = resource.status(&jobs).unwrap();
    assert_eq!(states.len(), 3);
    assert_eq!(backend.list_calls() - lists_before, 1);
    assert_eq!(backend.opened() - opens_before, 1);
    assert_eq!(backend.opened(), backend.closed());
}

#[test]
fn test_disappeared_job_is_done() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let job = submit(&resource, "vanishing");
    backend.purge(job.batch_id().unwrap());

    // idempotent across repeated queries
    assert_eq!(resource.status(&[job.clone()]).unwrap(), vec![JobState::Done]);
    assert_eq!(resource.status(&[job]).unwrap(), vec![JobState::Done]);
}

#[test]
fn test_backend_default_absent_policy() {
    let backend = MockBackend::new().with_absent_policy(AbsentJobPolicy::Unknown);
    let resource = resource(&backend);
    let job = submit(&resource, "vanishing");
    backend.purge(job.batch_id().unwrap());

    assert_eq!(resource.status(&[job]).unwrap(), vec![JobState::Unknown]);
}

#[test]
fn test_missing_handle_fails_before_io() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let submitted = submit(&resource, "ok");
    let opens = backend.opened();

    let err = resource
        .status(&[submitted, long_job("never-submitted")])
        .unwrap_err();
    assert!(matches!(err, ComputeError::MissingHandle { ref job_id } if job_id == "never-submitted"));

    let err = resource.kill(&long_job("never-submitted")).unwrap_err();
    assert!(matches!(err, ComputeError::MissingHandle { .. }));
    assert_eq!(backend.opened(), opens);
}

#[test]
fn test_per_job_query_error_degrades_to_unknown() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let good = submit(&resource, "good");
    let bad = submit(&resource, "bad");
    let done = submit(&resource, "done");
    backend.fail_status_of(bad.batch_id().unwrap());
    backend.complete(done.batch_id().unwrap());

    let states = resource.status(&[good, bad, done]).unwrap();
    assert_eq!(states, vec![JobState::Running, JobState::Unknown, JobState::Done]);
}

// =============================================================================
// Kill
// =============================================================================

#[test]
fn test_kill_absent_job_returns_none() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let job = submit(&resource, "gone");
    backend.purge(job.batch_id().unwrap());

    assert!(resource.kill(&job).unwrap().is_none());
    assert_eq!(backend.counts().cancel, 0);
    assert_eq!(backend.opened(), backend.closed());
}

#[test]
fn test_kill_running_job() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let job = submit(&resource, "target");

    let archived = resource.kill(&job).unwrap().expect("job should be archived");
    assert_eq!(archived.job.batch_id(), job.batch_id());
    assert_eq!(archived.job.state, JobState::Done);
    assert_eq!(backend.state_of(job.batch_id().unwrap()), Some(BackendState::Done));
}

// =============================================================================
// Sessions and concurrency
// =============================================================================

#[test]
fn test_every_call_releases_its_session() {
    let backend = MockBackend::new();
    let resource = resource(&backend);
    let job = submit(&resource, "s");

    backend.inject(MockOp::List, FailureConfig::error("ListError", "timeout").with_fail_count(1));
    assert!(resource.status(&[job.clone()]).is_err());
    assert!(resource.status(&[job.clone()]).is_ok());

    backend.inject(MockOp::Cancel, FailureConfig::error("CancelError", "denied"));
    assert!(resource.kill(&job).is_err());

    let counts = backend.counts();
    assert_eq!(counts.opened, 4);
    assert_eq!(counts.closed, 4);
}

#[test]
fn test_concurrent_calls_use_separate_sessions() {
    let backend = MockBackend::new();
    let resource = Arc::new(resource(&backend));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let resource = Arc::clone(&resource);
            thread::spawn(move || {
                let job = submit(&resource, &format!("job-{i}"));
                resource.status(&[job]).unwrap()[0]
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), JobState::Running);
    }

    let counts = backend.counts();
    assert_eq!(counts.opened, 16);
    assert_eq!(counts.closed, 16);
    assert_eq!(backend.submitted().len(), 8);
}
