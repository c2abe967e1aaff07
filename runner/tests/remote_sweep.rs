use fanout_runner::{
    acquire::Acquirer,
    config::Layout,
    dispatch::RemoteDispatcher,
    hosts::{Credentials, HostDescriptor, HostRegistry, LocalHost, RunningJobs},
    job::{Job, JobResult, Metrics, Parameters},
    producer::{Producer, ProducerConfig, ProducerError},
    sweep::Sweeper,
    transport::{payload::PayloadBuilder, Transporter},
    worker::{HostWorker, SimulationCommand},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

fn host_worker(home: &Path) -> HostWorker {
    // the payload template travels along, the job arrives on stdin
    let script = "test -f model.idf && awk '/glazing:/ { print \"elec:\", $2 + 10 }'";

    HostWorker::new(
        home.to_path_buf(),
        Layout::default(),
        SimulationCommand::new(
            PathBuf::from("sh"),
            vec!["-c".to_owned(), script.to_owned()],
            Duration::from_secs(10),
        ),
        Duration::from_millis(5),
    )
}

fn start_workers(homes: &[&Path], stop: &Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
    homes
        .iter()
        .map(|home| {
            let worker = host_worker(home);
            let stop = stop.clone();
            thread::spawn(move || worker.run(&stop).unwrap())
        })
        .collect()
}

fn stop_workers(stop: &AtomicBool, workers: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().unwrap();
    }
}

fn dispatcher(homes: &[&Path], template: &Path, staging: &Path, fetched: &Path, acquirer: Acquirer) -> RemoteDispatcher {
    let mut registry = HostRegistry::new();
    for home in homes {
        registry.register(
            HostDescriptor::new(home.to_string_lossy(), Credentials::default()),
            Box::new(LocalHost::new(*home)),
        );
    }
    let layout = Layout::default();

    RemoteDispatcher::new(
        registry,
        acquirer,
        PayloadBuilder::new(
            staging.to_path_buf(),
            Some(template.to_path_buf()),
            &["**/*.idf".to_owned()],
        )
        .unwrap(),
        Transporter::new(staging.to_path_buf(), &layout, Duration::from_secs(30)),
        Sweeper::new(layout, fetched.to_path_buf(), RunningJobs::new()),
        Duration::ZERO,
    )
}

fn template() -> tempfile::TempDir {
    let template = tempfile::tempdir().unwrap();
    fs::write(template.path().join("model.idf"), b"Building,\n  retrofit;\n").unwrap();

    template
}

fn jobs(count: u64) -> Vec<Job> {
    (0..count)
        .map(|id| Job::new(id, Parameters::from([("glazing".to_owned(), id as f64)])))
        .collect()
}

fn config(deadline: Duration) -> ProducerConfig {
    ProducerConfig {
        idle_backoff: Duration::from_millis(5),
        deadline: Some(deadline),
        ..ProducerConfig::default()
    }
}

fn finished(home: &Path, id: u64, elec: f64) {
    let dir = home.join(format!("results/job-{id}"));
    fs::create_dir_all(&dir).unwrap();
    let result = JobResult::success(id, Metrics::from([("elec".to_owned(), elec)]));
    fs::write(dir.join("result.yaml"), serde_yaml::to_string(&result).unwrap()).unwrap();
    fs::write(dir.join("done"), b"").unwrap();
}

#[test]
fn sweeps_over_claimed_hosts() {
    let homes = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];
    let homes = homes.iter().map(|home| home.path()).collect::<Vec<_>>();
    let template = template();
    let staging = tempfile::tempdir().unwrap();
    let fetched = tempfile::tempdir().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let workers = start_workers(&homes, &stop);

    let dispatcher = dispatcher(
        &homes,
        template.path(),
        staging.path(),
        fetched.path(),
        Acquirer::new(Duration::from_secs(20), Duration::from_millis(10), "ready"),
    );

    let mut producer = Producer::new(dispatcher, config(Duration::from_secs(60)));
    let outcome = producer.run(jobs(5)).unwrap();

    stop_workers(&stop, workers);

    assert!(outcome.buffer.is_complete());
    assert_eq!(outcome.buffer.failed().count(), 0);
    assert_eq!(outcome.buffer.column("elec"), vec![10.0, 11.0, 12.0, 13.0, 14.0]);

    let dispatcher = producer.dispatcher();
    assert_eq!(dispatcher.running(), 0);
    for id in 0..5 {
        let dir = fetched.path().join(format!("job-{id}"));
        assert!(dir.join("result.yaml").is_file());
        assert!(dir.join("model.idf").is_file());
    }
    // nothing is left behind in staging
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[test]
fn deadline_holds_while_every_host_is_busy() {
    // no worker ever announces this host
    let home = tempfile::tempdir().unwrap();
    let template = template();
    let staging = tempfile::tempdir().unwrap();
    let fetched = tempfile::tempdir().unwrap();

    let dispatcher = dispatcher(
        &[home.path()],
        template.path(),
        staging.path(),
        fetched.path(),
        Acquirer::new(Duration::from_secs(3), Duration::from_millis(50), "ready"),
    );
    let mut producer = Producer::new(dispatcher, config(Duration::from_millis(100)));

    let start = Instant::now();
    match producer.run(jobs(2)) {
        Err(ProducerError::Incomplete { missing, outcome }) => {
            assert_eq!(missing, vec![0, 1]);
            assert_eq!(outcome.buffer.done_count(), 0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // well before the acquire timeout would have run out
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(producer.dispatcher().registry().claimed_count(), 0);
}

#[test]
fn old_results_on_a_host_are_not_taken_for_new_ones() {
    let home = tempfile::tempdir().unwrap();
    let template = template();
    let staging = tempfile::tempdir().unwrap();
    let fetched = tempfile::tempdir().unwrap();

    // leftovers of an earlier campaign, one under an id this run reuses
    finished(home.path(), 0, 999.0);
    finished(home.path(), 7, 999.0);

    let stop = Arc::new(AtomicBool::new(false));
    let workers = start_workers(&[home.path()], &stop);

    let dispatcher = dispatcher(
        &[home.path()],
        template.path(),
        staging.path(),
        fetched.path(),
        Acquirer::new(Duration::from_secs(20), Duration::from_millis(10), "ready"),
    );
    let mut producer = Producer::new(dispatcher, config(Duration::from_secs(60)));
    let outcome = producer.run(jobs(2)).unwrap();

    stop_workers(&stop, workers);

    assert_eq!(outcome.buffer.column("elec"), vec![10.0, 11.0]);
    assert!(home.path().join("results/.stale-job-7/done").is_file());
    assert!(!home.path().join("results/job-7").exists());
    assert!(!fetched.path().join("job-7").exists());

    let dispatcher = producer.dispatcher();
    assert_eq!(dispatcher.running(), 0);
    assert!(dispatcher.in_flight().is_empty());
}
