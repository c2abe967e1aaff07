use super::*;
use crate::{
    dispatch::QueueDispatcher,
    job::{Metrics, Parameters},
    queue::{LocalQueues, QueueError, QueueName, Queues},
};

/// Answers submitted jobs from a script instead of running them
#[derive(Default)]
struct Scripted {
    submitted: Vec<JobId>,
    unanswered: Vec<JobId>,
    // answer in exactly this order, waiting for submissions where needed
    order: Option<VecDeque<JobId>>,
    fail_first: Vec<JobId>,
    never_answer: Vec<JobId>,
    defer: usize,
    shutdowns: usize,
    refuse_shutdown: bool,
}

fn elec(id: JobId) -> f64 {
    id as f64 * 10.0 + 1.0
}

impl Dispatcher for Scripted {
    fn submit(&mut self, job: &Job) -> Result<Submission, DispatchError> {
        if self.defer > 0 {
            self.defer -= 1;
            return Ok(Submission::Deferred);
        }

        self.submitted.push(job.id);
        if !self.never_answer.contains(&job.id) {
            self.unanswered.push(job.id);
        }

        Ok(Submission::Submitted)
    }

    fn poll(&mut self) -> Result<Option<JobResult>, DispatchError> {
        let next = match self.order {
            Some(ref mut order) => match order.front().copied() {
                Some(id) if self.unanswered.contains(&id) => order.pop_front(),
                _ => None,
            },
            None => self.unanswered.first().copied(),
        };
        let Some(id) = next else {
            return Ok(None);
        };
        self.unanswered.retain(|&other| other != id);

        if let Some(position) = self.fail_first.iter().position(|&other| other == id) {
            self.fail_first.remove(position);
            return Ok(Some(JobResult::failure(id, "simulation crashed")));
        }

        Ok(Some(JobResult::success(
            id,
            Metrics::from([("elec".to_owned(), elec(id))]),
        )))
    }

    fn shutdown(&mut self) -> Result<(), DispatchError> {
        self.shutdowns += 1;
        if self.refuse_shutdown {
            return Err(QueueError::Disconnected.into());
        }

        Ok(())
    }
}

fn jobs(count: u64) -> Vec<Job> {
    (0..count).map(|id| Job::new(id, Parameters::new())).collect()
}

fn config() -> ProducerConfig {
    ProducerConfig {
        idle_backoff: Duration::from_millis(1),
        ..ProducerConfig::default()
    }
}

#[test]
fn out_of_order_results_land_in_their_slots() {
    let dispatcher = Scripted {
        order: Some(VecDeque::from([2, 0, 3, 1])),
        ..Scripted::default()
    };
    let mut producer = Producer::new(dispatcher, config());

    let outcome = producer.run(jobs(4)).unwrap();

    assert!(outcome.buffer.is_complete());
    assert_eq!(outcome.buffer.column("elec"), vec![1.0, 11.0, 21.0, 31.0]);
    assert_eq!(
        outcome
            .events
            .iter()
            .filter(|event| event.fraction == 1.0)
            .count(),
        1
    );
    assert_eq!(producer.dispatcher().shutdowns, 1);
}

#[test]
fn failed_jobs_are_retried() {
    let dispatcher = Scripted {
        fail_first: vec![1],
        ..Scripted::default()
    };
    let mut producer = Producer::new(
        dispatcher,
        ProducerConfig {
            max_retries: 1,
            ..config()
        },
    );

    let outcome = producer.run(jobs(3)).unwrap();

    assert_eq!(
        producer.dispatcher().submitted.iter().filter(|&&id| id == 1).count(),
        2
    );
    assert_eq!(outcome.buffer.slot(1), Some(&Slot::Done(Metrics::from([("elec".to_owned(), 11.0)]))));
    assert_eq!(outcome.buffer.failed().count(), 0);
}

#[test]
fn failures_without_retries_count_as_done() {
    let dispatcher = Scripted {
        fail_first: vec![0],
        ..Scripted::default()
    };
    let mut producer = Producer::new(dispatcher, config());

    let outcome = producer.run(jobs(2)).unwrap();

    assert_eq!(producer.dispatcher().submitted, vec![0, 1]);
    assert_eq!(
        outcome.buffer.failed().collect::<Vec<_>>(),
        vec![(0, "simulation crashed")]
    );
    assert!(outcome.buffer.column("elec")[0].is_nan());
}

#[test]
fn deadline_reports_missing_jobs() {
    let dispatcher = Scripted {
        never_answer: vec![3],
        ..Scripted::default()
    };
    let mut producer = Producer::new(
        dispatcher,
        ProducerConfig {
            deadline: Some(Duration::from_millis(50)),
            ..config()
        },
    );

    match producer.run(jobs(5)) {
        Err(ProducerError::Incomplete { missing, outcome }) => {
            assert_eq!(missing, vec![3]);
            assert_eq!(outcome.buffer.done_count(), 4);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(producer.dispatcher().shutdowns, 1);
}

#[test]
fn deferred_jobs_keep_their_place() {
    let dispatcher = Scripted {
        defer: 3,
        ..Scripted::default()
    };
    let mut producer = Producer::new(dispatcher, config());

    producer.run(jobs(4)).unwrap();

    assert_eq!(producer.dispatcher().submitted, vec![0, 1, 2, 3]);
}

#[test]
fn ids_must_match_positions() {
    let mut jobs = jobs(3);
    jobs[2].id = 7;

    assert!(matches!(
        Producer::new(Scripted::default(), config()).run(jobs),
        Err(ProducerError::NonContiguousIds { position: 2, id: 7 })
    ));
}

#[test]
fn empty_sweeps_finish_immediately() {
    let mut producer = Producer::new(Scripted::default(), config());
    let outcome = producer.run(Vec::new()).unwrap();

    assert!(outcome.buffer.is_empty());
    assert_eq!(producer.dispatcher().shutdowns, 1);
}

#[test]
fn finished_sweeps_survive_a_failed_shutdown() {
    let dispatcher = Scripted {
        refuse_shutdown: true,
        ..Scripted::default()
    };
    let mut producer = Producer::new(dispatcher, config());

    let outcome = producer.run(jobs(3)).unwrap();

    assert!(outcome.buffer.is_complete());
    assert_eq!(outcome.buffer.column("elec"), vec![1.0, 11.0, 21.0]);
    assert_eq!(producer.dispatcher().shutdowns, 1);
}

#[test]
fn full_job_queue_at_shutdown_keeps_the_results() {
    // room for the job and a single kill marker
    let queues = LocalQueues::new(2);
    Queues::new(queues.clone())
        .put_result(&JobResult::success(
            0,
            Metrics::from([("elec".to_owned(), 4.0)]),
        ))
        .unwrap();

    let dispatcher = QueueDispatcher::new(queues.clone(), 3, Duration::from_millis(50));
    let mut producer = Producer::new(dispatcher, config());

    let outcome = producer.run(jobs(1)).unwrap();

    assert!(outcome.buffer.is_complete());
    assert_eq!(outcome.buffer.column("elec"), vec![4.0]);
    assert_eq!(queues.len(QueueName::Jobs), 2);
}
