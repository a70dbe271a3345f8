// rust/split-core/src/client.rs

//! Client-side merge of task streams.
//!
//! An [`ElementStream`] reads from whichever task of a job has an element
//! ready. With a single worker the output order equals single-process order;
//! with several workers only the multiset of elements is defined.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Select};
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, JobStatus};
use crate::error::{Result, SplitError};
use crate::pipeline::Element;

/// First-available merge over every task channel of one job.
///
/// Dropping an unfinished stream cancels its job.
pub struct ElementStream {
    job_id: String,
    dispatcher: Arc<Dispatcher>,
    receivers: Vec<Receiver<Result<Element>>>,
    stall_deadline: Duration,
    delivered: u64,
    finished: bool,
}

enum Selected {
    Item(Result<Element>),
    Closed(usize),
    Stalled,
}

impl ElementStream {
    pub(crate) fn new(
        job_id: String,
        dispatcher: Arc<Dispatcher>,
        receivers: Vec<Receiver<Result<Element>>>,
        stall_deadline: Duration,
    ) -> Self {
        Self {
            job_id,
            dispatcher,
            receivers,
            stall_deadline,
            delivered: 0,
            finished: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Number of task channels still open.
    pub fn open_tasks(&self) -> usize {
        self.receivers.len()
    }

    /// Elements handed out so far, errors included.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn select(&self) -> Selected {
        let mut sel = Select::new();
        for rx in &self.receivers {
            sel.recv(rx);
        }
        match sel.select_timeout(self.stall_deadline) {
            Ok(op) => {
                let index = op.index();
                match op.recv(&self.receivers[index]) {
                    Ok(item) => Selected::Item(item),
                    Err(_) => Selected::Closed(index),
                }
            }
            Err(_) => Selected::Stalled,
        }
    }

    /// Decides how the stream ends once every task channel has closed.
    fn finish(&mut self) -> Option<Result<Element>> {
        self.finished = true;

        let status = match self.dispatcher.job_status(&self.job_id) {
            Ok(status) => status,
            Err(e) => return Some(Err(e)),
        };
        if let JobStatus::Failed { reason } = status {
            return Some(Err(SplitError::job_failed(&self.job_id, reason)));
        }

        let progress = match self.dispatcher.job_progress(&self.job_id) {
            Ok(progress) => progress,
            Err(e) => return Some(Err(e)),
        };
        // Every task has ended, so nobody will ask for these splits again.
        if progress.has_undelivered() {
            let reason = format!(
                "{} released splits were never redelivered",
                progress.splits_pending
            );
            if let Err(e) = self.dispatcher.fail_job(&self.job_id, reason.as_str()) {
                debug!(job_id = %self.job_id, error = %e, "Failed to mark job failed");
            }
            return Some(Err(SplitError::job_failed(&self.job_id, reason)));
        }

        debug!(job_id = %self.job_id, delivered = self.delivered, "Element stream finished");
        None
    }
}

impl Iterator for ElementStream {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if self.finished {
                return None;
            }
            if self.receivers.is_empty() {
                return self.finish();
            }

            match self.select() {
                Selected::Item(item) => {
                    self.delivered += 1;
                    return Some(item);
                }
                Selected::Closed(index) => {
                    self.receivers.swap_remove(index);
                }
                Selected::Stalled => {
                    if self.dispatcher.worker_count() == 0 {
                        warn!(job_id = %self.job_id, "Element stream stalled with no live workers");
                        self.finished = true;
                        return Some(Err(SplitError::job_failed(
                            &self.job_id,
                            format!("no element for {:?} and no live worker", self.stall_deadline),
                        )));
                    }
                }
            }
        }
    }
}

impl Drop for ElementStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.dispatcher.cancel_job(&self.job_id) {
            debug!(job_id = %self.job_id, error = %e, "Failed to cancel job on stream drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::{SourceId, SplitRequest};
    use crate::pipeline::{PipelineNode, ProcessingMode};
    use crossbeam::channel::bounded;

    fn job(dispatcher: &Dispatcher) -> String {
        dispatcher
            .register_pipeline(&PipelineNode::range(0, 4), ProcessingMode::ParallelEpochs)
            .unwrap()
    }

    #[test]
    fn test_merges_all_channels() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let job_id = job(&dispatcher);
        let (tx_a, rx_a) = bounded(4);
        let (tx_b, rx_b) = bounded(4);
        for i in 0..3 {
            tx_a.send(Ok(Element::Int(i))).unwrap();
            tx_b.send(Ok(Element::Int(10 + i))).unwrap();
        }
        drop((tx_a, tx_b));

        let stream = ElementStream::new(job_id, dispatcher, vec![rx_a, rx_b], Duration::from_secs(5));
        let mut items: Vec<i64> = stream.map(|r| r.unwrap().as_int().unwrap()).collect();
        items.sort();
        assert_eq!(items, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn test_single_channel_keeps_order() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let job_id = job(&dispatcher);
        let (tx, rx) = bounded(8);
        for i in [3, 1, 2] {
            tx.send(Ok(Element::Int(i))).unwrap();
        }
        drop(tx);

        let stream = ElementStream::new(job_id, dispatcher, vec![rx], Duration::from_secs(5));
        let items: Vec<i64> = stream.map(|r| r.unwrap().as_int().unwrap()).collect();
        assert_eq!(items, vec![3, 1, 2]);
    }

    #[test]
    fn test_failed_job_surfaces_at_end() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let job_id = job(&dispatcher);
        dispatcher.fail_job(&job_id, "provider blew up").unwrap();

        let (tx, rx) = bounded::<Result<Element>>(1);
        drop(tx);
        let mut stream = ElementStream::new(job_id, dispatcher, vec![rx], Duration::from_secs(5));
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, SplitError::JobFailed { .. }));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_undelivered_splits_fail_with_live_workers() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        dispatcher.register_worker(Some("a".to_string()), "localhost");
        dispatcher.register_worker(Some("b".to_string()), "localhost");
        let job_id = dispatcher
            .register_pipeline(&PipelineNode::range(0, 2), ProcessingMode::DistributedEpoch)
            .unwrap();
        let request = SplitRequest::new(SourceId(0), Vec::new());
        dispatcher.get_next_split(&job_id, "a", &request).unwrap();
        assert_eq!(dispatcher.release_on_disconnect("a"), 1);
        assert_eq!(dispatcher.worker_count(), 1);

        let (tx, rx) = bounded::<Result<Element>>(1);
        tx.send(Ok(Element::Int(1))).unwrap();
        drop(tx);
        let mut stream = ElementStream::new(job_id.clone(), dispatcher.clone(), vec![rx], Duration::from_secs(5));
        assert_eq!(stream.next().unwrap().unwrap(), Element::Int(1));
        assert!(matches!(
            stream.next(),
            Some(Err(SplitError::JobFailed { .. }))
        ));
        assert!(stream.next().is_none());
        assert!(matches!(
            dispatcher.job_status(&job_id).unwrap(),
            JobStatus::Failed { .. }
        ));
    }

    #[test]
    fn test_stall_without_workers_fails() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let job_id = job(&dispatcher);
        let (_tx, rx) = bounded::<Result<Element>>(1);

        let mut stream = ElementStream::new(job_id, dispatcher, vec![rx], Duration::from_millis(10));
        assert!(matches!(
            stream.next(),
            Some(Err(SplitError::JobFailed { .. }))
        ));
    }

    #[test]
    fn test_drop_cancels_unfinished_job() {
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let job_id = job(&dispatcher);
        let (_tx, rx) = bounded::<Result<Element>>(1);

        let stream = ElementStream::new(job_id.clone(), dispatcher.clone(), vec![rx], Duration::from_secs(5));
        drop(stream);
        assert_eq!(dispatcher.job_status(&job_id).unwrap(), JobStatus::Cancelled);
    }
}
