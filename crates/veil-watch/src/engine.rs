use crate::job::{JobReport, PipelineJob};
use crate::pipeline::Pipeline;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veil_core::Detect;

/// Jobs queued ahead of the one being processed.
const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Messages sent from the watcher to the engine thread.
enum EngineRequest {
    Process {
        job: PipelineJob,
        reply: oneshot::Sender<JobReport>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run one job to its outcome. Jobs are processed one at a time in
    /// submission order.
    pub async fn process(&self, job: PipelineJob) -> Result<JobReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                job,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the pipeline on a dedicated OS thread.
///
/// The pipeline (and the detector's ONNX session inside it) lives on that
/// thread for its whole life. The thread exits once every handle is dropped.
pub fn spawn_engine<D>(pipeline: Pipeline<D>) -> Result<EngineHandle, EngineError>
where
    D: Detect + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
    let mut pipeline = pipeline;

    std::thread::Builder::new()
        .name("veil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Process { mut job, reply } => {
                        let report = run_job(&mut pipeline, &mut job);
                        let _ = reply.send(report);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Process a job, turning a panic anywhere in the pipeline into a failure
/// placement so the thread keeps serving.
fn run_job<D: Detect>(pipeline: &mut Pipeline<D>, job: &mut PipelineJob) -> JobReport {
    let started = Instant::now();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(job))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            pipeline.recover_from_panic(job, message)
        }
    };

    JobReport {
        id: job.id,
        file_name: job.file_name.clone(),
        outcome,
        elapsed: started.elapsed(),
    }
}
