use anyhow::Result;
use batchport_core::{BackendError, Shape};
use batchport_host::{BatchJob, InferenceRequest, InferenceResponse, InputTensor, Scheduler};
use tokio::sync::{mpsc, oneshot};

fn job(model: &str, n: i32) -> (BatchJob, Vec<oneshot::Receiver<InferenceResponse>>) {
    let mut requests = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..n {
        let input = InputTensor::from_i32("IN0", Shape::from_slice(&[1]), &[i]);
        let (request, rx) = InferenceRequest::new(format!("r{i}"), model, vec![input]);
        requests.push(request);
        receivers.push(rx);
    }
    let job = BatchJob {
        model: model.to_string(),
        requests,
        created_at: std::time::Instant::now(),
    };
    (job, receivers)
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_with_no_live_worker_is_cancelled() -> Result<()> {
    let (worker_a, inbox_a) = mpsc::channel(4);
    let (worker_b, inbox_b) = mpsc::channel(4);
    drop(inbox_a);
    drop(inbox_b);

    let (tx, rx) = mpsc::channel(4);
    let scheduler = Scheduler::new(rx, vec![worker_a, worker_b]);
    let (batch, receivers) = job("m", 3);
    Scheduler::handle(tx.clone()).submit(batch).await?;
    drop(tx);
    scheduler.run().await?;

    for rx in receivers {
        let response = rx.await?;
        assert!(response.outputs.is_empty());
        assert!(matches!(
            response.error,
            Some(BackendError::Cancelled(ref msg)) if msg.contains("'m'")
        ));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_inbox_is_skipped_for_the_next_worker() -> Result<()> {
    let (worker_a, inbox_a) = mpsc::channel(4);
    let (worker_b, mut inbox_b) = mpsc::channel(4);
    drop(inbox_a);

    let (tx, rx) = mpsc::channel(4);
    let scheduler = Scheduler::new(rx, vec![worker_a, worker_b]);
    let (batch, _receivers) = job("m", 2);
    Scheduler::handle(tx.clone()).submit(batch).await?;
    drop(tx);
    scheduler.run().await?;

    let delivered = inbox_b.recv().await.expect("batch reached the live worker");
    assert_eq!(delivered.requests.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_to_a_stopped_scheduler_rejects_the_batch() -> Result<()> {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let (batch, receivers) = job("m", 2);
    assert!(Scheduler::handle(tx).submit(batch).await.is_err());
    for rx in receivers {
        let response = rx.await?;
        assert!(matches!(response.error, Some(BackendError::Cancelled(_))));
    }
    Ok(())
}
