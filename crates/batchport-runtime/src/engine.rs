//! Batch execution: open a response per request, collect inputs, compute,
//! write outputs, then send every response exactly once.
//!
//! Each request carries its own status. A request-scoped failure flips that
//! request to `Errored` and it simply drops out of the later stages; its
//! siblings never see it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use batchport_core::{BackendError, HostRequest, HostResponse, MemoryPlacement, Result};
use tracing::{debug, error, info_span, warn};

use crate::{ComputeItem, InputCollector, InstanceState, OutputResponder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchStage {
    Opened,
    Collecting,
    Computing,
    Responding,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Errored(BackendError),
    Completed,
}

impl RequestStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestStatus::Completed)
    }

    pub fn error(&self) -> Option<&BackendError> {
        match self {
            RequestStatus::Errored(err) => Some(err),
            _ => None,
        }
    }
}

/// Final status of every request, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    pub statuses: Vec<RequestStatus>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_completed()).count()
    }

    pub fn errored(&self) -> usize {
        self.statuses.iter().filter(|s| s.error().is_some()).count()
    }
}

/// Lets the host abandon a batch in flight. Checked between stages.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Slot {
    status: RequestStatus,
    response: Option<Box<dyn HostResponse>>,
}

/// The batch's responses. Any response still held when this is dropped is
/// sent as cancelled, so the host never waits on a response that will not
/// come.
struct ResponseSet {
    slots: Vec<Slot>,
}

impl ResponseSet {
    fn open(requests: &[&dyn HostRequest]) -> Self {
        let slots = requests
            .iter()
            .map(|request| match request.new_response() {
                Ok(response) => Slot {
                    status: RequestStatus::Pending,
                    response: Some(response),
                },
                Err(err) => {
                    warn!(request = request.id(), error = %err, "failed to open response");
                    Slot {
                        status: RequestStatus::Errored(err),
                        response: None,
                    }
                }
            })
            .collect();
        Self { slots }
    }

    fn opened(&self) -> usize {
        self.slots.iter().filter(|s| s.response.is_some()).count()
    }

    fn is_pending(&self, index: usize) -> bool {
        matches!(self.slots[index].status, RequestStatus::Pending)
    }

    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(|&i| self.is_pending(i))
    }

    fn pending_count(&self) -> usize {
        self.pending().count()
    }

    fn fail(&mut self, index: usize, err: BackendError) {
        let slot = &mut self.slots[index];
        if matches!(slot.status, RequestStatus::Pending) {
            debug!(request = index, code = err.code(), error = %err, "request failed");
            slot.status = RequestStatus::Errored(err);
        }
    }

    fn fail_pending(&mut self, err: &BackendError) {
        for slot in &mut self.slots {
            if matches!(slot.status, RequestStatus::Pending) {
                slot.status = RequestStatus::Errored(err.clone());
            }
        }
    }

    fn complete_pending(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot.status, RequestStatus::Pending) {
                slot.status = RequestStatus::Completed;
            }
        }
    }

    fn response_mut(&mut self, index: usize) -> Option<&mut (dyn HostResponse + 'static)> {
        self.slots[index].response.as_deref_mut()
    }

    fn close(&mut self, requests: &[&dyn HostRequest]) -> BatchReport {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for (slot, request) in self.slots.iter_mut().zip(requests) {
            let outcome = match &slot.status {
                RequestStatus::Completed => Ok(()),
                RequestStatus::Errored(err) => Err(err.clone()),
                RequestStatus::Pending => Err(BackendError::Internal(
                    "request left pending at close".to_string(),
                )),
            };
            if let Err(err) = &outcome {
                warn!(request = request.id(), code = err.code(), error = %err, "sending error response");
            }

            match slot.response.take() {
                Some(response) => response.send(outcome),
                // The response could not be opened earlier; one more attempt
                // to deliver the error.
                None => match request.new_response() {
                    Ok(response) => response.send(outcome),
                    Err(retry) => error!(
                        request = request.id(),
                        error = %retry,
                        "no response could be opened, request left unanswered"
                    ),
                },
            }
            if matches!(slot.status, RequestStatus::Pending) {
                slot.status = RequestStatus::Errored(BackendError::Internal(
                    "request left pending at close".to_string(),
                ));
            }
            statuses.push(slot.status.clone());
        }
        BatchReport { statuses }
    }
}

impl Drop for ResponseSet {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(response) = slot.response.take() {
                response.send(Err(BackendError::Cancelled(
                    "batch abandoned before its response was sent".to_string(),
                )));
            }
        }
    }
}

fn enter(stage: BatchStage, set: &ResponseSet) {
    debug!(?stage, pending = set.pending_count(), "batch stage");
}

fn check_cancelled(cancel: &CancelToken, set: &mut ResponseSet, stage: BatchStage) {
    if cancel.is_cancelled() && set.pending_count() > 0 {
        warn!(?stage, "batch cancelled by host");
        set.fail_pending(&BackendError::Cancelled(format!(
            "batch abandoned before {stage:?}"
        )));
    }
}

/// Runs one batch on `instance`.
///
/// Returns `Err(BatchFatal)` only when no response at all could be opened.
/// Otherwise every request gets exactly one response and the call succeeds,
/// whatever happened to individual requests.
pub fn execute(
    instance: &mut InstanceState,
    requests: &[&dyn HostRequest],
    cancel: &CancelToken,
) -> Result<BatchReport> {
    let span = info_span!("execute", instance = instance.name(), batch = requests.len());
    let _enter = span.enter();

    if requests.is_empty() {
        return Ok(BatchReport::default());
    }

    let model = Arc::clone(instance.model());
    let spec = model.spec();
    let memory = model.memory();
    let compute = model.compute();

    let mut set = ResponseSet::open(requests);
    enter(BatchStage::Opened, &set);
    if set.opened() == 0 {
        let reason = set.slots[0]
            .status
            .error()
            .map(ToString::to_string)
            .unwrap_or_default();
        error!(reason = %reason, "no response could be opened for the batch");
        return Err(BackendError::BatchFatal(reason));
    }

    check_cancelled(cancel, &mut set, BatchStage::Collecting);
    enter(BatchStage::Collecting, &set);
    let capabilities = compute.capabilities();
    let target = if capabilities.host_inputs {
        Some(MemoryPlacement::HOST)
    } else {
        Some(instance.preferred_placement())
    };
    let mut collector = InputCollector::new(memory, target, capabilities.contiguous_inputs);
    let mut items: Vec<ComputeItem<'_>> = set
        .pending()
        .map(|index| ComputeItem::new(index, requests[index].id()))
        .collect();
    for input in &spec.inputs {
        for item in items.iter_mut() {
            if !set.is_pending(item.index()) {
                continue;
            }
            match collector.collect(requests[item.index()], &input.name) {
                Ok(collected) => item.push_input(collected),
                Err(err) => set.fail(item.index(), err),
            }
        }
    }
    if let Err(err) = collector.finalize() {
        error!(error = %err, "input synchronization failed");
        set.fail_pending(&err);
    }
    items.retain(|item| set.is_pending(item.index()));

    check_cancelled(cancel, &mut set, BatchStage::Computing);
    enter(BatchStage::Computing, &set);
    items.retain(|item| set.is_pending(item.index()));
    if !items.is_empty() {
        if let Err(err) = compute.execute(spec, &mut items) {
            error!(compute = compute.name(), error = %err, "batch compute failed");
            set.fail_pending(&err);
        }
    }
    for item in items.iter_mut() {
        if let Some(err) = item.take_error() {
            set.fail(item.index(), err);
        }
    }

    check_cancelled(cancel, &mut set, BatchStage::Responding);
    enter(BatchStage::Responding, &set);
    let mut responder = OutputResponder::new(
        memory,
        instance.preferred_placement(),
        spec.require_non_empty_output,
    );
    for mut item in items {
        let index = item.index();
        if !set.is_pending(index) {
            continue;
        }
        for output in item.take_outputs() {
            let written = match set.response_mut(index) {
                Some(response) => responder.write(response, output),
                None => Err(BackendError::Internal("response missing".to_string())),
            };
            if let Err(err) = written {
                set.fail(index, err);
                break;
            }
        }
    }
    if let Err(err) = responder.finalize() {
        error!(error = %err, "output synchronization failed");
        set.fail_pending(&err);
    }
    set.complete_pending();

    enter(BatchStage::Closed, &set);
    let report = set.close(requests);
    debug!(
        completed = report.completed(),
        errored = report.errored(),
        "batch closed"
    );
    Ok(report)
}
