use std::collections::VecDeque;
use std::time::Instant;

use cf_dataset::{DatasetStore, StoreError};
use cf_frame::Row;
use cf_runtime::{DecisionAction, DecisionRecord, PropagationLedger, UpdateId};

use crate::log::{debug, warn};
use crate::{CalcError, Calculator, Message, UpdateOutcome, UpdateRequest};

#[derive(Debug)]
struct Envelope {
    message: Message,
    attempts: u32,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    envelope: Envelope,
}

/// Single-threaded driver for a [`Calculator`].
///
/// Messages run in arrival order. A deferred message is parked until its
/// retry delay has passed; follow-ups produced by a message run after every
/// message that was already queued.
#[derive(Debug)]
pub struct UpdateQueue<S> {
    calculator: Calculator<S>,
    ready: VecDeque<Envelope>,
    delayed: Vec<Delayed>,
    ledger: PropagationLedger,
}

impl<S: DatasetStore> UpdateQueue<S> {
    pub fn new(calculator: Calculator<S>) -> Self {
        Self {
            calculator,
            ready: VecDeque::new(),
            delayed: Vec::new(),
            ledger: PropagationLedger::new(),
        }
    }

    #[must_use]
    pub fn calculator(&self) -> &Calculator<S> {
        &self.calculator
    }

    #[must_use]
    pub fn ledger(&self) -> &PropagationLedger {
        &self.ledger
    }

    /// Messages waiting, parked ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    /// Queue `message`, registering its id as pending on the target dataset.
    pub fn enqueue(&mut self, message: Message) -> Result<UpdateId, CalcError> {
        let update_id = message.update_id();
        self.calculator
            .store()
            .register_pending(message.dataset_id(), update_id)?;
        debug!(dataset = message.dataset_id(), %update_id, kind = message.kind(), "queued");
        self.ready.push_back(Envelope {
            message,
            attempts: 0,
        });
        Ok(update_id)
    }

    /// Queue new rows for `dataset_id`.
    pub fn submit_update(&mut self, dataset_id: &str, rows: Vec<Row>) -> Result<UpdateId, CalcError> {
        let update_id = self.calculator.next_update_id();
        self.enqueue(Message::Update(UpdateRequest::new(dataset_id, rows, update_id)))
    }

    /// Store a calculation and queue the work that fills it.
    pub fn add_calculation(
        &mut self,
        dataset_id: &str,
        name: &str,
        formula: &str,
        groups: Vec<String>,
        overwrite: bool,
    ) -> Result<UpdateId, CalcError> {
        let message = self
            .calculator
            .add_calculation(dataset_id, name, formula, groups, overwrite)?;
        self.enqueue(message)
    }

    /// Run every message that is ready now. Returns how many were handled.
    ///
    /// Failed messages are recorded in the ledger and dropped; only a
    /// poisoned store surfaces as an error.
    pub fn process_ready(&mut self) -> Result<usize, CalcError> {
        self.promote_due(Instant::now());
        let batch = std::mem::take(&mut self.ready);
        let handled = batch.len();
        for envelope in batch {
            self.handle(envelope)?;
        }
        Ok(handled)
    }

    /// Run until nothing is queued, sleeping while only parked messages
    /// remain. Does not return while a message keeps being deferred under a
    /// policy without a retry ceiling.
    pub fn run_until_idle(&mut self) -> Result<usize, CalcError> {
        let mut handled = 0;
        loop {
            handled += self.process_ready()?;
            if !self.ready.is_empty() {
                continue;
            }
            let Some(due) = self.delayed.iter().map(|delayed| delayed.due).min() else {
                break;
            };
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        Ok(handled)
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|delayed| delayed.due <= now);
        self.delayed = waiting;
        self.ready
            .extend(due.into_iter().map(|delayed| delayed.envelope));
    }

    fn handle(&mut self, envelope: Envelope) -> Result<(), CalcError> {
        let Envelope { message, attempts } = envelope;
        let dataset_id = message.dataset_id().to_owned();
        let update_id = message.update_id();
        let attempt = attempts + 1;

        match self.calculator.process(&message) {
            Ok(UpdateOutcome::Applied { follow_ups }) => {
                self.record(
                    update_id,
                    &dataset_id,
                    DecisionAction::Applied,
                    attempt,
                    format!("{} applied, {} follow-up(s)", message.kind(), follow_ups.len()),
                );
                for follow_up in follow_ups {
                    self.enqueue(follow_up)?;
                }
            }
            Ok(UpdateOutcome::Deferred { claim, retry_after }) => {
                if self.calculator.policy().retries_exhausted(attempt) {
                    warn!(dataset = %dataset_id, %update_id, attempt, "retries exhausted");
                    self.calculator.store().release(&dataset_id, update_id)?;
                    self.record(
                        update_id,
                        &dataset_id,
                        DecisionAction::Rejected,
                        attempt,
                        format!("retries exhausted, last claim {claim:?}"),
                    );
                } else {
                    self.record(
                        update_id,
                        &dataset_id,
                        DecisionAction::Deferred,
                        attempt,
                        format!("{claim:?}"),
                    );
                    self.delayed.push(Delayed {
                        due: Instant::now() + retry_after,
                        envelope: Envelope {
                            message,
                            attempts: attempt,
                        },
                    });
                }
            }
            Err(CalcError::Store(StoreError::Poisoned)) => {
                return Err(CalcError::Store(StoreError::Poisoned));
            }
            Err(err) => {
                warn!(dataset = %dataset_id, %update_id, error = %err, "update rejected");
                self.calculator.store().release(&dataset_id, update_id)?;
                self.record(
                    update_id,
                    &dataset_id,
                    DecisionAction::Rejected,
                    attempt,
                    err.to_string(),
                );
            }
        }
        Ok(())
    }

    fn record(
        &mut self,
        update_id: UpdateId,
        dataset_id: &str,
        action: DecisionAction,
        attempt: u32,
        detail: String,
    ) {
        self.ledger.push(DecisionRecord::new(
            update_id, dataset_id, action, attempt, detail,
        ));
    }
}
