//! Streaming single-lane generation on a worker thread.
//!
//! [`SoftAlign::generate`] encodes one input sequence and starts a worker that
//! steps the interfacer block forever with a zero input, handing each visible
//! output over a rendezvous channel. The worker blocks until the consumer
//! takes the value, so at most one output is ever pending. Cancelling (or
//! dropping) the [`Generator`] raises a flag, drops the receiving end to wake
//! a blocked hand-off, and joins the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use attention::{FocusFunction, InterfacerBlock, SeqBatch};
use candle_core::Tensor;

use crate::align::SoftAlign;
use crate::config::QuerySeed;
use crate::error::{ModelError, Result};

/// How long a blocked hand-off sleeps between delivery attempts unless
/// woken by a cancellation.
const HANDOFF_POLL: Duration = Duration::from_millis(1);

/// Cloneable handle that stops a [`Generator`] from any thread.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    worker: Thread,
}

impl CancelToken {
    /// Raises the flag and wakes the worker. The worker produces nothing
    /// after observing it; the owner still joins it on drop.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.worker.unpark();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Handle over a running generation worker.
pub struct Generator {
    receiver: Option<Receiver<Result<Tensor>>>,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl SoftAlign {
    /// Starts generating outputs for the single lane in `input`.
    ///
    /// Each item is a `(output_size,)` vector. The stream never ends on its
    /// own; call [`Generator::cancel`] or drop the handle to stop it.
    pub fn generate(&self, input: &SeqBatch) -> Result<Generator> {
        input.ensure_non_empty("SoftAlign::generate")?;
        if input.num_lanes() != 1 {
            return Err(attention::AttentionError::LaneCountMismatch {
                expected: 1,
                actual: input.num_lanes(),
            }
            .into());
        }
        let encoder = self.encoder().ok_or(ModelError::MissingEncoder)?;
        let encoded = encoder.encode(input)?.detach();
        let block = self.block(&encoded)?;
        let zero = Tensor::zeros((1, block.input_size()), encoded.dtype(), encoded.device())?;
        let skip_first = self.config().query_seed == QuerySeed::Primed;
        Generator::spawn(block, zero, skip_first)
    }
}

impl Generator {
    fn spawn(
        block: InterfacerBlock<FocusFunction>,
        zero: Tensor,
        skip_first: bool,
    ) -> Result<Self> {
        let (sender, receiver) = sync_channel(0);
        let flag = Arc::new(AtomicBool::new(false));
        let worker_flag = flag.clone();
        let handle = thread::Builder::new()
            .name("softalign-generate".to_string())
            .spawn(move || worker(block, zero, skip_first, worker_flag, sender))?;
        log::info!("generator started skip_first={skip_first}");
        let token = CancelToken {
            flag,
            worker: handle.thread().clone(),
        };
        Ok(Self {
            receiver: Some(receiver),
            token,
            handle: Some(handle),
        })
    }

    /// Token for cancelling this generator from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Blocks for the next output. Returns `None` once cancelled or after
    /// the worker stopped.
    pub fn next_output(&mut self) -> Option<Result<Tensor>> {
        if self.is_cancelled() {
            return None;
        }
        self.receiver.as_ref()?.recv().ok()
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("generator worker panicked");
            } else {
                log::debug!("generator joined");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Iterator for Generator {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_output()
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn worker(
    block: InterfacerBlock<FocusFunction>,
    zero: Tensor,
    skip_first: bool,
    cancel: Arc<AtomicBool>,
    sender: SyncSender<Result<Tensor>>,
) {
    let mut state = block.start_state();
    let mut skip = skip_first;
    let mut produced = 0usize;
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let output = match block.step(&state, &zero) {
            Ok(step) => {
                state = step.state;
                if skip {
                    skip = false;
                    continue;
                }
                step.output.squeeze(0).map_err(ModelError::from)
            }
            Err(err) => Err(err.into()),
        };
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let failed = output.is_err();
        if let Err(err) = &output {
            log::warn!("generator step {produced} failed: {err}");
        }
        if !hand_off(&sender, &cancel, output) || failed {
            break;
        }
        produced += 1;
    }
    log::debug!("generator worker exiting after {produced} outputs");
}

/// Offers `value` until a consumer takes it. Returns `false` when the
/// receiver is gone or cancellation was observed first.
fn hand_off(
    sender: &SyncSender<Result<Tensor>>,
    cancel: &AtomicBool,
    mut value: Result<Tensor>,
) -> bool {
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        match sender.try_send(value) {
            Ok(()) => return true,
            Err(TrySendError::Full(pending)) => {
                value = pending;
                thread::park_timeout(HANDOFF_POLL);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}
