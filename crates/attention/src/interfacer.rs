//! Recurrent adapter threading attention queries through a decoder.
//!
//! At every step the [`InterfacerBlock`] asks each lane's resource for a
//! context row using the lane's current query, mixes it with the step input,
//! runs the wrapped [`Decoder`], and splits the raw decoder output into a
//! `query_size` prefix (the next query) and the visible suffix.
//!
//! [`InterfacerBlock::run`] evaluates a whole batch and records one
//! [`StepRecord`] per timestep. Each record holds the step's query, state and
//! input as fresh leaf variables, so [`BlockRun::backward`] can differentiate
//! the steps one at a time in reverse order, seeding every step with the
//! gradients flowing back from its successor.

use std::sync::Arc;

use candle_core::{backprop::GradStore, Tensor, Var};

use crate::combiner::Combiner;
use crate::core::{
    AttentionError, Decoder, DecoderStep, Gradients, Resource, Result, SeqBatch,
};

/// How the context row and the step input are fused into the decoder input.
#[derive(Debug, Clone)]
pub enum InputMixing {
    /// `[context ‖ input]`.
    Concat,
    /// `combiner(context, input)`.
    Combine(Arc<Combiner>),
}

impl InputMixing {
    /// Step-input width implied by a decoder input width and context width.
    fn input_size(&self, decoder_input: usize, context_size: usize) -> Result<usize> {
        match self {
            InputMixing::Concat => decoder_input.checked_sub(context_size).ok_or_else(|| {
                AttentionError::InvalidConfig(format!(
                    "decoder input width {decoder_input} is smaller than context width {context_size}"
                ))
            }),
            InputMixing::Combine(combiner) => {
                let config = combiner.config();
                if config.in1 != context_size || config.out != decoder_input {
                    return Err(AttentionError::InvalidConfig(format!(
                        "input combiner {config:?} does not map context width {context_size} to decoder width {decoder_input}"
                    )));
                }
                Ok(config.in2)
            }
        }
    }

    fn mix(&self, context: &Tensor, input: &Tensor) -> Result<Tensor> {
        match self {
            InputMixing::Concat => Ok(Tensor::cat(&[context, input], 1)?),
            InputMixing::Combine(combiner) => combiner.combine(context, input),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InputMixing::Concat => "concat",
            InputMixing::Combine(_) => "combine",
        }
    }

    pub fn combiner(&self) -> Option<&Arc<Combiner>> {
        match self {
            InputMixing::Concat => None,
            InputMixing::Combine(combiner) => Some(combiner),
        }
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.combiner()
            .map(|combiner| combiner.parameters())
            .unwrap_or_default()
    }
}

/// Source of the query used at the first step.
#[derive(Debug, Clone)]
pub enum StartQuery {
    /// A learned `(query_size,)` vector shared by every lane.
    Learned(Var),
    /// All zeros; the first output is expected to be discarded.
    Zeros,
}

/// Bookkeeping once resources are bound.
#[derive(Debug, Clone)]
pub struct RunningState {
    /// Resource index for each row.
    pub lanes: Vec<usize>,
    /// Decoder states, `(rows, state_size)`.
    pub inner: Tensor,
    /// Current queries, `(rows, query_size)`.
    pub query: Tensor,
}

impl RunningState {
    /// Keeps only the rows of `lanes`, which must be running and listed in
    /// their current order. Finished lanes never come back.
    pub fn retain(&self, lanes: &[usize]) -> Result<RunningState> {
        let mut keep = Vec::with_capacity(lanes.len());
        let mut from = 0;
        for lane in lanes {
            let row = self.lanes[from..]
                .iter()
                .position(|running| running == lane)
                .map(|offset| from + offset)
                .ok_or_else(|| {
                    AttentionError::shape(format!(
                        "lane {lane} is not running (running lanes {:?})",
                        self.lanes
                    ))
                })?;
            keep.push(row as u32);
            from = row + 1;
        }
        Ok(RunningState {
            lanes: lanes.to_vec(),
            inner: select_rows(&self.inner, &keep)?,
            query: select_rows(&self.query, &keep)?,
        })
    }
}

#[derive(Debug, Clone)]
pub enum BlockState {
    /// No resource or query bound yet.
    Initial,
    Running(RunningState),
}

/// Result of [`InterfacerBlock::step`].
#[derive(Debug, Clone)]
pub struct BlockStep {
    pub state: BlockState,
    /// Visible outputs, `(rows, output_size)`.
    pub output: Tensor,
}

struct Advance {
    raw_output: Tensor,
    next_inner: Tensor,
    next_query: Tensor,
    visible: Tensor,
}

pub struct InterfacerBlock<R: Resource> {
    resources: Vec<R>,
    decoder: Arc<dyn Decoder>,
    mixing: InputMixing,
    start_query: StartQuery,
    query_size: usize,
    context_size: usize,
    input_size: usize,
    output_size: usize,
}

impl<R: Resource> InterfacerBlock<R> {
    /// Wraps `decoder` with one resource per lane.
    pub fn new(
        resources: Vec<R>,
        decoder: Arc<dyn Decoder>,
        mixing: InputMixing,
        start_query: StartQuery,
    ) -> Result<Self> {
        let first = resources.first().ok_or_else(|| AttentionError::EmptyBatch {
            context: "InterfacerBlock::new".into(),
        })?;
        let (query_size, context_size) = (first.query_size(), first.context_size());
        if let Some(lane) = resources
            .iter()
            .position(|r| r.query_size() != query_size || r.context_size() != context_size)
        {
            return Err(AttentionError::InvalidConfig(format!(
                "resource {lane} disagrees with resource 0 on query/context widths"
            )));
        }
        if decoder.output_size() <= query_size {
            return Err(AttentionError::InvalidConfig(format!(
                "decoder output width {} leaves nothing visible after a {query_size}-wide query",
                decoder.output_size()
            )));
        }
        if let StartQuery::Learned(var) = &start_query {
            if var.dims() != [query_size] {
                return Err(AttentionError::shape(format!(
                    "learned start query must be ({query_size},), got {:?}",
                    var.dims()
                )));
            }
        }
        let input_size = mixing.input_size(decoder.input_size(), context_size)?;
        let output_size = decoder.output_size() - query_size;
        Ok(Self {
            resources,
            decoder,
            mixing,
            start_query,
            query_size,
            context_size,
            input_size,
            output_size,
        })
    }

    pub fn resources(&self) -> &[R] {
        &self.resources
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.decoder
    }

    pub fn mixing(&self) -> &InputMixing {
        &self.mixing
    }

    pub fn start_query(&self) -> &StartQuery {
        &self.start_query
    }

    pub fn query_size(&self) -> usize {
        self.query_size
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Width of the per-step input.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Width of the visible per-step output.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn start_state(&self) -> BlockState {
        BlockState::Initial
    }

    /// Performs the `Initial -> Running` transition for a first step of
    /// `rows` lanes.
    pub fn bind(&self, state: &BlockState, rows: usize) -> Result<RunningState> {
        match state {
            BlockState::Running(running) => Ok(running.clone()),
            BlockState::Initial => {
                let (query, inner) = self.start_rows(rows)?;
                Ok(RunningState {
                    lanes: (0..rows).collect(),
                    inner: inner.detach(),
                    query: query.detach(),
                })
            }
        }
    }

    /// Forward-only single step over every bound lane.
    ///
    /// The returned state is detached from the autograd graph; use
    /// [`InterfacerBlock::run`] when gradients are needed.
    pub fn step(&self, state: &BlockState, input: &Tensor) -> Result<BlockStep> {
        let present = match state {
            BlockState::Running(running) => running.lanes.clone(),
            BlockState::Initial => (0..input.dims2()?.0).collect(),
        };
        self.step_lanes(state, &present, input)
    }

    /// Like [`InterfacerBlock::step`], for the subset `present` of the
    /// running lanes. Lanes left out are finished and dropped from the
    /// returned state.
    pub fn step_lanes(
        &self,
        state: &BlockState,
        present: &[usize],
        input: &Tensor,
    ) -> Result<BlockStep> {
        let rows = input.dims2()?.0;
        if present.len() != rows {
            return Err(AttentionError::shape(format!(
                "step input has {rows} rows for {} present lanes",
                present.len()
            )));
        }
        let running = match state {
            BlockState::Initial => self.bind(state, rows)?,
            BlockState::Running(running) => running.clone(),
        };
        let running = if running.lanes == present {
            running
        } else {
            running.retain(present)?
        };
        let advance = self.advance(&running.lanes, &running.query, &running.inner, input)?;
        Ok(BlockStep {
            state: BlockState::Running(RunningState {
                lanes: running.lanes,
                inner: advance.next_inner.detach(),
                query: advance.next_query.detach(),
            }),
            output: advance.visible.detach(),
        })
    }

    /// Runs every timestep of `inputs` and keeps what the backward pass needs.
    pub fn run(&self, inputs: &SeqBatch) -> Result<BlockRun> {
        inputs.ensure_non_empty("InterfacerBlock::run")?;
        if inputs.dim() != self.input_size {
            return Err(AttentionError::shape(format!(
                "block inputs must have width {}, got {}",
                self.input_size,
                inputs.dim()
            )));
        }

        let lanes_total = inputs.num_lanes();
        let (start_query, start_inner) = self.start_rows(lanes_total)?;
        let mut query = start_query.detach();
        let mut inner = start_inner.detach();
        let mut lanes: Vec<usize> = (0..lanes_total).collect();
        let mut records = Vec::with_capacity(inputs.max_len());
        let mut outputs: Vec<Vec<Tensor>> = vec![Vec::new(); lanes_total];

        for step in 0..inputs.max_len() {
            let (present, input) = inputs.timestep(step)?;
            if present.len() < lanes.len() {
                let keep = present
                    .iter()
                    .map(|lane| lanes.iter().position(|l| l == lane).map(|row| row as u32))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        AttentionError::shape(format!("lane reappeared at timestep {step}"))
                    })?;
                query = select_rows(&query, &keep)?;
                inner = select_rows(&inner, &keep)?;
                lanes = present;
            }

            let query_var = Var::from_tensor(&query)?;
            let inner_var = Var::from_tensor(&inner)?;
            let input_var = Var::from_tensor(&input.detach())?;
            let advance = self
                .advance(
                    &lanes,
                    query_var.as_tensor(),
                    inner_var.as_tensor(),
                    input_var.as_tensor(),
                )
                .map_err(|err| err.at_step(step))?;

            for (row, lane) in lanes.iter().enumerate() {
                outputs[*lane].push(advance.visible.narrow(0, row, 1)?.detach());
            }
            query = advance.next_query.detach();
            inner = advance.next_inner.detach();
            records.push(StepRecord {
                lanes: lanes.clone(),
                query: query_var,
                inner: inner_var,
                input: input_var,
                raw_output: advance.raw_output,
                next_inner: advance.next_inner,
            });
        }

        let outputs =
            SeqBatch::from_lane_rows(self.output_size, outputs, inputs.dtype(), inputs.device())?;
        log::debug!(
            "interfacer run lanes={} steps={} query_size={}",
            lanes_total,
            records.len(),
            self.query_size
        );
        Ok(BlockRun {
            start: StartRecord {
                query: start_query,
                inner: start_inner,
            },
            records,
            outputs,
            query_size: self.query_size,
            state_size: self.decoder.state_size(),
            input_size: self.input_size,
        })
    }

    /// Start query and start state broadcast to `rows` lanes, still attached
    /// to their parameters.
    fn start_rows(&self, rows: usize) -> Result<(Tensor, Tensor)> {
        if rows != self.resources.len() {
            return Err(AttentionError::LaneCountMismatch {
                expected: self.resources.len(),
                actual: rows,
            });
        }
        let start = self.decoder.start_state()?;
        let state_size = self.decoder.state_size();
        if start.dims() != [state_size] {
            return Err(AttentionError::shape(format!(
                "decoder start state must be ({state_size},), got {:?}",
                start.dims()
            )));
        }
        let inner = start
            .unsqueeze(0)?
            .broadcast_as((rows, state_size))?
            .contiguous()?;
        let query = match &self.start_query {
            StartQuery::Learned(var) => var
                .as_tensor()
                .to_dtype(start.dtype())?
                .unsqueeze(0)?
                .broadcast_as((rows, self.query_size))?
                .contiguous()?,
            StartQuery::Zeros => {
                Tensor::zeros((rows, self.query_size), start.dtype(), start.device())?
            }
        };
        Ok((query, inner))
    }

    fn advance(
        &self,
        lanes: &[usize],
        query: &Tensor,
        inner: &Tensor,
        input: &Tensor,
    ) -> Result<Advance> {
        let mut contexts = Vec::with_capacity(lanes.len());
        for (row, lane) in lanes.iter().enumerate() {
            let resource = self
                .resources
                .get(*lane)
                .ok_or(AttentionError::UnboundResource { lane: *lane })?;
            contexts.push(resource.apply(&query.narrow(0, row, 1)?)?);
        }
        let context = Tensor::cat(&contexts, 0)?;
        let mixed = self.mixing.mix(&context, input)?;
        let DecoderStep { state, output } = self.decoder.step(inner, &mixed)?;

        let expected = [lanes.len(), self.query_size + self.output_size];
        if output.dims() != expected {
            return Err(AttentionError::shape(format!(
                "decoder output must be {expected:?}, got {:?}",
                output.dims()
            )));
        }
        let next_query = output.narrow(1, 0, self.query_size)?;
        let visible = output.narrow(1, self.query_size, self.output_size)?;
        Ok(Advance {
            raw_output: output,
            next_inner: state,
            next_query,
            visible,
        })
    }
}

/// Everything one forward timestep leaves behind for the backward pass.
#[derive(Debug)]
pub struct StepRecord {
    /// Resource index per row at this step.
    pub lanes: Vec<usize>,
    /// Pooled query variable, `(rows, query_size)`.
    pub query: Var,
    /// Pooled decoder state variable, `(rows, state_size)`.
    pub inner: Var,
    /// Pooled step input variable, `(rows, input_size)`.
    pub input: Var,
    /// Raw decoder output computed from the pooled variables.
    pub raw_output: Tensor,
    /// Next decoder state computed from the pooled variables.
    pub next_inner: Tensor,
}

#[derive(Debug)]
struct StartRecord {
    query: Tensor,
    inner: Tensor,
}

/// Gradients returned by [`BlockRun::backward`].
#[derive(Debug)]
pub struct BlockGrads {
    /// Gradients of the step inputs, same layout as the run's inputs.
    pub inputs: SeqBatch,
    /// Gradient reaching the start query, summed over lanes, `(query_size,)`.
    pub start_query: Tensor,
    /// Gradient reaching the decoder start state, summed over lanes,
    /// `(state_size,)`.
    pub start_state: Tensor,
}

/// Forward results of [`InterfacerBlock::run`].
#[derive(Debug)]
pub struct BlockRun {
    start: StartRecord,
    records: Vec<StepRecord>,
    outputs: SeqBatch,
    query_size: usize,
    state_size: usize,
    input_size: usize,
}

impl BlockRun {
    /// Visible outputs, one `(len_i, output_size)` lane per input lane.
    pub fn outputs(&self) -> &SeqBatch {
        &self.outputs
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn num_steps(&self) -> usize {
        self.records.len()
    }

    /// Propagates `upstream` (gradients of the visible outputs) back through
    /// every step in reverse order.
    ///
    /// Parameter gradients are summed into `grads` for every variable it
    /// watches. The pooled per-step variables never reach `grads`.
    pub fn backward(self, upstream: &SeqBatch, grads: &mut Gradients) -> Result<BlockGrads> {
        if upstream.lengths() != self.outputs.lengths() || upstream.dim() != self.outputs.dim() {
            return Err(AttentionError::shape(format!(
                "upstream lanes {:?}x{} do not match outputs {:?}x{}",
                upstream.lengths(),
                upstream.dim(),
                self.outputs.lengths(),
                self.outputs.dim()
            )));
        }

        let lanes_total = self.outputs.num_lanes();
        let dtype = self.start.inner.dtype();
        let device = self.start.inner.device().clone();
        let zeros = |width: usize| Tensor::zeros((1, width), dtype, &device);

        let mut query_up: Vec<Option<Tensor>> = vec![None; lanes_total];
        let mut inner_up: Vec<Option<Tensor>> = vec![None; lanes_total];
        let mut input_grads: Vec<Vec<Tensor>> = vec![Vec::new(); lanes_total];
        let steps = self.records.len();

        for (step, record) in self.records.into_iter().enumerate().rev() {
            let mut raw_up = Vec::with_capacity(record.lanes.len());
            let mut state_up = Vec::with_capacity(record.lanes.len());
            for lane in &record.lanes {
                let from_future = match query_up[*lane].take() {
                    Some(grad) => grad,
                    None => zeros(self.query_size)?,
                };
                let visible = upstream.lanes()[*lane]
                    .narrow(0, step, 1)?
                    .detach()
                    .to_dtype(dtype)?;
                raw_up.push(Tensor::cat(&[&from_future, &visible], 1)?);
                state_up.push(match inner_up[*lane].take() {
                    Some(grad) => grad,
                    None => zeros(self.state_size)?,
                });
            }
            let raw_up = Tensor::cat(&raw_up, 0)?;
            let state_up = Tensor::cat(&state_up, 0)?;

            let surrogate = record
                .raw_output
                .mul(&raw_up)?
                .sum_all()?
                .add(&record.next_inner.mul(&state_up)?.sum_all()?)?;
            let mut store = surrogate.backward()?;
            let query_grad = take_grad(&mut store, &record.query)?;
            let inner_grad = take_grad(&mut store, &record.inner)?;
            let input_grad = take_grad(&mut store, &record.input)?;
            grads
                .absorb(&mut store)
                .map_err(|err| err.at_step(step))?;

            for (row, lane) in record.lanes.iter().enumerate() {
                query_up[*lane] = Some(query_grad.narrow(0, row, 1)?);
                inner_up[*lane] = Some(inner_grad.narrow(0, row, 1)?);
                input_grads[*lane].push(input_grad.narrow(0, row, 1)?);
            }
        }

        let query_rows = query_up
            .into_iter()
            .map(|grad| grad.map_or_else(|| zeros(self.query_size), Ok))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let inner_rows = inner_up
            .into_iter()
            .map(|grad| grad.map_or_else(|| zeros(self.state_size), Ok))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let query_rows = Tensor::cat(&query_rows, 0)?;
        let inner_rows = Tensor::cat(&inner_rows, 0)?;

        let surrogate = self
            .start
            .query
            .mul(&query_rows)?
            .sum_all()?
            .add(&self.start.inner.mul(&inner_rows)?.sum_all()?)?;
        let mut store = surrogate.backward()?;
        grads.absorb(&mut store)?;

        for lane in input_grads.iter_mut() {
            lane.reverse();
        }
        let inputs = SeqBatch::from_lane_rows(self.input_size, input_grads, dtype, &device)?;
        log::debug!("interfacer backward lanes={lanes_total} steps={steps}");

        Ok(BlockGrads {
            inputs,
            start_query: query_rows.sum(0)?,
            start_state: inner_rows.sum(0)?,
        })
    }
}

/// Removes a pooled variable's gradient from `store`, defaulting to zeros
/// when the step did not depend on it.
fn take_grad(store: &mut GradStore, var: &Var) -> Result<Tensor> {
    match store.remove(var.as_tensor()) {
        Some(grad) => Ok(grad.detach()),
        None => Ok(var.as_tensor().zeros_like()?),
    }
}

/// Gathers `rows` of a `(rows, width)` tensor. Decoder outputs are column
/// slices, so the source is made contiguous first.
fn select_rows(tensor: &Tensor, rows: &[u32]) -> Result<Tensor> {
    let index = Tensor::new(rows, tensor.device())?;
    Ok(tensor.contiguous()?.index_select(&index, 0)?)
}
