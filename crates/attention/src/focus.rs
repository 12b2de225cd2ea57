//! Per-lane soft focus over an encoded sequence.
//!
//! A [`FocusFunction`] is bound to one lane's encoded vectors `(len, enc)` and
//! to the shared attentor. Given a `(1, q)` query it scores every encoded
//! position, normalises the energies with [`normalize_sequence`] and reduces
//! the encoded vectors to a `(1, enc)` context row. Positions are scored in
//! chunks of `score_batch_size`; chunking never changes the result.

use std::sync::Arc;

use candle_core::Tensor;

use crate::combiner::Combiner;
use crate::core::{AttentionError, Config, Resource, Result};
use crate::softmax::normalize_sequence;

/// Result of one focus evaluation.
#[derive(Debug, Clone)]
pub struct Focus {
    /// Weighted sum of encoded vectors, `(1, enc)`.
    pub context: Tensor,
    /// Attention distribution over encoded positions, `(len, 1)`.
    pub weights: Tensor,
}

#[derive(Debug, Clone)]
pub struct FocusFunction {
    lane: usize,
    attentor: Arc<Combiner>,
    encoded: Option<Tensor>,
    score_batch_size: usize,
}

impl FocusFunction {
    /// Creates an unbound focus function for `lane`.
    ///
    /// The attentor must produce exactly one energy per `(query, encoded)` pair.
    pub fn new(lane: usize, attentor: Arc<Combiner>, config: &Config) -> Result<Self> {
        config.validate()?;
        if attentor.config().out != 1 {
            return Err(AttentionError::InvalidConfig(format!(
                "attentor must emit one energy per position, got width {}",
                attentor.config().out
            )));
        }
        Ok(Self {
            lane,
            attentor,
            encoded: None,
            score_batch_size: config.score_batch_size,
        })
    }

    /// Creates a focus function already bound to `encoded`.
    pub fn bound(
        lane: usize,
        attentor: Arc<Combiner>,
        encoded: Tensor,
        config: &Config,
    ) -> Result<Self> {
        let mut focus = Self::new(lane, attentor, config)?;
        focus.bind(encoded)?;
        Ok(focus)
    }

    /// Binds the lane's `(len, enc)` encoded vectors.
    pub fn bind(&mut self, encoded: Tensor) -> Result<()> {
        let (len, width) = encoded.dims2()?;
        if len == 0 {
            return Err(AttentionError::EmptyLane {
                lane: self.lane,
                context: "FocusFunction::bind".into(),
            });
        }
        if width != self.attentor.config().in2 {
            return Err(AttentionError::shape(format!(
                "lane {} encoded width {width} does not match attentor input {}",
                self.lane,
                self.attentor.config().in2
            )));
        }
        self.encoded = Some(encoded);
        Ok(())
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn is_bound(&self) -> bool {
        self.encoded.is_some()
    }

    pub fn encoded(&self) -> Option<&Tensor> {
        self.encoded.as_ref()
    }

    /// Unnormalised scores, `(len, 1)`.
    pub fn energies(&self, query: &Tensor) -> Result<Tensor> {
        let encoded = self.bound_encoded()?;
        let query_size = self.attentor.config().in1;
        match query.dims() {
            [1, q] if *q == query_size => {}
            dims => {
                return Err(AttentionError::shape(format!(
                    "lane {} query must be (1, {query_size}), got {dims:?}",
                    self.lane
                )))
            }
        }

        let len = encoded.dim(0)?;
        let mut chunks = Vec::with_capacity(len.div_ceil(self.score_batch_size));
        let mut start = 0;
        while start < len {
            let size = self.score_batch_size.min(len - start);
            let queries = query.broadcast_as((size, query_size))?.contiguous()?;
            let positions = encoded.narrow(0, start, size)?;
            chunks.push(self.attentor.combine(&queries, &positions)?);
            start += size;
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }

    /// Attention distribution and context vector for `query`.
    pub fn focus(&self, query: &Tensor) -> Result<Focus> {
        let energies = self.energies(query)?;
        let encoded = self.bound_encoded()?;
        let weights = normalize_sequence(&energies)?;
        let context = weights.broadcast_mul(encoded)?.sum_keepdim(0)?;
        Ok(Focus { context, weights })
    }

    fn bound_encoded(&self) -> Result<&Tensor> {
        self.encoded
            .as_ref()
            .ok_or(AttentionError::UnboundResource { lane: self.lane })
    }
}

impl Resource for FocusFunction {
    fn query_size(&self) -> usize {
        self.attentor.config().in1
    }

    fn context_size(&self) -> usize {
        self.attentor.config().in2
    }

    fn apply(&self, query: &Tensor) -> Result<Tensor> {
        Ok(self.focus(query)?.context)
    }
}
