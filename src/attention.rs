//! Tiled attention over the engine
//!
//! Computes `softmax(Q Kᵗ) V` one query tile at a time using only the public
//! [`Engine`] and [`MemoryAllocator`] API. Keys and values are concatenated
//! once in GPU HBM; every query tile is then processed on-chip, with the
//! softmax built row by row so that each row's normalization is a
//! self-contained sequence of on-chip operations.
//!
//! ```text
//! keys[0..n]  ──Concat(HBM)──► K_all ─┐
//! values[0..n]──Concat(HBM)──► V_all ─┼─ run
//!                                     │
//! for each Qᵢ:                        ▼
//!   Move Qᵢ, K_all, V_all → SharedMemory; Transpose K_all; run
//!   QKT = Qᵢ·K_allᵗ
//!   for r in rows(QKT): GetRow → Exp → Sum → Div → append
//!   Transpose K_all back; run
//!   result = softmax·V_all; Move result → HBM; run; commit
//!   release the tile's scratch handles
//! ```
//!
//! Each transpose of `K_all` closes a batch, so a failed tile always knows
//! the orientation `K_all` was left in and can restore it before the next.

use tracing::{debug, warn};

use crate::allocator::MemoryAllocator;
use crate::engine::{Axis, Engine, SlotState};
use crate::error::{Result, SimError};
use crate::harness::{Rater, RaterReport};
use crate::matrix::{MatrixId, Position};

/// Supplies query tiles and receives the attention result for each
pub trait QuerySource {
    /// Next query tile, materialized in `engine`; `None` when exhausted
    ///
    /// [`calculate`] releases the handle once the tile is done unless
    /// [`AttentionOptions::keep_intermediates`] is set.
    ///
    /// # Errors
    ///
    /// Implementations report data or construction failures.
    fn next_query(&mut self, engine: &mut Engine) -> Result<Option<MatrixId>>;

    /// Record the materialized result for the most recent query tile
    ///
    /// # Errors
    ///
    /// Implementations report handles that cannot be read back.
    fn commit_answer(&mut self, engine: &Engine, result: MatrixId) -> Result<()>;

    /// The most recent query tile failed with `error`
    ///
    /// The engine has already been restored when this is called. Returning
    /// `Ok` moves on to the next tile; the default stops with `error`.
    ///
    /// # Errors
    ///
    /// Returns the error that ends the computation.
    fn reject_query(&mut self, error: SimError) -> Result<()> {
        Err(error)
    }
}

/// Knobs for [`calculate`]
///
/// The defaults reproduce the plain pipeline: no score scaling, no max
/// subtraction, quiet batches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttentionOptions {
    /// Multiply `QKᵗ` by this factor before the softmax (e.g. `1/√d`)
    pub scale: Option<f32>,
    /// Subtract each row's maximum before exponentiating
    pub stable_softmax: bool,
    /// Forwarded to [`Engine::run`]
    pub verbose: bool,
    /// Keep each tile's intermediates (`QKT_i`, softmax rows, the query)
    /// instead of releasing them once the result is committed
    pub keep_intermediates: bool,
}

impl AttentionOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale scores by `factor`
    #[must_use]
    pub fn with_scale(mut self, factor: f32) -> Self {
        self.scale = Some(factor);
        self
    }

    /// Scale scores by `1/√dim`
    #[must_use]
    pub fn with_inverse_sqrt_scale(self, dim: usize) -> Self {
        self.with_scale(1.0 / (dim.max(1) as f32).sqrt())
    }

    /// Enable/disable max subtraction before exp
    #[must_use]
    pub fn with_stable_softmax(mut self, stable: bool) -> Self {
        self.stable_softmax = stable;
        self
    }

    /// Enable/disable verbose batches
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Keep or release per-tile intermediates
    #[must_use]
    pub fn with_keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }
}

/// Row-concatenate `tiles` into a single matrix named `name`, tagged `tier`
///
/// Intermediate partial results are named `{name}_{j}`. A single tile is
/// copied. Only enqueues; the caller runs the batch.
///
/// # Errors
///
/// Returns `EmptyInput` for no tiles, plus any allocation or dependency error.
pub fn concat_tiles(
    engine: &mut Engine,
    allocator: &mut MemoryAllocator,
    tiles: &[MatrixId],
    name: &str,
    tier: Position,
) -> Result<MatrixId> {
    match tiles {
        [] => Err(SimError::EmptyInput("tiles")),
        [only] => {
            let out = allocator.allocate(engine, name)?;
            engine.copy(*only, out, tier)
        },
        [first, second, rest @ ..] => {
            let mut acc = allocator.allocate(engine, name)?;
            engine.concat(*first, *second, acc, Axis::Rows, tier)?;
            for (j, tile) in rest.iter().enumerate() {
                let next = allocator.allocate(engine, format!("{name}_{}", j + 2))?;
                engine.concat(acc, *tile, next, Axis::Rows, tier)?;
                acc = next;
            }
            Ok(acc)
        },
    }
}

/// Enqueue a row-by-row softmax of the on-chip matrix `scores`
///
/// `rows` must be the row count `scores` will have when it executes. Handles
/// are named with `tag` so repeated calls stay distinct. Only enqueues.
///
/// # Errors
///
/// Returns `EmptyInput` when `rows == 0`, plus any allocation or dependency error.
pub fn row_softmax(
    engine: &mut Engine,
    allocator: &mut MemoryAllocator,
    scores: MatrixId,
    rows: usize,
    tag: &str,
    options: &AttentionOptions,
) -> Result<MatrixId> {
    if rows == 0 {
        return Err(SimError::EmptyInput("score rows"));
    }

    let on_chip = Position::SharedMemory;
    let mut softmax = None;

    for r in 0..rows {
        let row = allocator.allocate(engine, format!("row_{tag}_{r}"))?;
        engine.get_row(scores, r, row, on_chip)?;

        let exp_input = if options.stable_softmax {
            let row_max = allocator.allocate(engine, format!("max_{tag}_{r}"))?;
            engine.max(row, row_max)?;
            let shifted = allocator.allocate(engine, format!("shifted_{tag}_{r}"))?;
            engine.mat_sub(row, row_max, shifted)?
        } else {
            row
        };

        let exp_row = allocator.allocate(engine, format!("exp_{tag}_{r}"))?;
        engine.mat_exp(exp_input, exp_row)?;

        let total = allocator.allocate(engine, format!("sum_{tag}_{r}"))?;
        engine.sum(exp_row, total)?;

        let normalized = allocator.allocate(engine, format!("sfrow_{tag}_{r}"))?;
        engine.mat_div(exp_row, total, normalized)?;

        softmax = Some(match softmax {
            None => {
                let seed = allocator.allocate(engine, format!("softmax_{tag}"))?;
                engine.copy(normalized, seed, on_chip)?
            },
            Some(prev) => {
                let next = allocator.allocate(engine, format!("softmax_{tag}_{r}"))?;
                engine.concat(prev, normalized, next, Axis::Rows, on_chip)?
            },
        });
    }

    softmax.ok_or(SimError::EmptyInput("score rows"))
}

/// Run tiled attention for every query tile `source` yields
///
/// Returns the number of tiles whose result was committed. A tile that fails
/// leaves the queue empty and `K_all` in its original orientation, then is
/// handed to [`QuerySource::reject_query`].
///
/// # Errors
///
/// Returns `TileCountMismatch` when key and value counts differ, `EmptyInput`
/// for no tiles, errors from the source, and tile errors it does not absorb.
pub fn calculate(
    keys: &[MatrixId],
    values: &[MatrixId],
    source: &mut impl QuerySource,
    engine: &mut Engine,
    allocator: &mut MemoryAllocator,
    options: &AttentionOptions,
) -> Result<usize> {
    if keys.len() != values.len() {
        return Err(SimError::TileCountMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }

    let device = Position::GpuHbm;
    let k_all = concat_tiles(engine, allocator, keys, "K_all", device)?;
    let v_all = concat_tiles(engine, allocator, values, "V_all", device)?;
    engine.run(options.verbose, allocator)?;

    let mut resident = Resident {
        k_all,
        v_all,
        k_transposed: false,
    };
    let mut committed = 0;

    for index in 0.. {
        let mark = engine.slot_count();
        let Some(query) = source.next_query(engine)? else {
            break;
        };

        let result = match resident.attend(engine, allocator, query, index, options) {
            Ok(result) => {
                source.commit_answer(engine, result)?;
                committed += 1;
                Some(result)
            },
            Err(err) => {
                resident.restore(engine, allocator, options)?;
                warn!(
                    tile = index,
                    error = %err,
                    contract_violation = err.is_contract_violation(),
                    "tile failed"
                );
                source.reject_query(err)?;
                None
            },
        };

        if !options.keep_intermediates {
            let released = release_scratch(engine, mark, result)?;
            debug!(
                tile = index,
                released,
                on_chip = engine.on_chip_floats(),
                "tile scratch released"
            );
        }
    }

    Ok(committed)
}

/// Concatenated keys and values shared by every tile
struct Resident {
    k_all: MatrixId,
    v_all: MatrixId,
    k_transposed: bool,
}

impl Resident {
    fn attend(
        &mut self,
        engine: &mut Engine,
        allocator: &mut MemoryAllocator,
        query: MatrixId,
        index: usize,
        options: &AttentionOptions,
    ) -> Result<MatrixId> {
        let on_chip = Position::SharedMemory;
        let rows = engine.matrix(query)?.rows();
        debug!(tile = index, rows, "attention tile");

        engine.move_to_shared_memory(query)?;
        engine.move_to_shared_memory(self.k_all)?;
        engine.move_to_shared_memory(self.v_all)?;
        engine.transpose(self.k_all, on_chip)?;
        engine.run(options.verbose, allocator)?;
        self.k_transposed = true;

        let qkt = allocator.allocate(engine, format!("QKT_{index}"))?;
        engine.mat_mul(query, self.k_all, qkt)?;

        let scores = match options.scale {
            Some(factor) => {
                let scaled = allocator.allocate(engine, format!("QKT_scaled_{index}"))?;
                engine.mat_mul_num(qkt, factor, scaled)?
            },
            None => qkt,
        };

        let softmax = row_softmax(engine, allocator, scores, rows, &index.to_string(), options)?;
        engine.transpose(self.k_all, on_chip)?;
        engine.run(options.verbose, allocator)?;
        self.k_transposed = false;

        let result = allocator.allocate(engine, format!("result_{index}"))?;
        engine.mat_mul(softmax, self.v_all, result)?;
        engine.move_to_gpu_hbm(result)?;
        engine.run(options.verbose, allocator)?;
        Ok(result)
    }

    /// Drop whatever the failed tile left queued and undo its transpose
    fn restore(
        &mut self,
        engine: &mut Engine,
        allocator: &MemoryAllocator,
        options: &AttentionOptions,
    ) -> Result<()> {
        let discarded = engine.discard_pending();
        if self.k_transposed {
            let tier = engine.matrix(self.k_all)?.position();
            engine.transpose(self.k_all, tier)?;
            engine.run(options.verbose, allocator)?;
            self.k_transposed = false;
        }
        debug!(discarded, "tile state restored");
        Ok(())
    }
}

/// Release every handle minted since `mark` except `keep`
fn release_scratch(engine: &mut Engine, mark: usize, keep: Option<MatrixId>) -> Result<usize> {
    let scratch: Vec<MatrixId> = engine
        .handles_since(mark)
        .filter(|&id| Some(id) != keep)
        .filter(|&id| !matches!(engine.state(id), Ok(SlotState::Released)))
        .collect();
    for &id in &scratch {
        engine.release(id)?;
    }
    Ok(scratch.len())
}

/// Run attention over a rater's tiles and return its report
///
/// # Errors
///
/// Propagates any error from [`calculate`].
pub fn test(
    rater: &mut Rater,
    engine: &mut Engine,
    allocator: &mut MemoryAllocator,
    options: &AttentionOptions,
) -> Result<RaterReport> {
    let keys = rater.keys().to_vec();
    let values = rater.values().to_vec();
    calculate(&keys, &values, &mut *rater, engine, allocator, options)?;
    Ok(rater.report(engine))
}
