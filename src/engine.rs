//! Deferred execution engine
//!
//! The [`Engine`] owns an arena of matrix slots and a FIFO queue of
//! operations. Every enqueue call records intent and immediately returns the
//! output handle; nothing is computed until [`Engine::run`] drains the queue.
//!
//! ## Slot lifecycle
//!
//! ```text
//! allocate ──► Unproduced ──enqueue──► Pending ──run──► Ready ──release──► Released
//!                  ▲                      │
//!                  └──── batch aborted ───┘
//! ```
//!
//! ## Placement
//!
//! Compute operations (`mat_mul`, `mat_add`, `mat_sub`, `mat_div`,
//! `mat_mul_num`, `mat_exp`, `sum`, `max`) read their operands from
//! `SharedMemory` and write a `SharedMemory` result. Data-movement operations
//! (`concat`, `get_row`, `get_column`, `copy`) require operands to sit in the
//! tier they are tagged with. Both rules are checked when the operation
//! executes and can be relaxed with
//! [`EngineConfig::with_strict_placement`]. `transpose` always runs where the
//! data lives.

mod kernels;
mod ops;
mod stats;
#[cfg(test)]
mod tests;

pub use ops::{Axis, Op};
pub use stats::{RunReport, RunStats};

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::allocator::MemoryAllocator;
use crate::config::EngineConfig;
use crate::error::{Result, SimError};
use crate::matrix::{Matrix, MatrixId, Position};

use kernels::Produced;

/// Arena slot
#[derive(Debug, Clone)]
enum Slot {
    Unproduced,
    Pending,
    Ready(Matrix),
    Released,
}

/// Observable state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Minted, no producer yet
    Unproduced,
    /// Output of a queued operation
    Pending,
    /// Materialized
    Ready,
    /// Storage reclaimed
    Released,
}

/// Deferred-execution simulator for a two-tier memory hierarchy
///
/// # Examples
///
/// ```
/// use tilesim::{Axis, Engine, MemoryAllocator, Position};
///
/// let mut engine = Engine::new();
/// let mut alloc = MemoryAllocator::new();
///
/// let a = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();
/// let b = engine.create_matrix(1, 2, vec![3.0, 4.0]).unwrap();
/// let out = alloc.allocate(&mut engine, "out").unwrap();
/// engine.concat(a, b, out, Axis::Rows, Position::GpuHbm).unwrap();
///
/// assert!(!engine.is_ready(out));
/// engine.run(false, &alloc).unwrap();
///
/// let m = engine.matrix(out).unwrap();
/// assert_eq!(m.shape(), (2, 2));
/// assert_eq!(m.data(), &[1.0, 2.0, 3.0, 4.0]);
/// ```
#[derive(Debug, Default)]
pub struct Engine {
    config: EngineConfig,
    slots: Vec<Slot>,
    queue: VecDeque<Op>,
    stats: RunStats,
    on_chip_floats: u64,
}

impl Engine {
    /// Create an engine with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the cost model is unusable.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Arena
    // ========================================================================

    /// Place an already-constructed matrix in the arena
    pub fn insert(&mut self, matrix: Matrix) -> MatrixId {
        if matrix.position().is_on_chip() {
            self.on_chip_floats += matrix.len() as u64;
        }
        self.slots.push(Slot::Ready(matrix));
        MatrixId(self.slots.len() - 1)
    }

    /// Construct a device-resident matrix and place it in the arena
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `data.len() != rows * cols`.
    pub fn create_matrix(&mut self, rows: usize, cols: usize, data: Vec<f32>) -> Result<MatrixId> {
        let matrix = Matrix::from_vec(rows, cols, data)?;
        Ok(self.insert(matrix))
    }

    /// Mint an unproduced slot; handles are only handed out through the allocator
    pub(crate) fn reserve(&mut self) -> MatrixId {
        self.slots.push(Slot::Unproduced);
        MatrixId(self.slots.len() - 1)
    }

    /// Borrow a materialized matrix
    ///
    /// # Errors
    ///
    /// Returns `NotMaterialized` before the producing batch ran, `ReleasedHandle`
    /// after release and `UnknownHandle` for foreign handles.
    pub fn matrix(&self, id: MatrixId) -> Result<&Matrix> {
        match self.slot(id)? {
            Slot::Ready(matrix) => Ok(matrix),
            Slot::Released => Err(SimError::ReleasedHandle(id)),
            Slot::Unproduced | Slot::Pending => Err(SimError::NotMaterialized(id)),
        }
    }

    /// Lifecycle state of a handle
    ///
    /// # Errors
    ///
    /// Returns `UnknownHandle` for foreign handles.
    pub fn state(&self, id: MatrixId) -> Result<SlotState> {
        Ok(match self.slot(id)? {
            Slot::Unproduced => SlotState::Unproduced,
            Slot::Pending => SlotState::Pending,
            Slot::Ready(_) => SlotState::Ready,
            Slot::Released => SlotState::Released,
        })
    }

    /// Whether the handle refers to a materialized matrix
    #[must_use]
    pub fn is_ready(&self, id: MatrixId) -> bool {
        matches!(self.slots.get(id.0), Some(Slot::Ready(_)))
    }

    /// Number of slots ever minted
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Reclaim a slot's storage
    ///
    /// # Errors
    ///
    /// Returns `HandleInUse` while a queued operation still refers to the handle
    /// and `ReleasedHandle` on double release.
    pub fn release(&mut self, id: MatrixId) -> Result<()> {
        if self.queue.iter().any(|op| op.references(id)) {
            return Err(SimError::HandleInUse(id));
        }
        let slot = self.slot_mut(id)?;
        match std::mem::replace(slot, Slot::Released) {
            Slot::Ready(matrix) => {
                if matrix.position().is_on_chip() {
                    self.on_chip_floats = self.on_chip_floats.saturating_sub(matrix.len() as u64);
                }
            },
            Slot::Released => return Err(SimError::ReleasedHandle(id)),
            Slot::Unproduced | Slot::Pending => {},
        }
        Ok(())
    }

    /// Floats currently resident in shared memory
    #[must_use]
    pub fn on_chip_floats(&self) -> u64 {
        self.on_chip_floats
    }

    /// Counters accumulated over every batch of this session
    #[must_use]
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Number of operations waiting for the next [`Engine::run`]
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Operations waiting for the next [`Engine::run`], in execution order
    pub fn pending_ops(&self) -> impl Iterator<Item = &Op> {
        self.queue.iter()
    }

    /// Drop every queued operation without executing it
    ///
    /// Outputs still pending revert to unproduced. Returns the number of
    /// operations dropped.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.queue.len();
        while let Some(op) = self.queue.pop_front() {
            self.revert_pending(&op);
        }
        if discarded > 0 {
            debug!(discarded, "queue discarded");
        }
        discarded
    }

    /// Handles minted at or after arena index `mark`
    ///
    /// Pair with [`Engine::slot_count`] taken earlier as a watermark.
    pub fn handles_since(&self, mark: usize) -> impl Iterator<Item = MatrixId> {
        (mark..self.slots.len()).map(MatrixId)
    }

    // ========================================================================
    // Enqueue API
    // ========================================================================

    /// Concatenate `lhs` and `rhs` along `axis` into `out`, tagged `tier`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if an input has no producer or `out` already has one.
    pub fn concat(
        &mut self,
        lhs: MatrixId,
        rhs: MatrixId,
        out: MatrixId,
        axis: Axis,
        tier: Position,
    ) -> Result<MatrixId> {
        self.enqueue(Op::Concat {
            lhs,
            rhs,
            out,
            axis,
            tier,
        })
    }

    /// Transpose `target` in place; it must reside in `tier` when the op executes
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `target` has no producer.
    pub fn transpose(&mut self, target: MatrixId, tier: Position) -> Result<MatrixId> {
        self.enqueue(Op::Transpose { target, tier })
    }

    /// `out = lhs @ rhs`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if an input has no producer or `out` already has one.
    pub fn mat_mul(&mut self, lhs: MatrixId, rhs: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatMul { lhs, rhs, out })
    }

    /// `out = lhs + rhs` (elementwise, or broadcast of a 1x1 `rhs`)
    ///
    /// # Errors
    ///
    /// Returns a dependency error if an input has no producer or `out` already has one.
    pub fn mat_add(&mut self, lhs: MatrixId, rhs: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatAdd { lhs, rhs, out })
    }

    /// `out = lhs - rhs` (elementwise, or broadcast of a 1x1 `rhs`)
    ///
    /// # Errors
    ///
    /// Returns a dependency error if an input has no producer or `out` already has one.
    pub fn mat_sub(&mut self, lhs: MatrixId, rhs: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatSub { lhs, rhs, out })
    }

    /// `out = numer / denom` (elementwise, or division by a 1x1 `denom`)
    ///
    /// # Errors
    ///
    /// Returns a dependency error if an input has no producer or `out` already has one.
    pub fn mat_div(&mut self, numer: MatrixId, denom: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatDiv { numer, denom, out })
    }

    /// `out = input * scalar`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn mat_mul_num(&mut self, input: MatrixId, scalar: f32, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatMulNum { input, scalar, out })
    }

    /// `out = exp(input)` elementwise
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn mat_exp(&mut self, input: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MatExp { input, out })
    }

    /// `out` = 1x1 sum of every element of `input`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn sum(&mut self, input: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::Sum { input, out })
    }

    /// `out` = 1x1 maximum element of `input`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn max(&mut self, input: MatrixId, out: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::Max { input, out })
    }

    /// Extract row `row` of `input` as a 1 x cols matrix tagged `tier`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn get_row(
        &mut self,
        input: MatrixId,
        row: usize,
        out: MatrixId,
        tier: Position,
    ) -> Result<MatrixId> {
        self.enqueue(Op::GetRow {
            input,
            row,
            out,
            tier,
        })
    }

    /// Extract column `col` of `input` as a rows x 1 matrix tagged `tier`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `input` has no producer or `out` already has one.
    pub fn get_column(
        &mut self,
        input: MatrixId,
        col: usize,
        out: MatrixId,
        tier: Position,
    ) -> Result<MatrixId> {
        self.enqueue(Op::GetColumn {
            input,
            col,
            out,
            tier,
        })
    }

    /// Duplicate `src` into `dst`, tagged `tier`
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `src` has no producer or `dst` already has one.
    pub fn copy(&mut self, src: MatrixId, dst: MatrixId, tier: Position) -> Result<MatrixId> {
        self.enqueue(Op::Copy { src, dst, tier })
    }

    /// Move `target` into shared memory
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `target` has no producer.
    pub fn move_to_shared_memory(&mut self, target: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MoveToSharedMemory { target })
    }

    /// Move `target` into GPU HBM
    ///
    /// # Errors
    ///
    /// Returns a dependency error if `target` has no producer.
    pub fn move_to_gpu_hbm(&mut self, target: MatrixId) -> Result<MatrixId> {
        self.enqueue(Op::MoveToGpuHbm { target })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Drain the queue in FIFO order, materializing every pending output
    ///
    /// `verbose` only controls logging: each executed operation is reported at
    /// `info` level, labelled with the names registered in `allocator`.
    ///
    /// # Errors
    ///
    /// Returns the first contract violation. The rest of the batch is discarded
    /// and its pending outputs revert to unproduced.
    pub fn run(&mut self, verbose: bool, allocator: &MemoryAllocator) -> Result<RunReport> {
        let mut batch = RunStats::default();
        let mut drained = 0;

        while let Some(op) = self.queue.pop_front() {
            if let Err(err) = self.execute(&op, &mut batch) {
                let discarded = self.queue.len();
                warn!(
                    op = %describe(&op, allocator),
                    error = %err,
                    discarded,
                    "batch aborted"
                );
                self.revert_pending(&op);
                self.discard_pending();
                self.stats.merge(&batch);
                return Err(err);
            }

            drained += 1;
            batch.ops_executed += 1;
            batch.peak_on_chip_floats = batch.peak_on_chip_floats.max(self.on_chip_floats);

            if verbose {
                info!(op = %describe(&op, allocator), shape = %self.shape_label(op.result()), "executed");
            } else {
                trace!(op = %op, "executed");
            }
        }

        if verbose {
            info!(drained, stats = %batch, "run complete");
        }
        self.stats.merge(&batch);
        Ok(RunReport {
            drained,
            stats: batch,
        })
    }

    fn enqueue(&mut self, op: Op) -> Result<MatrixId> {
        let name = op.name();
        for id in op.inputs() {
            self.check_input(name, id)?;
        }
        if let Some(out) = op.output() {
            self.check_output(name, out)?;
            let slot = self.slot_mut(out)?;
            if matches!(slot, Slot::Unproduced) {
                *slot = Slot::Pending;
            }
        }

        let result = op.result();
        debug!(op = %op, queued = self.queue.len() + 1, "enqueue");
        self.queue.push_back(op);
        Ok(result)
    }

    fn check_input(&self, op: &'static str, id: MatrixId) -> Result<()> {
        match self.slot(id)? {
            Slot::Released => Err(SimError::ReleasedHandle(id)),
            Slot::Unproduced if self.config.validate_dependencies => {
                Err(SimError::UnproducedInput { op, id })
            },
            _ => Ok(()),
        }
    }

    fn check_output(&self, op: &'static str, id: MatrixId) -> Result<()> {
        match self.slot(id)? {
            Slot::Released => Err(SimError::ReleasedHandle(id)),
            Slot::Unproduced => Ok(()),
            _ if self.config.validate_dependencies => {
                Err(SimError::OutputAlreadyProduced { op, id })
            },
            _ => Ok(()),
        }
    }

    fn execute(&mut self, op: &Op, batch: &mut RunStats) -> Result<()> {
        let name = op.name();
        match *op {
            Op::Concat {
                lhs,
                rhs,
                out,
                axis,
                tier,
            } => {
                let a = self.operand_in(name, lhs, tier)?;
                let b = self.operand_in(name, rhs, tier)?;
                let produced = kernels::concat(name, a, b, axis)?;
                self.store(out, produced, tier)
            },
            Op::Transpose { target, tier } => {
                let matrix = self.ready_mut(target)?;
                if matrix.position() != tier {
                    return Err(SimError::TierMismatch {
                        op: name,
                        id: target,
                        expected: tier,
                        actual: matrix.position(),
                    });
                }
                let data = kernels::transpose(matrix.data(), matrix.rows(), matrix.cols());
                let (rows, cols) = (matrix.cols(), matrix.rows());
                matrix.reshape_in_place(rows, cols, data);
                Ok(())
            },
            Op::MatMul { lhs, rhs, out } => {
                let a = self.compute_operand(name, lhs)?;
                let b = self.compute_operand(name, rhs)?;
                let tier = self.compute_tier(a);
                let flops = 2 * (a.rows() * a.cols() * b.cols()) as u64;
                let produced = kernels::matmul(name, a, b)?;
                self.charge_compute(flops, batch);
                self.store(out, produced, tier)
            },
            Op::MatAdd { lhs, rhs, out } => {
                self.elementwise(name, lhs, rhs, out, batch, |x, y| x + y)
            },
            Op::MatSub { lhs, rhs, out } => {
                self.elementwise(name, lhs, rhs, out, batch, |x, y| x - y)
            },
            Op::MatDiv { numer, denom, out } => {
                self.elementwise(name, numer, denom, out, batch, |x, y| x / y)
            },
            Op::MatMulNum { input, scalar, out } => {
                self.unary(name, input, out, batch, |m| kernels::map(m, |x| x * scalar))
            },
            Op::MatExp { input, out } => {
                self.unary(name, input, out, batch, |m| kernels::map(m, f32::exp))
            },
            Op::Sum { input, out } => self.unary(name, input, out, batch, kernels::sum),
            Op::Max { input, out } => self.unary(name, input, out, batch, kernels::max),
            Op::GetRow {
                input,
                row,
                out,
                tier,
            } => {
                let m = self.operand_in(name, input, tier)?;
                let produced = kernels::get_row(name, m, row)?;
                self.store(out, produced, tier)
            },
            Op::GetColumn {
                input,
                col,
                out,
                tier,
            } => {
                let m = self.operand_in(name, input, tier)?;
                let produced = kernels::get_column(name, m, col)?;
                self.store(out, produced, tier)
            },
            Op::Copy { src, dst, tier } => {
                let m = self.operand_in(name, src, tier)?;
                let produced = kernels::duplicate(m);
                self.store(dst, produced, tier)
            },
            Op::MoveToSharedMemory { target } => {
                self.move_to(target, Position::SharedMemory, batch)
            },
            Op::MoveToGpuHbm { target } => self.move_to(target, Position::GpuHbm, batch),
        }
    }

    fn elementwise(
        &mut self,
        name: &'static str,
        lhs: MatrixId,
        rhs: MatrixId,
        out: MatrixId,
        batch: &mut RunStats,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<()> {
        let a = self.compute_operand(name, lhs)?;
        let b = self.compute_operand(name, rhs)?;
        let tier = self.compute_tier(a);
        let produced = kernels::zip_broadcast(name, a, b, f)?;
        self.charge_compute(produced.data.len() as u64, batch);
        self.store(out, produced, tier)
    }

    fn unary(
        &mut self,
        name: &'static str,
        input: MatrixId,
        out: MatrixId,
        batch: &mut RunStats,
        kernel: impl FnOnce(&Matrix) -> Produced,
    ) -> Result<()> {
        let m = self.compute_operand(name, input)?;
        let tier = self.compute_tier(m);
        let flops = m.len() as u64;
        let produced = kernel(m);
        self.charge_compute(flops, batch);
        self.store(out, produced, tier)
    }

    fn move_to(&mut self, id: MatrixId, tier: Position, batch: &mut RunStats) -> Result<()> {
        let cost = self.config.cost;
        let matrix = self.ready_mut(id)?;
        if matrix.position() == tier {
            return Ok(());
        }
        matrix.set_position(tier);
        let floats = matrix.len() as u64;

        match tier {
            Position::SharedMemory => {
                self.on_chip_floats += floats;
                batch.moves_to_shared += 1;
            },
            Position::GpuHbm => {
                self.on_chip_floats = self.on_chip_floats.saturating_sub(floats);
                batch.moves_to_hbm += 1;
            },
        }
        batch.floats_transferred += floats;
        batch.simulated_cycles += cost.transfer_cycles(floats);
        Ok(())
    }

    fn charge_compute(&self, flops: u64, batch: &mut RunStats) {
        batch.flops += flops;
        batch.simulated_cycles += self.config.cost.compute_cycles(flops);
    }

    /// Materialize a kernel result into a fresh output slot
    fn store(&mut self, out: MatrixId, produced: Produced, tier: Position) -> Result<()> {
        let matrix = Matrix::from_parts(produced.rows, produced.cols, produced.data, tier);
        let added = if tier.is_on_chip() {
            matrix.len() as u64
        } else {
            0
        };
        let previous = std::mem::replace(self.slot_mut(out)?, Slot::Ready(matrix));
        if let Slot::Ready(old) = previous {
            if old.position().is_on_chip() {
                self.on_chip_floats = self.on_chip_floats.saturating_sub(old.len() as u64);
            }
        }
        self.on_chip_floats += added;
        Ok(())
    }

    fn revert_pending(&mut self, op: &Op) {
        if let Some(slot) = op.output().and_then(|out| self.slots.get_mut(out.0)) {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Unproduced;
            }
        }
    }

    fn slot(&self, id: MatrixId) -> Result<&Slot> {
        self.slots.get(id.0).ok_or(SimError::UnknownHandle(id))
    }

    fn slot_mut(&mut self, id: MatrixId) -> Result<&mut Slot> {
        self.slots.get_mut(id.0).ok_or(SimError::UnknownHandle(id))
    }

    fn ready_mut(&mut self, id: MatrixId) -> Result<&mut Matrix> {
        match self.slot_mut(id)? {
            Slot::Ready(matrix) => Ok(matrix),
            Slot::Released => Err(SimError::ReleasedHandle(id)),
            Slot::Unproduced | Slot::Pending => Err(SimError::NotMaterialized(id)),
        }
    }

    /// Operand of a data-movement op; must sit in the op's tier under strict placement
    fn operand_in(&self, op: &'static str, id: MatrixId, tier: Position) -> Result<&Matrix> {
        let matrix = self.matrix(id)?;
        if self.config.strict_placement && matrix.position() != tier {
            return Err(SimError::TierMismatch {
                op,
                id,
                expected: tier,
                actual: matrix.position(),
            });
        }
        Ok(matrix)
    }

    /// Operand of a compute op; must be on-chip under strict placement
    fn compute_operand(&self, op: &'static str, id: MatrixId) -> Result<&Matrix> {
        self.operand_in(op, id, Position::SharedMemory)
    }

    fn compute_tier(&self, first_operand: &Matrix) -> Position {
        if self.config.strict_placement {
            Position::SharedMemory
        } else {
            first_operand.position()
        }
    }

    fn shape_label(&self, id: MatrixId) -> String {
        match self.matrix(id) {
            Ok(m) => format!("{}x{} {}", m.rows(), m.cols(), m.position()),
            Err(_) => "-".to_string(),
        }
    }
}

/// "MatMul(Q, K_all) -> QKT_0" using allocator names where known
fn describe(op: &Op, allocator: &MemoryAllocator) -> String {
    let inputs: Vec<String> = op.inputs().into_iter().map(|id| allocator.label(id)).collect();
    match op.output() {
        Some(out) => format!("{}({}) -> {}", op.name(), inputs.join(", "), allocator.label(out)),
        None => format!("{}({})", op.name(), inputs.join(", ")),
    }
}
