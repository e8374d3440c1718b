use super::*;

fn on_chip(engine: &mut Engine, rows: usize, cols: usize, data: Vec<f32>) -> MatrixId {
    engine.insert(Matrix::new(rows, cols, data, Position::SharedMemory).unwrap())
}

// === Dependency validation ===

#[test]
fn test_enqueue_returns_output_handle_without_computing() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 2, vec![1.0, 2.0]);
    let out = alloc.allocate(&mut engine, "out").unwrap();

    let id = engine.mat_exp(a, out).unwrap();
    assert_eq!(id, out);
    assert_eq!(engine.state(out).unwrap(), SlotState::Pending);
    assert_eq!(engine.queued(), 1);
    assert_eq!(engine.matrix(out).unwrap_err(), SimError::NotMaterialized(out));
}

#[test]
fn test_unproduced_input_rejected() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let ghost = alloc.allocate(&mut engine, "ghost").unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    let err = engine.mat_exp(ghost, out).unwrap_err();
    assert_eq!(
        err,
        SimError::UnproducedInput {
            op: "MatExp",
            id: ghost
        }
    );
    assert_eq!(engine.queued(), 0);
    assert_eq!(engine.state(out).unwrap(), SlotState::Unproduced);
}

#[test]
fn test_pending_input_accepted() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 2, vec![1.0, 2.0]);
    let mid = alloc.allocate(&mut engine, "mid").unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_mul_num(a, 2.0, mid).unwrap();
    engine.mat_mul_num(mid, 3.0, out).unwrap();
    engine.run(false, &alloc).unwrap();

    assert_eq!(engine.matrix(out).unwrap().data(), &[6.0, 12.0]);
}

#[test]
fn test_outputs_are_write_once() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 1, vec![1.0]);
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_exp(a, out).unwrap();
    let err = engine.sum(a, out).unwrap_err();
    assert_eq!(err, SimError::OutputAlreadyProduced { op: "Sum", id: out });

    engine.run(false, &alloc).unwrap();
    let err = engine.sum(a, out).unwrap_err();
    assert!(matches!(err, SimError::OutputAlreadyProduced { .. }));

    // Ready inputs cannot be reused as outputs either
    let err = engine.copy(a, a, Position::SharedMemory).unwrap_err();
    assert!(matches!(err, SimError::OutputAlreadyProduced { .. }));
}

#[test]
fn test_unknown_handle() {
    let mut engine = Engine::new();
    let mut other = Engine::new();
    let mut alloc = MemoryAllocator::new();
    for _ in 0..3 {
        other.create_matrix(1, 1, vec![0.0]).unwrap();
    }
    let foreign = other.create_matrix(1, 1, vec![0.0]).unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    assert_eq!(
        engine.mat_exp(foreign, out).unwrap_err(),
        SimError::UnknownHandle(foreign)
    );
    assert_eq!(engine.state(foreign).unwrap_err(), SimError::UnknownHandle(foreign));
}

#[test]
fn test_dependency_validation_disabled() {
    let config = EngineConfig::new().with_validate_dependencies(false);
    let mut engine = Engine::with_config(config).unwrap();
    let mut alloc = MemoryAllocator::new();
    let ghost = alloc.allocate(&mut engine, "ghost").unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_exp(ghost, out).unwrap();
    assert_eq!(
        engine.run(false, &alloc).unwrap_err(),
        SimError::NotMaterialized(ghost)
    );
}

// === Execution ===

#[test]
fn test_fifo_order_within_batch() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let m = on_chip(&mut engine, 2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let col = alloc.allocate(&mut engine, "col").unwrap();

    engine.transpose(m, Position::SharedMemory).unwrap();
    engine.get_row(m, 2, col, Position::SharedMemory).unwrap();
    let report = engine.run(false, &alloc).unwrap();

    assert_eq!(report.drained, 2);
    assert_eq!(engine.matrix(m).unwrap().shape(), (3, 2));
    assert_eq!(engine.matrix(col).unwrap().data(), &[3.0, 6.0]);
}

#[test]
fn test_transpose_twice_restores() {
    let mut engine = Engine::new();
    let alloc = MemoryAllocator::new();
    let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let m = engine.create_matrix(2, 3, data.clone()).unwrap();

    engine.transpose(m, Position::GpuHbm).unwrap();
    engine.transpose(m, Position::GpuHbm).unwrap();
    engine.run(false, &alloc).unwrap();

    let restored = engine.matrix(m).unwrap();
    assert_eq!(restored.shape(), (2, 3));
    assert_eq!(restored.data(), data.as_slice());
}

#[test]
fn test_transpose_checks_tier_even_when_relaxed() {
    let config = EngineConfig::new().with_strict_placement(false);
    let mut engine = Engine::with_config(config).unwrap();
    let alloc = MemoryAllocator::new();
    let m = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();

    engine.transpose(m, Position::SharedMemory).unwrap();
    let err = engine.run(false, &alloc).unwrap_err();
    assert_eq!(
        err,
        SimError::TierMismatch {
            op: "Transpose",
            id: m,
            expected: Position::SharedMemory,
            actual: Position::GpuHbm,
        }
    );
}

#[test]
fn test_compute_on_hbm_operand_fails() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_exp(a, out).unwrap();
    let err = engine.run(false, &alloc).unwrap_err();
    assert!(err.is_contract_violation());
    assert!(matches!(err, SimError::TierMismatch { op: "MatExp", .. }));
}

#[test]
fn test_relaxed_placement_keeps_operand_tier() {
    let config = EngineConfig::new().with_strict_placement(false);
    let mut engine = Engine::with_config(config).unwrap();
    let mut alloc = MemoryAllocator::new();
    let a = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_add(a, a, out).unwrap();
    engine.run(false, &alloc).unwrap();

    let m = engine.matrix(out).unwrap();
    assert_eq!(m.data(), &[2.0, 4.0]);
    assert_eq!(m.position(), Position::GpuHbm);
}

#[test]
fn test_data_movement_output_takes_tier() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = engine.create_matrix(1, 2, vec![1.0, 2.0]).unwrap();
    let b = engine.create_matrix(1, 2, vec![3.0, 4.0]).unwrap();
    let wide = alloc.allocate(&mut engine, "wide").unwrap();

    engine.concat(a, b, wide, Axis::Columns, Position::GpuHbm).unwrap();
    engine.run(false, &alloc).unwrap();

    let m = engine.matrix(wide).unwrap();
    assert_eq!(m.shape(), (1, 4));
    assert_eq!(m.position(), Position::GpuHbm);
}

#[test]
fn test_broadcast_scalar_division() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let row = on_chip(&mut engine, 1, 3, vec![1.0, 2.0, 5.0]);
    let total = alloc.allocate(&mut engine, "total").unwrap();
    let normalized = alloc.allocate(&mut engine, "normalized").unwrap();

    engine.sum(row, total).unwrap();
    engine.mat_div(row, total, normalized).unwrap();
    engine.run(false, &alloc).unwrap();

    assert_eq!(engine.matrix(total).unwrap().data(), &[8.0]);
    assert_eq!(
        engine.matrix(normalized).unwrap().data(),
        &[0.125, 0.25, 0.625]
    );
}

#[test]
fn test_max_and_sub_broadcast() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let row = on_chip(&mut engine, 1, 3, vec![-1.0, 4.0, 2.0]);
    let peak = alloc.allocate(&mut engine, "peak").unwrap();
    let shifted = alloc.allocate(&mut engine, "shifted").unwrap();

    engine.max(row, peak).unwrap();
    engine.mat_sub(row, peak, shifted).unwrap();
    engine.run(false, &alloc).unwrap();

    assert_eq!(engine.matrix(shifted).unwrap().data(), &[-5.0, 0.0, -2.0]);
}

#[test]
fn test_get_column() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let m = engine.create_matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let col = alloc.allocate(&mut engine, "col").unwrap();

    engine.get_column(m, 1, col, Position::GpuHbm).unwrap();
    engine.run(false, &alloc).unwrap();

    let c = engine.matrix(col).unwrap();
    assert_eq!(c.shape(), (2, 1));
    assert_eq!(c.data(), &[2.0, 4.0]);
}

// === Abort semantics ===

#[test]
fn test_abort_discards_rest_and_reverts_pending() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 2, 2, vec![1.0; 4]);
    let b = on_chip(&mut engine, 3, 3, vec![1.0; 9]);
    let first = alloc.allocate(&mut engine, "first").unwrap();
    let bad = alloc.allocate(&mut engine, "bad").unwrap();
    let after = alloc.allocate(&mut engine, "after").unwrap();

    engine.mat_exp(a, first).unwrap();
    engine.mat_mul(a, b, bad).unwrap();
    engine.mat_exp(a, after).unwrap();

    let err = engine.run(false, &alloc).unwrap_err();
    assert_eq!(
        err,
        SimError::ShapeMismatch {
            op: "MatMul",
            left: (2, 2),
            right: (3, 3),
        }
    );
    assert_eq!(engine.queued(), 0);
    assert_eq!(engine.state(first).unwrap(), SlotState::Ready);
    assert_eq!(engine.state(bad).unwrap(), SlotState::Unproduced);
    assert_eq!(engine.state(after).unwrap(), SlotState::Unproduced);

    // Reverted handles can be produced again
    engine.mat_exp(a, after).unwrap();
    engine.run(false, &alloc).unwrap();
    assert!(engine.is_ready(after));
}

#[test]
fn test_index_out_of_range_aborts() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let m = engine.create_matrix(2, 2, vec![1.0; 4]).unwrap();
    let row = alloc.allocate(&mut engine, "row").unwrap();

    engine.get_row(m, 2, row, Position::GpuHbm).unwrap();
    let err = engine.run(true, &alloc).unwrap_err();
    assert_eq!(
        err,
        SimError::IndexOutOfRange {
            op: "GetRow",
            index: 2,
            bound: 2,
        }
    );
}

#[test]
fn test_discard_pending_reverts_outputs() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 2, vec![1.0, 2.0]);
    let exp = alloc.allocate(&mut engine, "exp").unwrap();
    let total = alloc.allocate(&mut engine, "total").unwrap();

    engine.mat_exp(a, exp).unwrap();
    engine.sum(exp, total).unwrap();
    assert_eq!(engine.discard_pending(), 2);
    assert_eq!(engine.queued(), 0);
    assert_eq!(engine.state(exp).unwrap(), SlotState::Unproduced);
    assert_eq!(engine.state(total).unwrap(), SlotState::Unproduced);

    // Nothing left to execute; the handles can be produced again
    assert_eq!(engine.run(false, &alloc).unwrap().drained, 0);
    engine.mat_exp(a, exp).unwrap();
    engine.run(false, &alloc).unwrap();
    assert!(engine.is_ready(exp));
    assert_eq!(engine.discard_pending(), 0);
}

#[test]
fn test_empty_run() {
    let mut engine = Engine::new();
    let alloc = MemoryAllocator::new();
    let report = engine.run(true, &alloc).unwrap();
    assert_eq!(report.drained, 0);
    assert_eq!(report.stats, RunStats::default());
}

// === Tier moves and accounting ===

#[test]
fn test_move_round_trip_accounting() {
    let mut engine = Engine::new();
    let alloc = MemoryAllocator::new();
    let m = engine.create_matrix(2, 4, vec![0.5; 8]).unwrap();

    engine.move_to_shared_memory(m).unwrap();
    let report = engine.run(false, &alloc).unwrap();
    assert_eq!(engine.matrix(m).unwrap().position(), Position::SharedMemory);
    assert_eq!(engine.on_chip_floats(), 8);
    assert_eq!(report.stats.moves_to_shared, 1);
    assert_eq!(report.stats.floats_transferred, 8);
    assert_eq!(report.stats.peak_on_chip_floats, 8);
    assert!((report.stats.simulated_cycles - 0.5).abs() < f64::EPSILON);

    engine.move_to_gpu_hbm(m).unwrap();
    engine.run(false, &alloc).unwrap();
    assert_eq!(engine.on_chip_floats(), 0);
    assert_eq!(engine.stats().transfers(), 2);
    assert_eq!(engine.stats().floats_transferred, 16);
}

#[test]
fn test_move_to_current_tier_is_noop() {
    let mut engine = Engine::new();
    let alloc = MemoryAllocator::new();
    let m = engine.create_matrix(1, 4, vec![1.0; 4]).unwrap();

    engine.move_to_gpu_hbm(m).unwrap();
    let report = engine.run(false, &alloc).unwrap();

    assert_eq!(report.drained, 1);
    assert_eq!(report.stats.transfers(), 0);
    assert_eq!(report.stats.floats_transferred, 0);
}

#[test]
fn test_matmul_flops_counted() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 2, 3, vec![1.0; 6]);
    let b = on_chip(&mut engine, 3, 4, vec![1.0; 12]);
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_mul(a, b, out).unwrap();
    let report = engine.run(false, &alloc).unwrap();

    assert_eq!(report.stats.flops, 48);
    assert_eq!(engine.matrix(out).unwrap().data(), &[3.0; 8]);
    assert_eq!(engine.on_chip_floats(), 6 + 12 + 8);
}

// === Release ===

#[test]
fn test_release_reclaims_and_blocks_reuse() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 4, vec![1.0; 4]);
    assert_eq!(engine.on_chip_floats(), 4);

    engine.release(a).unwrap();
    assert_eq!(engine.on_chip_floats(), 0);
    assert_eq!(engine.state(a).unwrap(), SlotState::Released);
    assert_eq!(engine.matrix(a).unwrap_err(), SimError::ReleasedHandle(a));
    assert_eq!(engine.release(a).unwrap_err(), SimError::ReleasedHandle(a));

    let out = alloc.allocate(&mut engine, "out").unwrap();
    assert_eq!(engine.mat_exp(a, out).unwrap_err(), SimError::ReleasedHandle(a));
}

#[test]
fn test_release_refused_while_queued() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 1, vec![1.0]);
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.mat_exp(a, out).unwrap();
    assert_eq!(engine.release(a).unwrap_err(), SimError::HandleInUse(a));
    assert_eq!(engine.release(out).unwrap_err(), SimError::HandleInUse(out));

    engine.run(false, &alloc).unwrap();
    engine.release(a).unwrap();
}

#[test]
fn test_handles_since_watermark() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    on_chip(&mut engine, 1, 1, vec![1.0]);
    let mark = engine.slot_count();
    let b = on_chip(&mut engine, 1, 1, vec![2.0]);
    let c = alloc.allocate(&mut engine, "c").unwrap();

    assert_eq!(engine.handles_since(mark).collect::<Vec<_>>(), vec![b, c]);
    assert_eq!(engine.handles_since(engine.slot_count()).count(), 0);
}

#[test]
fn test_pending_ops_listed_in_order() {
    let mut engine = Engine::new();
    let mut alloc = MemoryAllocator::new();
    let a = on_chip(&mut engine, 1, 1, vec![1.0]);
    let out = alloc.allocate(&mut engine, "out").unwrap();

    engine.move_to_shared_memory(a).unwrap();
    engine.mat_exp(a, out).unwrap();

    let names: Vec<_> = engine.pending_ops().map(Op::name).collect();
    assert_eq!(names, vec!["MoveMatrixToSharedMem", "MatExp"]);
}

#[test]
fn test_with_config_rejects_bad_cost() {
    let cost = crate::config::CostModel {
        hbm_floats_per_cycle: 0.0,
        ..Default::default()
    };
    let err = Engine::with_config(EngineConfig::new().with_cost(cost)).unwrap_err();
    assert!(matches!(err, SimError::InvalidConfiguration(_)));
}
