//! Command bodies

use std::path::PathBuf;

use tracing::info;

use crate::allocator::MemoryAllocator;
use crate::attention::{self, AttentionOptions, QuerySource};
use crate::config::EngineConfig;
use crate::engine::{Axis, Engine};
use crate::error::Result;
use crate::harness::{DataSet, QueryLayout, Rater, RaterReport};
use crate::matrix::{MatrixId, Position};

/// Arguments of `tilesim run`
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Row width
    pub width: usize,
    /// Query grouping
    pub layout: QueryLayout,
    /// Per-element tolerance
    pub tolerance: f32,
    /// Optional engine configuration file
    pub config: Option<PathBuf>,
    /// Optional score scale
    pub scale: Option<f32>,
    /// Max-subtracted softmax
    pub stable: bool,
    /// Verbose batches
    pub verbose: bool,
}

impl RunConfig {
    fn attention_options(&self) -> AttentionOptions {
        let options = AttentionOptions::new()
            .with_stable_softmax(self.stable)
            .with_verbose(self.verbose);
        match self.scale {
            Some(factor) => options.with_scale(factor),
            None => options,
        }
    }
}

/// Load a data set, run attention over it and grade every tile
pub fn handle_run(run: &RunConfig) -> Result<RaterReport> {
    let config = match &run.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let data = DataSet::load(&run.data_dir, run.width)?;
    info!(
        dir = %run.data_dir.display(),
        tiles = data.tile_count(),
        query_rows = data.query_rows(),
        layout = %run.layout,
        "loaded data set"
    );

    let mut engine = Engine::with_config(config)?;
    let mut allocator = MemoryAllocator::new();
    let mut rater = Rater::new(&mut engine, &data, run.layout)?.with_tolerance(run.tolerance);

    attention::test(&mut rater, &mut engine, &mut allocator, &run.attention_options())
}

/// Serves one query tile and keeps the committed result handle
struct DemoQuery {
    query: Option<(usize, usize, Vec<f32>)>,
    result: Option<MatrixId>,
}

impl QuerySource for DemoQuery {
    fn next_query(&mut self, engine: &mut Engine) -> Result<Option<MatrixId>> {
        match self.query.take() {
            Some((rows, cols, data)) => engine.create_matrix(rows, cols, data).map(Some),
            None => Ok(None),
        }
    }

    fn commit_answer(&mut self, _engine: &Engine, result: MatrixId) -> Result<()> {
        self.result = Some(result);
        Ok(())
    }
}

/// Print the worked two-key example
pub fn handle_demo(verbose: bool) -> Result<()> {
    let mut engine = Engine::new();
    let mut allocator = MemoryAllocator::new();

    let k1 = engine.create_matrix(1, 3, vec![1.0, 0.0, 0.0])?;
    let k2 = engine.create_matrix(1, 3, vec![0.0, 1.0, 0.0])?;
    let v1 = engine.create_matrix(1, 3, vec![1.0, 1.0, 1.0])?;
    let v2 = engine.create_matrix(1, 3, vec![2.0, 2.0, 2.0])?;
    allocator.bind(k1, "K1")?;
    allocator.bind(k2, "K2")?;
    allocator.bind(v1, "V1")?;
    allocator.bind(v2, "V2")?;

    // Two 1x3 tiles stacked in HBM
    let stacked = allocator.allocate(&mut engine, "stacked")?;
    engine.concat(k1, k2, stacked, Axis::Rows, Position::GpuHbm)?;
    engine.run(verbose, &allocator)?;
    println!("stacked keys:\n{}", engine.matrix(stacked)?);

    let mut source = DemoQuery {
        query: Some((2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
        result: None,
    };
    let options = AttentionOptions::new()
        .with_verbose(verbose)
        .with_keep_intermediates(true);
    attention::calculate(
        &[k1, k2],
        &[v1, v2],
        &mut source,
        &mut engine,
        &mut allocator,
        &options,
    )?;

    for name in ["K_all", "V_all", "QKT_0", "softmax_0_1"] {
        if let Some(id) = allocator.get(name) {
            println!("{name}:\n{}", engine.matrix(id)?);
        }
    }
    if let Some(result) = source.result {
        println!("result:\n{}", engine.matrix(result)?);
    }
    println!("{}", engine.stats());
    Ok(())
}

/// Print version and the default engine configuration
pub fn handle_info() -> Result<()> {
    println!("tilesim {}", env!("CARGO_PKG_VERSION"));
    println!("tiers: {} (device), {} (on-chip)", Position::GpuHbm, Position::SharedMemory);
    println!("default configuration:");
    println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}
