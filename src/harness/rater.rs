//! Query source that grades each attention result against reference answers

use std::fmt;

use tracing::{debug, warn};

use super::loader::DataSet;
use crate::attention::QuerySource;
use crate::engine::{Engine, RunStats};
use crate::error::{Result, SimError};
use crate::matrix::MatrixId;

/// Maximum absolute error accepted per element
pub const DEFAULT_TOLERANCE: f32 = 1e-3;

/// How query rows are grouped into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryLayout {
    /// Tile `i` is the first `i + 1` query rows, one tile per key
    #[default]
    Prefix,
    /// Consecutive tiles of a fixed row count
    Fixed(usize),
}

impl std::str::FromStr for QueryLayout {
    type Err = SimError;

    /// Parses `prefix` or `fixed:N`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("prefix") {
            return Ok(Self::Prefix);
        }
        let rows = s
            .strip_prefix("fixed:")
            .ok_or_else(|| SimError::ParseError {
                reason: format!("unknown query layout '{s}' (expected prefix or fixed:N)"),
            })?
            .parse::<usize>()
            .map_err(|e| SimError::ParseError {
                reason: format!("fixed layout row count: {e}"),
            })?;
        if rows == 0 {
            return Err(SimError::InvalidShape {
                reason: "fixed query tiles need at least one row".to_string(),
            });
        }
        Ok(Self::Fixed(rows))
    }
}

impl fmt::Display for QueryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix => write!(f, "prefix"),
            Self::Fixed(rows) => write!(f, "fixed:{rows}"),
        }
    }
}

/// Grade of one committed tile
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutcome {
    /// Tile index
    pub index: usize,
    /// Result shape
    pub shape: (usize, usize),
    /// Largest absolute deviation; infinite when no reference was left or a value is NaN
    pub max_abs_error: f32,
    /// Whether every element is within tolerance
    pub passed: bool,
}

/// Key/value tiles, query stream and answer checker
#[derive(Debug)]
pub struct Rater {
    width: usize,
    keys: Vec<MatrixId>,
    values: Vec<MatrixId>,
    queries: Vec<f32>,
    answers: Vec<f32>,
    layout: QueryLayout,
    tolerance: f32,
    served: usize,
    answer_cursor: usize,
    outcomes: Vec<TileOutcome>,
}

impl Rater {
    /// Materialize the data set's key and value tiles in `engine` (GpuHbm)
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for a zero-row fixed layout.
    pub fn new(engine: &mut Engine, data: &DataSet, layout: QueryLayout) -> Result<Self> {
        if layout == QueryLayout::Fixed(0) {
            return Err(SimError::InvalidShape {
                reason: "fixed query tiles need at least one row".to_string(),
            });
        }
        let width = data.width();
        let keys = data
            .key_tiles()
            .map(|tile| engine.create_matrix(1, width, tile.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let values = data
            .value_tiles()
            .map(|tile| engine.create_matrix(1, width, tile.to_vec()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            width,
            keys,
            values,
            queries: data.queries().to_vec(),
            answers: data.answers().to_vec(),
            layout,
            tolerance: DEFAULT_TOLERANCE,
            served: 0,
            answer_cursor: 0,
            outcomes: Vec::new(),
        })
    }

    /// Override the per-element tolerance
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Key tile handles
    #[must_use]
    pub fn keys(&self) -> &[MatrixId] {
        &self.keys
    }

    /// Value tile handles
    #[must_use]
    pub fn values(&self) -> &[MatrixId] {
        &self.values
    }

    /// Number of query tiles this rater will serve
    #[must_use]
    pub fn tile_count(&self) -> usize {
        let query_rows = self.queries.len() / self.width.max(1);
        match self.layout {
            QueryLayout::Prefix => self.keys.len().min(query_rows),
            QueryLayout::Fixed(rows) => query_rows / rows.max(1),
        }
    }

    /// Outcomes recorded so far
    #[must_use]
    pub fn outcomes(&self) -> &[TileOutcome] {
        &self.outcomes
    }

    /// Summarize outcomes together with the engine's cumulative counters
    #[must_use]
    pub fn report(&self, engine: &Engine) -> RaterReport {
        RaterReport {
            tolerance: self.tolerance,
            expected_tiles: self.tile_count(),
            outcomes: self.outcomes.clone(),
            stats: engine.stats().clone(),
        }
    }

    fn tile_rows(&self, index: usize) -> usize {
        match self.layout {
            QueryLayout::Prefix => index + 1,
            QueryLayout::Fixed(rows) => rows,
        }
    }

    fn tile_start_row(&self, index: usize) -> usize {
        match self.layout {
            QueryLayout::Prefix => 0,
            QueryLayout::Fixed(rows) => index * rows,
        }
    }
}

impl QuerySource for Rater {
    fn next_query(&mut self, engine: &mut Engine) -> Result<Option<MatrixId>> {
        if self.served >= self.tile_count() {
            return Ok(None);
        }
        let rows = self.tile_rows(self.served);
        let start = self.tile_start_row(self.served) * self.width;
        let data = self.queries[start..start + rows * self.width].to_vec();

        let query = engine.create_matrix(rows, self.width, data)?;
        debug!(tile = self.served, rows, "serving query");
        self.served += 1;
        Ok(Some(query))
    }

    fn commit_answer(&mut self, engine: &Engine, result: MatrixId) -> Result<()> {
        let matrix = engine.matrix(result)?;
        let index = self.outcomes.len();
        let got = matrix.data();
        let end = self.answer_cursor + got.len();

        let max_abs_error = match self.answers.get(self.answer_cursor..end) {
            Some(expected) => got
                .iter()
                .zip(expected)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, |acc, e| if e.is_nan() { f32::INFINITY } else { acc.max(e) }),
            None => f32::INFINITY,
        };
        self.answer_cursor = end.min(self.answers.len());

        let passed = max_abs_error <= self.tolerance;
        if !passed {
            warn!(tile = index, max_abs_error, tolerance = self.tolerance, "tile mismatch");
        }
        self.outcomes.push(TileOutcome {
            index,
            shape: matrix.shape(),
            max_abs_error,
            passed,
        });
        Ok(())
    }

    fn reject_query(&mut self, error: SimError) -> Result<()> {
        let index = self.outcomes.len();
        let rows = self.tile_rows(index);
        warn!(tile = index, error = %error, "tile failed, recorded as mismatch");

        let expected = rows * self.width;
        self.answer_cursor = (self.answer_cursor + expected).min(self.answers.len());
        self.outcomes.push(TileOutcome {
            index,
            shape: (rows, self.width),
            max_abs_error: f32::INFINITY,
            passed: false,
        });
        Ok(())
    }
}

/// Per-tile grades of a rater session
#[derive(Debug, Clone, PartialEq)]
pub struct RaterReport {
    /// Tolerance applied
    pub tolerance: f32,
    /// Tiles the rater intended to serve
    pub expected_tiles: usize,
    /// Outcome per committed tile
    pub outcomes: Vec<TileOutcome>,
    /// Engine counters at report time
    pub stats: RunStats,
}

impl RaterReport {
    /// Number of tiles within tolerance
    #[must_use]
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    /// Every expected tile was committed and passed
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.outcomes.len() == self.expected_tiles && self.outcomes.iter().all(|o| o.passed)
    }
}

impl fmt::Display for RaterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            writeln!(
                f,
                "tile {:>3} {}x{} max_abs_error={:.6} {}",
                o.index,
                o.shape.0,
                o.shape.1,
                o.max_abs_error,
                if o.passed { "PASS" } else { "FAIL" }
            )?;
        }
        writeln!(
            f,
            "passed {}/{} (tolerance {})",
            self.passed(),
            self.expected_tiles,
            self.tolerance
        )?;
        write!(f, "{}", self.stats)
    }
}
