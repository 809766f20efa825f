use crate::sampler::PosteriorDraws;
use crate::types::{FmSample, HyperSample};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fmt;

/// Kept posterior draws of one successful fit. Frozen once built; a refit
/// replaces the whole store.
#[derive(Debug, Clone)]
pub struct PosteriorStore {
    fms: Vec<FmSample>,
    hypers: Vec<HyperSample>,
    rank: usize,
    n_groups: usize,
}

impl PosteriorStore {
    pub(crate) fn new(draws: PosteriorDraws, rank: usize, n_groups: usize) -> Self {
        Self {
            fms: draws.fms,
            hypers: draws.hypers,
            rank,
            n_groups,
        }
    }

    pub fn fm_samples(&self) -> &[FmSample] {
        &self.fms
    }

    pub fn hyper_samples(&self) -> &[HyperSample] {
        &self.hypers
    }

    pub fn len(&self) -> usize {
        self.fms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fms.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    /// One row per kept draw, in sampling order.
    pub fn hyper_trace(&self) -> HyperTrace {
        let columns = trace_columns(self.n_groups, self.rank);
        let mut values = Array2::<f64>::zeros((self.hypers.len(), columns.len()));
        for (row, hyper) in self.hypers.iter().enumerate() {
            let flat = std::iter::once(hyper.alpha)
                .chain(hyper.mu_w.iter().copied())
                .chain(hyper.lambda_w.iter().copied())
                .chain(hyper.mu_V.iter().copied())
                .chain(hyper.lambda_V.iter().copied());
            for (col, value) in flat.enumerate() {
                values[[row, col]] = value;
            }
        }
        HyperTrace { columns, values }
    }
}

/// `alpha`, `mu_w[g]`, `lambda_w[g]`, `mu_V[g,r]`, `lambda_V[g,r]`, with the
/// factor index varying fastest.
pub fn trace_columns(n_groups: usize, rank: usize) -> Vec<String> {
    let mut columns = Vec::with_capacity(1 + 2 * n_groups + 2 * n_groups * rank);
    columns.push("alpha".to_string());
    columns.extend((0..n_groups).map(|g| format!("mu_w[{g}]")));
    columns.extend((0..n_groups).map(|g| format!("lambda_w[{g}]")));
    for name in ["mu_V", "lambda_V"] {
        for g in 0..n_groups {
            columns.extend((0..rank).map(|r| format!("{name}[{g},{r}]")));
        }
    }
    columns
}

/// Hyperparameter draws flattened into labelled columns.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperTrace {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl HyperTrace {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Draws x columns.
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, name: &str) -> Option<ndarray::ArrayView1<'_, f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.values.column(idx))
    }

    /// The same rows keyed by column name.
    pub fn records(&self) -> Vec<BTreeMap<String, f64>> {
        self.values
            .rows()
            .into_iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().copied())
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for HyperTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        let mut header = Row::new();
        header.add_cell(Cell::new("draw"));
        for name in &self.columns {
            header.add_cell(Cell::new(name));
        }
        table.set_header(header);
        for (i, row) in self.values.rows().into_iter().enumerate() {
            let mut cells = Row::new();
            cells.add_cell(Cell::new(i));
            for value in row {
                cells.add_cell(Cell::new(format!("{value:.4}")));
            }
            table.add_row(cells);
        }
        write!(f, "{table}")
    }
}

/// The two views a caller can request of a trace.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceView {
    Table(HyperTrace),
    Records(Vec<BTreeMap<String, f64>>),
}
