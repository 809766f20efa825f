use crate::estimate::FmError;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Sparse feature matrix in compressed-column layout.
///
/// Column access is what both the sampler (one coordinate per column) and
/// the scoring formula (accumulate per column into row buffers) need, so no
/// row-major copy is kept.
#[derive(Clone)]
pub struct FeatureMatrix {
    matrix: SparseColMat<usize, f64>,
}

impl FeatureMatrix {
    fn new(matrix: SparseColMat<usize, f64>) -> Self {
        Self { matrix }
    }

    /// Builds from `(row, col, value)` entries. Duplicate coordinates are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        entries: &[(usize, usize, f64)],
    ) -> Result<Self, FmError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = entries
            .iter()
            .map(|&(row, col, value)| Triplet::new(row, col, value))
            .collect();
        Self::from_faer_triplets(nrows, ncols, &triplets)
    }

    fn from_faer_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[Triplet<usize, usize, f64>],
    ) -> Result<Self, FmError> {
        if let Some(bad) = triplets.iter().find(|t| t.row >= nrows || t.col >= ncols) {
            return Err(FmError::InvalidInput(format!(
                "entry ({}, {}) is outside a {}x{} matrix",
                bad.row, bad.col, nrows, ncols
            )));
        }
        if let Some(bad) = triplets.iter().find(|t| !t.val.is_finite()) {
            return Err(FmError::InvalidInput(format!(
                "entry ({}, {}) is not finite: {}",
                bad.row, bad.col, bad.val
            )));
        }
        let matrix = SparseColMat::try_new_from_triplets(nrows, ncols, triplets).map_err(|e| {
            FmError::InvalidInput(format!("failed to assemble sparse matrix: {e:?}"))
        })?;
        Ok(Self::new(matrix))
    }

    /// Converts a dense matrix, keeping only the nonzero entries.
    pub fn from_dense(dense: ArrayView2<'_, f64>) -> Result<Self, FmError> {
        let mut triplets = Vec::new();
        for ((row, col), &value) in dense.indexed_iter() {
            if value != 0.0 {
                triplets.push(Triplet::new(row, col, value));
            }
        }
        Self::from_faer_triplets(dense.nrows(), dense.ncols(), &triplets)
    }

    /// A matrix with the given shape and no stored entries.
    pub fn empty(nrows: usize, ncols: usize) -> Result<Self, FmError> {
        Self::from_faer_triplets(nrows, ncols, &[])
    }

    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn nnz(&self) -> usize {
        let (symbolic, _) = self.matrix.parts();
        symbolic.col_ptr()[self.matrix.ncols()]
    }

    /// Stored `(row, value)` pairs of one column.
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (symbolic, values) = self.matrix.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        (col_ptr[col]..col_ptr[col + 1]).map(move |idx| (row_idx[idx], values[idx]))
    }

    /// Every stored entry as `(row, col, value)`, column by column.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.ncols()).flat_map(move |col| self.column(col).map(move |(row, v)| (row, col, v)))
    }

    /// Copy with every stored value squared. Used by the self-interaction
    /// correction of the scoring formula.
    pub fn elementwise_square(&self) -> Result<Self, FmError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = self
            .entries()
            .map(|(row, col, v)| Triplet::new(row, col, v * v))
            .collect();
        Self::from_faer_triplets(self.nrows(), self.ncols(), &triplets)
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.nrows(), self.ncols()));
        for (row, col, v) in self.entries() {
            out[[row, col]] += v;
        }
        out
    }

    /// `X · v` for a vector of length `ncols`.
    pub fn dot_vector(&self, vector: ArrayView1<'_, f64>) -> Array1<f64> {
        debug_assert_eq!(vector.len(), self.ncols());
        let mut out = Array1::<f64>::zeros(self.nrows());
        for col in 0..self.ncols() {
            let x = vector[col];
            if x == 0.0 {
                continue;
            }
            for (row, v) in self.column(col) {
                out[row] += v * x;
            }
        }
        out
    }

    /// `X · M` for a dense matrix with `ncols` rows.
    pub fn dot_matrix(&self, dense: ArrayView2<'_, f64>) -> Array2<f64> {
        debug_assert_eq!(dense.nrows(), self.ncols());
        let k = dense.ncols();
        let mut out = Array2::<f64>::zeros((self.nrows(), k));
        for col in 0..self.ncols() {
            let coeffs = dense.row(col);
            for (row, v) in self.column(col) {
                for f in 0..k {
                    out[[row, f]] += v * coeffs[f];
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for FeatureMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureMatrix")
            .field("nrows", &self.nrows())
            .field("ncols", &self.ncols())
            .field("nnz", &self.nnz())
            .finish()
    }
}

/// A block of features shared by many rows.
///
/// Row `i` of the full design reads row `original_to_block[i]` of `data`.
/// Repeated user or item attributes are stored once instead of once per
/// observation.
#[derive(Clone, Debug)]
pub struct RelationBlock {
    original_to_block: Vec<usize>,
    data: FeatureMatrix,
}

impl RelationBlock {
    pub fn new(original_to_block: Vec<usize>, data: FeatureMatrix) -> Result<Self, FmError> {
        let block_size = data.nrows();
        if let Some((row, &target)) = original_to_block
            .iter()
            .enumerate()
            .find(|(_, target)| **target >= block_size)
        {
            return Err(FmError::InvalidInput(format!(
                "relation mapping at row {row} points to block row {target}, but the block has {block_size} rows"
            )));
        }
        Ok(Self {
            original_to_block,
            data,
        })
    }

    /// Number of rows this block maps from.
    pub fn mapper_size(&self) -> usize {
        self.original_to_block.len()
    }

    /// Number of distinct rows stored in the block.
    pub fn block_size(&self) -> usize {
        self.data.nrows()
    }

    /// Column width this block contributes to the flattened design.
    pub fn feature_size(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &FeatureMatrix {
        &self.data
    }

    /// For each block row, the original rows that read it.
    fn inverse_mapping(&self) -> Vec<Vec<usize>> {
        let mut inverse = vec![Vec::new(); self.block_size()];
        for (row, &target) in self.original_to_block.iter().enumerate() {
            inverse[target].push(row);
        }
        inverse
    }
}

/// Materializes `[X | B_1[map_1] | ... | B_m[map_m]]`.
///
/// Callers are expected to have checked that every block maps exactly
/// `x.nrows()` rows; a mismatch is reported rather than truncated.
pub fn flatten(x: &FeatureMatrix, relations: &[RelationBlock]) -> Result<FeatureMatrix, FmError> {
    if relations.is_empty() {
        return Ok(x.clone());
    }
    let nrows = x.nrows();
    let mut ncols = x.ncols();
    let mut triplets: Vec<Triplet<usize, usize, f64>> = x
        .entries()
        .map(|(row, col, v)| Triplet::new(row, col, v))
        .collect();

    for block in relations {
        if block.mapper_size() != nrows {
            return Err(FmError::RowCountMismatch {
                context: "relation block mapping",
                expected: nrows,
                found: block.mapper_size(),
            });
        }
        let inverse = block.inverse_mapping();
        for (block_row, block_col, v) in block.data().entries() {
            for &row in &inverse[block_row] {
                triplets.push(Triplet::new(row, ncols + block_col, v));
            }
        }
        ncols += block.feature_size();
    }

    FeatureMatrix::from_faer_triplets(nrows, ncols, &triplets)
}
