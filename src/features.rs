//! Validation and assembly of the training feature space.
//!
//! The explicit matrix `X` and any relational blocks are checked against each
//! other and against the target length before anything reaches the sampler.

use crate::estimate::FmError;
use crate::matrix::{FeatureMatrix, RelationBlock};

/// A validated feature source ready for configuration and sampling.
#[derive(Clone, Debug)]
pub struct AssembledFeatures {
    /// The explicit columns. A zero-column placeholder when only relational
    /// blocks were supplied.
    pub x: FeatureMatrix,
    pub relations: Vec<RelationBlock>,
    /// `x.ncols()` plus the width of every relational block.
    pub flattened_dim: usize,
}

impl AssembledFeatures {
    pub fn n_rows(&self) -> usize {
        self.x.nrows()
    }

    /// Number of explicit, non-relational columns.
    pub fn n_explicit_columns(&self) -> usize {
        self.x.ncols()
    }
}

/// Common row-mapping domain of the relational blocks, if any were given.
fn shared_mapper_size(relations: &[RelationBlock]) -> Result<Option<usize>, FmError> {
    let Some(first) = relations.first() else {
        return Ok(None);
    };
    let mut sizes: Vec<usize> = relations.iter().map(RelationBlock::mapper_size).collect();
    sizes.sort_unstable();
    sizes.dedup();
    if sizes.len() > 1 {
        return Err(FmError::RelationDomainMismatch { sizes });
    }
    Ok(Some(first.mapper_size()))
}

/// Checks `x` and `relations` against each other and against `n_targets`.
pub fn assemble(
    x: Option<&FeatureMatrix>,
    relations: &[RelationBlock],
    n_targets: usize,
) -> Result<AssembledFeatures, FmError> {
    let mapper_size = shared_mapper_size(relations)?;

    let x = match (x, mapper_size) {
        (None, None) => return Err(FmError::MissingFeatureSource),
        (None, Some(rows)) => FeatureMatrix::empty(rows, 0)?,
        (Some(x), Some(rows)) if x.nrows() != rows => {
            return Err(FmError::RowCountMismatch {
                context: "X and relational blocks",
                expected: rows,
                found: x.nrows(),
            });
        }
        (Some(x), _) => x.clone(),
    };

    if x.nrows() != n_targets {
        return Err(FmError::RowCountMismatch {
            context: "feature rows and target length",
            expected: n_targets,
            found: x.nrows(),
        });
    }

    let flattened_dim = x.ncols() + relations.iter().map(RelationBlock::feature_size).sum::<usize>();
    log::debug!(
        "assembled {} rows: {} explicit columns, {} relational blocks, {} flattened columns",
        x.nrows(),
        x.ncols(),
        relations.len(),
        flattened_dim
    );

    Ok(AssembledFeatures {
        x,
        relations: relations.to_vec(),
        flattened_dim,
    })
}

#[cfg(test)]
mod tests {
    use super::assemble;
    use crate::estimate::FmError;
    use crate::matrix::{FeatureMatrix, RelationBlock};

    fn block(mapping: Vec<usize>, cols: usize) -> RelationBlock {
        let rows = mapping.iter().copied().max().map_or(1, |m| m + 1);
        let data = FeatureMatrix::from_triplets(rows, cols, &[(0, 0, 1.0)]).unwrap();
        RelationBlock::new(mapping, data).unwrap()
    }

    #[test]
    fn missing_feature_source_is_fatal() {
        let err = assemble(None, &[], 3).unwrap_err();
        assert!(matches!(err, FmError::MissingFeatureSource));
    }

    #[test]
    fn relational_only_input_gets_empty_placeholder() {
        let rels = vec![block(vec![0, 1, 0], 2), block(vec![1, 1, 0], 3)];
        let assembled = assemble(None, &rels, 3).unwrap();
        assert_eq!(assembled.n_rows(), 3);
        assert_eq!(assembled.n_explicit_columns(), 0);
        assert_eq!(assembled.flattened_dim, 5);
    }

    #[test]
    fn disagreeing_mapper_sizes_are_fatal() {
        let rels = vec![block(vec![0, 1, 0], 2), block(vec![0, 1], 2)];
        let err = assemble(None, &rels, 3).unwrap_err();
        assert!(matches!(err, FmError::RelationDomainMismatch { .. }));
    }

    #[test]
    fn x_and_blocks_must_share_row_count() {
        let x = FeatureMatrix::empty(4, 2).unwrap();
        let rels = vec![block(vec![0, 1, 0], 2)];
        let err = assemble(Some(&x), &rels, 4).unwrap_err();
        assert!(matches!(err, FmError::RowCountMismatch { expected: 3, found: 4, .. }));
    }

    #[test]
    fn rows_must_match_targets() {
        let x = FeatureMatrix::empty(4, 2).unwrap();
        let err = assemble(Some(&x), &[], 5).unwrap_err();
        assert!(matches!(err, FmError::RowCountMismatch { expected: 5, found: 4, .. }));
    }

    #[test]
    fn flattened_dim_sums_all_sources() {
        let x = FeatureMatrix::empty(3, 4).unwrap();
        let rels = vec![block(vec![0, 1, 0], 2), block(vec![2, 1, 0], 6)];
        let assembled = assemble(Some(&x), &rels, 3).unwrap();
        assert_eq!(assembled.flattened_dim, 12);
    }
}
