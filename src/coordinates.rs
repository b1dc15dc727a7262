pub mod axis;
pub mod set;

pub use axis::{Axis, AxisName, AxisValues, Boundary, Coord, Offset, Step, TimeUnit, parse_time};
pub use set::{CoordinateSet, Dimension};

/// Positions selected from a 1-D axis, relative to the axis it was computed
/// from. Monotonic selections stay contiguous (possibly strided); unordered
/// selections fall back to explicit indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSel {
    Slice { start: usize, end: usize, step: usize },
    Indices(Vec<usize>),
}

impl IndexSel {
    pub fn full(len: usize) -> IndexSel {
        IndexSel::Slice { start: 0, end: len, step: 1 }
    }

    pub fn empty() -> IndexSel {
        IndexSel::Slice { start: 0, end: 0, step: 1 }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexSel::Slice { start, end, step } => {
                if end <= start {
                    0
                } else {
                    (end - start - 1) / step + 1
                }
            }
            IndexSel::Indices(ix) => ix.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            IndexSel::Slice { start, end, step } => Box::new((*start..*end).step_by(*step)),
            IndexSel::Indices(ix) => Box::new(ix.iter().copied()),
        }
    }

    /// Widens the stride by `factor`, keeping the same starting position.
    pub fn strided(&self, factor: usize) -> IndexSel {
        let factor = factor.max(1);
        match self {
            IndexSel::Slice { start, end, step } => {
                IndexSel::Slice { start: *start, end: *end, step: step * factor }
            }
            IndexSel::Indices(ix) => {
                IndexSel::Indices(ix.iter().copied().step_by(factor).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_len_and_iter() {
        let sel = IndexSel::Slice { start: 2, end: 9, step: 3 };
        assert_eq!(sel.len(), 3);
        assert_eq!(sel.iter().collect::<Vec<_>>(), vec![2, 5, 8]);

        assert_eq!(IndexSel::empty().len(), 0);
        assert!(IndexSel::empty().is_empty());
        assert_eq!(IndexSel::full(4).iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn strided() {
        let sel = IndexSel::full(6).strided(2);
        assert_eq!(sel.iter().collect::<Vec<_>>(), vec![0, 2, 4]);

        let sel = IndexSel::Indices(vec![1, 4, 5, 7]).strided(2);
        assert_eq!(sel.iter().collect::<Vec<_>>(), vec![1, 5]);
    }
}
