use marten_core::{Error, Result};

/// Sparse connection table for convolutions: a list of
/// (input map, output map) pairs naming which input feature maps feed which
/// output feature maps. A full table is a dense convolution; anything
/// sparser gives grouped/partial connectivity.
#[derive(Debug, Clone)]
pub struct Table {
    pairs: Vec<(usize, usize)>,
}

impl Table {
    /// Build from explicit pairs.
    pub fn from_pairs(pairs: Vec<(usize, usize)>) -> Self {
        Table { pairs }
    }

    /// Dense table: every input map feeds every output map.
    pub fn full(inputs: usize, outputs: usize) -> Self {
        let mut pairs = Vec::with_capacity(inputs * outputs);
        for o in 0..outputs {
            for i in 0..inputs {
                pairs.push((i, o));
            }
        }
        Table { pairs }
    }

    /// Diagonal table: map i feeds map i.
    pub fn one2one(n: usize) -> Self {
        Table {
            pairs: (0..n).map(|i| (i, i)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Largest input map index referenced.
    pub fn max_in(&self) -> usize {
        self.pairs.iter().map(|&(i, _)| i).max().unwrap_or(0)
    }

    /// Largest output map index referenced.
    pub fn max_out(&self) -> usize {
        self.pairs.iter().map(|&(_, o)| o).max().unwrap_or(0)
    }

    /// Number of output maps (max index + 1).
    pub fn out_maps(&self) -> usize {
        if self.pairs.is_empty() {
            0
        } else {
            self.max_out() + 1
        }
    }

    /// How many table entries feed the given output map (its fan-in in
    /// maps; multiply by the kernel area for the unit fan-in).
    pub fn in_degree(&self, out_map: usize) -> usize {
        self.pairs.iter().filter(|&&(_, o)| o == out_map).count()
    }

    /// Validate every input index against the actual input map count.
    pub fn check_inputs(&self, in_maps: usize) -> Result<()> {
        for &(i, _) in &self.pairs {
            if i >= in_maps {
                return Err(Error::TableOutOfRange {
                    kind: "input",
                    index: i,
                    count: in_maps,
                });
            }
        }
        Ok(())
    }
}
