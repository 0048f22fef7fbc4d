use ndarray::{Array2, ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};

/// Minimum connected-component sizes (pixels) and dilation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SieveSizes {
    pub water: usize,
    pub cloud: usize,
    pub shadow: usize,
    /// Side of the square all-ones structuring element
    pub dilation_size: usize,
}

impl Default for SieveSizes {
    fn default() -> Self {
        Self {
            water: 7,
            cloud: 10,
            shadow: 10,
            dilation_size: 5,
        }
    }
}

/// Connected components of a binary mask
#[derive(Debug, Clone)]
pub struct ComponentLabels {
    /// 0 = background, 1..=count = component id in raster scan order
    pub labels: Array2<u32>,
    /// Pixel count per label; index 0 is unused
    pub sizes: Vec<usize>,
}

impl ComponentLabels {
    pub fn count(&self) -> usize {
        self.sizes.len() - 1
    }
}

/// Union-find over provisional labels
struct DisjointSet {
    parent: Vec<u32>,
}

impl DisjointSet {
    fn new() -> Self {
        // label 0 is background and never merged
        Self { parent: vec![0] }
    }

    fn make_set(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        id
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge as usize] = keep;
        }
    }
}

/// Binary morphology on cloud, shadow and water masks
pub struct MorphologyProcessor {
    enable_parallel: bool,
    chunk_size: usize,
}

impl MorphologyProcessor {
    pub fn new(enable_parallel: bool, chunk_size: usize) -> Self {
        Self {
            enable_parallel,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn standard() -> Self {
        Self::new(true, 64)
    }

    /// Label 8-connected foreground components (two-pass union-find)
    pub fn label_components(&self, mask: &Array2<bool>) -> ComponentLabels {
        let (rows, cols) = mask.dim();
        let mut provisional = Array2::<u32>::zeros((rows, cols));
        let mut sets = DisjointSet::new();

        for i in 0..rows {
            for j in 0..cols {
                if !mask[[i, j]] {
                    continue;
                }

                // already-visited neighbours: W, NW, N, NE
                let mut neighbours = [0u32; 4];
                if j > 0 {
                    neighbours[0] = provisional[[i, j - 1]];
                }
                if i > 0 {
                    if j > 0 {
                        neighbours[1] = provisional[[i - 1, j - 1]];
                    }
                    neighbours[2] = provisional[[i - 1, j]];
                    if j + 1 < cols {
                        neighbours[3] = provisional[[i - 1, j + 1]];
                    }
                }

                let label = match neighbours.iter().copied().filter(|&l| l != 0).min() {
                    Some(min) => {
                        for &l in neighbours.iter().filter(|&&l| l != 0) {
                            sets.union(min, l);
                        }
                        min
                    }
                    None => sets.make_set(),
                };
                provisional[[i, j]] = label;
            }
        }

        // resolve roots and renumber in scan order
        let mut compact = vec![0u32; sets.parent.len()];
        let mut sizes = vec![0usize];
        let mut labels = provisional;
        for label in labels.iter_mut() {
            if *label == 0 {
                continue;
            }
            let root = sets.find(*label) as usize;
            if compact[root] == 0 {
                sizes.push(0);
                compact[root] = (sizes.len() - 1) as u32;
            }
            *label = compact[root];
            sizes[*label as usize] += 1;
        }

        ComponentLabels { labels, sizes }
    }

    /// Remove components with fewer than `min_size` pixels
    pub fn sieve(&self, mask: &Array2<bool>, min_size: usize) -> Array2<bool> {
        let components = self.label_components(mask);
        let keep: Vec<bool> = components.sizes.iter().map(|&n| n >= min_size).collect();

        let removed = components.sizes.iter().skip(1).filter(|&&n| n < min_size).count();
        log::debug!(
            "Sieve (min {} px): {} components, {} removed",
            min_size,
            components.count(),
            removed
        );

        components
            .labels
            .map(|&label| label != 0 && keep[label as usize])
    }

    /// Dilate with a `size`×`size` all-ones structuring element.
    ///
    /// Out-of-bounds neighbours count as background. The square element is
    /// separable, so a row pass followed by a column pass is exact.
    pub fn dilate(&self, mask: &Array2<bool>, size: usize) -> Array2<bool> {
        let radius = size / 2;
        if radius == 0 {
            return mask.clone();
        }

        let parallel = self.enable_parallel && mask.nrows() > self.chunk_size;

        let mut horizontal = Array2::from_elem(mask.dim(), false);
        let rows = Zip::from(horizontal.rows_mut()).and(mask.rows());
        if parallel {
            rows.par_for_each(|out, lane| dilate_lane(lane, out, radius));
        } else {
            rows.for_each(|out, lane| dilate_lane(lane, out, radius));
        }

        let mut dilated = Array2::from_elem(mask.dim(), false);
        let columns = Zip::from(dilated.columns_mut()).and(horizontal.columns());
        if parallel {
            columns.par_for_each(|out, lane| dilate_lane(lane, out, radius));
        } else {
            columns.for_each(|out, lane| dilate_lane(lane, out, radius));
        }

        dilated
    }

    /// Sieve, then dilate the surviving pixels
    pub fn clean(&self, mask: &Array2<bool>, min_size: usize, dilation_size: usize) -> Array2<bool> {
        let sieved = self.sieve(mask, min_size);
        self.dilate(&sieved, dilation_size)
    }
}

/// 1D running-window maximum over a boolean lane
fn dilate_lane(input: ArrayView1<bool>, mut output: ArrayViewMut1<bool>, radius: usize) {
    let n = input.len();
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0usize);
    for &v in input.iter() {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v as usize);
    }
    for j in 0..n {
        let lo = j.saturating_sub(radius);
        let hi = (j + radius + 1).min(n);
        output[j] = prefix[hi] > prefix[lo];
    }
}

/// Remove components smaller than `min_size`
pub fn sieve(mask: &Array2<bool>, min_size: usize) -> Array2<bool> {
    MorphologyProcessor::standard().sieve(mask, min_size)
}

/// 5×5 dilation
pub fn dilate(mask: &Array2<bool>) -> Array2<bool> {
    MorphologyProcessor::standard().dilate(mask, SieveSizes::default().dilation_size)
}
