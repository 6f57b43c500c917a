use accurate::{sum::Klein, traits::*};
use serde::{Deserialize, Serialize};

use crate::{
    utils::{get_bin_index, validate_edges, HistKind},
    TauFitError, TauFitResult,
};

const EDGE_TOLERANCE: f64 = 1e-9;

fn same_edges(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| (x - y).abs() <= EDGE_TOLERANCE * x.abs().max(y.abs()).max(1.0))
}

fn klein_sum<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> f64 {
    values
        .into_iter()
        .copied()
        .sum_with_accumulator::<Klein<f64>>()
}

/// The recipe for a 1D histogram, built without touching event data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistModel {
    /// Histogram name
    pub name: String,
    /// Histogram title
    pub title: String,
    /// Bin edges
    pub edges: Vec<f64>,
}

/// The recipe for a 2D histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistModel2D {
    /// Histogram name
    pub name: String,
    /// Histogram title
    pub title: String,
    /// Bin edges along `x`
    pub xedges: Vec<f64>,
    /// Bin edges along `y`
    pub yedges: Vec<f64>,
}

/// A weighted one-dimensional histogram with under- and overflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hist1D {
    /// Histogram name
    pub name: String,
    /// Histogram title
    pub title: String,
    edges: Vec<f64>,
    contents: Vec<f64>,
    sumw2: Vec<f64>,
    underflow: f64,
    overflow: f64,
    entries: usize,
}

impl Hist1D {
    /// Create an empty histogram, checking the edges.
    pub fn new<N: Into<String>, T: Into<String>>(
        name: N,
        title: T,
        edges: Vec<f64>,
    ) -> TauFitResult<Self> {
        let name = name.into();
        validate_edges(&name, &edges)?;
        let nbins = edges.len() - 1;
        Ok(Self {
            name,
            title: title.into(),
            edges,
            contents: vec![0.0; nbins],
            sumw2: vec![0.0; nbins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        })
    }

    /// Create an empty histogram from a model.
    pub fn from_model(model: &HistModel) -> TauFitResult<Self> {
        Self::new(model.name.clone(), model.title.clone(), model.edges.clone())
    }

    /// Build a histogram from bin contents; errors are taken as `sqrt(|content|)`.
    pub fn from_contents<N: Into<String>>(
        name: N,
        edges: Vec<f64>,
        contents: Vec<f64>,
    ) -> TauFitResult<Self> {
        let mut hist = Self::new(name, "", edges)?;
        if contents.len() != hist.nbins() {
            return Err(TauFitError::LengthMismatch {
                context: format!("Contents of histogram '{}'", hist.name),
                expected: hist.nbins(),
                actual: contents.len(),
            });
        }
        hist.sumw2 = contents.iter().map(|c| c.abs()).collect();
        hist.contents = contents;
        Ok(hist)
    }

    /// Number of bins.
    pub fn nbins(&self) -> usize {
        self.contents.len()
    }

    /// Bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin contents (without flow bins).
    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    /// Content of bin `i` (zero-based).
    pub fn bin_content(&self, i: usize) -> f64 {
        self.contents.get(i).copied().unwrap_or(0.0)
    }

    /// Error of bin `i` (zero-based).
    pub fn bin_error(&self, i: usize) -> f64 {
        self.sumw2.get(i).map_or(0.0, |w2| w2.sqrt())
    }

    /// Sum of squared weights of bin `i`.
    pub fn bin_sumw2(&self, i: usize) -> f64 {
        self.sumw2.get(i).copied().unwrap_or(0.0)
    }

    /// Set the content and error of bin `i`.
    pub fn set_bin(&mut self, i: usize, content: f64, error: f64) {
        if i < self.nbins() {
            self.contents[i] = content;
            self.sumw2[i] = error * error;
        }
    }

    /// Underflow content.
    pub fn underflow(&self) -> f64 {
        self.underflow
    }

    /// Overflow content.
    pub fn overflow(&self) -> f64 {
        self.overflow
    }

    /// Number of fill calls.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Index of the bin containing `x`.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        get_bin_index(x, &self.edges)
    }

    /// Fill one value with a weight.
    pub fn fill(&mut self, x: f64, weight: f64) {
        self.entries += 1;
        match self.find_bin(x) {
            Some(i) => {
                self.contents[i] += weight;
                self.sumw2[i] += weight * weight;
            }
            None if x < self.edges[0] => self.underflow += weight,
            None if !x.is_nan() => self.overflow += weight,
            None => {}
        }
    }

    /// Sum of the in-range bin contents.
    pub fn integral(&self) -> f64 {
        klein_sum(&self.contents)
    }

    /// Sum of all contents including under- and overflow.
    pub fn integral_with_flow(&self) -> f64 {
        self.integral() + self.underflow + self.overflow
    }

    /// Statistical error on the in-range integral.
    pub fn integral_error(&self) -> f64 {
        klein_sum(&self.sumw2).sqrt()
    }

    /// Returns `true` if both histograms have the same binning.
    pub fn is_compatible(&self, other: &Hist1D) -> bool {
        same_edges(&self.edges, &other.edges)
    }

    fn check_compatible(&self, other: &Hist1D) -> TauFitResult<()> {
        if self.is_compatible(other) {
            Ok(())
        } else {
            Err(TauFitError::BinningError {
                name: self.name.clone(),
                reason: format!("cannot combine with '{}' (different edges)", other.name),
            })
        }
    }

    /// Add `factor * other` bin by bin.
    pub fn add_scaled(&mut self, other: &Hist1D, factor: f64) -> TauFitResult<()> {
        self.check_compatible(other)?;
        for i in 0..self.nbins() {
            self.contents[i] += factor * other.contents[i];
            self.sumw2[i] += factor * factor * other.sumw2[i];
        }
        self.underflow += factor * other.underflow;
        self.overflow += factor * other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    /// Add another histogram bin by bin.
    pub fn add(&mut self, other: &Hist1D) -> TauFitResult<()> {
        self.add_scaled(other, 1.0)
    }

    /// Subtract another histogram bin by bin (errors add in quadrature).
    pub fn subtract(&mut self, other: &Hist1D) -> TauFitResult<()> {
        self.add_scaled(other, -1.0)
    }

    /// Multiply contents by `factor` (squared weights by `factor^2`).
    pub fn scale(&mut self, factor: f64) {
        for (content, w2) in self.contents.iter_mut().zip(self.sumw2.iter_mut()) {
            *content *= factor;
            *w2 *= factor * factor;
        }
        self.underflow *= factor;
        self.overflow *= factor;
    }

    /// Set negative bins to zero with the given error, returning how many bins were negative.
    pub fn clip_negative(&mut self, error: f64) -> usize {
        let mut nneg = 0;
        for (content, w2) in self.contents.iter_mut().zip(self.sumw2.iter_mut()) {
            if *content < 0.0 {
                *content = 0.0;
                *w2 = error * error;
                nneg += 1;
            }
        }
        nneg
    }

    /// Zero all contents.
    pub fn reset(&mut self) {
        self.contents.iter_mut().for_each(|c| *c = 0.0);
        self.sumw2.iter_mut().for_each(|c| *c = 0.0);
        self.underflow = 0.0;
        self.overflow = 0.0;
        self.entries = 0;
    }

    /// Return a copy with a new name and title.
    pub fn renamed<N: Into<String>, T: Into<String>>(&self, name: N, title: T) -> Self {
        let mut hist = self.clone();
        hist.name = name.into();
        hist.title = title.into();
        hist
    }
}

/// A weighted two-dimensional histogram. Out-of-range fills are summed into a single flow value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hist2D {
    /// Histogram name
    pub name: String,
    /// Histogram title
    pub title: String,
    xedges: Vec<f64>,
    yedges: Vec<f64>,
    contents: Vec<f64>,
    sumw2: Vec<f64>,
    flow: f64,
    entries: usize,
}

impl Hist2D {
    /// Create an empty histogram from a model.
    pub fn from_model(model: &HistModel2D) -> TauFitResult<Self> {
        validate_edges(&model.name, &model.xedges)?;
        validate_edges(&model.name, &model.yedges)?;
        let n = (model.xedges.len() - 1) * (model.yedges.len() - 1);
        Ok(Self {
            name: model.name.clone(),
            title: model.title.clone(),
            xedges: model.xedges.clone(),
            yedges: model.yedges.clone(),
            contents: vec![0.0; n],
            sumw2: vec![0.0; n],
            flow: 0.0,
            entries: 0,
        })
    }

    /// Number of bins along `x` and `y`.
    pub fn nbins(&self) -> (usize, usize) {
        (self.xedges.len() - 1, self.yedges.len() - 1)
    }

    /// Content of bin `(ix, iy)`.
    pub fn bin_content(&self, ix: usize, iy: usize) -> f64 {
        let (nx, ny) = self.nbins();
        if ix < nx && iy < ny {
            self.contents[ix * ny + iy]
        } else {
            0.0
        }
    }

    /// Fill one `(x, y)` pair with a weight.
    pub fn fill(&mut self, x: f64, y: f64, weight: f64) {
        self.entries += 1;
        let ny = self.nbins().1;
        match (get_bin_index(x, &self.xedges), get_bin_index(y, &self.yedges)) {
            (Some(ix), Some(iy)) => {
                self.contents[ix * ny + iy] += weight;
                self.sumw2[ix * ny + iy] += weight * weight;
            }
            _ => self.flow += weight,
        }
    }

    /// Sum of the in-range bin contents.
    pub fn integral(&self) -> f64 {
        klein_sum(&self.contents)
    }

    /// Number of fill calls.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Add another histogram bin by bin.
    pub fn add(&mut self, other: &Hist2D) -> TauFitResult<()> {
        if !(same_edges(&self.xedges, &other.xedges) && same_edges(&self.yedges, &other.yedges)) {
            return Err(TauFitError::BinningError {
                name: self.name.clone(),
                reason: format!("cannot combine with '{}' (different edges)", other.name),
            });
        }
        for (i, (content, w2)) in other.contents.iter().zip(&other.sumw2).enumerate() {
            self.contents[i] += content;
            self.sumw2[i] += w2;
        }
        self.flow += other.flow;
        self.entries += other.entries;
        Ok(())
    }

    /// Multiply contents by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for (content, w2) in self.contents.iter_mut().zip(self.sumw2.iter_mut()) {
            *content *= factor;
            *w2 *= factor * factor;
        }
        self.flow *= factor;
    }
}

/// A weighted mean together with the sum of weights it was computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanResult {
    /// Weighted mean
    pub mean: f64,
    /// Sum of weights
    pub sumw: f64,
}

impl MeanResult {
    /// Combine means, weighting each by its sum of weights.
    pub fn combine<'a, I: IntoIterator<Item = &'a MeanResult>>(results: I) -> MeanResult {
        let (mut sumw, mut sum) = (0.0, 0.0);
        for result in results {
            sumw += result.sumw;
            sum += result.mean * result.sumw;
        }
        let mean = if sumw != 0.0 { sum / sumw } else { 0.0 };
        MeanResult { mean, sumw }
    }
}

/// The evaluated value of one booking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistResult {
    /// A 1D histogram
    Hist1D(Hist1D),
    /// A 2D histogram
    Hist2D(Hist2D),
    /// A weighted mean
    Mean(MeanResult),
    /// A sum of weights
    SumWeights(f64),
}

impl HistResult {
    /// The kind of result.
    pub fn kind(&self) -> HistKind {
        match self {
            HistResult::Hist1D(_) => HistKind::Hist1D,
            HistResult::Hist2D(_) => HistKind::Hist2D,
            HistResult::Mean(_) => HistKind::Mean,
            HistResult::SumWeights(_) => HistKind::SumWeights,
        }
    }

    /// The 1D histogram, if this is one.
    pub fn as_hist1d(&self) -> Option<&Hist1D> {
        match self {
            HistResult::Hist1D(hist) => Some(hist),
            _ => None,
        }
    }

    /// The 1D histogram, if this is one.
    pub fn into_hist1d(self) -> Option<Hist1D> {
        match self {
            HistResult::Hist1D(hist) => Some(hist),
            _ => None,
        }
    }

    /// The 2D histogram, if this is one.
    pub fn as_hist2d(&self) -> Option<&Hist2D> {
        match self {
            HistResult::Hist2D(hist) => Some(hist),
            _ => None,
        }
    }

    /// Integral of a histogram, or the sum of weights for the other kinds.
    pub fn integral(&self) -> f64 {
        match self {
            HistResult::Hist1D(hist) => hist.integral(),
            HistResult::Hist2D(hist) => hist.integral(),
            HistResult::Mean(mean) => mean.sumw,
            HistResult::SumWeights(sumw) => *sumw,
        }
    }

    /// Multiply by a constant (a mean only has its weight scaled).
    pub fn scale(&mut self, factor: f64) {
        match self {
            HistResult::Hist1D(hist) => hist.scale(factor),
            HistResult::Hist2D(hist) => hist.scale(factor),
            HistResult::Mean(mean) => mean.sumw *= factor,
            HistResult::SumWeights(sumw) => *sumw *= factor,
        }
    }

    /// Sum results of the same kind: histograms are added, means combined with their weights.
    pub fn sum<'a, I: IntoIterator<Item = &'a HistResult>>(
        results: I,
        name: &str,
        title: &str,
    ) -> TauFitResult<HistResult> {
        let mut iter = results.into_iter();
        let first = iter.next().ok_or_else(|| {
            TauFitError::Custom(format!("Cannot merge an empty list of results into '{name}'"))
        })?;
        let mismatch = |other: &HistResult| TauFitError::Custom(format!(
            "Cannot merge a {} result with a {} result into '{name}'",
            first.kind(),
            other.kind()
        ));
        match first {
            HistResult::Hist1D(hist) => {
                let mut total = hist.renamed(name, title);
                for other in iter {
                    total.add(other.as_hist1d().ok_or_else(|| mismatch(other))?)?;
                }
                Ok(HistResult::Hist1D(total))
            }
            HistResult::Hist2D(hist) => {
                let mut total = hist.clone();
                total.name = name.to_string();
                total.title = title.to_string();
                for other in iter {
                    total.add(other.as_hist2d().ok_or_else(|| mismatch(other))?)?;
                }
                Ok(HistResult::Hist2D(total))
            }
            HistResult::Mean(mean) => {
                let mut means = vec![*mean];
                for other in iter {
                    match other {
                        HistResult::Mean(other) => means.push(*other),
                        _ => return Err(mismatch(other)),
                    }
                }
                Ok(HistResult::Mean(MeanResult::combine(&means)))
            }
            HistResult::SumWeights(sumw) => {
                let mut total = *sumw;
                for other in iter {
                    match other {
                        HistResult::SumWeights(other) => total += other,
                        _ => return Err(mismatch(other)),
                    }
                }
                Ok(HistResult::SumWeights(total))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn hist() -> Hist1D {
        Hist1D::new("h", "title", vec![0.0, 1.0, 2.0, 4.0]).unwrap()
    }

    #[test]
    fn test_fill_and_flow() {
        let mut h = hist();
        h.fill(0.5, 2.0);
        h.fill(0.5, 1.0);
        h.fill(3.9, 1.5);
        h.fill(-1.0, 1.0);
        h.fill(4.0, 0.5);
        assert_eq!(h.contents(), &[3.0, 0.0, 1.5]);
        assert_relative_eq!(h.bin_error(0), 5.0_f64.sqrt());
        assert_eq!(h.underflow(), 1.0);
        assert_eq!(h.overflow(), 0.5);
        assert_eq!(h.entries(), 5);
        assert_relative_eq!(h.integral(), 4.5);
        assert_relative_eq!(h.integral_with_flow(), 6.0);
    }

    #[test]
    fn test_invalid_edges() {
        assert!(matches!(
            Hist1D::new("h", "", vec![0.0, 2.0, 1.0]),
            Err(TauFitError::BinningError { .. })
        ));
    }

    #[test]
    fn test_add_subtract_scale() {
        let mut a = hist();
        let mut b = hist();
        a.fill(0.5, 2.0);
        b.fill(0.5, 1.0);
        b.fill(1.5, 1.0);
        a.subtract(&b).unwrap();
        assert_eq!(a.contents(), &[1.0, -1.0, 0.0]);
        assert_relative_eq!(a.bin_sumw2(0), 5.0);
        a.scale(2.0);
        assert_eq!(a.contents(), &[2.0, -2.0, 0.0]);
        assert_relative_eq!(a.bin_sumw2(0), 20.0);
        let other = Hist1D::new("o", "", vec![0.0, 1.0]).unwrap();
        assert!(a.add(&other).is_err());
    }

    #[test]
    fn test_clip_negative() {
        let mut h = Hist1D::from_contents("h", vec![0.0, 1.0, 2.0, 3.0], vec![2.0, -1.0, -0.5])
            .unwrap();
        assert_eq!(h.clip_negative(1.0), 2);
        assert_eq!(h.contents(), &[2.0, 0.0, 0.0]);
        assert_relative_eq!(h.bin_error(1), 1.0);
    }

    #[test]
    fn test_hist2d() {
        let model = HistModel2D {
            name: "h2".to_string(),
            title: "".to_string(),
            xedges: vec![0.0, 1.0, 2.0],
            yedges: vec![0.0, 10.0],
        };
        let mut h = Hist2D::from_model(&model).unwrap();
        h.fill(1.5, 5.0, 2.0);
        h.fill(1.5, 15.0, 1.0);
        assert_eq!(h.bin_content(1, 0), 2.0);
        assert_eq!(h.integral(), 2.0);
        let copy = h.clone();
        h.add(&copy).unwrap();
        assert_eq!(h.bin_content(1, 0), 4.0);
    }

    #[test]
    fn test_mean_combination() {
        let combined = MeanResult::combine(&[
            MeanResult {
                mean: 1.0,
                sumw: 1.0,
            },
            MeanResult {
                mean: 4.0,
                sumw: 2.0,
            },
        ]);
        assert_relative_eq!(combined.mean, 3.0);
        assert_relative_eq!(combined.sumw, 3.0);
    }

    #[test]
    fn test_result_sum() {
        let mut a = hist();
        a.fill(0.5, 1.0);
        let mut b = hist();
        b.fill(1.5, 2.0);
        let total = HistResult::sum(
            &[HistResult::Hist1D(a), HistResult::Hist1D(b)],
            "total",
            "Total",
        )
        .unwrap();
        let total = total.into_hist1d().unwrap();
        assert_eq!(total.name, "total");
        assert_eq!(total.contents(), &[1.0, 2.0, 0.0]);
        assert!(HistResult::sum(
            &[HistResult::SumWeights(1.0), HistResult::Mean(MeanResult::default())],
            "x",
            ""
        )
        .is_err());
    }
}
