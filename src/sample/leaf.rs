use std::{collections::HashMap, fmt::Debug, path::Path, sync::Arc};

use parking_lot::Mutex;

use crate::{
    data::{Cutflow, EventSource, ReadOptions},
    engine::{BookingRequest, BookingTarget, PlanCache},
    expression::{join_cuts, join_weights, undo_shift},
    results::{Axes, LazyResult},
    sample::{set::GetHistsOptions, Sample},
    selection::Selection,
    utils::{make_hist_name, HistKind},
    Expression, TauFitError, TauFitResult,
};

/// Default cutflow bin holding the number of processed events.
pub const DEFAULT_BIN_NEVENTS: usize = 1;
/// Default cutflow bin holding the sum of generator weights.
pub const DEFAULT_BIN_SUMWEIGHTS: usize = 15;
/// Relative change of the event counts above which a re-read file is reported.
const MAX_NEVENTS_CHANGE: f64 = 0.02;
/// Fraction of the expected number of events below which a sample is reported as incomplete.
const MIN_NEVENTS_FRACTION: f64 = 0.97;

/// A handle on the file a sample reads from. Shallow clones of a sample share the handle, so the
/// cutflow is read at most once per handle.
pub struct SampleFile {
    path: String,
    source: Arc<dyn EventSource>,
    cutflow: Mutex<Option<Option<Cutflow>>>,
}

impl SampleFile {
    /// Create a handle; nothing is read until the cutflow or events are requested.
    pub fn new<S: Into<String>>(path: S, source: Arc<dyn EventSource>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            source,
            cutflow: Mutex::new(None),
        })
    }

    /// The file name.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The source the file is read from.
    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    /// Returns `true` if the file can be opened.
    pub fn exists(&self) -> bool {
        self.source.exists(&self.path)
    }

    /// The cutflow, read on first use.
    pub fn cutflow(&self) -> TauFitResult<Option<Cutflow>> {
        let mut cached = self.cutflow.lock();
        if let Some(cutflow) = cached.as_ref() {
            return Ok(cutflow.clone());
        }
        log::debug!("SampleFile: reading cutflow from {}", self.path);
        let cutflow = self.source.cutflow(&self.path)?;
        *cached = Some(cutflow.clone());
        Ok(cutflow)
    }

    /// A fresh handle on the same file.
    pub fn reopen(&self) -> Arc<Self> {
        Self::new(self.path.clone(), self.source.clone())
    }
}

impl Debug for SampleFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SampleFile({})", self.path)
    }
}

/// A sample backed by a single file and tree.
#[derive(Clone, Debug)]
pub struct LeafSample {
    /// Short name used for histograms and files
    pub name: String,
    /// Title used in legends and tables
    pub title: String,
    /// Extra labels used for matching
    pub tags: Vec<String>,
    pub(crate) file: Arc<SampleFile>,
    /// Tree name, branch selections and aliases
    pub read: ReadOptions,
    /// Cross section in pb
    pub xsec: f64,
    /// Number of processed (unweighted) events
    pub nevents: f64,
    /// Sum of generator weights
    pub sumweights: f64,
    /// Number of events expected to have been processed
    pub nexpevts: f64,
    /// Cutflow bin holding `nevents` (one-based)
    pub binnevts: usize,
    /// Cutflow bin holding `sumweights` (one-based)
    pub binsumw: usize,
    /// Integrated luminosity
    pub lumi: f64,
    /// Normalization, `lumi*xsec*1000/sumweights` for simulation
    pub norm: f64,
    /// Multiplier applied on top of `norm`
    pub scale: f64,
    pub(crate) scale0: f64,
    /// Sample cuts
    pub cuts: Expression,
    /// Common weight
    pub weight: Expression,
    /// Sample-specific weight
    pub extraweight: Expression,
    /// Observed data
    pub isdata: bool,
    /// Expected background
    pub isexp: bool,
    /// Signal
    pub issignal: bool,
    /// Embedded sample (never normalized by cross section)
    pub isembed: bool,
    /// Fill colour
    pub fillcolor: Option<String>,
    /// Line colour
    pub linecolor: Option<String>,
    /// Logical subcomponents sharing this sample's file
    pub splits: Vec<Sample>,
}

/// Builder for a [`LeafSample`].
#[derive(Clone, Debug)]
pub struct LeafSampleBuilder {
    name: String,
    title: String,
    filename: String,
    xsec: f64,
    read: ReadOptions,
    nevents: f64,
    sumweights: Option<f64>,
    nexpevts: f64,
    binnevts: usize,
    binsumw: usize,
    lumi: f64,
    norm: Option<f64>,
    scale: f64,
    cuts: Expression,
    weight: Expression,
    extraweight: Expression,
    isdata: bool,
    issignal: bool,
    isembed: bool,
    isexp: Option<bool>,
    tags: Vec<String>,
    fillcolor: Option<String>,
    linecolor: Option<String>,
}

impl LeafSampleBuilder {
    /// Set the cross section in pb.
    pub fn xsec(mut self, xsec: f64) -> Self {
        self.xsec = xsec;
        self
    }

    /// Set the tree name.
    pub fn tree<S: Into<String>>(mut self, tree: S) -> Self {
        self.read = self.read.tree(tree);
        self
    }

    /// Set the read options (tree, branch selections, aliases).
    pub fn read_options(mut self, read: ReadOptions) -> Self {
        self.read = read;
        self
    }

    /// Register an alias on the tree.
    pub fn alias<S: Into<String>, E: Into<Expression>>(mut self, name: S, expression: E) -> Self {
        self.read = self.read.alias(name, expression);
        self
    }

    /// Number of events, used when the file has no cutflow.
    pub fn nevents(mut self, nevents: f64) -> Self {
        self.nevents = nevents;
        self
    }

    /// Sum of weights, used when the file has no cutflow.
    pub fn sumweights(mut self, sumweights: f64) -> Self {
        self.sumweights = Some(sumweights);
        self
    }

    /// Number of events expected to have been processed.
    pub fn nexpevts(mut self, nexpevts: f64) -> Self {
        self.nexpevts = nexpevts;
        self
    }

    /// Cutflow bins (one-based) holding the number of events and the sum of weights.
    pub fn cutflow_bins(mut self, binnevts: usize, binsumw: usize) -> Self {
        self.binnevts = binnevts;
        self.binsumw = binsumw;
        self
    }

    /// Set the integrated luminosity.
    pub fn lumi(mut self, lumi: f64) -> Self {
        self.lumi = lumi;
        self
    }

    /// Set the normalization explicitly; the cutflow is then not read.
    pub fn norm(mut self, norm: f64) -> Self {
        self.norm = Some(norm);
        self
    }

    /// Set the scale (and the baseline it is reset to).
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set the sample cuts.
    pub fn cuts<E: Into<Expression>>(mut self, cuts: E) -> Self {
        self.cuts = cuts.into();
        self
    }

    /// Set the common weight.
    pub fn weight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.weight = weight.into();
        self
    }

    /// Set the sample-specific weight.
    pub fn extraweight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.extraweight = weight.into();
        self
    }

    /// Mark the sample as observed data.
    pub fn data(mut self) -> Self {
        self.isdata = true;
        self
    }

    /// Mark the sample as signal.
    pub fn signal(mut self) -> Self {
        self.issignal = true;
        self
    }

    /// Mark the sample as embedded.
    pub fn embed(mut self) -> Self {
        self.isembed = true;
        self
    }

    /// Override the expected-background flag.
    pub fn exp(mut self, isexp: bool) -> Self {
        self.isexp = Some(isexp);
        self
    }

    /// Set the tags.
    pub fn tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the fill colour.
    pub fn color<S: Into<String>>(mut self, color: S) -> Self {
        self.fillcolor = Some(color.into());
        self
    }

    /// Set the line colour.
    pub fn line_color<S: Into<String>>(mut self, color: S) -> Self {
        self.linecolor = Some(color.into());
        self
    }

    /// Build the sample, reading the cutflow and computing the normalization.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist, or if it has no cutflow and no event count was given.
    pub fn build(self, source: Arc<dyn EventSource>) -> TauFitResult<LeafSample> {
        let file = SampleFile::new(self.filename, source);
        if !file.exists() {
            return Err(TauFitError::MissingFile {
                path: file.path().to_string(),
            });
        }
        let isexp = self
            .isexp
            .unwrap_or(self.isembed || !(self.isdata || self.issignal));
        let mut sample = LeafSample {
            name: self.name,
            title: self.title,
            tags: self.tags,
            file,
            read: self.read,
            xsec: self.xsec,
            nevents: self.nevents,
            sumweights: self.sumweights.unwrap_or(self.nevents),
            nexpevts: self.nexpevts,
            binnevts: self.binnevts,
            binsumw: self.binsumw,
            lumi: self.lumi,
            norm: self.norm.unwrap_or(1.0),
            scale: self.scale,
            scale0: self.scale,
            cuts: self.cuts,
            weight: self.weight,
            extraweight: self.extraweight,
            isdata: self.isdata,
            isexp,
            issignal: self.issignal,
            isembed: self.isembed,
            fillcolor: self.fillcolor,
            linecolor: self.linecolor,
            splits: Vec::new(),
        };
        if self.norm.is_none() {
            if sample.isdata {
                sample.setnevents()?;
            } else if !sample.isembed {
                sample.setnevents()?;
                sample.normalize();
            }
        }
        if 0.0 < sample.nevents && sample.nevents < sample.nexpevts * MIN_NEVENTS_FRACTION {
            log::warn!(
                "Sample '{}': significantly fewer events ({}) than expected ({})",
                sample.name,
                sample.nevents,
                sample.nexpevts
            );
        }
        Ok(sample)
    }
}

impl LeafSample {
    /// Start building a sample reading `filename`.
    pub fn builder<N: Into<String>, T: Into<String>, F: Into<String>>(
        name: N,
        title: T,
        filename: F,
    ) -> LeafSampleBuilder {
        LeafSampleBuilder {
            name: name.into(),
            title: title.into(),
            filename: filename.into(),
            xsec: -1.0,
            read: ReadOptions::new(),
            nevents: -1.0,
            sumweights: None,
            nexpevts: -1.0,
            binnevts: DEFAULT_BIN_NEVENTS,
            binsumw: DEFAULT_BIN_SUMWEIGHTS,
            lumi: 0.0,
            norm: None,
            scale: 1.0,
            cuts: Expression::empty(),
            weight: Expression::empty(),
            extraweight: Expression::empty(),
            isdata: false,
            issignal: false,
            isembed: false,
            isexp: None,
            tags: Vec::new(),
            fillcolor: None,
            linecolor: None,
        }
    }

    /// The file name.
    pub fn filename(&self) -> &str {
        self.file.path()
    }

    /// The file handle.
    pub fn file(&self) -> &Arc<SampleFile> {
        &self.file
    }

    /// The tree name.
    pub fn tree_name(&self) -> &str {
        self.read.tree_name()
    }

    /// The baseline scale `resetscale` returns to.
    pub fn base_scale(&self) -> f64 {
        self.scale0
    }

    /// Read `nevents` and `sumweights` from the cutflow, falling back on degenerate bins.
    ///
    /// # Errors
    ///
    /// Fails with [`TauFitError::MissingCutflow`] if the file has no cutflow and no event count
    /// was given.
    pub fn setnevents(&mut self) -> TauFitResult<f64> {
        match self.file.cutflow()? {
            None if self.nevents > 0.0 => {
                if self.sumweights <= 0.0 {
                    self.sumweights = self.nevents;
                }
                log::warn!(
                    "Sample '{}': no cutflow in {}, using nevents={}, sumweights={}",
                    self.name,
                    self.filename(),
                    self.nevents,
                    self.sumweights
                );
            }
            None => {
                return Err(TauFitError::MissingCutflow {
                    path: self.filename().to_string(),
                    sample: self.name.clone(),
                })
            }
            Some(cutflow) => {
                self.nevents = cutflow.bin_content(self.binnevts);
                self.sumweights = cutflow.bin_content(self.binsumw);
                if self.nevents <= 0.0 {
                    log::warn!(
                        "Sample '{}': cutflow bin {} of {} is empty, using the expected number of events ({})",
                        self.name,
                        self.binnevts,
                        self.filename(),
                        self.nexpevts
                    );
                    self.nevents = self.nexpevts;
                }
                if self.sumweights <= 0.0 {
                    log::warn!(
                        "Sample '{}': cutflow bin {} of {} is empty, using the number of events ({})",
                        self.name,
                        self.binsumw,
                        self.filename(),
                        self.nevents
                    );
                    self.sumweights = self.nevents;
                }
            }
        }
        Ok(self.nevents)
    }

    /// Set `norm = lumi*xsec*1000/sumweights`; degenerate inputs give `norm = 1` and a warning.
    pub fn normalize(&mut self) -> f64 {
        let sumw = if self.sumweights != 0.0 {
            self.sumweights
        } else {
            self.nevents
        };
        let mut norm = 1.0;
        if self.isdata {
            log::warn!("Sample '{}': not normalizing observed data", self.name);
        } else if self.lumi <= 0.0 || self.xsec <= 0.0 || sumw <= 0.0 {
            log::warn!(
                "Sample '{}': cannot normalize with lumi={}, xsec={}, sumw={}",
                self.name,
                self.lumi,
                self.xsec,
                sumw
            );
        } else {
            norm = self.lumi * self.xsec * 1000.0 / sumw;
            log::debug!(
                "Sample '{}': norm = {}*{}*1000/{} = {norm}",
                self.name,
                self.lumi,
                self.xsec,
                sumw
            );
        }
        if norm <= 0.0 {
            log::warn!(
                "Sample '{}': normalization {norm} <= 0 (lumi={}, xsec={}, sumw={sumw})",
                self.name,
                self.lumi,
                self.xsec
            );
        }
        self.norm = norm;
        norm
    }

    pub(crate) fn clone_deep_with(&self, handles: &mut HashMap<String, Arc<SampleFile>>) -> Self {
        let mut sample = self.clone();
        sample.file = handles
            .entry(self.filename().to_string())
            .or_insert_with(|| self.file.reopen())
            .clone();
        sample.splits = self
            .splits
            .iter()
            .map(|split| split.clone_deep_with(handles))
            .collect();
        sample
    }

    pub(crate) fn append_filename_with(
        &mut self,
        filetag: &str,
        nametag: &str,
        titletag: &str,
        handles: &mut HashMap<String, Arc<SampleFile>>,
    ) -> TauFitResult<()> {
        let old = self.filename().to_string();
        let new = inject_filetag(&old, filetag);
        if !nametag.is_empty() && !self.name.contains(nametag) {
            self.name.push_str(nametag);
        }
        if !titletag.is_empty() && !self.title.contains(titletag) {
            self.title.push_str(titletag);
        }
        if new != old {
            log::debug!("Sample '{}': replacing {old} with {new}", self.name);
            let source = self.file.source().clone();
            let file = handles
                .entry(new.clone())
                .or_insert_with(|| SampleFile::new(new.clone(), source))
                .clone();
            if !file.exists() {
                return Err(TauFitError::MissingFile { path: new });
            }
            self.file = file;
            let (nevents_old, sumw_old) = (self.nevents, self.sumweights);
            if self.isdata || !self.isembed {
                self.setnevents()?;
            }
            let changed = |old: f64, new: f64| old > 0.0 && ((old - new) / old).abs() > MAX_NEVENTS_CHANGE;
            if changed(sumw_old, self.sumweights) || changed(nevents_old, self.nevents) {
                log::warn!(
                    "Sample '{}': {new} has a different number of events (N={}, sumw={}) than {old} (N={nevents_old}, sumw={sumw_old}), keeping norm={}",
                    self.name,
                    self.nevents,
                    self.sumweights,
                    self.norm
                );
            }
        }
        for split in &mut self.splits {
            split.append_filename_with(filetag, nametag, titletag, handles)?;
        }
        Ok(())
    }

    pub(crate) fn book(
        &self,
        cache: &PlanCache,
        selection: &Selection,
        axes: &Axes,
        options: &GetHistsOptions,
        scale: f64,
    ) -> TauFitResult<LazyResult> {
        let variables = axes.variables();
        let mut cuts = vec![
            selection.selection.clone(),
            self.cuts.clone(),
            options.extracuts.clone(),
        ];
        cuts.extend(variables.iter().map(|variable| variable.cut.clone()));
        if self.isdata && options.blind {
            cuts.extend(
                variables
                    .iter()
                    .filter_map(|variable| variable.blindcut(&variable.binning)),
            );
        }
        let mut weights = vec![&self.weight, &self.extraweight];
        if self.isdata {
            weights.push(&options.dataweight);
            weights.push(&selection.weight);
            weights.extend(variables.iter().map(|variable| &variable.dataweight));
        } else {
            weights.push(&options.weight);
            weights.push(&selection.weight);
            weights.extend(variables.iter().map(|variable| &variable.weight));
        }
        let mut weight = join_weights(weights);
        for (old, new) in &options.replaceweight {
            weight = weight.replace(old, new);
        }
        let mut cuts = join_cuts(cuts.iter());
        let mut expressions: Vec<Expression> =
            variables.iter().map(|variable| variable.expression()).collect();
        if self.isdata {
            let unshift = |expression: &Expression| {
                if expression.contains("Up") || expression.contains("Down") {
                    Expression::new(undo_shift(expression.as_str()))
                } else {
                    expression.clone()
                }
            };
            cuts = unshift(&cuts);
            expressions = expressions.iter().map(unshift).collect();
        }
        let name = make_hist_name(&[
            axes.key(),
            selection.filename.clone(),
            format!("{}{}", self.name, options.tag),
        ]);
        let target = match (axes, options.kind) {
            (_, HistKind::SumWeights) => BookingTarget::SumWeights,
            (_, HistKind::Mean) => BookingTarget::Mean {
                x: expressions[0].clone(),
            },
            (Axes::One(variable), HistKind::Hist1D) => BookingTarget::Hist1D {
                model: variable.gethistmodel(Some(&name), Some(&self.title)),
                x: expressions[0].clone(),
            },
            (Axes::Two(x, y), _) => BookingTarget::Hist2D {
                model: x.gethistmodel2d(y, Some(&name), Some(&self.title)),
                x: expressions[0].clone(),
                y: expressions[1].clone(),
            },
            (Axes::One(variable), HistKind::Hist2D) => {
                return Err(TauFitError::Custom(format!(
                    "Sample '{}': a 2D histogram needs a pair of variables, got '{}'",
                    self.name, variable.name
                )))
            }
        };
        let booked = cache.book(BookingRequest {
            source: self.file.source().clone(),
            file: self.filename().to_string(),
            read: self.read.clone(),
            cuts,
            weight,
            scale: scale * self.scale * self.norm,
            target,
        });
        Ok(LazyResult::Booked {
            name,
            title: self.title.clone(),
            booked,
        })
    }
}

/// Insert `filetag` before the extension of `filename`, unless it is already there.
pub fn inject_filetag(filename: &str, filetag: &str) -> String {
    if filetag.is_empty() || filename.contains(filetag) {
        return filename.to_string();
    }
    match Path::new(filename).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => {
            let stem = &filename[..filename.len() - ext.len() - 1];
            format!("{stem}{filetag}.{ext}")
        }
        None => format!("{filename}{filetag}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EventTable, MemorySource};
    use approx::assert_relative_eq;

    fn source() -> Arc<dyn EventSource> {
        let table = EventTable::from_columns([("x", vec![1.0, 2.0])]).unwrap();
        let mut cutflow = vec![0.0; 15];
        cutflow[0] = 1.0e6;
        cutflow[14] = 1.0686e8;
        let mut shifted = cutflow.clone();
        shifted[14] = 1.2e8;
        MemorySource::new()
            .with_tree("DY.root", "tree", table.clone())
            .with_cutflow("DY.root", Cutflow(cutflow.clone()))
            .with_tree("DY_TES1.030.root", "tree", table.clone())
            .with_cutflow("DY_TES1.030.root", Cutflow(shifted))
            .with_tree("empty.root", "tree", table.clone())
            .with_cutflow("empty.root", Cutflow(vec![5.0]))
            .with_tree("nocutflow.root", "tree", table)
            .shared()
    }

    #[test]
    fn test_normalization() {
        let sample = LeafSample::builder("DY", "Drell-Yan", "DY.root")
            .xsec(5343.0)
            .lumi(41480.0)
            .build(source())
            .unwrap();
        assert_relative_eq!(sample.nevents, 1.0e6);
        assert_relative_eq!(sample.sumweights, 1.0686e8);
        assert_relative_eq!(sample.norm, 41480.0 * 5343.0 * 1000.0 / 1.0686e8);
        assert!(sample.isexp);
    }

    #[test]
    fn test_degenerate_cutflow_falls_back() {
        let sample = LeafSample::builder("X", "X", "empty.root")
            .xsec(1.0)
            .lumi(1.0)
            .build(source())
            .unwrap();
        assert_relative_eq!(sample.nevents, 5.0);
        assert_relative_eq!(sample.sumweights, 5.0);
        assert_relative_eq!(sample.norm, 1000.0 / 5.0);
    }

    #[test]
    fn test_missing_cutflow() {
        let err = LeafSample::builder("X", "X", "nocutflow.root")
            .xsec(1.0)
            .build(source())
            .unwrap_err();
        assert!(matches!(err, TauFitError::MissingCutflow { .. }));
        let sample = LeafSample::builder("X", "X", "nocutflow.root")
            .xsec(1.0)
            .lumi(1.0)
            .nevents(100.0)
            .build(source())
            .unwrap();
        assert_relative_eq!(sample.sumweights, 100.0);
        let explicit = LeafSample::builder("X", "X", "nocutflow.root")
            .norm(2.5)
            .build(source())
            .unwrap();
        assert_relative_eq!(explicit.norm, 2.5);
        assert!(LeafSample::builder("X", "X", "nope.root")
            .build(source())
            .is_err());
    }

    #[test]
    fn test_degenerate_normalization() {
        let sample = LeafSample::builder("X", "X", "DY.root")
            .xsec(-1.0)
            .lumi(1.0)
            .build(source())
            .unwrap();
        assert_eq!(sample.norm, 1.0);
        let data = LeafSample::builder("data", "Observed", "DY.root")
            .data()
            .build(source())
            .unwrap();
        assert_eq!(data.norm, 1.0);
        assert!(!data.isexp);
    }

    #[test]
    fn test_append_filename() {
        let mut sample = LeafSample::builder("DY", "Drell-Yan", "DY.root")
            .xsec(5343.0)
            .lumi(41480.0)
            .build(source())
            .unwrap();
        let norm = sample.norm;
        let mut handles = HashMap::new();
        sample
            .append_filename_with("_TES1.030", "_TES1p030", " +3% TES", &mut handles)
            .unwrap();
        assert_eq!(sample.filename(), "DY_TES1.030.root");
        assert_eq!(sample.name, "DY_TES1p030");
        assert_eq!(sample.title, "Drell-Yan +3% TES");
        assert_relative_eq!(sample.sumweights, 1.2e8);
        assert_relative_eq!(sample.norm, norm);
        let mut missing = sample.clone();
        assert!(missing
            .append_filename_with("_TES0.970", "", "", &mut HashMap::new())
            .is_err());
    }

    #[test]
    fn test_inject_filetag() {
        assert_eq!(inject_filetag("dir/DY.root", "_TES1.030"), "dir/DY_TES1.030.root");
        assert_eq!(inject_filetag("dir/DY_TES1.030.root", "_TES1.030"), "dir/DY_TES1.030.root");
        assert_eq!(inject_filetag("DY", "_x"), "DY_x");
    }
}
