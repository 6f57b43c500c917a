use crate::{
    engine::PlanCache,
    histogram::{Hist1D, HistResult},
    results::{Axes, LazyResult, ResultDict, SampleInfo},
    sample::{GetHistsOptions, Sample, SampleSet},
    selection::Selection,
    utils::HistKind,
    TauFitError, TauFitResult,
};

/// Jet-to-tau fake estimate from an inverted tau identification region.
pub mod jtf;
/// QCD multijet estimate with the ABCD method.
pub mod qcd;

pub use jtf::{FakeRate, FakeRateTable, JetToTauFake};
pub use qcd::QcdAbcd;

/// Default fraction of negative bins above which an estimate is reported.
pub const NEGATIVE_BIN_THRESHOLD: f64 = 0.25;

/// A data-driven background estimate which is inserted among the expected processes.
#[derive(Clone, Debug)]
pub enum Method {
    /// Jet-to-tau fakes
    JetToTauFake(JetToTauFake),
    /// QCD multijet (ABCD)
    QcdAbcd(QcdAbcd),
}

impl Method {
    /// Process name of the estimate.
    pub fn name(&self) -> &str {
        match self {
            Method::JetToTauFake(method) => &method.name,
            Method::QcdAbcd(method) => &method.name,
        }
    }

    /// Book the estimate for every (selection, axes) cell. `options` are those of the nominal
    /// booking (without a method); signals are never used.
    pub fn estimate(
        &self,
        set: &SampleSet,
        cache: &PlanCache,
        axes: &[Axes],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        if options.kind != HistKind::Hist1D {
            log::warn!(
                "Method '{}': only 1D histograms can be estimated, got {}",
                self.name(),
                options.kind
            );
            return Ok(ResultDict::new());
        }
        if set.data.is_none() {
            log::warn!(
                "Method '{}': no data in sample set '{}' to make a data-driven estimate",
                self.name(),
                set.name
            );
            return Ok(ResultDict::new());
        }
        match self {
            Method::JetToTauFake(method) => method.estimate(set, cache, axes, selections, options),
            Method::QcdAbcd(method) => method.estimate(set, cache, axes, selections, options),
        }
    }
}

impl From<JetToTauFake> for Method {
    fn from(method: JetToTauFake) -> Self {
        Method::JetToTauFake(method)
    }
}

impl From<QcdAbcd> for Method {
    fn from(method: QcdAbcd) -> Self {
        Method::QcdAbcd(method)
    }
}

/// Lazy results of observed data and the simulation subtracted from it in one control region.
#[derive(Clone, Debug)]
pub(crate) struct ControlRegion {
    pub(crate) data: LazyResult,
    pub(crate) mc: Vec<LazyResult>,
}

impl ControlRegion {
    /// Book data with `data_options` and every expected sample accepted by `keep` with
    /// `mc_options` in `selection`. `axes` must be bound already.
    pub(crate) fn book<F>(
        set: &SampleSet,
        cache: &PlanCache,
        selection: &Selection,
        axes: &Axes,
        data_options: &GetHistsOptions,
        mc_options: &GetHistsOptions,
        keep: F,
    ) -> TauFitResult<Option<ControlRegion>>
    where
        F: Fn(&Sample) -> bool,
    {
        let Some(datasample) = &set.data else {
            return Ok(None);
        };
        let Some((_, data)) = datasample
            .book(cache, selection, axes, data_options)?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let mut mc = Vec::new();
        for sample in set.exp.iter().filter(|sample| keep(sample)) {
            mc.extend(
                sample
                    .book(cache, selection, axes, mc_options)?
                    .into_iter()
                    .map(|(_, result)| result),
            );
        }
        Ok(Some(ControlRegion { data, mc }))
    }

    /// Number of lazy results in this region.
    pub(crate) fn len(&self) -> usize {
        1 + self.mc.len()
    }

    /// The lazy results, data first.
    pub(crate) fn inputs(&self) -> impl Iterator<Item = LazyResult> + '_ {
        std::iter::once(self.data.clone()).chain(self.mc.iter().cloned())
    }
}

/// Options for control-region bookings: never split, never blinded, no method.
pub(crate) fn control_options(options: &GetHistsOptions) -> GetHistsOptions {
    let mut options = options.clone().split(false).blind(false);
    options.method = None;
    options.filter.clear();
    options.veto.clear();
    options
}

/// Observed minus expected for a histogram region: `results[0]` is data, the rest simulation.
pub(crate) fn subtract_hist(results: &[HistResult], name: &str, title: &str) -> TauFitResult<Hist1D> {
    let (data, mc) = results
        .split_first()
        .ok_or_else(|| TauFitError::Custom(format!("No inputs to estimate '{name}'")))?;
    let mut hist = data
        .as_hist1d()
        .ok_or_else(|| TauFitError::Custom(format!("Estimate '{name}' needs 1D histograms")))?
        .renamed(name, title);
    for result in mc {
        let other = result
            .as_hist1d()
            .ok_or_else(|| TauFitError::Custom(format!("Estimate '{name}' needs 1D histograms")))?;
        hist.subtract(other)?;
    }
    Ok(hist)
}

/// Observed minus expected for a yield region.
pub(crate) fn subtract_yield(results: &[HistResult]) -> f64 {
    match results.split_first() {
        Some((data, mc)) => data.integral() - mc.iter().map(HistResult::integral).sum::<f64>(),
        None => 0.0,
    }
}

/// Set negative bins to `0 +- 1` and warn if more than `negthres` of the bins were negative.
pub(crate) fn ensure_positive(hist: &mut Hist1D, negthres: f64) {
    let nbins = hist.nbins();
    let nneg = hist.clip_negative(1.0);
    if nbins > 0 && (nneg as f64) / (nbins as f64) > negthres {
        log::warn!(
            "Estimate '{}': {}/{} > {:.1}% negative bins! Set to 0 +- 1.",
            hist.name,
            nneg,
            nbins,
            100.0 * negthres
        );
    }
}

/// Process information for an estimate.
pub(crate) fn estimate_info(name: &str, title: &str, fillcolor: Option<&str>) -> SampleInfo {
    SampleInfo {
        name: name.to_string(),
        title: title.to_string(),
        isdata: false,
        isexp: true,
        issignal: false,
        fillcolor: fillcolor.map(str::to_string),
    }
}
