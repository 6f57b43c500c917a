use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    engine::PlanCache,
    expression::{clean_bool, invert_charge, join_cuts, ChargeTarget},
    histogram::HistResult,
    methods::{
        control_options, ensure_positive, estimate_info, subtract_hist, subtract_yield,
        ControlRegion, NEGATIVE_BIN_THRESHOLD,
    },
    results::{Axes, CombineFn, LazyResult, ResultDict},
    sample::{GetHistsOptions, Sample, SampleSet},
    selection::Selection,
    utils::{make_hist_name, HistKind},
    variable::{Binning, Variable},
    Expression, TauFitResult,
};

/// Tau identification assumed when a di-tau selection has no `VSjet` requirement.
pub const DEFAULT_TAUID: &str = "idDeepTau";
/// Tight `VSjet` working point bit assumed when a di-tau selection has none.
pub const DEFAULT_TAU_WP: u32 = 16;
/// Tight lepton isolation assumed for `iso_1` (and `iso_2`) when a selection has none.
pub const DEFAULT_ISO_WP: &str = "0.15";
/// Upper bound of the anti-isolated lepton region.
pub const LOOSE_ISO_WP: f64 = 0.50;

/// Cuts of the three control regions of the ABCD method.
///
/// ```text
///            OS         SS
/// isolated   A = SR     B
/// anti-iso   C          D
/// ```
///
/// The yield in A is estimated as `N_C * N_B / N_D`. The shape comes from C for di-tau channels and
/// from B for channels with a light lepton.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbcdRegions {
    /// Region B: same sign, isolated
    pub ss_iso: Expression,
    /// Region C: opposite sign, anti-isolated
    pub os_anti: Expression,
    /// Region D: same sign, anti-isolated
    pub ss_anti: Expression,
    /// Region the shape is taken from
    pub shape: Expression,
}

/// QCD multijet: observed data minus simulation in the control regions of a charge times
/// isolation ABCD plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QcdAbcd {
    /// Process name
    pub name: String,
    /// Process title
    pub title: String,
    /// Relative systematic shift of the yield
    pub shift: f64,
    /// Channel deciding the regions; defaults to the channel of the sample set
    pub channel: Option<String>,
    /// Regex matching the di-tau identification variable (without the `_1` leg suffix)
    pub tauid: String,
    /// Fraction of negative bins above which to warn
    pub negthres: f64,
    /// Fill colour
    pub fillcolor: Option<String>,
}

impl Default for QcdAbcd {
    fn default() -> Self {
        Self {
            name: "QCD".to_string(),
            title: "QCD multijet".to_string(),
            shift: 0.0,
            channel: None,
            tauid: r"idDeepTau\w*VSjet".to_string(),
            negthres: NEGATIVE_BIN_THRESHOLD,
            fillcolor: None,
        }
    }
}

impl QcdAbcd {
    /// The nominal estimate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the yield by a relative amount, e.g. `0.2` for a 20 % up variation.
    pub fn with_shift(mut self, shift: f64) -> Self {
        self.shift = shift;
        self
    }

    /// Use the regions of another channel than that of the sample set.
    pub fn with_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Rename the process.
    pub fn with_name<N: Into<String>, T: Into<String>>(mut self, name: N, title: T) -> Self {
        self.name = name.into();
        self.title = title.into();
        self
    }

    /// Fill colour of the estimate.
    pub fn with_color<S: Into<String>>(mut self, color: S) -> Self {
        self.fillcolor = Some(color.into());
        self
    }

    /// Derive the control regions of `cuts` (the signal region) for `channel`.
    ///
    /// - `tautau`: the tight `VSjet` requirement `<id>_1>=T` of both taus is replaced: isolated
    ///   is both tight, anti-isolated is one medium (`T/2`) tau and one loose (`T/4`) but not
    ///   tight tau.
    /// - other channels with a tau: the lepton isolation `iso_1<X` is replaced by
    ///   `X<=iso_1<0.50` for anti-isolated.
    /// - fully leptonic channels: both lepton isolations are replaced, anti-isolated is either
    ///   lepton failing its tight isolation.
    pub fn regions(&self, channel: &str, cuts: &Expression) -> TauFitResult<AbcdRegions> {
        let os = invert_charge(&Expression::empty(), ChargeTarget::OS);
        let ss = invert_charge(&Expression::empty(), ChargeTarget::SS);
        let (base, iso, anti, shape_os) = if channel.contains("tautau") {
            let (base, iso, anti) = self.tau_isolation(channel, cuts)?;
            (base, iso, anti, true)
        } else if channel.contains("tau") {
            let (base, iso, anti) = lepton_isolation(channel, cuts, 1)?;
            (base, iso, anti, false)
        } else {
            let (base, iso, anti) = lepton_isolation(channel, cuts, 2)?;
            (base, iso, anti, false)
        };
        let base = invert_charge(&base, ChargeTarget::Remove);
        let os_anti = join_cuts([&base, &os, &anti]);
        let ss_iso = join_cuts([&base, &ss, &iso]);
        let ss_anti = join_cuts([&base, &ss, &anti]);
        let shape = if shape_os { os_anti.clone() } else { ss_iso.clone() };
        Ok(AbcdRegions {
            ss_iso,
            os_anti,
            ss_anti,
            shape,
        })
    }

    fn tau_isolation(
        &self,
        channel: &str,
        cuts: &Expression,
    ) -> TauFitResult<(Expression, Expression, Expression)> {
        let re = Regex::new(&format!(r"({})_1\s*>=\s*(\d+)", self.tauid))?;
        let (tauid, tight) = match re.captures(cuts.as_str()) {
            Some(caps) => (caps[1].to_string(), caps[2].parse::<u32>().unwrap_or(DEFAULT_TAU_WP)),
            None => {
                log::warn!(
                    "QcdAbcd: did not find tau ID VSjet WP '{}' in '{}' for {} channel! Assuming \
                     tauid='{}', tight WP={}",
                    re.as_str(),
                    cuts,
                    channel,
                    DEFAULT_TAUID,
                    DEFAULT_TAU_WP
                );
                (DEFAULT_TAUID.to_string(), DEFAULT_TAU_WP)
            }
        };
        let (medium, loose) = (tight / 2, tight / 4);
        let strip = Regex::new(&format!(r"{}_[12]\s*>=\s*\d+", regex::escape(&tauid)))?;
        let base = strip_cuts(cuts.as_str(), &strip);
        let iso = Expression::new(format!("{tauid}_1>={tight} && {tauid}_2>={tight}"));
        let anti = Expression::new(format!(
            "(({tauid}_1>={medium} && {tauid}_2<{tight} && {tauid}_2>={loose}) || \
             ({tauid}_2>={medium} && {tauid}_1<{tight} && {tauid}_1>={loose}))"
        ));
        Ok((base, iso, anti))
    }

    pub(crate) fn estimate(
        &self,
        set: &SampleSet,
        cache: &PlanCache,
        axes: &[Axes],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let channel = self.channel.as_deref().unwrap_or(&set.channel);
        for sample in set.exp.iter().filter(|sample| is_qcd(sample)) {
            log::warn!(
                "QcdAbcd: omitting QCD (?) background '{}' from the control regions",
                sample.name()
            );
        }
        let keep = |sample: &Sample| !is_qcd(sample);
        let shape_options = control_options(options);
        let yield_options = shape_options.clone().kind(HistKind::SumWeights);
        let yield_axes = Axes::One(Variable::new("1", "yield", Binning::uniform(1, 0.0, 2.0)?));
        let mut results = ResultDict::new();
        for selection in selections {
            let regions = self.regions(channel, &selection.selection)?;
            log::debug!(
                "QcdAbcd: regions for '{}': shape='{}', B='{}', C='{}', D='{}'",
                selection.name,
                regions.shape,
                regions.ss_iso,
                regions.os_anti,
                regions.ss_anti
            );
            let region = |label: &str, cuts: &Expression| Selection {
                name: format!("{} ({label})", selection.name),
                title: format!("{} ({label})", selection.title),
                filename: format!("{}_{}", selection.filename, label.replace([',', ' '], "")),
                selection: cuts.clone(),
                ..selection.clone()
            };
            let mut yields = Vec::with_capacity(3);
            for (label, cuts) in [
                ("SS, isolated", &regions.ss_iso),
                ("OS, anti-isolated", &regions.os_anti),
                ("SS, anti-isolated", &regions.ss_anti),
            ] {
                let mut control = region(label, cuts);
                control.only.clear();
                control.veto.clear();
                if let Some(control) = ControlRegion::book(
                    set,
                    cache,
                    &control,
                    &yield_axes,
                    &yield_options,
                    &yield_options,
                    keep,
                )? {
                    yields.push(control);
                }
            }
            let [n_b, n_c, n_d] = match <[ControlRegion; 3]>::try_from(yields) {
                Ok(yields) => yields,
                Err(_) => {
                    log::warn!("QcdAbcd: no data to make a data-driven QCD estimate");
                    continue;
                }
            };
            let shape_selection = region("shape", &regions.shape);
            for axes in axes {
                let bound = axes.changecontext(selection);
                let Some(shape) = ControlRegion::book(
                    set,
                    cache,
                    &shape_selection,
                    &bound,
                    &shape_options,
                    &shape_options,
                    keep,
                )?
                else {
                    continue;
                };
                let name = make_hist_name(&[
                    axes.key(),
                    selection.filename.clone(),
                    format!("{}{}", self.name, options.tag),
                ]);
                let sizes = [shape.len(), n_b.len(), n_c.len(), n_d.len()];
                let inputs: Vec<LazyResult> = shape
                    .inputs()
                    .chain(n_b.inputs())
                    .chain(n_c.inputs())
                    .chain(n_d.inputs())
                    .collect();
                let combine: CombineFn = {
                    let (name, title) = (name.clone(), self.title.clone());
                    let (shift, negthres) = (self.shift, self.negthres);
                    Arc::new(move |inputs: &[HistResult]| {
                        let (shape, rest) = inputs.split_at(sizes[0]);
                        let (b, rest) = rest.split_at(sizes[1]);
                        let (c, d) = rest.split_at(sizes[2]);
                        let mut hist = subtract_hist(shape, &name, &title)?;
                        ensure_positive(&mut hist, negthres);
                        let (n_b, n_c, n_d) = (subtract_yield(b), subtract_yield(c), subtract_yield(d));
                        if n_d == 0.0 {
                            log::warn!(
                                "QcdAbcd: N_D = 0 for '{name}', returning the unscaled shape"
                            );
                            return Ok(HistResult::Hist1D(hist));
                        }
                        let scale = n_c * n_b / n_d * (1.0 + shift);
                        log::debug!(
                            "QcdAbcd: '{name}': B={n_b:.1}, C={n_c:.1}, D={n_d:.1}, \
                             B/D={:.3}, scale={scale:.3}, shift={shift:.3}",
                            n_b / n_d
                        );
                        let nqcd = hist.integral();
                        if nqcd > 0.0 {
                            hist.scale(scale / nqcd);
                        }
                        Ok(HistResult::Hist1D(hist))
                    })
                };
                results.add(
                    selection,
                    axes,
                    estimate_info(&self.name, &self.title, self.fillcolor.as_deref()),
                    LazyResult::Derived {
                        name,
                        title: self.title.clone(),
                        inputs,
                        combine,
                    },
                );
            }
        }
        Ok(results)
    }
}

fn is_qcd(sample: &Sample) -> bool {
    sample.name().to_lowercase().contains("qcd") || sample.title().to_lowercase().contains("qcd")
}

/// Isolation of `nlegs` light leptons: `(base, iso, anti)`.
fn lepton_isolation(
    channel: &str,
    cuts: &Expression,
    nlegs: usize,
) -> TauFitResult<(Expression, Expression, Expression)> {
    let legs = if nlegs == 1 { "1" } else { "12" };
    let re = Regex::new(&format!(r"(iso_[{legs}]|pfRelIso\w+_[{legs}])\s*<\s*([\d\.]+)"))?;
    let mut found: Vec<(String, String)> = re
        .captures_iter(cuts.as_str())
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect();
    if found.len() < nlegs {
        let defaults: Vec<(String, String)> = (1..=nlegs)
            .map(|leg| (format!("iso_{leg}"), DEFAULT_ISO_WP.to_string()))
            .collect();
        log::warn!(
            "QcdAbcd: did not find lepton isolation '{}' in '{}' for {} channel! Assuming {:?}",
            re.as_str(),
            cuts,
            channel,
            defaults
        );
        found = defaults;
    }
    found.truncate(nlegs);
    let base = strip_cuts(cuts.as_str(), &re);
    let iso = Expression::new(
        found
            .iter()
            .map(|(var, wp)| format!("{var}<{wp}"))
            .collect::<Vec<_>>()
            .join(" && "),
    );
    let failing = found
        .iter()
        .map(|(var, wp)| format!("{var}>={wp}"))
        .collect::<Vec<_>>()
        .join(" || ");
    let loose = found
        .iter()
        .map(|(var, _)| format!("{var}<{LOOSE_ISO_WP:.2}"))
        .collect::<Vec<_>>()
        .join(" && ");
    let anti = if nlegs == 1 {
        Expression::new(format!("{failing} && {loose}"))
    } else {
        Expression::new(format!("({failing}) && {loose}"))
    };
    Ok((base, iso, anti))
}

static EMPTY_PARENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\s*\)").unwrap());

/// Remove every match of `re` from `cuts` and tidy up the boolean operators left behind.
fn strip_cuts(cuts: &str, re: &Regex) -> Expression {
    let mut text = re.replace_all(cuts, "").into_owned();
    loop {
        let cleaned = clean_bool(&EMPTY_PARENS.replace_all(&text, ""));
        if cleaned == text {
            return Expression::new(text);
        }
        text = cleaned;
    }
}
