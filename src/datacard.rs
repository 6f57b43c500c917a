//! Histogram inputs for datacards.
//!
//! [`createinputs`] fills one histogram per (bin, process) for a list of observables and writes
//! them to one output per observable, `<bin>/<process>` for the nominal templates and
//! `<bin>/<process>_<variation>` for systematic variations. Variations are produced by calling it
//! again on a shifted [`SampleSet`] (tree-level shifts) or with `replaceweight` (weight-level
//! shifts); later calls update the files written by the first one.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{short_channel, tes_tags, FitSetup},
    engine::PlanCache,
    expression::join_cuts,
    histogram::Hist1D,
    methods::Method,
    results::SampleInfo,
    sample::{GetHistsOptions, SampleSet, ShiftOptions},
    selection::Selection,
    utils::{make_hist_name, repkey},
    variable::Variable,
    Expression, TauFitError, TauFitResult,
};

/// Process name of observed data in datacard inputs.
pub const DATA_OBS: &str = "data_obs";

static DECIMAL_P: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)p(\d+)").unwrap());

/// Destination of datacard input histograms.
pub trait HistogramSink {
    /// Record the exact selection string of a bin.
    fn put_selection(&mut self, bin: &str, selection: &str) -> TauFitResult<()>;
    /// Store (or overwrite) a histogram in a bin.
    fn put_hist(&mut self, bin: &str, name: &str, hist: &Hist1D) -> TauFitResult<()>;
    /// Flush everything to the output.
    fn close(&mut self) -> TauFitResult<()>;
}

/// The histograms of one bin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputsBin {
    /// The selection string used to fill the bin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    /// Histograms by process (and variation) name
    #[serde(default)]
    pub hists: IndexMap<String, Hist1D>,
}

/// The contents of one datacard input file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputsFile {
    /// Bins by name
    pub bins: IndexMap<String, InputsBin>,
}

impl InputsFile {
    /// The histogram `<bin>/<name>`.
    pub fn get(&self, bin: &str, name: &str) -> Option<&Hist1D> {
        self.bins.get(bin).and_then(|entry| entry.hists.get(name))
    }

    /// The histogram names stored in a bin.
    pub fn names(&self, bin: &str) -> Vec<&str> {
        self.bins
            .get(bin)
            .map(|entry| entry.hists.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// A [`HistogramSink`] writing one JSON document per file.
#[derive(Debug)]
pub struct JsonSink {
    path: PathBuf,
    document: InputsFile,
}

impl JsonSink {
    /// Open an output file. Without `recreate`, histograms already in the file are kept.
    pub fn open(path: &str, recreate: bool) -> TauFitResult<Self> {
        let path = PathBuf::from(&*shellexpand::full(path)?);
        let document = if !recreate && path.is_file() {
            read_inputs_path(&path)?
        } else {
            InputsFile::default()
        };
        if recreate {
            log::info!("Created file {}", path.display());
        }
        Ok(Self { path, document })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistogramSink for JsonSink {
    fn put_selection(&mut self, bin: &str, selection: &str) -> TauFitResult<()> {
        self.document
            .bins
            .entry(bin.to_string())
            .or_default()
            .selection = Some(selection.to_string());
        Ok(())
    }

    fn put_hist(&mut self, bin: &str, name: &str, hist: &Hist1D) -> TauFitResult<()> {
        self.document
            .bins
            .entry(bin.to_string())
            .or_default()
            .hists
            .insert(name.to_string(), hist.clone());
        Ok(())
    }

    fn close(&mut self) -> TauFitResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &self.document)?;
        Ok(())
    }
}

fn read_inputs_path(path: &Path) -> TauFitResult<InputsFile> {
    let file = File::open(path).map_err(|_| TauFitError::MissingFile {
        path: path.display().to_string(),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Read a file written by [`JsonSink`].
pub fn read_inputs(path: &str) -> TauFitResult<InputsFile> {
    read_inputs_path(Path::new(&*shellexpand::full(path)?))
}

/// Options for [`createinputs`].
#[derive(Clone, Debug)]
pub struct InputOptions {
    /// Directory prepended to the file name template
    pub outdir: String,
    /// Value of `$TAG` in the file name template
    pub tag: String,
    /// Value of `$ERA` in the file name template
    pub era: String,
    /// Value of `$ANALYSIS` in the file name template
    pub analysis: String,
    /// Suffix of every histogram name, e.g. `_TESUp`
    pub htag: String,
    /// Only create histograms for processes matching these patterns (`data_obs` for data)
    pub filter: Vec<String>,
    /// Skip processes matching these patterns
    pub veto: Vec<String>,
    /// `(old, new)` weight substitutions
    pub replaceweight: Vec<(String, String)>,
    /// Extra weight for simulation
    pub weight: Expression,
    /// Shift tag and the parts of the observables (and selections) it applies to; an empty list
    /// shifts only the observables as a whole
    pub shift: Option<(String, Vec<String>)>,
    /// Jet/MET shift, e.g. `jecUp`
    pub shiftjme: Option<String>,
    /// Data-driven estimate, made when the filter is empty or names it
    pub method: Option<Method>,
    /// Start new files instead of updating existing ones
    pub recreate: bool,
    /// Set negative bins to zero
    pub noneg: bool,
    /// Write decimal points in histogram names (`TES1.030` instead of `TES1p030`)
    pub dots: bool,
    /// `(pattern, replacement)` regex substitutions on histogram names
    pub replacenames: Vec<(String, String)>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            outdir: String::new(),
            tag: String::new(),
            era: String::new(),
            analysis: String::new(),
            htag: String::new(),
            filter: Vec::new(),
            veto: Vec::new(),
            replaceweight: Vec::new(),
            weight: Expression::empty(),
            shift: None,
            shiftjme: None,
            method: None,
            recreate: false,
            noneg: true,
            dots: false,
            replacenames: Vec::new(),
        }
    }
}

impl InputOptions {
    /// Default options: update existing files, clip negative bins.
    pub fn new() -> Self {
        Self::default()
    }
    /// Set the output directory.
    pub fn outdir<S: Into<String>>(mut self, outdir: S) -> Self {
        self.outdir = outdir.into();
        self
    }
    /// Set the file tag.
    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = tag.into();
        self
    }
    /// Set the era.
    pub fn era<S: Into<String>>(mut self, era: S) -> Self {
        self.era = era.into();
        self
    }
    /// Set the analysis name.
    pub fn analysis<S: Into<String>>(mut self, analysis: S) -> Self {
        self.analysis = analysis.into();
        self
    }
    /// Set the histogram name suffix.
    pub fn htag<S: Into<String>>(mut self, htag: S) -> Self {
        self.htag = htag.into();
        self
    }
    /// Restrict the processes.
    pub fn filter<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.filter = patterns.into_iter().map(Into::into).collect();
        self
    }
    /// Skip processes.
    pub fn veto<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.veto = patterns.into_iter().map(Into::into).collect();
        self
    }
    /// Add a weight substitution.
    pub fn replaceweight<O: Into<String>, N: Into<String>>(mut self, old: O, new: N) -> Self {
        self.replaceweight.push((old.into(), new.into()));
        self
    }
    /// Set the extra simulation weight.
    pub fn weight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.weight = weight.into();
        self
    }
    /// Shift the observables (and, with `vars`, the selections).
    pub fn shift<S: Into<String>, V: Into<String>>(
        mut self,
        vshift: S,
        vars: impl IntoIterator<Item = V>,
    ) -> Self {
        self.shift = Some((vshift.into(), vars.into_iter().map(Into::into).collect()));
        self
    }
    /// Apply a jet/MET shift.
    pub fn shiftjme<S: Into<String>>(mut self, jshift: S) -> Self {
        self.shiftjme = Some(jshift.into());
        self
    }
    /// Add a data-driven estimate.
    pub fn method<M: Into<Method>>(mut self, method: M) -> Self {
        self.method = Some(method.into());
        self
    }
    /// Recreate the output files.
    pub fn recreate(mut self, recreate: bool) -> Self {
        self.recreate = recreate;
        self
    }
    /// Clip negative bins.
    pub fn noneg(mut self, noneg: bool) -> Self {
        self.noneg = noneg;
        self
    }
    /// Keep decimal points in histogram names.
    pub fn dots(mut self, dots: bool) -> Self {
        self.dots = dots;
        self
    }
    /// Add a regex substitution for histogram names.
    pub fn replacename<P: Into<String>, R: Into<String>>(mut self, pattern: P, replacement: R) -> Self {
        self.replacenames.push((pattern.into(), replacement.into()));
        self
    }

    fn gethists_options(&self, set: &SampleSet) -> GetHistsOptions {
        let data_name = set.data.as_ref().map(|data| data.name().to_string());
        let filter: Vec<String> = self
            .filter
            .iter()
            .map(|term| match (&data_name, term.as_str()) {
                (Some(name), DATA_OBS) => regex::escape(name),
                _ => term.clone(),
            })
            .collect();
        let mut options = GetHistsOptions::new()
            .split(true)
            .weight(self.weight.clone())
            .filter(filter)
            .veto(self.veto.clone());
        options.replaceweight = self.replaceweight.clone();
        if let Some(method) = &self.method {
            if self.filter.is_empty() || self.filter.iter().any(|term| term == method.name()) {
                options.method = Some(method.clone());
            }
        }
        options
    }
}

/// A systematic variation of some processes, with an optional weight substitution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Systematic {
    /// Histogram name suffix without direction, e.g. `_shape_dy`
    pub tag: String,
    /// Affected processes
    pub procs: Vec<String>,
    /// `(nominal, up, down)` weights
    pub replaceweight: Option<(String, String, String)>,
}

impl Systematic {
    /// A systematic named `tag` (`$ERA` and other keys are replaced with `keys`).
    pub fn new<S: AsRef<str>, P: Into<String>>(
        tag: S,
        procs: impl IntoIterator<Item = P>,
        keys: &[(&str, &str)],
    ) -> Self {
        Self {
            tag: repkey(tag.as_ref(), keys),
            procs: procs.into_iter().map(Into::into).collect(),
            replaceweight: None,
        }
    }

    /// Vary by substituting `nominal` with `up` or `down`.
    pub fn with_replaceweight<N: Into<String>, U: Into<String>, D: Into<String>>(
        mut self,
        nominal: N,
        up: U,
        down: D,
    ) -> Self {
        self.replaceweight = Some((nominal.into(), up.into(), down.into()));
        self
    }

    /// Tag of the upward variation.
    pub fn up(&self) -> String {
        format!("{}Up", self.tag)
    }

    /// Tag of the downward variation.
    pub fn down(&self) -> String {
        format!("{}Down", self.tag)
    }

    /// Options for both variations, built on `options`.
    pub fn variations(&self, options: &InputOptions) -> [InputOptions; 2] {
        let base = options.clone().filter(self.procs.clone()).recreate(false);
        let mut up = base.clone().htag(self.up());
        let mut down = base.htag(self.down());
        if let Some((nominal, wup, wdown)) = &self.replaceweight {
            up = up.replaceweight(nominal, wup);
            down = down.replaceweight(nominal, wdown);
        }
        [up, down]
    }
}

/// The name of a process in the datacard inputs.
pub fn process_name(info: &SampleInfo, bin: &str, options: &InputOptions) -> TauFitResult<String> {
    let base = if info.isdata {
        DATA_OBS
    } else {
        info.name.as_str()
    };
    let mut name = make_hist_name(&[base]);
    let htag = options.htag.replace('.', "p");
    if !name.ends_with(&htag) {
        name.push_str(&htag);
    }
    name = repkey(&name, &[("BIN", bin)]);
    if options.dots && name.contains('p') {
        name = DECIMAL_P.replace_all(&name, "${1}.${2}").into_owned();
    }
    for (pattern, replacement) in &options.replacenames {
        name = Regex::new(pattern)?
            .replace_all(&name, replacement.as_str())
            .into_owned();
    }
    Ok(name)
}

fn apply_shifts(
    observables: &[Variable],
    bins: &[Selection],
    options: &InputOptions,
) -> (Vec<Variable>, Vec<Selection>) {
    let mut observables = observables.to_vec();
    let mut bins = bins.to_vec();
    if let Some((vshift, vars)) = &options.shift {
        let vars: Vec<&str> = vars.iter().map(String::as_str).collect();
        observables = observables
            .iter()
            .map(|obs| obs.shift(vshift, &vars, true))
            .collect();
        if !vars.is_empty() {
            bins = bins.iter().map(|sel| sel.shift(vshift, &vars, true)).collect();
        }
    }
    if let Some(jshift) = &options.shiftjme {
        observables = observables
            .iter()
            .map(|obs| obs.shift_jme(jshift, true))
            .collect();
        bins = bins.iter().map(|sel| sel.shift_jme(jshift, true)).collect();
    }
    (observables, bins)
}

/// Create datacard inputs in JSON files. `fname` is a file name template with the keys `$OBS`
/// (observable file name), `$CHANNEL` (short channel of the sample set, e.g. `mt`), `$ERA`,
/// `$ANALYSIS` and `$TAG`. Returns the written files.
pub fn createinputs(
    fname: &str,
    set: &SampleSet,
    cache: &PlanCache,
    observables: &[Variable],
    bins: &[Selection],
    options: &InputOptions,
) -> TauFitResult<Vec<PathBuf>> {
    let sinks = createinputs_with(fname, set, cache, observables, bins, options, |path, recreate| {
        JsonSink::open(path, recreate)
    })?;
    Ok(sinks.into_iter().map(|sink| sink.path).collect())
}

/// Create datacard inputs in sinks opened by `open(path, recreate)`, one per observable.
pub fn createinputs_with<S, F>(
    fname: &str,
    set: &SampleSet,
    cache: &PlanCache,
    observables: &[Variable],
    bins: &[Selection],
    options: &InputOptions,
    mut open: F,
) -> TauFitResult<Vec<S>>
where
    S: HistogramSink,
    F: FnMut(&str, bool) -> TauFitResult<S>,
{
    let (observables, bins) = apply_shifts(observables, bins, options);
    let fname = if options.outdir.is_empty() {
        fname.to_string()
    } else {
        Path::new(&options.outdir).join(fname).to_string_lossy().into_owned()
    };

    let channel = short_channel(&set.channel);
    let mut sinks: IndexMap<String, S> = IndexMap::new();
    for obs in &observables {
        if sinks.contains_key(&obs.filename) {
            continue;
        }
        let path = repkey(
            &fname,
            &[
                ("ANALYSIS", options.analysis.as_str()),
                ("OBS", obs.filename.as_str()),
                ("CHANNEL", channel.as_str()),
                ("ERA", options.era.as_str()),
                ("TAG", options.tag.as_str()),
            ],
        );
        let mut sink = open(&path, options.recreate)?;
        if options.recreate {
            for selection in bins.iter().filter(|selection| obs.plotfor(selection, false)) {
                let string = join_cuts([&selection.selection, obs.cut_for(selection)]);
                log::debug!(
                    "{} selection '{}': '{}'",
                    obs.filename,
                    selection.name,
                    string
                );
                sink.put_selection(&selection.filename, string.as_str())?;
            }
        }
        sinks.insert(obs.filename.clone(), sink);
    }

    let gethists = options.gethists_options(set);
    for selection in &bins {
        let bin = &selection.filename;
        log::info!("Bin '{bin}'");
        if !options.htag.is_empty() {
            log::info!("Systematic uncertainty: {}", options.htag.trim_start_matches('_'));
        }
        if options.recreate {
            log::info!("'{}'", selection.selection);
        }
        let results = set.gethists(cache, &observables, std::slice::from_ref(selection), &gethists)?;
        log::info!("{:>11} {:>10}  {:<20}  Process", "Events", "Entries", "Observable");
        for (_, axes, histset) in results.gethistsets()? {
            let obs = axes.x();
            let Some(sink) = sinks.get_mut(&obs.filename) else {
                continue;
            };
            for entry in histset.entries() {
                let Some(hist) = entry.hist() else {
                    log::warn!(
                        "createinputs: result '{}' for '{}' is not a 1D histogram",
                        entry.info.name,
                        obs.filename
                    );
                    continue;
                };
                let name = process_name(&entry.info, bin, options)?;
                let mut hist = hist.renamed(&name, &obs.title);
                if options.noneg {
                    for i in 0..hist.nbins() {
                        let content = hist.bin_content(i);
                        if content < 0.0 {
                            log::info!(
                                "Set negative value of '{name}' bin {} ({content:.3}<0) to 0",
                                i + 1
                            );
                            hist.set_bin(i, 0.0, hist.bin_error(i));
                        }
                    }
                }
                sink.put_hist(bin, &name, &hist)?;
                log::info!(
                    "{:>11.1} {:>10}  {:<20}  {}",
                    hist.integral(),
                    hist.entries(),
                    obs.filename,
                    name
                );
            }
        }
    }

    let mut sinks: Vec<S> = sinks.into_values().collect();
    for sink in &mut sinks {
        sink.close()?;
    }
    Ok(sinks)
}

/// Create every input of a fitting campaign: the nominal processes, one set per tau energy
/// scale point and one per shape systematic variation, all in the same files. Files are named by
/// `fname` as in [`createinputs`].
pub fn create_fit_inputs(
    setup: &FitSetup,
    set: &SampleSet,
    cache: &PlanCache,
    fname: &str,
    options: &InputOptions,
) -> TauFitResult<Vec<PathBuf>> {
    let observables = setup.variables()?;
    let bins = setup.bins();
    let shift_options = ShiftOptions::default().split(true).share(true);
    let base = options.clone().dots(true);

    let nominal = base.clone().filter(setup.processes.clone()).recreate(true);
    let files = createinputs(fname, set, cache, &observables, &bins, &nominal)?;

    if let Some(tes) = &setup.tes_variations {
        let variation = base.clone().filter(tes.processes.clone()).recreate(false);
        for value in &tes.values {
            let (filetag, nametag, titletag) = tes_tags(*value);
            log::info!("Tau energy scale {value:.3}");
            let shifted = set.shift(&tes.processes, &filetag, &nametag, &titletag, shift_options)?;
            createinputs(fname, &shifted, cache, &observables, &bins, &variation)?;
        }
    }

    for systematic in setup.systematics.values() {
        if !systematic.is_shape() {
            log::debug!(
                "Systematic '{}' ({}) needs no templates",
                systematic.name,
                systematic.effect
            );
            continue;
        }
        for i in 0..systematic.variations.len() {
            let (filetag, nametag, replaceweight) = systematic.variation(i);
            log::info!("Systematic {}", nametag.trim_start_matches('_'));
            let shifted = set.shift(
                &systematic.processes,
                &filetag,
                &nametag,
                &systematic.title,
                shift_options,
            )?;
            let mut variation = base
                .clone()
                .filter(systematic.processes.clone())
                .recreate(false);
            if let Some((old, new)) = replaceweight {
                variation = variation.replaceweight(old, new);
            }
            createinputs(fname, &shifted, cache, &observables, &bins, &variation)?;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Cutflow, EventSource, EventTable, MemorySource},
        engine::EngineOptions,
        sample::{LeafSample, Sample},
        variable::Binning,
    };
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("taufit_datacard_{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn source() -> Arc<dyn EventSource> {
        let n = 40;
        let table = EventTable::from_columns([
            ("m_vis", (0..n).map(|i| i as f64 + 0.5).collect::<Vec<f64>>()),
            ("genmatch_2", (0..n).map(|i| if i % 2 == 0 { 5.0 } else { 0.0 }).collect()),
            ("dm_2", (0..n).map(|i| if i < 20 { 0.0 } else { 1.0 }).collect()),
            ("zptweight", vec![2.0; n]),
        ])
        .unwrap();
        let mut cutflow = vec![0.0; 15];
        cutflow[0] = 100.0;
        cutflow[14] = 100.0;
        let mut builder = MemorySource::new();
        for file in ["Data.root", "DY.root", "DY_TES1p030.root", "TT.root"] {
            builder = builder
                .with_tree(file, "tree", table.clone())
                .with_cutflow(file, Cutflow(cutflow.clone()));
        }
        builder.shared()
    }

    fn sample_set() -> SampleSet {
        let source = source();
        let mc = |name: &str, file: &str| -> Sample {
            LeafSample::builder(name, format!("{name} title"), file)
                .xsec(0.1)
                .lumi(1.0)
                .weight("zptweight")
                .build(source.clone())
                .unwrap()
                .into()
        };
        let data: Sample = LeafSample::builder("Data", "Observed", "Data.root")
            .data()
            .build(source.clone())
            .unwrap()
            .into();
        let mut set = SampleSet::new(Some(data), vec![mc("DY", "DY.root"), mc("Top", "TT.root")], vec![])
            .with_channel("mutau");
        set.split(&["DY"], &[("ZTT", "real", "genmatch_2==5"), ("ZJ", "fake", "genmatch_2!=5")])
            .unwrap();
        set
    }

    fn observable() -> Variable {
        Variable::new("m_vis", "m_vis", Binning::uniform(4, 0.0, 40.0).unwrap())
    }

    #[test]
    fn test_process_name() {
        let info = SampleInfo {
            name: "ZTT_TES1.030".to_string(),
            ..Default::default()
        };
        let options = InputOptions::new();
        assert_eq!(process_name(&info, "DM0", &options).unwrap(), "ZTT_TES1p030");
        let options = InputOptions::new().dots(true).htag("_shape_dyUp");
        assert_eq!(
            process_name(&info, "DM0", &options).unwrap(),
            "ZTT_TES1.030_shape_dyUp"
        );
        let data = SampleInfo {
            name: "SingleMuon".to_string(),
            isdata: true,
            ..Default::default()
        };
        let options = InputOptions::new().replacename("_obs$", "_observed");
        assert_eq!(process_name(&data, "DM0", &options).unwrap(), "data_observed");
        let already = InputOptions::new().htag("_TESUp");
        let tagged = SampleInfo {
            name: "ZTT_TESUp".to_string(),
            ..Default::default()
        };
        assert_eq!(process_name(&tagged, "DM0", &already).unwrap(), "ZTT_TESUp");
    }

    #[test]
    fn test_createinputs_nominal() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = temp_dir();
        let set = sample_set();
        let cache = PlanCache::new(EngineOptions::new());
        let bins = vec![
            Selection::new("DM0", "dm_2==0"),
            Selection::new("DM1", "dm_2==1"),
        ];
        let options = InputOptions::new()
            .outdir(dir.to_string_lossy())
            .tag("-test")
            .filter(["ZTT", "ZJ", "data_obs"])
            .recreate(true);
        let files = createinputs(
            "mt_$OBS$TAG.inputs.json",
            &set,
            &cache,
            &[observable()],
            &bins,
            &options,
        )
        .unwrap();
        assert_eq!(files, vec![dir.join("mt_m_vis-test.inputs.json")]);
        let inputs = read_inputs(&files[0].to_string_lossy()).unwrap();
        assert_eq!(inputs.names("DM0"), vec!["data_obs", "ZTT", "ZJ"]);
        assert_eq!(inputs.bins["DM1"].selection.as_deref(), Some("dm_2==1"));
        let data = inputs.get("DM0", "data_obs").unwrap();
        assert_relative_eq!(data.integral(), 20.0);
        // ZTT: half of the 20 events in DM0, weight 2, norm 1
        assert_relative_eq!(inputs.get("DM0", "ZTT").unwrap().integral(), 20.0);
        assert_eq!(inputs.get("DM0", "ZTT").unwrap().title, "m_vis");
        assert!(inputs.get("DM0", "Top").is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_eras_write_separate_files() {
        let dir = temp_dir();
        let set = sample_set();
        let cache = PlanCache::new(EngineOptions::new());
        let bins = vec![Selection::new("DM0", "dm_2==0")];
        let fname = "$ANALYSIS_$OBS_$CHANNEL-$ERA$TAG.inputs.json";
        let base = InputOptions::new()
            .outdir(dir.to_string_lossy())
            .analysis("ztt")
            .recreate(true);
        let first = base.clone().era("UL2017").filter(["Top"]);
        let second = base.era("UL2018").filter(["ZTT"]);
        let files_2017 = createinputs(fname, &set, &cache, &[observable()], &bins, &first).unwrap();
        let files_2018 = createinputs(fname, &set, &cache, &[observable()], &bins, &second).unwrap();
        assert_eq!(files_2017, vec![dir.join("ztt_m_vis_mt-UL2017.inputs.json")]);
        assert_eq!(files_2018, vec![dir.join("ztt_m_vis_mt-UL2018.inputs.json")]);
        let inputs_2017 = read_inputs(&files_2017[0].to_string_lossy()).unwrap();
        let inputs_2018 = read_inputs(&files_2018[0].to_string_lossy()).unwrap();
        assert_eq!(inputs_2017.names("DM0"), vec!["Top"]);
        assert_eq!(inputs_2018.names("DM0"), vec!["ZTT"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_weight_variation_updates_file() {
        let dir = temp_dir();
        let set = sample_set();
        let cache = PlanCache::new(EngineOptions::new());
        let bins = vec![Selection::new("DM0", "dm_2==0")];
        let fname = dir.join("$OBS.json").to_string_lossy().into_owned();
        let nominal = InputOptions::new().filter(["Top", "data_obs"]).recreate(true);
        createinputs(&fname, &set, &cache, &[observable()], &bins, &nominal).unwrap();
        let systematic = Systematic::new("_shape_dy$ERA", ["Top"], &[("ERA", "")])
            .with_replaceweight("zptweight", "zptweight*zptweight", "1");
        let [up, down] = systematic.variations(&InputOptions::new());
        createinputs(&fname, &set, &cache, &[observable()], &bins, &up).unwrap();
        createinputs(&fname, &set, &cache, &[observable()], &bins, &down).unwrap();
        let inputs = read_inputs(&fname.replace("$OBS", "m_vis")).unwrap();
        assert_eq!(
            inputs.names("DM0"),
            vec!["data_obs", "Top", "Top_shape_dyUp", "Top_shape_dyDown"]
        );
        assert_relative_eq!(inputs.get("DM0", "Top").unwrap().integral(), 40.0);
        assert_relative_eq!(inputs.get("DM0", "Top_shape_dyUp").unwrap().integral(), 80.0);
        assert_relative_eq!(inputs.get("DM0", "Top_shape_dyDown").unwrap().integral(), 20.0);
        assert_eq!(inputs.bins["DM0"].selection.as_deref(), Some("dm_2==0"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_negative_bins_are_clipped() {
        let dir = temp_dir();
        let set = sample_set();
        let cache = PlanCache::new(EngineOptions::new());
        let bins = vec![Selection::new("DM0", "dm_2==0")];
        let fname = dir.join("$OBS.json").to_string_lossy().into_owned();
        let options = InputOptions::new().filter(["Top"]).weight("-1").recreate(true);
        createinputs(&fname, &set, &cache, &[observable()], &bins, &options).unwrap();
        let inputs = read_inputs(&fname.replace("$OBS", "m_vis")).unwrap();
        let top = inputs.get("DM0", "Top").unwrap();
        assert!(top.contents().iter().all(|content| *content == 0.0));
        assert!(top.bin_error(0) > 0.0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_create_fit_inputs() {
        let dir = temp_dir();
        let set = sample_set();
        let cache = PlanCache::new(EngineOptions::new());
        let setup = FitSetup::from_json_str(
            r#"{
                "channel": "mutau",
                "baselineCuts": "m_vis>0",
                "observables": {"m_vis": {"binning": [4, 0, 40]}},
                "regions": {"DM0": {"title": "h", "definition": "dm_2==0"}},
                "processes": ["ZTT", "ZJ", "Top", "data_obs"],
                "TESvariations": {"processes": ["ZTT"], "values": [1.030]},
                "systematics": {
                    "dy": {
                        "name": "shape_dy",
                        "effect": "shape",
                        "processes": ["ZJ"],
                        "variations": ["Up", "Down"],
                        "nomWeight": "zptweight",
                        "altWeights": ["zptweight*zptweight", "1"]
                    },
                    "lumi": {"name": "lumi", "effect": "lnN", "processes": ["Top"]}
                }
            }"#,
        )
        .unwrap();
        let fname = dir.join("$OBS.json").to_string_lossy().into_owned();
        let files = create_fit_inputs(&setup, &set, &cache, &fname, &InputOptions::new()).unwrap();
        assert_eq!(files.len(), 1);
        let inputs = read_inputs(&files[0].to_string_lossy()).unwrap();
        assert_eq!(
            inputs.names("DM0"),
            vec![
                "data_obs",
                "ZTT",
                "ZJ",
                "Top",
                "ZTT_TES1.030",
                "ZJ_shape_dyUp",
                "ZJ_shape_dyDown"
            ]
        );
        assert_eq!(inputs.names("baseline").len(), 7);
        assert_eq!(
            inputs.bins["DM0"].selection.as_deref(),
            Some("m_vis>0 && dm_2==0")
        );
        assert_relative_eq!(inputs.get("DM0", "ZJ_shape_dyUp").unwrap().integral(), 40.0);
        assert_relative_eq!(inputs.get("DM0", "ZJ_shape_dyDown").unwrap().integral(), 10.0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
