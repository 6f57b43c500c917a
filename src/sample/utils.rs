use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock},
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    context::PlotContext,
    data::EventSource,
    sample::{LeafSample, MergedSample, Sample, SampleSet},
    utils::{expand_glob, glob_to_regex, is_glob, repkey, MatchMode},
    TauFitError, TauFitResult,
};

/// Default file name pattern of the input ntuples.
pub const DEFAULT_FILE_PATTERN: &str = "$PICODIR/$SAMPLE_$CHANNEL$TAG.root";

/// Inclusive (N)NLO cross sections in pb used to compute stitching k-factors.
pub const XSECS_NLO: [(&str, f64); 3] = [
    ("DYJetsToLL_M-50", 3.0 * 2025.74),
    ("DYJetsToLL_M-10to50", 18610.0),
    ("WJetsToLNu", 3.0 * 20508.9),
];

/// Highest jet multiplicity with an exclusive sample; larger multiplicities take the inclusive
/// weight.
const MAX_NJETS: usize = 4;

static JET_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d{1,2})J(?:_|$)").unwrap());
static JET_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d)Jets").unwrap());

/// One simulated sample: `(group, name, title, xsec)` plus optional settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    /// Group (file sub-directory)
    pub group: String,
    /// Sample name
    pub name: String,
    /// Title
    pub title: String,
    /// Cross section in pb
    pub xsec: f64,
    /// Sample-specific weight
    #[serde(default)]
    pub extraweight: String,
    /// Expected number of events
    #[serde(default)]
    pub nexpevts: Option<f64>,
}

impl SampleRow {
    /// A row without extra settings.
    pub fn new(group: &str, name: &str, title: &str, xsec: f64) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            title: title.to_string(),
            xsec,
            extraweight: String::new(),
            nexpevts: None,
        }
    }
}

/// The observed data: a file name (possibly a glob over several data sets).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    /// Group (file sub-directory)
    #[serde(default = "DataRow::default_group")]
    pub group: String,
    /// Sample name, e.g. `SingleMuon_Run2018?`
    pub name: String,
    /// Title
    #[serde(default = "DataRow::default_title")]
    pub title: String,
}

impl DataRow {
    fn default_group() -> String {
        "Data".to_string()
    }
    fn default_title() -> String {
        "Observed".to_string()
    }

    /// Data from the `Data` group named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            group: Self::default_group(),
            name: name.to_string(),
            title: Self::default_title(),
        }
    }
}

/// The table of samples of one analysis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleDefinitions {
    /// Observed data per channel
    #[serde(default)]
    pub data: BTreeMap<String, DataRow>,
    /// Expected processes
    #[serde(default)]
    pub exp: Vec<SampleRow>,
    /// Signal processes
    #[serde(default)]
    pub signal: Vec<SampleRow>,
    /// Common weight for simulation
    #[serde(default)]
    pub weight: String,
    /// Common weight for data
    #[serde(default)]
    pub dataweight: String,
    /// Tag in the file names
    #[serde(default)]
    pub tag: String,
    /// Directory of the ntuples, substituted for `$PICODIR`
    #[serde(default)]
    pub picodir: String,
}

/// Build the sample set of one channel from `definitions`.
///
/// Files are found through `pattern` (default [`DEFAULT_FILE_PATTERN`]) with the keys `$PICODIR`,
/// `$ERA`, `$GROUP`, `$SAMPLE`, `$CHANNEL` and `$TAG` substituted. A data name with wildcards
/// is expanded on disk and the matching files are merged into one data sample.
pub fn get_sample_set(
    context: &PlotContext,
    channel: &str,
    definitions: &SampleDefinitions,
    pattern: Option<&str>,
    source: Arc<dyn EventSource>,
) -> TauFitResult<SampleSet> {
    let pattern = pattern.unwrap_or(DEFAULT_FILE_PATTERN);
    let filename = |group: &str, name: &str| {
        repkey(
            pattern,
            &[
                ("PICODIR", definitions.picodir.as_str()),
                ("ERA", context.era.as_str()),
                ("GROUP", group),
                ("SAMPLE", name),
                ("CHANNEL", channel),
                ("TAG", definitions.tag.as_str()),
            ],
        )
    };
    let build = |row: &SampleRow, signal: bool| -> TauFitResult<Sample> {
        let mut builder = LeafSample::builder(&row.name, &row.title, filename(&row.group, &row.name))
            .xsec(row.xsec)
            .lumi(context.lumi)
            .weight(definitions.weight.as_str())
            .extraweight(row.extraweight.as_str())
            .tags([row.group.as_str()]);
        if let Some(nexpevts) = row.nexpevts {
            builder = builder.nexpevts(nexpevts);
        }
        if signal {
            builder = builder.signal();
        }
        Ok(builder.build(source.clone())?.into())
    };
    let exp = definitions
        .exp
        .iter()
        .map(|row| build(row, false))
        .collect::<TauFitResult<Vec<_>>>()?;
    let signal = definitions
        .signal
        .iter()
        .map(|row| build(row, true))
        .collect::<TauFitResult<Vec<_>>>()?;
    let data = match definitions.data.get(channel) {
        Some(row) => Some(data_sample(
            row,
            &filename(&row.group, &row.name),
            definitions,
            context,
            source.clone(),
        )?),
        None => {
            log::warn!("get_sample_set: no data defined for channel '{channel}'");
            None
        }
    };
    Ok(SampleSet::new(data, exp, signal)
        .with_channel(channel)
        .with_name(&context.era))
}

fn data_sample(
    row: &DataRow,
    filename: &str,
    definitions: &SampleDefinitions,
    context: &PlotContext,
    source: Arc<dyn EventSource>,
) -> TauFitResult<Sample> {
    let build = |name: &str, title: &str, filename: &str| -> TauFitResult<Sample> {
        Ok(LeafSample::builder(name, title, filename)
            .data()
            .lumi(context.lumi)
            .weight(definitions.dataweight.as_str())
            .build(source.clone())?
            .into())
    };
    if !is_glob(filename) {
        return build(&row.name, &row.title, filename);
    }
    let files = expand_glob(filename)?;
    match files.len() {
        0 => Err(TauFitError::MissingFile {
            path: filename.to_string(),
        }),
        1 => build(&row.name, &row.title, &files[0].to_string_lossy()),
        _ => {
            let setname = Regex::new(&glob_to_regex(&row.name))?;
            let name = row.name.replace(['?', '*'], "");
            let mut merged = MergedSample::new(&name, &row.title, Vec::new());
            for file in files {
                let path = file.to_string_lossy().to_string();
                let part = setname
                    .find(&path)
                    .map_or_else(|| path.clone(), |found| found.as_str().to_string());
                let title = if part.contains("_Run20") {
                    format!("Obs. ({})", part.rsplit('_').next().unwrap_or(&part))
                } else {
                    row.title.clone()
                };
                merged.add(build(&part, &title, &path)?);
            }
            Ok(merged.into())
        }
    }
}

/// Merge the samples matching all `terms` into one sample at the position of the first of them.
///
/// Returns `false` (leaving `samples` unchanged) if fewer than two samples match.
pub fn join_samples<S: AsRef<str>>(
    samples: &mut Vec<Sample>,
    terms: &[S],
    name: &str,
    title: &str,
) -> TauFitResult<bool> {
    let mut indices = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        if sample.matches(terms, MatchMode::All)? {
            indices.push(i);
        }
    }
    if indices.len() < 2 {
        return Ok(false);
    }
    let first = indices[0];
    let mut children: Vec<Sample> = indices.iter().rev().map(|&i| samples.remove(i)).collect();
    children.reverse();
    log::debug!(
        "join: merging {:?} into '{name}'",
        children.iter().map(Sample::name).collect::<Vec<_>>()
    );
    let title = if title.is_empty() { name } else { title };
    samples.insert(first, MergedSample::new(name, title, children).into());
    Ok(true)
}

/// Options for [`stitch_samples`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StitchOptions {
    /// Name of the stitched sample (default: the first matched sample)
    pub name: Option<String>,
    /// Title of the stitched sample (default: the inclusive sample's)
    pub title: Option<String>,
    /// Search term of the inclusive sample (default: the first search term)
    pub incl: Option<String>,
    /// Inclusive (N)NLO cross section used for the k-factor
    pub xsec: Option<f64>,
    /// Explicit k-factor
    pub kfactor: Option<f64>,
    /// Branch holding the number of partons
    pub npart: String,
    /// Centre-of-mass energy in TeV; k-factors are only derived at 13 TeV
    pub cme: f64,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            name: None,
            title: None,
            incl: None,
            xsec: None,
            kfactor: None,
            npart: "NUP".to_string(),
            cme: 13.0,
        }
    }
}

/// The inclusive NLO cross section for a set of search terms, if one is known.
pub fn xsec_nlo<S: AsRef<str>>(terms: &[S]) -> Option<f64> {
    let lookup = |key: &str| {
        XSECS_NLO
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, xsec)| *xsec)
    };
    for term in terms {
        let term = term.as_ref();
        if term.contains("DY") {
            if terms.iter().any(|term| term.as_ref().contains("10to50")) {
                return lookup("DYJetsToLL_M-10to50");
            }
            return lookup("DYJetsToLL_M-50");
        } else if term.contains("WJ") {
            return lookup("WJetsToLNu");
        } else if let Some(xsec) = lookup(term) {
            return Some(xsec);
        }
    }
    log::warn!(
        "xsec_nlo: no DY or WJ match in {:?}",
        terms.iter().map(AsRef::as_ref).collect::<Vec<_>>()
    );
    None
}

/// The jet multiplicity of an exclusive sample: a `_<n>J` suffix, or the digit before `Jets`.
pub fn jet_multiplicity(name: &str) -> Option<usize> {
    JET_SUFFIX
        .captures(name)
        .or_else(|| JET_PREFIX.captures(name))
        .and_then(|caps| caps[1].parse().ok())
}

/// Stitch an inclusive sample with jet-binned samples and join them.
///
/// Each jet-binned sample `n` gets normalization 1 and the weight
/// `w_n = lumi * k * xsec_n * 1000 / (sumw_n + xsec_n / xsec_incl * sumw_incl)`; the inclusive
/// sample gets normalization 1 and the weight `(npart==0||npart>4 ? w_incl : 1) * (npart==n ? w_n : 1) * ...`.
pub fn stitch_samples<S: AsRef<str>>(
    samples: &mut Vec<Sample>,
    terms: &[S],
    options: &StitchOptions,
) -> TauFitResult<()> {
    let first_term = terms.first().map(|term| term.as_ref().to_string()).unwrap_or_default();
    let incl_term = options.incl.clone().unwrap_or_else(|| first_term.clone());
    let mut matched = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        if sample.matches(terms, MatchMode::All)? {
            matched.push(i);
        }
    }
    let mut incl = None;
    let mut njets: BTreeMap<usize, usize> = BTreeMap::new();
    for &i in &matched {
        let sample = &samples[i];
        match jet_multiplicity(sample.name()) {
            Some(n) => {
                if njets.insert(n, i).is_some() {
                    log::warn!("stitch: several samples with {n} jets, using '{}'", sample.name());
                }
            }
            None if incl.is_none() && sample.matches(&[incl_term.as_str()], MatchMode::All)? => {
                incl = Some(i)
            }
            None => log::warn!("stitch: cannot tell the jet multiplicity of '{}'", sample.name()),
        }
    }
    let incl = match incl {
        Some(incl) => incl,
        None => {
            log::warn!("stitch: no inclusive sample matching '{incl_term}'");
            return Ok(());
        }
    };
    let leaf = |sample: &Sample| -> TauFitResult<LeafSample> {
        sample.as_leaf().cloned().ok_or_else(|| {
            TauFitError::Custom(format!("stitch: '{}' is not a single sample", sample.name()))
        })
    };
    let sample_incl = leaf(&samples[incl])?;
    if matched.len() < 2 {
        log::warn!(
            "stitch: fewer than two samples match {:?}, only applying the k-factor",
            terms.iter().map(AsRef::as_ref).collect::<Vec<_>>()
        );
        if let (Some(kfactor), Some(leaf)) = (options.kfactor, samples[incl].as_leaf_mut()) {
            leaf.norm *= kfactor;
        }
        return Ok(());
    }
    let kfactor = match options.kfactor {
        Some(kfactor) => kfactor,
        None if options.cme == 13.0 => {
            let mut lookup: Vec<String> = vec![options.name.clone().unwrap_or_default()];
            lookup.extend(terms.iter().map(|term| term.as_ref().to_string()));
            let corrected = options
                .xsec
                .or_else(|| xsec_nlo(&lookup))
                .unwrap_or(sample_incl.xsec);
            corrected / sample_incl.xsec
        }
        None => 1.0,
    };
    log::info!("stitch: '{}' k-factor = {kfactor}", sample_incl.name);
    let w_incl = sample_incl.lumi * kfactor * sample_incl.xsec * 1000.0 / sample_incl.sumweights;
    let mut weights = BTreeMap::new();
    for (&n, &i) in &njets {
        let sample = leaf(&samples[i])?;
        let efficiency = sample.xsec / sample_incl.xsec;
        let weight = sample.lumi * kfactor * sample.xsec * 1000.0
            / (sample.sumweights + efficiency * sample_incl.sumweights);
        log::debug!("stitch: {n}-jet weight = {weight}");
        weights.insert(n, weight);
    }
    let npart = &options.npart;
    let mut incl_weight = if weights.is_empty() {
        format!("({w_incl})")
    } else {
        format!("({npart}==0||{npart}>{MAX_NJETS} ? {w_incl} : 1)")
    };
    for (n, weight) in &weights {
        incl_weight.push_str(&format!(" * ({npart}=={n} ? {weight} : 1)"));
    }
    let incl_weight = format!("({incl_weight})");
    if let Some(leaf) = samples[incl].as_leaf_mut() {
        leaf.norm = 1.0;
    }
    samples[incl].add_weight(incl_weight.as_str());
    for (n, &i) in &njets {
        if let Some(leaf) = samples[i].as_leaf_mut() {
            leaf.norm = 1.0;
        }
        samples[i].add_weight(format!("{}", weights[n]).as_str());
    }
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| samples[matched[0]].name().to_string());
    let title = options.title.clone().unwrap_or(sample_incl.title);
    join_samples(samples, terms, &name, &title)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Cutflow, EventTable, MemorySource};
    use approx::assert_relative_eq;

    fn source(files: &[(&str, f64)]) -> Arc<dyn EventSource> {
        let table = EventTable::from_columns([("NUP", vec![0.0, 1.0, 2.0, 5.0])]).unwrap();
        let mut source = MemorySource::new();
        for (file, sumw) in files {
            let mut cutflow = vec![0.0; 15];
            cutflow[0] = *sumw;
            cutflow[14] = *sumw;
            source = source
                .with_tree(*file, "tree", table.clone())
                .with_cutflow(*file, Cutflow(cutflow));
        }
        source.shared()
    }

    #[test]
    fn test_jet_multiplicity() {
        assert_eq!(jet_multiplicity("DY1JetsToLL_M-50"), Some(1));
        assert_eq!(jet_multiplicity("DYJetsToLL_M-50"), None);
        assert_eq!(jet_multiplicity("WJetstoLNu-4Jets_2J"), Some(2));
        assert_eq!(jet_multiplicity("DYto2L-4Jets_MLL-50_1J"), Some(1));
        assert_eq!(jet_multiplicity("DYto2L_MLL-50_12J"), Some(12));
        assert_relative_eq!(xsec_nlo(&["DY*J*M-50"]).unwrap(), 3.0 * 2025.74);
        assert_relative_eq!(xsec_nlo(&["DY", "10to50"]).unwrap(), 18610.0);
        assert!(xsec_nlo(&["TT"]).is_none());
    }

    #[test]
    fn test_join_samples() {
        let source = source(&[("A.root", 10.0), ("B.root", 10.0), ("C.root", 10.0)]);
        let make = |name: &str| -> Sample {
            LeafSample::builder(name, name, format!("{name}.root"))
                .xsec(1.0)
                .lumi(1.0)
                .build(source.clone())
                .unwrap()
                .into()
        };
        let mut samples = vec![make("A"), make("B"), make("C")];
        assert!(!join_samples(&mut samples, &["A"], "X", "").unwrap());
        assert!(join_samples(&mut samples, &["B|C"], "BC", "").unwrap());
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].name(), "BC");
        assert_eq!(samples[1].title(), "BC");
    }

    #[test]
    fn test_stitch_weights() {
        let lumi = 41.48;
        let (n_incl, n_1j) = (1.06e8, 8.1e7);
        let source = source(&[("DYJetsToLL_M-50.root", n_incl), ("DY1JetsToLL_M-50.root", n_1j)]);
        let make = |name: &str, xsec: f64| -> Sample {
            LeafSample::builder(name, "Drell-Yan", format!("{name}.root"))
                .xsec(xsec)
                .lumi(lumi)
                .build(source.clone())
                .unwrap()
                .into()
        };
        let mut samples = vec![make("DYJetsToLL_M-50", 5343.0), make("DY1JetsToLL_M-50", 877.8)];
        let options = StitchOptions {
            name: Some("DY".to_string()),
            incl: Some("DYJ".to_string()),
            ..Default::default()
        };
        stitch_samples(&mut samples, &["DY*J*M-50"], &options).unwrap();
        assert_eq!(samples.len(), 1);
        let merged = &samples[0];
        assert_eq!(merged.name(), "DY");
        let k = 3.0 * 2025.74 / 5343.0;
        let w_incl = lumi * k * 5343.0 * 1000.0 / n_incl;
        let w_1j = lumi * k * 877.8 * 1000.0 / (n_1j + 877.8 / 5343.0 * n_incl);
        let children = merged.children();
        let incl = children[0].as_leaf().unwrap();
        assert_relative_eq!(incl.norm, 1.0);
        assert_eq!(
            incl.weight.as_str(),
            format!("((NUP==0||NUP>4 ? {w_incl} : 1) * (NUP==1 ? {w_1j} : 1))")
        );
        let exclusive = children[1].as_leaf().unwrap();
        assert_relative_eq!(exclusive.norm, 1.0);
        assert_eq!(exclusive.weight.as_str(), format!("{w_1j}"));
    }

    #[test]
    fn test_stitched_event_weights() {
        let lumi = 59830.0;
        let (n_incl, n_1j) = (1.06e8, 8.1e7);
        let source = source(&[("DYJetsToLL_M-50.root", n_incl), ("DY1JetsToLL_M-50.root", n_1j)]);
        let make = |name: &str, xsec: f64| -> Sample {
            LeafSample::builder(name, "Drell-Yan", format!("{name}.root"))
                .xsec(xsec)
                .lumi(lumi)
                .build(source.clone())
                .unwrap()
                .into()
        };
        let mut samples = vec![make("DYJetsToLL_M-50", 5343.0), make("DY1JetsToLL_M-50", 877.8)];
        assert!(samples[0].as_leaf().unwrap().norm > 1.0);
        let options = StitchOptions {
            incl: Some("DYJ".to_string()),
            ..Default::default()
        };
        stitch_samples(&mut samples, &["DY*J*M-50"], &options).unwrap();
        let k = 6077.22 / 5343.0;
        assert_relative_eq!(k, 1.1374, epsilon = 1e-4);
        let w0 = lumi * k * 5343.0 * 1000.0 / n_incl;
        let w1 = lumi * k * 877.8 * 1000.0 / (n_1j + n_incl * 877.8 / 5343.0);

        let children = samples[0].children();
        let incl = children[0].as_leaf().unwrap();
        assert_eq!(incl.norm, 1.0);
        let npart = EventTable::from_columns([("NUP", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0])]).unwrap();
        let weights = incl.weight.compile().unwrap().evaluate(&npart).unwrap();
        let expected = [w0, w1, 1.0, 1.0, 1.0, w0];
        for (weight, expected) in weights.iter().zip(expected) {
            assert_relative_eq!(*weight, expected, max_relative = 1e-12);
        }
        let exclusive = children[1].as_leaf().unwrap();
        assert_eq!(exclusive.norm, 1.0);
        let weights = exclusive.weight.compile().unwrap().evaluate(&npart).unwrap();
        assert!(weights.iter().all(|weight| (weight - w1).abs() < 1e-12 * w1));
    }

    #[test]
    fn test_get_sample_set() {
        let source = source(&[
            ("Data/SingleMuon_mutau.root", 100.0),
            ("DY/DYJetsToLL_M-50_mutau.root", 1.0e6),
            ("TT/TTTo2L2Nu_mutau.root", 2.0e6),
        ]);
        let mut definitions = SampleDefinitions {
            exp: vec![
                SampleRow::new("DY", "DYJetsToLL_M-50", "Drell-Yan", 5343.0),
                SampleRow::new("TT", "TTTo2L2Nu", "ttbar", 88.29),
            ],
            weight: "genweight".to_string(),
            ..Default::default()
        };
        definitions
            .data
            .insert("mutau".to_string(), DataRow::new("SingleMuon"));
        let context = PlotContext::new("UL2018", 59.83, 13.0);
        let set = get_sample_set(
            &context,
            "mutau",
            &definitions,
            Some("$GROUP/$SAMPLE_$CHANNEL$TAG.root"),
            source,
        )
        .unwrap();
        assert_eq!(set.channel, "mutau");
        assert_eq!(set.data.as_ref().unwrap().filename(), "Data/SingleMuon_mutau.root");
        let tt = set.get(&["TT"]).unwrap().as_leaf().unwrap();
        assert_eq!(tt.weight.as_str(), "genweight");
        assert_relative_eq!(tt.norm, 59.83 * 88.29 * 1000.0 / 2.0e6);
        assert!(get_sample_set(&context, "etau", &definitions, Some("$GROUP/$SAMPLE.root"), source_missing()).is_err());
    }

    fn source_missing() -> Arc<dyn EventSource> {
        MemorySource::new().shared()
    }
}
