use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    selection::Selection,
    variable::{Binning, Variable},
    TauFitError, TauFitResult,
};

/// Binning and options of one observable in a [`FitSetup`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservableSetup {
    /// `[nbins, xmin, xmax]`, or the bin edges when there are more or fewer than three numbers
    pub binning: Vec<f64>,
    /// Axis title
    #[serde(default)]
    pub title: Option<String>,
    /// Extra options
    #[serde(default)]
    pub extra: ObservableExtra,
    /// Regions whose likelihood scans use this observable (all regions when empty)
    #[serde(rename = "scanRegions", default)]
    pub scan_regions: Vec<String>,
}

impl ObservableSetup {
    /// Whether `region` was scanned with this observable.
    pub fn scans(&self, region: &str) -> bool {
        self.scan_regions.is_empty() || self.scan_regions.iter().any(|r| r == region)
    }
}

/// Optional settings of an observable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservableExtra {
    /// Cut defining the domain of the observable
    #[serde(default)]
    pub cut: Option<String>,
    /// Weight for simulation
    #[serde(default)]
    pub weight: Option<String>,
    /// File name slug
    #[serde(default)]
    pub filename: Option<String>,
}

/// One fit region: a cut added to the baseline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSetup {
    /// Title for plots and tables
    pub title: String,
    /// Cut added to the baseline cuts
    pub definition: String,
}

/// The tau energy scale points scanned by shifting input files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TesVariations {
    /// Processes read from the shifted files
    pub processes: Vec<String>,
    /// Scale values, e.g. `0.970` to `1.030`
    pub values: Vec<f64>,
}

/// A systematic variation of some processes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystematicSetup {
    /// Name used in histogram names, e.g. `shape_mTauFake`
    pub name: String,
    /// Title suffix of the varied samples
    #[serde(default)]
    pub title: String,
    /// `shape` or a normalization-only effect such as `lnN`
    pub effect: String,
    /// Affected processes
    pub processes: Vec<String>,
    /// Variation tags, e.g. `["Up", "Down"]`
    #[serde(default)]
    pub variations: Vec<String>,
    /// File tag per variation
    #[serde(default)]
    pub sample_append: Vec<String>,
    /// Nominal weight replaced in each variation
    #[serde(default)]
    pub nom_weight: Option<String>,
    /// Replacement weight per variation
    #[serde(default)]
    pub alt_weights: Vec<String>,
}

impl SystematicSetup {
    /// Whether this systematic changes shapes (and so needs its own histograms).
    pub fn is_shape(&self) -> bool {
        self.effect == "shape"
    }

    /// `(filetag, nametag, replaceweight)` of variation `i`.
    pub fn variation(&self, i: usize) -> (String, String, Option<(String, String)>) {
        let filetag = self.sample_append.get(i).cloned().unwrap_or_default();
        let nametag = format!(
            "_{}{}",
            self.name,
            self.variations.get(i).map(String::as_str).unwrap_or_default()
        );
        let replaceweight = match (&self.nom_weight, self.alt_weights.get(i)) {
            (Some(old), Some(new)) => Some((old.clone(), new.clone())),
            _ => None,
        };
        (filetag, nametag, replaceweight)
    }
}

/// A fitting campaign: observables, regions, processes and systematics of one channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSetup {
    /// Analysis channel, e.g. `mutau`
    pub channel: String,
    /// Tag for output files
    #[serde(default)]
    pub tag: String,
    /// Cuts common to all regions
    #[serde(rename = "baselineCuts", default)]
    pub baseline_cuts: String,
    /// Observables by name
    #[serde(default)]
    pub observables: IndexMap<String, ObservableSetup>,
    /// Fit regions by name
    #[serde(default)]
    pub regions: IndexMap<String, RegionSetup>,
    /// Order of the regions in measurement tables (the order of `regions` when empty)
    #[serde(rename = "plottingOrder", default)]
    pub plotting_order: Vec<String>,
    /// Parameters of interest
    #[serde(default)]
    pub pois: Vec<String>,
    /// Nominal processes (including `data_obs`)
    #[serde(default)]
    pub processes: Vec<String>,
    /// Tau energy scale points
    #[serde(rename = "TESvariations", default)]
    pub tes_variations: Option<TesVariations>,
    /// Systematics by key
    #[serde(default)]
    pub systematics: IndexMap<String, SystematicSetup>,
}

impl FitSetup {
    /// Read a setup from a JSON file (the path is expanded with `shellexpand`).
    pub fn from_json<P: AsRef<Path>>(path: P) -> TauFitResult<Self> {
        let path = shellexpand::full(&path.as_ref().to_string_lossy())?.into_owned();
        if !Path::new(&path).exists() {
            return Err(TauFitError::MissingFile { path });
        }
        let file = std::fs::File::open(&path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Parse a setup from a JSON string.
    pub fn from_json_str(text: &str) -> TauFitResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The observables as variables.
    pub fn variables(&self) -> TauFitResult<Vec<Variable>> {
        let mut variables = Vec::with_capacity(self.observables.len());
        for (name, setup) in &self.observables {
            let binning = match setup.binning.as_slice() {
                [nbins, xmin, xmax] => Binning::uniform(*nbins as usize, *xmin, *xmax)?,
                edges => Binning::edges(edges.to_vec())?,
            };
            let title = setup.title.clone().unwrap_or_else(|| name.clone());
            let mut variable = Variable::new(name, title, binning);
            if let Some(cut) = &setup.extra.cut {
                variable = variable.with_cut(cut);
            }
            if let Some(weight) = &setup.extra.weight {
                variable = variable.with_weight(weight);
            }
            if let Some(filename) = &setup.extra.filename {
                variable = variable.with_filename(filename);
            }
            variables.push(variable);
        }
        Ok(variables)
    }

    /// The fit bins: the baseline, then every region on top of the baseline.
    pub fn bins(&self) -> Vec<Selection> {
        let mut bins = vec![Selection::new("baseline", &self.baseline_cuts)];
        for (name, region) in &self.regions {
            let cuts = if self.baseline_cuts.is_empty() {
                region.definition.clone()
            } else {
                format!("{} && {}", self.baseline_cuts, region.definition)
            };
            bins.push(Selection::new(name, cuts).with_title(&region.title));
        }
        bins
    }

    /// The regions scanned with at least one observable, in plotting order.
    pub fn scan_regions(&self) -> Vec<String> {
        let order: Vec<&String> = if self.plotting_order.is_empty() {
            self.regions.keys().collect()
        } else {
            self.plotting_order.iter().collect()
        };
        let mut regions: Vec<String> = Vec::new();
        for region in order {
            if !regions.contains(region) && self.observables.values().any(|obs| obs.scans(region)) {
                regions.push(region.clone());
            }
        }
        regions
    }

    /// Short channel name used in file names, e.g. `mt` for `mutau`.
    pub fn channel_short(&self) -> String {
        short_channel(&self.channel)
    }

    /// The table `{variation: [processes]}`: `Nom`, one entry per TES point and one per shape
    /// systematic variation.
    pub fn variations(&self) -> IndexMap<String, Vec<String>> {
        let mut variations = IndexMap::new();
        variations.insert("Nom".to_string(), self.processes.clone());
        if let Some(tes) = &self.tes_variations {
            for value in &tes.values {
                let (_, nametag, _) = tes_tags(*value);
                variations.insert(nametag.trim_start_matches('_').to_string(), tes.processes.clone());
            }
        }
        for systematic in self.systematics.values().filter(|syst| syst.is_shape()) {
            for i in 0..systematic.variations.len() {
                let (_, nametag, _) = systematic.variation(i);
                variations.insert(
                    nametag.trim_start_matches('_').to_string(),
                    systematic.processes.clone(),
                );
            }
        }
        variations
    }
}

/// Abbreviate a channel: `tau` to `t`, `mu` to `m`.
pub fn short_channel(channel: &str) -> String {
    channel.replace("tau", "t").replace("mu", "m")
}

/// `(filetag, nametag, titletag)` of a tau energy scale point, e.g. `("_TES1p030", "_TES1.030",
/// " -3% TES")`.
pub fn tes_tags(value: f64) -> (String, String, String) {
    let nametag = format!("_TES{value:.3}");
    let filetag = nametag.replace('.', "p");
    let titletag = format!(" {:.0}% TES", (1.0 - value) * 100.0);
    (filetag, nametag, titletag)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP: &str = r#"{
        "channel": "mutau",
        "tag": "_v1",
        "baselineCuts": "q_1*q_2<0 && iso_1<0.15",
        "observables": {
            "m_vis": {"binning": [10, 50, 150], "title": "m_vis"},
            "m_2": {"binning": [0.3, 0.6, 1.0, 1.5], "extra": {"cut": "dm_2==1"}, "scanRegions": ["DM1"]}
        },
        "plottingOrder": ["DM1", "DM0"],
        "regions": {
            "DM0": {"title": "h^{#pm}", "definition": "dm_2==0"},
            "DM1": {"title": "h^{#pm}#pi^{0}", "definition": "dm_2==1"}
        },
        "pois": ["tes"],
        "processes": ["ZTT", "ZL", "TTT", "W", "QCD", "data_obs"],
        "TESvariations": {"processes": ["ZTT"], "values": [0.990, 1.000, 1.010]},
        "systematics": {
            "shape_mTauFake": {
                "name": "shape_mTauFake",
                "title": "+/- 1% muon -> tau fake",
                "effect": "shape",
                "processes": ["ZL"],
                "variations": ["Up", "Down"],
                "sampleAppend": ["_LTFUp", "_LTFDown"]
            },
            "shape_dy": {
                "name": "shape_dy",
                "effect": "shape",
                "processes": ["ZTT", "ZL"],
                "variations": ["Up", "Down"],
                "nomWeight": "zptweight",
                "altWeights": ["zptweight*zptweight", "1"]
            },
            "lumi": {"name": "lumi", "effect": "lnN", "processes": ["ZTT"]}
        }
    }"#;

    #[test]
    fn test_parse_setup() {
        let setup = FitSetup::from_json_str(SETUP).unwrap();
        assert_eq!(setup.channel_short(), "mt");
        let variables = setup.variables().unwrap();
        assert_eq!(variables.len(), 2);
        assert_eq!(variables[0].binning.nbins(), 10);
        assert_eq!(variables[1].binning.nbins(), 3);
        assert_eq!(variables[1].cut.as_str(), "dm_2==1");
        let bins = setup.bins();
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[2].selection.as_str(), "q_1*q_2<0 && iso_1<0.15 && dm_2==1");
        assert_eq!(bins[2].filename, "DM1");
        assert_eq!(bins[1].title, "h^{#pm}");
        assert_eq!(setup.scan_regions(), vec!["DM1", "DM0"]);
        assert!(setup.observables["m_vis"].scans("DM0"));
        assert!(!setup.observables["m_2"].scans("DM0"));
    }

    #[test]
    fn test_variations() {
        let setup = FitSetup::from_json_str(SETUP).unwrap();
        let variations = setup.variations();
        let keys: Vec<&str> = variations.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "Nom",
                "TES0.990",
                "TES1.000",
                "TES1.010",
                "shape_mTauFakeUp",
                "shape_mTauFakeDown",
                "shape_dyUp",
                "shape_dyDown"
            ]
        );
        let dy = &setup.systematics["shape_dy"];
        assert_eq!(
            dy.variation(0),
            (
                String::new(),
                "_shape_dyUp".to_string(),
                Some(("zptweight".to_string(), "zptweight*zptweight".to_string()))
            )
        );
        assert_eq!(setup.systematics["shape_mTauFake"].variation(1).0, "_LTFDown");
        assert_eq!(
            tes_tags(0.97),
            (
                "_TES0p970".to_string(),
                "_TES0.970".to_string(),
                " 3% TES".to_string()
            )
        );
    }
}
