use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::utils::{match_labels, MatchMode};

/// Standard eras: `(era, luminosity [/fb], centre-of-mass energy [TeV])`.
pub const ERAS: [(&str, f64, f64); 8] = [
    ("2016", 35.9, 13.0),
    ("2017", 41.5, 13.0),
    ("2018", 59.7, 13.0),
    ("Run2", 137.1, 13.0),
    ("UL2016_preVFP", 19.5, 13.0),
    ("UL2016_postVFP", 16.8, 13.0),
    ("UL2017", 41.48, 13.0),
    ("UL2018", 59.83, 13.0),
];

const DEFAULT_COLORS: [(&str, &str); 12] = [
    ("ZTT", "#FFCC66"),
    ("DY", "#FFCC66"),
    ("ZL", "#6495ED"),
    ("ZJ", "#64C864"),
    ("TT*", "#9999CC"),
    ("ST*", "#F0C8C8"),
    ("W*", "#DE5A6A"),
    ("VV", "#DE5A6A"),
    ("QCD", "#FFCCFF"),
    ("JTF", "#C8FFC8"),
    ("Fake*", "#C8FFC8"),
    ("data*", "#000000"),
];

/// Era label, luminosity and process colours, handed explicitly to the code that needs them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotContext {
    /// Era label, e.g. `UL2018`
    pub era: String,
    /// Integrated luminosity in /fb
    pub lumi: f64,
    /// Centre-of-mass energy in TeV
    pub cme: f64,
    /// Fill colours keyed by process pattern (glob), first match wins
    pub colors: IndexMap<String, String>,
}

impl PlotContext {
    /// Context for a standard era; unknown eras get zero luminosity and a warning.
    pub fn for_era(era: &str) -> Self {
        let (lumi, cme) = ERAS
            .iter()
            .find(|(name, _, _)| *name == era)
            .map(|(_, lumi, cme)| (*lumi, *cme))
            .unwrap_or_else(|| {
                log::warn!("PlotContext: unknown era '{era}', luminosity set to 0");
                (0.0, 13.0)
            });
        Self::new(era, lumi, cme)
    }

    /// Context with an explicit luminosity and the default colour table.
    pub fn new<S: Into<String>>(era: S, lumi: f64, cme: f64) -> Self {
        Self {
            era: era.into(),
            lumi,
            cme,
            colors: DEFAULT_COLORS
                .iter()
                .map(|(process, color)| (process.to_string(), color.to_string()))
                .collect(),
        }
    }

    /// Luminosity in /pb.
    pub fn lumi_pb(&self) -> f64 {
        self.lumi * 1000.0
    }

    /// Colour for a process name, if one of the patterns matches it exactly.
    pub fn color(&self, process: &str) -> Option<&str> {
        self.colors
            .iter()
            .find(|(pattern, _)| {
                match_labels(&[pattern.as_str()], &[process], MatchMode::Exclusive, false)
                    .unwrap_or(false)
            })
            .map(|(_, color)| color.as_str())
    }

    /// Label such as `UL2018, 59.8 fb^{-1} (13 TeV)`.
    pub fn label(&self) -> String {
        format!("{}, {:.1} fb^{{-1}} ({} TeV)", self.era, self.lumi, self.cme)
    }
}

impl Default for PlotContext {
    fn default() -> Self {
        Self::for_era("UL2018")
    }
}
