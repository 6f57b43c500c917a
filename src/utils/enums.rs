use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::TauFitError;

/// How a list of search terms is matched against a list of labels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    /// Every term must be found in at least one label.
    #[default]
    All,
    /// At least one term must be found in some label.
    Any,
    /// Every term must match a full label.
    Exclusive,
    /// Every term must be found at the start of some label.
    Start,
}
impl Display for MatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchMode::All => write!(f, "all"),
            MatchMode::Any => write!(f, "any"),
            MatchMode::Exclusive => write!(f, "exclusive"),
            MatchMode::Start => write!(f, "start"),
        }
    }
}
impl FromStr for MatchMode {
    type Err = TauFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "excl" => Ok(Self::All),
            "any" | "incl" => Ok(Self::Any),
            "exclusive" | "full" => Ok(Self::Exclusive),
            "start" => Ok(Self::Start),
            _ => Err(TauFitError::ParseError {
                name: s.to_string(),
                object: "MatchMode".to_string(),
            }),
        }
    }
}

/// The kind of result booked for each (selection, variable, sample) cell.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistKind {
    /// A one-dimensional histogram.
    #[default]
    Hist1D,
    /// A two-dimensional histogram of a pair of variables.
    Hist2D,
    /// The weighted mean of the variable.
    Mean,
    /// The sum of weights passing the selection.
    SumWeights,
}
impl Display for HistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistKind::Hist1D => write!(f, "1D"),
            HistKind::Hist2D => write!(f, "2D"),
            HistKind::Mean => write!(f, "mean"),
            HistKind::SumWeights => write!(f, "sumw"),
        }
    }
}
impl FromStr for HistKind {
    type Err = TauFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1d" | "hist" | "th1" => Ok(Self::Hist1D),
            "2d" | "hist2d" | "th2" => Ok(Self::Hist2D),
            "mean" => Ok(Self::Mean),
            "sumw" | "sumweights" => Ok(Self::SumWeights),
            _ => Err(TauFitError::ParseError {
                name: s.to_string(),
                object: "HistKind".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::enums::{HistKind, MatchMode};

    #[test]
    fn enum_displays() {
        assert_eq!(format!("{}", MatchMode::All), "all");
        assert_eq!(format!("{}", MatchMode::Start), "start");
        assert_eq!(format!("{}", HistKind::Hist2D), "2D");
        assert_eq!(format!("{}", HistKind::SumWeights), "sumw");
    }

    #[test]
    fn enum_from_str() {
        assert_eq!("incl".parse::<MatchMode>().unwrap(), MatchMode::Any);
        assert_eq!("Exclusive".parse::<MatchMode>().unwrap(), MatchMode::Exclusive);
        assert_eq!("mean".parse::<HistKind>().unwrap(), HistKind::Mean);
        assert!("sideways".parse::<MatchMode>().is_err());
        assert!("3d".parse::<HistKind>().is_err());
    }
}
