use indexmap::IndexMap;

use crate::{data::EventSource, TauFitError, TauFitResult};

use super::Measurement;

/// Name of the tree holding the scanned points.
pub const SCAN_TREE: &str = "limit";
/// Branch with the negative log-likelihood relative to the best fit.
pub const DELTA_NLL: &str = "deltaNLL";
/// Branch which is negative for points that are not part of the scan.
pub const QUANTILE_EXPECTED: &str = "quantileExpected";
/// Tolerance on the other parameters when slicing a multi-dimensional scan.
pub const SLICE_TOLERANCE: f64 = 1e-6;

/// One scanned point: a parameter value and `2*deltaNLL` above the scan minimum.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ScanPoint {
    /// Value of the parameter of interest
    pub poi: f64,
    /// `2*deltaNLL`, relative to the minimum of the scan
    pub dnll: f64,
}

/// A likelihood scan of one parameter, sorted by the parameter and shifted so that its minimum
/// is zero.
#[derive(Clone, Debug, PartialEq)]
pub struct Scan {
    /// Name of the scanned parameter (branch)
    pub poi: String,
    /// The points, sorted by `poi`
    pub points: Vec<ScanPoint>,
}

/// Path of the scan of `<channel>_<obs>-<region><tag>` for an era.
pub fn scan_path(indir: &str, channel: &str, obs: &str, region: &str, tag: &str, era: &str) -> String {
    format!("{indir}/higgsCombine.{channel}_{obs}-{region}{tag}-{era}.MultiDimFit.mH90.root")
}

/// Path of a breakdown scan next to the nominal scan at `path`.
pub fn breakdown_path(path: &str, tag: &str) -> String {
    path.replacen("higgsCombine.", &format!("higgsCombine.{tag}-"), 1)
}

/// Name of the branch holding the parameter of one region (just the parameter without a region).
pub fn poi_branch(poi: &str, region: &str) -> String {
    if region.is_empty() {
        poi.to_string()
    } else {
        format!("{poi}_{region}")
    }
}

fn read_columns(
    source: &dyn EventSource,
    path: &str,
    pois: &[String],
) -> TauFitResult<(Vec<f64>, Vec<f64>, Vec<Vec<f64>>)> {
    if !source.exists(path) {
        return Err(TauFitError::MissingFile {
            path: path.to_string(),
        });
    }
    let mut branches = vec![DELTA_NLL.to_string(), QUANTILE_EXPECTED.to_string()];
    branches.extend(pois.iter().cloned());
    let table = source.read(path, SCAN_TREE, &branches)?;
    let column = |name: &str| -> TauFitResult<Vec<f64>> {
        table
            .column(name)
            .map(|values| values.to_vec())
            .ok_or_else(|| TauFitError::MissingColumn {
                name: name.to_string(),
            })
    };
    let values = pois
        .iter()
        .map(|poi| column(poi))
        .collect::<TauFitResult<Vec<_>>>()?;
    Ok((column(DELTA_NLL)?, column(QUANTILE_EXPECTED)?, values))
}

impl Scan {
    /// Build a scan from `(poi, 2*deltaNLL)` pairs in any order.
    pub fn from_points<S: Into<String>, I: IntoIterator<Item = (f64, f64)>>(
        poi: S,
        points: I,
    ) -> TauFitResult<Self> {
        let poi = poi.into();
        let mut points: Vec<ScanPoint> = points
            .into_iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(poi, dnll)| ScanPoint { poi, dnll })
            .collect();
        if points.is_empty() {
            return Err(TauFitError::MissingScan {
                path: String::new(),
                poi,
            });
        }
        points.sort_by(|a, b| a.poi.total_cmp(&b.poi));
        let min = points
            .iter()
            .map(|point| point.dnll)
            .fold(f64::INFINITY, f64::min);
        points.iter_mut().for_each(|point| point.dnll -= min);
        Ok(Self { poi, points })
    }

    /// Read the scan of branch `poi` from the `limit` tree of `path`, keeping points with
    /// `quantileExpected >= 0` and `deltaNLL != 0`.
    pub fn read(source: &dyn EventSource, path: &str, poi: &str) -> TauFitResult<Self> {
        Self::read_profile(source, path, poi, &IndexMap::new())
    }

    /// Read the one-dimensional profile of branch `poi` from a multi-dimensional scan, keeping
    /// the points where every parameter in `slices` (other than `poi`) sits at its value.
    pub fn read_profile(
        source: &dyn EventSource,
        path: &str,
        poi: &str,
        slices: &IndexMap<String, f64>,
    ) -> TauFitResult<Self> {
        let fixed: Vec<(&String, f64)> = slices
            .iter()
            .filter(|(name, _)| name.as_str() != poi)
            .map(|(name, value)| (name, *value))
            .collect();
        let mut branches = vec![poi.to_string()];
        branches.extend(fixed.iter().map(|(name, _)| (*name).clone()));
        let (nll, quantile, values) = read_columns(source, path, &branches)?;
        let mut points = Vec::new();
        for i in 0..nll.len() {
            if quantile[i] < 0.0 || nll[i] == 0.0 {
                continue;
            }
            if fixed
                .iter()
                .enumerate()
                .any(|(j, (_, value))| (values[j + 1][i] - value).abs() > SLICE_TOLERANCE)
            {
                continue;
            }
            points.push((values[0][i], 2.0 * nll[i]));
        }
        log::debug!("Scan '{path}': {} points for '{poi}'", points.len());
        Self::from_points(poi, points).map_err(|_| TauFitError::MissingScan {
            path: path.to_string(),
            poi: poi.to_string(),
        })
    }

    /// Index of the minimum.
    pub fn argmin(&self) -> usize {
        self.points
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.dnll.total_cmp(&b.dnll))
            .map_or(0, |(i, _)| i)
    }

    /// The parameter value at the minimum.
    pub fn best(&self) -> f64 {
        self.points.get(self.argmin()).map_or(f64::NAN, |point| point.poi)
    }

    /// The points left of the minimum and the points from the minimum on.
    pub fn arms(&self) -> (&[ScanPoint], &[ScanPoint]) {
        self.points.split_at(self.argmin())
    }

    /// Where `2*deltaNLL` first reaches `level` walking outwards from the minimum on either
    /// side, interpolated linearly between neighbouring points. A side without a crossing gives
    /// NaN.
    pub fn crossings(&self, level: f64) -> (f64, f64) {
        let imin = self.argmin();
        let crossing = |indices: &mut dyn Iterator<Item = usize>| -> f64 {
            let mut previous = self.points[imin];
            for i in indices {
                let point = self.points[i];
                if point.dnll >= level {
                    if point.dnll == previous.dnll {
                        return point.poi;
                    }
                    let fraction = (level - previous.dnll) / (point.dnll - previous.dnll);
                    return previous.poi + fraction * (point.poi - previous.poi);
                }
                previous = point;
            }
            f64::NAN
        };
        if self.points.is_empty() {
            return (f64::NAN, f64::NAN);
        }
        let left = crossing(&mut (0..imin).rev());
        let right = crossing(&mut (imin + 1..self.points.len()));
        (left, right)
    }

    /// The minimum with the distances to the one-sigma crossings.
    pub fn measure(&self) -> Measurement {
        let best = self.best();
        let (left, right) = self.crossings(1.0);
        if left.is_nan() || right.is_nan() {
            log::warn!(
                "Scan '{}': no one-sigma crossing on the {} side of {best:.4}",
                self.poi,
                if left.is_nan() { "lower" } else { "upper" }
            );
        }
        Measurement::new(best, best - left, right - best)
    }
}

/// The global minimum of a multi-dimensional scan: `2*deltaNLL` there and the value of every
/// parameter in `pois`.
pub fn find_minimum(
    source: &dyn EventSource,
    path: &str,
    pois: &[String],
) -> TauFitResult<(f64, IndexMap<String, f64>)> {
    let (nll, _, values) = read_columns(source, path, pois)?;
    let imin = nll
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .ok_or_else(|| TauFitError::MissingScan {
            path: path.to_string(),
            poi: pois.join(","),
        })?;
    let slices = pois
        .iter()
        .zip(&values)
        .map(|(poi, column)| (poi.clone(), column[imin]))
        .collect();
    Ok((2.0 * nll[imin], slices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EventTable, MemorySource};
    use approx::assert_relative_eq;

    #[test]
    fn test_paths() {
        let path = scan_path("output_UL2018", "mt", "m_vis", "DM0", "_v1", "UL2018-13TeV");
        assert_eq!(
            path,
            "output_UL2018/higgsCombine.mt_m_vis-DM0_v1-UL2018-13TeV.MultiDimFit.mH90.root"
        );
        assert_eq!(
            breakdown_path(&path, "stat"),
            "output_UL2018/higgsCombine.stat-mt_m_vis-DM0_v1-UL2018-13TeV.MultiDimFit.mH90.root"
        );
        assert_eq!(poi_branch("tes", "DM0"), "tes_DM0");
        assert_eq!(poi_branch("r", ""), "r");
    }

    #[test]
    fn test_direct_crossings() {
        let scan = Scan::from_points(
            "tes",
            [
                (1.030, 9.0),
                (0.970, 9.0),
                (0.980, 4.0),
                (0.990, 1.0),
                (1.000, 0.0),
                (1.010, 1.0),
                (1.020, 4.0),
            ],
        )
        .unwrap();
        let measurement = scan.measure();
        assert_relative_eq!(measurement.value, 1.000);
        assert_relative_eq!(measurement.err_down, 0.010, epsilon = 1e-12);
        assert_relative_eq!(measurement.err_up, 0.010, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolated_and_missing_crossing() {
        let scan = Scan::from_points("tes", [(0.98, 2.5), (0.99, 0.5), (1.00, 0.0), (1.01, 0.5)])
            .unwrap();
        let (left, right) = scan.crossings(1.0);
        assert_relative_eq!(left, 0.9875, epsilon = 1e-12);
        assert!(right.is_nan());
        assert!(scan.measure().err_up.is_nan());
    }

    #[test]
    fn test_read_and_profile() {
        // two parameters, scanned on a 3x3 grid; row 0 is the best fit
        let mut a = vec![1.0];
        let mut b = vec![2.0];
        let mut nll = vec![0.0];
        for x in [0.9, 1.0, 1.1] {
            for y in [1.9, 2.0, 2.1] {
                a.push(x);
                b.push(y);
                nll.push(0.5 * (100.0 * (x - 1.0) * (x - 1.0) + 10.0 * (y - 2.0) * (y - 2.0)) + 0.1);
            }
        }
        let n = a.len();
        let mut quantile = vec![0.0; n];
        quantile[3] = -1.0;
        let table = EventTable::from_columns([
            ("tes_DM0", a),
            ("tes_DM1", b),
            ("deltaNLL", nll),
            ("quantileExpected", quantile),
        ])
        .unwrap();
        let source = MemorySource::new().with_tree("scan.root", "limit", table);
        let scan = Scan::read(&source, "scan.root", "tes_DM0").unwrap();
        assert_eq!(scan.points.len(), 8);
        let (nllmin, slices) =
            find_minimum(&source, "scan.root", &["tes_DM0".to_string(), "tes_DM1".to_string()])
                .unwrap();
        assert_relative_eq!(nllmin, 0.0);
        assert_relative_eq!(slices["tes_DM1"], 2.0);
        let profile = Scan::read_profile(&source, "scan.root", "tes_DM0", &slices).unwrap();
        assert_eq!(profile.points.len(), 3);
        assert_relative_eq!(profile.best(), 1.0);
        assert_relative_eq!(profile.points[0].dnll, 1.0, epsilon = 1e-9);
        assert!(matches!(
            Scan::read(&source, "other.root", "tes_DM0"),
            Err(TauFitError::MissingFile { .. })
        ));
        assert!(matches!(
            Scan::read(&source, "scan.root", "tes_DM2"),
            Err(TauFitError::MissingColumn { .. })
        ));
    }
}
