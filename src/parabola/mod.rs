//! Post-processing of likelihood scans: the best-fit value of a parameter of interest with the
//! points where `2*deltaNLL` crosses one, read directly from the scan or from a fitted
//! (optionally asymmetric) parabola, collected into per-region measurement tables.
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{config::FitSetup, data::EventSource, TauFitError, TauFitResult};

/// Parabola fits to scans.
pub mod fit;
/// Reading scans and finding their crossings.
pub mod scan;
/// Measurement tables.
pub mod table;

pub use fit::{fit_parabola, ParabolaFit};
pub use scan::{breakdown_path, find_minimum, poi_branch, scan_path, Scan, ScanPoint};
pub use table::{combine_measurements, MeasurementTable};

/// A best-fit value with its lower and upper one-sigma distances. Errors are NaN where the scan
/// has no crossing.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Best-fit value
    pub value: f64,
    /// Distance to the lower crossing
    pub err_down: f64,
    /// Distance to the upper crossing
    pub err_up: f64,
}

impl Measurement {
    /// Create a new measurement.
    pub fn new(value: f64, err_down: f64, err_up: f64) -> Self {
        Self {
            value,
            err_down,
            err_up,
        }
    }

    /// Whether the value and both errors are finite.
    pub fn is_valid(&self) -> bool {
        self.value.is_finite() && self.err_down.is_finite() && self.err_up.is_finite()
    }
}

/// Where scans are found and how they are measured.
#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Directory holding the scan files
    pub indir: String,
    /// Era label in the file names, e.g. `UL2018-13TeV`
    pub era: String,
    /// Tag in the file names
    pub tag: String,
    /// Parameter of interest
    pub poi: String,
    /// Also fit a parabola to every scan
    pub fit: bool,
    /// Fit separate widths left and right of the minimum
    pub asymmetric: bool,
    /// The scans are slices of one multi-dimensional scan per observable
    pub multidim: bool,
    /// Tags of breakdown scans (e.g. `stat`) measured next to every nominal scan
    pub breakdowns: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            indir: "output".to_string(),
            era: String::new(),
            tag: String::new(),
            poi: "tes".to_string(),
            fit: false,
            asymmetric: false,
            multidim: false,
            breakdowns: Vec::new(),
        }
    }
}

impl ScanOptions {
    /// Scans in `indir` for `era`.
    pub fn new<S: Into<String>, T: Into<String>>(indir: S, era: T) -> Self {
        Self {
            indir: indir.into(),
            era: era.into(),
            ..Default::default()
        }
    }
    /// Set the file name tag.
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = tag.into();
        self
    }
    /// Set the parameter of interest.
    pub fn with_poi<S: Into<String>>(mut self, poi: S) -> Self {
        self.poi = poi.into();
        self
    }
    /// Fit parabolas, asymmetric ones if `asymmetric`.
    pub fn with_fit(mut self, asymmetric: bool) -> Self {
        self.fit = true;
        self.asymmetric = asymmetric;
        self
    }
    /// Read profiles from a multi-dimensional scan.
    pub fn with_multidim(mut self) -> Self {
        self.multidim = true;
        self
    }
    /// Measure breakdown scans with these tags.
    pub fn with_breakdowns<S: Into<String>, I: IntoIterator<Item = S>>(mut self, tags: I) -> Self {
        self.breakdowns = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Suffix of the files with fitted measurements.
    pub fn fit_tag(&self) -> &'static str {
        if self.asymmetric {
            "_fit_asymm"
        } else {
            "_fit"
        }
    }
}

/// The measurement tables of a fitting campaign.
#[derive(Clone, Debug, Default)]
pub struct ScanResults {
    /// Read directly from the scans
    pub direct: MeasurementTable,
    /// From parabola fits, if requested
    pub fit: Option<MeasurementTable>,
    /// Read directly from the breakdown scans, by tag
    pub breakdowns: IndexMap<String, MeasurementTable>,
}

/// Measure the parameter of interest in every region scanned with each observable of `setup`.
///
/// Missing scan files are errors. Scans without usable points, and fits which fail, leave an
/// empty entry in the table.
pub fn measure_scans(
    source: &dyn EventSource,
    setup: &FitSetup,
    options: &ScanOptions,
) -> TauFitResult<ScanResults> {
    let channel = setup.channel_short();
    let regions = setup.scan_regions();
    let observables: Vec<&String> = setup.observables.keys().collect();
    let mut results = ScanResults {
        direct: MeasurementTable::new(observables.iter().copied().cloned()),
        fit: options
            .fit
            .then(|| MeasurementTable::new(observables.iter().copied().cloned())),
        breakdowns: options
            .breakdowns
            .iter()
            .map(|tag| {
                (
                    tag.clone(),
                    MeasurementTable::new(observables.iter().copied().cloned()),
                )
            })
            .collect(),
    };
    for (obs, obs_setup) in &setup.observables {
        let mut slices = IndexMap::new();
        let mdf_path = scan_path(&options.indir, &channel, obs, "MDF", &options.tag, &options.era);
        if options.multidim {
            let pois: Vec<String> = regions
                .iter()
                .filter(|region| obs_setup.scans(region))
                .map(|region| poi_branch(&options.poi, region))
                .collect();
            let (nllmin, minimum) = find_minimum(source, &mdf_path, &pois)?;
            log::info!("Minimum of '{mdf_path}': 2*deltaNLL = {nllmin:.4} at {minimum:?}");
            slices = minimum;
        }
        for region in &regions {
            if !obs_setup.scans(region) {
                results.direct.insert(region, obs, None);
                if let Some(table) = results.fit.as_mut() {
                    table.insert(region, obs, None);
                }
                for table in results.breakdowns.values_mut() {
                    table.insert(region, obs, None);
                }
                continue;
            }
            let path = if options.multidim {
                mdf_path.clone()
            } else {
                scan_path(&options.indir, &channel, obs, region, &options.tag, &options.era)
            };
            let branch = poi_branch(&options.poi, region);
            let scan = match Scan::read_profile(source, &path, &branch, &slices) {
                Ok(scan) => Some(scan),
                Err(TauFitError::MissingScan { path, poi }) => {
                    log::warn!("No usable points for '{poi}' in '{path}'");
                    None
                }
                Err(err) => return Err(err),
            };
            let direct = scan.as_ref().map(Scan::measure);
            if let Some(m) = direct {
                log::info!(
                    "{obs} {region}: {branch} = {:.4} -{:.4} +{:.4}",
                    m.value,
                    m.err_down,
                    m.err_up
                );
            }
            results.direct.insert(region, obs, direct);
            if let Some(table) = results.fit.as_mut() {
                let fitted = scan.as_ref().and_then(|scan| {
                    fit_parabola(scan, options.asymmetric)
                        .map_err(|err| log::warn!("{obs} {region}: {err}"))
                        .ok()
                        .map(|fit| fit.measurement())
                });
                table.insert(region, obs, fitted);
            }
            for (tag, table) in results.breakdowns.iter_mut() {
                let path = breakdown_path(&path, tag);
                let measurement = match Scan::read_profile(source, &path, &branch, &slices) {
                    Ok(scan) => Some(scan.measure()),
                    Err(TauFitError::MissingScan { .. }) => None,
                    Err(err) => return Err(err),
                };
                table.insert(region, obs, measurement);
            }
        }
    }
    Ok(results)
}

/// Write the measurement tables as `measurement_<poi>_<channel><tag>.{txt,json}` in `outdir`,
/// with the fit suffix for fitted measurements. Tables without any measurement are skipped.
pub fn write_measurements<P: AsRef<Path>>(
    results: &ScanResults,
    setup: &FitSetup,
    outdir: P,
    options: &ScanOptions,
) -> TauFitResult<Vec<PathBuf>> {
    let stem = format!(
        "measurement_{}_{}{}",
        options.poi,
        setup.channel_short(),
        options.tag
    );
    let mut tables = vec![(stem.clone(), &results.direct)];
    if let Some(fit) = &results.fit {
        tables.push((format!("{stem}{}", options.fit_tag()), fit));
    }
    let mut written = Vec::new();
    for (name, table) in tables {
        if !table.has_measurements() {
            log::warn!("No measurements for '{name}', not writing it");
            continue;
        }
        let txt = outdir.as_ref().join(format!("{name}.txt"));
        let json = outdir.as_ref().join(format!("{name}.json"));
        table.write_txt(&txt)?;
        table.write_json(setup, &json)?;
        written.extend([txt, json]);
    }
    Ok(written)
}
