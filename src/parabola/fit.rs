use std::convert::Infallible;

use ganesh::{algorithms::LBFGSB, Function, Minimizer};
use nalgebra::{DMatrix, DVector};

use crate::{TauFitError, TauFitResult};

use super::{
    scan::{Scan, ScanPoint},
    Measurement,
};

/// Scale of the quadratic term, so the fitted widths are of order one.
pub const QUADRATIC_SCALE: f64 = 1000.0;
/// Points above this `2*deltaNLL` are left out of the fit.
pub const FIT_MAX_DNLL: f64 = 5.0;
/// Points below this `2*deltaNLL` get an error from their neighbours.
const POINT_ERROR_MAX_DNLL: f64 = 6.0;
/// Smallest error assigned to a point.
const MIN_POINT_ERROR: f64 = 0.1;
/// Fraction of the fit range the center may move away from the scan minimum.
const CENTER_WINDOW: f64 = 0.26;
/// Bounds of the offset.
const OFFSET_BOUNDS: (f64, f64) = (-0.0001, 0.5);
/// Factors applied to the smallest and largest width guess to get the width bounds.
const WIDTH_FACTORS: (f64, f64) = (0.2, 1.8);
/// Largest number of minimizer steps.
const MAX_STEPS: usize = 4000;
/// Step by which the search window for the one-sigma crossings grows.
const ROOT_SEARCH_STEP: f64 = 0.05;
/// Largest search window for the one-sigma crossings.
const ROOT_SEARCH_MAX: f64 = 1.0;

/// A parabola fitted to a likelihood scan,
///
/// ```text
/// f(x) = QUADRATIC_SCALE * w * (x - center)^2 + offset
/// ```
///
/// with separate widths `w` left and right of the center for an asymmetric fit.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParabolaFit {
    /// Position of the minimum
    pub center: f64,
    /// Value at the minimum
    pub offset: f64,
    /// Width left of the center
    pub width_left: f64,
    /// Width right of the center
    pub width_right: f64,
    /// Whether the widths were fitted separately
    pub asymmetric: bool,
    /// Lower edge of the fitted range
    pub xmin: f64,
    /// Upper edge of the fitted range
    pub xmax: f64,
    /// Weighted sum of squared residuals
    pub chi2: f64,
}

impl ParabolaFit {
    /// Evaluate the parabola.
    pub fn eval(&self, x: f64) -> f64 {
        let width = if x < self.center {
            self.width_left
        } else {
            self.width_right
        };
        QUADRATIC_SCALE * width * (x - self.center).powi(2) + self.offset
    }

    /// The center with the distances to where the parabola rises by one above its offset.
    pub fn measurement(&self) -> Measurement {
        if !self.asymmetric {
            let error = (QUADRATIC_SCALE * self.width_left).sqrt().recip();
            return Measurement::new(self.center, error, error);
        }
        let level = 1.0 + self.offset;
        let down = expanding_root(|delta| self.eval(self.center - delta) - level);
        let up = expanding_root(|delta| self.eval(self.center + delta) - level);
        Measurement::new(self.center, down, up)
    }
}

/// Find where `f(delta)` turns positive for `delta` in `[0, window]`, growing the window by
/// [`ROOT_SEARCH_STEP`] until a sign change is found. Gives NaN when the largest window has none.
fn expanding_root<F: Fn(f64) -> f64>(f: F) -> f64 {
    let mut window = ROOT_SEARCH_STEP;
    while window <= ROOT_SEARCH_MAX + f64::EPSILON {
        if f(window) > 0.0 {
            return bisect(&f, 0.0, window);
        }
        window += ROOT_SEARCH_STEP;
    }
    f64::NAN
}

fn bisect<F: Fn(f64) -> f64>(f: &F, mut lo: f64, mut hi: f64) -> f64 {
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if f(mid) > 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Errors of the scan points: half the summed differences to both neighbours (at least
/// [`MIN_POINT_ERROR`]) near the minimum, one elsewhere.
fn point_errors(scan: &Scan) -> Vec<f64> {
    let n = scan.points.len();
    (0..n)
        .map(|i| {
            let y = scan.points[i].dnll;
            if i == 0 || i + 1 == n || y >= POINT_ERROR_MAX_DNLL {
                return 1.0;
            }
            let (yl, yr) = (scan.points[i - 1].dnll, scan.points[i + 1].dnll);
            f64::max(MIN_POINT_ERROR, 0.5 * ((y - yl).abs() + (yr - y).abs()))
        })
        .collect()
}

struct FitProblem {
    x: Vec<f64>,
    y: Vec<f64>,
    weights: Vec<f64>,
    asymmetric: bool,
}

impl FitProblem {
    /// Design matrix for a fixed center: the quadratic term(s) followed by the offset.
    fn columns(&self, center: f64) -> Vec<Vec<f64>> {
        let quad = |x: f64| QUADRATIC_SCALE * (x - center).powi(2);
        if self.asymmetric {
            vec![
                self.x.iter().map(|&x| if x < center { quad(x) } else { 0.0 }).collect(),
                self.x.iter().map(|&x| if x < center { 0.0 } else { quad(x) }).collect(),
                vec![1.0; self.x.len()],
            ]
        } else {
            vec![
                self.x.iter().map(|&x| quad(x)).collect(),
                vec![1.0; self.x.len()],
            ]
        }
    }

    /// Closed-form weighted least squares in the widths and offset with the center held fixed,
    /// giving the full parameter vector `[center, widths.., offset]`.
    fn seed(&self, center: f64) -> Vec<f64> {
        let columns = self.columns(center);
        let n = self.x.len();
        let a = DMatrix::from_fn(n, columns.len(), |i, k| self.weights[i].sqrt() * columns[k][i]);
        let b = DVector::from_fn(n, |i, _| self.weights[i].sqrt() * self.y[i]);
        let solution = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .unwrap_or_else(|_| DVector::zeros(columns.len()));
        std::iter::once(center).chain(solution.iter().copied()).collect()
    }

    fn unpack(&self, parameters: &[f64]) -> (f64, f64, f64, f64) {
        if self.asymmetric {
            (parameters[0], parameters[1], parameters[2], parameters[3])
        } else {
            (parameters[0], parameters[1], parameters[1], parameters[2])
        }
    }

    fn chi2(&self, parameters: &[f64]) -> f64 {
        let (center, width_left, width_right, offset) = self.unpack(parameters);
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.weights)
            .map(|((&x, &y), &weight)| {
                let width = if x < center { width_left } else { width_right };
                let model = QUADRATIC_SCALE * width * (x - center).powi(2) + offset;
                weight * (y - model).powi(2)
            })
            .sum()
    }
}

impl Function<(), Infallible> for FitProblem {
    fn evaluate(&self, parameters: &[f64], _user_data: &mut ()) -> Result<f64, Infallible> {
        Ok(self.chi2(parameters))
    }
}

/// Fit a parabola to the points of `scan` within [`FIT_MAX_DNLL`] of the minimum, with one
/// width or separate widths on either side of the center.
///
/// The weighted chi-square is minimized with L-BFGS-B inside the parameter bounds, starting
/// from the closed-form least-squares solution at the scan minimum.
pub fn fit_parabola(scan: &Scan, asymmetric: bool) -> TauFitResult<ParabolaFit> {
    let (left, right) = scan.arms();
    if left.is_empty() || right.len() < 2 {
        return Err(TauFitError::Custom(format!(
            "Scan '{}' has no points on one side of its minimum",
            scan.poi
        )));
    }
    let poi = scan.best();
    let max_dnll = |points: &[ScanPoint]| {
        points
            .iter()
            .map(|point| point.dnll)
            .fold(f64::NEG_INFINITY, f64::max)
            .min(FIT_MAX_DNLL)
    };
    let (ymax_left, ymax_right) = (max_dnll(left), max_dnll(right));
    let xmin = left
        .iter()
        .find(|point| point.dnll <= ymax_left)
        .map_or(poi, |point| point.poi);
    let xmax = right
        .iter()
        .rev()
        .find(|point| point.dnll <= ymax_right)
        .map_or(poi, |point| point.poi);
    let (mut dtmin, mut dtmax) = (poi - xmin, xmax - poi);
    if dtmin <= 0.0 {
        dtmin = dtmax;
    }
    if dtmax <= 0.0 {
        dtmax = dtmin;
    }
    if dtmin <= 0.0 {
        return Err(TauFitError::Custom(format!(
            "Scan '{}' has no range to fit",
            scan.poi
        )));
    }
    let guess_left = ymax_left / (QUADRATIC_SCALE * dtmin * dtmin);
    let guess_right = ymax_right / (QUADRATIC_SCALE * dtmax * dtmax);
    let width_bounds = (
        WIDTH_FACTORS.0 * guess_left.min(guess_right),
        WIDTH_FACTORS.1 * guess_left.max(guess_right),
    );
    if !(width_bounds.0 > 0.0 && width_bounds.0 <= width_bounds.1) {
        return Err(TauFitError::Custom(format!(
            "Scan '{}' gives no usable width bounds",
            scan.poi
        )));
    }
    let center_bounds = (
        (poi - CENTER_WINDOW * dtmin).max(xmin),
        (poi + CENTER_WINDOW * dtmax).min(xmax),
    );
    log::debug!(
        "Fit of '{}': range [{xmin:.4}, {xmax:.4}], width bounds [{:.3}, {:.3}]",
        scan.poi,
        width_bounds.0,
        width_bounds.1
    );

    let errors = point_errors(scan);
    let (mut x, mut y, mut weights) = (Vec::new(), Vec::new(), Vec::new());
    for (point, error) in scan.points.iter().zip(&errors) {
        if point.poi >= xmin && point.poi <= xmax {
            x.push(point.poi);
            y.push(point.dnll);
            weights.push(error.powi(-2));
        }
    }
    let problem = FitProblem {
        x,
        y,
        weights,
        asymmetric,
    };
    let mut bounds = vec![center_bounds, width_bounds];
    if asymmetric {
        bounds.push(width_bounds);
    }
    bounds.push(OFFSET_BOUNDS);
    let p0: Vec<f64> = problem
        .seed(poi)
        .iter()
        .zip(&bounds)
        .map(|(&value, &(lo, hi))| if value.is_finite() { value.clamp(lo, hi) } else { lo })
        .collect();

    let mut m = Minimizer::new(Box::new(LBFGSB::default()), bounds.len())
        .with_bounds(Some(bounds))
        .with_max_steps(MAX_STEPS);
    m.minimize(&problem, &p0, &mut ())
        .unwrap_or_else(|never| match never {});
    let parameters: Vec<f64> = m.status.x.iter().copied().collect();
    // keep the seed if the minimizer wandered off to something worse
    let parameters = if problem.chi2(&parameters) <= problem.chi2(&p0) {
        parameters
    } else {
        p0
    };
    let (center, width_left, width_right, offset) = problem.unpack(&parameters);
    Ok(ParabolaFit {
        center,
        offset,
        width_left,
        width_right,
        asymmetric,
        xmin,
        xmax,
        chi2: problem.chi2(&parameters),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_symmetric_fit() {
        let x0 = 1.0;
        let scan = Scan::from_points(
            "tes",
            (-8..=8).map(|i| {
                let x = x0 + 0.0005 * i as f64;
                (x, QUADRATIC_SCALE * 1000.0 * (x - x0).powi(2))
            }),
        )
        .unwrap();
        let fit = fit_parabola(&scan, false).unwrap();
        assert_relative_eq!(fit.center, x0, epsilon = 1e-5);
        let measurement = fit.measurement();
        assert_relative_eq!(measurement.err_down, 0.001, max_relative = 0.05);
        assert_relative_eq!(measurement.err_up, 0.001, max_relative = 0.05);
        assert_relative_eq!(fit.eval(x0 + 0.002), 4.0, epsilon = 0.1);
    }

    #[test]
    fn test_asymmetric_fit() {
        let scan = Scan::from_points(
            "tes",
            [
                (0.970, 9.0),
                (0.980, 4.0),
                (0.990, 1.0),
                (1.000, 0.0),
                (1.005, 1.0),
                (1.010, 4.0),
                (1.020, 16.0),
            ],
        )
        .unwrap();
        let fit = fit_parabola(&scan, true).unwrap();
        assert_relative_eq!(fit.xmin, 0.98);
        assert_relative_eq!(fit.xmax, 1.01);
        assert_relative_eq!(fit.center, 1.0, epsilon = 1e-4);
        let measurement = fit.measurement();
        assert_relative_eq!(measurement.value, 1.0, epsilon = 1e-4);
        assert_relative_eq!(measurement.err_down, 0.010, max_relative = 0.05);
        assert_relative_eq!(measurement.err_up, 0.005, max_relative = 0.05);
    }

    #[test]
    fn test_center_between_scan_points() {
        let x0 = 1.013;
        let scan = Scan::from_points(
            "tes",
            (-10..=10).map(|i| {
                let x = 1.0 + 0.01 * i as f64;
                (x, QUADRATIC_SCALE * (x - x0).powi(2))
            }),
        )
        .unwrap();
        assert_relative_eq!(scan.best(), 1.01, epsilon = 1e-12);
        let fit = fit_parabola(&scan, false).unwrap();
        assert!((fit.center - x0).abs() < 1e-3);
        assert_relative_eq!(fit.width_left, 1.0, max_relative = 0.02);
        assert!(fit.chi2 < 1e-3);
    }

    #[test]
    fn test_one_sided_scan() {
        let scan = Scan::from_points("tes", [(1.0, 0.0), (1.01, 1.0), (1.02, 4.0)]).unwrap();
        assert!(fit_parabola(&scan, false).is_err());
    }

    #[test]
    fn test_root_outside_window() {
        assert!(expanding_root(|delta| delta - 2.0).is_nan());
        assert_relative_eq!(expanding_root(|delta| delta - 0.3), 0.3, epsilon = 1e-9);
    }
}
