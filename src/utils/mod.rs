use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use crate::{TauFitError, TauFitResult};

/// Useful enumerations for various modes and result kinds.
pub mod enums;

pub use enums::{HistKind, MatchMode};

static DECIMAL_POINT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)").unwrap());
static ABS_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"abs\(([^\)]*)\)").unwrap());

/// Returns `nbins + 1` evenly spaced edges over `range`.
pub fn get_bin_edges(nbins: usize, range: (f64, f64)) -> Vec<f64> {
    let width = (range.1 - range.0) / (nbins as f64);
    (0..=nbins)
        .map(|i| {
            if i == nbins {
                range.1
            } else {
                range.0 + (i as f64 * width)
            }
        })
        .collect()
}

/// Index of the bin containing `value`, or [`None`] if it lies outside the edges.
///
/// Bins are closed on the left and open on the right, so `value == edges[last]` is outside.
pub fn get_bin_index(value: f64, edges: &[f64]) -> Option<usize> {
    let (first, last) = (edges.first()?, edges.last()?);
    if value.is_nan() || value < *first || value >= *last {
        return None;
    }
    Some(edges.partition_point(|edge| *edge <= value) - 1)
}

/// Check that the edges describe at least one bin and are strictly increasing.
pub fn validate_edges(name: &str, edges: &[f64]) -> TauFitResult<()> {
    if edges.len() < 2 {
        return Err(TauFitError::BinningError {
            name: name.to_string(),
            reason: "at least two edges are required".to_string(),
        });
    }
    if edges.windows(2).any(|pair| !(pair[0] < pair[1])) {
        return Err(TauFitError::BinningError {
            name: name.to_string(),
            reason: format!("edges {edges:?} are not strictly increasing"),
        });
    }
    Ok(())
}

/// Join labels into a valid histogram name.
pub fn make_hist_name<S: AsRef<str>>(labels: &[S]) -> String {
    let joined = labels
        .iter()
        .map(|label| label.as_ref().trim_matches('_'))
        .collect::<Vec<_>>()
        .join("_");
    [
        ("+", "-"),
        (" - ", "-"),
        (".", "p"),
        (",", "-"),
        (" ", "_"),
        ("(", "-"),
        (")", "-"),
        ("[", "-"),
        ("]", "-"),
        ("||", "OR"),
        ("&&", "AND"),
        ("/", "_"),
        ("<", "lt"),
        (">", "gt"),
        ("=", "e"),
        ("*", "x"),
    ]
    .iter()
    .fold(joined, |name, (old, new)| name.replace(old, new))
}

/// Make a string safe to use in file names.
pub fn make_filename(string: &str) -> String {
    let mut fname = DECIMAL_POINT.replace_all(string, "${1}p${2}").into_owned();
    if fname.contains("abs(") {
        fname = ABS_CALL.replace_all(&fname, "${1}").replace("eta_2", "eta");
    }
    if fname.contains("m_t") {
        fname = replace_transverse_mass(&fname);
    }
    [
        (" and ", "-"),
        (",", "-"),
        ("+", "-"),
        (":", "-"),
        ("(", ""),
        (")", ""),
        ("{", ""),
        ("}", ""),
        ("|", ""),
        ("&", ""),
        ("#", ""),
        ("!", "not"),
        ("pt_mu", "pt"),
        ("m_T", "mt"),
        (">=", "geq"),
        ("<=", "leq"),
        (">", "gt"),
        ("<", "lt"),
        ("=", "eq"),
        (" ", ""),
        ("GeV", ""),
        ("anti-iso", "antiIso"),
    ]
    .iter()
    .fold(fname, |name, (old, new)| name.replace(old, new))
}

// `m_t` becomes `mt` unless it is part of `zoom_t` or `m_tau`.
fn replace_transverse_mass(string: &str) -> String {
    let mut out = String::with_capacity(string.len());
    let mut rest = string;
    while let Some(pos) = rest.find("m_t") {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        let preceded = out.ends_with("zoo");
        let followed = tail[3..].starts_with("au");
        out.push_str(if preceded || followed { "m_t" } else { "mt" });
        rest = &tail[3..];
    }
    out.push_str(rest);
    out
}

/// Derive a `(name, title)` pair from a label, the name being a valid histogram name.
pub fn make_name_title(label: &str) -> (String, String) {
    (make_hist_name(&[label]), label.to_string())
}

/// Replace `$KEY` and `${KEY:a:b}` substrings, longest keys first.
pub fn repkey(string: &str, keys: &[(&str, &str)]) -> String {
    let mut keys = keys.to_vec();
    keys.sort_by_key(|(key, _)| std::cmp::Reverse(key.len()));
    let mut out = string.to_string();
    for (key, value) in keys {
        if out.contains(&format!("${{{key}")) {
            let pattern = format!(r"\$\{{{}:(\d*):(\d+)\}}", regex::escape(key));
            if let Ok(re) = Regex::new(&pattern) {
                out = re
                    .replace_all(&out, |caps: &regex::Captures| {
                        let start = caps[1].parse::<usize>().unwrap_or(0).min(value.len());
                        let stop = caps[2]
                            .parse::<usize>()
                            .unwrap_or(value.len())
                            .clamp(start, value.len());
                        value.get(start..stop).unwrap_or_default().to_string()
                    })
                    .into_owned();
            }
        }
        out = out.replace(&format!("${key}"), value);
    }
    out
}

/// Strip `prefix` from the start of `string` if present.
pub fn strip_prefix_or_keep<'a>(string: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return string;
    }
    string.strip_prefix(prefix).unwrap_or(string)
}

/// Convert a glob search term to a regular expression.
///
/// Unescaped `+` is escaped, `*` (unless already `.*`) becomes `.*` and `?` becomes `.`.
pub fn glob_to_regex(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 4);
    let mut prev: Option<char> = None;
    for c in term.chars() {
        match c {
            '+' if prev != Some('\\') => out.push_str(r"\+"),
            '*' if prev != Some('.') => out.push_str(".*"),
            '?' if prev != Some('\\') && prev != Some(')') && prev != Some(']') => out.push('.'),
            _ => out.push(c),
        }
        prev = Some(c);
    }
    out
}

/// Returns `true` if the string looks like a glob pattern.
pub fn is_glob(string: &str) -> bool {
    string.contains('*') || string.contains('?') || (string.contains('[') && string.contains(']'))
}

/// Match search terms against labels (typically a sample's name, title and tags).
///
/// Terms are glob patterns unless `regex` is set. An empty term list never matches.
pub fn match_labels<T: AsRef<str>, L: AsRef<str>>(
    terms: &[T],
    labels: &[L],
    mode: MatchMode,
    regex: bool,
) -> TauFitResult<bool> {
    if terms.is_empty() {
        return Ok(false);
    }
    let mut results = Vec::with_capacity(terms.len());
    for term in terms {
        let mut pattern = if regex {
            term.as_ref().to_string()
        } else {
            glob_to_regex(term.as_ref())
        };
        match mode {
            MatchMode::Start if !pattern.starts_with('^') => pattern.insert(0, '^'),
            MatchMode::Exclusive => pattern = format!("^(?:{pattern})$"),
            _ => {}
        }
        let re = Regex::new(&pattern)?;
        results.push(labels.iter().any(|label| re.is_match(label.as_ref())));
    }
    Ok(match mode {
        MatchMode::Any => results.iter().any(|matched| *matched),
        _ => results.iter().all(|matched| *matched),
    })
}

/// Expand a file-name glob (only the final path component may contain wildcards).
pub fn expand_glob(pattern: &str) -> TauFitResult<Vec<PathBuf>> {
    let expanded = shellexpand::full(pattern)?;
    let path = Path::new(&*expanded);
    let file_pattern = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    if !is_glob(&file_pattern) {
        return Ok(if path.exists() {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let re = Regex::new(&format!("^{}$", glob_to_regex(&file_pattern.replace('.', r"\."))))?;
    let mut matches = Vec::new();
    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| re.is_match(name))
            {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_edges_and_index() {
        let edges = get_bin_edges(4, (0.0, 2.0));
        assert_eq!(edges, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(get_bin_index(0.0, &edges), Some(0));
        assert_eq!(get_bin_index(0.75, &edges), Some(1));
        assert_eq!(get_bin_index(1.5, &edges), Some(3));
        assert_eq!(get_bin_index(2.0, &edges), None);
        assert_eq!(get_bin_index(-0.1, &edges), None);
        assert_eq!(get_bin_index(f64::NAN, &edges), None);
    }

    #[test]
    fn test_validate_edges() {
        assert!(validate_edges("x", &[0.0, 1.0]).is_ok());
        assert!(validate_edges("x", &[0.0]).is_err());
        assert!(validate_edges("x", &[0.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn test_make_hist_name() {
        assert_eq!(
            make_hist_name(&["m_vis", "_baseline_", "ZTT"]),
            "m_vis_baseline_ZTT"
        );
        assert_eq!(make_hist_name(&["pt_1>20 && m<1.5"]), "pt_1gt20_AND_mlt1p5");
    }

    #[test]
    fn test_make_filename() {
        assert_eq!(make_filename("m_vis"), "m_vis");
        assert_eq!(make_filename("pt_1>20 && m_t<50"), "pt_1gt20mtlt50");
        assert_eq!(make_filename("abs(eta_2)<1.5"), "etalt1p5");
        assert_eq!(make_filename("m_tau"), "m_tau");
        assert_eq!(make_filename("zoom_t"), "zoom_t");
        assert_eq!(make_filename("!(q_1*q_2<0)"), "notq_1*q_2lt0");
    }

    #[test]
    fn test_repkey() {
        let keys = [("SAMPLE", "DYJetsToLL"), ("S", "x"), ("ERA", "UL2018")];
        assert_eq!(
            repkey("$SAMPLE_$S_${ERA:2:6}.root", &keys),
            "DYJetsToLL_x_2018.root"
        );
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("DY*"), "DY.*");
        assert_eq!(glob_to_regex("W+jets"), r"W\+jets");
        assert_eq!(glob_to_regex("T.*"), "T.*");
        assert_eq!(glob_to_regex("ZT?"), "ZT.");
    }

    #[test]
    fn test_match_labels() {
        let labels = ["DY", "Drell-Yan", "ZTT"];
        assert!(match_labels(&["DY"], &labels, MatchMode::All, false).unwrap());
        assert!(match_labels(&["Drell*", "ZT*"], &labels, MatchMode::All, false).unwrap());
        assert!(!match_labels(&["Drell*", "WJ"], &labels, MatchMode::All, false).unwrap());
        assert!(match_labels(&["Drell*", "WJ"], &labels, MatchMode::Any, false).unwrap());
        // search is unanchored unless the match is exclusive
        assert!(match_labels(&["TT"], &labels, MatchMode::All, false).unwrap());
        assert!(!match_labels(&["TT"], &labels, MatchMode::Exclusive, false).unwrap());
        assert!(match_labels(&["Z"], &labels, MatchMode::All, false).unwrap());
        assert!(!match_labels(&["Z"], &labels, MatchMode::Exclusive, false).unwrap());
        assert!(!match_labels(&["TT"], &labels, MatchMode::Start, false).unwrap());
        assert!(match_labels(&["ZT"], &labels, MatchMode::Start, false).unwrap());
        assert!(!match_labels::<&str, &str>(&[], &labels, MatchMode::Any, false).unwrap());
    }

    #[test]
    fn test_expand_glob() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("taufit_glob_{}", fastrand::u64(..)));
        fs::create_dir_all(&dir).unwrap();
        for name in ["SingleMuon_Run2018A.root", "SingleMuon_Run2018B.root", "DY.root"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        let pattern = format!("{}/SingleMuon_Run2018?.root", dir.display());
        let found = expand_glob(&pattern).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("SingleMuon_Run2018A.root"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
