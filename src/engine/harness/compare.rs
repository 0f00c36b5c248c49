use std::{fmt, str::FromStr};

const DEFAULT_ABS_TOLERANCE: f64 = 1e-6;
const DEFAULT_REL_TOLERANCE: f64 = 1e-6;

/// Output comparison policy applied to every test case of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Comparator {
    /// Byte-for-byte equality.
    Exact,
    /// Trailing whitespace on each line and trailing blank lines are ignored.
    #[default]
    Trimmed,
    /// Whitespace-separated tokens; numeric tokens match within either
    /// tolerance, everything else must be identical.
    Numeric { abs: f64, rel: f64 },
}

impl Comparator {
    pub fn matches(&self, actual: &str, expected: &str) -> bool {
        match self {
            Self::Exact => actual == expected,
            Self::Trimmed => trimmed_lines(actual).eq(trimmed_lines(expected)),
            Self::Numeric { abs, rel } => {
                let mut actual = actual.split_whitespace();
                let mut expected = expected.split_whitespace();
                loop {
                    match (actual.next(), expected.next()) {
                        (None, None) => return true,
                        (Some(a), Some(e)) if tokens_match(a, e, *abs, *rel) => {}
                        _ => return false,
                    }
                }
            }
        }
    }
}

fn trimmed_lines(text: &str) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let keep = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |last| last + 1);
    lines.into_iter().take(keep)
}

fn tokens_match(actual: &str, expected: &str, abs: f64, rel: f64) -> bool {
    if actual == expected {
        return true;
    }
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(e)) if a.is_finite() && e.is_finite() => {
            let diff = (a - e).abs();
            diff <= abs || diff <= rel * e.abs()
        }
        _ => false,
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let mut parts = raw.split(':');
        match parts.next().unwrap_or_default() {
            "exact" => Ok(Self::Exact),
            "trimmed" | "default" => Ok(Self::Trimmed),
            "numeric" => {
                let mut tolerance = |default: f64| match parts.next() {
                    None => Ok(default),
                    Some(raw) => raw
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite() && *v >= 0.0)
                        .ok_or_else(|| format!("invalid numeric tolerance: {raw}")),
                };
                let abs = tolerance(DEFAULT_ABS_TOLERANCE)?;
                let rel = tolerance(DEFAULT_REL_TOLERANCE)?;
                Ok(Self::Numeric { abs, rel })
            }
            other => Err(format!("unsupported comparator: {other}")),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("exact"),
            Self::Trimmed => f.write_str("trimmed"),
            Self::Numeric { abs, rel } => write!(f, "numeric:{abs}:{rel}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Comparator;

    #[test]
    fn trimmed_ignores_trailing_whitespace_and_blank_lines() {
        let cmp = Comparator::Trimmed;
        assert!(cmp.matches("9  \n\n\n", "9"));
        assert!(cmp.matches("a b\r\nc\n", "a b\nc"));
        assert!(!cmp.matches(" 9", "9"));
        assert!(!cmp.matches("9\n\n10", "9\n10"));
    }

    #[test]
    fn exact_is_byte_for_byte() {
        assert!(Comparator::Exact.matches("9\n", "9\n"));
        assert!(!Comparator::Exact.matches("9\n", "9"));
    }

    #[test]
    fn numeric_accepts_values_within_tolerance() {
        let cmp: Comparator = "numeric:0.01".parse().unwrap();
        assert!(cmp.matches("3.141 2\n", "3.14159 2"));
        assert!(!cmp.matches("3.2", "3.14159"));
        assert!(!cmp.matches("3.14 extra", "3.14"));
        assert!(cmp.matches("yes 1e3", "yes 1000"));
    }

    #[test]
    fn numeric_relative_tolerance_scales_with_magnitude() {
        let cmp = Comparator::Numeric { abs: 0.0, rel: 1e-3 };
        assert!(cmp.matches("1000000.5", "1000000"));
        assert!(!cmp.matches("1.5", "1"));
    }

    #[test]
    fn parsing_rejects_unknown_policies() {
        assert_eq!("EXACT".parse::<Comparator>(), Ok(Comparator::Exact));
        assert!("fuzzy".parse::<Comparator>().is_err());
        assert!("numeric:-1".parse::<Comparator>().is_err());
        assert!("numeric:nan".parse::<Comparator>().is_err());
    }
}
