use std::path::PathBuf;

#[derive(Debug)]
pub enum TsageError {
    ToolError((String, Option<i32>, String)),
    TimeOutputParseError(String),
    MissingSetupError(PathBuf),
    UnequalSamplesError((usize, usize)),
    TreeIteratorDesyncError(f64),
    MultipleRootsError(f64),
    OddSampleCountError(usize),
    NonzeroErrorRateError(f64),
    FinalisedSampleDataError,
    UnknownExperimentError(String),
    NoSitesError,
    NoOverlapError,
}

impl std::fmt::Display for TsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolError((cmd, status, stderr)) => {
                let status = status.map_or("signal".to_string(), |s| s.to_string());
                write!(
                    f,
                    "Command failed with exit status {status}: {cmd}\n--- stderr ---\n{stderr}"
                )
            }
            Self::TimeOutputParseError(line) => {
                write!(f, "Could not parse resource usage from time output: {line:?}")
            }
            Self::MissingSetupError(path) => write!(
                f,
                "Run table {} not found. Must run with --setup flag first",
                path.display()
            ),
            Self::UnequalSamplesError((a, b)) => write!(
                f,
                "Tree sequences must have the same number of samples: {a} != {b}"
            ),
            Self::TreeIteratorDesyncError(pos) => write!(
                f,
                "Tree iterator exhausted before covering the overlap at position {pos}"
            ),
            Self::MultipleRootsError(pos) => write!(
                f,
                "Local tree at position {pos} has more than one root. Tree distance requires a single root."
            ),
            Self::OddSampleCountError(n) => write!(
                f,
                "Empirical error model pairs samples into diploids but the sample count {n} is odd"
            ),
            Self::NonzeroErrorRateError(rate) => {
                write!(f, "Cannot use the no-error model with error rate {rate}")
            }
            Self::FinalisedSampleDataError => write!(
                f,
                "Sample data has been finalised. Copy it before adding sites."
            ),
            Self::UnknownExperimentError(name) => write!(f, "Unknown experiment: {name:?}"),
            Self::NoSitesError => write!(f, "Tree sequence has no sites to generate samples from"),
            Self::NoOverlapError => write!(
                f,
                "The two tree sequences have no overlapping covered interval"
            ),
        }
    }
}

impl std::error::Error for TsageError {}
