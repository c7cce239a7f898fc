pub mod gaussian_hmm;
pub mod regime_detector;

pub use gaussian_hmm::{FitSummary, GaussianHMM, HmmParameters};
pub use regime_detector::{fit_and_label, RegimeFit};
