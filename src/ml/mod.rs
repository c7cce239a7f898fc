pub mod hmm;

pub use hmm::{fit_and_label, RegimeFit};
