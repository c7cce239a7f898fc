pub mod cleaning;
pub mod features;

pub use cleaning::clean;
pub use features::add_features;
