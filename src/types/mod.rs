pub mod price;
pub mod regime;

pub use price::*;
pub use regime::*;
