#[macro_use]
pub mod macros;

pub mod bitmap;
pub mod data_structures;
pub mod error;
pub mod index;

pub use bitmap::Bitmap;
pub use data_structures::{Map, Set};
