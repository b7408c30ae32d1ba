pub mod utils;

mod test_placement;
