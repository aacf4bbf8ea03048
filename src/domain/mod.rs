pub mod market;
pub mod state;

pub use market::*;
pub use state::*;
