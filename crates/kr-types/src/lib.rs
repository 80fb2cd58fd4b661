pub mod errors;
pub mod path;
pub mod model;
pub mod results;
pub mod simulation;
pub mod table;

pub use errors::*;
pub use path::*;
pub use model::*;
pub use results::*;
pub use simulation::*;
pub use table::*;
