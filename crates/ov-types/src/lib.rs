pub mod artifact;
pub mod data;
pub mod errors;
pub mod goal;
pub mod metric;
pub mod params;
pub mod pass;
pub mod run;
pub mod system;

pub use artifact::*;
pub use data::*;
pub use errors::*;
pub use goal::*;
pub use metric::*;
pub use params::*;
pub use pass::*;
pub use run::*;
pub use system::*;
