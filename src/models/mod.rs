pub mod enums;
pub mod document;
pub mod run;
pub mod classification;
pub mod sampling;

pub use document::*;
pub use run::*;
pub use classification::*;
pub use sampling::*;
