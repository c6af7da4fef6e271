pub mod error;
pub mod evidence;
pub mod exclusion;
pub mod types;
pub mod verifier;
pub mod workspace;

pub use error::*;
pub use evidence::*;
pub use exclusion::*;
pub use types::*;
pub use verifier::*;
pub use workspace::*;
