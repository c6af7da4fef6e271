pub mod adapter;
pub mod error;
pub mod headless;
pub mod probe;
pub mod tmux;
pub mod types;
mod util;

pub use adapter::*;
pub use error::*;
pub use headless::*;
pub use probe::*;
pub use tmux::*;
pub use types::*;
pub use util::render_shell_invocation;
