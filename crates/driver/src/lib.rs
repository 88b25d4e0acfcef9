//! External collaborators and CLI wiring for the tilescout optimizer:
//! the model-compiler and simulator subprocess adapters, layer
//! extraction from compiled output, and the end-to-end session.

pub mod cli;
pub mod extract;
pub mod runner;
pub mod session;
pub mod simulate;
pub mod toolchain;

pub use cli::{run_cli, Cli};
pub use session::{OptimizeSession, SessionOptions};
