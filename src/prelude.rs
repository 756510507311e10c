//! Common imports used throughout the compiler.

pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, trace, warn};
