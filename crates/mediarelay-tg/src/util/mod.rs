//! Assorted utility functions (missing batteries).
mod std_ext;
pub(crate) mod teloxide_ext;

pub mod display;
pub mod media_conv;
pub mod process;
pub mod retry;
pub mod url;

pub(crate) mod prelude {
    pub(crate) use super::std_ext::prelude::*;
    pub(crate) use super::teloxide_ext::prelude::*;
}

pub(crate) type DynError = dyn std::error::Error + Send + Sync;
pub(crate) type DynResult<T = ()> = std::result::Result<T, Box<DynError>>;
