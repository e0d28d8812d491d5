mod config;
mod error;
mod media;
mod observability;
mod rate_limit;
mod tg;

pub mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
    pub(crate) use crate::util::url::UrlExt;
}

/// Run the telegram bot processing loop
pub async fn run(config: Config) -> Result<()> {
    let opts = tg::RunBotOptions {
        tg_cfg: config.tg,
        media_cfg: config.media,
        rate_limit_cfg: config.rate_limit,
    };

    tg::run_bot(opts).await
}
