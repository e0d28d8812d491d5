use crate::util::url::host_matches_domain;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Short names of the sites that are known under several domains
const SITE_ALIASES: &[(&str, &[&str])] = &[
    ("youtube", &["youtube.com", "youtu.be"]),
    ("twitter", &["twitter.com", "x.com"]),
];

/// Maps URL hosts to the cookie files that should be passed to the
/// extraction tools. Keys may be exact hosts, parent domains or site aliases.
#[derive(Debug, Clone, Default)]
pub(crate) struct CookieJar {
    files: HashMap<String, PathBuf>,
    default: Option<PathBuf>,
}

impl CookieJar {
    pub(crate) fn new(files: HashMap<String, PathBuf>, default: Option<PathBuf>) -> Self {
        let files = files
            .into_iter()
            .map(|(key, path)| (key.trim_end_matches('.').to_ascii_lowercase(), path))
            .collect();

        Self { files, default }
    }

    /// Lookup order: exact host, the most specific parent domain, site alias,
    /// then the default file.
    pub(crate) fn select(&self, host: &str) -> Option<&Path> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some(path) = self.files.get(&host) {
            return Some(path);
        }

        let parent = self
            .files
            .iter()
            .filter(|(key, _)| host_matches_domain(&host, key))
            .max_by_key(|(key, _)| key.len());

        if let Some((_, path)) = parent {
            return Some(path);
        }

        let alias = SITE_ALIASES
            .iter()
            .filter(|(_, domains)| {
                domains
                    .iter()
                    .any(|domain| host_matches_domain(&host, domain))
            })
            .find_map(|(alias, _)| self.files.get(*alias));

        alias.or(self.default.as_ref()).map(PathBuf::as_path)
    }
}
