//! Destination routing.

use crate::config::{Config, ConfigError, Upstream};
use regex::Regex;

/// Picks which relay carries a destination host. Hosts matching any
/// whitelist pattern go to the routed upstream, everything else goes
/// direct. The port plays no part in the decision.
pub struct Router {
    patterns: Vec<Regex>,
    routed: Upstream,
    direct: Upstream,
}

impl Router {
    /// Compile the whitelist. A malformed pattern is a config error.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let patterns = config
            .whitelist
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ConfigError::Invalid(format!("bad whitelist pattern {p:?}: {e}")))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            patterns,
            routed: config.routed.clone(),
            direct: config.direct.clone(),
        })
    }

    /// Unanchored find: the first pattern matching anywhere in `host`
    /// sends it to the routed upstream.
    pub fn route(&self, host: &str) -> &Upstream {
        if self.patterns.iter().any(|re| re.is_match(host)) {
            &self.routed
        } else {
            &self.direct
        }
    }
}
