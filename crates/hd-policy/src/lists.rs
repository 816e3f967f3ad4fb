//! Domain list loading for the filter engine.
//!
//! Accepts plain one-domain-per-line lists and hosts-file style lines
//! (`0.0.0.0 domain` / `127.0.0.1 domain`); comments and junk lines are
//! skipped. Fetching lists over HTTP is someone else's job; these files
//! are whatever that job wrote to disk.

use std::path::Path;

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::engine::PolicyEngine;

/// Build an engine from config: blocklist files plus inline lists.
pub fn build_engine(config: &PolicyConfig) -> PolicyEngine {
    let mut engine = PolicyEngine::new();
    if !config.enabled {
        return engine;
    }

    let mut blocked = FxHashSet::default();
    for path in &config.blocklist_files {
        match load_domain_file(Path::new(path)) {
            Ok(domains) => {
                info!("blocklist {}: {} domains", path, domains.len());
                blocked.extend(domains);
            }
            Err(e) => warn!("failed to load blocklist {}: {:#}", path, e),
        }
    }
    info!("policy engine: {} blocked domains total", blocked.len());

    engine.set_blocked(blocked);
    engine.set_allowed(config.allowlist.clone());
    engine.set_logged(config.loglist.clone());
    engine
}

/// Read one list file into a set of lowercased domains.
pub fn load_domain_file(path: &Path) -> Result<FxHashSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading domain list {}", path.display()))?;
    Ok(parse_domain_lines(&content))
}

fn parse_domain_lines(content: &str) -> FxHashSet<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                return None;
            }

            let mut parts = line.split_whitespace();
            let first = parts.next()?;
            // Hosts format: sink address followed by the domain.
            let candidate = if first == "0.0.0.0" || first == "127.0.0.1" || first == "::" {
                parts.next()?
            } else {
                first
            };

            let domain = candidate.trim_end_matches('.').to_lowercase();
            if is_valid_domain(&domain) {
                Some(domain)
            } else {
                None
            }
        })
        .collect()
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    domain
        .split('.')
        .all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}
