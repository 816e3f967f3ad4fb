use rustc_hash::FxHashSet;

/// Verdict for a queried domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    /// Pass through, but note the hit.
    Log,
    Block,
}

/// Domain filter using hierarchical matching over compiled domain sets.
pub struct PolicyEngine {
    blocked: FxHashSet<String>,
    allowed: FxHashSet<String>,
    logged: FxHashSet<String>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            blocked: FxHashSet::default(),
            allowed: FxHashSet::default(),
            logged: FxHashSet::default(),
        }
    }

    /// Replace the blocked domain set.
    pub fn set_blocked(&mut self, domains: FxHashSet<String>) {
        self.blocked = domains;
    }

    /// Replace the allowlist. Allowlist entries win over block entries at
    /// every level of the hierarchy walk.
    pub fn set_allowed(&mut self, domains: Vec<String>) {
        self.allowed = domains.into_iter().map(|d| d.to_lowercase()).collect();
    }

    /// Replace the log-only set.
    pub fn set_logged(&mut self, domains: Vec<String>) {
        self.logged = domains.into_iter().map(|d| d.to_lowercase()).collect();
    }

    /// Evaluate a domain by walking up the hierarchy:
    /// `ads.tracker.com` → `tracker.com` → `com`.
    pub fn evaluate(&self, domain: &str) -> PolicyAction {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let mut log_hit = false;

        let mut check = domain.as_str();
        loop {
            if self.allowed.contains(check) {
                return PolicyAction::Allow;
            }
            if self.blocked.contains(check) {
                return PolicyAction::Block;
            }
            if self.logged.contains(check) {
                log_hit = true;
            }
            match check.find('.') {
                Some(pos) => check = &check[pos + 1..],
                None => break,
            }
        }

        if log_hit {
            PolicyAction::Log
        } else {
            PolicyAction::Allow
        }
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        let mut engine = PolicyEngine::new();
        let mut blocked = FxHashSet::default();
        blocked.insert("ads.example.com".to_string());
        blocked.insert("tracker.net".to_string());
        blocked.insert("doubleclick.net".to_string());
        engine.set_blocked(blocked);
        engine.set_allowed(vec!["allowed.tracker.net".to_string()]);
        engine.set_logged(vec!["curious.org".to_string()]);
        engine
    }

    #[test]
    fn exact_match() {
        let engine = engine();
        assert_eq!(engine.evaluate("ads.example.com"), PolicyAction::Block);
        assert_eq!(engine.evaluate("tracker.net"), PolicyAction::Block);
        assert_eq!(engine.evaluate("example.com"), PolicyAction::Allow);
    }

    #[test]
    fn hierarchical_match() {
        let engine = engine();
        assert_eq!(engine.evaluate("sub.doubleclick.net"), PolicyAction::Block);
        assert_eq!(
            engine.evaluate("deep.sub.doubleclick.net"),
            PolicyAction::Block
        );
    }

    #[test]
    fn allowlist_overrides_block() {
        let engine = engine();
        assert_eq!(engine.evaluate("allowed.tracker.net"), PolicyAction::Allow);
        // The parent stays blocked.
        assert_eq!(engine.evaluate("tracker.net"), PolicyAction::Block);
    }

    #[test]
    fn log_only_domains() {
        let engine = engine();
        assert_eq!(engine.evaluate("curious.org"), PolicyAction::Log);
        assert_eq!(engine.evaluate("www.curious.org"), PolicyAction::Log);
    }

    #[test]
    fn case_and_trailing_dot_insensitive() {
        let engine = engine();
        assert_eq!(engine.evaluate("ADS.Example.COM"), PolicyAction::Block);
        assert_eq!(engine.evaluate("tracker.net."), PolicyAction::Block);
    }

    #[test]
    fn unlisted_domains_allowed() {
        let engine = engine();
        assert_eq!(engine.evaluate("github.com"), PolicyAction::Allow);
    }
}
