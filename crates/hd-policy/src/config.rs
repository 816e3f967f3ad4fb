use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Files of blocked domains, newline-delimited or hosts format.
    #[serde(default)]
    pub blocklist_files: Vec<String>,
    /// Inline allowlist entries.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Inline log-only entries.
    #[serde(default)]
    pub loglist: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocklist_files: Vec::new(),
            allowlist: Vec::new(),
            loglist: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PolicyConfig::default();
        assert!(config.enabled);
        assert!(config.blocklist_files.is_empty());
    }

    #[test]
    fn json_roundtrip() {
        let json = r#"{
            "blocklist_files": ["/etc/hydradns/ads.txt"],
            "allowlist": ["good.example.com"]
        }"#;
        let config: PolicyConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.blocklist_files.len(), 1);
        assert_eq!(config.allowlist[0], "good.example.com");
    }
}
