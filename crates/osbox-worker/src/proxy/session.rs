use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;

/// Prefix of sealed secret tokens placed in the guest environment.
pub const SEALED_PREFIX: &str = "osb_sealed_";

/// Path inside the guest where the proxy CA certificate lives. The image
/// build injects it into the system trust store; the env vars below point the
/// common language runtimes at the same file.
pub const GUEST_CA_PATH: &str = "/etc/osbox/ca.crt";

/// Allocate one sealed token: `osb_sealed_` + 32 hex chars (16 random bytes).
pub fn seal_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    format!("{}{}", SEALED_PREFIX, hex::encode(bytes))
}

/// Result of sealing a secret env map.
pub struct SealedEnv {
    /// What the guest sees: env var -> token.
    pub guest_env: HashMap<String, String>,
    /// What the proxy substitutes: token -> real value.
    pub substitutions: HashMap<String, String>,
}

/// Seal every env var. Real values stay on this side of the vsock boundary.
pub fn seal_env(env: &HashMap<String, String>) -> SealedEnv {
    let mut guest_env = HashMap::with_capacity(env.len());
    let mut substitutions = HashMap::with_capacity(env.len());
    for (key, value) in env {
        let token = seal_token();
        guest_env.insert(key.clone(), token.clone());
        substitutions.insert(token, value.clone());
    }
    SealedEnv {
        guest_env,
        substitutions,
    }
}

/// Proxy env vars injected alongside the sealed tokens so common tooling
/// routes HTTPS through the gateway and trusts the worker CA.
pub fn proxy_env(gateway_ip: &str, proxy_port: u16) -> HashMap<String, String> {
    let proxy_url = format!("http://{}:{}", gateway_ip, proxy_port);
    HashMap::from([
        ("HTTP_PROXY".to_string(), proxy_url.clone()),
        ("HTTPS_PROXY".to_string(), proxy_url),
        ("NODE_EXTRA_CA_CERTS".to_string(), GUEST_CA_PATH.to_string()),
        ("REQUESTS_CA_BUNDLE".to_string(), GUEST_CA_PATH.to_string()),
        ("SSL_CERT_FILE".to_string(), GUEST_CA_PATH.to_string()),
    ])
}

/// Render an /etc/environment file: sorted KEY=value lines.
pub fn render_etc_environment(entries: &HashMap<String, String>) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Does `host` match the allowlist? Exact match or `*.suffix` wildcard
/// (which also covers the apex). An empty list is permissive.
pub fn host_allowed(patterns: &[String], host: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{}", suffix))
        } else {
            host == pattern
        }
    })
}

/// Per-sandbox proxy state. The guest IP is the key and the only
/// authentication.
pub struct ProxySession {
    pub sandbox_id: String,
    pub substitutions: HashMap<String, String>,
    pub allowed_hosts: Vec<String>,
}

/// Concurrent map of proxy sessions keyed by guest IP. Written on sandbox
/// create/destroy, read on every proxied connection.
pub struct SessionMap {
    inner: RwLock<HashMap<String, Arc<ProxySession>>>,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, guest_ip: &str, session: ProxySession) {
        self.inner
            .write()
            .unwrap()
            .insert(guest_ip.to_string(), Arc::new(session));
    }

    pub fn remove(&self, guest_ip: &str) {
        self.inner.write().unwrap().remove(guest_ip);
    }

    pub fn get(&self, guest_ip: &str) -> Option<Arc<ProxySession>> {
        self.inner.read().unwrap().get(guest_ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_tokens_have_spec_format() {
        let token = seal_token();
        assert!(token.starts_with("osb_sealed_"));
        let hex_part = &token[SEALED_PREFIX.len()..];
        assert_eq!(hex_part.len(), 32);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn seal_env_maps_both_directions() {
        let env = HashMap::from([("API_KEY".to_string(), "sk-real-123".to_string())]);
        let sealed = seal_env(&env);

        let token = sealed.guest_env.get("API_KEY").unwrap();
        assert!(token.starts_with(SEALED_PREFIX));
        assert_eq!(sealed.substitutions.get(token).unwrap(), "sk-real-123");
        // The real value appears nowhere in the guest-visible map.
        assert!(!sealed.guest_env.values().any(|v| v == "sk-real-123"));
    }

    #[test]
    fn seal_env_tokens_are_unique_per_var() {
        let env = HashMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]);
        let sealed = seal_env(&env);
        assert_ne!(sealed.guest_env["A"], sealed.guest_env["B"]);
    }

    #[test]
    fn proxy_env_points_at_gateway() {
        let env = proxy_env("172.16.0.1", 3128);
        assert_eq!(env["HTTPS_PROXY"], "http://172.16.0.1:3128");
        assert_eq!(env["HTTP_PROXY"], "http://172.16.0.1:3128");
        assert_eq!(env["SSL_CERT_FILE"], GUEST_CA_PATH);
        assert_eq!(env["REQUESTS_CA_BUNDLE"], GUEST_CA_PATH);
        assert_eq!(env["NODE_EXTRA_CA_CERTS"], GUEST_CA_PATH);
    }

    #[test]
    fn etc_environment_is_sorted_lines() {
        let entries = HashMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(render_etc_environment(&entries), "A=1\nB=2\n");
    }

    #[test]
    fn allowlist_exact_match() {
        let patterns = vec!["httpbin.org".to_string()];
        assert!(host_allowed(&patterns, "httpbin.org"));
        assert!(!host_allowed(&patterns, "example.com"));
        assert!(!host_allowed(&patterns, "evil-httpbin.org"));
    }

    #[test]
    fn allowlist_wildcard_suffix() {
        let patterns = vec!["*.example.com".to_string()];
        assert!(host_allowed(&patterns, "api.example.com"));
        assert!(host_allowed(&patterns, "a.b.example.com"));
        assert!(host_allowed(&patterns, "example.com"));
        assert!(!host_allowed(&patterns, "badexample.com"));
        assert!(!host_allowed(&patterns, "example.com.evil.io"));
    }

    #[test]
    fn empty_allowlist_is_permissive() {
        assert!(host_allowed(&[], "anything.example"));
    }

    #[test]
    fn session_map_keyed_by_guest_ip() {
        let map = SessionMap::new();
        map.insert(
            "172.16.0.2",
            ProxySession {
                sandbox_id: "sb_a".into(),
                substitutions: HashMap::new(),
                allowed_hosts: vec![],
            },
        );

        assert!(map.get("172.16.0.2").is_some());
        assert!(map.get("172.16.1.2").is_none());

        map.remove("172.16.0.2");
        assert!(map.is_empty());
    }
}
