//! Forward-auth decision engine
//!
//! [`decide`] maps the attributes of a proxied request and the merged policy of
//! the project it targets to an allow/deny verdict. It performs no I/O and never
//! fails: malformed credentials are treated as absent.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// What to do with a request once IP allow-lists did not match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Allow,
    Deny,
    /// `Authorization: Basic` with a configured `user:pass` pair (Bearer tokens also accepted)
    Basic,
    /// `Authorization: Bearer` with a configured token
    Token,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Allow => "allow",
            PolicyKind::Deny => "deny",
            PolicyKind::Basic => "basic",
            PolicyKind::Token => "token",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(PolicyKind::Allow),
            "deny" => Ok(PolicyKind::Deny),
            "basic" => Ok(PolicyKind::Basic),
            "token" => Ok(PolicyKind::Token),
            other => Err(format!(
                "unknown policy \"{}\" (expected \"allow\", \"deny\", \"basic\", or \"token\")",
                other
            )),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-hostname rule. Lists left as `None` fall back to the global ones.
#[derive(Debug, Clone, PartialEq)]
pub struct HostnameRule {
    /// Glob matched against the forwarded hostname
    pub pattern: String,
    pub policy: PolicyKind,
    pub tokens: Option<Vec<String>>,
    pub allowed_ips: Option<Vec<String>>,
    pub basic_auth: Option<Vec<String>>,
}

impl HostnameRule {
    pub fn new(pattern: impl Into<String>, policy: PolicyKind) -> Self {
        Self {
            pattern: pattern.into(),
            policy,
            tokens: None,
            allowed_ips: None,
            basic_auth: None,
        }
    }
}

/// Authorization policy in effect for one request
#[derive(Debug, Clone, PartialEq)]
pub struct AuthPolicy {
    pub default_policy: PolicyKind,
    /// Exact addresses, per-octet globs (`192.168.*`) or IPv4 CIDR ranges
    pub allowed_ips: Vec<String>,
    pub tokens: Vec<String>,
    /// `user:pass` pairs
    pub basic_auth: Vec<String>,
    /// Evaluated in order, first match wins
    pub rules: Vec<HostnameRule>,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            default_policy: PolicyKind::Basic,
            allowed_ips: Vec::new(),
            tokens: Vec::new(),
            basic_auth: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl AuthPolicy {
    /// Copy of this policy with a different default policy
    pub fn with_default(&self, default_policy: PolicyKind) -> Self {
        Self {
            default_policy,
            ..self.clone()
        }
    }
}

/// Merge a per-project override into the global policy. Only the default
/// policy is replaced; lists and rules always come from the global config.
pub fn effective_policy(global: &AuthPolicy, project_override: Option<PolicyKind>) -> Cow<'_, AuthPolicy> {
    match project_override {
        Some(kind) if kind != global.default_policy => Cow::Owned(global.with_default(kind)),
        _ => Cow::Borrowed(global),
    }
}

/// Attributes of a proxied request relevant to authorization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthRequest {
    pub hostname: String,
    pub client_ip: String,
    /// Raw `X-Forwarded-For` chain, left-most entry is the original client
    pub forwarded_for: Option<String>,
    pub authorization: Option<String>,
}

impl AuthRequest {
    /// First entry of the forwarded-for chain, else the client IP
    pub fn real_ip(&self) -> &str {
        self.forwarded_for
            .as_deref()
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .unwrap_or_else(|| self.client_ip.trim())
    }
}

/// Why a request was allowed or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthReason {
    Ip,
    Token,
    Basic,
    Rule,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthDecision {
    pub allowed: bool,
    pub reason: AuthReason,
}

impl AuthDecision {
    fn allow(reason: AuthReason) -> Self {
        Self { allowed: true, reason }
    }

    fn deny(reason: AuthReason) -> Self {
        Self { allowed: false, reason }
    }
}

/// Decoded `Authorization: Basic` credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Credential lists a policy kind is checked against
struct Credentials<'a> {
    tokens: &'a [String],
    basic_auth: &'a [String],
}

impl Credentials<'_> {
    fn has_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    fn has_basic(&self, creds: &BasicCredentials) -> bool {
        let pair = format!("{}:{}", creds.username, creds.password);
        self.basic_auth.iter().any(|p| *p == pair)
    }
}

/// Decide whether a request may pass.
///
/// Order: global IP allow-list, then the first matching hostname rule (its own
/// IP list, then its policy kind), then the default policy.
pub fn decide(request: &AuthRequest, policy: &AuthPolicy) -> AuthDecision {
    let ip = request.real_ip();

    if policy.allowed_ips.iter().any(|pattern| match_ip(ip, pattern)) {
        return AuthDecision::allow(AuthReason::Ip);
    }

    let authorization = request.authorization.as_deref();

    if let Some(rule) = policy
        .rules
        .iter()
        .find(|rule| match_hostname(&request.hostname, &rule.pattern))
    {
        if let Some(allowed_ips) = &rule.allowed_ips {
            // Reported as the rule, not the global allow-list
            if allowed_ips.iter().any(|pattern| match_ip(ip, pattern)) {
                return AuthDecision::allow(AuthReason::Rule);
            }
        }

        let credentials = Credentials {
            tokens: rule.tokens.as_deref().unwrap_or(&policy.tokens),
            basic_auth: rule.basic_auth.as_deref().unwrap_or(&policy.basic_auth),
        };
        return evaluate(rule.policy, &credentials, authorization, AuthReason::Rule);
    }

    let credentials = Credentials {
        tokens: &policy.tokens,
        basic_auth: &policy.basic_auth,
    };
    evaluate(policy.default_policy, &credentials, authorization, AuthReason::Default)
}

fn evaluate(
    kind: PolicyKind,
    credentials: &Credentials<'_>,
    authorization: Option<&str>,
    origin: AuthReason,
) -> AuthDecision {
    let header = match (kind, authorization) {
        (PolicyKind::Allow, _) => return AuthDecision::allow(origin),
        (PolicyKind::Deny, _) | (_, None) => return AuthDecision::deny(origin),
        (_, Some(header)) => header,
    };

    if kind == PolicyKind::Basic {
        if let Some(creds) = parse_basic_auth(header) {
            if credentials.has_basic(&creds) {
                return AuthDecision::allow(AuthReason::Basic);
            }
        }
    }

    match parse_bearer_token(header) {
        Some(token) if credentials.has_token(token) => AuthDecision::allow(AuthReason::Token),
        _ => AuthDecision::deny(origin),
    }
}

/// Match an IP against an allow-list pattern: exact, per-octet glob or IPv4 CIDR
pub fn match_ip(ip: &str, pattern: &str) -> bool {
    let ip = ip.trim();
    let pattern = pattern.trim();
    if ip.is_empty() || pattern.is_empty() {
        return false;
    }

    if ip == pattern {
        return true;
    }

    if let Some((network, prefix)) = pattern.split_once('/') {
        return match_cidr(ip, network, prefix);
    }

    if pattern.contains('*') || pattern.contains('?') {
        return match_octets(ip, pattern);
    }

    false
}

fn match_cidr(ip: &str, network: &str, prefix: &str) -> bool {
    let (Ok(ip), Ok(network), Ok(prefix)) = (
        ip.parse::<Ipv4Addr>(),
        network.parse::<Ipv4Addr>(),
        prefix.parse::<u32>(),
    ) else {
        return false;
    };

    if prefix > 32 {
        return false;
    }

    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    u32::from(ip) & mask == u32::from(network) & mask
}

/// Each dotted segment is a glob for one octet. A trailing `*` segment also
/// covers any remaining octets, so `10.*` matches `10.1.2.3`.
fn match_octets(ip: &str, pattern: &str) -> bool {
    let octets: Vec<&str> = ip.split('.').collect();
    let segments: Vec<&str> = pattern.split('.').collect();
    if octets.len() != 4 || segments.len() > octets.len() {
        return false;
    }

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if last && *segment == "*" {
            return true;
        }
        if !glob_match(segment, octets[i]) {
            return false;
        }
    }

    segments.len() == octets.len()
}

/// Anchored glob match of a hostname, ASCII case-insensitive
pub fn match_hostname(hostname: &str, pattern: &str) -> bool {
    glob_match(pattern.trim(), hostname.trim())
}

/// `*` matches any run of characters (including none), `?` exactly one
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if let Some((star, mark)) = backtrack {
            pi = star + 1;
            ti = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (name, rest) = header.trim().split_once(' ')?;
    if name.eq_ignore_ascii_case(scheme) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Parse `Basic <base64(user:pass)>`. Anything malformed yields `None`.
pub fn parse_basic_auth(header: &str) -> Option<BasicCredentials> {
    let encoded = strip_scheme(header, "Basic")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Parse `Bearer <token>`
pub fn parse_bearer_token(header: &str) -> Option<&str> {
    strip_scheme(header, "Bearer").filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hostname: &str, ip: &str, authorization: Option<&str>) -> AuthRequest {
        AuthRequest {
            hostname: hostname.to_string(),
            client_ip: ip.to_string(),
            forwarded_for: None,
            authorization: authorization.map(String::from),
        }
    }

    fn policy(default_policy: PolicyKind) -> AuthPolicy {
        AuthPolicy {
            default_policy,
            ..AuthPolicy::default()
        }
    }

    #[test]
    fn test_cidr_octet_boundaries() {
        assert!(match_ip("192.168.1.1", "192.168.1.0/24"));
        assert!(match_ip("192.168.1.255", "192.168.1.0/24"));
        assert!(!match_ip("192.168.2.1", "192.168.1.0/24"));
        assert!(match_ip("10.20.30.40", "10.0.0.0/8"));
        assert!(!match_ip("11.0.0.1", "10.0.0.0/8"));
        assert!(match_ip("172.31.255.255", "172.16.0.0/12"));
        assert!(!match_ip("172.32.0.0", "172.16.0.0/12"));
    }

    #[test]
    fn test_cidr_edge_prefixes() {
        assert!(match_ip("8.8.8.8", "0.0.0.0/0"));
        assert!(match_ip("1.2.3.4", "1.2.3.4/32"));
        assert!(!match_ip("1.2.3.5", "1.2.3.4/32"));
        assert!(!match_ip("1.2.3.4", "1.2.3.4/33"));
        assert!(!match_ip("1.2.3.4", "1.2.3.4/"));
        assert!(!match_ip("::1", "::1/128"));
    }

    #[test]
    fn test_ip_exact_and_octet_glob() {
        assert!(match_ip("127.0.0.1", "127.0.0.1"));
        assert!(match_ip("::1", "::1"));
        assert!(!match_ip("127.0.0.2", "127.0.0.1"));

        assert!(match_ip("192.168.4.20", "192.168.*"));
        assert!(match_ip("192.168.4.20", "192.168.*.*"));
        assert!(match_ip("10.9.8.1", "10.*.*.1"));
        assert!(!match_ip("10.9.8.2", "10.*.*.1"));
        assert!(!match_ip("192.169.4.20", "192.168.*"));
        assert!(match_ip("192.168.1.7", "192.168.1.?"));
        assert!(!match_ip("192.168.1.17", "192.168.1.?"));
        assert!(!match_ip("not-an-ip", "*.*"));
    }

    #[test]
    fn test_hostname_glob_is_anchored() {
        assert!(match_hostname("shop.preview.test", "*.preview.test"));
        assert!(match_hostname(".preview.test", "*.preview.test"));
        assert!(!match_hostname("shop.preview.test.evil.com", "*.preview.test"));
        assert!(!match_hostname("evil-shop.preview.test", "shop.preview.test"));
        assert!(match_hostname("shop.preview.test", "shop.preview.test"));
        assert!(match_hostname("Shop.Preview.Test", "shop.preview.test"));
    }

    #[test]
    fn test_hostname_glob_wildcards() {
        assert!(match_hostname("pr-1.preview.test", "pr-?.preview.test"));
        assert!(!match_hostname("pr-12.preview.test", "pr-?.preview.test"));
        assert!(!match_hostname("pr-.preview.test", "pr-?.preview.test"));
        assert!(match_hostname("pr-.preview.test", "pr-*.preview.test"));
        assert!(match_hostname("a.b.c", "*"));
        assert!(match_hostname("feature-x-api.preview.test", "feature-*-api.*"));
        assert!(!match_hostname("feature-x-web.preview.test", "feature-*-api.*"));
    }

    #[test]
    fn test_parse_basic_auth() {
        let creds = parse_basic_auth("Basic YWRtaW46c2VjcmV0").unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "secret");

        // Password may itself contain colons
        let creds = parse_basic_auth("basic dTpwOnE=").unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p:q");
    }

    #[test]
    fn test_parse_basic_auth_malformed() {
        assert!(parse_basic_auth("Basic !!!not-base64!!!").is_none());
        // base64("nocolon")
        assert!(parse_basic_auth("Basic bm9jb2xvbg==").is_none());
        assert!(parse_basic_auth("Bearer YWRtaW46c2VjcmV0").is_none());
        assert!(parse_basic_auth("YWRtaW46c2VjcmV0").is_none());
        assert!(parse_basic_auth("").is_none());
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer_token("bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer_token("Bearer "), None);
        assert_eq!(parse_bearer_token("Basic abc123"), None);
        assert_eq!(parse_bearer_token("abc123"), None);
    }

    #[test]
    fn test_real_ip_prefers_forwarded_chain() {
        let mut req = request("a.test", "10.0.0.1", None);
        assert_eq!(req.real_ip(), "10.0.0.1");

        req.forwarded_for = Some(" 203.0.113.9 , 10.0.0.1".to_string());
        assert_eq!(req.real_ip(), "203.0.113.9");

        req.forwarded_for = Some("".to_string());
        assert_eq!(req.real_ip(), "10.0.0.1");
    }

    #[test]
    fn test_deny_default_denies_uncredentialed_requests() {
        let policy = policy(PolicyKind::Deny);
        let decision = decide(&request("shop.preview.test", "203.0.113.5", None), &policy);
        assert_eq!(decision, AuthDecision::deny(AuthReason::Default));

        let decision = decide(
            &request("shop.preview.test", "203.0.113.5", Some("Bearer anything")),
            &policy,
        );
        assert_eq!(decision, AuthDecision::deny(AuthReason::Default));
    }

    #[test]
    fn test_allow_default() {
        let decision = decide(&request("shop.preview.test", "203.0.113.5", None), &policy(PolicyKind::Allow));
        assert_eq!(decision, AuthDecision::allow(AuthReason::Default));
    }

    #[test]
    fn test_basic_scenario() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Basic,
            basic_auth: vec!["admin:secret".to_string()],
            ..AuthPolicy::default()
        };

        let ok = decide(
            &request("shop.preview.test", "203.0.113.5", Some("Basic YWRtaW46c2VjcmV0")),
            &policy,
        );
        assert_eq!(ok, AuthDecision::allow(AuthReason::Basic));

        // admin:wrong
        let bad = decide(
            &request("shop.preview.test", "203.0.113.5", Some("Basic YWRtaW46d3Jvbmc=")),
            &policy,
        );
        assert_eq!(bad, AuthDecision::deny(AuthReason::Default));
    }

    #[test]
    fn test_basic_falls_back_to_bearer() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Basic,
            tokens: vec!["ci-token".to_string()],
            ..AuthPolicy::default()
        };

        let decision = decide(&request("a.test", "1.2.3.4", Some("Bearer ci-token")), &policy);
        assert_eq!(decision, AuthDecision::allow(AuthReason::Token));
    }

    #[test]
    fn test_token_policy() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Token,
            tokens: vec!["t1".to_string()],
            basic_auth: vec!["admin:secret".to_string()],
            ..AuthPolicy::default()
        };

        assert_eq!(
            decide(&request("a.test", "1.2.3.4", Some("Bearer t1")), &policy),
            AuthDecision::allow(AuthReason::Token)
        );
        assert_eq!(
            decide(&request("a.test", "1.2.3.4", Some("Bearer t2")), &policy),
            AuthDecision::deny(AuthReason::Default)
        );
        // Basic credentials do not satisfy a token policy
        assert_eq!(
            decide(&request("a.test", "1.2.3.4", Some("Basic YWRtaW46c2VjcmV0")), &policy),
            AuthDecision::deny(AuthReason::Default)
        );
    }

    #[test]
    fn test_allowed_ip_short_circuits_deny() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Deny,
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            rules: vec![HostnameRule::new("*", PolicyKind::Deny)],
            ..AuthPolicy::default()
        };

        let decision = decide(&request("shop.preview.test", "10.1.2.3", None), &policy);
        assert_eq!(decision, AuthDecision::allow(AuthReason::Ip));
    }

    #[test]
    fn test_forwarded_ip_used_for_allow_list() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Deny,
            allowed_ips: vec!["203.0.113.7".to_string()],
            ..AuthPolicy::default()
        };

        let mut req = request("a.test", "10.0.0.1", None);
        req.forwarded_for = Some("203.0.113.7, 10.0.0.1".to_string());
        assert!(decide(&req, &policy).allowed);

        req.forwarded_for = Some("198.51.100.1, 203.0.113.7".to_string());
        assert!(!decide(&req, &policy).allowed);
    }

    #[test]
    fn test_matching_rule_beats_default() {
        for default_policy in [PolicyKind::Allow, PolicyKind::Deny, PolicyKind::Basic, PolicyKind::Token] {
            let policy = AuthPolicy {
                default_policy,
                rules: vec![HostnameRule::new("api.preview.test", PolicyKind::Deny)],
                ..AuthPolicy::default()
            };
            assert_eq!(
                decide(&request("api.preview.test", "1.2.3.4", None), &policy),
                AuthDecision::deny(AuthReason::Rule)
            );

            let policy = AuthPolicy {
                default_policy,
                rules: vec![HostnameRule::new("api.preview.test", PolicyKind::Allow)],
                ..AuthPolicy::default()
            };
            assert_eq!(
                decide(&request("api.preview.test", "1.2.3.4", None), &policy),
                AuthDecision::allow(AuthReason::Rule)
            );
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Deny,
            rules: vec![
                HostnameRule::new("public-*.preview.test", PolicyKind::Allow),
                HostnameRule::new("*.preview.test", PolicyKind::Deny),
            ],
            ..AuthPolicy::default()
        };

        assert!(decide(&request("public-docs.preview.test", "1.2.3.4", None), &policy).allowed);
        assert!(!decide(&request("docs.preview.test", "1.2.3.4", None), &policy).allowed);
        assert_eq!(
            decide(&request("other.example.com", "1.2.3.4", None), &policy),
            AuthDecision::deny(AuthReason::Default)
        );
    }

    #[test]
    fn test_rule_uses_own_lists() {
        let mut rule = HostnameRule::new("api.preview.test", PolicyKind::Token);
        rule.tokens = Some(vec!["api-only".to_string()]);
        rule.allowed_ips = Some(vec!["198.51.100.0/24".to_string()]);

        let policy = AuthPolicy {
            default_policy: PolicyKind::Token,
            tokens: vec!["global".to_string()],
            rules: vec![rule],
            ..AuthPolicy::default()
        };

        assert_eq!(
            decide(&request("api.preview.test", "1.2.3.4", Some("Bearer api-only")), &policy),
            AuthDecision::allow(AuthReason::Token)
        );
        assert_eq!(
            decide(&request("api.preview.test", "1.2.3.4", Some("Bearer global")), &policy),
            AuthDecision::deny(AuthReason::Rule)
        );
        assert_eq!(
            decide(&request("api.preview.test", "198.51.100.20", None), &policy),
            AuthDecision::allow(AuthReason::Rule)
        );
        // Rule IPs only apply to hosts the rule matches
        assert_eq!(
            decide(&request("web.preview.test", "198.51.100.20", None), &policy),
            AuthDecision::deny(AuthReason::Default)
        );
    }

    #[test]
    fn test_rule_basic_falls_back_to_global_pairs() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Deny,
            basic_auth: vec!["admin:secret".to_string()],
            rules: vec![HostnameRule::new("*.preview.test", PolicyKind::Basic)],
            ..AuthPolicy::default()
        };

        assert_eq!(
            decide(&request("shop.preview.test", "1.2.3.4", Some("Basic YWRtaW46c2VjcmV0")), &policy),
            AuthDecision::allow(AuthReason::Basic)
        );
        assert_eq!(
            decide(&request("shop.preview.test", "1.2.3.4", None), &policy),
            AuthDecision::deny(AuthReason::Rule)
        );
    }

    #[test]
    fn test_malformed_credentials_are_absent() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Basic,
            basic_auth: vec!["admin:secret".to_string()],
            ..AuthPolicy::default()
        };

        for header in ["Basic ###", "Basic bm9jb2xvbg==", "Digest abc", "Bearer", ""] {
            let decision = decide(&request("a.test", "1.2.3.4", Some(header)), &policy);
            assert_eq!(decision, AuthDecision::deny(AuthReason::Default), "header {:?}", header);
        }
    }

    #[test]
    fn test_decide_is_deterministic() {
        let policy = AuthPolicy {
            default_policy: PolicyKind::Basic,
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            tokens: vec!["t".to_string()],
            basic_auth: vec!["admin:secret".to_string()],
            rules: vec![HostnameRule::new("api.*", PolicyKind::Token)],
        };

        let requests = [
            request("api.preview.test", "1.2.3.4", Some("Bearer t")),
            request("shop.preview.test", "10.0.0.9", None),
            request("shop.preview.test", "1.2.3.4", Some("Basic YWRtaW46d3Jvbmc=")),
        ];

        for req in &requests {
            let first = decide(req, &policy);
            for _ in 0..10 {
                assert_eq!(decide(req, &policy), first);
            }
        }
    }

    #[test]
    fn test_effective_policy_replaces_only_default() {
        let global = AuthPolicy {
            default_policy: PolicyKind::Basic,
            tokens: vec!["t".to_string()],
            rules: vec![HostnameRule::new("x.*", PolicyKind::Deny)],
            ..AuthPolicy::default()
        };

        let merged = effective_policy(&global, Some(PolicyKind::Allow));
        assert_eq!(merged.default_policy, PolicyKind::Allow);
        assert_eq!(merged.tokens, global.tokens);
        assert_eq!(merged.rules, global.rules);

        assert!(matches!(effective_policy(&global, None), Cow::Borrowed(_)));
        assert!(matches!(effective_policy(&global, Some(PolicyKind::Basic)), Cow::Borrowed(_)));
    }

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!("allow".parse::<PolicyKind>(), Ok(PolicyKind::Allow));
        assert_eq!(" Token ".parse::<PolicyKind>(), Ok(PolicyKind::Token));
        assert!("open".parse::<PolicyKind>().is_err());
    }
}
