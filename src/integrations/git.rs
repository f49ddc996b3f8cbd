//! Normalization of user-supplied git repository URLs. Jobs carry the URL
//! for display and notifications only, so everything is folded into one
//! canonical HTTPS form.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::NexusError;

const HOST_MAPPINGS: &[(&str, &str)] = &[
    ("github.com", "github.com"),
    ("gitlab.com", "gitlab.com"),
    ("bitbucket.org", "bitbucket.org"),
    ("ssh.dev.azure.com", "dev.azure.com"),
];

fn https_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https://(?P<host>[\w\.]+)/(?P<path>[\w\-\.~]+/[\w\-\.~]+?)(?:\.git)?/?$")
            .unwrap()
    })
}

fn ssh_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^git@(?P<host>[\w\.]+):(?P<path>[\w\-\.~]+/[\w\-\.~]+?)(?:\.git)?/?$").unwrap()
    })
}

fn git_protocol_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^git://(?P<host>[\w\.]+)/(?P<path>[\w\-\.~]+/[\w\-\.~]+?)(?:\.git)?/?$")
            .unwrap()
    })
}

fn mapped_host(host: &str) -> Option<&'static str> {
    HOST_MAPPINGS
        .iter()
        .find(|(from, _)| *from == host)
        .map(|(_, to)| *to)
}

/// Canonicalize an HTTPS, SSH, or git-protocol repository URL to HTTPS.
pub fn normalize_git_url(url: &str) -> Result<String, NexusError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(NexusError::InvalidRequest(
            "git repository URL cannot be empty".to_string(),
        ));
    }

    if https_pattern().is_match(url) {
        return Ok(url.trim_end_matches('/').to_string());
    }

    for pattern in [ssh_pattern(), git_protocol_pattern()] {
        if let Some(caps) = pattern.captures(url) {
            let host = &caps["host"];
            let path = &caps["path"];
            return match mapped_host(host) {
                Some(mapped) => Ok(format!("https://{mapped}/{path}")),
                None => Err(NexusError::InvalidRequest(format!(
                    "unknown git host: {host}"
                ))),
            };
        }
    }

    Err(NexusError::InvalidRequest(
        "invalid git URL; must be an HTTPS, SSH, or git protocol URL".to_string(),
    ))
}
