use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AclLoadError {
    #[error("failed to read blacklist file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rule on line {line}: {text}")]
    InvalidRule { line: usize, text: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AclRule {
    Exact(String),
    WildcardSuffix(String),
    SingleIp(Ipv4Addr),
    Cidr(Ipv4Net),
}

/// The class of rule that caused a denial, used for the 403 body (never the
/// literal rule text, so the response can't be used to enumerate the list).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleClass {
    Exact,
    Wildcard,
    IpOrCidr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(RuleClass),
}

/// Ordered, exact → wildcard → IP/CIDR access-control list. Loaded once at
/// startup and treated as immutable afterward.
pub struct Acl {
    exact: Vec<String>,
    wildcards: Vec<String>,
    ips: Vec<Ipv4Addr>,
    cidrs: Vec<Ipv4Net>,
}

impl Acl {
    pub fn empty() -> Self {
        Acl {
            exact: Vec::new(),
            wildcards: Vec::new(),
            ips: Vec::new(),
            cidrs: Vec::new(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AclLoadError> {
        let contents = fs::read_to_string(path)?;
        let mut acl = Acl::empty();

        for (idx, raw_line) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let without_comment = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let trimmed = without_comment.trim();
            if trimmed.is_empty() {
                continue;
            }
            acl.add_rule(trimmed).map_err(|()| AclLoadError::InvalidRule {
                line: line_no,
                text: raw_line.to_string(),
            })?;
        }

        Ok(acl)
    }

    fn add_rule(&mut self, rule: &str) -> Result<(), ()> {
        if let Some(suffix) = rule.strip_prefix("*.") {
            self.wildcards.push(suffix.to_lowercase());
            return Ok(());
        }
        if let Ok(net) = rule.parse::<Ipv4Net>() {
            self.cidrs.push(net);
            return Ok(());
        }
        if let Ok(ip) = rule.parse::<Ipv4Addr>() {
            self.ips.push(ip);
            return Ok(());
        }
        if rule.is_empty() {
            return Err(());
        }
        self.exact.push(rule.to_lowercase());
        Ok(())
    }

    /// Checks a hostname (optionally with a trailing `:port`) or an IP literal
    /// against the loaded rules, in exact → wildcard → IP/CIDR order.
    pub fn check(&self, host_or_ip: &str) -> Decision {
        let host = crate::proxy::parser::host_part(host_or_ip).to_lowercase();

        if self.exact.iter().any(|e| *e == host) {
            return Decision::Deny(RuleClass::Exact);
        }

        if self
            .wildcards
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()) && host.len() > suffix.len() && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        {
            return Decision::Deny(RuleClass::Wildcard);
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            if self.ips.iter().any(|r| *r == ip) || self.cidrs.iter().any(|net| net.contains(&ip)) {
                return Decision::Deny(RuleClass::IpOrCidr);
            }
        }

        Decision::Allow
    }
}
