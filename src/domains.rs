//! Domain classification shared by thread keys and domain scoring.

use std::collections::HashSet;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainClass {
    /// A company domain that can identify an account.
    Business,
    /// Webmail provider shared by unrelated people.
    Public,
    /// Bid platform or notification relay.
    Relay,
    /// The company's own domain.
    Internal,
    /// No domain at all.
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    public: HashSet<String>,
    relay: HashSet<String>,
    internal: HashSet<String>,
}

fn lowered(list: &[String]) -> HashSet<String> {
    list.iter().map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty()).collect()
}

impl DomainPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            public: lowered(&config.public_domains),
            relay: lowered(&config.relay_domains),
            internal: lowered(&config.internal_domains),
        }
    }

    /// Classify a domain. Subdomains inherit the class of a listed parent,
    /// so `mail.procore.com` is a relay.
    pub fn classify(&self, domain: &str) -> DomainClass {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        if domain.is_empty() {
            return DomainClass::Unknown;
        }
        let mut candidate = domain.as_str();
        loop {
            if self.internal.contains(candidate) {
                return DomainClass::Internal;
            }
            if self.relay.contains(candidate) {
                return DomainClass::Relay;
            }
            if self.public.contains(candidate) {
                return DomainClass::Public;
            }
            match candidate.split_once('.') {
                Some((_, rest)) if rest.contains('.') => candidate = rest,
                _ => return DomainClass::Business,
            }
        }
    }

    /// True if the domain can serve as account evidence.
    pub fn is_business(&self, domain: &str) -> bool {
        self.classify(domain) == DomainClass::Business
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DomainPolicy {
        let config = EngineConfig {
            internal_domains: vec!["Desert.net".into()],
            ..EngineConfig::default()
        };
        DomainPolicy::from_config(&config)
    }

    #[test]
    fn test_classify_lists() {
        let p = policy();
        assert_eq!(p.classify("gmail.com"), DomainClass::Public);
        assert_eq!(p.classify("procore.com"), DomainClass::Relay);
        assert_eq!(p.classify("desert.net"), DomainClass::Internal);
        assert_eq!(p.classify("acme.com"), DomainClass::Business);
        assert_eq!(p.classify(""), DomainClass::Unknown);
    }

    #[test]
    fn test_subdomain_inherits_class() {
        let p = policy();
        assert_eq!(p.classify("us02.mail.procore.com"), DomainClass::Relay);
        assert!(p.is_business("eng.acme.com"));
    }
}
