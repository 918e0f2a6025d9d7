//! Minimal public-suffix knowledge.
//!
//! A cookie may not be scoped to a "top-level domain", i.e. a suffix under which
//! unrelated parties register names. Single-label domains are already refused by
//! the parser's embedded-dot rule; this table covers the common multi-label
//! registries.

const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.uk", "gov.uk", "ltd.uk", "me.uk", "net.uk", "org.uk", "plc.uk", "sch.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "asn.au", "id.au",
    "co.nz", "net.nz", "org.nz", "govt.nz", "ac.nz",
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "gr.jp", "ad.jp",
    "com.br", "net.br", "org.br", "gov.br",
    "com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn",
    "co.in", "net.in", "org.in", "gov.in", "ac.in",
    "co.kr", "or.kr", "go.kr", "ac.kr",
    "co.za", "org.za", "gov.za", "ac.za",
    "com.mx", "org.mx", "gob.mx",
    "com.ar", "com.tr", "com.tw", "com.hk", "com.sg", "com.my", "com.ph", "com.pk",
    "co.il", "org.il", "ac.il", "co.id", "or.id", "co.th", "in.th",
    "com.ru", "com.ua", "com.pl", "com.es", "com.gr", "co.at", "or.at", "co.hu",
];

/// Returns `true` when `domain` (with or without leading dot) is a public suffix.
pub fn is_top_level_domain(domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    if domain.is_empty() {
        return true;
    }

    if !domain.contains('.') {
        return true;
    }

    MULTI_LABEL_SUFFIXES
        .iter()
        .any(|suffix| suffix.eq_ignore_ascii_case(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_labels_are_top_level() {
        assert!(is_top_level_domain("com"));
        assert!(is_top_level_domain(".org"));
        assert!(is_top_level_domain(""));
    }

    #[test]
    fn known_registries_are_top_level() {
        assert!(is_top_level_domain(".co.uk"));
        assert!(is_top_level_domain("com.au"));
    }

    #[test]
    fn registrable_domains_are_not() {
        assert!(!is_top_level_domain(".example.co.uk"));
        assert!(!is_top_level_domain("b.com"));
    }
}
