//! Custom filter parser
//!
//! Parses user-authored ABP/uBO network filters. Every line is handled on
//! its own: a malformed line yields a [`CustomFilterError`] and parsing
//! carries on with the next one.

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;
use tg_core::types::ResourceType;

use crate::rule::DomainType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterAction {
    Block,
    Allow,
}

/// What part of the URL a filter looks at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterPattern {
    /// No URL constraint; options alone scope the filter
    Any,
    /// `||`, `|`, `^` and `*` keep their filter-syntax meaning
    UrlFilter(String),
    Regex(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DomainConstraint {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFilter {
    pub action: FilterAction,
    pub pattern: FilterPattern,
    pub important: bool,
    pub match_case: bool,
    /// `$document` on an exception: the whole page is allowed
    pub document: bool,
    /// Empty means every resource type.
    pub resource_types: ResourceType,
    pub domain_type: Option<DomainType>,
    pub domains: Option<DomainConstraint>,
    pub badfilter: bool,
    /// 1-based line in the source text
    pub line: usize,
}

/// A line that could not be turned into a rule.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("line {line}: {reason} (`{text}`)")]
pub struct CustomFilterError {
    pub line: usize,
    pub text: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFilterList {
    pub network: Vec<NetworkFilter>,
    /// Element hiding lines, passed through untouched
    pub cosmetic: Vec<String>,
    pub errors: Vec<CustomFilterError>,
}

pub fn parse_filter_list(text: &str) -> ParsedFilterList {
    let mut parsed = ParsedFilterList::default();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if is_cosmetic_line(line) {
            parsed.cosmetic.push(line.to_string());
            continue;
        }

        if is_comment_line(line) {
            continue;
        }

        match parse_network_filter(line, index + 1) {
            Ok(Some(filter)) => parsed.network.push(filter),
            Ok(None) => {}
            Err(reason) => parsed.errors.push(CustomFilterError {
                line: index + 1,
                text: line.to_string(),
                reason,
            }),
        }
    }

    parsed
}

fn parse_network_filter(line: &str, line_number: usize) -> Result<Option<NetworkFilter>, String> {
    match parse_hosts_line(line)? {
        HostsLine::NotHosts => {}
        HostsLine::Skip => return Ok(None),
        HostsLine::Host(host) => {
            return Ok(Some(NetworkFilter {
                action: FilterAction::Block,
                pattern: FilterPattern::UrlFilter(format!("||{host}^")),
                important: false,
                match_case: false,
                document: false,
                resource_types: ResourceType::empty(),
                domain_type: None,
                domains: None,
                badfilter: false,
                line: line_number,
            }))
        }
    }

    let (action, rest) = match line.strip_prefix("@@") {
        Some(rest) => (FilterAction::Allow, rest.trim_start()),
        None => (FilterAction::Block, line),
    };

    let (pattern_part, options_text) = split_rule_options(rest);
    let options = match options_text {
        Some(options_text) => parse_options(options_text)?,
        None => ParsedOptions::default(),
    };

    let pattern = parse_pattern(pattern_part.trim())?;
    if pattern == FilterPattern::Any && options.is_unscoped() {
        return Err("filter would match every request".to_string());
    }

    if options.document {
        if action == FilterAction::Block {
            return Err("`document` is only supported on exceptions".to_string());
        }
        if !(options.resource_types - ResourceType::DOCUMENT).is_empty() {
            return Err("`document` cannot be combined with other resource types".to_string());
        }
    }

    Ok(Some(NetworkFilter {
        action,
        pattern,
        important: options.important,
        match_case: options.match_case,
        document: options.document,
        resource_types: options.resource_types,
        domain_type: options.domain_type,
        domains: options.domains,
        badfilter: options.badfilter,
        line: line_number,
    }))
}

#[derive(Debug, Clone, Default)]
struct ParsedOptions {
    important: bool,
    match_case: bool,
    document: bool,
    badfilter: bool,
    resource_types: ResourceType,
    domain_type: Option<DomainType>,
    domains: Option<DomainConstraint>,
}

impl ParsedOptions {
    fn is_unscoped(&self) -> bool {
        self.resource_types.is_empty() && self.domain_type.is_none() && self.domains.is_none()
    }
}

/// Split `pattern$options`. The last `$` wins so regex end anchors survive.
fn split_rule_options(line: &str) -> (&str, Option<&str>) {
    match line.rfind('$') {
        Some(pos) if !line[pos + 1..].contains('/') => (&line[..pos], Some(&line[pos + 1..])),
        _ => (line, None),
    }
}

fn parse_options(text: &str) -> Result<ParsedOptions, String> {
    let mut options = ParsedOptions::default();
    let mut type_include = ResourceType::empty();
    let mut type_exclude = ResourceType::empty();
    let mut first_party: Option<bool> = None;
    let mut third_party: Option<bool> = None;

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(options);
    }

    for raw in trimmed.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let raw_lower = raw.to_ascii_lowercase();
        let raw_lower = raw_lower.as_str();

        match raw_lower {
            "important" => {
                options.important = true;
                continue;
            }
            "match-case" | "match_case" => {
                options.match_case = true;
                continue;
            }
            "badfilter" => {
                options.badfilter = true;
                continue;
            }
            "document" | "doc" => {
                options.document = true;
                type_include |= ResourceType::MAIN_FRAME;
                continue;
            }
            _ => {}
        }

        if let Some(domain_value) = raw_lower.strip_prefix("domain=") {
            let parsed = parse_domain_option(domain_value)?;
            options.domains = Some(merge_constraints(options.domains.take(), parsed));
            continue;
        }

        let (negated, name) = match raw_lower.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw_lower),
        };

        if let Some(mask) = request_type_mask(name) {
            if negated {
                type_exclude |= mask;
            } else {
                type_include |= mask;
            }
            continue;
        }

        match name {
            "third-party" | "thirdparty" | "3p" => {
                third_party = Some(!negated);
                continue;
            }
            "first-party" | "firstparty" | "1p" => {
                first_party = Some(!negated);
                continue;
            }
            _ => {}
        }

        return Err(format!("unsupported option `{raw}`"));
    }

    options.resource_types = finalize_mask(type_include, type_exclude)
        .ok_or_else(|| "options exclude every resource type".to_string())?;
    options.domain_type = finalize_party(first_party, third_party)?;

    Ok(options)
}

fn merge_constraints(existing: Option<DomainConstraint>, incoming: DomainConstraint) -> DomainConstraint {
    let mut merged = match existing {
        Some(mut current) => {
            current.include.extend(incoming.include);
            current.exclude.extend(incoming.exclude);
            current
        }
        None => incoming,
    };
    merged.include.sort();
    merged.include.dedup();
    merged.exclude.sort();
    merged.exclude.dedup();
    merged
}

fn parse_domain_option(value: &str) -> Result<DomainConstraint, String> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();

    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let (is_exclude, domain_raw) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let domain =
            normalize_domain(domain_raw).ok_or_else(|| format!("invalid domain `{domain_raw}`"))?;

        if is_exclude {
            exclude.push(domain);
        } else {
            include.push(domain);
        }
    }

    if include.is_empty() && exclude.is_empty() {
        return Err("empty `domain=` option".to_string());
    }

    Ok(DomainConstraint { include, exclude })
}

/// Combine `type` and `~type` options. `None` when nothing is left; an
/// empty mask means every type.
fn finalize_mask(include: ResourceType, exclude: ResourceType) -> Option<ResourceType> {
    let mask = if include.is_empty() {
        ResourceType::ALL - exclude
    } else {
        include - exclude
    };
    if mask.is_empty() {
        return None;
    }
    if mask == ResourceType::ALL {
        return Some(ResourceType::empty());
    }
    Some(mask)
}

fn finalize_party(first: Option<bool>, third: Option<bool>) -> Result<Option<DomainType>, String> {
    let first = first.or(third.map(|t| !t));
    let third = third.or(first.map(|f| !f));
    match (first, third) {
        (Some(true), Some(false)) => Ok(Some(DomainType::FirstParty)),
        (Some(false), Some(true)) => Ok(Some(DomainType::ThirdParty)),
        (Some(false), Some(false)) => Err("options exclude both parties".to_string()),
        _ => Ok(None),
    }
}

fn request_type_mask(name: &str) -> Option<ResourceType> {
    match name {
        "script" => Some(ResourceType::SCRIPT),
        "image" => Some(ResourceType::IMAGE),
        "stylesheet" | "css" => Some(ResourceType::STYLESHEET),
        "object" => Some(ResourceType::OBJECT),
        "subdocument" | "frame" => Some(ResourceType::SUB_FRAME),
        "xmlhttprequest" | "xhr" => Some(ResourceType::XMLHTTPREQUEST),
        "media" => Some(ResourceType::MEDIA),
        "font" => Some(ResourceType::FONT),
        "ping" | "beacon" => Some(ResourceType::PING),
        "websocket" => Some(ResourceType::WEBSOCKET),
        "csp_report" => Some(ResourceType::CSP_REPORT),
        "other" => Some(ResourceType::OTHER),
        _ => None,
    }
}

fn is_comment_line(line: &str) -> bool {
    line.starts_with('!') || line.starts_with('[') || line.starts_with('#')
}

fn is_cosmetic_line(line: &str) -> bool {
    line.contains("##") || line.contains("#@#") || line.contains("#?#") || line.contains("#$#")
}

enum HostsLine {
    NotHosts,
    /// Entries naming the local machine
    Skip,
    Host(String),
}

/// `0.0.0.0 host` lines.
fn parse_hosts_line(line: &str) -> Result<HostsLine, String> {
    let mut parts = line.split_whitespace();
    let (Some(first), Some(second)) = (parts.next(), parts.next()) else {
        return Ok(HostsLine::NotHosts);
    };

    if first.parse::<IpAddr>().is_err() {
        return Ok(HostsLine::NotHosts);
    }

    if matches!(
        second,
        "localhost" | "localhost.localdomain" | "local" | "broadcasthost" | "ip6-localhost" | "ip6-loopback"
    ) || second.parse::<IpAddr>().is_ok()
    {
        return Ok(HostsLine::Skip);
    }

    normalize_domain(second)
        .map(HostsLine::Host)
        .ok_or_else(|| format!("invalid hostname `{second}`"))
}

fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
    {
        return None;
    }

    Some(trimmed.to_ascii_lowercase())
}

fn parse_pattern(pattern: &str) -> Result<FilterPattern, String> {
    if pattern.is_empty() || pattern.bytes().all(|b| b == b'*') {
        return Ok(FilterPattern::Any);
    }

    if !pattern.is_ascii() {
        return Err("pattern must be ASCII".to_string());
    }

    if pattern.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err("pattern contains whitespace".to_string());
    }

    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let source = &pattern[1..pattern.len() - 1];
        return match regex::Regex::new(source) {
            Ok(_) => Ok(FilterPattern::Regex(source.to_string())),
            Err(e) => Err(format!("invalid regex: {e}")),
        };
    }

    if pattern == "|" || pattern == "||" {
        return Err("empty anchored pattern".to_string());
    }

    if let Some(rest) = pattern.strip_prefix("||") {
        if rest.starts_with('|') {
            return Err("malformed anchor".to_string());
        }
    }

    if pattern[1..].trim_end_matches('|').contains('|') && !pattern.starts_with("||") {
        return Err("misplaced `|` anchor".to_string());
    }

    Ok(FilterPattern::UrlFilter(pattern.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(text: &str) -> NetworkFilter {
        let parsed = parse_filter_list(text);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        assert_eq!(parsed.network.len(), 1);
        parsed.network.into_iter().next().unwrap()
    }

    #[test]
    fn host_anchor_with_options() {
        let filter = single("||ads.example.com^$script,image,third-party,domain=news.site|~m.news.site");
        assert_eq!(filter.action, FilterAction::Block);
        assert_eq!(filter.pattern, FilterPattern::UrlFilter("||ads.example.com^".into()));
        assert_eq!(filter.resource_types, ResourceType::SCRIPT | ResourceType::IMAGE);
        assert_eq!(filter.domain_type, Some(DomainType::ThirdParty));
        let domains = filter.domains.unwrap();
        assert_eq!(domains.include, vec!["news.site"]);
        assert_eq!(domains.exclude, vec!["m.news.site"]);
        assert_eq!(filter.line, 1);
    }

    #[test]
    fn exceptions_and_negated_types() {
        let filter = single("@@|https://cdn.example.com/lib.js|$~script,important");
        assert_eq!(filter.action, FilterAction::Allow);
        assert!(filter.important);
        assert!(!filter.resource_types.contains(ResourceType::SCRIPT));
        assert!(filter.resource_types.contains(ResourceType::IMAGE));

        let filter = single("@@||intranet.example^$document");
        assert!(filter.document);
        assert_eq!(filter.resource_types, ResourceType::MAIN_FRAME);
    }

    #[test]
    fn regex_keeps_end_anchor() {
        let filter = single(r"/ads\d+\.js$/");
        assert_eq!(filter.pattern, FilterPattern::Regex(r"ads\d+\.js$".into()));

        let filter = single(r"/track\.gif$/$image");
        assert_eq!(filter.pattern, FilterPattern::Regex(r"track\.gif$".into()));
        assert_eq!(filter.resource_types, ResourceType::IMAGE);
    }

    #[test]
    fn hosts_file_lines() {
        let parsed = parse_filter_list("0.0.0.0 tracker.net\n127.0.0.1 localhost\n::1 ip6-localhost");
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.network.len(), 1);
        assert_eq!(parsed.network[0].pattern, FilterPattern::UrlFilter("||tracker.net^".into()));
    }

    #[test]
    fn comments_and_cosmetics_are_set_aside() {
        let parsed = parse_filter_list("! title\n[Adblock Plus 2.0]\n# hosts comment\nexample.com##.banner\n##.ad\n");
        assert!(parsed.network.is_empty());
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.cosmetic, vec!["example.com##.banner", "##.ad"]);
    }

    #[test]
    fn malformed_lines_report_without_stopping() {
        let text = "||good.com^\n||bad.com^$unknownopt\n/[unclosed/\n*\n$script,~script\n||also-good.org^$xhr";
        let parsed = parse_filter_list(text);
        assert_eq!(parsed.network.len(), 2);
        assert_eq!(parsed.network[1].line, 6);

        let lines: Vec<usize> = parsed.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
        assert!(parsed.errors[0].reason.contains("unknownopt"));
        assert!(parsed.errors[1].reason.starts_with("invalid regex"));
        assert_eq!(parsed.errors[0].text, "||bad.com^$unknownopt");
    }

    #[test]
    fn party_options() {
        assert_eq!(single("||a.com^$~third-party").domain_type, Some(DomainType::FirstParty));
        assert_eq!(single("||a.com^$1p").domain_type, Some(DomainType::FirstParty));
        assert_eq!(single("||a.com^$3p,1p").domain_type, None);
        let parsed = parse_filter_list("||a.com^$~1p,~3p");
        assert_eq!(parsed.errors.len(), 1);
    }

    #[test]
    fn options_without_pattern_need_scope() {
        let filter = single("$script,domain=example.com");
        assert_eq!(filter.pattern, FilterPattern::Any);
        assert_eq!(parse_filter_list("$important").errors.len(), 1);
    }

    #[test]
    fn badfilter_is_parsed_as_flag() {
        let filter = single("||ads.com^$badfilter");
        assert!(filter.badfilter);
    }
}
