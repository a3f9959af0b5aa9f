//! Criteria parsing and record matching.
//!
//! A local question decomposes into `<instance>.<group-or-explicit>.<tld>`.
//! The instance segment is either a plain instance id or a compact
//! `q-<key><value>...` string of single-letter criteria. Short keys map to
//! record columns:
//!
//! | key | column |
//! |-----|--------|
//! | `a` | az_id |
//! | `i` | num_id |
//! | `m` | network_id |
//! | `n` | network |
//! | `g` | group_ids (contains) |
//! | `s` | health strategy (never matched against records) |

use std::collections::HashMap;

use crate::error::DnsError;
use crate::records::Record;

/// Criteria key carrying the health strategy code.
pub const STRATEGY_KEY: &str = "s";

const INSTANCE_NAME: &str = "instance_name";
const GROUP_NAME: &str = "group_name";
const NETWORK_NAME: &str = "network_name";
const DEPLOYMENT: &str = "deployment";
const DOMAIN: &str = "domain";

const SHORT_KEYS: [char; 6] = ['a', 'i', 'm', 'n', 'g', 's'];

/// A parsed set of query criteria: short keys and decomposed name segments,
/// each with one or more accepted values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    fields: HashMap<String, Vec<String>>,
}

impl Criteria {
    /// Append a value for a key.
    pub fn insert(&mut self, key: &str, value: String) {
        self.fields.entry(key.to_string()).or_default().push(value);
    }

    /// Values recorded for a key.
    pub fn get(&self, key: &str) -> &[String] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The health strategy code, when criterion `s` is present.
    pub fn strategy_code(&self) -> Option<&str> {
        self.get(STRATEGY_KEY).first().map(String::as_str)
    }

    /// Whether any criterion other than the health strategy and the domain
    /// itself constrains the result.
    fn is_selective(&self) -> bool {
        self.fields
            .keys()
            .any(|k| k != STRATEGY_KEY && k != DOMAIN)
    }

    /// AND of all field predicates; a predicate passes when the record's
    /// column equals any listed value. The health strategy never matches.
    pub fn matches(&self, record: &Record) -> bool {
        self.fields.iter().all(|(key, values)| {
            let field_eq = |field: &str| values.iter().any(|v| field == v);
            match key.as_str() {
                STRATEGY_KEY => true,
                "a" => field_eq(&record.az_id),
                "i" => field_eq(&record.num_id),
                "m" => field_eq(&record.network_id),
                "n" => field_eq(&record.network),
                "g" => values.iter().any(|v| record.group_ids.contains(v)),
                INSTANCE_NAME => values
                    .iter()
                    .any(|v| record.id == *v || record.num_id == *v),
                GROUP_NAME => field_eq(&record.instance_group),
                NETWORK_NAME => field_eq(&record.network),
                DEPLOYMENT => field_eq(&record.deployment),
                DOMAIN => field_eq(&record.domain),
                _ => false,
            }
        })
    }
}

/// Decompose a local question against the known top-level domains.
///
/// Returns `Ok(None)` when no known domain is a suffix of the name; the
/// caller answers with an empty result. The TLD match is case-insensitive,
/// longest suffix wins.
pub fn parse_query(fqdn: &str, domains: &[String]) -> Result<Option<Criteria>, DnsError> {
    let name = fqdn.to_ascii_lowercase();

    let Some((instance, rest)) = name.split_once('.') else {
        return Err(DnsError::MalformedQuery(fqdn.to_string()));
    };
    if rest.is_empty() {
        return Err(DnsError::MalformedQuery(fqdn.to_string()));
    }

    let mut tld = String::new();
    for domain in domains {
        let candidate = domain.to_ascii_lowercase();
        if is_domain_suffix(&name, &candidate) && candidate.len() > tld.len() {
            tld = candidate;
        }
    }
    if tld.is_empty() {
        return Ok(None);
    }

    let group_query = rest
        .strip_suffix(&format!(".{tld}"))
        .unwrap_or(rest)
        .to_string();
    let group_segments: Vec<&str> = group_query.split('.').collect();

    let mut criteria = Criteria::default();
    parse_instance_segment(instance, &mut criteria)?;

    match group_segments.as_slice() {
        [group] => parse_group_segment(group, &mut criteria)?,
        [group, network, deployment] => {
            criteria.insert(GROUP_NAME, group.to_string());
            criteria.insert(NETWORK_NAME, network.to_string());
            criteria.insert(DEPLOYMENT, deployment.to_string());
        }
        _ => {
            return Err(DnsError::MalformedQuery(format!(
                "bad group segment query: {group_query}"
            )))
        }
    }

    criteria.insert(DOMAIN, tld);

    if !criteria.is_selective() {
        return Err(DnsError::AmbiguousQuery);
    }

    Ok(Some(criteria))
}

fn parse_instance_segment(instance: &str, criteria: &mut Criteria) -> Result<(), DnsError> {
    if let Some(codes) = instance.strip_prefix("q-") {
        parse_short_codes(codes, criteria)
    } else {
        criteria.insert(INSTANCE_NAME, instance.to_string());
        Ok(())
    }
}

fn parse_group_segment(group: &str, criteria: &mut Criteria) -> Result<(), DnsError> {
    if let Some(codes) = group.strip_prefix("q-") {
        parse_short_codes(codes, criteria)
    } else {
        criteria.insert("g", group.to_string());
        Ok(())
    }
}

/// Parse a run of `<key><digits>` pairs, e.g. `s0a1` or `g7`.
fn parse_short_codes(codes: &str, criteria: &mut Criteria) -> Result<(), DnsError> {
    let mut chars = codes.chars().peekable();

    if chars.peek().is_none() {
        return Err(DnsError::MalformedQuery(format!(
            "empty criteria query: q-{codes}"
        )));
    }

    while let Some(key) = chars.next() {
        if !SHORT_KEYS.contains(&key) {
            return Err(DnsError::MalformedQuery(format!(
                "unrecognized criterion '{key}' in q-{codes}"
            )));
        }

        let mut value = String::new();
        while let Some(c) = chars.peek().filter(|c| c.is_ascii_digit()) {
            value.push(*c);
            chars.next();
        }
        if value.is_empty() {
            return Err(DnsError::MalformedQuery(format!(
                "criterion '{key}' carries no value in q-{codes}"
            )));
        }

        criteria.insert(&key.to_string(), value);
    }

    Ok(())
}

/// Suffix match on label boundaries: `bosh.` matches `a.b.bosh.` and
/// `bosh.` itself, but not `mybosh.`.
pub(crate) fn is_domain_suffix(name: &str, domain: &str) -> bool {
    if domain == "." {
        return true;
    }
    name == domain
        || name
            .strip_suffix(domain)
            .map(|head| head.ends_with('.'))
            .unwrap_or(false)
}
