//! Authorization from access-security files
//!
//! Two files configure [`FileBasedServerAuthorization`], in the format used by
//! the EPICS gateway:
//!
//! A *pvlist* maps PV names, as regular expressions, onto an access security group:
//!
//! ```text
//! EVALUATION ORDER ALLOW, DENY
//! .*              ALLOW
//! ramp:.*         ALLOW  RAMPS 1
//! secret:.*       DENY
//! debug:.*        DENY   FROM 10.0.0.1 10.0.0.2
//! ```
//!
//! The last matching line wins. Names that no `ALLOW` line covers are invisible to
//! searches.
//!
//! An *access configuration file* defines, per group, who may read and write:
//!
//! ```text
//! UAG(ops) { fred, jane }
//! HAG(consoles) { ws1, "ws2.example.org" }
//! ASG(DEFAULT) { RULE(1, READ) }
//! ASG(RAMPS) {
//!     RULE(1, WRITE) { UAG(ops) HAG(consoles) }
//! }
//! ```

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    net::IpAddr,
    path::Path,
};

use nom::{
    Finish, IResult,
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{alpha1, char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::auth::{ClientAuthentication, ServerAuthorization};

pub const DEFAULT_GROUP: &str = "DEFAULT";
const DEFAULT_LEVEL: u32 = 1;

#[derive(Error, Debug)]
pub enum AccessFileError {
    #[error("Could not read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("Invalid PV pattern: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PvListAction {
    Allow { group: String, level: u32 },
    Deny { hosts: Vec<String> },
}

#[derive(Debug, Clone)]
struct PvListEntry {
    pattern: Regex,
    action: PvListAction,
}

/// Parsed pvlist: which names exist, and in which access security group
#[derive(Debug, Clone, Default)]
pub struct PvList {
    entries: Vec<PvListEntry>,
}

impl PvList {
    pub fn parse(text: &str) -> Result<PvList, AccessFileError> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens[0].eq_ignore_ascii_case("EVALUATION") {
                let order: String = tokens.concat().to_ascii_uppercase();
                if !order.ends_with("ALLOW,DENY") {
                    return Err(AccessFileError::Syntax {
                        line: number + 1,
                        message: "Only 'EVALUATION ORDER ALLOW, DENY' is supported".to_string(),
                    });
                }
                continue;
            }
            let syntax = |message: &str| AccessFileError::Syntax {
                line: number + 1,
                message: message.to_string(),
            };
            let keyword = tokens
                .get(1)
                .ok_or_else(|| syntax("Missing ALLOW or DENY"))?
                .to_ascii_uppercase();
            let action = match keyword.as_str() {
                "ALLOW" => PvListAction::Allow {
                    group: tokens.get(2).unwrap_or(&DEFAULT_GROUP).to_string(),
                    level: match tokens.get(3) {
                        Some(level) => level
                            .parse()
                            .map_err(|_| syntax("Access security level must be a number"))?,
                        None => DEFAULT_LEVEL,
                    },
                },
                "DENY" => {
                    let hosts = match tokens.get(2) {
                        Some(from) if from.eq_ignore_ascii_case("FROM") => {
                            tokens[3..].iter().map(|h| h.to_string()).collect()
                        }
                        Some(_) => return Err(syntax("Expected 'DENY FROM host...'")),
                        None => Vec::new(),
                    };
                    PvListAction::Deny { hosts }
                }
                "ALIAS" => {
                    debug!("Ignoring pvlist ALIAS on line {}", number + 1);
                    continue;
                }
                _ => return Err(syntax("Expected ALLOW, DENY or ALIAS")),
            };
            entries.push(PvListEntry {
                pattern: Regex::new(&format!("^(?:{})$", tokens[0]))?,
                action,
            });
        }
        Ok(PvList { entries })
    }

    /// Find the group and level for a name, as seen from `host`
    pub fn resolve(&self, channel: &str, host: &str) -> Option<(&str, u32)> {
        for entry in self.entries.iter().rev() {
            if !entry.pattern.is_match(channel) {
                continue;
            }
            match &entry.action {
                PvListAction::Allow { group, level } => return Some((group, *level)),
                PvListAction::Deny { hosts } if hosts.is_empty() => return None,
                PvListAction::Deny { hosts } if hosts.iter().any(|h| h == host) => return None,
                PvListAction::Deny { .. } => (),
            }
        }
        None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccessRule {
    level: u32,
    access: Access,
    user_groups: Vec<String>,
    host_groups: Vec<String>,
}

/// Parsed access configuration file
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    user_groups: HashMap<String, HashSet<String>>,
    host_groups: HashMap<String, HashSet<String>>,
    access_groups: HashMap<String, Vec<AccessRule>>,
}

enum AcfEntry<'a> {
    UserGroup(&'a str, Vec<&'a str>),
    HostGroup(&'a str, Vec<&'a str>),
    AccessGroup(&'a str, Vec<AccessRule>),
}

enum RuleItem<'a> {
    Users(Vec<&'a str>),
    Hosts(Vec<&'a str>),
    Ignored,
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn name(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), is_not("\""), char('"')),
        take_while1(|c: char| c.is_alphanumeric() || "_-.:+".contains(c)),
    ))(input)
}

fn name_list(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list0(ws(char(',')), ws(name))(input)
}

fn parenthesized<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(ws(char('(')), inner, ws(char(')')))
}

fn braced<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(ws(char('{')), inner, ws(char('}')))
}

/// `UAG(name) { a, b }` or `HAG(name) { a, b }`
fn group_definition<'a>(
    keyword: &'static str,
) -> impl FnMut(&'a str) -> IResult<&'a str, (&'a str, Vec<&'a str>)> {
    preceded(
        ws(tag(keyword)),
        pair(parenthesized(ws(name)), braced(name_list)),
    )
}

fn access(input: &str) -> IResult<&str, Access> {
    alt((
        map(tag("NONE"), |_| Access::None),
        map(tag("READ"), |_| Access::Read),
        map(tag("WRITE"), |_| Access::Write),
        // Treat RPC as WRITE
        map(tag("RPC"), |_| Access::Write),
    ))(input)
}

fn rule_item(input: &str) -> IResult<&str, RuleItem> {
    alt((
        map(preceded(ws(tag("UAG")), parenthesized(name_list)), RuleItem::Users),
        map(preceded(ws(tag("HAG")), parenthesized(name_list)), RuleItem::Hosts),
        map(
            preceded(ws(tag("CALC")), parenthesized(ws(name))),
            |_| RuleItem::Ignored,
        ),
    ))(input)
}

/// `RULE(level, access[, TRAPWRITE]) [{ UAG(..) HAG(..) }]`
fn rule(input: &str) -> IResult<&str, AccessRule> {
    let (input, (level, access, _trap)) = preceded(
        ws(tag("RULE")),
        parenthesized(tuple((
            ws(map_res(digit1, |s: &str| s.parse::<u32>())),
            preceded(ws(char(',')), ws(access)),
            opt(preceded(ws(char(',')), ws(alpha1))),
        ))),
    )(input)?;
    let (input, items) = opt(braced(many0(rule_item)))(input)?;
    let mut rule = AccessRule {
        level,
        access,
        user_groups: Vec::new(),
        host_groups: Vec::new(),
    };
    for item in items.unwrap_or_default() {
        match item {
            RuleItem::Users(users) => rule.user_groups.extend(users.iter().map(|u| u.to_string())),
            RuleItem::Hosts(hosts) => rule.host_groups.extend(hosts.iter().map(|h| h.to_string())),
            RuleItem::Ignored => (),
        }
    }
    Ok((input, rule))
}

/// `INPA("pv")` and friends, which we accept but don't use
fn input_link(input: &str) -> IResult<&str, ()> {
    map(
        pair(ws(recognize(pair(tag("INP"), alpha1))), parenthesized(ws(name))),
        |_| (),
    )(input)
}

fn access_group(input: &str) -> IResult<&str, (&str, Vec<AccessRule>)> {
    let (input, group) = preceded(ws(tag("ASG")), parenthesized(ws(name)))(input)?;
    let (input, rules) = braced(many0(alt((map(rule, Some), map(input_link, |_| None)))))(input)?;
    Ok((input, (group, rules.into_iter().flatten().collect())))
}

fn acf_entries(input: &str) -> IResult<&str, Vec<AcfEntry>> {
    many0(alt((
        map(group_definition("UAG"), |(n, users)| AcfEntry::UserGroup(n, users)),
        map(group_definition("HAG"), |(n, hosts)| AcfEntry::HostGroup(n, hosts)),
        map(access_group, |(n, rules)| AcfEntry::AccessGroup(n, rules)),
    )))(input)
}

impl AccessConfig {
    pub fn parse(text: &str) -> Result<AccessConfig, AccessFileError> {
        // Drop comments, keeping line structure for error messages
        let text: String = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n");
        let (_, entries) = all_consuming(ws(acf_entries))(text.as_str())
            .finish()
            .map_err(|e| {
                let offset = text.len() - e.input.len();
                let near = e.input.lines().next().unwrap_or("").trim();
                AccessFileError::Syntax {
                    line: text[..offset].matches('\n').count() + 1,
                    message: format!("Cannot parse access configuration near '{near}'"),
                }
            })?;
        let mut config = AccessConfig::default();
        for entry in entries {
            match entry {
                AcfEntry::UserGroup(name, users) => {
                    config
                        .user_groups
                        .entry(name.to_string())
                        .or_default()
                        .extend(users.iter().map(|u| u.to_string()));
                }
                AcfEntry::HostGroup(name, hosts) => {
                    config
                        .host_groups
                        .entry(name.to_string())
                        .or_default()
                        .extend(hosts.iter().map(|h| h.to_ascii_lowercase()));
                }
                AcfEntry::AccessGroup(name, rules) => {
                    config
                        .access_groups
                        .entry(name.to_string())
                        .or_default()
                        .extend(rules);
                }
            }
        }
        Ok(config)
    }

    /// Highest access granted by `group` to a user on a host, for a PV of `level`
    pub fn access(&self, group: &str, level: u32, user: &str, host: &str) -> Access {
        let host = host.to_ascii_lowercase();
        let Some(rules) = self.access_groups.get(group) else {
            trace!("No access group {group}");
            return Access::None;
        };
        rules
            .iter()
            .filter(|rule| level <= rule.level)
            .filter(|rule| {
                rule.user_groups.is_empty()
                    || rule.user_groups.iter().any(|g| {
                        self.user_groups
                            .get(g)
                            .is_some_and(|users| users.contains(user))
                    })
            })
            .filter(|rule| {
                rule.host_groups.is_empty()
                    || rule.host_groups.iter().any(|g| {
                        self.host_groups
                            .get(g)
                            .is_some_and(|hosts| hosts.contains(&host))
                    })
            })
            .map(|rule| rule.access)
            .max()
            .unwrap_or(Access::None)
    }
}

/// [`ServerAuthorization`] based on a pvlist and an access configuration file
#[derive(Debug, Clone)]
pub struct FileBasedServerAuthorization {
    pvlist: PvList,
    config: AccessConfig,
}

fn read_file(path: &Path) -> Result<String, AccessFileError> {
    fs::read_to_string(path).map_err(|source| AccessFileError::Io {
        path: path.display().to_string(),
        source,
    })
}

impl FileBasedServerAuthorization {
    pub fn new(pvlist: PvList, config: AccessConfig) -> Self {
        FileBasedServerAuthorization { pvlist, config }
    }

    pub fn from_files(
        pvlist: impl AsRef<Path>,
        acf: impl AsRef<Path>,
    ) -> Result<Self, AccessFileError> {
        let pvlist = PvList::parse(&read_file(pvlist.as_ref())?)?;
        let config = AccessConfig::parse(&read_file(acf.as_ref())?)?;
        Ok(FileBasedServerAuthorization::new(pvlist, config))
    }
}

impl ServerAuthorization for FileBasedServerAuthorization {
    fn has_read_access(&self, channel: &str, peer: IpAddr) -> bool {
        self.pvlist.resolve(channel, &peer.to_string()).is_some()
    }

    fn has_write_access(&self, channel: &str, client: &ClientAuthentication) -> bool {
        let host = client.host();
        let Some((group, level)) = self.pvlist.resolve(channel, &host) else {
            return false;
        };
        let access = self.config.access(group, level, client.user(), &host);
        debug!("{client} has {access:?} access to {channel} via {group}");
        access == Access::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PVLIST: &str = r#"
        EVALUATION ORDER ALLOW, DENY
        .*          ALLOW
        ramp:.*     ALLOW RAMPS 1
        secret:.*   DENY
        debug:.*    DENY FROM 10.0.0.1
    "#;

    const ACF: &str = r#"
        # Operators
        UAG(ops) { fred, "jane" }
        HAG(consoles) { ws1, WS2 }
        ASG(DEFAULT) {
            RULE(1, READ)
        }
        ASG(RAMPS) {
            INPA("some:pv")
            RULE(1, READ)
            RULE(1, WRITE, TRAPWRITE) {
                UAG(ops)
                HAG(consoles)
            }
        }
    "#;

    #[test]
    fn pvlist_resolution() {
        let list = PvList::parse(PVLIST).unwrap();
        assert_eq!(list.resolve("anything", "h"), Some((DEFAULT_GROUP, 1)));
        assert_eq!(list.resolve("ramp:1", "h"), Some(("RAMPS", 1)));
        assert_eq!(list.resolve("secret:key", "h"), None);
        assert_eq!(list.resolve("debug:x", "10.0.0.1"), None);
        assert_eq!(list.resolve("debug:x", "10.0.0.2"), Some((DEFAULT_GROUP, 1)));
        // Patterns are anchored
        assert_eq!(list.resolve("xramp:1", "h"), Some((DEFAULT_GROUP, 1)));

        let narrow = PvList::parse("ramp:.* ALLOW").unwrap();
        assert_eq!(narrow.resolve("other", "h"), None);

        assert!(matches!(
            PvList::parse("abc WHATEVER"),
            Err(AccessFileError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn acf_rules() {
        let config = AccessConfig::parse(ACF).unwrap();
        assert_eq!(config.access("DEFAULT", 1, "fred", "ws1"), Access::Read);
        assert_eq!(config.access("RAMPS", 1, "fred", "ws1"), Access::Write);
        assert_eq!(config.access("RAMPS", 1, "fred", "ws2"), Access::Write);
        assert_eq!(config.access("RAMPS", 1, "bob", "ws1"), Access::Read);
        assert_eq!(config.access("RAMPS", 1, "jane", "elsewhere"), Access::Read);
        assert_eq!(config.access("RAMPS", 2, "fred", "ws1"), Access::None);
        assert_eq!(config.access("MISSING", 1, "fred", "ws1"), Access::None);
    }

    #[test]
    fn acf_syntax_error_reports_line() {
        let err = AccessConfig::parse("UAG(a) { x }\nASG(b) {\n RULE(one, READ)\n}").unwrap_err();
        match err {
            AccessFileError::Syntax { line, .. } => assert!(line >= 2),
            other => panic!("Unexpected error {other}"),
        }
    }

    #[test]
    fn authorization() {
        let auth = FileBasedServerAuthorization::new(
            PvList::parse(PVLIST).unwrap(),
            AccessConfig::parse(ACF).unwrap(),
        );
        let fred = ClientAuthentication::Ca {
            user: "fred".into(),
            host: "ws1".into(),
        };
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(auth.has_read_access("ramp:1", peer));
        assert!(!auth.has_read_access("secret:1", peer));
        assert!(auth.has_write_access("ramp:1", &fred));
        assert!(!auth.has_write_access("other", &fred));
        assert!(!auth.has_write_access("ramp:1", &ClientAuthentication::anonymous(peer)));
    }
}
