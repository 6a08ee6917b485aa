//! `iptables-save` / `iptables-restore` text as ordered line records.
//!
//! Lines are kept as opaque records including their terminators, so a file
//! that is parsed and serialized again comes back byte-for-byte. Only the
//! lines we insert are new.

use super::{MasqueradeRule, NetworkError, NetworkResult};
use ipnetwork::IpNetwork;

const NAT_TABLE: &str = "*nat";
const FILTER_TABLE: &str = "*filter";
const COMMIT: &str = "COMMIT";
const POSTROUTING_CHAIN: &str = ":POSTROUTING ACCEPT [0:0]";
const NAT_BLOCK_COMMENT: &str = "# NAT for the vpngate tunnel subnet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Table,
    Chain,
    Rule,
    Commit,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    raw: String,
}

impl Line {
    fn new(body: &str) -> Self {
        Self {
            raw: format!("{body}\n"),
        }
    }

    fn body(&self) -> &str {
        self.raw.trim_end_matches(['\n', '\r'])
    }

    fn kind(&self) -> LineKind {
        let body = self.body().trim_start();
        if body.starts_with('*') {
            LineKind::Table
        } else if body.starts_with(':') {
            LineKind::Chain
        } else if body.starts_with("-A ") || body.starts_with("-I ") {
            LineKind::Rule
        } else if body.trim_end() == COMMIT {
            LineKind::Commit
        } else {
            LineKind::Other
        }
    }

    fn is_table(&self, name: &str) -> bool {
        self.kind() == LineKind::Table && self.body().trim() == name
    }

    fn declares_postrouting(&self) -> bool {
        self.kind() == LineKind::Chain && self.body().trim_start().starts_with(":POSTROUTING ")
    }

    /// Whether this line is a POSTROUTING masquerade of the same subnet out
    /// of the same interface. Extra match options do not matter, but a
    /// negated source or out interface never matches.
    fn matches(&self, rule: &MasqueradeRule) -> bool {
        if self.kind() != LineKind::Rule {
            return false;
        }
        let mut chain = None;
        let mut source = None;
        let mut out = None;
        let mut target = None;
        let mut negated = false;
        let mut bang = false;
        let mut tokens = self.body().split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token == "!" {
                bang = true;
                continue;
            }
            let slot = match token {
                "-A" | "-I" | "--append" | "--insert" => &mut chain,
                "-s" | "--source" => &mut source,
                "-o" | "--out-interface" => &mut out,
                "-j" | "--jump" => &mut target,
                _ => {
                    bang = false;
                    continue;
                }
            };
            // Both `! -o eth0` and the older `-o ! eth0` spellings.
            if tokens.peek() == Some(&"!") {
                tokens.next();
                bang = true;
            }
            if bang && matches!(token, "-s" | "--source" | "-o" | "--out-interface") {
                negated = true;
            }
            bang = false;
            *slot = tokens.next();
        }
        !negated
            && chain == Some("POSTROUTING")
            && target == Some("MASQUERADE")
            && out == Some(rule.egress.as_str())
            && source
                .and_then(|s| s.parse::<IpNetwork>().ok())
                .is_some_and(|s| s == rule.subnet)
    }
}

/// Ordered rule lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    lines: Vec<Line>,
}

impl RuleSet {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text
                .split_inclusive('\n')
                .map(|raw| Line { raw: raw.to_string() })
                .collect(),
        }
    }

    pub fn to_text(&self) -> String {
        self.lines.iter().map(|l| l.raw.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Index range of the `*nat` table, from its header to its `COMMIT`.
    fn nat_table(&self) -> NetworkResult<Option<(usize, usize)>> {
        let Some(start) = self.lines.iter().position(|l| l.is_table(NAT_TABLE)) else {
            return Ok(None);
        };
        let commit = self.lines[start + 1..]
            .iter()
            .position(|l| matches!(l.kind(), LineKind::Commit | LineKind::Table))
            .map(|offset| start + 1 + offset)
            .filter(|&idx| self.lines[idx].kind() == LineKind::Commit)
            .ok_or_else(|| NetworkError::Malformed("*nat table is missing COMMIT".into()))?;
        Ok(Some((start, commit)))
    }

    /// Number of lines equivalent to `rule` inside the nat table.
    pub fn count_matching(&self, rule: &MasqueradeRule) -> usize {
        match self.nat_table() {
            Ok(Some((start, commit))) => self.lines[start..commit]
                .iter()
                .filter(|l| l.matches(rule))
                .count(),
            _ => 0,
        }
    }

    pub fn contains(&self, rule: &MasqueradeRule) -> bool {
        self.count_matching(rule) > 0
    }

    /// Insert `rule` unless present. Returns whether anything changed.
    ///
    /// An existing nat table gets the rule ahead of its other rules. Without
    /// one, a complete nat block goes before the `*filter` table, or at the
    /// end when there is no filter table either.
    pub fn insert(&mut self, rule: &MasqueradeRule) -> NetworkResult<bool> {
        if self.contains(rule) {
            return Ok(false);
        }

        if let Some((start, commit)) = self.nat_table()? {
            let mut at = start + 1;
            if !self.lines[start..commit].iter().any(Line::declares_postrouting) {
                self.lines.insert(at, Line::new(POSTROUTING_CHAIN));
            }
            while at < self.lines.len() && self.lines[at].kind() == LineKind::Chain {
                at += 1;
            }
            self.lines.insert(at, Line::new(&rule.to_line()));
            return Ok(true);
        }

        let block = [
            Line::new(NAT_BLOCK_COMMENT),
            Line::new(NAT_TABLE),
            Line::new(POSTROUTING_CHAIN),
            Line::new(&rule.to_line()),
            Line::new(COMMIT),
            Line::new(""),
        ];
        match self.lines.iter().position(|l| l.is_table(FILTER_TABLE)) {
            Some(filter) => {
                self.lines.splice(filter..filter, block);
            }
            None => {
                if let Some(last) = self.lines.last_mut() {
                    if !last.raw.ends_with('\n') {
                        last.raw.push('\n');
                    }
                }
                self.lines.extend(block);
            }
        }
        Ok(true)
    }
}
