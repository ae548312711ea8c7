//! # Distinguished Names
//!
//! Owned DN and RDN value types with the operations the store needs:
//! parsing, schema normalization, and the prefix/ancestry tests that
//! drive the hierarchy and alias algorithms.
//!
//! A DN is written leaf-first (`cn=a,ou=system`); internally RDNs are
//! stored in that order, index 0 being the entry's own RDN. Ancestry
//! tests compare the trailing components: `cn=a,ou=system` starts with
//! `ou=system`.
//!
//! Two forms of the same name circulate in the store: the user-provided
//! form, preserving case and spacing, and the normalized form, where
//! attribute types are OIDs and values went through the attribute's
//! equality normalizer. Equality, prefix, and sibling tests are only
//! meaningful on normalized names.
//!
//! Escaping: `\,`, `\=`, `\+` and `\\` are understood in values, both on
//! parse and on display. Multi-valued RDNs are not supported.

use std::fmt::{self, Display};

use eyre::{ensure, Result};

use crate::schema::SchemaRegistry;

/// One relative distinguished name: a single attribute/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rdn {
    attr: String,
    value: String,
}

impl Rdn {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Parses `attr=value` with escape handling.
    pub fn parse(s: &str) -> Result<Self> {
        let mut attr = String::new();
        let mut value = String::new();
        let mut seen_eq = false;
        let mut escaped = false;

        for ch in s.chars() {
            if escaped {
                if seen_eq { &mut value } else { &mut attr }.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '=' if !seen_eq => seen_eq = true,
                '+' if !seen_eq => {
                    eyre::bail!("multi-valued rdn '{s}' is not supported")
                }
                _ => if seen_eq { &mut value } else { &mut attr }.push(ch),
            }
        }

        ensure!(!escaped, "rdn '{s}' ends with a dangling escape");
        ensure!(seen_eq, "rdn '{s}' has no '=' separator");
        let attr = attr.trim().to_string();
        let value = value.trim().to_string();
        ensure!(!attr.is_empty(), "rdn '{s}' has an empty attribute type");
        ensure!(!value.is_empty(), "rdn '{s}' has an empty value");

        Ok(Self { attr, value })
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

fn escape_value(value: &str, out: &mut String) {
    for ch in value.chars() {
        if matches!(ch, '\\' | ',' | '=' | '+') {
            out.push('\\');
        }
        out.push(ch);
    }
}

impl Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(self.attr.len() + self.value.len() + 1);
        s.push_str(&self.attr);
        s.push('=');
        escape_value(&self.value, &mut s);
        f.write_str(&s)
    }
}

/// A distinguished name: a non-empty sequence of RDNs, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    pub fn from_rdns(rdns: Vec<Rdn>) -> Result<Self> {
        ensure!(!rdns.is_empty(), "a dn must have at least one rdn");
        Ok(Self { rdns })
    }

    /// Parses a leaf-first DN string, honoring `\,` escapes.
    pub fn parse(s: &str) -> Result<Self> {
        ensure!(!s.trim().is_empty(), "cannot parse an empty dn");

        let mut parts = Vec::new();
        let mut current = String::new();
        let mut escaped = false;
        for ch in s.chars() {
            if escaped {
                current.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    current.push(ch);
                    escaped = true;
                }
                ',' => {
                    parts.push(std::mem::take(&mut current));
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        ensure!(!escaped, "dn '{s}' ends with a dangling escape");
        parts.push(current);

        let rdns = parts
            .iter()
            .map(|p| Rdn::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Self::from_rdns(rdns)
    }

    /// Number of RDNs.
    pub fn size(&self) -> usize {
        self.rdns.len()
    }

    /// The entry's own (leftmost) RDN.
    pub fn rdn(&self) -> &Rdn {
        &self.rdns[0]
    }

    /// RDN by position, 0 being the rightmost (suffix-most) component.
    pub fn get(&self, i: usize) -> &Rdn {
        &self.rdns[self.rdns.len() - 1 - i]
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// The DN with the `n` leftmost RDNs removed; `None` once nothing
    /// would remain.
    pub fn prefix(&self, n: usize) -> Option<Dn> {
        if n >= self.rdns.len() {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[n..].to_vec(),
        })
    }

    pub fn parent(&self) -> Option<Dn> {
        self.prefix(1)
    }

    /// New DN naming `rdn` directly below `self`.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// Whether `ancestor` is a trailing prefix of `self` (equality counts).
    pub fn starts_with(&self, ancestor: &Dn) -> bool {
        if ancestor.rdns.len() > self.rdns.len() {
            return false;
        }
        let skip = self.rdns.len() - ancestor.rdns.len();
        self.rdns[skip..] == ancestor.rdns[..]
    }

    /// `self` lies in the subtree rooted at `ancestor`, including being
    /// `ancestor` itself.
    pub fn is_under(&self, ancestor: &Dn) -> bool {
        self.starts_with(ancestor)
    }

    /// Strict descendant test.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.starts_with(ancestor)
    }

    /// Two names are siblings when they share a parent.
    pub fn is_sibling_of(&self, other: &Dn) -> bool {
        self.parent() == other.parent()
    }

    /// Rewrites the trailing `old_base` components with `new_base`.
    /// `self` must lie under `old_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Result<Dn> {
        ensure!(
            self.is_under(old_base),
            "'{self}' is not under '{old_base}', cannot rebase"
        );
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Ok(Dn { rdns })
    }

    /// Schema normalization: attribute types become OIDs, values go
    /// through the attribute's equality normalizer.
    pub fn normalize(&self, schema: &SchemaRegistry) -> Result<Dn> {
        let mut rdns = Vec::with_capacity(self.rdns.len());
        for rdn in &self.rdns {
            let at = schema.attribute_type(rdn.attr())?;
            rdns.push(Rdn::new(at.oid(), at.equality().normalize(rdn.value())));
        }
        Ok(Dn { rdns })
    }
}

impl Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn parse_and_render_round_trip() {
        let parsed = dn("cn=a,ou=system");
        assert_eq!(parsed.size(), 2);
        assert_eq!(parsed.rdn().attr(), "cn");
        assert_eq!(parsed.rdn().value(), "a");
        assert_eq!(parsed.to_string(), "cn=a,ou=system");
    }

    #[test]
    fn escaped_comma_stays_in_value() {
        let parsed = dn(r"cn=Smith\, Alice,ou=system");
        assert_eq!(parsed.size(), 2);
        assert_eq!(parsed.rdn().value(), "Smith, Alice");
        assert_eq!(Dn::parse(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn get_indexes_from_the_suffix_end() {
        let parsed = dn("cn=x,ou=a,ou=system");
        assert_eq!(parsed.get(0).to_string(), "ou=system");
        assert_eq!(parsed.get(2).to_string(), "cn=x");
    }

    #[test]
    fn parent_and_prefix() {
        let parsed = dn("cn=x,ou=a,ou=system");
        assert_eq!(parsed.parent().unwrap().to_string(), "ou=a,ou=system");
        assert_eq!(parsed.prefix(2).unwrap().to_string(), "ou=system");
        assert!(parsed.prefix(3).is_none());
    }

    #[test]
    fn ancestry_tests() {
        let suffix = dn("ou=system");
        let mid = dn("ou=a,ou=system");
        let leaf = dn("cn=x,ou=a,ou=system");

        assert!(leaf.starts_with(&suffix));
        assert!(leaf.is_descendant_of(&mid));
        assert!(leaf.is_under(&leaf));
        assert!(!leaf.is_descendant_of(&leaf));
        assert!(!suffix.starts_with(&leaf));
        assert!(!dn("ou=another").starts_with(&suffix));
    }

    #[test]
    fn sibling_test_uses_parents() {
        assert!(dn("cn=a,ou=system").is_sibling_of(&dn("cn=b,ou=system")));
        assert!(!dn("cn=a,ou=t,ou=system").is_sibling_of(&dn("cn=b,ou=system")));
    }

    #[test]
    fn rebase_rewrites_the_tail() {
        let old_base = dn("ou=a,ou=system");
        let new_base = dn("ou=b,ou=system");
        let moved = dn("cn=x,ou=a,ou=system").rebase(&old_base, &new_base).unwrap();
        assert_eq!(moved.to_string(), "cn=x,ou=b,ou=system");

        assert!(dn("cn=x,ou=other").rebase(&old_base, &new_base).is_err());
    }

    #[test]
    fn normalization_uses_oids_and_equality_rules() {
        let schema = SchemaRegistry::core();
        let norm = dn("CN=Alice  Smith,OU=System").normalize(&schema).unwrap();
        assert_eq!(norm.to_string(), "2.5.4.3=alice smith,2.5.4.11=system");

        // Normalized equality ignores original case and spacing.
        let other = dn("cn=ALICE SMITH,ou=system").normalize(&schema).unwrap();
        assert_eq!(norm, other);
    }

    #[test]
    fn child_builds_one_level_down() {
        let parent = dn("ou=system");
        let child = parent.child(Rdn::new("cn", "a"));
        assert_eq!(child.to_string(), "cn=a,ou=system");
    }

    #[test]
    fn rejects_empty_and_malformed_input() {
        assert!(Dn::parse("").is_err());
        assert!(Dn::parse("  ").is_err());
        assert!(Dn::parse("cn").is_err());
        assert!(Dn::parse("cn=").is_err());
        assert!(Dn::parse("=v").is_err());
        assert!(Rdn::parse("a+b=c").is_err());
    }
}
