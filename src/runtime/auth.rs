//! Access-control collaborator consulted before node edits.

use rustc_hash::FxHashMap;

/// Decides whether a user holds a permission.
///
/// Permission paths are dotted segments such as `node.add.inet:ipv4` or
/// `node.tag.add.foo.bar`.
pub trait Authorizer: Send + Sync {
    /// Whether `user` may perform `perm`.
    fn allowed(&self, user: &str, perm: &[&str]) -> bool;
}

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    path: Vec<String>,
}

/// Ordered allow/deny rules per user. The first rule whose path is a prefix of
/// the requested permission decides; no match denies.
#[derive(Debug, Clone, Default)]
pub struct RuleAuthorizer {
    rules: FxHashMap<String, Vec<Rule>>,
    admins: Vec<String>,
}

impl RuleAuthorizer {
    /// Authorizer with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `perm` (and everything beneath it) to `user`.
    pub fn allow(mut self, user: &str, perm: &str) -> Self {
        self.push(user, true, perm);
        self
    }

    /// Denies `perm` (and everything beneath it) to `user`.
    pub fn deny(mut self, user: &str, perm: &str) -> Self {
        self.push(user, false, perm);
        self
    }

    /// Grants every permission to `user`.
    pub fn admin(mut self, user: &str) -> Self {
        self.admins.push(user.into());
        self
    }

    fn push(&mut self, user: &str, allow: bool, perm: &str) {
        self.rules.entry(user.into()).or_default().push(Rule {
            allow,
            path: split_perm(perm),
        });
    }
}

/// Splits a dotted permission into segments, keeping form names such as
/// `inet:ipv4` intact.
fn split_perm(perm: &str) -> Vec<String> {
    perm.split('.')
        .filter(|seg| !seg.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Authorizer for RuleAuthorizer {
    fn allowed(&self, user: &str, perm: &[&str]) -> bool {
        if self.admins.iter().any(|admin| admin == user) {
            return true;
        }
        let Some(rules) = self.rules.get(user) else {
            return false;
        };
        rules
            .iter()
            .find(|rule| {
                rule.path.len() <= perm.len()
                    && rule.path.iter().zip(perm).all(|(want, have)| want == have)
            })
            .is_some_and(|rule| rule.allow)
    }
}
