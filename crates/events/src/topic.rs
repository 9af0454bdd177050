//! Topic identities and the qualified naming scheme.
//!
//! Every wire-visible topic name is `{environment}.{tenant}.{module}.{short_name}`.
//! Producers, the provisioner and consumer subscription patterns all derive their
//! names from [`qualified_name`], so they agree bit-for-bit.
//!
//! Environment tags and tenant ids are word tokens (`[A-Za-z0-9_]+`) and module
//! and short names never contain `.`; joining with `.` is therefore injective and
//! no escaping is performed.

use core::str::FromStr;

use regex::Regex;

use circstore_core::{DomainError, TenantId, is_word_token};

const DELIMITER: char = '.';

/// Join the four naming components into a wire topic name.
pub fn qualified_name(environment: &str, tenant: &str, module: &str, short_name: &str) -> String {
    format!("{environment}{DELIMITER}{tenant}{DELIMITER}{module}{DELIMITER}{short_name}")
}

/// Environment namespace tag (e.g. `folio`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Environment(String);

impl Environment {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if !is_word_token(&value) {
            return Err(DomainError::validation(format!(
                "environment tag {value:?} is not a word token"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self("folio".to_string())
    }
}

impl core::fmt::Display for Environment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Environment {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A logical topic: owning module, short name and partition count.
///
/// Identities are static configuration. The short name must not change once
/// topics have been provisioned for any tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TopicIdentity {
    module: &'static str,
    short_name: &'static str,
    partitions: u32,
}

impl TopicIdentity {
    pub const fn new(module: &'static str, short_name: &'static str, partitions: u32) -> Self {
        Self {
            module,
            short_name,
            partitions,
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn short_name(&self) -> &'static str {
        self.short_name
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// `{module}.{short_name}`, used for consumer group ids and log fields.
    pub fn logical_name(&self) -> String {
        format!("{}{DELIMITER}{}", self.module, self.short_name)
    }

    /// Resolve the wire name for one tenant. Pure; no network or state access.
    pub fn qualify(&self, environment: &Environment, tenant: &TenantId) -> QualifiedTopicName {
        QualifiedTopicName(qualified_name(
            environment.as_str(),
            tenant.as_str(),
            self.module,
            self.short_name,
        ))
    }

    /// Pattern matching this topic for every tenant of `environment`.
    pub fn subscription_pattern(
        &self,
        environment: &Environment,
    ) -> Result<SubscriptionPattern, DomainError> {
        let source = format!(
            r"^{}\.\w+\.{}\.{}$",
            regex::escape(environment.as_str()),
            regex::escape(self.module),
            regex::escape(self.short_name),
        );
        let regex = Regex::new(&source).map_err(|e| {
            DomainError::validation(format!("subscription pattern for {}: {e}", self.logical_name()))
        })?;
        Ok(SubscriptionPattern { regex })
    }

    /// True when the components are dot-free and non-empty (naming stays injective).
    pub fn is_well_formed(&self) -> bool {
        let ok = |s: &str| !s.is_empty() && !s.contains(DELIMITER);
        ok(self.module) && ok(self.short_name) && self.partitions > 0
    }
}

/// Fully resolved topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTopicName(String);

impl QualifiedTopicName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a wire name back into its components.
    pub fn parts(&self) -> Result<TopicNameParts, DomainError> {
        TopicNameParts::parse(&self.0)
    }
}

impl core::fmt::Display for QualifiedTopicName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QualifiedTopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Components of a parsed wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNameParts {
    pub environment: Environment,
    pub tenant: TenantId,
    pub module: String,
    pub short_name: String,
}

impl TopicNameParts {
    pub fn parse(name: &str) -> Result<Self, DomainError> {
        let mut it = name.split(DELIMITER);
        let (Some(env), Some(tenant), Some(module), Some(short_name), None) =
            (it.next(), it.next(), it.next(), it.next(), it.next())
        else {
            return Err(DomainError::validation(format!(
                "topic name {name:?} does not have four components"
            )));
        };

        if module.is_empty() || short_name.is_empty() {
            return Err(DomainError::validation(format!(
                "topic name {name:?} has an empty component"
            )));
        }

        Ok(Self {
            environment: Environment::parse(env)?,
            tenant: TenantId::parse(tenant)?,
            module: module.to_string(),
            short_name: short_name.to_string(),
        })
    }
}

/// Anchored regular expression over qualified names (tenant wildcarded).
#[derive(Debug, Clone)]
pub struct SubscriptionPattern {
    regex: Regex,
}

impl SubscriptionPattern {
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LOAN: TopicIdentity = TopicIdentity::new("circulation", "loan", 10);
    const CHECK_IN: TopicIdentity = TopicIdentity::new("circulation", "check-in", 10);

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[test]
    fn qualifies_with_dot_join() {
        let name = LOAN.qualify(&Environment::default(), &tenant("mytenant"));
        assert_eq!(name.as_str(), "folio.mytenant.circulation.loan");
    }

    #[test]
    fn parts_round_trip() {
        let env = Environment::parse("prod").unwrap();
        let name = CHECK_IN.qualify(&env, &tenant("diku"));
        let parts = name.parts().unwrap();
        assert_eq!(parts.environment, env);
        assert_eq!(parts.tenant, tenant("diku"));
        assert_eq!(parts.module, "circulation");
        assert_eq!(parts.short_name, "check-in");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert!(TopicNameParts::parse("folio.diku.circulation").is_err());
        assert!(TopicNameParts::parse("folio.diku.circulation.loan.extra").is_err());
        assert!(TopicNameParts::parse("folio.di-ku.circulation.loan").is_err());
        assert!(TopicNameParts::parse("folio.diku..loan").is_err());
    }

    #[test]
    fn subscription_pattern_matches_every_tenant_but_nothing_else() {
        let pattern = CHECK_IN.subscription_pattern(&Environment::default()).unwrap();

        assert!(pattern.matches("folio.diku.circulation.check-in"));
        assert!(pattern.matches("folio.college_2.circulation.check-in"));
        assert!(!pattern.matches("folio.diku.circulation.loan"));
        assert!(!pattern.matches("test.diku.circulation.check-in"));
        assert!(!pattern.matches("folio..circulation.check-in"));
        assert!(!pattern.matches("folio.diku.circulation.check-in.dlq"));
        assert!(!pattern.matches("xfolio.diku.circulation.check-in"));
    }

    #[test]
    fn pattern_agrees_with_qualify() {
        let env = Environment::parse("qa").unwrap();
        let pattern = LOAN.subscription_pattern(&env).unwrap();
        assert!(pattern.matches(LOAN.qualify(&env, &tenant("t1")).as_str()));
    }

    #[test]
    fn environment_must_be_word_token() {
        assert!(Environment::parse("folio").is_ok());
        assert!(Environment::parse("fo.lio").is_err());
        assert!(Environment::parse("").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: qualifying twice yields the identical string.
        #[test]
        fn naming_is_deterministic(
            env in "[A-Za-z0-9_]{1,10}",
            tenant in "[A-Za-z0-9_]{1,12}",
        ) {
            let env = Environment::parse(env).unwrap();
            let tenant = TenantId::parse(tenant).unwrap();
            prop_assert_eq!(LOAN.qualify(&env, &tenant), LOAN.qualify(&env, &tenant));
        }

        /// Property: distinct component tuples never collide.
        #[test]
        fn naming_is_injective(
            a in ("[a-z0-9_]{1,6}", "[a-z0-9_]{1,6}", "[a-z][a-z-]{0,6}", "[a-z][a-z-]{0,6}"),
            b in ("[a-z0-9_]{1,6}", "[a-z0-9_]{1,6}", "[a-z][a-z-]{0,6}", "[a-z][a-z-]{0,6}"),
        ) {
            let name_a = qualified_name(&a.0, &a.1, &a.2, &a.3);
            let name_b = qualified_name(&b.0, &b.1, &b.2, &b.3);
            prop_assert_eq!(a == b, name_a == name_b);
        }

        /// Property: the subscription pattern accepts exactly the qualified names of its topic.
        #[test]
        fn pattern_accepts_any_tenant(tenant in "[A-Za-z0-9_]{1,12}") {
            let env = Environment::default();
            let tenant = TenantId::parse(tenant).unwrap();
            prop_assert!(LOAN.subscription_pattern(&env).unwrap().matches(LOAN.qualify(&env, &tenant).as_str()));
            prop_assert!(!CHECK_IN.subscription_pattern(&env).unwrap().matches(LOAN.qualify(&env, &tenant).as_str()));
        }
    }
}
