//! Correlation headers forwarded from the calling context onto outgoing records.
//!
//! Only a fixed allow-list is ever copied: the forwarding URL and the tenant.
//! Everything else a caller carries (tokens, request ids, arbitrary headers)
//! stays behind.

use std::collections::BTreeMap;

use circstore_core::TenantId;

pub const OKAPI_URL_HEADER: &str = "x-okapi-url";
pub const OKAPI_TENANT_HEADER: &str = "x-okapi-tenant";

/// Headers that may travel from a caller onto a broker record.
pub const FORWARDED_HEADERS: [&str; 2] = [OKAPI_URL_HEADER, OKAPI_TENANT_HEADER];

/// Transport-level record headers (lower-case names).
pub type RecordHeaders = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedHeaders {
    url: Option<String>,
    tenant: Option<String>,
}

impl ForwardedHeaders {
    /// Pick the allow-listed headers out of arbitrary caller headers.
    ///
    /// Names match case-insensitively; the first occurrence wins.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            let name = name.as_ref();
            let slot = if name.eq_ignore_ascii_case(OKAPI_URL_HEADER) {
                &mut headers.url
            } else if name.eq_ignore_ascii_case(OKAPI_TENANT_HEADER) {
                &mut headers.tenant
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(value.as_ref().to_string());
            }
        }
        headers
    }

    /// Recover forwarded headers from a consumed record.
    pub fn from_record(headers: &RecordHeaders) -> Self {
        Self::from_pairs(headers.iter())
    }

    /// Use `url` when the caller did not supply a forwarding URL.
    pub fn with_fallback_url(mut self, url: Option<&str>) -> Self {
        if self.url.is_none() {
            self.url = url.map(str::to_string);
        }
        self
    }

    /// The tenant header always names the tenant the event belongs to.
    pub fn with_tenant(mut self, tenant: &TenantId) -> Self {
        self.tenant = Some(tenant.as_str().to_string());
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn to_record_headers(&self) -> RecordHeaders {
        let mut out = RecordHeaders::new();
        if let Some(url) = &self.url {
            out.insert(OKAPI_URL_HEADER.to_string(), url.clone());
        }
        if let Some(tenant) = &self.tenant {
            out.insert(OKAPI_TENANT_HEADER.to_string(), tenant.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_allow_listed_headers_are_forwarded() {
        let caller = [
            ("X-Okapi-Url", "http://okapi:9130"),
            ("X-Okapi-Tenant", "diku"),
            ("X-Okapi-Token", "secret"),
            ("X-Injected", "evil"),
        ];

        let headers = ForwardedHeaders::from_pairs(caller).to_record_headers();

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[OKAPI_URL_HEADER], "http://okapi:9130");
        assert_eq!(headers[OKAPI_TENANT_HEADER], "diku");
    }

    #[test]
    fn fallback_url_only_fills_gaps() {
        let given = ForwardedHeaders::from_pairs([("x-okapi-url", "http://caller")])
            .with_fallback_url(Some("http://configured"));
        let missing = ForwardedHeaders::default().with_fallback_url(Some("http://configured"));

        assert_eq!(given.url(), Some("http://caller"));
        assert_eq!(missing.url(), Some("http://configured"));
    }

    #[test]
    fn tenant_is_overridden_by_event_tenant() {
        let tenant = TenantId::parse("college").unwrap();
        let headers = ForwardedHeaders::from_pairs([("x-okapi-tenant", "other")]).with_tenant(&tenant);
        assert_eq!(headers.tenant(), Some("college"));
    }

    #[test]
    fn empty_caller_yields_no_headers() {
        let headers = ForwardedHeaders::from_pairs(Vec::<(String, String)>::new());
        assert!(headers.to_record_headers().is_empty());
    }
}
