/**
 * Resource kinds, watch filters and the request paths they imply
 */
use super::utils::{format_field_selector, format_label_selector};
use crate::error::{Error, Result};
use kube::Resource;
use reqwest::Url;
use sha2::{Digest, Sha224};
use std::collections::BTreeMap;

/// Placeholder server used when only the path and query matter
const IGNORED_SERVER: &str = "https://ignore";

/// Length of the hex prefix used as a cache id
const CACHE_ID_LEN: usize = 10;

/// Group/version/kind of a watched collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: Option<String>,
}

impl ResourceKind {
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: None,
        }
    }

    #[must_use]
    pub fn with_plural(mut self, plural: &str) -> Self {
        self.plural = Some(plural.to_string());
        self
    }

    /// Derive the kind from a `kube::Resource` type
    #[must_use]
    pub fn of<K>() -> Self
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let dt = K::DynamicType::default();
        Self {
            group: K::group(&dt).into_owned(),
            version: K::version(&dt).into_owned(),
            kind: K::kind(&dt).into_owned(),
            plural: Some(K::plural(&dt).into_owned()),
        }
    }

    /// Plural resource name, defaulting to lowercase kind + "s"
    #[must_use]
    pub fn plural(&self) -> String {
        self.plural
            .clone()
            .unwrap_or_else(|| format!("{}s", self.kind.to_lowercase()))
    }

    fn base_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }
}

/// Narrowing applied to a watched collection. Each filter may be set once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    namespace: Option<String>,
    name: Option<String>,
    labels: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl Filters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one namespace
    ///
    /// # Errors
    ///
    /// Returns `FilterAlreadySet` if a namespace was already chosen
    pub fn namespace(mut self, namespace: &str) -> Result<Self> {
        if self.namespace.is_some() {
            return Err(Error::FilterAlreadySet("namespace".to_string()));
        }
        self.namespace = Some(namespace.to_string());
        Ok(self)
    }

    /// Restrict to a single named object
    ///
    /// # Errors
    ///
    /// Returns `FilterAlreadySet` if a name was already chosen
    pub fn name(mut self, name: &str) -> Result<Self> {
        if self.name.is_some() {
            return Err(Error::FilterAlreadySet("name".to_string()));
        }
        self.name = Some(name.to_string());
        Ok(self)
    }

    /// Require a label. An empty value only requires the key to exist.
    ///
    /// # Errors
    ///
    /// Returns `FilterAlreadySet` if the label key was already used
    pub fn label(mut self, key: &str, value: &str) -> Result<Self> {
        if self.labels.contains_key(key) {
            return Err(Error::FilterAlreadySet(format!("label {key}")));
        }
        self.labels.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    /// Require a field value
    ///
    /// # Errors
    ///
    /// Returns `FilterAlreadySet` if the field was already used
    pub fn field(mut self, key: &str, value: &str) -> Result<Self> {
        if self.fields.contains_key(key) {
            return Err(Error::FilterAlreadySet(format!("field {key}")));
        }
        self.fields.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    #[must_use]
    pub fn namespace_ref(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn name_ref(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Resource path for `kind`, optionally without the object name
    #[must_use]
    pub fn path(&self, kind: &ResourceKind, exclude_name: bool) -> String {
        let namespace = self.namespace.as_ref().map(|ns| format!("namespaces/{ns}"));
        let name = if exclude_name { None } else { self.name.clone() };

        [Some(kind.base_path()), namespace, Some(kind.plural()), name]
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Field selector, optionally pinned to the filtered name
    fn field_selector(&self, pin_name: bool) -> Option<String> {
        let mut fields = self.fields.clone();
        if pin_name {
            if let Some(name) = &self.name {
                fields.insert("metadata.name".to_string(), name.clone());
            }
        }
        (!fields.is_empty()).then(|| format_field_selector(&fields))
    }

    fn label_selector(&self) -> Option<String> {
        (!self.labels.is_empty()).then(|| format_label_selector(&self.labels))
    }

    /// Full request URL for `kind` on `server`
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if the path can not be joined onto the server url
    pub fn url(&self, server: &Url, kind: &ResourceKind, exclude_name: bool) -> Result<Url> {
        if server.cannot_be_a_base() {
            return Err(Error::InvalidUrl(server.to_string()));
        }
        let mut url = server.clone();
        let prefix = server.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{}", self.path(kind, exclude_name)));
        url.set_query(None);
        Ok(url)
    }

    /// URL of a collection request (list or watch), without object name
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if the server url can not carry a path
    pub fn collection_url(
        &self,
        server: &Url,
        kind: &ResourceKind,
        query: &CollectionQuery<'_>,
    ) -> Result<Url> {
        let mut url = self.url(server, kind, true)?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(selector) = self.field_selector(true) {
                pairs.append_pair("fieldSelector", &selector);
            }
            if let Some(selector) = self.label_selector() {
                pairs.append_pair("labelSelector", &selector);
            }
            if query.watch {
                pairs.append_pair("watch", "true");
            }
            if let Some(token) = query.continue_token {
                pairs.append_pair("continue", token);
            }
            if let Some(rv) = query.resource_version {
                pairs.append_pair("resourceVersion", rv);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Stable short id for this (kind, filters) pair. Independent of the
    /// server and of any resource version.
    ///
    /// # Errors
    ///
    /// Never fails for well formed kinds; kept fallible for url building
    pub fn cache_id(&self, kind: &ResourceKind) -> Result<String> {
        let server = Url::parse(IGNORED_SERVER).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let mut url = self.url(&server, kind, false)?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(selector) = self.field_selector(false) {
                pairs.append_pair("fieldSelector", &selector);
            }
            if let Some(selector) = self.label_selector() {
                pairs.append_pair("labelSelector", &selector);
            }
        }

        let mut canonical = url.path().to_string();
        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            canonical.push('?');
            canonical.push_str(query);
        }

        let digest = Sha224::digest(canonical.as_bytes());
        Ok(format!("{digest:x}").chars().take(CACHE_ID_LEN).collect())
    }
}

/// Query parameters of a list or watch request
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionQuery<'a> {
    pub watch: bool,
    pub continue_token: Option<&'a str>,
    pub resource_version: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Pod;

    fn server() -> Url {
        Url::parse("https://k8s.local:6443").unwrap()
    }

    #[test]
    fn test_kind_from_resource() {
        let pods = ResourceKind::of::<Pod>();
        assert_eq!(pods.group, "");
        assert_eq!(pods.version, "v1");
        assert_eq!(pods.plural(), "pods");

        let deployments = ResourceKind::of::<Deployment>();
        assert_eq!(deployments.group, "apps");
        assert_eq!(deployments.plural(), "deployments");
    }

    #[test]
    fn test_plural_fallback() {
        let kind = ResourceKind::new("example.com", "v1alpha1", "Widget");
        assert_eq!(kind.plural(), "widgets");
        assert_eq!(kind.with_plural("widgetries").plural(), "widgetries");
    }

    #[test]
    fn test_paths() {
        let pods = ResourceKind::of::<Pod>();
        let filters = Filters::new().namespace("default").unwrap().name("web").unwrap();
        assert_eq!(filters.path(&pods, false), "/api/v1/namespaces/default/pods/web");
        assert_eq!(filters.path(&pods, true), "/api/v1/namespaces/default/pods");

        let widgets = ResourceKind::new("example.com", "v1", "Widget");
        assert_eq!(Filters::new().path(&widgets, true), "/apis/example.com/v1/widgets");
    }

    #[test]
    fn test_filters_can_only_be_set_once() {
        let filters = Filters::new().namespace("a").unwrap();
        assert!(matches!(filters.clone().namespace("b"), Err(Error::FilterAlreadySet(_))));

        let filters = filters.label("app", "web").unwrap();
        assert!(filters.clone().label("app", "db").is_err());
        assert!(filters.clone().label("tier", "").is_ok());

        let filters = filters.name("x").unwrap();
        assert!(filters.name("y").is_err());
    }

    #[test]
    fn test_watch_url_pins_name() {
        let pods = ResourceKind::of::<Pod>();
        let filters = Filters::new()
            .namespace("default")
            .unwrap()
            .name("web")
            .unwrap()
            .label("app", "web")
            .unwrap();
        let url = filters
            .collection_url(
                &server(),
                &pods,
                &CollectionQuery {
                    watch: true,
                    continue_token: None,
                    resource_version: Some("42"),
                },
            )
            .unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("fieldSelector".into(), "metadata.name=web".into())));
        assert!(pairs.contains(&("labelSelector".into(), "app=web".into())));
        assert!(pairs.contains(&("watch".into(), "true".into())));
        assert!(pairs.contains(&("resourceVersion".into(), "42".into())));
    }

    #[test]
    fn test_list_url_without_filters_has_no_query() {
        let url = Filters::new()
            .collection_url(&server(), &ResourceKind::of::<Pod>(), &CollectionQuery::default())
            .unwrap();
        assert_eq!(url.as_str(), "https://k8s.local:6443/api/v1/pods");
    }

    #[test]
    fn test_cache_id_is_stable_and_filter_sensitive() {
        let pods = ResourceKind::of::<Pod>();
        let a = Filters::new().namespace("default").unwrap();
        let b = Filters::new().namespace("default").unwrap();
        let c = Filters::new().namespace("kube-system").unwrap();

        let id = a.cache_id(&pods).unwrap();
        assert_eq!(id.len(), 10);
        assert_eq!(id, b.cache_id(&pods).unwrap());
        assert_ne!(id, c.cache_id(&pods).unwrap());
        assert_ne!(id, a.clone().label("app", "web").unwrap().cache_id(&pods).unwrap());
        assert_ne!(id, a.cache_id(&ResourceKind::new("", "v1", "Secret")).unwrap());
    }
}
