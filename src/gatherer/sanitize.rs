/**
 * Redaction of gathered objects before they leave the gatherer
 *
 * Every object loses its managed fields. Kinds with sensitive payloads get
 * an extra pass looked up by API group and `kind`, so a custom resource
 * that happens to be called `Secret` is not mistaken for the core type.
 */
use k8s_openapi::serde_json::{Map, Value};
use std::collections::HashMap;

pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const CERTIFICATE_SUFFIX: &str = ".crt";

/// In-place redaction for one kind
pub type SanitizeFn = fn(&mut Value);

#[derive(Debug, Clone)]
pub struct Sanitizer {
    by_kind: HashMap<(String, String), SanitizeFn>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        let mut sanitizer = Self::empty();
        sanitizer.register("", "Secret", redact_secret);
        sanitizer
    }
}

impl Sanitizer {
    /// A sanitizer that only strips managed fields.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            by_kind: HashMap::new(),
        }
    }

    /// Add or replace the redaction applied to objects of `kind` in `group`.
    /// The core group is `""`.
    pub fn register(&mut self, group: impl Into<String>, kind: impl Into<String>, redact: SanitizeFn) -> &mut Self {
        self.by_kind.insert((group.into(), kind.into()), redact);
        self
    }

    #[must_use]
    pub fn sanitize(&self, object: &Value) -> Value {
        let mut object = object.clone();
        self.sanitize_in_place(&mut object);
        object
    }

    pub fn sanitize_in_place(&self, object: &mut Value) {
        strip_managed_fields(object);

        let redact = object
            .get("kind")
            .and_then(Value::as_str)
            .and_then(|kind| {
                let group = api_group(object)?;
                self.by_kind.get(&(group.to_string(), kind.to_string()))
            })
            .copied();
        if let Some(redact) = redact {
            redact(object);
        }
    }
}

/// Group part of `apiVersion`: `""` for `v1`, `apps` for `apps/v1`.
fn api_group(object: &Value) -> Option<&str> {
    let api_version = object.get("apiVersion").and_then(Value::as_str)?;
    Some(api_version.split_once('/').map_or("", |(group, _)| group))
}

pub fn strip_managed_fields(object: &mut Value) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
}

/// Drop secret material, keeping certificates of TLS secrets.
///
/// The annotations map is always left present, empty if nothing but the
/// last-applied configuration was in it.
pub fn redact_secret(secret: &mut Value) {
    let Some(secret) = secret.as_object_mut() else {
        return;
    };

    if let Some(metadata) = secret.get_mut("metadata").and_then(Value::as_object_mut) {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        match annotations.as_object_mut() {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
            }
            None => *annotations = Value::Object(Map::new()),
        }
    }

    secret.remove("stringData");

    let is_tls = secret.get("type").and_then(Value::as_str) == Some(TLS_SECRET_TYPE);
    let certificates: Map<String, Value> = match secret.remove("data") {
        Some(Value::Object(data)) if is_tls => data
            .into_iter()
            .filter(|(key, _)| key.ends_with(CERTIFICATE_SUFFIX))
            .collect(),
        _ => Map::new(),
    };
    if !certificates.is_empty() {
        secret.insert("data".to_string(), Value::Object(certificates));
    }
}
